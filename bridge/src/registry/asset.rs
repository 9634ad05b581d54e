// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::DetailSpace;
use crate::crypto::parse_eth_address;
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::{LedgerBlock, LedgerClient};
use crate::types::{AnchorOrigin, AssetRecord, ETH_ADDRESS, ETH_ASSET_ID, ETH_PRECISION};
use ethers::types::Address as EthAddress;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Default)]
struct Tables {
    // token contract -> asset id
    chain_a_anchored: HashMap<EthAddress, String>,
    ledger_anchored: HashMap<EthAddress, String>,
    precisions: HashMap<String, u32>,
    // misses since the last observed block, answered without a reload
    missing_contracts: HashSet<EthAddress>,
    missing_assets: HashSet<String>,
}

impl Tables {
    fn find(&self, asset_id: &str) -> Option<(EthAddress, AnchorOrigin)> {
        let lookup = |table: &HashMap<EthAddress, String>| {
            table
                .iter()
                .find(|(_, id)| id.as_str() == asset_id)
                .map(|(address, _)| *address)
        };
        lookup(&self.chain_a_anchored)
            .map(|a| (a, AnchorOrigin::ChainA))
            .or_else(|| lookup(&self.ledger_anchored).map(|a| (a, AnchorOrigin::Ledger)))
    }

    fn by_contract(&self, address: &EthAddress) -> Option<(String, AnchorOrigin)> {
        self.chain_a_anchored
            .get(address)
            .map(|id| (id.clone(), AnchorOrigin::ChainA))
            .or_else(|| {
                self.ledger_anchored
                    .get(address)
                    .map(|id| (id.clone(), AnchorOrigin::Ledger))
            })
    }
}

/// Token contract registry for both anchor origins. The native coin is a fixed
/// entry and never consults the ledger.
pub struct AssetRegistry {
    ledger: Arc<dyn LedgerClient>,
    chain_a_space: DetailSpace,
    ledger_space: DetailSpace,
    tables: RwLock<Tables>,
}

impl AssetRegistry {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        chain_a_space: DetailSpace,
        ledger_space: DetailSpace,
    ) -> Self {
        Self {
            ledger,
            chain_a_space,
            ledger_space,
            tables: RwLock::new(Tables::default()),
        }
    }

    pub async fn load(&self) -> BridgeResult<usize> {
        let chain_a = self.read_space(&self.chain_a_space).await?;
        let ledger = self.read_space(&self.ledger_space).await?;
        let mut tables = self.tables.write().await;
        tables.chain_a_anchored.extend(chain_a);
        tables.ledger_anchored.extend(ledger);
        let total = tables.chain_a_anchored.len() + tables.ledger_anchored.len();
        debug!("[AssetRegistry] Loaded {} token contracts", total);
        Ok(total)
    }

    async fn read_space(&self, space: &DetailSpace) -> BridgeResult<HashMap<EthAddress, String>> {
        let details = self
            .ledger
            .account_details(&space.storage_account, &space.setter_account)
            .await?;
        Ok(details
            .into_iter()
            .filter_map(|(key, asset_id)| match parse_eth_address(&key) {
                Ok(address) => Some((address, asset_id)),
                Err(_) => {
                    warn!("[AssetRegistry] Skipping malformed token key {:?}", key);
                    None
                }
            })
            .collect())
    }

    /// Token registered at `contract`, if any.
    pub async fn asset_by_contract(&self, contract: &EthAddress) -> BridgeResult<Option<AssetRecord>> {
        let (found, missing) = {
            let tables = self.tables.read().await;
            (
                tables.by_contract(contract),
                tables.missing_contracts.contains(contract),
            )
        };
        let found = match found {
            Some(found) => Some(found),
            None if missing => None,
            None => {
                self.load().await?;
                let mut tables = self.tables.write().await;
                let found = tables.by_contract(contract);
                if found.is_none() {
                    tables.missing_contracts.insert(*contract);
                }
                found
            }
        };
        match found {
            Some((asset_id, anchor_origin)) => Ok(Some(AssetRecord {
                precision: self.precision_of(&asset_id).await?,
                asset_id,
                contract_address: *contract,
                anchor_origin,
            })),
            None => Ok(None),
        }
    }

    pub async fn record_of(&self, asset_id: &str) -> BridgeResult<AssetRecord> {
        if asset_id == ETH_ASSET_ID {
            return Ok(AssetRecord {
                asset_id: ETH_ASSET_ID.to_string(),
                contract_address: ETH_ADDRESS,
                precision: ETH_PRECISION,
                anchor_origin: AnchorOrigin::ChainA,
            });
        }
        let (contract_address, anchor_origin) = self.locate(asset_id).await?;
        Ok(AssetRecord {
            asset_id: asset_id.to_string(),
            contract_address,
            precision: self.precision_of(asset_id).await?,
            anchor_origin,
        })
    }

    pub async fn precision_of(&self, asset_id: &str) -> BridgeResult<u32> {
        if asset_id == ETH_ASSET_ID {
            return Ok(ETH_PRECISION);
        }
        if let Some(precision) = self.tables.read().await.precisions.get(asset_id) {
            return Ok(*precision);
        }
        self.locate(asset_id).await?;
        let precision = self
            .ledger
            .asset_precision(asset_id)
            .await?
            .ok_or_else(|| {
                BridgeError::LedgerError(format!("asset {} has no ledger precision", asset_id))
            })?;
        self.tables
            .write()
            .await
            .precisions
            .insert(asset_id.to_string(), precision);
        Ok(precision)
    }

    pub async fn contract_address_of(&self, asset_id: &str) -> BridgeResult<EthAddress> {
        if asset_id == ETH_ASSET_ID {
            return Ok(ETH_ADDRESS);
        }
        Ok(self.locate(asset_id).await?.0)
    }

    pub async fn anchor_origin_of(&self, asset_id: &str) -> BridgeResult<AnchorOrigin> {
        if asset_id == ETH_ASSET_ID {
            return Ok(AnchorOrigin::ChainA);
        }
        Ok(self.locate(asset_id).await?.1)
    }

    pub async fn is_chain_a_token(&self, asset_id: &str) -> BridgeResult<bool> {
        match self.anchor_origin_of(asset_id).await {
            Ok(_) => Ok(true),
            Err(BridgeError::AssetNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn observe_block(&self, block: &LedgerBlock) {
        let mut tables = self.tables.write().await;
        tables.missing_contracts.clear();
        tables.missing_assets.clear();
        for (space, origin) in [
            (&self.chain_a_space, AnchorOrigin::ChainA),
            (&self.ledger_space, AnchorOrigin::Ledger),
        ] {
            for (key, asset_id) in space.writes_in(block) {
                let Ok(address) = parse_eth_address(key) else {
                    continue;
                };
                debug!("[AssetRegistry] Observed {:?} token {} at {:?}", origin, asset_id, address);
                match origin {
                    AnchorOrigin::ChainA => tables.chain_a_anchored.insert(address, asset_id.to_string()),
                    AnchorOrigin::Ledger => tables.ledger_anchored.insert(address, asset_id.to_string()),
                };
            }
        }
    }

    async fn locate(&self, asset_id: &str) -> BridgeResult<(EthAddress, AnchorOrigin)> {
        {
            let tables = self.tables.read().await;
            if let Some(found) = tables.find(asset_id) {
                return Ok(found);
            }
            if tables.missing_assets.contains(asset_id) {
                return Err(BridgeError::AssetNotFound(asset_id.to_string()));
            }
        }
        self.load().await?;
        let mut tables = self.tables.write().await;
        match tables.find(asset_id) {
            Some(found) => Ok(found),
            None => {
                tables.missing_assets.insert(asset_id.to_string());
                Err(BridgeError::AssetNotFound(asset_id.to_string()))
            }
        }
    }
}
