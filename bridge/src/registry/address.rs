// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::DetailSpace;
use crate::crypto::{address_to_hex, parse_eth_address};
use crate::error::BridgeResult;
use crate::ledger::{LedgerBlock, LedgerClient};
use ethers::types::Address as EthAddress;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Placeholder value for relay contracts deployed but not yet handed out.
const FREE_RELAY: &str = "free";

#[derive(Default)]
struct Maps {
    forward: HashMap<EthAddress, String>,
    reverse: HashMap<String, EthAddress>,
    // lookups the ledger answered with nothing since the last observed block
    missing: HashSet<EthAddress>,
    missing_accounts: HashSet<String>,
}

impl Maps {
    fn insert(&mut self, address: EthAddress, account_id: String) {
        self.missing.remove(&address);
        self.missing_accounts.remove(&account_id);
        self.reverse.insert(account_id.clone(), address);
        self.forward.insert(address, account_id);
    }
}

/// Chain-A address to ledger account mapping (wallets or relays).
pub struct AddressRegistry {
    name: &'static str,
    ledger: Arc<dyn LedgerClient>,
    space: DetailSpace,
    maps: RwLock<Maps>,
}

impl AddressRegistry {
    pub fn new(name: &'static str, ledger: Arc<dyn LedgerClient>, space: DetailSpace) -> Self {
        Self {
            name,
            ledger,
            space,
            maps: RwLock::new(Maps::default()),
        }
    }

    /// Read the whole detail map; returns the number of known addresses.
    pub async fn load(&self) -> BridgeResult<usize> {
        let details = self
            .ledger
            .account_details(&self.space.storage_account, &self.space.setter_account)
            .await?;
        let mut maps = self.maps.write().await;
        for (key, value) in details {
            if let Some(address) = self.parse_entry(&key, &value) {
                maps.insert(address, value);
            }
        }
        debug!("[{}] Loaded {} addresses", self.name, maps.forward.len());
        Ok(maps.forward.len())
    }

    /// `None` means the address is not bridge controlled. A miss is asked of
    /// the ledger once per observed block.
    pub async fn resolve(&self, address: &EthAddress) -> BridgeResult<Option<String>> {
        {
            let maps = self.maps.read().await;
            if let Some(account) = maps.forward.get(address) {
                return Ok(Some(account.clone()));
            }
            if maps.missing.contains(address) {
                return Ok(None);
            }
        }
        let value = self
            .ledger
            .account_detail(
                &self.space.storage_account,
                &self.space.setter_account,
                &address_to_hex(address),
            )
            .await?;
        match value {
            Some(account) if account != FREE_RELAY => {
                self.maps.write().await.insert(*address, account.clone());
                Ok(Some(account))
            }
            _ => {
                self.maps.write().await.missing.insert(*address);
                Ok(None)
            }
        }
    }

    pub async fn resolve_reverse(&self, account_id: &str) -> BridgeResult<Option<EthAddress>> {
        {
            let maps = self.maps.read().await;
            if let Some(address) = maps.reverse.get(account_id) {
                return Ok(Some(*address));
            }
            if maps.missing_accounts.contains(account_id) {
                return Ok(None);
            }
        }
        self.load().await?;
        let mut maps = self.maps.write().await;
        let found = maps.reverse.get(account_id).copied();
        if found.is_none() {
            maps.missing_accounts.insert(account_id.to_string());
        }
        Ok(found)
    }

    /// Optimistic local insert ahead of the ledger confirming the mapping.
    pub async fn register(&self, address: EthAddress, account_id: &str) {
        self.maps.write().await.insert(address, account_id.to_string());
    }

    pub async fn observe_block(&self, block: &LedgerBlock) {
        let mut maps = self.maps.write().await;
        maps.missing.clear();
        maps.missing_accounts.clear();
        for (key, value) in self.space.writes_in(block) {
            if let Some(address) = self.parse_entry(key, value) {
                debug!("[{}] Observed {:?} -> {}", self.name, address, value);
                maps.insert(address, value.to_string());
            }
        }
    }

    fn parse_entry(&self, key: &str, value: &str) -> Option<EthAddress> {
        if value == FREE_RELAY {
            return None;
        }
        match parse_eth_address(key) {
            Ok(address) => Some(address),
            Err(_) => {
                warn!("[{}] Skipping malformed address key {:?}", self.name, key);
                None
            }
        }
    }
}
