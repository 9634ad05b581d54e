// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process ledger with the same observable contract as the networked one:
//! atomic transactions, one block per accepted transaction, per-writer account
//! details, signatories and quorum.

use super::{LedgerBlock, LedgerClient, LedgerCommand, LedgerTransaction, LedgerTxHash};
use crate::error::{BridgeError, BridgeResult};
use crate::utils::{render_decimal, scale_decimal};
use async_trait::async_trait;
use ethers::types::U256;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const BLOCK_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug, Default)]
struct Account {
    signatories: Vec<String>,
    quorum: u32,
    // writer -> key -> value
    details: BTreeMap<String, BTreeMap<String, String>>,
    balances: HashMap<String, U256>,
}

#[derive(Clone, Debug, Default)]
struct State {
    accounts: HashMap<String, Account>,
    assets: HashMap<String, u32>,
    transactions: HashMap<LedgerTxHash, LedgerTransaction>,
    blocks: Vec<LedgerBlock>,
}

pub struct InMemoryLedger {
    state: RwLock<State>,
    blocks_tx: broadcast::Sender<LedgerBlock>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        let (blocks_tx, _) = broadcast::channel(BLOCK_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            blocks_tx,
        }
    }

    fn read(&self) -> BridgeResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| BridgeError::InternalError("ledger state lock poisoned".into()))
    }

    fn write(&self) -> BridgeResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| BridgeError::InternalError("ledger state lock poisoned".into()))
    }

    // Genesis helpers: mutate state directly, no block is produced.

    pub fn add_account(
        &self,
        account_id: &str,
        signatories: Vec<String>,
        quorum: u32,
    ) -> BridgeResult<()> {
        let mut state = self.write()?;
        state.accounts.entry(account_id.to_string()).or_insert(Account {
            signatories,
            quorum,
            ..Default::default()
        });
        Ok(())
    }

    pub fn add_asset(&self, asset_id: &str, precision: u32) -> BridgeResult<()> {
        self.write()?.assets.insert(asset_id.to_string(), precision);
        Ok(())
    }

    pub fn add_balance(&self, account_id: &str, asset_id: &str, amount: &str) -> BridgeResult<()> {
        let mut state = self.write()?;
        let raw = scaled(&state, asset_id, amount)?;
        let account = account_mut(&mut state, account_id)?;
        let balance = account.balances.entry(asset_id.to_string()).or_default();
        *balance = balance.saturating_add(raw);
        Ok(())
    }

    pub fn put_detail(
        &self,
        account_id: &str,
        writer: &str,
        key: &str,
        value: &str,
    ) -> BridgeResult<()> {
        let mut state = self.write()?;
        account_mut(&mut state, account_id)?
            .details
            .entry(writer.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

fn account_mut<'a>(state: &'a mut State, account_id: &str) -> BridgeResult<&'a mut Account> {
    state
        .accounts
        .get_mut(account_id)
        .ok_or_else(|| BridgeError::LedgerError(format!("account {} does not exist", account_id)))
}

fn scaled(state: &State, asset_id: &str, amount: &str) -> BridgeResult<U256> {
    let precision = state
        .assets
        .get(asset_id)
        .ok_or_else(|| BridgeError::LedgerError(format!("asset {} does not exist", asset_id)))?;
    let raw = scale_decimal(amount, *precision)
        .map_err(|e| BridgeError::LedgerError(format!("bad amount for {}: {}", asset_id, e)))?;
    if raw.is_zero() {
        return Err(BridgeError::LedgerError(format!(
            "zero amount of {}",
            asset_id
        )));
    }
    Ok(raw)
}

fn debit(state: &mut State, account_id: &str, asset_id: &str, raw: U256) -> BridgeResult<()> {
    let account = account_mut(state, account_id)?;
    let balance = account.balances.entry(asset_id.to_string()).or_default();
    if *balance < raw {
        return Err(BridgeError::LedgerError(format!(
            "insufficient {} balance on {}",
            asset_id, account_id
        )));
    }
    *balance -= raw;
    Ok(())
}

fn credit(state: &mut State, account_id: &str, asset_id: &str, raw: U256) -> BridgeResult<()> {
    let account = account_mut(state, account_id)?;
    let balance = account.balances.entry(asset_id.to_string()).or_default();
    *balance = balance
        .checked_add(raw)
        .ok_or_else(|| BridgeError::LedgerError("balance overflow".into()))?;
    Ok(())
}

fn apply(state: &mut State, creator: &str, command: &LedgerCommand) -> BridgeResult<()> {
    match command {
        LedgerCommand::TransferAsset {
            src_account_id,
            dest_account_id,
            asset_id,
            amount,
            ..
        } => {
            let raw = scaled(state, asset_id, amount)?;
            account_mut(state, dest_account_id)?;
            debit(state, src_account_id, asset_id, raw)?;
            credit(state, dest_account_id, asset_id, raw)
        }
        LedgerCommand::AddAssetQuantity { asset_id, amount } => {
            let raw = scaled(state, asset_id, amount)?;
            credit(state, creator, asset_id, raw)
        }
        LedgerCommand::SubtractAssetQuantity { asset_id, amount } => {
            let raw = scaled(state, asset_id, amount)?;
            debit(state, creator, asset_id, raw)
        }
        LedgerCommand::CreateAccount {
            account_name,
            domain_id,
            public_key,
        } => {
            let account_id = format!("{}@{}", account_name, domain_id);
            if state.accounts.contains_key(&account_id) {
                return Err(BridgeError::LedgerError(format!(
                    "account {} already exists",
                    account_id
                )));
            }
            state.accounts.insert(
                account_id,
                Account {
                    signatories: vec![public_key.clone()],
                    quorum: 1,
                    ..Default::default()
                },
            );
            Ok(())
        }
        LedgerCommand::CreateAsset {
            asset_name,
            domain_id,
            precision,
        } => {
            let asset_id = format!("{}#{}", asset_name, domain_id);
            if state.assets.contains_key(&asset_id) {
                return Err(BridgeError::LedgerError(format!(
                    "asset {} already exists",
                    asset_id
                )));
            }
            state.assets.insert(asset_id, *precision);
            Ok(())
        }
        LedgerCommand::SetAccountDetail {
            account_id,
            key,
            value,
        } => {
            account_mut(state, account_id)?
                .details
                .entry(creator.to_string())
                .or_default()
                .insert(key.clone(), value.clone());
            Ok(())
        }
        LedgerCommand::CompareAndSetAccountDetail {
            account_id,
            key,
            value,
            old_value,
        } => {
            let details = account_mut(state, account_id)?
                .details
                .entry(creator.to_string())
                .or_default();
            if details.get(key) != old_value.as_ref() {
                return Err(BridgeError::LedgerError(format!(
                    "compare-and-set of {} on {} failed: expected {:?}, found {:?}",
                    key,
                    account_id,
                    old_value,
                    details.get(key)
                )));
            }
            details.insert(key.clone(), value.clone());
            Ok(())
        }
        LedgerCommand::AddSignatory {
            account_id,
            public_key,
        } => {
            let account = account_mut(state, account_id)?;
            if account.signatories.contains(public_key) {
                return Err(BridgeError::LedgerError(format!(
                    "signatory already present on {}",
                    account_id
                )));
            }
            account.signatories.push(public_key.clone());
            Ok(())
        }
        LedgerCommand::SetAccountQuorum { account_id, quorum } => {
            let account = account_mut(state, account_id)?;
            if *quorum == 0 || *quorum as usize > account.signatories.len() {
                return Err(BridgeError::LedgerError(format!(
                    "quorum {} invalid for {} signatories",
                    quorum,
                    account.signatories.len()
                )));
            }
            account.quorum = *quorum;
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn submit(&self, tx: LedgerTransaction) -> BridgeResult<LedgerTxHash> {
        let hash = tx.hash();
        let block = {
            let mut state = self.write()?;
            if state.transactions.contains_key(&hash) {
                return Err(BridgeError::LedgerError(format!(
                    "transaction {} already committed",
                    hash
                )));
            }
            if !state.accounts.contains_key(&tx.creator_account_id) {
                return Err(BridgeError::LedgerError(format!(
                    "creator {} does not exist",
                    tx.creator_account_id
                )));
            }
            // work on a copy so a failing command leaves no trace
            let mut next = State {
                accounts: state.accounts.clone(),
                assets: state.assets.clone(),
                ..Default::default()
            };
            for command in &tx.commands {
                if let Err(e) = apply(&mut next, &tx.creator_account_id, command) {
                    warn!("[Ledger] Rejected tx {}: {:?}", hash, e);
                    return Err(e);
                }
            }
            state.accounts = next.accounts;
            state.assets = next.assets;
            state.transactions.insert(hash.clone(), tx.clone());
            let block = LedgerBlock {
                height: state.blocks.len() as u64 + 1,
                transactions: vec![tx],
            };
            state.blocks.push(block.clone());
            block
        };
        debug!("[Ledger] Committed tx {} in block {}", hash, block.height);
        // no subscribers is fine
        let _ = self.blocks_tx.send(block);
        Ok(hash)
    }

    async fn transaction(&self, hash: &str) -> BridgeResult<Option<LedgerTransaction>> {
        let key = hash.trim_start_matches("0x").to_lowercase();
        Ok(self.read()?.transactions.get(&key).cloned())
    }

    async fn account_details(
        &self,
        account_id: &str,
        writer: &str,
    ) -> BridgeResult<BTreeMap<String, String>> {
        Ok(self
            .read()?
            .accounts
            .get(account_id)
            .and_then(|a| a.details.get(writer).cloned())
            .unwrap_or_default())
    }

    async fn account_exists(&self, account_id: &str) -> BridgeResult<bool> {
        Ok(self.read()?.accounts.contains_key(account_id))
    }

    async fn asset_precision(&self, asset_id: &str) -> BridgeResult<Option<u32>> {
        Ok(self.read()?.assets.get(asset_id).copied())
    }

    async fn balance(&self, account_id: &str, asset_id: &str) -> BridgeResult<String> {
        let state = self.read()?;
        let precision = state.assets.get(asset_id).copied().unwrap_or_default();
        let raw = state
            .accounts
            .get(account_id)
            .and_then(|a| a.balances.get(asset_id).copied())
            .unwrap_or_default();
        render_decimal(raw, precision)
    }

    async fn signatories(&self, account_id: &str) -> BridgeResult<Vec<String>> {
        self.read()?
            .accounts
            .get(account_id)
            .map(|a| a.signatories.clone())
            .ok_or_else(|| BridgeError::LedgerError(format!("account {} does not exist", account_id)))
    }

    async fn quorum(&self, account_id: &str) -> BridgeResult<u32> {
        self.read()?
            .accounts
            .get(account_id)
            .map(|a| a.quorum)
            .ok_or_else(|| BridgeError::LedgerError(format!("account {} does not exist", account_id)))
    }

    async fn block(&self, height: u64) -> BridgeResult<Option<LedgerBlock>> {
        if height == 0 {
            return Ok(None);
        }
        Ok(self.read()?.blocks.get(height as usize - 1).cloned())
    }

    async fn latest_height(&self) -> BridgeResult<u64> {
        Ok(self.read()?.blocks.len() as u64)
    }

    fn subscribe_blocks(&self) -> broadcast::Receiver<LedgerBlock> {
        self.blocks_tx.subscribe()
    }
}
