// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Boundary to the permissioned ledger.
//!
//! The bridge treats the ledger as an account-detail key/value store with
//! atomic multi-command transactions and an ordered block feed. Details are
//! namespaced per `(account, writer)`: only the account that wrote a value can
//! be queried for it.

use crate::error::BridgeResult;
use async_trait::async_trait;
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

pub mod memory;

pub use memory::InMemoryLedger;

/// Hex encoded, unprefixed ledger transaction hash.
pub type LedgerTxHash = String;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum LedgerCommand {
    TransferAsset {
        src_account_id: String,
        dest_account_id: String,
        asset_id: String,
        description: String,
        amount: String,
    },
    /// Credits the transaction creator.
    AddAssetQuantity { asset_id: String, amount: String },
    /// Debits the transaction creator.
    SubtractAssetQuantity { asset_id: String, amount: String },
    CreateAccount {
        account_name: String,
        domain_id: String,
        public_key: String,
    },
    CreateAsset {
        asset_name: String,
        domain_id: String,
        precision: u32,
    },
    SetAccountDetail {
        account_id: String,
        key: String,
        value: String,
    },
    CompareAndSetAccountDetail {
        account_id: String,
        key: String,
        value: String,
        old_value: Option<String>,
    },
    AddSignatory {
        account_id: String,
        public_key: String,
    },
    SetAccountQuorum { account_id: String, quorum: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub creator_account_id: String,
    pub created_time: u64,
    pub commands: Vec<LedgerCommand>,
}

impl LedgerTransaction {
    pub fn new(creator_account_id: impl Into<String>, created_time: u64) -> Self {
        Self {
            creator_account_id: creator_account_id.into(),
            created_time,
            commands: vec![],
        }
    }

    pub fn with_command(mut self, command: LedgerCommand) -> Self {
        self.commands.push(command);
        self
    }

    pub fn hash(&self) -> LedgerTxHash {
        // unwrap: plain owned data always serializes
        let bytes = serde_json::to_vec(self).unwrap();
        hex::encode(keccak256(bytes))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerBlock {
    pub height: u64,
    pub transactions: Vec<LedgerTransaction>,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Apply every command or none of them.
    async fn submit(&self, tx: LedgerTransaction) -> BridgeResult<LedgerTxHash>;

    async fn transaction(&self, hash: &str) -> BridgeResult<Option<LedgerTransaction>>;

    async fn account_details(
        &self,
        account_id: &str,
        writer: &str,
    ) -> BridgeResult<BTreeMap<String, String>>;

    async fn account_detail(
        &self,
        account_id: &str,
        writer: &str,
        key: &str,
    ) -> BridgeResult<Option<String>> {
        Ok(self.account_details(account_id, writer).await?.remove(key))
    }

    async fn account_exists(&self, account_id: &str) -> BridgeResult<bool>;

    async fn asset_precision(&self, asset_id: &str) -> BridgeResult<Option<u32>>;

    /// Decimal balance, "0" for an account that never held the asset.
    async fn balance(&self, account_id: &str, asset_id: &str) -> BridgeResult<String>;

    async fn signatories(&self, account_id: &str) -> BridgeResult<Vec<String>>;

    async fn quorum(&self, account_id: &str) -> BridgeResult<u32>;

    async fn block(&self, height: u64) -> BridgeResult<Option<LedgerBlock>>;

    async fn latest_height(&self) -> BridgeResult<u64>;

    fn subscribe_blocks(&self) -> broadcast::Receiver<LedgerBlock>;
}

/// Submits transactions on behalf of one creator account with strictly
/// increasing creation times, so two identical command lists never share a
/// hash.
pub struct LedgerSubmitter {
    client: Arc<dyn LedgerClient>,
    creator: String,
    last_time: AtomicU64,
}

impl LedgerSubmitter {
    pub fn new(client: Arc<dyn LedgerClient>, creator: impl Into<String>) -> Self {
        Self {
            client,
            creator: creator.into(),
            last_time: AtomicU64::new(0),
        }
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    pub fn client(&self) -> &Arc<dyn LedgerClient> {
        &self.client
    }

    pub async fn send(&self, commands: Vec<LedgerCommand>) -> BridgeResult<LedgerTxHash> {
        let tx = LedgerTransaction {
            creator_account_id: self.creator.clone(),
            created_time: self.next_time(),
            commands,
        };
        self.client.submit(tx).await
    }

    fn next_time(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let mut prev = self.last_time.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_time
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_hash_depends_on_content() {
        let tx = LedgerTransaction::new("alice@domain", 1).with_command(
            LedgerCommand::SetAccountDetail {
                account_id: "alice@domain".into(),
                key: "k".into(),
                value: "v".into(),
            },
        );
        assert_eq!(tx.hash(), tx.clone().hash());
        assert_eq!(tx.hash().len(), 64);

        let mut later = tx.clone();
        later.created_time = 2;
        assert_ne!(tx.hash(), later.hash());
    }

    #[tokio::test]
    async fn test_submitter_times_are_strictly_increasing() {
        let ledger = Arc::new(InMemoryLedger::new());
        let submitter = LedgerSubmitter::new(ledger, "notary@notary");
        let a = submitter.next_time();
        let b = submitter.next_time();
        assert!(b > a);
    }
}
