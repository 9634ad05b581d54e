// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Caches over ledger account-detail key spaces.
//!
//! Every registry reads one `(storage account, setter account)` detail map.
//! Entries are loaded eagerly and never evicted. `observe_block` picks up
//! details committed in new ledger blocks; a miss re-queries the ledger at
//! most once between two observed blocks.

use crate::ledger::{LedgerBlock, LedgerCommand};

pub mod address;
pub mod asset;
pub mod peers;

pub use address::AddressRegistry;
pub use asset::AssetRegistry;
pub use peers::PeerListProvider;

/// Key space of a detail map on the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetailSpace {
    pub storage_account: String,
    pub setter_account: String,
}

impl DetailSpace {
    pub fn new(storage_account: impl Into<String>, setter_account: impl Into<String>) -> Self {
        Self {
            storage_account: storage_account.into(),
            setter_account: setter_account.into(),
        }
    }

    /// `(key, value)` pairs this space received in `block`.
    pub fn writes_in<'a>(&'a self, block: &'a LedgerBlock) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        block
            .transactions
            .iter()
            .filter(move |tx| tx.creator_account_id == self.setter_account)
            .flat_map(|tx| tx.commands.iter())
            .filter_map(move |command| match command {
                LedgerCommand::SetAccountDetail {
                    account_id,
                    key,
                    value,
                }
                | LedgerCommand::CompareAndSetAccountDetail {
                    account_id,
                    key,
                    value,
                    ..
                } if *account_id == self.storage_account => Some((key.as_str(), value.as_str())),
                _ => None,
            })
    }
}
