// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::DetailSpace;
use crate::error::BridgeResult;
use crate::ledger::LedgerClient;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use url::Url;

/// Notary peers as `name -> endpoint`, written only through expansion.
pub struct PeerListProvider {
    ledger: Arc<dyn LedgerClient>,
    space: DetailSpace,
}

impl PeerListProvider {
    pub fn new(ledger: Arc<dyn LedgerClient>, space: DetailSpace) -> Self {
        Self { ledger, space }
    }

    pub fn space(&self) -> &DetailSpace {
        &self.space
    }

    /// Peers ordered by name. Entries with unparsable URLs are skipped.
    pub async fn peers(&self) -> BridgeResult<BTreeMap<String, Url>> {
        let details = self
            .ledger
            .account_details(&self.space.storage_account, &self.space.setter_account)
            .await?;
        Ok(details
            .into_iter()
            .filter_map(|(name, endpoint)| match Url::parse(&endpoint) {
                Ok(url) => Some((name, url)),
                Err(e) => {
                    warn!(
                        "[PeerList] Ignoring peer {} with invalid endpoint {:?}: {}",
                        name, endpoint, e
                    );
                    None
                }
            })
            .collect())
    }
}
