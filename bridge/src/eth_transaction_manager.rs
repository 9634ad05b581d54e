// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Nonce sequencing for transactions sent from the notary's Chain-A key.
//!
//! Several transactions may be in flight at once, so nonces are handed out
//! locally instead of being re-read from the node for every send.

use crate::error::BridgeResult;
use crate::eth_client::ChainAClient;
use crate::metrics::NotaryMetrics;
use ethers::types::U256;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct NonceState {
    // next nonce to hand out, None until first read from the chain
    next: Option<U256>,
}

pub struct ChainATransactionManager {
    client: Arc<dyn ChainAClient>,
    state: Mutex<NonceState>,
    metrics: Arc<NotaryMetrics>,
}

impl ChainATransactionManager {
    pub fn new(client: Arc<dyn ChainAClient>, metrics: Arc<NotaryMetrics>) -> Self {
        Self {
            client,
            state: Mutex::new(NonceState::default()),
            metrics,
        }
    }

    pub fn client(&self) -> &Arc<dyn ChainAClient> {
        &self.client
    }

    /// Allocate the next nonce. The first call reads the account's pending
    /// nonce from the chain, every later call returns the previous one plus one.
    pub async fn next_nonce(&self) -> BridgeResult<U256> {
        let mut state = self.state.lock().await;
        let nonce = match state.next {
            Some(nonce) => nonce,
            None => {
                let nonce = self
                    .client
                    .transaction_count(self.client.signer_address())
                    .await?;
                info!("[NonceManager] Initial nonce read from chain: {}", nonce);
                nonce
            }
        };
        state.next = Some(nonce + 1);
        Ok(nonce)
    }

    /// Re-read the nonce from the chain. On failure the local counter is kept.
    pub async fn reset_nonce(&self) -> BridgeResult<()> {
        let mut state = self.state.lock().await;
        let nonce = self
            .client
            .transaction_count(self.client.signer_address())
            .await
            .map_err(|e| {
                warn!("[NonceManager] Failed to reset nonce, keeping {:?}: {:?}", state.next, e);
                e
            })?;
        info!("[NonceManager] Nonce reset from {:?} to {}", state.next, nonce);
        state.next = Some(nonce);
        self.metrics.nonce_resets.inc();
        Ok(())
    }

    /// Next call to `next_nonce` returns `nonce`.
    pub async fn set_nonce(&self, nonce: U256) {
        let mut state = self.state.lock().await;
        warn!("[NonceManager] Nonce overridden from {:?} to {}", state.next, nonce);
        state.next = Some(nonce);
    }
}
