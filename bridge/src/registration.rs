// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::config::LedgerAccountsConfig;
use crate::crypto::{address_to_hex, verify_registration_proof};
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::{LedgerBlock, LedgerCommand, LedgerSubmitter, LedgerTransaction, LedgerTxHash};
use crate::metrics::NotaryMetrics;
use crate::registry::AddressRegistry;
use crate::types::{EthereumRegistrationProof, FAILED_REGISTRATION_KEY, REGISTER_WALLET_KEY};
use ethers::types::Address as EthAddress;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered(EthAddress),
    Rejected(String),
}

/// Binds a client's Chain-A wallet to its ledger account once the client
/// proves it holds the wallet key.
pub struct WalletRegistrationHandler {
    trigger_account: String,
    wallet_storage: String,
    wallets: Arc<AddressRegistry>,
    // creator is the wallet registry setter
    submitter: Arc<LedgerSubmitter>,
    metrics: Arc<NotaryMetrics>,
}

impl WalletRegistrationHandler {
    pub fn new(
        accounts: &LedgerAccountsConfig,
        wallets: Arc<AddressRegistry>,
        submitter: Arc<LedgerSubmitter>,
        metrics: Arc<NotaryMetrics>,
    ) -> Self {
        Self {
            trigger_account: accounts.registration_trigger_account.clone(),
            wallet_storage: accounts.wallets.storage_account.clone(),
            wallets,
            submitter,
            metrics,
        }
    }

    /// Only a failure to record the outcome on the ledger is an error.
    pub async fn process_block(
        &self,
        block: &LedgerBlock,
    ) -> BridgeResult<Vec<(LedgerTxHash, RegistrationOutcome)>> {
        let mut outcomes = vec![];
        for tx in &block.transactions {
            let Some(proof) = self.request_in(tx) else {
                continue;
            };
            let hash = tx.hash();
            let client = tx.creator_account_id.as_str();
            info!("[WalletRegistration] Registration {} from {}", hash, client);
            let outcome = match self.register(client, proof).await {
                Ok(address) => RegistrationOutcome::Registered(address),
                Err(e) => {
                    self.reject(&hash, client, &e).await?;
                    RegistrationOutcome::Rejected(e.reason())
                }
            };
            outcomes.push((hash, outcome));
        }
        Ok(outcomes)
    }

    fn request_in<'a>(&self, tx: &'a LedgerTransaction) -> Option<&'a str> {
        tx.commands.iter().find_map(|command| match command {
            LedgerCommand::SetAccountDetail {
                account_id,
                key,
                value,
            } if *account_id == self.trigger_account && key == REGISTER_WALLET_KEY => {
                Some(value.as_str())
            }
            _ => None,
        })
    }

    async fn register(&self, client: &str, proof: &str) -> BridgeResult<EthAddress> {
        let proof: EthereumRegistrationProof = serde_json::from_str(proof)
            .map_err(|e| BridgeError::InvalidRegistrationProof(format!("malformed proof: {}", e)))?;
        let address = verify_registration_proof(&proof.public_key, &proof.signature)?;
        if let Some(owner) = self.wallets.resolve(&address).await? {
            return Err(BridgeError::InvalidRegistrationProof(format!(
                "{:?} is already registered to {}",
                address, owner
            )));
        }
        self.submitter
            .send(vec![LedgerCommand::SetAccountDetail {
                account_id: self.wallet_storage.clone(),
                key: address_to_hex(&address),
                value: client.to_string(),
            }])
            .await?;
        self.wallets.register(address, client).await;
        self.metrics
            .registration_outcomes
            .with_label_values(&["registered"])
            .inc();
        info!("[WalletRegistration] Registered {:?} to {}", address, client);
        Ok(address)
    }

    async fn reject(&self, hash: &str, client: &str, reason: &BridgeError) -> BridgeResult<()> {
        warn!(
            "[WalletRegistration] Registration {} from {} rejected: {:?}",
            hash, client, reason
        );
        self.metrics
            .registration_outcomes
            .with_label_values(&["rejected"])
            .inc();
        self.metrics.observe_error(reason);
        self.submitter
            .send(vec![LedgerCommand::SetAccountDetail {
                account_id: client.to_string(),
                key: FAILED_REGISTRATION_KEY.to_string(),
                value: format!("registration {}, reason {}", hash, reason.reason()),
            }])
            .await
            .map(|_| ())
            .map_err(|e| {
                error!(
                    "[WalletRegistration] Could not record failed registration {}: {:?}",
                    hash, e
                );
                e
            })
    }
}
