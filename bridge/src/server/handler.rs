// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::type_complexity)]

use crate::config::LedgerAccountsConfig;
use crate::crypto::{hash_add_peer, hash_registration, sign};
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::{LedgerClient, LedgerCommand, LedgerTransaction};
use crate::metrics::NotaryMetrics;
use crate::types::{EthNotaryResponse, ExpansionDetails, ETH_ADDRESS_KEY};
use crate::withdrawal::WithdrawalAttestor;
use async_trait::async_trait;
use axum::Json;
use ethers::signers::LocalWallet;
use ethers::types::H256;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info, warn};

const SIGNER_CACHE_SIZE: usize = 1000;
const SIGNING_QUEUE_SIZE: usize = 1000;

type SigningRequest = (String, oneshot::Sender<BridgeResult<String>>);

#[async_trait]
pub trait NotaryRequestHandlerTrait {
    // Handles a request for this notary's signature over the withdrawal
    // attestation of the ledger transaction `tx_hash`.
    async fn handle_withdrawal_proof(
        &self,
        tx_hash: String,
    ) -> Result<Json<EthNotaryResponse>, BridgeError>;
    // Handles a request for the add-peer attestation of the expansion trigger
    // transaction `tx_hash`.
    async fn handle_add_peer_proof(
        &self,
        tx_hash: String,
    ) -> Result<Json<EthNotaryResponse>, BridgeError>;
    // Handles a request proving the wallet address a client claimed in the
    // ledger transaction `tx_hash`.
    async fn handle_registration_proof(
        &self,
        tx_hash: String,
    ) -> Result<Json<EthNotaryResponse>, BridgeError>;
}

/// Recomputes an attestation hash from this node's own view of the ledger.
#[async_trait]
pub trait AttestationVerifier: Send + Sync {
    // Name of the verifier, used for metrics
    fn name(&self) -> &'static str;
    async fn attest(&self, tx_hash: &str) -> BridgeResult<H256>;
}

struct WithdrawalVerifier {
    attestor: Arc<WithdrawalAttestor>,
}

struct AddPeerVerifier {
    ledger: Arc<dyn LedgerClient>,
    trigger_account: String,
    trigger_creator: String,
}

struct RegistrationVerifier {
    ledger: Arc<dyn LedgerClient>,
}

async fn load_transaction(
    ledger: &dyn LedgerClient,
    tx_hash: &str,
) -> BridgeResult<LedgerTransaction> {
    ledger
        .transaction(tx_hash)
        .await?
        .ok_or_else(|| BridgeError::LedgerTxNotFound(tx_hash.to_string()))
}

#[async_trait]
impl AttestationVerifier for WithdrawalVerifier {
    fn name(&self) -> &'static str {
        "WithdrawalVerifier"
    }

    async fn attest(&self, tx_hash: &str) -> BridgeResult<H256> {
        let request = self.attestor.request_for(tx_hash).await?;
        Ok(self.attestor.attest(&request).await?.hash)
    }
}

#[async_trait]
impl AttestationVerifier for AddPeerVerifier {
    fn name(&self) -> &'static str {
        "AddPeerVerifier"
    }

    async fn attest(&self, tx_hash: &str) -> BridgeResult<H256> {
        let tx = load_transaction(self.ledger.as_ref(), tx_hash).await?;
        let details = expansion_details(&tx, &self.trigger_account, &self.trigger_creator)?;
        let peer = details.eth_address().ok_or_else(|| {
            BridgeError::InvalidLedgerTransaction(format!("{} names no {}", tx_hash, ETH_ADDRESS_KEY))
        })?;
        hash_add_peer(peer, tx_hash)
    }
}

#[async_trait]
impl AttestationVerifier for RegistrationVerifier {
    fn name(&self) -> &'static str {
        "RegistrationVerifier"
    }

    async fn attest(&self, tx_hash: &str) -> BridgeResult<H256> {
        let tx = load_transaction(self.ledger.as_ref(), tx_hash).await?;
        let (account_id, key, address) = tx
            .commands
            .iter()
            .find_map(|command| match command {
                LedgerCommand::SetAccountDetail {
                    account_id,
                    key,
                    value,
                } => Some((account_id, key, value)),
                _ => None,
            })
            .ok_or_else(|| {
                BridgeError::InvalidLedgerTransaction(format!("{} sets no detail", tx_hash))
            })?;
        if key != ETH_ADDRESS_KEY {
            return Err(BridgeError::InvalidLedgerTransaction(format!(
                "{} sets {} instead of {}",
                tx_hash, key, ETH_ADDRESS_KEY
            )));
        }
        if *account_id != tx.creator_account_id {
            return Err(BridgeError::InvalidLedgerTransaction(format!(
                "{} was created by {} but writes to {}",
                tx_hash, tx.creator_account_id, account_id
            )));
        }
        hash_registration(address, account_id, tx_hash)
    }
}

/// The expansion payload of `tx`, which must come from `trigger_creator` and
/// write to `trigger_account`.
pub fn expansion_details(
    tx: &LedgerTransaction,
    trigger_account: &str,
    trigger_creator: &str,
) -> BridgeResult<ExpansionDetails> {
    if tx.creator_account_id != trigger_creator {
        return Err(BridgeError::InvalidLedgerTransaction(format!(
            "expansion must be created by {}, not {}",
            trigger_creator, tx.creator_account_id
        )));
    }
    let value = tx
        .commands
        .iter()
        .find_map(|command| match command {
            LedgerCommand::SetAccountDetail {
                account_id, value, ..
            } if account_id == trigger_account => Some(value),
            _ => None,
        })
        .ok_or_else(|| {
            BridgeError::InvalidLedgerTransaction(format!("no detail set on {}", trigger_account))
        })?;
    serde_json::from_str(value).map_err(|e| BridgeError::BridgeSerializationError(e.to_string()))
}

/// Lowercase, unprefixed 32 byte hex hash.
pub fn normalize_tx_hash(tx_hash: &str) -> BridgeResult<String> {
    let hash = tx_hash.trim_start_matches("0x").to_lowercase();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BridgeError::InvalidTxHash);
    }
    Ok(hash)
}

struct SignerWithCache {
    signer: Arc<LocalWallet>,
    verifier: Arc<dyn AttestationVerifier>,
    mutex: Arc<Mutex<()>>,
    cache: LruCache<String, Arc<Mutex<Option<String>>>>,
    metrics: Arc<NotaryMetrics>,
}

impl SignerWithCache {
    fn new(
        signer: Arc<LocalWallet>,
        verifier: impl AttestationVerifier + 'static,
        metrics: Arc<NotaryMetrics>,
    ) -> Self {
        Self {
            signer,
            verifier: Arc::new(verifier),
            mutex: Arc::new(Mutex::new(())),
            // unwrap: non-zero constant
            cache: LruCache::new(NonZeroUsize::new(SIGNER_CACHE_SIZE).unwrap()),
            metrics,
        }
    }

    fn spawn(mut self, mut rx: mpsc::Receiver<SigningRequest>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((key, tx)) = rx.recv().await {
                let result = self.sign(key).await;
                // The receiver may be dropped before the sender (client connection was dropped for example),
                // we ignore the error in that case.
                let _ = tx.send(result);
            }
            info!("[Signer] {} signing queue closed", self.verifier.name());
        })
    }

    async fn get_cache_entry(&mut self, key: String) -> Arc<Mutex<Option<String>>> {
        // This mutex exists to make sure everyone gets the same entry, namely no double insert
        let _guard = self.mutex.lock().await;
        self.cache
            .get_or_insert(key, || Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn sign(&mut self, key: String) -> BridgeResult<String> {
        let verifier = self.verifier.clone();
        let verifier_name = verifier.name();
        let entry = self.get_cache_entry(key.clone()).await;
        let mut guard = entry.lock().await;
        if let Some(signature) = &*guard {
            self.metrics
                .signer_with_cache_hit
                .with_label_values(&[verifier_name])
                .inc();
            return Ok(signature.clone());
        }
        self.metrics
            .signer_with_cache_miss
            .with_label_values(&[verifier_name])
            .inc();
        match verifier.attest(&key).await {
            Ok(attestation) => {
                let signature = sign(&self.signer, attestation)?;
                info!(
                    "[Signer] Signed {} attestation {:?} for {}",
                    verifier_name, attestation, key
                );
                *guard = Some(signature.clone());
                Ok(signature)
            }
            Err(e) => {
                // the ledger may still catch up, failures are retried on the next request
                warn!(
                    "[Signer] {} could not attest {}: {:?}",
                    verifier_name, key, e
                );
                Err(e)
            }
        }
    }

    #[cfg(test)]
    async fn get_testing_only(&mut self, key: &str) -> Option<&Arc<Mutex<Option<String>>>> {
        let _guard = self.mutex.lock().await;
        self.cache.get(key)
    }
}

pub struct NotaryRequestHandler {
    withdrawal_signer_tx: mpsc::Sender<SigningRequest>,
    add_peer_signer_tx: mpsc::Sender<SigningRequest>,
    registration_signer_tx: mpsc::Sender<SigningRequest>,
}

impl NotaryRequestHandler {
    pub fn new(
        signer: LocalWallet,
        ledger: Arc<dyn LedgerClient>,
        attestor: Arc<WithdrawalAttestor>,
        accounts: &LedgerAccountsConfig,
        metrics: Arc<NotaryMetrics>,
    ) -> Self {
        let (withdrawal_signer_tx, withdrawal_rx) = mpsc::channel(SIGNING_QUEUE_SIZE);
        let (add_peer_signer_tx, add_peer_rx) = mpsc::channel(SIGNING_QUEUE_SIZE);
        let (registration_signer_tx, registration_rx) = mpsc::channel(SIGNING_QUEUE_SIZE);
        let signer = Arc::new(signer);

        SignerWithCache::new(
            signer.clone(),
            WithdrawalVerifier { attestor },
            metrics.clone(),
        )
        .spawn(withdrawal_rx);
        SignerWithCache::new(
            signer.clone(),
            AddPeerVerifier {
                ledger: ledger.clone(),
                trigger_account: accounts.expansion_trigger_account.clone(),
                trigger_creator: accounts.expansion_trigger_creator.clone(),
            },
            metrics.clone(),
        )
        .spawn(add_peer_rx);
        SignerWithCache::new(signer, RegistrationVerifier { ledger }, metrics)
            .spawn(registration_rx);

        Self {
            withdrawal_signer_tx,
            add_peer_signer_tx,
            registration_signer_tx,
        }
    }

    async fn request_signature(
        queue: &mpsc::Sender<SigningRequest>,
        kind: &str,
        tx_hash: String,
    ) -> Result<Json<EthNotaryResponse>, BridgeError> {
        info!("[Handler] Received {} proof request: tx_hash={}", kind, tx_hash);
        let tx_hash = normalize_tx_hash(&tx_hash).map_err(|e| {
            error!("[Handler] Invalid tx_hash format: tx_hash={}", tx_hash);
            e
        })?;
        let (tx, rx) = oneshot::channel();
        queue
            .send((tx_hash.clone(), tx))
            .await
            .map_err(|_| BridgeError::InternalError(format!("{} signing queue is closed", kind)))?;
        let result = rx.await.map_err(|_| {
            BridgeError::InternalError(format!("{} signing task dropped the request", kind))
        })?;
        match &result {
            Ok(_) => info!("[Handler] {} proof request completed: tx_hash={}", kind, tx_hash),
            Err(e) => warn!(
                "[Handler] {} proof request failed: tx_hash={}, error={:?}",
                kind, tx_hash, e
            ),
        }
        Ok(Json(EthNotaryResponse::Successful {
            eth_signature: result?,
        }))
    }
}

#[async_trait]
impl NotaryRequestHandlerTrait for NotaryRequestHandler {
    async fn handle_withdrawal_proof(
        &self,
        tx_hash: String,
    ) -> Result<Json<EthNotaryResponse>, BridgeError> {
        Self::request_signature(&self.withdrawal_signer_tx, "withdrawal", tx_hash).await
    }

    async fn handle_add_peer_proof(
        &self,
        tx_hash: String,
    ) -> Result<Json<EthNotaryResponse>, BridgeError> {
        Self::request_signature(&self.add_peer_signer_tx, "add_peer", tx_hash).await
    }

    async fn handle_registration_proof(
        &self,
        tx_hash: String,
    ) -> Result<Json<EthNotaryResponse>, BridgeError> {
        Self::request_signature(&self.registration_signer_tx, "registration", tx_hash).await
    }
}
