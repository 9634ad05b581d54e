// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Collects attestation signatures from the peer notaries.
//!
//! Every listed peer is asked concurrently, each under its own timeout.
//! Unreachable, slow or rejecting peers are skipped. Collection succeeds with
//! whatever valid signatures arrived, as long as there is at least one: the
//! signer threshold is enforced by the master contract, not here.

use crate::client::notary_client::NotaryClient;
use crate::crypto::{address_to_hex, hash_add_peer, recover_signer, Vrs};
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::NotaryMetrics;
use crate::registry::PeerListProvider;
use crate::types::SignatureBundle;
use ethers::types::{Address as EthAddress, H256};
use notary_peer_aggregation::{map_then_reduce_with_timeout, PeerCallError, ReduceOutput};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProofKind {
    Withdrawal,
    AddPeer,
}

impl ProofKind {
    fn as_str(&self) -> &'static str {
        match self {
            ProofKind::Withdrawal => "withdrawal",
            ProofKind::AddPeer => "add_peer",
        }
    }
}

#[derive(Debug, Default)]
struct CollectState {
    bundle: SignatureBundle,
    signers: HashSet<EthAddress>,
    failed_peers: Vec<String>,
}

pub struct ProofCollector {
    peers: Arc<PeerListProvider>,
    per_peer_timeout: Duration,
    metrics: Arc<NotaryMetrics>,
}

impl ProofCollector {
    pub fn new(
        peers: Arc<PeerListProvider>,
        per_peer_timeout: Duration,
        metrics: Arc<NotaryMetrics>,
    ) -> Self {
        Self {
            peers,
            per_peer_timeout,
            metrics,
        }
    }

    /// Ask every peer to sign the withdrawal triggered by ledger transaction
    /// `trigger_hash`. Signatures are recovered against `attestation`, the hash
    /// this node expects them to sign; unrecoverable ones are dropped and each
    /// signer counts once.
    pub async fn collect_withdrawal_proof(
        &self,
        trigger_hash: &str,
        attestation: H256,
    ) -> BridgeResult<SignatureBundle> {
        self.collect(ProofKind::Withdrawal, trigger_hash, attestation)
            .await
    }

    pub async fn collect_add_peer_proof(
        &self,
        peer_address: &EthAddress,
        trigger_hash: &str,
    ) -> BridgeResult<SignatureBundle> {
        let attestation = hash_add_peer(&address_to_hex(peer_address), trigger_hash)?;
        self.collect(ProofKind::AddPeer, trigger_hash, attestation)
            .await
    }

    async fn clients(&self) -> BridgeResult<BTreeMap<String, Arc<NotaryClient>>> {
        let mut clients = BTreeMap::new();
        for (name, url) in self.peers.peers().await? {
            match NotaryClient::new(name.clone(), url) {
                Ok(client) => {
                    clients.insert(name, Arc::new(client));
                }
                Err(e) => warn!("[ProofCollector] Skipping peer {}: {:?}", name, e),
            }
        }
        Ok(clients)
    }

    async fn collect(
        &self,
        kind: ProofKind,
        trigger_hash: &str,
        attestation: H256,
    ) -> BridgeResult<SignatureBundle> {
        let clients = self.clients().await?;
        info!(
            "[ProofCollector] Collecting {} proof for {} from {} peers",
            kind.as_str(),
            trigger_hash,
            clients.len()
        );
        let hash = trigger_hash.to_string();
        let metrics = self.metrics.clone();
        let outcome = map_then_reduce_with_timeout(
            Arc::new(clients),
            CollectState::default(),
            move |_name: String, client: Arc<NotaryClient>| {
                let hash = hash.clone();
                Box::pin(async move {
                    match kind {
                        ProofKind::Withdrawal => client.request_withdrawal_proof(&hash).await,
                        ProofKind::AddPeer => client.request_add_peer_proof(&hash).await,
                    }
                })
            },
            move |mut state: CollectState,
             name: String,
             result: Result<Vrs, PeerCallError<BridgeError>>| {
                let metrics = metrics.clone();
                Box::pin(async move {
                    match result.map_err(|e| e.to_string()).and_then(|vrs| {
                        recover_signer(attestation, &vrs)
                            .map(|signer| (vrs, signer))
                            .map_err(|e| e.to_string())
                    }) {
                        Ok((vrs, signer)) if state.signers.insert(signer) => {
                            info!("[ProofCollector] Got {} signature from {}", kind.as_str(), name);
                            metrics.proof_ok_responses.with_label_values(&[name.as_str()]).inc();
                            state.bundle.push(&vrs);
                        }
                        Ok((_, signer)) => {
                            warn!(
                                "[ProofCollector] Duplicate signer {:?} from {}",
                                signer, name
                            );
                            metrics.proof_bad_responses.with_label_values(&[name.as_str()]).inc();
                            state.failed_peers.push(name);
                        }
                        Err(e) => {
                            warn!("[ProofCollector] Peer {} gave no signature: {}", name, e);
                            metrics.proof_bad_responses.with_label_values(&[name.as_str()]).inc();
                            state.failed_peers.push(name);
                        }
                    }
                    ReduceOutput::<CollectState, CollectState>::Continue(state)
                })
            },
            self.per_peer_timeout,
        )
        .await;
        let state = match outcome {
            Ok(state) | Err(state) => state,
        };

        if state.bundle.is_empty() {
            error!(
                "[ProofCollector] No valid {} proof for {}, failed peers: {:?}",
                kind.as_str(),
                trigger_hash,
                state.failed_peers
            );
            self.metrics.err_proof_collection.inc();
            return Err(BridgeError::NoValidProof(format!(
                "no peer signed {} proof for {}",
                kind.as_str(),
                trigger_hash
            )));
        }
        info!(
            "[ProofCollector] Collected {} {} signatures for {}",
            state.bundle.len(),
            kind.as_str(),
            trigger_hash
        );
        Ok(state.bundle)
    }
}
