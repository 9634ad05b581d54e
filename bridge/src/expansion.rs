// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Adds a new notary to the federation: the master contract learns the new
//! peer address and the shared notary account gains the new signatory, a
//! higher quorum and the new peer-list entry.

use crate::client::proof_collector::ProofCollector;
use crate::config::LedgerAccountsConfig;
use crate::crypto::{parse_eth_address, parse_tx_hash};
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::{LedgerBlock, LedgerCommand, LedgerSubmitter, LedgerTransaction, LedgerTxHash};
use crate::master_contract::MasterContract;
use crate::metrics::NotaryMetrics;
use crate::registry::DetailSpace;
use crate::server::handler::{expansion_details, NotaryRequestHandlerTrait};
use crate::types::{ExpansionDetails, ETH_ADDRESS_KEY, NOTARY_ENDPOINT_KEY, NOTARY_NAME_KEY};
use ethers::types::Address as EthAddress;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpansionState {
    TriggerObserved,
    LocalAttestationPublished,
    ProofCollected,
    OnChainAddPeerSubmitted,
    LedgerSignerUpdated,
}

impl ExpansionState {
    fn as_str(&self) -> &'static str {
        match self {
            ExpansionState::TriggerObserved => "trigger_observed",
            ExpansionState::LocalAttestationPublished => "local_attestation_published",
            ExpansionState::ProofCollected => "proof_collected",
            ExpansionState::OnChainAddPeerSubmitted => "add_peer_submitted",
            ExpansionState::LedgerSignerUpdated => "ledger_signer_updated",
        }
    }
}

/// The new peer as named by an expansion trigger.
#[derive(Clone, Debug, PartialEq, Eq)]
struct NewPeer {
    address: EthAddress,
    name: String,
    endpoint: String,
    public_key: String,
    quorum: u32,
}

impl NewPeer {
    fn from_details(trigger_hash: &str, details: &ExpansionDetails) -> BridgeResult<Self> {
        let field = |value: Option<&str>, key: &str| {
            value.map(str::to_string).ok_or_else(|| {
                BridgeError::InvalidLedgerTransaction(format!(
                    "expansion {} names no {}",
                    trigger_hash, key
                ))
            })
        };
        Ok(Self {
            address: parse_eth_address(&field(details.eth_address(), ETH_ADDRESS_KEY)?)?,
            name: field(details.notary_name(), NOTARY_NAME_KEY)?,
            endpoint: field(details.notary_endpoint(), NOTARY_ENDPOINT_KEY)?,
            public_key: details.public_key.clone(),
            quorum: details.quorum,
        })
    }
}

/// Every node watches for expansion triggers against the shared notary
/// account and signs the add-peer attestation ahead of the requests for it.
/// Only the expansion submitter drives the on-chain call and the ledger
/// update.
pub struct PeerExpansionProtocol {
    notary_account: String,
    trigger_account: String,
    trigger_creator: String,
    peer_list: DetailSpace,
    // this node's signing endpoint; signatures it produces stay cached there
    attester: Arc<dyn NotaryRequestHandlerTrait + Send + Sync>,
    collector: Arc<ProofCollector>,
    master: Arc<MasterContract>,
    submitter: Arc<LedgerSubmitter>,
    expansion_submitter: bool,
    metrics: Arc<NotaryMetrics>,
}

impl PeerExpansionProtocol {
    pub fn new(
        accounts: &LedgerAccountsConfig,
        attester: Arc<dyn NotaryRequestHandlerTrait + Send + Sync>,
        collector: Arc<ProofCollector>,
        master: Arc<MasterContract>,
        submitter: Arc<LedgerSubmitter>,
        expansion_submitter: bool,
        metrics: Arc<NotaryMetrics>,
    ) -> Self {
        Self {
            notary_account: accounts.notary_account.clone(),
            trigger_account: accounts.expansion_trigger_account.clone(),
            trigger_creator: accounts.expansion_trigger_creator.clone(),
            peer_list: accounts.notary_list.to_space(),
            attester,
            collector,
            master,
            submitter,
            expansion_submitter,
            metrics,
        }
    }

    /// Run every expansion of this node's account found in `block`. A failed
    /// expansion is logged and reported with the last state it reached.
    pub async fn process_block(&self, block: &LedgerBlock) -> Vec<(LedgerTxHash, ExpansionState)> {
        let mut outcomes = vec![];
        for tx in &block.transactions {
            let Some(details) = self.trigger_in(tx) else {
                continue;
            };
            let hash = tx.hash();
            if details.account_id_to_expand != self.notary_account {
                debug!(
                    "[PeerExpansion] Ignoring {} which expands {}",
                    hash, details.account_id_to_expand
                );
                continue;
            }
            let mut state = ExpansionState::TriggerObserved;
            self.step(state);
            if let Err(e) = self.expand(&hash, &details, &mut state).await {
                self.metrics.expansion_steps.with_label_values(&["failed"]).inc();
                self.metrics.observe_error(&e);
                error!(
                    "[PeerExpansion] Expansion {} stopped in state {:?}: {:?}",
                    hash, state, e
                );
            }
            outcomes.push((hash, state));
        }
        outcomes
    }

    fn trigger_in(&self, tx: &LedgerTransaction) -> Option<ExpansionDetails> {
        if tx.creator_account_id != self.trigger_creator {
            return None;
        }
        match expansion_details(tx, &self.trigger_account, &self.trigger_creator) {
            Ok(details) => Some(details),
            Err(BridgeError::InvalidLedgerTransaction(_)) => None,
            Err(e) => {
                error!(
                    "[PeerExpansion] Malformed expansion trigger {}: {:?}",
                    tx.hash(),
                    e
                );
                None
            }
        }
    }

    fn step(&self, state: ExpansionState) {
        self.metrics
            .expansion_steps
            .with_label_values(&[state.as_str()])
            .inc();
    }

    async fn expand(
        &self,
        trigger_hash: &str,
        details: &ExpansionDetails,
        state: &mut ExpansionState,
    ) -> BridgeResult<()> {
        let peer = NewPeer::from_details(trigger_hash, details)?;
        info!(
            "[PeerExpansion] Expansion {} adds {} ({:?}) at {}",
            trigger_hash, peer.name, peer.address, peer.endpoint
        );
        self.attester
            .handle_add_peer_proof(trigger_hash.to_string())
            .await?;
        *state = ExpansionState::LocalAttestationPublished;
        self.step(*state);
        if !self.expansion_submitter {
            return Ok(());
        }

        if self.master.is_peer(peer.address).await? {
            info!("[PeerExpansion] {:?} is already a peer on Chain A", peer.address);
        } else {
            let bundle = self
                .collector
                .collect_add_peer_proof(&peer.address, trigger_hash)
                .await?;
            *state = ExpansionState::ProofCollected;
            self.step(*state);
            let receipt = self
                .master
                .add_peer_by_peer(peer.address, parse_tx_hash(trigger_hash)?, &bundle)
                .await?;
            info!(
                "[PeerExpansion] addPeerByPeer for {:?} mined in {:?}",
                peer.address, receipt.transaction_hash
            );
        }
        *state = ExpansionState::OnChainAddPeerSubmitted;
        self.step(*state);

        let signatories = self
            .submitter
            .client()
            .signatories(&self.notary_account)
            .await?;
        if signatories.contains(&peer.public_key) {
            info!(
                "[PeerExpansion] {} already signs for {}",
                peer.name, self.notary_account
            );
        } else {
            let ledger_hash = self
                .submitter
                .send(vec![
                    LedgerCommand::AddSignatory {
                        account_id: self.notary_account.clone(),
                        public_key: peer.public_key.clone(),
                    },
                    LedgerCommand::SetAccountQuorum {
                        account_id: self.notary_account.clone(),
                        quorum: peer.quorum,
                    },
                    LedgerCommand::SetAccountDetail {
                        account_id: self.peer_list.storage_account.clone(),
                        key: peer.name.clone(),
                        value: peer.endpoint.clone(),
                    },
                ])
                .await?;
            info!(
                "[PeerExpansion] {} joined {} with quorum {} in ledger tx {}",
                peer.name, self.notary_account, peer.quorum, ledger_hash
            );
        }
        *state = ExpansionState::LedgerSignerUpdated;
        self.step(*state);
        Ok(())
    }
}
