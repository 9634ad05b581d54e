// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{WithdrawalAttestor, WithdrawalRequest};
use crate::client::proof_collector::ProofCollector;
use crate::crypto::parse_tx_hash;
use crate::error::BridgeResult;
use crate::ledger::{LedgerBlock, LedgerSubmitter, LedgerTxHash};
use crate::master_contract::MasterContract;
use crate::metrics::NotaryMetrics;
use crate::types::{AnchorOrigin, WITHDRAWAL_ACK_SUFFIX};
use ethers::types::{TransactionReceipt, H256};
use std::sync::Arc;
use tap::TapFallible;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WithdrawalState {
    Observed,
    ProofRequested,
    ProofReady,
    Submitted,
    Finalized,
    RolledBack,
}

/// Published once a withdrawal is paid out on Chain A and settled on the
/// ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawalAck {
    pub id: String,
    pub trigger_hash: LedgerTxHash,
    pub src_account_id: String,
    pub asset_id: String,
    pub amount: String,
    pub chain_a_tx_hash: H256,
    pub block_number: Option<u64>,
    pub finalization_hash: LedgerTxHash,
}

/// Requester side of a withdrawal: collect the proof, submit it to the master
/// contract, then settle the ledger side. A failed submission is compensated
/// on the ledger instead.
pub struct WithdrawalPipeline {
    attestor: Arc<WithdrawalAttestor>,
    collector: Arc<ProofCollector>,
    master: Arc<MasterContract>,
    // signs as the withdrawal trigger account
    submitter: Arc<LedgerSubmitter>,
    billing_account: String,
    acks: mpsc::Sender<WithdrawalAck>,
    metrics: Arc<NotaryMetrics>,
}

impl WithdrawalPipeline {
    pub fn new(
        attestor: Arc<WithdrawalAttestor>,
        collector: Arc<ProofCollector>,
        master: Arc<MasterContract>,
        submitter: Arc<LedgerSubmitter>,
        billing_account: impl Into<String>,
        acks: mpsc::Sender<WithdrawalAck>,
        metrics: Arc<NotaryMetrics>,
    ) -> Self {
        Self {
            attestor,
            collector,
            master,
            submitter,
            billing_account: billing_account.into(),
            acks,
            metrics,
        }
    }

    /// Run every withdrawal of `block` to a terminal state. Failing to settle
    /// or to compensate on the ledger is an error.
    pub async fn process_block(
        &self,
        block: &LedgerBlock,
    ) -> BridgeResult<Vec<(LedgerTxHash, WithdrawalState)>> {
        let mut outcomes = vec![];
        for tx in &block.transactions {
            let hash = tx.hash();
            let request = match WithdrawalRequest::from_transaction(
                &hash,
                tx,
                self.attestor.trigger_account(),
            ) {
                Ok(request) => request,
                Err(e) => {
                    if super::withdrawal_transfer(tx, self.attestor.trigger_account()).is_some() {
                        // funds reached the trigger account but cannot be withdrawn
                        error!("[WithdrawalPipeline] Unusable withdrawal {}: {:?}", hash, e);
                    }
                    continue;
                }
            };
            let state = self.process(&request).await?;
            outcomes.push((hash, state));
        }
        Ok(outcomes)
    }

    pub async fn process(&self, request: &WithdrawalRequest) -> BridgeResult<WithdrawalState> {
        info!(
            "[WithdrawalPipeline] Observed withdrawal {}: {} {} from {} to {:?}, fee {:?}",
            request.trigger_hash,
            request.amount,
            request.asset_id,
            request.src_account_id,
            request.beneficiary,
            request.fee
        );
        let mut state = WithdrawalState::Observed;
        match self.submit(request, &mut state).await {
            Ok(receipt) => {
                self.finalize(request, &receipt).await?;
                Ok(WithdrawalState::Finalized)
            }
            Err(e) => {
                self.metrics.observe_error(&e);
                error!(
                    "[WithdrawalPipeline] Withdrawal {} failed in state {:?}: {:?}, rolling back",
                    request.trigger_hash, state, e
                );
                let rollback_hash = self.rollback(request).await.tap_err(|rollback_err| {
                    self.metrics
                        .withdrawal_outcomes
                        .with_label_values(&["rollback_failed"])
                        .inc();
                    error!(
                        "[WithdrawalPipeline] ROLLBACK FAILED for {}: {} {} and fee {:?} stay on {}: {:?}",
                        request.trigger_hash,
                        request.amount,
                        request.asset_id,
                        request.fee,
                        self.attestor.trigger_account(),
                        rollback_err
                    );
                })?;
                self.metrics
                    .withdrawal_outcomes
                    .with_label_values(&["rolled_back"])
                    .inc();
                info!(
                    "[WithdrawalPipeline] Withdrawal {} rolled back in ledger tx {}",
                    request.trigger_hash, rollback_hash
                );
                Ok(WithdrawalState::RolledBack)
            }
        }
    }

    async fn submit(
        &self,
        request: &WithdrawalRequest,
        state: &mut WithdrawalState,
    ) -> BridgeResult<TransactionReceipt> {
        let attestation = self.attestor.attest(request).await?;
        let trigger_hash = parse_tx_hash(&request.trigger_hash)?;

        *state = WithdrawalState::ProofRequested;
        let bundle = self
            .collector
            .collect_withdrawal_proof(&request.trigger_hash, attestation.hash)
            .await?;
        *state = WithdrawalState::ProofReady;
        debug!(
            "[WithdrawalPipeline] Collected {} signatures for {}",
            bundle.len(),
            request.trigger_hash
        );

        *state = WithdrawalState::Submitted;
        match attestation.anchor_origin {
            AnchorOrigin::ChainA => {
                self.master
                    .withdraw(
                        attestation.token,
                        attestation.raw_amount,
                        request.beneficiary,
                        trigger_hash,
                        &bundle,
                        attestation.relay,
                    )
                    .await
            }
            AnchorOrigin::Ledger => {
                self.master
                    .mint_tokens_by_peers(
                        attestation.token,
                        attestation.raw_amount,
                        request.beneficiary,
                        trigger_hash,
                        &bundle,
                        attestation.relay,
                    )
                    .await
            }
        }
    }

    /// Burn the paid out amount and bill the fee. The funds already left on
    /// Chain A, so a failure here is never compensated.
    async fn finalize(
        &self,
        request: &WithdrawalRequest,
        receipt: &TransactionReceipt,
    ) -> BridgeResult<()> {
        let finalization_hash = self
            .submitter
            .send(request.finalization_commands(self.attestor.trigger_account(), &self.billing_account))
            .await
            .tap_err(|e| {
                self.metrics
                    .withdrawal_outcomes
                    .with_label_values(&["finalization_failed"])
                    .inc();
                error!(
                    "[WithdrawalPipeline] FINALIZATION FAILED for {} paid out in Chain-A tx {:?}: {:?}",
                    request.trigger_hash, receipt.transaction_hash, e
                );
            })?;
        self.metrics
            .withdrawal_outcomes
            .with_label_values(&["finalized"])
            .inc();
        info!(
            "[WithdrawalPipeline] Withdrawal {} finalized in Chain-A tx {:?} and ledger tx {}",
            request.trigger_hash, receipt.transaction_hash, finalization_hash
        );

        let ack = WithdrawalAck {
            id: format!("{}{}", request.trigger_hash, WITHDRAWAL_ACK_SUFFIX),
            trigger_hash: request.trigger_hash.clone(),
            src_account_id: request.src_account_id.clone(),
            asset_id: request.asset_id.clone(),
            amount: request.amount.clone(),
            chain_a_tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|n| n.as_u64()),
            finalization_hash,
        };
        match self.acks.send(ack).await {
            Ok(()) => self.metrics.withdrawal_acks_published.inc(),
            Err(e) => warn!(
                "[WithdrawalPipeline] Nobody consumes withdrawal acks, dropped {}",
                e.0.id
            ),
        }
        Ok(())
    }

    async fn rollback(&self, request: &WithdrawalRequest) -> BridgeResult<LedgerTxHash> {
        self.submitter
            .send(request.refund_commands(self.attestor.trigger_account()))
            .await
    }
}
