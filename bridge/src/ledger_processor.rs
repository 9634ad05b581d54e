// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Sequential consumer of ledger blocks.
//!
//! Every block goes through registry refresh, expansion, wallet registration,
//! withdrawal proof publication and, on a withdrawal requester, the
//! withdrawal pipeline, in that order. The next block starts only after the
//! current one has issued all of its ledger writes.

use crate::error::{BridgeError, BridgeResult};
use crate::expansion::PeerExpansionProtocol;
use crate::ledger::{LedgerBlock, LedgerClient};
use crate::metrics::NotaryMetrics;
use crate::registration::WalletRegistrationHandler;
use crate::registry::{AddressRegistry, AssetRegistry};
use crate::withdrawal::{WithdrawalPipeline, WithdrawalProofPublisher};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct LedgerBlockProcessor {
    ledger: Arc<dyn LedgerClient>,
    wallets: Arc<AddressRegistry>,
    relays: Arc<AddressRegistry>,
    assets: Arc<AssetRegistry>,
    expansion: Arc<PeerExpansionProtocol>,
    registration: Arc<WalletRegistrationHandler>,
    publisher: Arc<WithdrawalProofPublisher>,
    // only on withdrawal requesters
    pipeline: Option<Arc<WithdrawalPipeline>>,
    metrics: Arc<NotaryMetrics>,
}

impl LedgerBlockProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        wallets: Arc<AddressRegistry>,
        relays: Arc<AddressRegistry>,
        assets: Arc<AssetRegistry>,
        expansion: Arc<PeerExpansionProtocol>,
        registration: Arc<WalletRegistrationHandler>,
        publisher: Arc<WithdrawalProofPublisher>,
        pipeline: Option<Arc<WithdrawalPipeline>>,
        metrics: Arc<NotaryMetrics>,
    ) -> Self {
        Self {
            ledger,
            wallets,
            relays,
            assets,
            expansion,
            registration,
            publisher,
            pipeline,
            metrics,
        }
    }

    /// Only a withdrawal that can neither be finalized nor rolled back stops
    /// the processor. Every other failure is logged and the block still
    /// completes.
    pub async fn process_block(&self, block: &LedgerBlock) -> BridgeResult<()> {
        debug!(
            "[LedgerBlockProcessor] Processing block {} with {} transactions",
            block.height,
            block.transactions.len()
        );
        self.wallets.observe_block(block).await;
        self.relays.observe_block(block).await;
        self.assets.observe_block(block).await;

        self.expansion.process_block(block).await;

        if let Err(e) = self.registration.process_block(block).await {
            self.metrics.observe_error(&e);
            error!(
                "[LedgerBlockProcessor] Registration handling failed in block {}: {:?}",
                block.height, e
            );
        }

        if let Err(e) = self.publisher.process_block(block).await {
            self.metrics.observe_error(&e);
            error!(
                "[LedgerBlockProcessor] Proof publication failed in block {}: {:?}",
                block.height, e
            );
        }

        if let Some(pipeline) = &self.pipeline {
            pipeline.process_block(block).await?;
        }

        self.metrics
            .last_processed_ledger_block
            .set(block.height as i64);
        Ok(())
    }

    /// Process every block from `next_height` on. Blocks missed by a lagging
    /// subscription are read back from the ledger.
    pub async fn run(
        self,
        mut blocks: broadcast::Receiver<LedgerBlock>,
        mut next_height: u64,
        cancel: CancellationToken,
    ) -> BridgeResult<()> {
        info!("[LedgerBlockProcessor] Starting at ledger block {}", next_height);
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[LedgerBlockProcessor] Stopped before block {}", next_height);
                    return Ok(());
                }
                received = blocks.recv() => received,
            };
            let tip = match received {
                Ok(block) if block.height == next_height => {
                    self.process_block(&block).await?;
                    next_height += 1;
                    continue;
                }
                Ok(block) => block.height,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "[LedgerBlockProcessor] Subscription skipped {} blocks, reading them back",
                        skipped
                    );
                    self.ledger.latest_height().await?
                }
                Err(RecvError::Closed) => {
                    error!("[LedgerBlockProcessor] Ledger block stream closed");
                    return Err(BridgeError::ListenerClosed);
                }
            };
            while next_height <= tip {
                let block = self.ledger.block(next_height).await?.ok_or_else(|| {
                    BridgeError::LedgerError(format!("block {} not found", next_height))
                })?;
                self.process_block(&block).await?;
                next_height += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::proof_collector::ProofCollector;
    use crate::eth_transaction_manager::ChainATransactionManager;
    use crate::ledger::LedgerCommand;
    use crate::master_contract::MasterContract;
    use crate::server::handler::NotaryRequestHandler;
    use crate::test_utils::{get_test_wallet, test_ledger, FakeChainAClient, TestLedger, TEST_MASTER_CONTRACT};
    use crate::types::ETH_ASSET_ID;
    use crate::withdrawal::proof_account_id;
    use ethers::types::Address as EthAddress;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const ALICE: &str = "alice@domain";

    fn processor(fixture: &TestLedger, with_pipeline: bool) -> (LedgerBlockProcessor, Arc<NotaryMetrics>) {
        let metrics = Arc::new(NotaryMetrics::new_for_testing());
        let fake = Arc::new(FakeChainAClient::new());
        let nonces = Arc::new(ChainATransactionManager::new(fake, metrics.clone()));
        let master = Arc::new(MasterContract::new(TEST_MASTER_CONTRACT, nonces));
        let collector = Arc::new(ProofCollector::new(
            fixture.peer_list(),
            Duration::from_secs(1),
            metrics.clone(),
        ));
        let wallets = fixture.wallets();
        let relays = fixture.relays();
        let assets = fixture.assets();
        let attestor = fixture.attestor();
        let pipeline = with_pipeline.then(|| {
            // nothing here reaches finalization, so acks are never read
            let (acks, _) = mpsc::channel(1);
            Arc::new(WithdrawalPipeline::new(
                attestor.clone(),
                collector.clone(),
                master.clone(),
                fixture.withdrawal_submitter(),
                fixture.accounts.withdrawal_billing_account.clone(),
                acks,
                metrics.clone(),
            ))
        });
        let processor = LedgerBlockProcessor::new(
            fixture.client(),
            wallets.clone(),
            relays.clone(),
            assets.clone(),
            Arc::new(PeerExpansionProtocol::new(
                &fixture.accounts,
                Arc::new(NotaryRequestHandler::new(
                    get_test_wallet(1),
                    fixture.client(),
                    attestor.clone(),
                    &fixture.accounts,
                    metrics.clone(),
                )),
                collector,
                master,
                fixture.notary_submitter(),
                true,
                metrics.clone(),
            )),
            Arc::new(WalletRegistrationHandler::new(
                &fixture.accounts,
                wallets.clone(),
                fixture.submitter(&fixture.accounts.wallets.setter_account),
                metrics.clone(),
            )),
            Arc::new(WithdrawalProofPublisher::new(
                attestor,
                wallets,
                assets,
                fixture.notary_submitter(),
                get_test_wallet(1),
                fixture.accounts.withdrawal_proof_domain.clone(),
                metrics.clone(),
            )),
            pipeline,
            metrics.clone(),
        );
        (processor, metrics)
    }

    async fn proofs_published(fixture: &TestLedger, hash: &str) -> usize {
        fixture
            .ledger
            .account_details(
                &proof_account_id(hash, &fixture.accounts.withdrawal_proof_domain),
                &fixture.accounts.notary_account,
            )
            .await
            .map(|records| records.len())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_registry_writes_are_visible_to_the_same_block() {
        let fixture = test_ledger();
        fixture.add_user(ALICE, ETH_ASSET_ID, "10");
        let (processor, metrics) = processor(&fixture, false);
        let wallet = EthAddress::repeat_byte(0xaa);
        // wallet registration and withdrawal land in consecutive blocks
        let (_, registration) = fixture
            .submit_as(
                &fixture.accounts.wallets.setter_account,
                vec![LedgerCommand::SetAccountDetail {
                    account_id: fixture.accounts.wallets.storage_account.clone(),
                    key: crate::crypto::address_to_hex(&wallet),
                    value: ALICE.into(),
                }],
            )
            .await;
        let (hash, withdrawal) = fixture
            .withdraw(ALICE, ETH_ASSET_ID, "1", EthAddress::repeat_byte(0xbe))
            .await;

        processor.process_block(&registration).await.unwrap();
        processor.process_block(&withdrawal).await.unwrap();
        assert_eq!(proofs_published(&fixture, &hash).await, 1);
        assert_eq!(
            metrics.last_processed_ledger_block.get(),
            withdrawal.height as i64
        );
    }

    #[tokio::test]
    async fn test_requester_rolls_back_unprovable_withdrawal() {
        let fixture = test_ledger();
        fixture.add_user(ALICE, ETH_ASSET_ID, "10");
        let (processor, _) = processor(&fixture, true);
        let (_, block) = fixture
            .withdraw(ALICE, ETH_ASSET_ID, "3", EthAddress::repeat_byte(0xbe))
            .await;

        processor.process_block(&block).await.unwrap();
        assert_eq!(
            fixture.ledger.balance(ALICE, ETH_ASSET_ID).await.unwrap(),
            "10"
        );
    }

    #[tokio::test]
    async fn test_run_processes_blocks_in_order_and_reads_back_missed_ones() {
        let fixture = test_ledger();
        fixture.add_user(ALICE, ETH_ASSET_ID, "10");
        fixture.register_wallet(EthAddress::repeat_byte(0xaa), ALICE);
        let (processor, metrics) = processor(&fixture, false);

        // committed before anyone subscribed
        let (early, _) = fixture
            .withdraw(ALICE, ETH_ASSET_ID, "1", EthAddress::repeat_byte(0xbe))
            .await;
        let blocks = fixture.ledger.subscribe_blocks();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(processor.run(blocks, 1, cancel.clone()));
        let (late, last) = fixture
            .withdraw(ALICE, ETH_ASSET_ID, "2", EthAddress::repeat_byte(0xbe))
            .await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while metrics.last_processed_ledger_block.get() < last.height as i64 {
            assert!(tokio::time::Instant::now() < deadline, "processor stalled");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(proofs_published(&fixture, &early).await, 1);
        assert_eq!(proofs_published(&fixture, &late).await, 1);
    }
}
