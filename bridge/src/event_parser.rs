// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Extraction of bridge events from finalized Chain-A blocks.

use crate::abi::{decode_erc20_transfer, decode_master_withdrawal_call};
use crate::chain_listener::BlockHandler;
use crate::error::{BridgeError, BridgeResult};
use crate::eth_client::ChainAClient;
use crate::metrics::NotaryMetrics;
use crate::registry::{AddressRegistry, AssetRegistry};
use crate::types::{AnchorOrigin, ChainAEvent, ETH_ASSET_ID, ETH_PRECISION};
use crate::utils::render_decimal;
use crate::withdrawal::WithdrawalLimitProvider;
use async_trait::async_trait;
use ethers::types::{Address as EthAddress, Block, Transaction, TransactionReceipt, H256, U64};
use std::sync::Arc;
use tap::TapFallible;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct ChainAEventParser {
    master_contract: EthAddress,
    client: Arc<dyn ChainAClient>,
    wallets: Arc<AddressRegistry>,
    relays: Arc<AddressRegistry>,
    assets: Arc<AssetRegistry>,
}

impl ChainAEventParser {
    pub fn new(
        master_contract: EthAddress,
        client: Arc<dyn ChainAClient>,
        wallets: Arc<AddressRegistry>,
        relays: Arc<AddressRegistry>,
        assets: Arc<AssetRegistry>,
    ) -> Self {
        Self {
            master_contract,
            client,
            wallets,
            relays,
            assets,
        }
    }

    /// Classify every transaction of `block`. Any registry or node failure
    /// fails the whole block so that it is delivered again.
    pub async fn parse_block(&self, block: &Block<Transaction>) -> BridgeResult<Vec<ChainAEvent>> {
        let block_number = block.number.map(|n| n.as_u64()).unwrap_or_default();
        let timestamp_millis = block.timestamp.as_u64().saturating_mul(1000);
        let mut events = vec![];
        for tx in &block.transactions {
            let Some(to) = tx.to else {
                continue;
            };
            if to == self.master_contract && !tx.input.is_empty() {
                if let Some(event) = self.parse_master_call(tx, block_number).await? {
                    events.push(event);
                }
            } else if tx.input.is_empty() {
                if let Some(event) = self.parse_ether_deposit(tx, to, timestamp_millis).await? {
                    events.push(event);
                }
            } else {
                events.extend(self.parse_token_deposits(tx, to, timestamp_millis).await?);
            }
        }
        Ok(events)
    }

    async fn parse_master_call(
        &self,
        tx: &Transaction,
        block_number: u64,
    ) -> BridgeResult<Option<ChainAEvent>> {
        let call = match decode_master_withdrawal_call(&tx.input) {
            Ok(Some(call)) => call,
            Ok(None) => {
                debug!("[ChainAEventParser] Ignoring master contract call {:?}", tx.hash);
                return Ok(None);
            }
            Err(e) => {
                warn!(
                    "[ChainAEventParser] Undecodable master contract call {:?}: {:?}",
                    tx.hash, e
                );
                return Ok(None);
            }
        };
        if !self.succeeded(tx.hash).await? {
            debug!("[ChainAEventParser] Failed {} call {:?}", call.method, tx.hash);
            return Ok(None);
        }
        info!(
            "[ChainAEventParser] Withdrawal {:?} finalized by {:?}",
            call.trigger_tx_hash, tx.hash
        );
        Ok(Some(ChainAEvent::WithdrawalFinalized {
            trigger_tx_hash: call.trigger_tx_hash,
            block_number,
            tx_index: tx.transaction_index.map(|i| i.as_u64()).unwrap_or_default(),
        }))
    }

    async fn parse_ether_deposit(
        &self,
        tx: &Transaction,
        to: EthAddress,
        timestamp_millis: u64,
    ) -> BridgeResult<Option<ChainAEvent>> {
        let Some(beneficiary) = self.beneficiary(tx.from, to).await? else {
            return Ok(None);
        };
        if tx.value.is_zero() || !self.succeeded(tx.hash).await? {
            return Ok(None);
        }
        let amount = render_decimal(tx.value, ETH_PRECISION)?;
        info!(
            "[ChainAEventParser] Ether deposit {:?}: {} to {}",
            tx.hash, amount, beneficiary
        );
        Ok(Some(ChainAEvent::Deposit {
            tx_hash: tx.hash,
            timestamp_millis,
            beneficiary_account: beneficiary,
            asset_id: ETH_ASSET_ID.to_string(),
            decimal_amount: amount,
            source_address: tx.from,
            anchor_origin: AnchorOrigin::ChainA,
        }))
    }

    async fn parse_token_deposits(
        &self,
        tx: &Transaction,
        token: EthAddress,
        timestamp_millis: u64,
    ) -> BridgeResult<Vec<ChainAEvent>> {
        let Some(asset) = self.assets.asset_by_contract(&token).await? else {
            return Ok(vec![]);
        };
        let receipt = self.receipt(tx.hash).await?;
        if !is_success(&receipt) {
            return Ok(vec![]);
        }
        let mut events = vec![];
        for log in receipt.logs.iter().filter(|log| log.address == token) {
            let Some(transfer) = decode_erc20_transfer(&log.topics, &log.data) else {
                continue;
            };
            if transfer.amount.is_zero() {
                continue;
            }
            let Some(beneficiary) = self.beneficiary(transfer.from, transfer.to).await? else {
                continue;
            };
            let amount = render_decimal(transfer.amount, asset.precision)?;
            info!(
                "[ChainAEventParser] Token deposit {:?}: {} {} to {}",
                tx.hash, amount, asset.asset_id, beneficiary
            );
            events.push(ChainAEvent::Deposit {
                tx_hash: tx.hash,
                timestamp_millis,
                beneficiary_account: beneficiary,
                asset_id: asset.asset_id.clone(),
                decimal_amount: amount,
                source_address: transfer.from,
                anchor_origin: asset.anchor_origin,
            });
        }
        Ok(events)
    }

    /// Ledger account credited by a transfer `from -> to`: the sender's wallet
    /// owner for transfers into the master contract, the relay owner for
    /// transfers into a registered relay.
    async fn beneficiary(&self, from: EthAddress, to: EthAddress) -> BridgeResult<Option<String>> {
        if to == self.master_contract {
            self.wallets.resolve(&from).await
        } else {
            self.relays.resolve(&to).await
        }
    }

    async fn receipt(&self, tx_hash: H256) -> BridgeResult<TransactionReceipt> {
        self.client
            .transaction_receipt(tx_hash)
            .await?
            .ok_or_else(|| {
                BridgeError::ChainUnavailable(format!("receipt of {:?} not available", tx_hash))
            })
    }

    async fn succeeded(&self, tx_hash: H256) -> BridgeResult<bool> {
        Ok(is_success(&self.receipt(tx_hash).await?))
    }
}

fn is_success(receipt: &TransactionReceipt) -> bool {
    receipt.status == Some(U64::from(1))
}

/// Parses delivered blocks and forwards the events downstream.
pub struct ChainAEventHandler {
    parser: ChainAEventParser,
    events_tx: mpsc::Sender<ChainAEvent>,
    limits: Option<Arc<WithdrawalLimitProvider>>,
    metrics: Arc<NotaryMetrics>,
}

impl ChainAEventHandler {
    pub fn new(
        parser: ChainAEventParser,
        events_tx: mpsc::Sender<ChainAEvent>,
        metrics: Arc<NotaryMetrics>,
    ) -> Self {
        Self {
            parser,
            events_tx,
            limits: None,
            metrics,
        }
    }

    /// Republish the withdrawal limit as Chain-A block time passes.
    pub fn with_withdrawal_limits(mut self, limits: Arc<WithdrawalLimitProvider>) -> Self {
        self.limits = Some(limits);
        self
    }
}

#[async_trait]
impl BlockHandler for ChainAEventHandler {
    async fn handle_block(&self, block: Block<Transaction>) -> BridgeResult<()> {
        let events = self.parser.parse_block(&block).await.tap_err(|e| {
            error!(
                "[ChainAEventParser] Failed to parse block {:?}: {:?}",
                block.number, e
            );
            self.metrics.err_block_parse.inc();
        })?;
        for event in events {
            match &event {
                ChainAEvent::Deposit { asset_id, .. } => self
                    .metrics
                    .deposit_events_observed
                    .with_label_values(&[asset_id.as_str()])
                    .inc(),
                ChainAEvent::WithdrawalFinalized { .. } => {
                    self.metrics.withdrawal_finalized_observed.inc()
                }
            }
            self.events_tx
                .send(event)
                .await
                .map_err(|_| BridgeError::InternalError("Chain-A event channel closed".into()))?;
        }
        if let Some(limits) = &self.limits {
            // a stale limit must not hold back deposits
            let block_millis = block.timestamp.as_u64().saturating_mul(1000);
            if let Err(e) = limits.on_block(block_millis).await {
                warn!(
                    "[WithdrawalLimits] Failed to update limit at block {:?}: {:?}",
                    block.number, e
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{master_function, WITHDRAW_METHOD};
    use crate::chain_listener::{ChainAListener, InMemoryCursorStore, ListenerConfig};
    use crate::test_utils::{
        block_with, empty_block, eth_tx, receipt_for, test_ledger, transfer_log,
        FakeChainAClient, TestLedger, TEST_MASTER_CONTRACT,
    };
    use ethers::abi::Token;
    use ethers::types::{Bytes, U256};
    use std::time::Duration;

    const ALICE: &str = "alice@domain";
    const BOB: &str = "bob@domain";
    const TOKEN_ASSET: &str = "usdt#ethereum";

    fn wallet_a() -> EthAddress {
        EthAddress::repeat_byte(0xaa)
    }

    fn relay_b() -> EthAddress {
        EthAddress::repeat_byte(0xbb)
    }

    fn token() -> EthAddress {
        EthAddress::repeat_byte(0x70)
    }

    fn ether(amount: u64) -> U256 {
        U256::from(amount) * U256::exp10(18)
    }

    fn setup() -> (TestLedger, Arc<FakeChainAClient>, ChainAEventParser) {
        let fixture = test_ledger();
        fixture.register_wallet(wallet_a(), ALICE);
        fixture.register_relay(relay_b(), BOB);
        fixture.register_chain_a_token(token(), TOKEN_ASSET, 6);
        let fake = Arc::new(FakeChainAClient::new());
        let parser = ChainAEventParser::new(
            TEST_MASTER_CONTRACT,
            fake.clone(),
            fixture.wallets(),
            fixture.relays(),
            fixture.assets(),
        );
        (fixture, fake, parser)
    }

    fn deposit_amounts(events: &[ChainAEvent]) -> Vec<(String, String, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                ChainAEvent::Deposit {
                    beneficiary_account,
                    asset_id,
                    decimal_amount,
                    ..
                } => Some((
                    beneficiary_account.clone(),
                    asset_id.clone(),
                    decimal_amount.clone(),
                )),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_ether_deposit_from_known_wallet() {
        let (_fixture, fake, parser) = setup();
        let tx = eth_tx(1, wallet_a(), TEST_MASTER_CONTRACT, ether(1000), Bytes::new());
        fake.add_receipt(receipt_for(&tx, 1, vec![]));
        let block = block_with(100, 1_600_000_000, vec![tx.clone()]);

        let events = parser.parse_block(&block).await.unwrap();
        assert_eq!(
            events,
            vec![ChainAEvent::Deposit {
                tx_hash: tx.hash,
                timestamp_millis: 1_600_000_000_000,
                beneficiary_account: ALICE.to_string(),
                asset_id: ETH_ASSET_ID.to_string(),
                decimal_amount: "1000".to_string(),
                source_address: wallet_a(),
                anchor_origin: AnchorOrigin::ChainA,
            }]
        );
    }

    #[tokio::test]
    async fn test_zero_failed_and_unknown_deposits_are_dropped() {
        let (_fixture, fake, parser) = setup();
        let zero = eth_tx(1, wallet_a(), TEST_MASTER_CONTRACT, U256::zero(), Bytes::new());
        let failed = eth_tx(2, wallet_a(), TEST_MASTER_CONTRACT, ether(1), Bytes::new());
        let stranger = eth_tx(
            3,
            EthAddress::repeat_byte(0xcc),
            TEST_MASTER_CONTRACT,
            ether(1),
            Bytes::new(),
        );
        let elsewhere = eth_tx(4, wallet_a(), EthAddress::repeat_byte(0xdd), ether(1), Bytes::new());
        for (tx, status) in [(&zero, 1), (&failed, 0), (&stranger, 1), (&elsewhere, 1)] {
            fake.add_receipt(receipt_for(tx, status, vec![]));
        }
        let block = block_with(7, 1, vec![zero, failed, stranger, elsewhere]);
        assert!(parser.parse_block(&block).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ether_deposit_to_relay_credits_relay_owner() {
        let (_fixture, fake, parser) = setup();
        let tx = eth_tx(
            1,
            EthAddress::repeat_byte(0xcc),
            relay_b(),
            ether(2),
            Bytes::new(),
        );
        fake.add_receipt(receipt_for(&tx, 1, vec![]));
        let events = parser
            .parse_block(&block_with(5, 1, vec![tx]))
            .await
            .unwrap();
        assert_eq!(
            deposit_amounts(&events),
            vec![(BOB.to_string(), ETH_ASSET_ID.to_string(), "2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_token_deposit_applies_precision() {
        let (_fixture, fake, parser) = setup();
        let tx = eth_tx(1, wallet_a(), token(), U256::zero(), Bytes::from(vec![0xa9, 0x05, 0x9c, 0xbb]));
        fake.add_receipt(receipt_for(
            &tx,
            1,
            vec![
                transfer_log(token(), wallet_a(), TEST_MASTER_CONTRACT, U256::from(1_500_000u64)),
                // zero amount
                transfer_log(token(), wallet_a(), TEST_MASTER_CONTRACT, U256::zero()),
                // unknown sender
                transfer_log(
                    token(),
                    EthAddress::repeat_byte(0xcc),
                    TEST_MASTER_CONTRACT,
                    U256::from(1u64),
                ),
                // log of another contract
                transfer_log(
                    EthAddress::repeat_byte(0x71),
                    wallet_a(),
                    TEST_MASTER_CONTRACT,
                    U256::from(1u64),
                ),
            ],
        ));
        let events = parser
            .parse_block(&block_with(5, 1, vec![tx]))
            .await
            .unwrap();
        assert_eq!(
            deposit_amounts(&events),
            vec![(ALICE.to_string(), TOKEN_ASSET.to_string(), "1.5".to_string())]
        );
    }

    #[tokio::test]
    async fn test_withdrawal_finalized_from_master_call() {
        let (_fixture, fake, parser) = setup();
        let trigger = H256::repeat_byte(0x42);
        let input = master_function(WITHDRAW_METHOD)
            .unwrap()
            .encode_input(&[
                Token::Address(token()),
                Token::Uint(U256::from(5u64)),
                Token::Address(wallet_a()),
                Token::FixedBytes(trigger.as_bytes().to_vec()),
                Token::Array(vec![]),
                Token::Array(vec![]),
                Token::Array(vec![]),
                Token::Address(relay_b()),
            ])
            .unwrap();
        let mut tx = eth_tx(1, wallet_a(), TEST_MASTER_CONTRACT, U256::zero(), input.into());
        tx.transaction_index = Some(U64::from(3));
        let garbage = eth_tx(
            2,
            wallet_a(),
            TEST_MASTER_CONTRACT,
            U256::zero(),
            Bytes::from(vec![1, 2]),
        );
        fake.add_receipt(receipt_for(&tx, 1, vec![]));
        fake.add_receipt(receipt_for(&garbage, 1, vec![]));

        let events = parser
            .parse_block(&block_with(9, 1, vec![garbage, tx]))
            .await
            .unwrap();
        assert_eq!(
            events,
            vec![ChainAEvent::WithdrawalFinalized {
                trigger_tx_hash: trigger,
                block_number: 9,
                tx_index: 3,
            }]
        );
    }

    #[tokio::test]
    async fn test_missing_receipt_fails_whole_block() {
        let (_fixture, fake, parser) = setup();
        let ok = eth_tx(1, wallet_a(), TEST_MASTER_CONTRACT, ether(1), Bytes::new());
        let missing = eth_tx(2, wallet_a(), TEST_MASTER_CONTRACT, ether(1), Bytes::new());
        fake.add_receipt(receipt_for(&ok, 1, vec![]));
        let result = parser.parse_block(&block_with(3, 1, vec![ok, missing])).await;
        assert!(matches!(result, Err(BridgeError::ChainUnavailable(_))));
    }

    #[tokio::test]
    async fn test_redelivery_yields_identical_events() {
        let (fixture, fake, parser) = setup();
        let tx = eth_tx(1, wallet_a(), TEST_MASTER_CONTRACT, ether(3), Bytes::new());
        fake.add_receipt(receipt_for(&tx, 1, vec![]));
        let block = block_with(11, 2, vec![tx]);
        let first = parser.parse_block(&block).await.unwrap();

        // fresh registries over the same ledger
        let fresh = ChainAEventParser::new(
            TEST_MASTER_CONTRACT,
            fake.clone(),
            fixture.wallets(),
            fixture.relays(),
            fixture.assets(),
        );
        assert_eq!(fresh.parse_block(&block).await.unwrap(), first);
        assert_eq!(parser.parse_block(&block).await.unwrap(), first);
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn test_deposit_confirmed_after_lag_exactly_once() {
        let (_fixture, fake, parser) = setup();
        let deposit = eth_tx(1, wallet_a(), TEST_MASTER_CONTRACT, ether(1000), Bytes::new());
        fake.add_receipt(receipt_for(&deposit, 1, vec![]));
        for h in 90..=105 {
            if h == 100 {
                fake.add_block(block_with(100, 1_000, vec![deposit.clone()]));
            } else {
                fake.add_block(empty_block(h));
            }
        }
        fake.set_latest(105);

        let metrics = Arc::new(NotaryMetrics::new_for_testing());
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let handler = Arc::new(ChainAEventHandler::new(parser, events_tx, metrics.clone()));
        let config = ListenerConfig {
            start_block: 99,
            confirmation_lag: 2,
            ignore_start_block: false,
            poll_interval: Duration::from_millis(5),
            channel_size: 16,
            handler_max_retry_time: Duration::from_millis(50),
        };
        let mut listener = ChainAListener::new(
            config,
            fake.clone(),
            Arc::new(InMemoryCursorStore::default()),
            handler,
            metrics,
        )
        .await
        .unwrap();

        listener.on_head(100).await.unwrap();
        listener.on_head(101).await.unwrap();
        assert!(events_rx.try_recv().is_err());

        listener.on_head(102).await.unwrap();
        // redelivered head is a no-op
        listener.on_head(102).await.unwrap();
        listener.on_head(103).await.unwrap();

        let event = events_rx.try_recv().unwrap();
        assert_eq!(
            deposit_amounts(&[event]),
            vec![(ALICE.to_string(), ETH_ASSET_ID.to_string(), "1000".to_string())]
        );
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handled_block_refreshes_withdrawal_limit() {
        use crate::ledger::LedgerClient;
        use crate::withdrawal::limits::LIMIT_VALUE_KEY;
        use crate::withdrawal::WithdrawalLimitSettings;

        let (fixture, fake, parser) = setup();
        fixture.ledger.add_account("withdrawal_limits@notary", vec![], 1).unwrap();
        let xor = EthAddress::repeat_byte(0x71);
        fixture.register_ledger_token(xor, "xor#sora", 18);
        let exchange = EthAddress::repeat_byte(0xec);
        fake.set_token_balance(xor, exchange, U256::from(1000));
        let metrics = Arc::new(NotaryMetrics::new_for_testing());
        let limits = WithdrawalLimitProvider::new(
            WithdrawalLimitSettings {
                storage_account: "withdrawal_limits@notary".into(),
                asset_id: "xor#sora".into(),
                exchange_address: exchange,
                liquidity_divisor: 4,
                update_period: Duration::from_secs(3600),
            },
            fixture.withdrawal_submitter(),
            fake.clone(),
            fixture.assets(),
            metrics.clone(),
        )
        .await
        .unwrap();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let handler = ChainAEventHandler::new(parser, events_tx, metrics)
            .with_withdrawal_limits(Arc::new(limits));

        handler
            .handle_block(block_with(100, 1_600_000_000, vec![]))
            .await
            .unwrap();
        let stored = fixture
            .ledger
            .account_detail(
                "withdrawal_limits@notary",
                &fixture.accounts.withdrawal_trigger_account,
                LIMIT_VALUE_KEY,
            )
            .await
            .unwrap();
        assert_eq!(stored, Some("250".to_string()));
        let height = fixture.ledger.latest_height().await.unwrap();

        // an unreadable exchange balance is logged, the block still succeeds
        fake.set_unavailable(true);
        handler
            .handle_block(block_with(101, 1_600_009_000, vec![]))
            .await
            .unwrap();
        assert_eq!(fixture.ledger.latest_height().await.unwrap(), height);
    }
}
