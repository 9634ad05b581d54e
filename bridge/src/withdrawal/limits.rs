// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Withdrawal limit of one asset, derived from the token liquidity an
//! exchange holds on Chain A and republished to the ledger once per period.
//!
//! Every node races to publish the next period. The update time is written
//! with compare-and-set, so only the first writer of a period gets through and
//! the others reload the time it stored.

use crate::abi::{erc20_function, BALANCE_OF_METHOD};
use crate::error::{BridgeError, BridgeResult};
use crate::eth_client::ChainAClient;
use crate::ledger::{LedgerCommand, LedgerSubmitter};
use crate::metrics::NotaryMetrics;
use crate::registry::AssetRegistry;
use crate::utils::render_decimal;
use ethers::abi::Token;
use ethers::types::{Address as EthAddress, TransactionRequest, U256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LIMIT_TIME_KEY: &str = "withdrawal_limit_time";
pub const LIMIT_VALUE_KEY: &str = "withdrawal_limit_value";
// fractional digits of the published limit, rounded half up
const LIMIT_PRECISION: u32 = 18;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawalLimitSettings {
    pub storage_account: String,
    pub asset_id: String,
    pub exchange_address: EthAddress,
    pub liquidity_divisor: u64,
    pub update_period: Duration,
}

/// `liquidity / divisor` in the token's base units, rounded half up to
/// `LIMIT_PRECISION` fractional digits.
pub fn limit_from_liquidity(liquidity: U256, divisor: u64) -> BridgeResult<String> {
    if divisor == 0 {
        return Err(BridgeError::InvalidAmount("limit divisor is zero".into()));
    }
    let divisor = U256::from(divisor);
    let scaled = liquidity
        .checked_mul(U256::exp10(LIMIT_PRECISION as usize))
        .and_then(|v| v.checked_mul(U256::from(2u8)))
        .and_then(|v| v.checked_add(divisor))
        .ok_or_else(|| BridgeError::InvalidAmount(format!("liquidity {} overflows", liquidity)))?;
    render_decimal(scaled / (divisor * 2), LIMIT_PRECISION)
}

pub struct WithdrawalLimitProvider {
    settings: WithdrawalLimitSettings,
    // signs as the account the limit details are read back under
    submitter: Arc<LedgerSubmitter>,
    chain_a: Arc<dyn ChainAClient>,
    assets: Arc<AssetRegistry>,
    // millis; 0 until a limit was ever published
    next_update: AtomicU64,
    metrics: Arc<NotaryMetrics>,
}

impl WithdrawalLimitProvider {
    pub async fn new(
        settings: WithdrawalLimitSettings,
        submitter: Arc<LedgerSubmitter>,
        chain_a: Arc<dyn ChainAClient>,
        assets: Arc<AssetRegistry>,
        metrics: Arc<NotaryMetrics>,
    ) -> BridgeResult<Self> {
        let provider = Self {
            settings,
            submitter,
            chain_a,
            assets,
            next_update: AtomicU64::new(0),
            metrics,
        };
        provider.reload_update_time().await?;
        info!(
            "[WithdrawalLimits] Tracking {} liquidity held by {:?}, next update at {}",
            provider.settings.asset_id,
            provider.settings.exchange_address,
            provider.next_update_millis()
        );
        Ok(provider)
    }

    pub fn next_update_millis(&self) -> u64 {
        self.next_update.load(Ordering::SeqCst)
    }

    async fn reload_update_time(&self) -> BridgeResult<u64> {
        let stored = self
            .submitter
            .client()
            .account_detail(
                &self.settings.storage_account,
                self.submitter.creator(),
                LIMIT_TIME_KEY,
            )
            .await?;
        let time = match stored {
            Some(value) => value.parse::<u64>().map_err(|e| {
                BridgeError::LedgerError(format!("stored limit time {:?}: {}", value, e))
            })?,
            None => 0,
        };
        self.next_update.store(time, Ordering::SeqCst);
        Ok(time)
    }

    /// Publish a fresh limit when a Chain-A block stamped `block_millis`
    /// reaches the next update time. Returns the limit this node wrote.
    pub async fn on_block(&self, block_millis: u64) -> BridgeResult<Option<String>> {
        if block_millis < self.next_update_millis() {
            return Ok(None);
        }
        let limit = limit_from_liquidity(
            self.exchange_liquidity().await?,
            self.settings.liquidity_divisor,
        )?;
        let next = block_millis + self.settings.update_period.as_millis() as u64;
        Ok(self.update_limit(next, &limit).await?.then_some(limit))
    }

    /// Token balance of the exchange on Chain A.
    pub async fn exchange_liquidity(&self) -> BridgeResult<U256> {
        let token = self.assets.contract_address_of(&self.settings.asset_id).await?;
        let function = erc20_function(BALANCE_OF_METHOD)?;
        let data = function
            .encode_input(&[Token::Address(self.settings.exchange_address)])
            .map_err(|e| BridgeError::BridgeSerializationError(e.to_string()))?;
        let output = self
            .chain_a
            .call(TransactionRequest::new().to(token).data(data).into())
            .await?;
        match function
            .decode_output(&output)
            .map_err(|e| BridgeError::BridgeSerializationError(e.to_string()))?
            .as_slice()
        {
            [Token::Uint(balance)] => Ok(*balance),
            other => Err(BridgeError::BridgeSerializationError(format!(
                "unexpected balanceOf() output: {:?}",
                other
            ))),
        }
    }

    /// Write `limit` valid until `next_update`. `false` means another node
    /// published this period first.
    pub async fn update_limit(&self, next_update: u64, limit: &str) -> BridgeResult<bool> {
        let previous = self.next_update_millis();
        debug!(
            "[WithdrawalLimits] Updating limit to {} until {}",
            limit, next_update
        );
        let result = self
            .submitter
            .send(vec![
                LedgerCommand::CompareAndSetAccountDetail {
                    account_id: self.settings.storage_account.clone(),
                    key: LIMIT_TIME_KEY.to_string(),
                    value: next_update.to_string(),
                    old_value: (previous != 0).then(|| previous.to_string()),
                },
                LedgerCommand::SetAccountDetail {
                    account_id: self.settings.storage_account.clone(),
                    key: LIMIT_VALUE_KEY.to_string(),
                    value: limit.to_string(),
                },
            ])
            .await;
        match result {
            Ok(hash) => {
                self.next_update.store(next_update, Ordering::SeqCst);
                self.metrics
                    .withdrawal_limit_updates
                    .with_label_values(&["updated"])
                    .inc();
                info!(
                    "[WithdrawalLimits] {} limit set to {} until {} in ledger tx {}",
                    self.settings.asset_id, limit, next_update, hash
                );
                Ok(true)
            }
            Err(e) => {
                self.metrics
                    .withdrawal_limit_updates
                    .with_label_values(&["lost_race"])
                    .inc();
                warn!(
                    "[WithdrawalLimits] Another node updated the limit first: {:?}",
                    e
                );
                self.reload_update_time().await?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerClient;
    use crate::test_utils::{test_ledger, FakeChainAClient, TestLedger};

    const STORAGE: &str = "withdrawal_limits@notary";
    const ASSET: &str = "xor#sora";
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn settings() -> WithdrawalLimitSettings {
        WithdrawalLimitSettings {
            storage_account: STORAGE.into(),
            asset_id: ASSET.into(),
            exchange_address: EthAddress::repeat_byte(0xec),
            liquidity_divisor: 4,
            update_period: DAY,
        }
    }

    async fn provider(
        fixture: &TestLedger,
        fake: Arc<FakeChainAClient>,
    ) -> WithdrawalLimitProvider {
        WithdrawalLimitProvider::new(
            settings(),
            fixture.withdrawal_submitter(),
            fake,
            fixture.assets(),
            Arc::new(NotaryMetrics::new_for_testing()),
        )
        .await
        .unwrap()
    }

    fn setup() -> (TestLedger, Arc<FakeChainAClient>) {
        let fixture = test_ledger();
        fixture.ledger.add_account(STORAGE, vec![], 1).unwrap();
        let token = EthAddress::repeat_byte(0x71);
        fixture.register_ledger_token(token, ASSET, 18);
        let fake = Arc::new(FakeChainAClient::new());
        fake.set_token_balance(token, EthAddress::repeat_byte(0xec), U256::from(1001));
        (fixture, fake)
    }

    async fn stored(fixture: &TestLedger, key: &str) -> Option<String> {
        fixture
            .ledger
            .account_detail(STORAGE, &fixture.accounts.withdrawal_trigger_account, key)
            .await
            .unwrap()
    }

    #[test]
    fn test_limit_rounds_half_up() {
        assert_eq!(limit_from_liquidity(U256::from(1000), 4).unwrap(), "250");
        assert_eq!(limit_from_liquidity(U256::from(1001), 4).unwrap(), "250.25");
        assert_eq!(
            limit_from_liquidity(U256::from(2), 3).unwrap(),
            "0.666666666666666667"
        );
        assert_eq!(limit_from_liquidity(U256::zero(), 3).unwrap(), "0");
        assert!(limit_from_liquidity(U256::from(1), 0).is_err());
        assert!(limit_from_liquidity(U256::MAX, 3).is_err());
    }

    #[tokio::test]
    async fn test_first_block_publishes_limit_and_next_time() {
        let (fixture, fake) = setup();
        let provider = provider(&fixture, fake).await;
        assert_eq!(provider.next_update_millis(), 0);

        let now = 1_700_000_000_000;
        assert_eq!(provider.on_block(now).await.unwrap(), Some("250.25".to_string()));
        let next = now + DAY.as_millis() as u64;
        assert_eq!(provider.next_update_millis(), next);
        assert_eq!(stored(&fixture, LIMIT_VALUE_KEY).await, Some("250.25".into()));
        assert_eq!(stored(&fixture, LIMIT_TIME_KEY).await, Some(next.to_string()));

        // nothing to do until the period ends
        let height = fixture.ledger.latest_height().await.unwrap();
        assert_eq!(provider.on_block(now + 1000).await.unwrap(), None);
        assert_eq!(fixture.ledger.latest_height().await.unwrap(), height);
    }

    #[tokio::test]
    async fn test_losing_node_adopts_the_winners_time() {
        let (fixture, fake) = setup();
        let winner = provider(&fixture, fake.clone()).await;
        let loser = provider(&fixture, fake.clone()).await;

        let now = 1_700_000_000_000;
        winner.on_block(now).await.unwrap();
        // the loser still believes no limit was ever written
        assert_eq!(loser.next_update_millis(), 0);
        assert_eq!(loser.on_block(now + 5).await.unwrap(), None);
        assert_eq!(loser.next_update_millis(), winner.next_update_millis());
        assert_eq!(stored(&fixture, LIMIT_VALUE_KEY).await, Some("250.25".into()));

        // a restarted node picks the stored time up
        let restarted = provider(&fixture, fake).await;
        assert_eq!(restarted.next_update_millis(), winner.next_update_millis());
    }
}
