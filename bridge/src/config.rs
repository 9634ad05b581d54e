// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::crypto::parse_eth_address;
use crate::eth_client::EthClient;
use crate::metered_eth_provider::MeteredEthHttpProvider;
use crate::metrics::NotaryMetrics;
use crate::registry::DetailSpace;
use crate::types::ETH_ASSET_ID;
use crate::withdrawal::WithdrawalLimitSettings;
use anyhow::anyhow;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address as EthAddress;
use notary_bridge_config::Config;
use notary_bridge_keys::keypair_file::read_wallet;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainAConfig {
    // Rpc url of the Chain-A fullnode.
    pub rpc_url: String,
    // Address of the master contract holding the bridged funds.
    pub master_contract_address: String,
    // When set, the node refuses to start against a different chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    // First block to scan when no cursor has been stored yet.
    pub start_block: u64,
    // Number of blocks the listener stays behind the chain head.
    pub confirmation_lag: u64,
    // Start from the current chain head regardless of the stored cursor.
    #[serde(default)]
    pub ignore_start_block: bool,
    // Plain-text file holding the last processed block height.
    pub cursor_file_path: PathBuf,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval: Duration,
}

/// A ledger account-detail key space: the account the values are stored on
/// and the account allowed to write them.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct DetailSpaceConfig {
    pub storage_account: String,
    pub setter_account: String,
}

impl DetailSpaceConfig {
    fn new(storage_account: &str, setter_account: &str) -> Self {
        Self {
            storage_account: storage_account.to_string(),
            setter_account: setter_account.to_string(),
        }
    }

    pub fn to_space(&self) -> DetailSpace {
        DetailSpace::new(&self.storage_account, &self.setter_account)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LedgerAccountsConfig {
    // Multi-signature account shared by the notaries.
    pub notary_account: String,
    // Transfers to this account trigger withdrawals to Chain A.
    pub withdrawal_trigger_account: String,
    // Receives the fees of finalized withdrawals.
    pub withdrawal_billing_account: String,
    pub wallets: DetailSpaceConfig,
    pub relays: DetailSpaceConfig,
    pub chain_a_tokens: DetailSpaceConfig,
    pub ledger_tokens: DetailSpaceConfig,
    pub notary_list: DetailSpaceConfig,
    pub expansion_trigger_account: String,
    pub expansion_trigger_creator: String,
    pub registration_trigger_account: String,
    // Domain of the per-withdrawal proof accounts.
    pub withdrawal_proof_domain: String,
}

impl Default for LedgerAccountsConfig {
    fn default() -> Self {
        Self {
            notary_account: "notary@notary".to_string(),
            withdrawal_trigger_account: "withdrawal@notary".to_string(),
            withdrawal_billing_account: "withdrawal_billing@notary".to_string(),
            wallets: DetailSpaceConfig::new("notary@notary", "eth_registration_service@notary"),
            relays: DetailSpaceConfig::new("notary@notary", "eth_relay_registry@notary"),
            chain_a_tokens: DetailSpaceConfig::new(
                "eth_anchored_token_storage@notary",
                "superuser@bootstrap",
            ),
            ledger_tokens: DetailSpaceConfig::new(
                "iroha_anchored_token_storage@notary",
                "superuser@bootstrap",
            ),
            notary_list: DetailSpaceConfig::new("notaries@notary", "notary@notary"),
            expansion_trigger_account: "eth_expansion_trigger@notary".to_string(),
            expansion_trigger_creator: "superuser@bootstrap".to_string(),
            registration_trigger_account: "eth_registration_service@notary".to_string(),
            withdrawal_proof_domain: "ethWithdrawalProof".to_string(),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProofCollectorConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "per-peer-timeout-ms")]
    pub per_peer_timeout: Duration,
}

impl Default for ProofCollectorConfig {
    fn default() -> Self {
        Self {
            per_peer_timeout: Duration::from_secs(10),
        }
    }
}

/// Publishing of the withdrawal limit of one Chain-A token, derived from the
/// liquidity an exchange holds.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WithdrawalLimitsConfig {
    // Account the limit and its next update time are stored on.
    pub storage_account: String,
    // Ledger id of the limited token, e.g. "xor#sora".
    pub asset_id: String,
    pub exchange_address: String,
    // limit = exchange balance / divisor
    pub liquidity_divisor: u64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "update-period-ms")]
    pub update_period: Duration,
}

impl WithdrawalLimitsConfig {
    fn validate(&self) -> anyhow::Result<WithdrawalLimitSettings> {
        let exchange_address = parse_eth_address(&self.exchange_address).map_err(|e| {
            anyhow!(
                "Invalid withdrawal-limits exchange address {:?}: {}",
                self.exchange_address,
                e
            )
        })?;
        if self.liquidity_divisor == 0 {
            return Err(anyhow!("withdrawal-limits liquidity-divisor must be positive"));
        }
        if self.update_period.is_zero() {
            return Err(anyhow!("withdrawal-limits update-period-ms must be positive"));
        }
        if self.asset_id == ETH_ASSET_ID {
            return Err(anyhow!(
                "withdrawal-limits asset must be a token, not {}",
                ETH_ASSET_ID
            ));
        }
        Ok(WithdrawalLimitSettings {
            storage_account: self.storage_account.clone(),
            asset_id: self.asset_id.clone(),
            exchange_address,
            liquidity_divisor: self.liquidity_divisor,
            update_period: self.update_period,
        })
    }
}

fn default_ledger_block_channel_size() -> usize {
    1000
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NotaryNodeConfig {
    // The port that the signing server listens on.
    pub server_listen_port: u16,
    // The port of the metrics server.
    pub metrics_port: u16,
    // Name this notary is listed under in the peer list.
    pub notary_name: String,
    // Path of the file where the notary secp256k1 key is stored.
    pub notary_key_path: PathBuf,
    pub chain_a: ChainAConfig,
    #[serde(default)]
    pub ledger: LedgerAccountsConfig,
    #[serde(default)]
    pub proof_collector: ProofCollectorConfig,
    // Whether this node collects proofs and submits withdrawals to Chain A.
    #[serde(default)]
    pub withdrawal_service: bool,
    // Whether this node submits add-peer calls to Chain A.
    #[serde(default)]
    pub expansion_submitter: bool,
    #[serde(default = "default_ledger_block_channel_size")]
    pub ledger_block_channel_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawal_limits: Option<WithdrawalLimitsConfig>,
}

impl Config for NotaryNodeConfig {}

impl NotaryNodeConfig {
    pub async fn validate(&self, metrics: Arc<NotaryMetrics>) -> anyhow::Result<NotaryServerConfig> {
        info!("Starting config validation");
        let wallet = read_wallet(&self.notary_key_path).map_err(|e| {
            anyhow!(
                "Failed to read notary key from {:?}: {}. \
                You can generate a new key using: notary-keygen --output <path>",
                self.notary_key_path,
                e
            )
        })?;
        info!("Loaded notary key for Chain-A address {:?}", wallet.address());

        let master_contract_address = parse_eth_address(&self.chain_a.master_contract_address)
            .map_err(|e| {
                anyhow!(
                    "Invalid master contract address {:?}: {}",
                    self.chain_a.master_contract_address,
                    e
                )
            })?;
        if self.chain_a.poll_interval.is_zero() {
            return Err(anyhow!("chain-a poll-interval-ms must be positive"));
        }
        if self.ledger_block_channel_size == 0 {
            return Err(anyhow!("ledger-block-channel-size must be positive"));
        }
        if self.ledger.notary_account.is_empty() || !self.ledger.notary_account.contains('@') {
            return Err(anyhow!(
                "Invalid notary account {:?}",
                self.ledger.notary_account
            ));
        }
        // peers are added to the list by the notary multisig itself
        if self.ledger.notary_list.setter_account != self.ledger.notary_account {
            return Err(anyhow!(
                "notary-list setter-account {:?} must be the notary account {:?}",
                self.ledger.notary_list.setter_account,
                self.ledger.notary_account
            ));
        }
        let withdrawal_limits = self
            .withdrawal_limits
            .as_ref()
            .map(WithdrawalLimitsConfig::validate)
            .transpose()?;

        let chain_a_client = Arc::new(
            EthClient::<MeteredEthHttpProvider>::new(
                &self.chain_a.rpc_url,
                wallet.clone(),
                metrics,
                self.chain_a.chain_id,
                self.chain_a.poll_interval,
            )
            .await?,
        );
        info!("Chain-A client setup complete");

        Ok(NotaryServerConfig {
            wallet,
            notary_name: self.notary_name.clone(),
            server_listen_port: self.server_listen_port,
            metrics_port: self.metrics_port,
            master_contract_address,
            chain_a_client,
            chain_a: self.chain_a.clone(),
            ledger: self.ledger.clone(),
            proof_collector: self.proof_collector.clone(),
            withdrawal_service: self.withdrawal_service,
            expansion_submitter: self.expansion_submitter,
            ledger_block_channel_size: self.ledger_block_channel_size,
            withdrawal_limits,
        })
    }
}

pub struct NotaryServerConfig {
    pub wallet: LocalWallet,
    pub notary_name: String,
    pub server_listen_port: u16,
    pub metrics_port: u16,
    pub master_contract_address: EthAddress,
    pub chain_a_client: Arc<EthClient<MeteredEthHttpProvider>>,
    pub chain_a: ChainAConfig,
    pub ledger: LedgerAccountsConfig,
    pub proof_collector: ProofCollectorConfig,
    pub withdrawal_service: bool,
    pub expansion_submitter: bool,
    pub ledger_block_channel_size: usize,
    pub withdrawal_limits: Option<WithdrawalLimitSettings>,
}
