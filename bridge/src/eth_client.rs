// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};
use crate::metered_eth_provider::{new_metered_eth_provider, MeteredEthHttpProvider};
use crate::metrics::NotaryMetrics;
use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as EthAddress, Block, Bytes, Transaction, TransactionReceipt, H256, U256};
use tap::TapFallible;

/// Read and write access to the Chain-A node on behalf of this notary's key.
#[async_trait]
pub trait ChainAClient: Send + Sync {
    async fn latest_block_number(&self) -> BridgeResult<u64>;

    async fn block_with_transactions(&self, number: u64) -> BridgeResult<Option<Block<Transaction>>>;

    async fn transaction_receipt(&self, tx_hash: H256) -> BridgeResult<Option<TransactionReceipt>>;

    /// Pending transaction count of `address`, i.e. its next nonce.
    async fn transaction_count(&self, address: EthAddress) -> BridgeResult<U256>;

    /// Sign `tx` with the notary key, broadcast it and wait for its receipt.
    async fn send_transaction(&self, tx: TypedTransaction) -> BridgeResult<TransactionReceipt>;

    async fn call(&self, tx: TypedTransaction) -> BridgeResult<Bytes>;

    fn signer_address(&self) -> EthAddress;
}

pub struct EthClient<P> {
    provider: Provider<P>,
    wallet: LocalWallet,
}

impl EthClient<MeteredEthHttpProvider> {
    pub async fn new(
        provider_url: &str,
        wallet: LocalWallet,
        metrics: Arc<NotaryMetrics>,
        expected_chain_id: Option<u64>,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        let provider = new_metered_eth_provider(provider_url, metrics)?.interval(poll_interval);
        let chain_id = provider.get_chainid().await?.as_u64();
        if let Some(expected) = expected_chain_id {
            if chain_id != expected {
                return Err(anyhow::anyhow!(
                    "Chain ID mismatch: expected {}, got {}. This could indicate connecting to the wrong network!",
                    expected,
                    chain_id
                ));
            }
        }
        let self_ = Self {
            provider,
            wallet: wallet.with_chain_id(chain_id),
        };
        self_.describe(chain_id, expected_chain_id.is_some()).await?;
        Ok(self_)
    }
}

#[cfg(test)]
impl EthClient<ethers::providers::MockProvider> {
    pub fn new_mocked(provider: ethers::providers::MockProvider, wallet: LocalWallet) -> Self {
        Self {
            provider: Provider::new(provider),
            wallet,
        }
    }
}

impl<P> EthClient<P>
where
    P: JsonRpcClient + 'static,
{
    async fn describe(&self, chain_id: u64, verified: bool) -> anyhow::Result<()> {
        let block_number = self.provider.get_block_number().await?;
        if verified {
            tracing::info!(
                "[EthClient] Connected to chain {} (verified) as {:?}, current block: {}",
                chain_id,
                self.wallet.address(),
                block_number
            );
        } else {
            tracing::warn!(
                "[EthClient] Connected to chain {} (NOT VERIFIED - no expected chain ID set) as {:?}, current block: {}",
                chain_id,
                self.wallet.address(),
                block_number
            );
        }
        Ok(())
    }
}

fn unavailable(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::ChainUnavailable(e.to_string())
}

#[async_trait]
impl<P> ChainAClient for EthClient<P>
where
    P: JsonRpcClient + 'static,
{
    async fn latest_block_number(&self) -> BridgeResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(unavailable)
    }

    async fn block_with_transactions(&self, number: u64) -> BridgeResult<Option<Block<Transaction>>> {
        self.provider
            .get_block_with_txs(number)
            .await
            .map_err(unavailable)
            .tap_err(|e| tracing::error!("[EthClient] Failed to fetch block {}: {:?}", number, e))
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> BridgeResult<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(unavailable)
    }

    async fn transaction_count(&self, address: EthAddress) -> BridgeResult<U256> {
        self.provider
            .get_transaction_count(address, Some(ethers::types::BlockNumber::Pending.into()))
            .await
            .map_err(unavailable)
    }

    async fn send_transaction(&self, mut tx: TypedTransaction) -> BridgeResult<TransactionReceipt> {
        tx.set_from(self.wallet.address());
        tx.set_chain_id(self.wallet.chain_id());
        self.provider
            .fill_transaction(&mut tx, None)
            .await
            .map_err(|e| BridgeError::ProviderError(format!("fill transaction: {}", e)))?;
        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| BridgeError::InternalError(format!("sign transaction: {}", e)))?;
        let pending = self
            .provider
            .send_raw_transaction(tx.rlp_signed(&signature))
            .await
            .map_err(|e| BridgeError::ProviderError(format!("send transaction: {}", e)))?;
        let tx_hash = pending.tx_hash();
        tracing::info!(
            "[EthClient] Sent transaction {:?} with nonce {:?}",
            tx_hash,
            tx.nonce()
        );
        pending
            .await
            .map_err(|e| BridgeError::ProviderError(format!("await receipt: {}", e)))?
            .ok_or_else(|| BridgeError::ChainATxFailed(format!("transaction {:?} dropped", tx_hash)))
    }

    async fn call(&self, tx: TypedTransaction) -> BridgeResult<Bytes> {
        self.provider.call(&tx, None).await.map_err(unavailable)
    }

    fn signer_address(&self) -> EthAddress {
        self.wallet.address()
    }
}
