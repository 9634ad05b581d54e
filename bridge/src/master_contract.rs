// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::abi::{master_function, ADD_PEER_METHOD, MINT_METHOD, PEERS_METHOD, WITHDRAW_METHOD};
use crate::error::{BridgeError, BridgeResult};
use crate::eth_client::ChainAClient;
use crate::eth_transaction_manager::ChainATransactionManager;
use crate::types::SignatureBundle;
use ethers::abi::Token;
use ethers::types::{Address as EthAddress, Bytes, TransactionReceipt, TransactionRequest, H256, U256, U64};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Calls into the master contract. Every state changing call takes its nonce
/// from the shared transaction manager.
pub struct MasterContract {
    address: EthAddress,
    client: Arc<dyn ChainAClient>,
    nonces: Arc<ChainATransactionManager>,
}

fn bundle_tokens(bundle: &SignatureBundle) -> [Token; 3] {
    [
        Token::Array(bundle.v.iter().map(|v| Token::Uint(U256::from(*v))).collect()),
        Token::Array(bundle.r.iter().map(|r| Token::FixedBytes(r.to_vec())).collect()),
        Token::Array(bundle.s.iter().map(|s| Token::FixedBytes(s.to_vec())).collect()),
    ]
}

impl MasterContract {
    pub fn new(address: EthAddress, nonces: Arc<ChainATransactionManager>) -> Self {
        Self {
            address,
            client: nonces.client().clone(),
            nonces,
        }
    }

    pub fn address(&self) -> EthAddress {
        self.address
    }

    pub async fn withdraw(
        &self,
        token: EthAddress,
        amount: U256,
        beneficiary: EthAddress,
        trigger_hash: H256,
        bundle: &SignatureBundle,
        relay: EthAddress,
    ) -> BridgeResult<TransactionReceipt> {
        self.transfer_call(WITHDRAW_METHOD, token, amount, beneficiary, trigger_hash, bundle, relay)
            .await
    }

    pub async fn mint_tokens_by_peers(
        &self,
        token: EthAddress,
        amount: U256,
        beneficiary: EthAddress,
        trigger_hash: H256,
        bundle: &SignatureBundle,
        relay: EthAddress,
    ) -> BridgeResult<TransactionReceipt> {
        self.transfer_call(MINT_METHOD, token, amount, beneficiary, trigger_hash, bundle, relay)
            .await
    }

    pub async fn add_peer_by_peer(
        &self,
        peer: EthAddress,
        trigger_hash: H256,
        bundle: &SignatureBundle,
    ) -> BridgeResult<TransactionReceipt> {
        let [v, r, s] = bundle_tokens(bundle);
        let data = master_function(ADD_PEER_METHOD)?
            .encode_input(&[
                Token::Address(peer),
                Token::FixedBytes(trigger_hash.as_bytes().to_vec()),
                v,
                r,
                s,
            ])
            .map_err(|e| BridgeError::BridgeSerializationError(e.to_string()))?;
        self.send(ADD_PEER_METHOD, data.into()).await
    }

    pub async fn is_peer(&self, address: EthAddress) -> BridgeResult<bool> {
        let function = master_function(PEERS_METHOD)?;
        let data = function
            .encode_input(&[Token::Address(address)])
            .map_err(|e| BridgeError::BridgeSerializationError(e.to_string()))?;
        let tx = TransactionRequest::new().to(self.address).data(data);
        let output = self.client.call(tx.into()).await?;
        match function
            .decode_output(&output)
            .map_err(|e| BridgeError::BridgeSerializationError(e.to_string()))?
            .as_slice()
        {
            [Token::Bool(is_peer)] => Ok(*is_peer),
            other => Err(BridgeError::BridgeSerializationError(format!(
                "unexpected peers() output: {:?}",
                other
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer_call(
        &self,
        method: &'static str,
        token: EthAddress,
        amount: U256,
        beneficiary: EthAddress,
        trigger_hash: H256,
        bundle: &SignatureBundle,
        relay: EthAddress,
    ) -> BridgeResult<TransactionReceipt> {
        let [v, r, s] = bundle_tokens(bundle);
        let data = master_function(method)?
            .encode_input(&[
                Token::Address(token),
                Token::Uint(amount),
                Token::Address(beneficiary),
                Token::FixedBytes(trigger_hash.as_bytes().to_vec()),
                v,
                r,
                s,
                Token::Address(relay),
            ])
            .map_err(|e| BridgeError::BridgeSerializationError(e.to_string()))?;
        self.send(method, data.into()).await
    }

    async fn send(&self, method: &str, data: Bytes) -> BridgeResult<TransactionReceipt> {
        let nonce = self.nonces.next_nonce().await?;
        let tx = TransactionRequest::new()
            .to(self.address)
            .data(data)
            .nonce(nonce);
        match self.client.send_transaction(tx.into()).await {
            Ok(receipt) if receipt.status == Some(U64::from(1)) => {
                info!(
                    "[MasterContract] {} succeeded in tx {:?}",
                    method, receipt.transaction_hash
                );
                Ok(receipt)
            }
            Ok(receipt) => {
                error!(
                    "[MasterContract] {} reverted in tx {:?}",
                    method, receipt.transaction_hash
                );
                Err(BridgeError::ChainATxFailed(format!(
                    "{} reverted in tx {:?}",
                    method, receipt.transaction_hash
                )))
            }
            Err(e) => {
                error!("[MasterContract] {} failed with nonce {}: {:?}", method, nonce, e);
                if let Err(reset_err) = self.nonces.reset_nonce().await {
                    warn!("[MasterContract] Nonce reset after failed send failed: {:?}", reset_err);
                }
                Err(e)
            }
        }
    }
}
