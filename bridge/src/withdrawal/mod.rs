// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ledger to Chain-A withdrawals: the attestation every notary computes for a
//! transfer into the withdrawal trigger account, the per-node proof
//! publication, the requester side state machine and the published
//! withdrawal limit.

use crate::crypto::{address_to_hex, hash_mint, hash_withdraw, parse_eth_address, VrsSignature};
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::{LedgerClient, LedgerCommand, LedgerTransaction, LedgerTxHash};
use crate::registry::{AddressRegistry, AssetRegistry};
use crate::types::{AnchorOrigin, WithdrawalProofRecord, FEE_DESCRIPTION, ROLLBACK_DESCRIPTION};
use crate::utils::scale_decimal;
use ethers::types::{Address as EthAddress, H256, U256};
use std::sync::Arc;
use tracing::debug;

pub mod limits;
pub mod pipeline;
pub mod proof_handler;

pub use limits::{WithdrawalLimitProvider, WithdrawalLimitSettings};
pub use pipeline::{WithdrawalAck, WithdrawalPipeline, WithdrawalState};
pub use proof_handler::{collect_published_proofs, proof_account_id, WithdrawalProofPublisher};

/// The fee a client paid to the trigger account next to its withdrawal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawalFee {
    pub asset_id: String,
    pub amount: String,
}

/// A ledger transfer into the withdrawal trigger account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawalRequest {
    pub trigger_hash: LedgerTxHash,
    pub src_account_id: String,
    pub asset_id: String,
    /// Decimal amount as written on the ledger.
    pub amount: String,
    pub beneficiary: EthAddress,
    pub fee: Option<WithdrawalFee>,
}

impl WithdrawalRequest {
    /// Build the request from the first non-fee transfer of `tx` into
    /// `trigger_account`. The transfer description carries the beneficiary.
    /// At most one fee transfer may come with it.
    pub fn from_transaction(
        trigger_hash: &str,
        tx: &LedgerTransaction,
        trigger_account: &str,
    ) -> BridgeResult<Self> {
        let (src_account_id, asset_id, description, amount) =
            withdrawal_transfer(tx, trigger_account).ok_or_else(|| {
                BridgeError::InvalidLedgerTransaction(format!(
                    "no transfer to {} in {}",
                    trigger_account, trigger_hash
                ))
            })?;
        let mut fees = fee_transfers(tx, trigger_account);
        if fees.len() > 1 {
            return Err(BridgeError::InvalidLedgerTransaction(format!(
                "{} pays {} fees",
                trigger_hash,
                fees.len()
            )));
        }
        Ok(Self {
            trigger_hash: trigger_hash.to_string(),
            src_account_id: src_account_id.to_string(),
            asset_id: asset_id.to_string(),
            amount: amount.to_string(),
            beneficiary: parse_eth_address(description)?,
            fee: fees.pop(),
        })
    }

    /// Transfers that hand everything the trigger account took in back to
    /// the client.
    pub fn refund_commands(&self, trigger_account: &str) -> Vec<LedgerCommand> {
        let refund = |asset_id: &str, amount: &str| LedgerCommand::TransferAsset {
            src_account_id: trigger_account.to_string(),
            dest_account_id: self.src_account_id.clone(),
            asset_id: asset_id.to_string(),
            description: ROLLBACK_DESCRIPTION.to_string(),
            amount: amount.to_string(),
        };
        let mut commands = vec![refund(&self.asset_id, &self.amount)];
        if let Some(fee) = &self.fee {
            commands.push(refund(&fee.asset_id, &fee.amount));
        }
        commands
    }

    /// Burn the withdrawn amount and pass the fee on to `billing_account`.
    pub fn finalization_commands(
        &self,
        trigger_account: &str,
        billing_account: &str,
    ) -> Vec<LedgerCommand> {
        let mut commands = vec![LedgerCommand::SubtractAssetQuantity {
            asset_id: self.asset_id.clone(),
            amount: self.amount.clone(),
        }];
        if let Some(fee) = &self.fee {
            commands.push(LedgerCommand::TransferAsset {
                src_account_id: trigger_account.to_string(),
                dest_account_id: billing_account.to_string(),
                asset_id: fee.asset_id.clone(),
                description: FEE_DESCRIPTION.to_string(),
                amount: fee.amount.clone(),
            });
        }
        commands
    }
}

fn fee_transfers(tx: &LedgerTransaction, trigger_account: &str) -> Vec<WithdrawalFee> {
    tx.commands
        .iter()
        .filter_map(|command| match command {
            LedgerCommand::TransferAsset {
                dest_account_id,
                asset_id,
                description,
                amount,
                ..
            } if dest_account_id == trigger_account && description == FEE_DESCRIPTION => {
                Some(WithdrawalFee {
                    asset_id: asset_id.clone(),
                    amount: amount.clone(),
                })
            }
            _ => None,
        })
        .collect()
}

/// `(source, asset, description, amount)` of the first transfer into
/// `trigger_account`, fee transfers excluded.
pub fn withdrawal_transfer<'a>(
    tx: &'a LedgerTransaction,
    trigger_account: &str,
) -> Option<(&'a str, &'a str, &'a str, &'a str)> {
    tx.commands.iter().find_map(|command| match command {
        LedgerCommand::TransferAsset {
            src_account_id,
            dest_account_id,
            asset_id,
            description,
            amount,
        } if dest_account_id == trigger_account && description != FEE_DESCRIPTION => Some((
            src_account_id.as_str(),
            asset_id.as_str(),
            description.as_str(),
            amount.as_str(),
        )),
        _ => None,
    })
}

/// Everything a notary signs for one withdrawal, plus the resolved call
/// arguments for the master contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawalAttestation {
    pub request: WithdrawalRequest,
    pub token: EthAddress,
    pub raw_amount: U256,
    pub relay: EthAddress,
    pub anchor_origin: AnchorOrigin,
    pub hash: H256,
}

impl WithdrawalAttestation {
    pub fn proof_record(&self, signature: VrsSignature) -> WithdrawalProofRecord {
        WithdrawalProofRecord {
            account_id: self.request.src_account_id.clone(),
            token_contract_address: address_to_hex(&self.token),
            amount: self.raw_amount.to_string(),
            beneficiary: address_to_hex(&self.request.beneficiary),
            iroha_hash: self.request.trigger_hash.clone(),
            relay: address_to_hex(&self.relay),
            signature,
        }
    }
}

/// Computes withdrawal attestations from this node's view of the ledger.
/// The signing endpoint, the proof publisher and the pipeline share one
/// instance so they always agree on the relay and the amount.
pub struct WithdrawalAttestor {
    ledger: Arc<dyn LedgerClient>,
    trigger_account: String,
    assets: Arc<AssetRegistry>,
    relays: Arc<AddressRegistry>,
}

impl WithdrawalAttestor {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        trigger_account: impl Into<String>,
        assets: Arc<AssetRegistry>,
        relays: Arc<AddressRegistry>,
    ) -> Self {
        Self {
            ledger,
            trigger_account: trigger_account.into(),
            assets,
            relays,
        }
    }

    pub fn trigger_account(&self) -> &str {
        &self.trigger_account
    }

    /// Load the ledger transaction `trigger_hash` and extract its withdrawal.
    pub async fn request_for(&self, trigger_hash: &str) -> BridgeResult<WithdrawalRequest> {
        let tx = self
            .ledger
            .transaction(trigger_hash)
            .await?
            .ok_or_else(|| BridgeError::LedgerTxNotFound(trigger_hash.to_string()))?;
        WithdrawalRequest::from_transaction(trigger_hash, &tx, &self.trigger_account)
    }

    pub async fn attest(&self, request: &WithdrawalRequest) -> BridgeResult<WithdrawalAttestation> {
        let record = self.assets.record_of(&request.asset_id).await?;
        let raw_amount = scale_decimal(&request.amount, record.precision)?;
        let relay = self
            .relays
            .resolve_reverse(&request.src_account_id)
            .await?
            .unwrap_or(request.beneficiary);
        let hash_fn = match record.anchor_origin {
            AnchorOrigin::ChainA => hash_withdraw,
            AnchorOrigin::Ledger => hash_mint,
        };
        let hash = hash_fn(
            &address_to_hex(&record.contract_address),
            &raw_amount.to_string(),
            &address_to_hex(&request.beneficiary),
            &request.trigger_hash,
            &address_to_hex(&relay),
        )?;
        debug!(
            "[WithdrawalAttestor] {} of {} {} to {:?} via relay {:?}: {:?}",
            request.trigger_hash, request.amount, request.asset_id, request.beneficiary, relay, hash
        );
        Ok(WithdrawalAttestation {
            request: request.clone(),
            token: record.contract_address,
            raw_amount,
            relay,
            anchor_origin: record.anchor_origin,
            hash,
        })
    }
}
