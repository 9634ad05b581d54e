// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::crypto::{Vrs, VrsSignature};
use ethers::types::{Address as EthAddress, H256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Native Chain-A coin; never looked up in the asset registry.
pub const ETH_ASSET_ID: &str = "ether#ethereum";
pub const ETH_PRECISION: u32 = 18;
pub const ETH_ADDRESS: EthAddress = ethers::types::H160([0u8; 20]);

// ledger account detail keys
pub const REGISTER_WALLET_KEY: &str = "register_wallet";
pub const FAILED_REGISTRATION_KEY: &str = "failed_registration";
pub const ETH_ADDRESS_KEY: &str = "eth_address";
pub const NOTARY_NAME_KEY: &str = "notary_name";
pub const NOTARY_ENDPOINT_KEY: &str = "notary_endpoint";

pub const ROLLBACK_DESCRIPTION: &str = "Ethereum rollback";
// fee transfers ride along withdrawals and are never withdrawn themselves
pub const FEE_DESCRIPTION: &str = "transfer fee";
// appended to the trigger hash to form a withdrawal acknowledgement id
pub const WITHDRAWAL_ACK_SUFFIX: &str = "_withdrawal_ack";

/// Where an asset's value originates. Chain-A anchored assets leave through
/// `withdraw`; ledger anchored ones are minted on Chain A through
/// `mintTokensByPeers`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnchorOrigin {
    ChainA,
    Ledger,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainAEvent {
    Deposit {
        tx_hash: H256,
        timestamp_millis: u64,
        beneficiary_account: String,
        asset_id: String,
        decimal_amount: String,
        source_address: EthAddress,
        anchor_origin: AnchorOrigin,
    },
    WithdrawalFinalized {
        trigger_tx_hash: H256,
        block_number: u64,
        tx_index: u64,
    },
}

impl ChainAEvent {
    pub fn tx_hash(&self) -> Option<H256> {
        match self {
            ChainAEvent::Deposit { tx_hash, .. } => Some(*tx_hash),
            ChainAEvent::WithdrawalFinalized { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetRecord {
    pub asset_id: String,
    pub contract_address: EthAddress,
    pub precision: u32,
    pub anchor_origin: AnchorOrigin,
}

/// Parallel `(v, r, s)` arrays in the order signatures arrived, as the master
/// contract's verifier takes them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignatureBundle {
    pub v: Vec<u8>,
    pub r: Vec<[u8; 32]>,
    pub s: Vec<[u8; 32]>,
}

impl SignatureBundle {
    pub fn push(&mut self, vrs: &Vrs) {
        self.v.push(vrs.v);
        self.r.push(vrs.r);
        self.s.push(vrs.s);
    }

    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    pub fn contains(&self, vrs: &Vrs) -> bool {
        self.r
            .iter()
            .zip(self.s.iter())
            .any(|(r, s)| *r == vrs.r && *s == vrs.s)
    }
}

/// One notary's published withdrawal attestation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalProofRecord {
    pub account_id: String,
    pub token_contract_address: String,
    pub amount: String,
    pub beneficiary: String,
    pub iroha_hash: String,
    pub relay: String,
    pub signature: VrsSignature,
}

/// Payload of a ledger expansion trigger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpansionDetails {
    pub account_id_to_expand: String,
    pub public_key: String,
    pub quorum: u32,
    #[serde(default)]
    pub additional_data: BTreeMap<String, String>,
}

impl ExpansionDetails {
    pub fn eth_address(&self) -> Option<&str> {
        self.additional_data.get(ETH_ADDRESS_KEY).map(String::as_str)
    }

    pub fn notary_name(&self) -> Option<&str> {
        self.additional_data.get(NOTARY_NAME_KEY).map(String::as_str)
    }

    pub fn notary_endpoint(&self) -> Option<&str> {
        self.additional_data
            .get(NOTARY_ENDPOINT_KEY)
            .map(String::as_str)
    }
}

/// Body of every signing endpoint. Unknown `type` tags fail to deserialize.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EthNotaryResponse {
    Successful {
        #[serde(rename = "ethSignature")]
        eth_signature: String,
    },
    Error {
        reason: String,
    },
}

impl EthNotaryResponse {
    pub fn error(reason: impl Into<String>) -> Self {
        EthNotaryResponse::Error {
            reason: reason.into(),
        }
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, EthNotaryResponse::Successful { .. })
    }
}

/// Proof that a client controls a Chain-A key: a signature over the address
/// derived from `public_key`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthereumRegistrationProof {
    pub signature: VrsSignature,
    pub public_key: String,
}
