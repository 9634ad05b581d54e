// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    // The input is not a valid transaction hash
    InvalidTxHash,
    // The input is not a valid Chain-A address
    InvalidAddress(String),
    // Amount is not a non-negative decimal that fits the target precision
    InvalidAmount(String),
    // Signature hex is malformed or too short
    InvalidSignatureEncoding(String),
    // Chain-A node could not be queried
    ChainUnavailable(String),
    // A head arrived that is not exactly one above the cursor
    OutOfOrderBlock { expected: u64, got: u64 },
    // Asset id is in neither the Chain-A nor the ledger anchored table
    AssetNotFound(String),
    // Every peer failed to provide a signature
    NoValidProof(String),
    // Ledger rejected a transaction or a query failed
    LedgerError(String),
    // The referenced ledger transaction does not exist
    LedgerTxNotFound(String),
    // The ledger transaction does not carry what the request claims
    InvalidLedgerTransaction(String),
    // A peer answered with a structured error body
    PeerRejected(String),
    // Chain-A transaction was mined with a failure status or never mined
    ChainATxFailed(String),
    // Registration proof does not recover to the claimed address
    InvalidRegistrationProof(String),
    // Chain-A provider error
    ProviderError(String),
    // The block listener was closed
    ListenerClosed,
    // Failure to serialize
    BridgeSerializationError(String),
    // Storage Error
    StorageError(String),
    // Rest API Error
    RestAPIError(String),
    // Internal Bridge error
    InternalError(String),
    // Uncategorized error
    Generic(String),
}

impl BridgeError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            BridgeError::InvalidTxHash => "invalid_tx_hash",
            BridgeError::InvalidAddress(_) => "invalid_address",
            BridgeError::InvalidAmount(_) => "invalid_amount",
            BridgeError::InvalidSignatureEncoding(_) => "invalid_signature_encoding",
            BridgeError::ChainUnavailable(_) => "chain_unavailable",
            BridgeError::OutOfOrderBlock { .. } => "out_of_order_block",
            BridgeError::AssetNotFound(_) => "asset_not_found",
            BridgeError::NoValidProof(_) => "no_valid_proof",
            BridgeError::LedgerError(_) => "ledger_error",
            BridgeError::LedgerTxNotFound(_) => "ledger_tx_not_found",
            BridgeError::InvalidLedgerTransaction(_) => "invalid_ledger_transaction",
            BridgeError::PeerRejected(_) => "peer_rejected",
            BridgeError::ChainATxFailed(_) => "chain_a_tx_failed",
            BridgeError::InvalidRegistrationProof(_) => "invalid_registration_proof",
            BridgeError::ProviderError(_) => "provider_error",
            BridgeError::ListenerClosed => "listener_closed",
            BridgeError::BridgeSerializationError(_) => "serialization_error",
            BridgeError::StorageError(_) => "storage_error",
            BridgeError::RestAPIError(_) => "rest_api_error",
            BridgeError::InternalError(_) => "internal_error",
            BridgeError::Generic(_) => "generic",
        }
    }

    /// Human readable reason used in `Error` response bodies.
    pub fn reason(&self) -> String {
        match self {
            BridgeError::OutOfOrderBlock { expected, got } => {
                format!("out of order block: expected {}, got {}", expected, got)
            }
            BridgeError::InvalidTxHash => "invalid transaction hash".to_string(),
            BridgeError::ListenerClosed => "listener closed".to_string(),
            BridgeError::InvalidAddress(s)
            | BridgeError::InvalidAmount(s)
            | BridgeError::InvalidSignatureEncoding(s)
            | BridgeError::ChainUnavailable(s)
            | BridgeError::AssetNotFound(s)
            | BridgeError::NoValidProof(s)
            | BridgeError::LedgerError(s)
            | BridgeError::LedgerTxNotFound(s)
            | BridgeError::InvalidLedgerTransaction(s)
            | BridgeError::PeerRejected(s)
            | BridgeError::ChainATxFailed(s)
            | BridgeError::InvalidRegistrationProof(s)
            | BridgeError::ProviderError(s)
            | BridgeError::BridgeSerializationError(s)
            | BridgeError::StorageError(s)
            | BridgeError::RestAPIError(s)
            | BridgeError::InternalError(s)
            | BridgeError::Generic(s) => format!("{}: {}", self.error_type(), s),
        }
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
