// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Notary key management: every notary holds one secp256k1 key that signs
//! Chain-A attestations and submits Chain-A transactions.
//!
//! Key files contain the hex encoded 32 byte secret, optionally `0x` prefixed.

use ethers::core::k256::ecdsa::SigningKey;
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::signers::LocalWallet;
use ethers::types::Address as EthAddress;

pub use ethers::signers::Signer;

/// Uncompressed public key without the leading `0x04` tag, hex encoded.
pub fn public_key_hex(key: &SigningKey) -> String {
    let point = key.verifying_key().to_encoded_point(false);
    hex::encode(&point.as_bytes()[1..])
}

pub fn eth_address(key: &SigningKey) -> EthAddress {
    ethers::utils::secret_key_to_address(key)
}

pub mod keygen {
    use super::*;
    use anyhow::{anyhow, Result};
    use std::path::Path;

    pub fn generate_notary_key() -> SigningKey {
        SigningKey::random(&mut rand::thread_rng())
    }

    /// Generate a new secp256k1 notary key and write it hex encoded to `path`.
    pub fn generate_notary_key_and_write_to_file(path: &Path) -> Result<SigningKey> {
        let key = generate_notary_key();
        tracing::debug!("Generated new secp256k1 notary key");
        tracing::debug!("Public key (hex): {}", public_key_hex(&key));
        tracing::debug!("Ethereum address: {:?}", eth_address(&key));

        std::fs::write(path, hex::encode(key.to_bytes()))
            .map_err(|err| anyhow!("Failed to write key to {:?}: {}", path, err))?;

        tracing::debug!("Key written to: {:?}", path);
        Ok(key)
    }
}

pub mod keypair_file {
    use super::*;
    use anyhow::{anyhow, Result};
    use std::path::Path;

    // Read a secp256k1 signing key from a file holding the hex encoded secret
    pub fn read_key(path: &Path) -> Result<SigningKey> {
        if !path.exists() {
            return Err(anyhow!("Key file not found at path: {:?}", path));
        }
        let file_contents = std::fs::read_to_string(path)?;
        decode_key(file_contents.trim())
            .map_err(|e| anyhow!("Invalid key file format at {:?}: {}", path, e))
    }

    pub fn read_wallet(path: &Path) -> Result<LocalWallet> {
        Ok(LocalWallet::from(read_key(path)?))
    }

    pub fn decode_key(contents: &str) -> Result<SigningKey> {
        let bytes = hex::decode(contents.trim_start_matches("0x"))?;
        if bytes.len() != 32 {
            return Err(anyhow!("expected 32 byte secret, got {} bytes", bytes.len()));
        }
        SigningKey::from_slice(&bytes).map_err(|e| anyhow!("{}", e))
    }
}
