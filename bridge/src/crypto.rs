// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Attestation hashes and notary signatures.
//!
//! Every notary must derive byte-identical attestation hashes from the same
//! inputs, so each hash is keccak256 over fixed-width fields: addresses are
//! left-padded to 20 bytes, hashes and amounts to 32 bytes. The field order is
//! a wire contract with the master contract's verifier.

use crate::error::{BridgeError, BridgeResult};
use ethers::signers::LocalWallet;
use ethers::types::{Address as EthAddress, Signature, H256, U256};
use ethers::utils::{hash_message, keccak256};
use serde::{Deserialize, Serialize};
use tracing::warn;

const ADDRESS_LENGTH: usize = 20;
const WORD_LENGTH: usize = 32;
const SIGNATURE_HEX_LENGTH: usize = 130;

/// One notary's signature split into the components the master contract takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Vrs {
    pub v: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

/// Hex encoded `Vrs`, as stored in ledger proof records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrsSignature {
    pub v: String,
    pub r: String,
    pub s: String,
}

impl From<&Vrs> for VrsSignature {
    fn from(vrs: &Vrs) -> Self {
        Self {
            v: format!("{:x}", vrs.v),
            r: hex::encode(vrs.r),
            s: hex::encode(vrs.s),
        }
    }
}

impl TryFrom<&VrsSignature> for Vrs {
    type Error = BridgeError;

    fn try_from(sig: &VrsSignature) -> BridgeResult<Self> {
        let v = u8::from_str_radix(sig.v.trim_start_matches("0x"), 16)
            .map_err(|e| BridgeError::InvalidSignatureEncoding(format!("v: {}", e)))?;
        Ok(Vrs {
            v: normalize_v(v),
            r: decode_word(&sig.r, "r")?,
            s: decode_word(&sig.s, "s")?,
        })
    }
}

impl Vrs {
    fn to_signature(self) -> Signature {
        Signature {
            r: U256::from_big_endian(&self.r),
            s: U256::from_big_endian(&self.s),
            v: self.v as u64,
        }
    }
}

pub fn hash_withdraw(
    token_address: &str,
    amount: &str,
    beneficiary: &str,
    trigger_hash: &str,
    relay: &str,
) -> BridgeResult<H256> {
    transfer_attestation(token_address, amount, beneficiary, trigger_hash, relay)
}

/// Same layout as [`hash_withdraw`]; the master contract tells them apart by
/// entry point.
pub fn hash_mint(
    token_address: &str,
    amount: &str,
    beneficiary: &str,
    trigger_hash: &str,
    relay: &str,
) -> BridgeResult<H256> {
    transfer_attestation(token_address, amount, beneficiary, trigger_hash, relay)
}

pub fn hash_add_peer(peer_address: &str, trigger_hash: &str) -> BridgeResult<H256> {
    let mut buf = Vec::with_capacity(ADDRESS_LENGTH + WORD_LENGTH);
    buf.extend_from_slice(&decode_address(peer_address)?);
    buf.extend_from_slice(&decode_hash(trigger_hash)?);
    Ok(H256(keccak256(buf)))
}

pub fn hash_registration(
    address: &str,
    account_id: &str,
    trigger_hash: &str,
) -> BridgeResult<H256> {
    let mut buf = Vec::with_capacity(ADDRESS_LENGTH + account_id.len() + WORD_LENGTH);
    buf.extend_from_slice(&decode_address(address)?);
    buf.extend_from_slice(account_id.as_bytes());
    buf.extend_from_slice(&decode_hash(trigger_hash)?);
    Ok(H256(keccak256(buf)))
}

fn transfer_attestation(
    token_address: &str,
    amount: &str,
    beneficiary: &str,
    trigger_hash: &str,
    relay: &str,
) -> BridgeResult<H256> {
    let amount = U256::from_dec_str(amount)
        .map_err(|e| BridgeError::InvalidAmount(format!("{}: {}", amount, e)))?;
    let mut amount_word = [0u8; WORD_LENGTH];
    amount.to_big_endian(&mut amount_word);

    let mut buf = Vec::with_capacity(3 * ADDRESS_LENGTH + 2 * WORD_LENGTH);
    buf.extend_from_slice(&decode_address(token_address)?);
    buf.extend_from_slice(&amount_word);
    buf.extend_from_slice(&decode_address(beneficiary)?);
    buf.extend_from_slice(&decode_hash(trigger_hash)?);
    buf.extend_from_slice(&decode_address(relay)?);
    Ok(H256(keccak256(buf)))
}

/// Sign `hash` under the Chain-A personal message prefix and return
/// `0x r‖s‖v` with `v` in {27, 28}.
pub fn sign(key: &LocalWallet, hash: H256) -> BridgeResult<String> {
    let signature = key
        .sign_hash(hash_message(hash.as_bytes()))
        .map_err(|e| BridgeError::InternalError(format!("signing failed: {}", e)))?;
    let mut bytes = signature.to_vec();
    bytes[64] = normalize_v(bytes[64]);
    Ok(format!("0x{}", hex::encode(bytes)))
}

/// Split a concatenated `r‖s‖v` signature. Signers emit `v` as 0/1 or
/// 27/28; both come out as 27/28.
pub fn parse_signature(signature: &str) -> BridgeResult<Vrs> {
    let hex_str = signature.strip_prefix("0x").unwrap_or(signature);
    if hex_str.len() != SIGNATURE_HEX_LENGTH {
        return Err(BridgeError::InvalidSignatureEncoding(format!(
            "expected {} hex chars, got {}",
            SIGNATURE_HEX_LENGTH,
            hex_str.len()
        )));
    }
    let bytes = hex::decode(hex_str)
        .map_err(|e| BridgeError::InvalidSignatureEncoding(format!("signature: {}", e)))?;
    let mut r = [0u8; WORD_LENGTH];
    let mut s = [0u8; WORD_LENGTH];
    r.copy_from_slice(&bytes[..WORD_LENGTH]);
    s.copy_from_slice(&bytes[WORD_LENGTH..2 * WORD_LENGTH]);
    Ok(Vrs {
        v: normalize_v(bytes[2 * WORD_LENGTH]),
        r,
        s,
    })
}

fn normalize_v(v: u8) -> u8 {
    if v < 27 {
        v + 27
    } else {
        v
    }
}

/// Address of the key that produced `vrs` over the prefixed `hash`.
pub fn recover_signer(hash: H256, vrs: &Vrs) -> BridgeResult<EthAddress> {
    vrs.to_signature()
        .recover(hash_message(hash.as_bytes()))
        .map_err(|e| BridgeError::InvalidSignatureEncoding(e.to_string()))
}

/// Chain-A address of an uncompressed secp256k1 public key given as hex of
/// the 64 byte `x‖y` point (a leading `04` tag is tolerated).
pub fn public_key_to_address(public_key: &str) -> BridgeResult<EthAddress> {
    let bytes = hex::decode(public_key.trim_start_matches("0x"))
        .map_err(|e| BridgeError::InvalidRegistrationProof(format!("public key: {}", e)))?;
    let point = match bytes.len() {
        64 => &bytes[..],
        65 if bytes[0] == 0x04 => &bytes[1..],
        n => {
            return Err(BridgeError::InvalidRegistrationProof(format!(
                "public key must be 64 bytes, got {}",
                n
            )))
        }
    };
    Ok(EthAddress::from_slice(&keccak256(point)[12..]))
}

/// Whether `signature` over the prefixed 20 address bytes recovers to
/// `address`. The stored `v` is not trusted, both recovery ids are tried.
pub fn verify_address_signature(
    address: &EthAddress,
    signature: &VrsSignature,
) -> BridgeResult<bool> {
    let vrs = Vrs::try_from(signature)?;
    let message = hash_message(address.as_bytes());
    Ok([27u8, 28u8].into_iter().any(|v| {
        Vrs { v, ..vrs }
            .to_signature()
            .recover(message)
            .map(|recovered| recovered == *address)
            .unwrap_or(false)
    }))
}

/// Check that `signature` was made by the owner of `public_key` over the
/// prefixed bytes of the derived address. Returns the address on success.
pub fn verify_registration_proof(
    public_key: &str,
    signature: &VrsSignature,
) -> BridgeResult<EthAddress> {
    let address = public_key_to_address(public_key)?;
    if verify_address_signature(&address, signature)? {
        return Ok(address);
    }
    warn!(
        "[Crypto] Registration proof rejected: signature does not match {:?}",
        address
    );
    Err(BridgeError::InvalidRegistrationProof(format!(
        "signature does not match address {:?}",
        address
    )))
}

pub fn decode_address(address: &str) -> BridgeResult<[u8; ADDRESS_LENGTH]> {
    decode_left_padded::<ADDRESS_LENGTH>(address)
        .map_err(|e| BridgeError::InvalidAddress(format!("{}: {}", address, e)))
}

pub fn decode_hash(hash: &str) -> BridgeResult<[u8; WORD_LENGTH]> {
    decode_left_padded::<WORD_LENGTH>(hash).map_err(|_| BridgeError::InvalidTxHash)
}

pub fn parse_eth_address(address: &str) -> BridgeResult<EthAddress> {
    let stripped = address.trim_start_matches("0x");
    if stripped.len() != 2 * ADDRESS_LENGTH {
        return Err(BridgeError::InvalidAddress(address.to_string()));
    }
    Ok(EthAddress::from(decode_address(address)?))
}

pub fn parse_tx_hash(hash: &str) -> BridgeResult<H256> {
    let stripped = hash.trim_start_matches("0x");
    if stripped.len() != 2 * WORD_LENGTH {
        return Err(BridgeError::InvalidTxHash);
    }
    Ok(H256(decode_hash(hash)?))
}

pub fn address_to_hex(address: &EthAddress) -> String {
    format!("{:?}", address)
}

fn decode_word(hex_str: &str, field: &str) -> BridgeResult<[u8; 32]> {
    let bytes = hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|e| BridgeError::InvalidSignatureEncoding(format!("{}: {}", field, e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        BridgeError::InvalidSignatureEncoding(format!("{}: expected 32 bytes, got {}", field, b.len()))
    })
}

fn decode_left_padded<const N: usize>(hex_str: &str) -> Result<[u8; N], String> {
    let mut stripped = hex_str.trim_start_matches("0x").to_string();
    if stripped.len() % 2 == 1 {
        stripped.insert(0, '0');
    }
    let bytes = hex::decode(&stripped).map_err(|e| e.to_string())?;
    if bytes.len() > N {
        return Err(format!("expected at most {} bytes, got {}", N, bytes.len()));
    }
    let mut out = [0u8; N];
    out[N - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}
