// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Master contract and ERC20 ABI fragments used by the notary.

use crate::error::{BridgeError, BridgeResult};
use ethers::abi::{parse_abi, Abi, Function, Token};
use ethers::types::{Address as EthAddress, H256, U256};
use once_cell::sync::Lazy;

pub const WITHDRAW_METHOD: &str = "withdraw";
pub const MINT_METHOD: &str = "mintTokensByPeers";
pub const ADD_PEER_METHOD: &str = "addPeerByPeer";
pub const PEERS_METHOD: &str = "peers";

const TX_HASH_PARAM: &str = "txHash";

/// Topic 0 of the ERC20 `Transfer(address,address,uint256)` event.
pub const TRANSFER_EVENT_TOPIC: H256 = H256([
    0xdd, 0xf2, 0x52, 0xad, 0x1b, 0xe2, 0xc8, 0x9b, 0x69, 0xc2, 0xb0, 0x68, 0xfc, 0x37, 0x8d, 0xaa,
    0x95, 0x2b, 0xa7, 0xf1, 0x63, 0xc4, 0xa1, 0x16, 0x28, 0xf5, 0x5a, 0x4d, 0xf5, 0x23, 0xb3, 0xef,
]);

pub static MASTER_CONTRACT_ABI: Lazy<Abi> = Lazy::new(|| {
    // unwrap: static ABI definitions
    parse_abi(&[
        "function withdraw(address tokenAddress, uint256 amount, address to, bytes32 txHash, uint8[] v, bytes32[] r, bytes32[] s, address from)",
        "function mintTokensByPeers(address tokenAddress, uint256 amount, address beneficiary, bytes32 txHash, uint8[] v, bytes32[] r, bytes32[] s, address from)",
        "function addPeerByPeer(address newPeerAddress, bytes32 txHash, uint8[] v, bytes32[] r, bytes32[] s) returns (bool)",
        "function peers(address) view returns (bool)",
    ])
    .unwrap()
});

pub const BALANCE_OF_METHOD: &str = "balanceOf";

pub static ERC20_ABI: Lazy<Abi> = Lazy::new(|| {
    // unwrap: static ABI definitions
    parse_abi(&["function balanceOf(address owner) view returns (uint256)"]).unwrap()
});

pub fn master_function(name: &str) -> BridgeResult<&'static Function> {
    MASTER_CONTRACT_ABI
        .function(name)
        .map_err(|e| BridgeError::InternalError(format!("master contract ABI: {}", e)))
}

pub fn erc20_function(name: &str) -> BridgeResult<&'static Function> {
    ERC20_ABI
        .function(name)
        .map_err(|e| BridgeError::InternalError(format!("ERC20 ABI: {}", e)))
}

/// A decoded call to the master contract's `withdraw` or `mintTokensByPeers`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterWithdrawalCall {
    pub method: &'static str,
    pub trigger_tx_hash: H256,
}

/// Decode calldata sent to the master contract. Returns `None` for methods
/// other than the two withdrawal entry points.
pub fn decode_master_withdrawal_call(input: &[u8]) -> BridgeResult<Option<MasterWithdrawalCall>> {
    if input.len() < 4 {
        return Err(BridgeError::BridgeSerializationError(format!(
            "calldata too short: {} bytes",
            input.len()
        )));
    }
    let selector = &input[..4];
    for method in [WITHDRAW_METHOD, MINT_METHOD] {
        let function = master_function(method)?;
        if function.short_signature()[..] != selector[..] {
            continue;
        }
        let tokens = function
            .decode_input(&input[4..])
            .map_err(|e| BridgeError::BridgeSerializationError(format!("{}: {}", method, e)))?;
        let trigger = function
            .inputs
            .iter()
            .zip(tokens)
            .find(|(param, _)| param.name == TX_HASH_PARAM)
            .and_then(|(_, token)| match token {
                Token::FixedBytes(bytes) if bytes.len() == 32 => Some(H256::from_slice(&bytes)),
                _ => None,
            })
            .ok_or_else(|| {
                BridgeError::BridgeSerializationError(format!(
                    "{} call without a bytes32 {} parameter",
                    method, TX_HASH_PARAM
                ))
            })?;
        return Ok(Some(MasterWithdrawalCall {
            method,
            trigger_tx_hash: trigger,
        }));
    }
    Ok(None)
}

/// Addresses and amount of an ERC20 `Transfer` log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Erc20Transfer {
    pub from: EthAddress,
    pub to: EthAddress,
    pub amount: U256,
}

pub fn decode_erc20_transfer(topics: &[H256], data: &[u8]) -> Option<Erc20Transfer> {
    if topics.len() != 3 || topics[0] != TRANSFER_EVENT_TOPIC || data.len() != 32 {
        return None;
    }
    Some(Erc20Transfer {
        from: EthAddress::from(topics[1]),
        to: EthAddress::from(topics[2]),
        amount: U256::from_big_endian(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::utils::keccak256;

    #[test]
    fn test_transfer_topic_matches_event_signature() {
        assert_eq!(
            TRANSFER_EVENT_TOPIC,
            H256(keccak256("Transfer(address,address,uint256)"))
        );
    }

    #[test]
    fn test_decode_withdraw_call_extracts_trigger_hash() {
        let trigger = H256::repeat_byte(0x42);
        let calldata = master_function(MINT_METHOD)
            .unwrap()
            .encode_input(&[
                Token::Address(EthAddress::repeat_byte(1)),
                Token::Uint(U256::from(10)),
                Token::Address(EthAddress::repeat_byte(2)),
                Token::FixedBytes(trigger.as_bytes().to_vec()),
                Token::Array(vec![Token::Uint(U256::from(27))]),
                Token::Array(vec![Token::FixedBytes(vec![1u8; 32])]),
                Token::Array(vec![Token::FixedBytes(vec![2u8; 32])]),
                Token::Address(EthAddress::repeat_byte(3)),
            ])
            .unwrap();
        let decoded = decode_master_withdrawal_call(&calldata).unwrap().unwrap();
        assert_eq!(decoded.method, MINT_METHOD);
        assert_eq!(decoded.trigger_tx_hash, trigger);
    }

    #[test]
    fn test_other_master_methods_are_ignored() {
        let calldata = master_function(PEERS_METHOD)
            .unwrap()
            .encode_input(&[Token::Address(EthAddress::repeat_byte(1))])
            .unwrap();
        assert_eq!(decode_master_withdrawal_call(&calldata).unwrap(), None);
        assert!(decode_master_withdrawal_call(&[0x01]).is_err());
    }

    #[test]
    fn test_decode_erc20_transfer() {
        let from = EthAddress::repeat_byte(0xaa);
        let to = EthAddress::repeat_byte(0xbb);
        let mut data = [0u8; 32];
        U256::from(500).to_big_endian(&mut data);
        let transfer =
            decode_erc20_transfer(&[TRANSFER_EVENT_TOPIC, from.into(), to.into()], &data).unwrap();
        assert_eq!(transfer.from, from);
        assert_eq!(transfer.to, to);
        assert_eq!(transfer.amount, U256::from(500));

        assert!(decode_erc20_transfer(&[H256::zero(), from.into(), to.into()], &data).is_none());
    }
}
