// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::config::{
    ChainAConfig, LedgerAccountsConfig, NotaryNodeConfig, ProofCollectorConfig,
};
use crate::error::{BridgeError, BridgeResult};
use ethers::types::U256;
use ethers::utils::{format_units, parse_units};
use notary_bridge_config::Config;
use std::path::{Path, PathBuf};

/// Render raw integer units as a decimal string, `10^-precision` scaled, with
/// trailing fractional zeros removed: 1000 * 10^18 at precision 18 is "1000".
pub fn render_decimal(raw: U256, precision: u32) -> BridgeResult<String> {
    let rendered = format_units(raw, precision)
        .map_err(|e| BridgeError::InvalidAmount(format!("{} @ {}: {}", raw, precision, e)))?;
    if rendered.contains('.') {
        Ok(rendered
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string())
    } else {
        Ok(rendered)
    }
}

/// Scale a non-negative decimal string to integer units of `precision`.
/// Fails when the amount carries more fractional digits than `precision`.
pub fn scale_decimal(amount: &str, precision: u32) -> BridgeResult<U256> {
    let trimmed = amount.trim();
    if trimmed.is_empty() || trimmed.starts_with('-') || trimmed.starts_with('+') {
        return Err(BridgeError::InvalidAmount(amount.to_string()));
    }
    if let Some((_, fraction)) = trimmed.split_once('.') {
        if fraction.trim_end_matches('0').len() > precision as usize {
            return Err(BridgeError::InvalidAmount(format!(
                "{} has more than {} decimals",
                amount, precision
            )));
        }
    }
    let parsed = parse_units(trimmed, precision)
        .map_err(|e| BridgeError::InvalidAmount(format!("{}: {}", amount, e)))?;
    Ok(parsed.into())
}

// Generate a notary node config template and write it to a file.
pub fn generate_notary_node_config_and_write_to_file(path: &Path) -> anyhow::Result<()> {
    let config = NotaryNodeConfig {
        server_listen_port: 8083,
        metrics_port: 9184,
        notary_name: "notary-1".to_string(),
        notary_key_path: PathBuf::from("/path/to/your/notary_key"),
        chain_a: ChainAConfig {
            rpc_url: "your_chain_a_rpc_url".to_string(),
            master_contract_address: "0x0000000000000000000000000000000000000000".to_string(),
            chain_id: None,
            start_block: 0,
            confirmation_lag: 6,
            ignore_start_block: false,
            cursor_file_path: PathBuf::from("/var/lib/notary/last_block"),
            poll_interval: std::time::Duration::from_secs(5),
        },
        ledger: LedgerAccountsConfig::default(),
        proof_collector: ProofCollectorConfig::default(),
        withdrawal_service: false,
        expansion_submitter: false,
        ledger_block_channel_size: 1000,
        withdrawal_limits: None,
    };
    config.save(path)
}
