// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod abi;
pub mod chain_listener;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod eth_client;
pub mod eth_transaction_manager;
pub mod event_parser;
pub mod expansion;
pub mod ledger;
pub mod ledger_processor;
pub mod master_contract;
pub mod metered_eth_provider;
pub mod metrics;
pub mod node;
pub mod registration;
pub mod registry;
pub mod server;
pub mod types;
pub mod utils;
pub mod withdrawal;

#[cfg(test)]
pub mod test_utils;

#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // The following delay sequence (in secs) will be used, applied with jitter
        // 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 30, 60, 120, 120 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => {
                        return Ok(result);
                    }
                    Err(e) => {
                        // For simplicity we treat every error as transient so we can retry until max_elapsed_time
                        tracing::debug!("Retrying due to error: {:?}", e);
                        return Err(backoff::Error::transient(e));
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
