// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

pub const METRICS_ROUTE: &str = "/metrics";

const FINE_GRAINED_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.15, 0.2, 0.25, 0.3, 0.35, 0.4, 0.45, 0.5, 0.6, 0.7, 0.8, 0.9,
    1.0, 1.2, 1.4, 1.6, 1.8, 2.0, 2.5, 3.0, 3.5, 4.0, 5.0, 6.0, 6.5, 7.0, 7.5, 8.0, 8.5, 9.0, 9.5,
    10., 15., 20., 25., 30., 35., 40., 45., 50., 60., 70., 80., 90., 100., 120., 140., 160., 180.,
    200., 250., 300., 350., 400.,
];

#[derive(Clone, Debug)]
pub struct NotaryMetrics {
    pub(crate) requests_received: IntCounterVec,
    pub(crate) requests_ok: IntCounterVec,
    pub(crate) err_requests: IntCounterVec,
    pub(crate) requests_inflight: IntGaugeVec,

    pub(crate) signer_with_cache_hit: IntCounterVec,
    pub(crate) signer_with_cache_miss: IntCounterVec,

    pub(crate) proof_ok_responses: IntCounterVec,
    pub(crate) proof_bad_responses: IntCounterVec,
    pub(crate) err_proof_collection: IntCounter,

    pub(crate) eth_rpc_queries: IntCounterVec,
    pub(crate) eth_rpc_queries_latency: HistogramVec,
    pub(crate) eth_node_connected: IntGauge,

    pub(crate) last_processed_chain_a_block: IntGauge,
    pub(crate) last_processed_ledger_block: IntGauge,
    pub(crate) deposit_events_observed: IntCounterVec,
    pub(crate) withdrawal_finalized_observed: IntCounter,
    pub(crate) err_block_parse: IntCounter,

    pub(crate) withdrawal_proofs_published: IntCounter,
    pub(crate) withdrawal_outcomes: IntCounterVec,
    pub(crate) withdrawal_acks_published: IntCounter,
    pub(crate) withdrawal_limit_updates: IntCounterVec,
    pub(crate) expansion_steps: IntCounterVec,
    pub(crate) registration_outcomes: IntCounterVec,
    pub(crate) nonce_resets: IntCounter,

    pub(crate) errors_by_type: IntCounterVec,
}

impl NotaryMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            requests_received: register_int_counter_vec_with_registry!(
                "notary_requests_received",
                "Total number of requests received in Server, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_ok: register_int_counter_vec_with_registry!(
                "notary_requests_ok",
                "Total number of ok requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            err_requests: register_int_counter_vec_with_registry!(
                "notary_err_requests",
                "Total number of erred requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_inflight: register_int_gauge_vec_with_registry!(
                "notary_requests_inflight",
                "Total number of inflight requests, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            signer_with_cache_hit: register_int_counter_vec_with_registry!(
                "notary_signer_with_cache_hit",
                "Total number of hit in signer's cache, by attestation kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            signer_with_cache_miss: register_int_counter_vec_with_registry!(
                "notary_signer_with_cache_miss",
                "Total number of miss in signer's cache, by attestation kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            proof_ok_responses: register_int_counter_vec_with_registry!(
                "notary_proof_ok_responses",
                "Total number of valid signatures returned by a peer",
                &["peer"],
                registry,
            )
            .unwrap(),
            proof_bad_responses: register_int_counter_vec_with_registry!(
                "notary_proof_bad_responses",
                "Total number of failed or timed out signature requests, by peer",
                &["peer"],
                registry,
            )
            .unwrap(),
            err_proof_collection: register_int_counter_with_registry!(
                "notary_err_proof_collection",
                "Total number of proof collections where no peer returned a valid signature",
                registry,
            )
            .unwrap(),
            eth_rpc_queries: register_int_counter_vec_with_registry!(
                "notary_eth_rpc_queries",
                "Total number of queries issued to eth provider, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            eth_rpc_queries_latency: register_histogram_vec_with_registry!(
                "notary_eth_rpc_queries_latency",
                "Latency of queries issued to eth provider, by request type",
                &["type"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            eth_node_connected: register_int_gauge_with_registry!(
                "notary_eth_node_connected",
                "Whether the last query to the eth provider succeeded (1) or failed (0)",
                registry,
            )
            .unwrap(),
            last_processed_chain_a_block: register_int_gauge_with_registry!(
                "notary_last_processed_chain_a_block",
                "Head height of the last Chain-A block handed to the parser",
                registry,
            )
            .unwrap(),
            last_processed_ledger_block: register_int_gauge_with_registry!(
                "notary_last_processed_ledger_block",
                "Height of the last ledger block processed",
                registry,
            )
            .unwrap(),
            deposit_events_observed: register_int_counter_vec_with_registry!(
                "notary_deposit_events_observed",
                "Total number of deposit events parsed from Chain A, by asset",
                &["asset_id"],
                registry,
            )
            .unwrap(),
            withdrawal_finalized_observed: register_int_counter_with_registry!(
                "notary_withdrawal_finalized_observed",
                "Total number of withdraw or mint calls observed on the master contract",
                registry,
            )
            .unwrap(),
            err_block_parse: register_int_counter_with_registry!(
                "notary_err_block_parse",
                "Total number of Chain-A blocks whose parsing was aborted",
                registry,
            )
            .unwrap(),
            withdrawal_proofs_published: register_int_counter_with_registry!(
                "notary_withdrawal_proofs_published",
                "Total number of withdrawal proof records written by this notary",
                registry,
            )
            .unwrap(),
            withdrawal_outcomes: register_int_counter_vec_with_registry!(
                "notary_withdrawal_outcomes",
                "Withdrawal pipeline terminal states: finalized, finalization_failed, rolled_back, rollback_failed",
                &["outcome"],
                registry,
            )
            .unwrap(),
            withdrawal_acks_published: register_int_counter_with_registry!(
                "notary_withdrawal_acks_published",
                "Total number of withdrawal acknowledgements handed to the notification consumer",
                registry,
            )
            .unwrap(),
            withdrawal_limit_updates: register_int_counter_vec_with_registry!(
                "notary_withdrawal_limit_updates",
                "Withdrawal limit update attempts, by result: updated, lost_race",
                &["result"],
                registry,
            )
            .unwrap(),
            expansion_steps: register_int_counter_vec_with_registry!(
                "notary_expansion_steps",
                "Peer expansion steps completed, by step",
                &["step"],
                registry,
            )
            .unwrap(),
            registration_outcomes: register_int_counter_vec_with_registry!(
                "notary_registration_outcomes",
                "Wallet registration results, by outcome",
                &["outcome"],
                registry,
            )
            .unwrap(),
            nonce_resets: register_int_counter_with_registry!(
                "notary_nonce_resets",
                "Total number of times the local nonce was re-read from the chain",
                registry,
            )
            .unwrap(),
            errors_by_type: register_int_counter_vec_with_registry!(
                "notary_errors_by_type",
                "Errors observed by the notary, by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }

    pub(crate) fn observe_error(&self, error: &crate::error::BridgeError) {
        self.errors_by_type
            .with_label_values(&[error.error_type()])
            .inc();
    }
}

/// Serve `registry` in the Prometheus text format on `address`.
pub fn start_prometheus_server(
    address: SocketAddr,
    registry: Registry,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(address).await?;
        info!("Prometheus metrics served on {}{}", address, METRICS_ROUTE);
        let app = Router::new()
            .route(METRICS_ROUTE, get(metrics))
            .with_state(registry);
        axum::serve(listener, app.into_make_service()).await?;
        Ok(())
    })
}

async fn metrics(State(registry): State<Registry>) -> (StatusCode, String) {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => match String::from_utf8(buffer) {
            Ok(text) => (StatusCode::OK, text),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    #[test]
    fn test_metrics_are_registered() {
        let registry = Registry::new();
        let metrics = NotaryMetrics::new(&registry);

        // vec metrics only show up in gather() after first use
        metrics
            .withdrawal_outcomes
            .with_label_values(&["rolled_back"])
            .inc();

        let families = registry.gather();
        assert!(
            families
                .iter()
                .any(|mf| mf.get_name() == "notary_withdrawal_outcomes"),
            "found: {:?}",
            families.iter().map(|mf| mf.get_name()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_observe_error_uses_error_type_label() {
        let metrics = NotaryMetrics::new_for_testing();
        metrics.observe_error(&BridgeError::NoValidProof("x".into()));
        metrics.observe_error(&BridgeError::NoValidProof("y".into()));
        assert_eq!(
            metrics
                .errors_by_type
                .with_label_values(&["no_valid_proof"])
                .get(),
            2
        );
    }

    #[test]
    fn test_counter_increment() {
        let metrics = NotaryMetrics::new_for_testing();
        let counter = metrics.deposit_events_observed.with_label_values(&["ether#ethereum"]);
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[tokio::test]
    async fn test_metrics_route_serves_text_format() {
        let registry = Registry::new();
        let metrics = NotaryMetrics::new(&registry);
        metrics.nonce_resets.inc();
        let host = notary_bridge_config::local_ip_utils::localhost_for_testing();
        let port = notary_bridge_config::local_ip_utils::get_available_port(&host);
        let address = SocketAddr::new(host, port);
        let _handle = start_prometheus_server(address, registry);

        let url = format!("http://{}{}", address, METRICS_ROUTE);
        let mut body = None;
        for _ in 0..50 {
            if let Ok(response) = reqwest::get(&url).await {
                body = Some(response.text().await.unwrap());
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(body.unwrap().contains("notary_nonce_resets 1"));
    }
}
