// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::with_metrics;
use crate::{
    error::BridgeError,
    metrics::NotaryMetrics,
    server::handler::{NotaryRequestHandler, NotaryRequestHandlerTrait},
    types::EthNotaryResponse,
};
use axum::{
    extract::{Path, State},
    Json,
};
use axum::{http::StatusCode, routing::get, Router};
use ethers::types::Address as EthAddress;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod handler;

#[cfg(test)]
pub(crate) mod mock_handler;

pub const PING_PATH: &str = "/ping";
pub const HEALTH_PATH: &str = "/health";
pub const ACTUATOR_HEALTH_PATH: &str = "/actuator/health";

// Prefixes are shared with NotaryClient, the routes below append the hash.
// Note: Using :param syntax for axum 0.7.x
pub const WITHDRAWAL_PROOF_PATH_PREFIX: &str = "/eth/";
pub const ADD_PEER_PROOF_PATH_PREFIX: &str = "/ethereum/proof/add_peer/";
pub const REGISTRATION_PROOF_PATH_PREFIX: &str = "/ethereum/proof/registration/";

pub const WITHDRAWAL_PROOF_PATH: &str = "/eth/:tx_hash";
pub const ADD_PEER_PROOF_PATH: &str = "/ethereum/proof/add_peer/:tx_hash";
pub const REGISTRATION_PROOF_PATH: &str = "/ethereum/proof/registration/:tx_hash";

// NotaryNode's public metadata that is accessible via the `/ping` endpoint.
// Be careful with what to put here, as it is public.
#[derive(serde::Serialize)]
pub struct NotaryNodePublicMetadata {
    pub version: &'static str,
    pub notary_name: String,
    pub eth_address: Option<EthAddress>,
}

impl NotaryNodePublicMetadata {
    pub fn new(version: &'static str, notary_name: String, eth_address: EthAddress) -> Self {
        Self {
            version,
            notary_name,
            eth_address: Some(eth_address),
        }
    }

    pub fn empty_for_testing() -> Self {
        Self {
            version: "testing",
            notary_name: "testing".to_string(),
            eth_address: None,
        }
    }
}

#[derive(serde::Serialize)]
struct HealthStatus {
    status: &'static str,
}

pub fn run_server(
    socket_address: &SocketAddr,
    handler: Arc<NotaryRequestHandler>,
    metrics: Arc<NotaryMetrics>,
    metadata: Arc<NotaryNodePublicMetadata>,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(socket_address).await?;
        info!("[Server] Notary endpoints listening on {}", socket_address);
        axum::serve(
            listener,
            make_router(handler, metrics, metadata).into_make_service(),
        )
        .await?;
        Ok(())
    })
}

type ServerState<H> = (Arc<H>, Arc<NotaryMetrics>, Arc<NotaryNodePublicMetadata>);

pub(crate) fn make_router<H>(
    handler: Arc<H>,
    metrics: Arc<NotaryMetrics>,
    metadata: Arc<NotaryNodePublicMetadata>,
) -> Router
where
    H: NotaryRequestHandlerTrait + Sync + Send + 'static,
{
    Router::new()
        .route("/", get(health_check))
        .route(HEALTH_PATH, get(health_check))
        .route(ACTUATOR_HEALTH_PATH, get(actuator_health))
        .route(PING_PATH, get(ping::<H>))
        .route(WITHDRAWAL_PROOF_PATH, get(handle_withdrawal_proof::<H>))
        .route(ADD_PEER_PROOF_PATH, get(handle_add_peer_proof::<H>))
        .route(REGISTRATION_PROOF_PATH, get(handle_registration_proof::<H>))
        .with_state((handler, metrics, metadata))
}

impl axum::response::IntoResponse for BridgeError {
    // Callers always get the structured envelope, never a bare status.
    fn into_response(self) -> axum::response::Response {
        (
            StatusCode::BAD_REQUEST,
            Json(EthNotaryResponse::error(self.reason())),
        )
            .into_response()
    }
}

impl<E> From<E> for BridgeError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Generic(err.into().to_string())
    }
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn actuator_health() -> Json<HealthStatus> {
    Json(HealthStatus { status: "UP" })
}

async fn ping<H: NotaryRequestHandlerTrait + Sync + Send>(
    State((_, _, metadata)): State<ServerState<H>>,
) -> Result<Json<Arc<NotaryNodePublicMetadata>>, BridgeError> {
    Ok(Json(metadata))
}

#[instrument(level = "error", skip_all, fields(tx_hash = tx_hash))]
async fn handle_withdrawal_proof<H: NotaryRequestHandlerTrait + Sync + Send>(
    Path(tx_hash): Path<String>,
    State((handler, metrics, _)): State<ServerState<H>>,
) -> Result<Json<EthNotaryResponse>, BridgeError> {
    let future = async {
        let response = handler.handle_withdrawal_proof(tx_hash).await?;
        Ok(response)
    };
    with_metrics!(metrics.clone(), "handle_withdrawal_proof", future).await
}

#[instrument(level = "error", skip_all, fields(tx_hash = tx_hash))]
async fn handle_add_peer_proof<H: NotaryRequestHandlerTrait + Sync + Send>(
    Path(tx_hash): Path<String>,
    State((handler, metrics, _)): State<ServerState<H>>,
) -> Result<Json<EthNotaryResponse>, BridgeError> {
    let future = async {
        let response = handler.handle_add_peer_proof(tx_hash).await?;
        Ok(response)
    };
    with_metrics!(metrics.clone(), "handle_add_peer_proof", future).await
}

#[instrument(level = "error", skip_all, fields(tx_hash = tx_hash))]
async fn handle_registration_proof<H: NotaryRequestHandlerTrait + Sync + Send>(
    Path(tx_hash): Path<String>,
    State((handler, metrics, _)): State<ServerState<H>>,
) -> Result<Json<EthNotaryResponse>, BridgeError> {
    let future = async {
        let response = handler.handle_registration_proof(tx_hash).await?;
        Ok(response)
    };
    with_metrics!(metrics.clone(), "handle_registration_proof", future).await
}

#[macro_export]
macro_rules! with_metrics {
    ($metrics:expr, $type_:expr, $func:expr) => {
        async move {
            info!("Received {} request", $type_);
            $metrics
                .requests_received
                .with_label_values(&[$type_])
                .inc();
            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .inc();

            let result = $func.await;

            match &result {
                Ok(_) => {
                    info!("{} request succeeded", $type_);
                    $metrics.requests_ok.with_label_values(&[$type_]).inc();
                }
                Err(e) => {
                    info!("{} request failed: {:?}", $type_, e);
                    $metrics.err_requests.with_label_values(&[$type_]).inc();
                    $metrics.observe_error(e);
                }
            }

            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .dec();
            result
        }
    };
}
