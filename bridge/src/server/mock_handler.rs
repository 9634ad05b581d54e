// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A mock implementation for `NotaryRequestHandlerTrait`
//! that handles requests according to preset behaviors.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::BridgeError;
use crate::error::BridgeResult;
use crate::metrics::NotaryMetrics;
use crate::server::NotaryNodePublicMetadata;
use crate::types::EthNotaryResponse;
use async_trait::async_trait;
use axum::Json;

use super::handler::NotaryRequestHandlerTrait;
use super::make_router;

type Presets = Arc<Mutex<HashMap<String, (BridgeResult<EthNotaryResponse>, Option<Duration>)>>>;

fn key(tx_hash: &str) -> String {
    tx_hash.trim_start_matches("0x").to_lowercase()
}

#[derive(Clone, Default)]
struct Endpoint {
    presets: Presets,
    requested: Arc<Mutex<HashMap<String, u64>>>,
}

impl Endpoint {
    fn add(&self, tx_hash: &str, response: BridgeResult<EthNotaryResponse>, delay: Option<Duration>) {
        self.presets
            .lock()
            .unwrap()
            .insert(key(tx_hash), (response, delay));
    }

    fn requested(&self, tx_hash: &str) -> u64 {
        *self.requested.lock().unwrap().get(&key(tx_hash)).unwrap_or(&0)
    }

    async fn respond(
        &self,
        kind: &str,
        tx_hash: String,
    ) -> Result<Json<EthNotaryResponse>, BridgeError> {
        let tx_hash = key(&tx_hash);
        let (result, delay) = {
            let preset = self.presets.lock().unwrap();
            if !preset.contains_key(&tx_hash) {
                // Ok to panic in test
                panic!("No preset {} result for tx_hash: {}", kind, tx_hash);
            }
            let mut requested = self.requested.lock().unwrap();
            *requested.entry(tx_hash.clone()).or_default() += 1;
            let (result, delay) = preset.get(&tx_hash).unwrap();
            (result.clone(), *delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Json(result?))
    }
}

#[derive(Clone, Default)]
pub struct NotaryRequestMockHandler {
    withdrawal: Endpoint,
    add_peer: Endpoint,
    registration: Endpoint,
}

impl NotaryRequestMockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_withdrawal_response(
        &self,
        tx_hash: &str,
        response: BridgeResult<EthNotaryResponse>,
        delay: Option<Duration>,
    ) {
        self.withdrawal.add(tx_hash, response, delay);
    }

    pub fn add_add_peer_response(
        &self,
        tx_hash: &str,
        response: BridgeResult<EthNotaryResponse>,
        delay: Option<Duration>,
    ) {
        self.add_peer.add(tx_hash, response, delay);
    }

    pub fn add_registration_response(
        &self,
        tx_hash: &str,
        response: BridgeResult<EthNotaryResponse>,
        delay: Option<Duration>,
    ) {
        self.registration.add(tx_hash, response, delay);
    }

    pub fn withdrawal_requests(&self, tx_hash: &str) -> u64 {
        self.withdrawal.requested(tx_hash)
    }

    pub fn add_peer_requests(&self, tx_hash: &str) -> u64 {
        self.add_peer.requested(tx_hash)
    }
}

#[async_trait]
impl NotaryRequestHandlerTrait for NotaryRequestMockHandler {
    async fn handle_withdrawal_proof(
        &self,
        tx_hash: String,
    ) -> Result<Json<EthNotaryResponse>, BridgeError> {
        self.withdrawal.respond("withdrawal", tx_hash).await
    }

    async fn handle_add_peer_proof(
        &self,
        tx_hash: String,
    ) -> Result<Json<EthNotaryResponse>, BridgeError> {
        self.add_peer.respond("add_peer", tx_hash).await
    }

    async fn handle_registration_proof(
        &self,
        tx_hash: String,
    ) -> Result<Json<EthNotaryResponse>, BridgeError> {
        self.registration.respond("registration", tx_hash).await
    }
}

pub fn run_mock_server(
    socket_address: SocketAddr,
    mock_handler: NotaryRequestMockHandler,
) -> tokio::task::JoinHandle<()> {
    tracing::info!("Starting mock server at {}", socket_address);
    let listener = std::net::TcpListener::bind(socket_address).unwrap();
    listener.set_nonblocking(true).unwrap();
    let listener = tokio::net::TcpListener::from_std(listener).unwrap();
    tokio::spawn(async move {
        let router = make_router(
            Arc::new(mock_handler),
            Arc::new(NotaryMetrics::new_for_testing()),
            Arc::new(NotaryNodePublicMetadata::empty_for_testing()),
        );
        axum::serve(listener, router).await.unwrap()
    })
}
