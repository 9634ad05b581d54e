// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for one peer notary's signing endpoints.

use crate::crypto::{parse_signature, Vrs};
use crate::error::{BridgeError, BridgeResult};
use crate::server::{ADD_PEER_PROOF_PATH_PREFIX, REGISTRATION_PROOF_PATH_PREFIX, WITHDRAWAL_PROOF_PATH_PREFIX};
use crate::types::EthNotaryResponse;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct NotaryClient {
    inner: reqwest::Client,
    name: String,
    base_url: Url,
}

impl NotaryClient {
    pub fn new(name: impl Into<String>, base_url: Url) -> BridgeResult<Self> {
        let inner = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::RestAPIError(format!("failed to build client: {}", e)))?;
        Ok(Self {
            inner,
            name: name.into(),
            base_url,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn request_withdrawal_proof(&self, trigger_hash: &str) -> BridgeResult<Vrs> {
        self.request_signature(WITHDRAWAL_PROOF_PATH_PREFIX, trigger_hash)
            .await
    }

    pub async fn request_add_peer_proof(&self, trigger_hash: &str) -> BridgeResult<Vrs> {
        self.request_signature(ADD_PEER_PROOF_PATH_PREFIX, trigger_hash)
            .await
    }

    pub async fn request_registration_proof(&self, trigger_hash: &str) -> BridgeResult<Vrs> {
        self.request_signature(REGISTRATION_PROOF_PATH_PREFIX, trigger_hash)
            .await
    }

    fn url_for(&self, prefix: &str, trigger_hash: &str) -> String {
        format!(
            "{}{}{}",
            self.base_url.as_str().trim_end_matches('/'),
            prefix,
            trigger_hash
        )
    }

    async fn request_signature(&self, prefix: &str, trigger_hash: &str) -> BridgeResult<Vrs> {
        let url = self.url_for(prefix, trigger_hash);
        debug!("[NotaryClient] {} GET {}", self.name, url);
        let response = self
            .inner
            .get(&url)
            .send()
            .await
            .map_err(|e| BridgeError::RestAPIError(format!("{}: {}", self.name, e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BridgeError::RestAPIError(format!("{}: {}", self.name, e)))?;
        let body = serde_json::from_str::<EthNotaryResponse>(&text);
        if status != StatusCode::OK {
            return Err(match body {
                Ok(EthNotaryResponse::Error { reason }) => BridgeError::PeerRejected(reason),
                _ => BridgeError::RestAPIError(format!(
                    "{} answered with status {}: {}",
                    self.name, status, text
                )),
            });
        }
        match body.map_err(|e| {
            BridgeError::BridgeSerializationError(format!("{}: {}: {}", self.name, e, text))
        })? {
            EthNotaryResponse::Successful { eth_signature } => parse_signature(&eth_signature),
            EthNotaryResponse::Error { reason } => Err(BridgeError::PeerRejected(reason)),
        }
    }
}
