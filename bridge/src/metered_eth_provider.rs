// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::metrics::NotaryMetrics;
use ethers::providers::{Http, HttpClientError, JsonRpcClient, Provider};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use url::{ParseError, Url};

/// HTTP transport that counts and times every JSON-RPC call by method and
/// tracks whether the node is reachable.
#[derive(Debug, Clone)]
pub struct MeteredEthHttpProvider {
    inner: Http,
    metrics: Arc<NotaryMetrics>,
}

#[async_trait::async_trait]
impl JsonRpcClient for MeteredEthHttpProvider {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        self.metrics
            .eth_rpc_queries
            .with_label_values(&[method])
            .inc();
        let _guard = self
            .metrics
            .eth_rpc_queries_latency
            .with_label_values(&[method])
            .start_timer();
        let result = self.inner.request(method, params).await;
        match &result {
            Ok(_) => self.metrics.eth_node_connected.set(1),
            Err(_) => self.metrics.eth_node_connected.set(0),
        }
        result
    }
}

impl MeteredEthHttpProvider {
    pub fn new(url: impl Into<Url>, metrics: Arc<NotaryMetrics>) -> Self {
        Self {
            inner: Http::new(url),
            metrics,
        }
    }
}

pub fn new_metered_eth_provider(
    url: &str,
    metrics: Arc<NotaryMetrics>,
) -> Result<Provider<MeteredEthHttpProvider>, ParseError> {
    let http_provider = MeteredEthHttpProvider::new(Url::parse(url)?, metrics);
    Ok(Provider::new(http_provider))
}
