// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Confirmation-delayed Chain-A block cursor.
//!
//! The listener follows the Chain-A head through [`HeadFeed`], accepts heads
//! strictly one at a time and hands the block `confirmation_lag` below each
//! accepted head to a [`BlockHandler`]. The cursor is persisted only after the
//! handler returns, so a crash redelivers the last block on restart.

use crate::error::BridgeError;
use crate::eth_client::ChainAClient;
use crate::metrics::NotaryMetrics;
use crate::retry_with_max_elapsed_time;
use async_trait::async_trait;
use ethers::types::{Block, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub mod cursor;
pub mod feed;

pub use cursor::{CursorStore, FileCursorStore, InMemoryCursorStore};
pub use feed::HeadFeed;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("out of order block: expected {expected}, got {got}")]
    OutOfOrderBlock { expected: u64, got: u64 },
    #[error("Chain-A node unavailable: {0}")]
    Upstream(String),
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("block handler failed: {0}")]
    Handler(BridgeError),
    #[error("cursor storage error: {0}")]
    Storage(String),
    #[error("listener closed")]
    Closed,
}

impl ListenerError {
    pub fn into_bridge_error(self) -> BridgeError {
        match self {
            ListenerError::OutOfOrderBlock { expected, got } => {
                BridgeError::OutOfOrderBlock { expected, got }
            }
            ListenerError::Upstream(e) => BridgeError::ChainUnavailable(e),
            ListenerError::BlockNotFound(h) => {
                BridgeError::ChainUnavailable(format!("block {} not found", h))
            }
            ListenerError::Handler(e) => e,
            ListenerError::Storage(e) => BridgeError::StorageError(e),
            ListenerError::Closed => BridgeError::ListenerClosed,
        }
    }
}

/// Consumer of finalized Chain-A blocks. Must be idempotent per transaction.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn handle_block(&self, block: Block<Transaction>) -> crate::error::BridgeResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Streaming,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub start_block: u64,
    pub confirmation_lag: u64,
    pub ignore_start_block: bool,
    pub poll_interval: Duration,
    pub channel_size: usize,
    /// How long a failing handler is retried before the listener gives up.
    pub handler_max_retry_time: Duration,
}

pub struct ChainAListener {
    config: ListenerConfig,
    client: Arc<dyn ChainAClient>,
    cursor_store: Arc<dyn CursorStore>,
    handler: Arc<dyn BlockHandler>,
    metrics: Arc<NotaryMetrics>,
    last_processed_height: u64,
    state: ListenerState,
    closed: bool,
}

impl ChainAListener {
    /// Resolve the starting cursor. A stored height never moves the cursor
    /// below `start_block`; `ignore_start_block` starts from the current head.
    pub async fn new(
        config: ListenerConfig,
        client: Arc<dyn ChainAClient>,
        cursor_store: Arc<dyn CursorStore>,
        handler: Arc<dyn BlockHandler>,
        metrics: Arc<NotaryMetrics>,
    ) -> Result<Self, ListenerError> {
        let last_processed_height = if config.ignore_start_block {
            let head = client
                .latest_block_number()
                .await
                .map_err(|e| ListenerError::Upstream(e.to_string()))?;
            info!(
                "[ChainAListener] Ignoring stored cursor, starting from chain head {}",
                head
            );
            head
        } else {
            let stored = cursor_store.load()?;
            stored.unwrap_or(0).max(config.start_block)
        };
        metrics
            .last_processed_chain_a_block
            .set(last_processed_height as i64);
        Ok(Self {
            config,
            client,
            cursor_store,
            handler,
            metrics,
            last_processed_height,
            state: ListenerState::Idle,
            closed: false,
        })
    }

    pub fn last_processed_height(&self) -> u64 {
        self.last_processed_height
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Stop accepting heads. Nothing is delivered after this returns.
    pub fn close(&mut self) {
        if !self.closed {
            info!(
                "[ChainAListener] Closed at height {}",
                self.last_processed_height
            );
        }
        self.closed = true;
    }

    /// Process one head height.
    pub async fn on_head(&mut self, height: u64) -> Result<(), ListenerError> {
        if self.closed {
            return Err(ListenerError::Closed);
        }
        if height <= self.last_processed_height {
            debug!(
                "[ChainAListener] Dropping stale head {} (cursor {})",
                height, self.last_processed_height
            );
            return Ok(());
        }
        let expected = self.last_processed_height + 1;
        if height != expected {
            error!(
                "[ChainAListener] Out of order head: expected {}, got {}",
                expected, height
            );
            self.state = ListenerState::Failed;
            return Err(ListenerError::OutOfOrderBlock {
                expected,
                got: height,
            });
        }

        // Heads below the lag have nothing final behind them yet.
        if let Some(target) = height.checked_sub(self.config.confirmation_lag) {
            let block = self
                .client
                .block_with_transactions(target)
                .await
                .map_err(|e| ListenerError::Upstream(e.to_string()))?
                .ok_or(ListenerError::BlockNotFound(target))?;
            let handler = self.handler.clone();
            retry_with_max_elapsed_time!(
                handler.handle_block(block.clone()),
                self.config.handler_max_retry_time
            )
            .map_err(ListenerError::Handler)?
            .map_err(ListenerError::Handler)?;
        }

        self.cursor_store.save(height)?;
        self.last_processed_height = height;
        self.metrics
            .last_processed_chain_a_block
            .set(height as i64);
        Ok(())
    }

    /// Follow the chain until cancelled or a fatal error occurs.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ListenerError> {
        let feed = HeadFeed::new(
            self.client.clone(),
            self.config.poll_interval,
            self.config.channel_size,
        );
        let (feed_handle, mut heads) = feed.spawn(
            self.last_processed_height + 1,
            cancel.child_token(),
        );
        self.state = ListenerState::Streaming;
        info!(
            "[ChainAListener] Streaming from height {} with lag {}",
            self.last_processed_height + 1,
            self.config.confirmation_lag
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.close();
                    return Ok(());
                }
                head = heads.recv() => {
                    let Some(head) = head else {
                        let result = match feed_handle.await {
                            Ok(result) => result,
                            Err(e) => Err(ListenerError::Upstream(e.to_string())),
                        };
                        if let Err(e) = &result {
                            error!("[ChainAListener] Head feed failed: {}", e);
                            self.state = ListenerState::Failed;
                        }
                        self.close();
                        return result;
                    };
                    if let Err(e) = self.on_head(head).await {
                        error!("[ChainAListener] Stopping at head {}: {}", head, e);
                        self.state = ListenerState::Failed;
                        self.metrics.observe_error(&e.clone().into_bridge_error());
                        return Err(e);
                    }
                }
            }
        }
    }
}
