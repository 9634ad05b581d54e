// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::ListenerError;
use crate::eth_client::ChainAClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Ordered stream of Chain-A head heights, polled from the node.
pub struct HeadFeed {
    client: Arc<dyn ChainAClient>,
    poll_interval: Duration,
    channel_size: usize,
}

impl HeadFeed {
    pub fn new(client: Arc<dyn ChainAClient>, poll_interval: Duration, channel_size: usize) -> Self {
        Self {
            client,
            poll_interval,
            channel_size,
        }
    }

    /// Emit every height from `from_height` on, strictly increasing and without
    /// gaps. A node error ends the feed with `ListenerError::Upstream`.
    pub fn spawn(
        self,
        from_height: u64,
        cancel: CancellationToken,
    ) -> (JoinHandle<Result<(), ListenerError>>, mpsc::Receiver<u64>) {
        let (tx, rx) = mpsc::channel(self.channel_size);
        let handle = tokio::spawn(async move {
            info!("[HeadFeed] Starting from height {}", from_height);
            let mut next = from_height;
            let mut interval = time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[HeadFeed] Cancelled");
                        return Ok(());
                    }
                    _ = interval.tick() => {
                        let latest = self.client.latest_block_number().await.map_err(|e| {
                            error!("[HeadFeed] Lost connection to Chain-A node: {:?}", e);
                            ListenerError::Upstream(e.to_string())
                        })?;
                        while next <= latest {
                            debug!("[HeadFeed] New head {}", next);
                            if tx.send(next).await.is_err() {
                                return Ok(());
                            }
                            next += 1;
                        }
                    }
                }
            }
        });
        (handle, rx)
    }
}
