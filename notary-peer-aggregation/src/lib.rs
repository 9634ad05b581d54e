// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fan a request out to every peer and fold the answers as they arrive.
//!
//! Each peer call runs under its own timeout; a peer that times out is reported
//! to the reducer like any other failure, so one slow peer never holds up the
//! rest of the collection.

use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;

pub type AsyncResult<'a, T, E> = BoxFuture<'a, Result<T, E>>;

// Result of one reduce step
pub enum ReduceOutput<R, S> {
    Continue(S),
    Failed(S),
    Success(R),
}

impl<R, S> ReduceOutput<R, S> {
    pub fn map_err<E, F>(self, f: F) -> Result<R, E>
    where
        F: FnOnce(S) -> E,
    {
        match self {
            ReduceOutput::Success(r) => Ok(r),
            ReduceOutput::Failed(s) | ReduceOutput::Continue(s) => Err(f(s)),
        }
    }
}

/// Why a single peer produced no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCallError<E> {
    Timeout(Duration),
    Peer(E),
}

impl<E: fmt::Display> fmt::Display for PeerCallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerCallError::Timeout(d) => write!(f, "peer timed out after {:?}", d),
            PeerCallError::Peer(e) => write!(f, "{}", e),
        }
    }
}

/// Query every client concurrently and feed each outcome to `reduce_result`
/// in arrival order.
///
/// Returns `Ok` as soon as the reducer reports `Success`, and `Err(state)` when
/// the reducer reports `Failed` or every peer has answered without success.
pub async fn map_then_reduce_with_timeout<'a, K, Client, State, V, R, E, FMap, FReduce>(
    clients: Arc<BTreeMap<K, Arc<Client>>>,
    mut accumulated_state: State,
    map_each_peer: FMap,
    reduce_result: FReduce,
    per_peer_timeout: Duration,
) -> Result<R, State>
where
    K: Ord + Clone + Send + 'a,
    Client: Send + Sync + 'a,
    FMap: FnOnce(K, Arc<Client>) -> AsyncResult<'a, V, E> + Clone + Send + 'a,
    FReduce: Fn(State, K, Result<V, PeerCallError<E>>) -> BoxFuture<'a, ReduceOutput<R, State>>
        + Send
        + 'a,
    State: Send + 'a,
    V: Send + 'a,
    E: Send + 'a,
{
    let mut responses: FuturesUnordered<_> = clients
        .iter()
        .map(|(name, client)| {
            let execute = map_each_peer.clone();
            let name = name.clone();
            let client = client.clone();
            async move {
                let result = match tokio_timeout(per_peer_timeout, execute(name.clone(), client))
                    .await
                {
                    Ok(Ok(v)) => Ok(v),
                    Ok(Err(e)) => Err(PeerCallError::Peer(e)),
                    Err(_) => Err(PeerCallError::Timeout(per_peer_timeout)),
                };
                (name, result)
            }
        })
        .collect();

    while let Some((peer, result)) = responses.next().await {
        accumulated_state = match reduce_result(accumulated_state, peer, result).await {
            ReduceOutput::Continue(state) => state,
            ReduceOutput::Failed(state) => return Err(state),
            ReduceOutput::Success(result) => return Ok(result),
        };
    }

    // Every peer has answered
    Err(accumulated_state)
}
