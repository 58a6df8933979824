/*
 * Copyright 2024 ArpNetworking
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! UDP StatsD receiver
//!
//! Several receive loops share one socket. Each loop decodes a datagram and
//! submits its records in order, so records from one packet are applied in
//! the order the client wrote them.

use super::parser::parse_packet;
use super::MetricsSource;
use crate::aggregation::{EngineError, EngineHandle};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest datagram accepted
const MAX_PACKET_SIZE: usize = 65_535;

/// StatsD over UDP
#[derive(Debug, Clone)]
pub struct StatsdSource {
    address: SocketAddr,
    namespace: Option<String>,
    workers: usize,
}

impl StatsdSource {
    /// Create a source listening on `address`
    pub fn new(address: SocketAddr, namespace: Option<String>, workers: usize) -> Self {
        Self {
            address,
            namespace,
            workers: workers.max(1),
        }
    }

    /// Receive on an already bound socket until `shutdown` is cancelled
    pub async fn serve(
        &self,
        socket: UdpSocket,
        handle: EngineHandle,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let socket = Arc::new(socket);
        info!(
            address = %socket.local_addr()?,
            workers = self.workers,
            "StatsD source listening"
        );

        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            workers.spawn(receive_loop(
                worker,
                Arc::clone(&socket),
                handle.clone(),
                self.namespace.clone(),
                shutdown.clone(),
            ));
        }

        while let Some(result) = workers.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "StatsD receive loop failed");
            }
        }

        info!("StatsD source stopped");
        Ok(())
    }
}

#[async_trait]
impl MetricsSource for StatsdSource {
    async fn run(&self, handle: EngineHandle, shutdown: CancellationToken) -> Result<()> {
        let socket = UdpSocket::bind(self.address)
            .await
            .with_context(|| format!("Failed to bind StatsD socket on {}", self.address))?;
        self.serve(socket, handle, shutdown).await
    }

    fn name(&self) -> &str {
        "statsd"
    }
}

async fn receive_loop(
    worker: usize,
    socket: Arc<UdpSocket>,
    handle: EngineHandle,
    namespace: Option<String>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let len = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _)) => len,
                Err(err) => {
                    warn!(worker, error = %err, "Failed to receive datagram");
                    continue;
                }
            },
        };

        for result in parse_packet(&buf[..len], namespace.as_deref()) {
            match result {
                Ok(metric) => match handle.submit(metric).await {
                    Ok(()) => {}
                    Err(EngineError::QueueOverflow) => {
                        debug!(worker, "Engine queue full, metric dropped");
                    }
                    Err(EngineError::Stopped) => {
                        debug!(worker, "Engine stopped, receive loop exiting");
                        return;
                    }
                },
                Err(err) => {
                    debug!(worker, error = %err, "Discarding undecodable metric");
                    handle.record_invalid();
                }
            }
        }
    }
}
