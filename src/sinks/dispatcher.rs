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

//! Fan-out of flushed summaries to every configured sink
//!
//! Delivery is best effort: each sink gets one attempt per summary, bounded
//! by a deadline, concurrently with the others. A failing sink is logged and
//! counted and never affects the remaining sinks or later flushes.
//!
//! Summaries arrive on a bounded broadcast channel. When sinks fall behind,
//! the oldest pending summaries are overwritten; the dispatcher counts the gap
//! and continues with the oldest summary still queued.

use super::{DeliveryError, MetricsSink, Summary};
use crate::aggregation::EngineStats;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// Delivers summaries to a fixed set of sinks
pub struct Dispatcher {
    sinks: Vec<Arc<dyn MetricsSink>>,
    timeout: Duration,
    stats: Arc<EngineStats>,
}

impl Dispatcher {
    /// Create a dispatcher over `sinks`
    pub fn new(
        sinks: Vec<Arc<dyn MetricsSink>>,
        timeout: Duration,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            sinks,
            timeout,
            stats,
        }
    }

    /// Names of the configured sinks
    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    /// Deliver one summary to every sink, returning the number of failures
    pub async fn dispatch(&self, summary: &Summary) -> usize {
        let deliveries = self.sinks.iter().map(|sink| async move {
            let result = match tokio::time::timeout(self.timeout, sink.send(summary)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(self.timeout)),
            };
            (sink.name(), result)
        });

        let mut failures = 0;
        for (name, result) in join_all(deliveries).await {
            if let Err(err) = result {
                warn!(sink = name, error = %err, "Failed to deliver summary");
                self.stats.record_delivery_failure();
                failures += 1;
            }
        }
        failures
    }

    /// Deliver summaries until the engine releases its output channel, then
    /// close every sink
    pub async fn run(self, mut receiver: broadcast::Receiver<Summary>) {
        info!(sinks = ?self.sink_names(), "Sink dispatcher started");

        loop {
            let summary = match receiver.recv().await {
                Ok(summary) => summary,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Sinks fell behind, skipping stale summaries");
                    self.stats.record_dropped_summaries(skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let failures = self.dispatch(&summary).await;
            debug!(entries = summary.len(), failures, "Dispatched summary");
        }

        for sink in &self.sinks {
            if let Err(err) = sink.close().await {
                warn!(sink = sink.name(), error = %err, "Failed to close sink");
            }
        }
        info!("Sink dispatcher stopped");
    }
}
