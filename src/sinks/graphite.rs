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

//! Graphite plaintext protocol sink
//!
//! Every statistic becomes one `path value timestamp` line. Tags are appended
//! to the path using Graphite's `;name=value` tag syntax: a `key:value` tag
//! becomes `;key=value` and a bare tag becomes `;tag=true`.

use super::{DeliveryError, MetricsSink, Summary};
use crate::model::MetricKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Graphite sink configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphiteConfig {
    /// Carbon plaintext listener (`host:port`)
    pub address: String,

    /// Root of every metric path
    pub prefix: String,
}

impl Default for GraphiteConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2003".to_string(),
            prefix: "stats".to_string(),
        }
    }
}

/// Sink writing summaries to a Carbon plaintext listener
pub struct GraphiteSink {
    config: GraphiteConfig,
    connection: Mutex<Option<TcpStream>>,
}

impl GraphiteSink {
    /// Create a sink; the connection is opened on first delivery
    pub fn new(config: GraphiteConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MetricsSink for GraphiteSink {
    async fn send(&self, summary: &Summary) -> Result<(), DeliveryError> {
        let payload = render(&self.config.prefix, summary);
        if payload.is_empty() {
            return Ok(());
        }

        // The stream is only put back after a complete write, so a failed or
        // cancelled send never leaves a partial line on a reused connection
        let mut connection = self.connection.lock().await;
        let mut stream = match connection.take() {
            Some(stream) => stream,
            None => {
                debug!(address = %self.config.address, "Connecting to graphite");
                TcpStream::connect(&self.config.address).await?
            }
        };

        stream.write_all(payload.as_bytes()).await?;
        *connection = Some(stream);
        Ok(())
    }

    async fn close(&self) -> Result<(), DeliveryError> {
        if let Some(mut stream) = self.connection.lock().await.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "graphite"
    }
}

/// Render a summary as Graphite plaintext lines
pub fn render(prefix: &str, summary: &Summary) -> String {
    let timestamp = summary.timestamp.timestamp();
    let mut out = String::new();
    let mut line = |kind: &str, key: &MetricKey, stat: Option<&str>, value: f64| {
        let _ = write!(out, "{}.{}.{}", prefix, kind, sanitize(&key.name));
        if let Some(stat) = stat {
            let _ = write!(out, ".{}", stat);
        }
        for tag in &key.tags {
            let _ = write!(out, ";{}", graphite_tag(tag));
        }
        let _ = writeln!(out, " {} {}", value, timestamp);
    };

    for (key, counter) in &summary.counters {
        line("counters", key, Some("count"), counter.value);
        line("counters", key, Some("rate"), counter.rate(summary.interval));
        line("counters", key, Some("total"), counter.values_since_reset);
    }

    for (key, value) in &summary.gauges {
        line("gauges", key, None, *value);
    }

    for (key, timer) in &summary.timers {
        line("timers", key, Some("count"), timer.count as f64);
        line("timers", key, Some("sum"), timer.sum);
        line("timers", key, Some("min"), timer.min);
        line("timers", key, Some("max"), timer.max);
        line("timers", key, Some("mean"), timer.mean);
        for percentile in &timer.percentiles {
            let bound = if percentile.threshold < 0.0 {
                "lower"
            } else {
                "upper"
            };
            let label = &percentile.label;
            let stats = [
                (format!("{}_{}", bound, label), percentile.value),
                (format!("count_{}", label), percentile.count as f64),
                (format!("sum_{}", label), percentile.sum),
                (format!("mean_{}", label), percentile.mean),
            ];
            for (stat, value) in &stats {
                line("timers", key, Some(stat.as_str()), *value);
            }
        }
    }

    for (key, cardinality) in &summary.sets {
        line("sets", key, Some("count"), *cardinality as f64);
    }

    out
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            c if c.is_whitespace() => '_',
            '/' => '-',
            ';' | '=' => '_',
            c => c,
        })
        .collect()
}

fn graphite_tag(tag: &str) -> String {
    match tag.split_once(':') {
        Some((name, value)) => format!("{}={}", sanitize(name), sanitize(value)),
        None => format!("{}=true", sanitize(tag)),
    }
}
