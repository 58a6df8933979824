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

//! Metric sinks for outputting aggregated data to various destinations
//!
//! Sinks receive the [`Summary`] produced by every flush and forward it to
//! external systems for storage. Sinks are chosen from configuration when the
//! daemon is constructed; there is no runtime registration by name.

use crate::aggregation::percentile::Percentile;
use crate::config::ConfigError;
use crate::model::MetricKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub mod dispatcher;
pub mod graphite;
pub mod stdout;

pub use dispatcher::Dispatcher;

/// Trait for all metric sinks
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Deliver one flush summary to this sink
    async fn send(&self, summary: &Summary) -> Result<(), DeliveryError>;

    /// Close the sink gracefully
    async fn close(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    /// Get the name of this sink
    fn name(&self) -> &str;
}

/// A sink failed to accept a summary
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Connection or write failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The sink did not finish within the configured deadline
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    /// The summary could not be encoded for this sink
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Aggregated metrics produced by a single flush
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    /// Wall clock time of the flush
    pub timestamp: DateTime<Utc>,

    /// Configured flush interval the summary covers
    pub interval: Duration,

    /// Counters by key
    pub counters: BTreeMap<MetricKey, CounterSummary>,

    /// Gauges by key
    pub gauges: BTreeMap<MetricKey, f64>,

    /// Timers with at least one sample, by key
    pub timers: BTreeMap<MetricKey, TimerSummary>,

    /// Set cardinalities by key
    pub sets: BTreeMap<MetricKey, usize>,
}

impl Summary {
    /// Create an empty summary
    pub fn new(timestamp: DateTime<Utc>, interval: Duration) -> Self {
        Self {
            timestamp,
            interval,
            counters: BTreeMap::new(),
            gauges: BTreeMap::new(),
            timers: BTreeMap::new(),
            sets: BTreeMap::new(),
        }
    }

    /// Total number of entries across all kinds
    pub fn len(&self) -> usize {
        self.counters.len() + self.gauges.len() + self.timers.len() + self.sets.len()
    }

    /// Whether the summary carries no entries at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counter statistics for one flush
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CounterSummary {
    /// Sample-rate corrected total since the previous flush
    pub value: f64,

    /// Total since process start
    pub values_since_reset: f64,
}

impl CounterSummary {
    /// Per-second rate over the flush interval
    pub fn rate(&self, interval: Duration) -> f64 {
        let secs = interval.as_secs_f64();
        if secs > 0.0 {
            self.value / secs
        } else {
            self.value
        }
    }
}

/// Timer statistics for one flush
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerSummary {
    /// Number of samples
    pub count: usize,

    /// Sum of all samples
    pub sum: f64,

    /// Minimum sample
    pub min: f64,

    /// Maximum sample
    pub max: f64,

    /// Arithmetic mean
    pub mean: f64,

    /// One entry per configured threshold
    pub percentiles: Vec<Percentile>,
}

/// Sink selection as it appears in configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Graphite plaintext protocol over TCP
    Graphite(graphite::GraphiteConfig),
    /// JSON lines on standard output
    Stdout,
}

impl SinkConfig {
    /// Default configuration for a sink given by name (CLI `--backends`)
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim() {
            "graphite" => Ok(SinkConfig::Graphite(graphite::GraphiteConfig::default())),
            "stdout" => Ok(SinkConfig::Stdout),
            other => Err(ConfigError::InvalidSetting(format!(
                "unknown backend: {}",
                other
            ))),
        }
    }

    /// Construct the sink
    pub fn build(&self) -> Arc<dyn MetricsSink> {
        match self {
            SinkConfig::Graphite(config) => Arc::new(graphite::GraphiteSink::new(config.clone())),
            SinkConfig::Stdout => Arc::new(stdout::StdoutSink::new()),
        }
    }
}
