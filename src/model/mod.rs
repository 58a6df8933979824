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

//! Core data model for metrics aggregation
//!
//! Defines the observation type produced by sources and the key under which
//! observations are accumulated.

use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A single observation decoded from a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Metric name, including any configured namespace
    pub name: String,

    /// The type of metric (counter, gauge, timer, set)
    #[serde(rename = "type")]
    pub metric_type: MetricType,

    /// Observed value
    pub value: f64,

    /// Tags attached to the observation
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Fraction of true events the client reported, in (0, 1]
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

impl Metric {
    /// Create an untagged, unsampled metric
    pub fn new(name: impl Into<String>, metric_type: MetricType, value: f64) -> Self {
        Self {
            name: name.into(),
            metric_type,
            value,
            tags: BTreeSet::new(),
            sample_rate: default_sample_rate(),
        }
    }

    /// Replace the sample rate
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Replace the tag set
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Identity under which this observation aggregates
    pub fn key(&self) -> MetricKey {
        MetricKey::new(self.name.clone(), self.tags.clone())
    }
}

fn default_sample_rate() -> f64 {
    1.0
}

/// Type of metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Summed between flushes, reset on flush
    Counter,
    /// Last value wins, survives flushes
    Gauge,
    /// Duration distribution
    Timer,
    /// Distinct value cardinality
    Set,
}

impl MetricType {
    /// StatsD wire tag for this type
    pub fn as_tag(&self) -> &'static str {
        match self {
            MetricType::Counter => "c",
            MetricType::Gauge => "g",
            MetricType::Timer => "ms",
            MetricType::Set => "s",
        }
    }

    /// Plural name used by consoles and sinks
    pub fn plural(&self) -> &'static str {
        match self {
            MetricType::Counter => "counters",
            MetricType::Gauge => "gauges",
            MetricType::Timer => "timers",
            MetricType::Set => "sets",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// An observation carried a type tag that is not one of `c`, `g`, `ms`, `s`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid metric kind: {0:?}")]
pub struct InvalidMetricKind(pub String);

impl FromStr for MetricType {
    type Err = InvalidMetricKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "c" => Ok(MetricType::Counter),
            "g" => Ok(MetricType::Gauge),
            "ms" => Ok(MetricType::Timer),
            "s" => Ok(MetricType::Set),
            other => Err(InvalidMetricKind(other.to_string())),
        }
    }
}

/// Key for identifying unique metric series (name + tag set)
///
/// Tags are kept in a sorted set so that two observations carrying the same
/// tags in a different order map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    /// Name of the metric
    pub name: String,

    /// Tags for this metric series
    pub tags: BTreeSet<String>,
}

impl MetricKey {
    /// Create a new metric key
    pub fn new(name: impl Into<String>, tags: BTreeSet<String>) -> Self {
        Self {
            name: name.into(),
            tags,
        }
    }

    /// Create a key with no tags
    pub fn untagged(name: impl Into<String>) -> Self {
        Self::new(name, BTreeSet::new())
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        let mut tags = self.tags.iter();
        if let Some(first) = tags.next() {
            write!(f, "#{}", first)?;
            for tag in tags {
                write!(f, ",{}", tag)?;
            }
        }
        Ok(())
    }
}

// Keys render as `name#tag1,tag2` so summaries and snapshots serialize as
// plain JSON objects.
impl Serialize for MetricKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
