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

//! Configuration parsing and validation
//!
//! Configuration is read from a JSON file with camelCase keys. Every field has
//! a default matching the classic statsd daemon, so an empty object is a valid
//! configuration. Durations accept both ISO-8601 (`"PT1.5S"`) and humantime
//! (`"1m30s"`) notation.

use crate::aggregation::percentile::Threshold;
use crate::aggregation::{EngineConfig, OverflowPolicy};
use crate::sinks::graphite::GraphiteConfig;
use crate::sinks::SinkConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Invalid configuration; fatal at startup
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Percentile threshold not numeric, zero, or outside `[-100, 100]`
    #[error("invalid percentile threshold: {0}")]
    InvalidThreshold(String),

    /// Interval unusable by the engine
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    /// Duration text that does not parse, or is negative
    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    /// Any other out-of-range setting
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
}

/// Main daemon configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TallydConfig {
    /// UDP address metrics are received on
    pub metrics_addr: SocketAddr,

    /// Number of parallel receive loops on the metrics socket
    pub receiver_workers: usize,

    /// Prefix prepended (with a `.`) to every metric name
    pub namespace: Option<String>,

    /// Telnet console address; `null` disables it
    pub console_addr: Option<SocketAddr>,

    /// HTTP console address; `null` disables it
    pub web_console_addr: Option<SocketAddr>,

    /// How often summaries are flushed to sinks
    #[serde(with = "duration_serde")]
    pub flush_interval: Duration,

    /// Idle time before a metric is forgotten; zero disables expiry
    #[serde(with = "duration_serde")]
    pub expiry_interval: Duration,

    /// Percentiles computed for every timer
    pub percent_thresholds: Vec<f64>,

    /// Capacity of the queue between receivers and the engine
    pub queue_capacity: usize,

    /// Behaviour of receivers when the queue is full
    pub overflow_policy: OverflowPolicy,

    /// Emit one last summary when shutting down
    pub flush_on_shutdown: bool,

    /// Deadline for each sink to accept a summary; defaults to the flush
    /// interval and may not exceed it
    #[serde(
        with = "option_duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub sink_timeout: Option<Duration>,

    /// Flushed summaries held for the sinks; the oldest are skipped once
    /// sinks fall this far behind
    pub summary_backlog: usize,

    /// Sinks every summary is delivered to
    pub backends: Vec<SinkConfig>,
}

impl Default for TallydConfig {
    fn default() -> Self {
        Self {
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8125)),
            receiver_workers: 2,
            namespace: None,
            console_addr: Some(SocketAddr::from(([0, 0, 0, 0], 8126))),
            web_console_addr: Some(SocketAddr::from(([0, 0, 0, 0], 8181))),
            flush_interval: Duration::from_secs(1),
            expiry_interval: Duration::from_secs(5 * 60),
            percent_thresholds: vec![90.0],
            queue_capacity: 10_000,
            overflow_policy: OverflowPolicy::Block,
            flush_on_shutdown: true,
            sink_timeout: None,
            summary_backlog: 4,
            backends: vec![SinkConfig::Graphite(GraphiteConfig::default())],
        }
    }
}

impl TallydConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&contents)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse configuration")
    }

    /// Validated percentile thresholds
    pub fn thresholds(&self) -> Result<Vec<Threshold>, ConfigError> {
        self.percent_thresholds
            .iter()
            .map(|value| Threshold::new(*value))
            .collect()
    }

    /// Engine parameters derived from this configuration
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let config = EngineConfig {
            flush_interval: self.flush_interval,
            expiry_interval: self.expiry_interval,
            percent_thresholds: self.thresholds()?,
            queue_capacity: self.queue_capacity,
            overflow_policy: self.overflow_policy,
            flush_on_shutdown: self.flush_on_shutdown,
        };
        config.validate()?;
        Ok(config)
    }

    /// Effective per-sink delivery deadline
    pub fn sink_timeout(&self) -> Duration {
        self.sink_timeout.unwrap_or(self.flush_interval)
    }

    /// Check every setting the daemon depends on
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine_config()?;
        if self.receiver_workers == 0 {
            return Err(ConfigError::InvalidSetting(
                "receiver workers must be at least 1".to_string(),
            ));
        }
        let sink_timeout = self.sink_timeout();
        if sink_timeout.is_zero() {
            return Err(ConfigError::InvalidInterval(
                "sink timeout must be greater than zero".to_string(),
            ));
        }
        if sink_timeout > self.flush_interval {
            return Err(ConfigError::InvalidInterval(format!(
                "sink timeout {:?} exceeds flush interval {:?}",
                sink_timeout, self.flush_interval
            )));
        }
        if self.summary_backlog == 0 {
            return Err(ConfigError::InvalidSetting(
                "summary backlog must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a duration in ISO-8601 (`PT1.5S`) or humantime (`1m30s`, `250ms`)
/// notation
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(raw.to_string());
    let s = raw.trim();

    if s.is_empty() || s.starts_with('-') {
        return Err(invalid());
    }

    if let Some(seconds) = s.strip_prefix("PT").and_then(|rest| rest.strip_suffix('S')) {
        let seconds: f64 = seconds.parse().map_err(|_| invalid())?;
        return Duration::try_from_secs_f64(seconds).map_err(|_| invalid());
    }

    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|_| invalid())
}

/// Parse a listen address; `:port` binds every interface and an empty
/// string disables the listener
pub fn parse_listen_addr(raw: &str) -> Result<Option<SocketAddr>, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let candidate = if raw.starts_with(':') {
        format!("0.0.0.0{}", raw)
    } else {
        raw.to_string()
    };
    candidate
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidSetting(format!("invalid listen address: {}", raw)))
}

// Duration serialization helpers
mod duration_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // ISO-8601 duration format (PT1.5S)
        let seconds = duration.as_secs_f64();
        let iso_duration = format!("PT{}S", seconds);
        serializer.serialize_str(&iso_duration)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod option_duration_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => super::duration_serde::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parsing() {
        let json_config = r#"
        {
            "metricsAddr": "127.0.0.1:9125",
            "namespace": "app",
            "consoleAddr": null,
            "flushInterval": "PT10.0S",
            "expiryInterval": "0",
            "percentThresholds": [90, 99.9, -10],
            "overflowPolicy": "drop",
            "backends": [{"type": "stdout"}]
        }
        "#;

        let config = TallydConfig::from_json(json_config).unwrap();
        assert_eq!(config.metrics_addr.port(), 9125);
        assert_eq!(config.namespace.as_deref(), Some("app"));
        assert_eq!(config.console_addr, None);
        assert_eq!(config.web_console_addr.map(|a| a.port()), Some(8181));
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(config.expiry_interval, Duration::ZERO);
        assert_eq!(config.overflow_policy, OverflowPolicy::Drop);
        assert_eq!(config.backends, vec![SinkConfig::Stdout]);

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.percent_thresholds.len(), 3);
        assert!(engine.percent_thresholds[2].is_bottom());
    }

    #[test]
    fn test_defaults() {
        let config = TallydConfig::from_json("{}").unwrap();
        assert_eq!(config, TallydConfig::default());
        assert_eq!(config.metrics_addr.port(), 8125);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert_eq!(config.expiry_interval, Duration::from_secs(300));
        assert_eq!(config.percent_thresholds, vec![90.0]);
        assert_eq!(config.sink_timeout(), config.flush_interval);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_parsing() {
        let json_config = r#"{
            "flushInterval": "PT5.5S",
            "expiryInterval": "1m30s",
            "sinkTimeout": "2s"
        }"#;

        let config = TallydConfig::from_json(json_config).unwrap();
        assert_eq!(config.flush_interval, Duration::from_secs_f64(5.5));
        assert_eq!(config.expiry_interval, Duration::from_secs(90));
        assert_eq!(config.sink_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unit_suffixed_durations() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1h15m").unwrap(), Duration::from_secs(4500));
        assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("20us").unwrap(), Duration::from_micros(20));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_invalid_durations() {
        for raw in ["", "-5s", "5", "5x", "s", "PTxS", "1.2.3s"] {
            assert_eq!(
                parse_duration(raw),
                Err(ConfigError::InvalidDuration(raw.to_string())),
                "{:?} should be rejected",
                raw
            );
        }
        assert!(TallydConfig::from_json(r#"{ "flushInterval": "-1s" }"#).is_err());
    }

    #[test]
    fn test_listen_addresses() {
        assert_eq!(
            parse_listen_addr(":8126").unwrap(),
            Some(SocketAddr::from(([0, 0, 0, 0], 8126)))
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:9000").unwrap(),
            Some(SocketAddr::from(([127, 0, 0, 1], 9000)))
        );
        assert_eq!(parse_listen_addr("").unwrap(), None);
        assert!(parse_listen_addr("localhost").is_err());
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let config = TallydConfig {
            percent_thresholds: vec![90.0, 150.0],
            ..TallydConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidThreshold("150".to_string()))
        );

        let config = TallydConfig {
            flush_interval: Duration::ZERO,
            ..TallydConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidInterval(_))
        ));

        let config = TallydConfig {
            sink_timeout: Some(Duration::from_secs(5)),
            ..TallydConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidInterval(_))
        ));

        let config = TallydConfig {
            summary_backlog: 0,
            ..TallydConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting(_))
        ));

        let config = TallydConfig {
            receiver_workers: 0,
            ..TallydConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting(_))
        ));
    }

    #[test]
    fn test_round_trip_keeps_durations() {
        let config = TallydConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"flushInterval\":\"PT1S\""));
        assert_eq!(TallydConfig::from_json(&json).unwrap(), config);
    }
}
