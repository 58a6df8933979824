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

//! StatsD text protocol decoder
//!
//! A packet holds newline separated records of the form
//!
//! ```text
//! <name>:<value>|<type>[|@<sample_rate>][|#<tag1>,<tag2>...]
//! ```
//!
//! where `type` is one of `c`, `g`, `ms` or `s`. The optional components may
//! appear in either order.

use crate::model::{InvalidMetricKind, Metric, MetricType};
use std::collections::BTreeSet;

/// A record could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Unknown type tag
    #[error(transparent)]
    InvalidMetricKind(#[from] InvalidMetricKind),

    /// Nothing after the `:` separator
    #[error("missing value in {0:?}")]
    MissingValue(String),

    /// Value is not a finite number
    #[error("invalid value {0:?}")]
    InvalidValue(String),

    /// Sample rate is not a number in `(0, 1]`
    #[error("invalid sample rate {0:?}")]
    InvalidSampleRate(String),

    /// Record structure is wrong (no name, no type, bad encoding)
    #[error("malformed record {0:?}")]
    Malformed(String),
}

/// Decode a single record, prefixing the name with `namespace` if given
pub fn parse_line(line: &str, namespace: Option<&str>) -> Result<Metric, ParseError> {
    let malformed = || ParseError::Malformed(line.to_string());
    let mut components = line.split('|');

    let (name, raw_value) = components
        .next()
        .and_then(|name_value| name_value.split_once(':'))
        .ok_or_else(malformed)?;
    if name.is_empty() {
        return Err(malformed());
    }
    if raw_value.is_empty() {
        return Err(ParseError::MissingValue(line.to_string()));
    }

    let metric_type: MetricType = components.next().ok_or_else(malformed)?.parse()?;

    let value: f64 = raw_value
        .parse()
        .map_err(|_| ParseError::InvalidValue(raw_value.to_string()))?;
    if !value.is_finite() {
        return Err(ParseError::InvalidValue(raw_value.to_string()));
    }

    let name = match namespace {
        Some(namespace) if !namespace.is_empty() => format!("{}.{}", namespace, name),
        _ => name.to_string(),
    };
    let mut metric = Metric::new(name, metric_type, value);

    for component in components {
        if let Some(raw_rate) = component.strip_prefix('@') {
            metric.sample_rate = parse_sample_rate(raw_rate)?;
        } else if let Some(raw_tags) = component.strip_prefix('#') {
            metric.tags = parse_tags(raw_tags);
        }
    }

    Ok(metric)
}

/// Decode every record in a datagram
///
/// Empty lines are skipped and `\r\n` line endings are accepted. Decoding
/// continues past records that fail.
pub fn parse_packet<'a>(
    packet: &'a [u8],
    namespace: Option<&'a str>,
) -> impl Iterator<Item = Result<Metric, ParseError>> + 'a {
    packet
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
        .map(move |line| match std::str::from_utf8(line) {
            Ok(line) => parse_line(line, namespace),
            Err(_) => Err(ParseError::Malformed(
                String::from_utf8_lossy(line).into_owned(),
            )),
        })
}

fn parse_sample_rate(raw: &str) -> Result<f64, ParseError> {
    match raw.parse::<f64>() {
        Ok(rate) if rate > 0.0 && rate <= 1.0 => Ok(rate),
        _ => Err(ParseError::InvalidSampleRate(raw.to_string())),
    }
}

fn parse_tags(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_owned)
        .collect()
}
