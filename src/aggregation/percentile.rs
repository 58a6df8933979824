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

//! Percentile statistics over timer samples
//!
//! A threshold `p` selects `c = ceil(|p| * N / 100)` samples (clamped to
//! `[1, N]`). Positive thresholds select the lowest `c` samples and report the
//! largest of them; negative ("bottom") thresholds select the highest `c`
//! samples and report the smallest of them.
//!
//! Labels are stable because sinks key on them: `90 -> "90"`,
//! `99.9 -> "99_9"`, `-10 -> "bottom_10"`.

use crate::config::ConfigError;
use serde::Serialize;

const MICROS_PER_PERCENT: u128 = 1_000_000;

/// A validated percentile threshold in `[-100, 100]`, excluding zero
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold(f64);

impl Threshold {
    /// The 90th percentile
    pub const DEFAULT: Threshold = Threshold(90.0);

    /// Validate a configured threshold
    pub fn new(value: f64) -> Result<Self, ConfigError> {
        if !value.is_finite() || value == 0.0 || !(-100.0..=100.0).contains(&value) {
            return Err(ConfigError::InvalidThreshold(value.to_string()));
        }
        Ok(Self(value))
    }

    /// Parse a threshold given as text (CLI flags)
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let value = raw
            .trim()
            .parse::<f64>()
            .map_err(|_| ConfigError::InvalidThreshold(raw.to_string()))?;
        Self::new(value)
    }

    /// The configured value, sign included
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Whether this threshold is measured from the high end
    pub fn is_bottom(&self) -> bool {
        self.0 < 0.0
    }

    /// Output label for this threshold
    pub fn label(&self) -> String {
        let magnitude = format!("{}", self.0.abs()).replace('.', "_");
        if self.is_bottom() {
            format!("bottom_{}", magnitude)
        } else {
            magnitude
        }
    }

    /// Number of samples selected out of `n`
    ///
    /// Computed in millionths of a percent so fractional thresholds such as
    /// `4.4` do not pick up floating point error in the ceiling.
    fn rank(&self, n: usize) -> usize {
        let scaled = (self.0.abs() * MICROS_PER_PERCENT as f64).round() as u128;
        let raw = (scaled * n as u128).div_ceil(100 * MICROS_PER_PERCENT);
        usize::try_from(raw).unwrap_or(n).clamp(1, n)
    }
}

/// Statistics for one threshold over a flushed timer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Percentile {
    /// Configured threshold, sign included
    pub threshold: f64,

    /// Stable output label (see module docs)
    pub label: String,

    /// Value at the effective rank
    pub value: f64,

    /// Number of samples selected
    pub count: usize,

    /// Sum of the selected samples
    pub sum: f64,

    /// Mean of the selected samples
    pub mean: f64,
}

/// Compute a percentile over samples sorted ascending
///
/// Returns `None` for an empty sample set.
pub fn compute(sorted: &[f64], threshold: Threshold) -> Option<Percentile> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }

    let count = threshold.rank(n);
    let (selected, value) = if threshold.is_bottom() {
        let selected = &sorted[n - count..];
        (selected, selected[0])
    } else {
        let selected = &sorted[..count];
        (selected, selected[count - 1])
    };

    let sum: f64 = selected.iter().sum();
    Some(Percentile {
        threshold: threshold.value(),
        label: threshold.label(),
        value,
        count,
        sum,
        mean: sum / count as f64,
    })
}

/// Compute every configured threshold over samples sorted ascending
pub fn compute_all(sorted: &[f64], thresholds: &[Threshold]) -> Vec<Percentile> {
    thresholds
        .iter()
        .filter_map(|threshold| compute(sorted, *threshold))
        .collect()
}
