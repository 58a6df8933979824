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

//! In-memory aggregation table
//!
//! [`AggregatedState`] holds one map per metric type plus the last time each
//! key was observed. It is plain data: the engine owns the only instance and
//! drives every mutation from its event loop.

use super::percentile::{self, Threshold};
use crate::model::{Metric, MetricKey, MetricType};
use crate::sinks::{CounterSummary, Summary, TimerSummary};
use ahash::{HashMap, HashMapExt, HashSet};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;

/// Counter accumulator
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CounterState {
    /// Total since the last flush, scaled by `1 / sample_rate`
    pub value: f64,

    /// Total since process start; never reset
    pub values_since_reset: f64,
}

impl CounterState {
    fn add(&mut self, value: f64, sample_rate: f64) {
        let scaled = value / sample_rate;
        self.value += scaled;
        self.values_since_reset += scaled;
    }
}

/// Gauge accumulator
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GaugeState {
    /// Last observed value
    pub value: f64,
}

/// Timer accumulator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerState {
    /// Samples since the last flush, in arrival order
    pub values: Vec<f64>,

    /// Number of samples
    pub count: usize,

    /// Sum of samples
    pub sum: f64,

    /// Minimum sample
    pub min: f64,

    /// Maximum sample
    pub max: f64,
}

impl TimerState {
    /// Create an empty timer
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn add_sample(&mut self, value: f64) {
        self.values.push(value);
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Arithmetic mean, `None` when empty
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn summarize(&self, thresholds: &[Threshold]) -> Option<TimerSummary> {
        let mean = self.mean()?;
        let mut sorted = self.values.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        Some(TimerSummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            mean,
            percentiles: percentile::compute_all(&sorted, thresholds),
        })
    }

    fn reset(&mut self) {
        self.values.clear();
        self.count = 0;
        self.sum = 0.0;
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
    }
}

impl Default for TimerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Set accumulator
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SetState {
    /// Distinct values since the last flush
    pub members: BTreeSet<String>,
}

impl SetState {
    /// Number of distinct values
    pub fn cardinality(&self) -> usize {
        self.members.len()
    }
}

/// String form of a set member; integral values render without a fraction
pub fn set_member(value: f64) -> String {
    format!("{}", value)
}

/// All per-key aggregation state
#[derive(Debug, Default)]
pub struct AggregatedState {
    counters: HashMap<MetricKey, CounterState>,
    gauges: HashMap<MetricKey, GaugeState>,
    timers: HashMap<MetricKey, TimerState>,
    sets: HashMap<MetricKey, SetState>,
    last_seen: HashMap<MetricKey, Instant>,
}

impl AggregatedState {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            counters: HashMap::new(),
            gauges: HashMap::new(),
            timers: HashMap::new(),
            sets: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }

    /// Apply one observation
    ///
    /// Non-finite values and out-of-range sample rates are ignored; returns
    /// whether the observation was applied.
    pub fn apply(&mut self, metric: &Metric, now: Instant) -> bool {
        if !metric.value.is_finite() {
            return false;
        }

        let key = metric.key();
        match metric.metric_type {
            MetricType::Counter => {
                if !(metric.sample_rate > 0.0 && metric.sample_rate <= 1.0) {
                    return false;
                }
                self.counters
                    .entry(key.clone())
                    .or_default()
                    .add(metric.value, metric.sample_rate);
            }
            MetricType::Gauge => {
                self.gauges.entry(key.clone()).or_default().value = metric.value;
            }
            MetricType::Timer => {
                self.timers
                    .entry(key.clone())
                    .or_default()
                    .add_sample(metric.value);
            }
            MetricType::Set => {
                self.sets
                    .entry(key.clone())
                    .or_default()
                    .members
                    .insert(set_member(metric.value));
            }
        }

        let seen = self.last_seen.entry(key).or_insert(now);
        if now > *seen {
            *seen = now;
        }
        true
    }

    /// Summarize every key and reset the per-flush accumulators
    ///
    /// Gauges are left untouched and counters keep `values_since_reset`.
    /// Timers without samples are omitted from the summary.
    pub fn flush(
        &mut self,
        thresholds: &[Threshold],
        timestamp: DateTime<Utc>,
        interval: Duration,
    ) -> Summary {
        let mut summary = Summary::new(timestamp, interval);

        for (key, counter) in self.counters.iter_mut() {
            summary.counters.insert(
                key.clone(),
                CounterSummary {
                    value: counter.value,
                    values_since_reset: counter.values_since_reset,
                },
            );
            counter.value = 0.0;
        }

        for (key, gauge) in self.gauges.iter() {
            summary.gauges.insert(key.clone(), gauge.value);
        }

        for (key, timer) in self.timers.iter_mut() {
            if let Some(timer_summary) = timer.summarize(thresholds) {
                summary.timers.insert(key.clone(), timer_summary);
            }
            timer.reset();
        }

        for (key, set) in self.sets.iter_mut() {
            summary.sets.insert(key.clone(), set.cardinality());
            set.members.clear();
        }

        summary
    }

    /// Remove every key not observed within `interval` of `now`
    ///
    /// A zero interval disables expiry. Returns the number of keys removed.
    pub fn expire(&mut self, now: Instant, interval: Duration) -> usize {
        if interval.is_zero() {
            return 0;
        }

        let expired: HashSet<MetricKey> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > interval)
            .map(|(key, _)| key.clone())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        self.counters.retain(|key, _| !expired.contains(key));
        self.gauges.retain(|key, _| !expired.contains(key));
        self.timers.retain(|key, _| !expired.contains(key));
        self.sets.retain(|key, _| !expired.contains(key));
        self.last_seen.retain(|key, _| !expired.contains(key));

        expired.len()
    }

    /// Copy the current state, optionally filtered
    pub fn snapshot(&self, filter: &SnapshotFilter, taken_at: DateTime<Utc>) -> Snapshot {
        fn collect<T: Clone>(
            map: &HashMap<MetricKey, T>,
            filter: &SnapshotFilter,
            metric_type: MetricType,
        ) -> BTreeMap<MetricKey, T> {
            if !filter.includes_type(metric_type) {
                return BTreeMap::new();
            }
            map.iter()
                .filter(|(key, _)| filter.includes_key(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        }

        Snapshot {
            taken_at,
            counters: collect(&self.counters, filter, MetricType::Counter),
            gauges: collect(&self.gauges, filter, MetricType::Gauge),
            timers: collect(&self.timers, filter, MetricType::Timer),
            sets: collect(&self.sets, filter, MetricType::Set),
        }
    }

    /// Number of distinct keys tracked across all kinds
    pub fn key_count(&self) -> usize {
        self.last_seen.len()
    }

    /// Last time `key` was observed
    pub fn last_seen(&self, key: &MetricKey) -> Option<Instant> {
        self.last_seen.get(key).copied()
    }
}

/// Restricts which entries a snapshot includes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotFilter {
    /// Only include this metric type
    pub metric_type: Option<MetricType>,

    /// Only include keys whose name starts with this prefix
    pub prefix: Option<String>,
}

impl SnapshotFilter {
    /// Filter that includes everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter on a single metric type
    pub fn of_type(metric_type: MetricType) -> Self {
        Self {
            metric_type: Some(metric_type),
            prefix: None,
        }
    }

    /// Add a name prefix restriction
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn includes_type(&self, metric_type: MetricType) -> bool {
        self.metric_type.map_or(true, |t| t == metric_type)
    }

    fn includes_key(&self, key: &MetricKey) -> bool {
        self.prefix
            .as_deref()
            .map_or(true, |prefix| key.name.starts_with(prefix))
    }
}

/// Read-only copy of the aggregation table at a single instant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// When the copy was taken
    pub taken_at: DateTime<Utc>,

    /// Counters by key
    pub counters: BTreeMap<MetricKey, CounterState>,

    /// Gauges by key
    pub gauges: BTreeMap<MetricKey, GaugeState>,

    /// Timers by key
    pub timers: BTreeMap<MetricKey, TimerState>,

    /// Sets by key
    pub sets: BTreeMap<MetricKey, SetState>,
}

impl Snapshot {
    /// Total number of entries across all kinds
    pub fn len(&self) -> usize {
        self.counters.len() + self.gauges.len() + self.timers.len() + self.sets.len()
    }

    /// Whether the snapshot has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Vec<Threshold> {
        vec![Threshold::new(90.0).unwrap()]
    }

    fn flush(state: &mut AggregatedState) -> Summary {
        state.flush(&thresholds(), Utc::now(), Duration::from_secs(1))
    }

    fn counter(name: &str, value: f64) -> Metric {
        Metric::new(name, MetricType::Counter, value)
    }

    #[test]
    fn test_sampled_counter_scenario() {
        let mut state = AggregatedState::new();
        let now = Instant::now();
        for _ in 0..3 {
            assert!(state.apply(&counter("requests", 1.0), now));
        }
        assert!(state.apply(&counter("requests", 1.0).with_sample_rate(0.5), now));

        let key = MetricKey::untagged("requests");
        let summary = flush(&mut state);
        assert_eq!(summary.counters[&key].value, 5.0);
        assert_eq!(summary.counters[&key].values_since_reset, 5.0);

        let summary = flush(&mut state);
        assert_eq!(summary.counters[&key].value, 0.0);
        assert_eq!(summary.counters[&key].values_since_reset, 5.0);
    }

    #[test]
    fn test_values_since_reset_accumulates_across_flushes() {
        let mut state = AggregatedState::new();
        let now = Instant::now();
        let key = MetricKey::untagged("hits");

        state.apply(&counter("hits", 2.0), now);
        state.apply(&counter("hits", 3.0), now);
        assert_eq!(flush(&mut state).counters[&key].value, 5.0);

        state.apply(&counter("hits", 4.0), now);
        let summary = flush(&mut state);
        assert_eq!(summary.counters[&key].value, 4.0);
        assert_eq!(summary.counters[&key].values_since_reset, 9.0);
    }

    #[test]
    fn test_gauge_last_write_wins_and_survives_flush() {
        let mut state = AggregatedState::new();
        let now = Instant::now();
        let key = MetricKey::untagged("temperature");

        for value in [10.0, 30.0, 20.0] {
            state.apply(&Metric::new("temperature", MetricType::Gauge, value), now);
        }

        assert_eq!(flush(&mut state).gauges[&key], 20.0);
        assert_eq!(flush(&mut state).gauges[&key], 20.0);
    }

    #[test]
    fn test_timer_statistics() {
        let mut state = AggregatedState::new();
        let now = Instant::now();
        for value in [20.0, 10.0, 30.0] {
            state.apply(&Metric::new("latency", MetricType::Timer, value), now);
        }

        let summary = flush(&mut state);
        let timer = &summary.timers[&MetricKey::untagged("latency")];
        assert_eq!(timer.count, 3);
        assert_eq!(timer.sum, 60.0);
        assert_eq!(timer.min, 10.0);
        assert_eq!(timer.max, 30.0);
        assert_eq!(timer.mean, 20.0);
        assert_eq!(timer.percentiles.len(), 1);
        assert_eq!(timer.percentiles[0].label, "90");
        assert_eq!(timer.percentiles[0].value, 30.0);
    }

    #[test]
    fn test_hundredth_percentile_equals_max() {
        let mut state = AggregatedState::new();
        let now = Instant::now();
        for value in [5.0, 1.0, 99.0, 42.0, 7.0] {
            state.apply(&Metric::new("latency", MetricType::Timer, value), now);
        }

        let summary = state.flush(
            &[Threshold::new(100.0).unwrap()],
            Utc::now(),
            Duration::from_secs(1),
        );
        let timer = &summary.timers[&MetricKey::untagged("latency")];
        assert_eq!(timer.percentiles[0].value, timer.max);
    }

    #[test]
    fn test_empty_timer_is_omitted() {
        let mut state = AggregatedState::new();
        state.apply(
            &Metric::new("latency", MetricType::Timer, 12.0),
            Instant::now(),
        );

        assert_eq!(flush(&mut state).timers.len(), 1);
        assert!(flush(&mut state).timers.is_empty());
        assert_eq!(state.key_count(), 1);
    }

    #[test]
    fn test_set_cardinality() {
        let mut state = AggregatedState::new();
        let now = Instant::now();
        for value in [3.0, 1.0, 3.0, 2.0, 1.0, 3.0] {
            state.apply(&Metric::new("users", MetricType::Set, value), now);
        }

        let key = MetricKey::untagged("users");
        assert_eq!(flush(&mut state).sets[&key], 3);
        assert_eq!(flush(&mut state).sets[&key], 0);
    }

    #[test]
    fn test_flush_twice_without_input() {
        let mut state = AggregatedState::new();
        let now = Instant::now();
        state.apply(&Metric::new("depth", MetricType::Gauge, 4.0), now);
        state.apply(&Metric::new("latency", MetricType::Timer, 4.0), now);
        state.apply(&Metric::new("users", MetricType::Set, 4.0), now);
        flush(&mut state);

        for _ in 0..2 {
            let summary = flush(&mut state);
            assert!(summary.timers.is_empty());
            assert_eq!(summary.sets[&MetricKey::untagged("users")], 0);
            assert_eq!(summary.gauges[&MetricKey::untagged("depth")], 4.0);
        }
    }

    #[test]
    fn test_tags_separate_series() {
        let mut state = AggregatedState::new();
        let now = Instant::now();
        state.apply(&counter("requests", 1.0).with_tags(["route:a"]), now);
        state.apply(&counter("requests", 2.0).with_tags(["route:b"]), now);
        state.apply(&counter("requests", 4.0), now);

        let summary = flush(&mut state);
        assert_eq!(summary.counters.len(), 3);
        assert_eq!(summary.counters[&MetricKey::untagged("requests")].value, 4.0);
    }

    #[test]
    fn test_kinds_are_separate_namespaces() {
        let mut state = AggregatedState::new();
        let now = Instant::now();
        state.apply(&counter("jobs", 1.0), now);
        state.apply(&Metric::new("jobs", MetricType::Gauge, 9.0), now);

        let key = MetricKey::untagged("jobs");
        let summary = flush(&mut state);
        assert_eq!(summary.counters[&key].value, 1.0);
        assert_eq!(summary.gauges[&key], 9.0);
        assert_eq!(state.key_count(), 1);
    }

    #[test]
    fn test_invalid_observations_are_ignored() {
        let mut state = AggregatedState::new();
        let now = Instant::now();
        assert!(!state.apply(&counter("bad", f64::NAN), now));
        assert!(!state.apply(&counter("bad", 1.0).with_sample_rate(0.0), now));
        assert!(!state.apply(&counter("bad", 1.0).with_sample_rate(1.5), now));
        assert_eq!(state.key_count(), 0);
    }

    #[test]
    fn test_expiry_boundary() {
        let mut state = AggregatedState::new();
        let t0 = Instant::now();
        let interval = Duration::from_secs(300);
        let epsilon = Duration::from_millis(1);
        state.apply(&counter("requests", 1.0), t0);
        state.apply(&Metric::new("requests", MetricType::Gauge, 1.0), t0);

        assert_eq!(state.expire(t0 + interval - epsilon, interval), 0);
        assert_eq!(state.key_count(), 1);

        assert_eq!(state.expire(t0 + interval + epsilon, interval), 1);
        assert_eq!(state.key_count(), 0);

        let summary = flush(&mut state);
        assert!(summary.is_empty());
    }

    #[test]
    fn test_zero_expiry_keeps_keys_forever() {
        let mut state = AggregatedState::new();
        let t0 = Instant::now();
        state.apply(&counter("requests", 1.0), t0);

        assert_eq!(
            state.expire(t0 + Duration::from_secs(86_400 * 365), Duration::ZERO),
            0
        );
        assert_eq!(state.key_count(), 1);
    }

    #[test]
    fn test_expiry_only_removes_stale_keys() {
        let mut state = AggregatedState::new();
        let t0 = Instant::now();
        let interval = Duration::from_secs(10);
        state.apply(&counter("stale", 1.0), t0);
        state.apply(&counter("fresh", 1.0), t0);
        state.apply(&counter("fresh", 1.0), t0 + Duration::from_secs(8));

        assert_eq!(state.expire(t0 + Duration::from_secs(12), interval), 1);
        assert!(state.last_seen(&MetricKey::untagged("stale")).is_none());
        assert!(state.last_seen(&MetricKey::untagged("fresh")).is_some());
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let mut state = AggregatedState::new();
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(5);
        let key = MetricKey::untagged("requests");

        state.apply(&counter("requests", 1.0), later);
        state.apply(&counter("requests", 1.0), t0);
        assert_eq!(state.last_seen(&key), Some(later));
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let mut state = AggregatedState::new();
        let now = Instant::now();
        state.apply(&counter("api.requests", 2.0), now);
        state.apply(&counter("db.queries", 3.0), now);
        state.apply(&Metric::new("api.latency", MetricType::Timer, 8.0), now);

        let snapshot = state.snapshot(&SnapshotFilter::all(), Utc::now());
        assert_eq!(snapshot.len(), 3);
        assert_eq!(
            snapshot.timers[&MetricKey::untagged("api.latency")].values,
            vec![8.0]
        );

        let filtered = state.snapshot(
            &SnapshotFilter::of_type(MetricType::Counter).with_prefix("api."),
            Utc::now(),
        );
        assert_eq!(filtered.len(), 1);
        assert_eq!(
            filtered.counters[&MetricKey::untagged("api.requests")].value,
            2.0
        );

        assert_eq!(
            flush(&mut state).counters[&MetricKey::untagged("api.requests")].value,
            2.0
        );
    }

    #[test]
    fn test_set_member_formatting() {
        assert_eq!(set_member(42.0), "42");
        assert_eq!(set_member(1.5), "1.5");
        assert_eq!(set_member(-3.0), "-3");
    }
}
