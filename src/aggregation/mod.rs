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

//! Interval-based metrics aggregation engine
//!
//! The [`AggregationEngine`] is the only owner of the aggregation table. Sources
//! and consoles talk to it through a cloneable [`EngineHandle`] backed by a
//! bounded channel; the engine's event loop applies observations in arrival
//! order and wakes on the flush and expiry timers. Flushed summaries are handed
//! to the sink dispatcher over a bounded broadcast channel: slow sinks never
//! stall ingestion, and when they fall behind the oldest pending summaries are
//! overwritten and counted in [`StatsSnapshot::dropped_summaries`].

use crate::config::ConfigError;
use crate::model::Metric;
use crate::sinks::Summary;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod percentile;
pub mod state;

use percentile::Threshold;
use state::{AggregatedState, Snapshot, SnapshotFilter};

/// What producers do when the engine queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for space in the queue
    #[default]
    Block,
    /// Discard the observation and count it
    Drop,
}

/// Engine parameters, validated at construction
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Time between flushes
    pub flush_interval: Duration,

    /// Idle time after which a key is evicted; zero disables expiry
    pub expiry_interval: Duration,

    /// Percentiles reported for every timer
    pub percent_thresholds: Vec<Threshold>,

    /// Capacity of the producer queue
    pub queue_capacity: usize,

    /// Behaviour when the producer queue is full
    pub overflow_policy: OverflowPolicy,

    /// Whether shutdown ends with one last flush
    pub flush_on_shutdown: bool,
}

impl EngineConfig {
    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::InvalidInterval(
                "flush interval must be greater than zero".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            expiry_interval: Duration::from_secs(5 * 60),
            percent_thresholds: vec![Threshold::DEFAULT],
            queue_capacity: 10_000,
            overflow_policy: OverflowPolicy::Block,
            flush_on_shutdown: true,
        }
    }
}

/// Operational counters shared between the engine and its collaborators
#[derive(Debug, Default)]
pub struct EngineStats {
    metrics_received: AtomicU64,
    invalid_metrics: AtomicU64,
    dropped_metrics: AtomicU64,
    flushes: AtomicU64,
    expired_keys: AtomicU64,
    delivery_failures: AtomicU64,
    dropped_summaries: AtomicU64,
}

impl EngineStats {
    /// Count an observation that could not be decoded or applied
    pub fn record_invalid(&self) {
        self.invalid_metrics.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a sink that failed to accept a summary
    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count summaries overwritten before the dispatcher could deliver them
    pub fn record_dropped_summaries(&self, count: u64) {
        self.dropped_summaries.fetch_add(count, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped_metrics.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            metrics_received: self.metrics_received.load(Ordering::Relaxed),
            invalid_metrics: self.invalid_metrics.load(Ordering::Relaxed),
            dropped_metrics: self.dropped_metrics.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            expired_keys: self.expired_keys.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            dropped_summaries: self.dropped_summaries.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Observations applied to the table
    pub metrics_received: u64,
    /// Observations discarded as invalid
    pub invalid_metrics: u64,
    /// Observations discarded because the queue was full
    pub dropped_metrics: u64,
    /// Completed flushes
    pub flushes: u64,
    /// Keys removed by expiry
    pub expired_keys: u64,
    /// Failed sink deliveries
    pub delivery_failures: u64,
    /// Summaries skipped because sinks fell behind
    pub dropped_summaries: u64,
}

/// Errors returned to producers
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The queue was full and the overflow policy is [`OverflowPolicy::Drop`]
    #[error("engine queue is full, metric dropped")]
    QueueOverflow,

    /// The engine loop has exited
    #[error("aggregation engine has stopped")]
    Stopped,
}

enum Command {
    Submit(Metric),
    Snapshot(SnapshotFilter, oneshot::Sender<Snapshot>),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Submit(metric) => f.debug_tuple("Submit").field(metric).finish(),
            Command::Snapshot(filter, _) => f.debug_tuple("Snapshot").field(filter).finish(),
        }
    }
}

/// Cloneable access to a running engine
#[derive(Debug, Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<Command>,
    stats: Arc<EngineStats>,
    overflow_policy: OverflowPolicy,
}

impl EngineHandle {
    /// Queue an observation for aggregation
    ///
    /// Under [`OverflowPolicy::Block`] this waits for queue space; under
    /// [`OverflowPolicy::Drop`] a full queue counts the metric as dropped and
    /// returns [`EngineError::QueueOverflow`].
    pub async fn submit(&self, metric: Metric) -> Result<(), EngineError> {
        match self.overflow_policy {
            OverflowPolicy::Block => self
                .sender
                .send(Command::Submit(metric))
                .await
                .map_err(|_| EngineError::Stopped),
            OverflowPolicy::Drop => match self.sender.try_send(Command::Submit(metric)) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.record_dropped();
                    Err(EngineError::QueueOverflow)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::Stopped),
            },
        }
    }

    /// Copy of the current table, consistent with a single point in the
    /// engine's command order
    pub async fn snapshot(&self, filter: SnapshotFilter) -> Result<Snapshot, EngineError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Command::Snapshot(filter, reply))
            .await
            .map_err(|_| EngineError::Stopped)?;
        response.await.map_err(|_| EngineError::Stopped)
    }

    /// Count an observation rejected before it reached the engine
    pub fn record_invalid(&self) {
        self.stats.record_invalid();
    }

    /// Current operational counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared counters, for collaborators that report into them
    pub fn shared_stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }
}

/// Aggregation engine that owns the metric table
pub struct AggregationEngine {
    /// Validated configuration
    config: EngineConfig,

    /// Aggregation table; only touched from [`AggregationEngine::run`]
    state: AggregatedState,

    /// Commands from handles
    receiver: mpsc::Receiver<Command>,

    /// Channel for sending flushed summaries to sinks
    output_sender: broadcast::Sender<Summary>,

    stats: Arc<EngineStats>,
}

impl AggregationEngine {
    /// Create a new aggregation engine and the handle used to feed it
    pub fn new(
        config: EngineConfig,
        output_sender: broadcast::Sender<Summary>,
    ) -> Result<(Self, EngineHandle), ConfigError> {
        config.validate()?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let stats = Arc::new(EngineStats::default());
        let handle = EngineHandle {
            sender,
            stats: Arc::clone(&stats),
            overflow_policy: config.overflow_policy,
        };

        let engine = Self {
            config,
            state: AggregatedState::new(),
            receiver,
            output_sender,
            stats,
        };
        Ok((engine, handle))
    }

    /// Run the event loop until `shutdown` is cancelled or every handle is
    /// dropped
    ///
    /// On exit, commands already queued are applied and, if configured, a
    /// final flush is emitted before the output channel is released.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            flush_interval = ?self.config.flush_interval,
            expiry_interval = ?self.config.expiry_interval,
            "Aggregation engine started"
        );

        let start = Instant::now();
        let flush_interval = self.config.flush_interval;
        let mut flush_timer = interval_at(start + flush_interval, flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let expiry_enabled = !self.config.expiry_interval.is_zero();
        let expiry_period = if expiry_enabled {
            self.config.expiry_interval
        } else {
            flush_interval
        };
        let mut expiry_timer = interval_at(start + expiry_period, expiry_period);
        expiry_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Aggregation engine received shutdown");
                    break;
                }
                _ = flush_timer.tick() => self.flush(),
                _ = expiry_timer.tick(), if expiry_enabled => self.expire(Instant::now()),
                command = self.receiver.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("All engine handles dropped");
                        break;
                    }
                },
            }
        }

        self.receiver.close();
        while let Ok(command) = self.receiver.try_recv() {
            self.handle(command);
        }

        if self.config.flush_on_shutdown {
            info!("Performing final flush");
            self.flush();
        }

        info!("Aggregation engine stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit(metric) => {
                if self.state.apply(&metric, Instant::now()) {
                    self.stats.metrics_received.fetch_add(1, Ordering::Relaxed);
                } else {
                    debug!(name = %metric.name, value = metric.value, "Discarding invalid metric");
                    self.stats.record_invalid();
                }
            }
            Command::Snapshot(filter, reply) => {
                // The requester may have given up waiting
                let _ = reply.send(self.state.snapshot(&filter, Utc::now()));
            }
        }
    }

    fn flush(&mut self) {
        let summary = self.state.flush(
            &self.config.percent_thresholds,
            Utc::now(),
            self.config.flush_interval,
        );
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);

        debug!(
            counters = summary.counters.len(),
            gauges = summary.gauges.len(),
            timers = summary.timers.len(),
            sets = summary.sets.len(),
            "Flushed aggregated metrics"
        );

        if self.output_sender.send(summary).is_err() {
            warn!("Sink dispatcher has stopped, discarding summary");
        }
    }

    fn expire(&mut self, now: Instant) {
        let removed = self.state.expire(now, self.config.expiry_interval);
        if removed > 0 {
            self.stats
                .expired_keys
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, remaining = self.state.key_count(), "Expired idle metrics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricKey, MetricType};

    fn config() -> EngineConfig {
        EngineConfig {
            flush_interval: Duration::from_secs(1),
            expiry_interval: Duration::from_secs(5),
            ..EngineConfig::default()
        }
    }

    fn start(
        config: EngineConfig,
    ) -> (
        EngineHandle,
        broadcast::Receiver<Summary>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (output_sender, output) = broadcast::channel(16);
        let (engine, handle) = AggregationEngine::new(config, output_sender).unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(engine.run(shutdown.clone()));
        (handle, output, shutdown, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_tick_emits_summary() {
        let (handle, mut output, shutdown, task) = start(config());

        for _ in 0..3 {
            handle
                .submit(Metric::new("requests", MetricType::Counter, 1.0))
                .await
                .unwrap();
        }
        handle
            .submit(Metric::new("requests", MetricType::Counter, 1.0).with_sample_rate(0.5))
            .await
            .unwrap();

        let key = MetricKey::untagged("requests");
        let summary = output.recv().await.unwrap();
        assert_eq!(summary.counters[&key].value, 5.0);
        assert_eq!(summary.interval, Duration::from_secs(1));

        let summary = output.recv().await.unwrap();
        assert_eq!(summary.counters[&key].value, 0.0);
        assert_eq!(summary.counters[&key].values_since_reset, 5.0);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(handle.stats().metrics_received, 4);
        assert!(handle.stats().flushes >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reflects_prior_submits() {
        let (handle, _output, shutdown, task) = start(config());

        handle
            .submit(Metric::new("depth", MetricType::Gauge, 3.0))
            .await
            .unwrap();
        handle
            .submit(Metric::new("depth", MetricType::Gauge, 8.0))
            .await
            .unwrap();

        let snapshot = handle.snapshot(SnapshotFilter::all()).await.unwrap();
        assert_eq!(snapshot.gauges[&MetricKey::untagged("depth")].value, 8.0);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_queue_and_flushes() {
        let (handle, mut output, shutdown, task) = start(config());

        for value in [10.0, 20.0, 30.0] {
            handle
                .submit(Metric::new("latency", MetricType::Timer, value))
                .await
                .unwrap();
        }
        shutdown.cancel();
        task.await.unwrap();

        let summary = output.recv().await.unwrap();
        let timer = &summary.timers[&MetricKey::untagged("latency")];
        assert_eq!(timer.count, 3);
        assert_eq!(timer.mean, 20.0);
        assert_eq!(timer.percentiles[0].value, 30.0);

        assert!(matches!(
            output.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(
            handle.submit(Metric::new("late", MetricType::Counter, 1.0)).await,
            Err(EngineError::Stopped)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_without_final_flush() {
        let (handle, mut output, shutdown, task) = start(EngineConfig {
            flush_on_shutdown: false,
            ..config()
        });

        handle
            .submit(Metric::new("requests", MetricType::Counter, 1.0))
            .await
            .unwrap();
        shutdown.cancel();
        task.await.unwrap();

        assert!(matches!(
            output.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_evicts_idle_keys() {
        let (handle, _output, shutdown, task) = start(config());

        handle
            .submit(Metric::new("depth", MetricType::Gauge, 1.0))
            .await
            .unwrap();
        assert_eq!(handle.snapshot(SnapshotFilter::all()).await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(handle
            .snapshot(SnapshotFilter::all())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(handle.stats().expired_keys, 1);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_expiry_never_evicts() {
        let (handle, _output, shutdown, task) = start(EngineConfig {
            expiry_interval: Duration::ZERO,
            ..config()
        });

        handle
            .submit(Metric::new("depth", MetricType::Gauge, 1.0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert_eq!(handle.snapshot(SnapshotFilter::all()).await.unwrap().len(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_policy_counts_overflow() {
        let (output_sender, _output) = broadcast::channel(16);
        let (_engine, handle) = AggregationEngine::new(
            EngineConfig {
                queue_capacity: 1,
                overflow_policy: OverflowPolicy::Drop,
                ..config()
            },
            output_sender,
        )
        .unwrap();

        let metric = Metric::new("requests", MetricType::Counter, 1.0);
        assert_eq!(handle.submit(metric.clone()).await, Ok(()));
        assert_eq!(handle.submit(metric).await, Err(EngineError::QueueOverflow));
        assert_eq!(handle.stats().dropped_metrics, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_metric_is_counted() {
        let (handle, _output, shutdown, task) = start(config());

        handle
            .submit(Metric::new("bad", MetricType::Counter, f64::INFINITY))
            .await
            .unwrap();
        assert!(handle
            .snapshot(SnapshotFilter::all())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(handle.stats().invalid_metrics, 1);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_are_counted_exactly() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 500;

        let (handle, mut output, shutdown, task) = start(EngineConfig {
            flush_interval: Duration::from_secs(3600),
            queue_capacity: 16,
            ..config()
        });

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    for _ in 0..PER_PRODUCER {
                        handle
                            .submit(Metric::new("requests", MetricType::Counter, 1.0))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        shutdown.cancel();
        task.await.unwrap();

        let total = (PRODUCERS * PER_PRODUCER) as f64;
        let summary = output.recv().await.unwrap();
        let counter = &summary.counters[&MetricKey::untagged("requests")];
        assert_eq!(counter.value, total);
        assert_eq!(counter.values_since_reset, total);
        assert_eq!(handle.stats().metrics_received, total as u64);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (output_sender, _output) = broadcast::channel(16);
        let result = AggregationEngine::new(
            EngineConfig {
                flush_interval: Duration::ZERO,
                ..EngineConfig::default()
            },
            output_sender.clone(),
        );
        assert!(matches!(result, Err(ConfigError::InvalidInterval(_))));

        let result = AggregationEngine::new(
            EngineConfig {
                queue_capacity: 0,
                ..EngineConfig::default()
            },
            output_sender,
        );
        assert!(matches!(result, Err(ConfigError::InvalidSetting(_))));
    }
}
