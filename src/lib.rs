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

//! # tallyd
//!
//! A StatsD-compatible metrics collector. Counters, gauges, timers and sets
//! arrive over UDP, are aggregated in memory by a single-owner engine, and are
//! flushed on a fixed interval to the configured sinks. Keys that stop
//! reporting are evicted after the expiry interval.
//!
//! ## Features
//!
//! - **StatsD Source**: `name:value|type[|@rate][|#tags]` over UDP
//! - **Aggregation**: sample-rate corrected counters, gauges, timers with
//!   configurable percentiles, and sets
//! - **Sinks**: Graphite plaintext and JSON on stdout
//! - **Consoles**: telnet and HTTP views of live state
//!
//! ## Example
//!
//! ```rust,no_run
//! use tallyd::{Tallyd, config::TallydConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TallydConfig::from_file("tallyd.json")?;
//!     let mut tallyd = Tallyd::new(config)?;
//!     tallyd.start().await?;
//!     tallyd.wait_for_shutdown().await?;
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod aggregation;
pub mod config;
pub mod console;
pub mod model;
pub mod sinks;
pub mod sources;

use aggregation::{AggregationEngine, EngineHandle};
use config::TallydConfig;
use sinks::{Dispatcher, MetricsSink};
use sources::{MetricsSource, StatsdSource};

/// Main daemon instance
pub struct Tallyd {
    config: TallydConfig,
    shutdown: CancellationToken,
    handle: Option<EngineHandle>,
    /// Sources and consoles; stopped first
    frontends: Vec<(&'static str, JoinHandle<()>)>,
    engine: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Tallyd {
    /// Create a new instance, rejecting invalid configuration
    pub fn new(config: TallydConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shutdown: CancellationToken::new(),
            handle: None,
            frontends: Vec::new(),
            engine: None,
            dispatcher: None,
        })
    }

    /// Start all services (engine, sinks, sources, consoles)
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting tallyd services");

        let (output_sender, output_receiver) = broadcast::channel(self.config.summary_backlog);
        let (engine, handle) = AggregationEngine::new(self.config.engine_config()?, output_sender)?;

        let sinks: Vec<Arc<dyn MetricsSink>> =
            self.config.backends.iter().map(|sink| sink.build()).collect();
        let dispatcher = Dispatcher::new(sinks, self.config.sink_timeout(), handle.shared_stats());

        self.engine = Some(tokio::spawn(engine.run(self.shutdown.clone())));
        self.dispatcher = Some(tokio::spawn(dispatcher.run(output_receiver)));

        let statsd: Arc<dyn MetricsSource> = Arc::new(StatsdSource::new(
            self.config.metrics_addr,
            self.config.namespace.clone(),
            self.config.receiver_workers,
        ));
        self.spawn_source(statsd, handle.clone());

        if let Some(address) = self.config.console_addr {
            let listener = TcpListener::bind(address)
                .await
                .with_context(|| format!("Failed to bind telnet console on {}", address))?;
            let task = console::telnet::serve(listener, handle.clone(), self.shutdown.clone());
            self.spawn_frontend("telnet console", task);
        }

        if let Some(address) = self.config.web_console_addr {
            let listener = TcpListener::bind(address)
                .await
                .with_context(|| format!("Failed to bind web console on {}", address))?;
            let task = console::web::serve(listener, handle.clone(), self.shutdown.clone());
            self.spawn_frontend("web console", task);
        }

        self.handle = Some(handle);
        self.setup_signal_handlers();

        info!("All services started successfully");
        Ok(())
    }

    /// Handle for submitting metrics or querying state in-process
    pub fn handle(&self) -> Option<EngineHandle> {
        self.handle.clone()
    }

    /// Request a graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for a shutdown request, then stop every service in order
    pub async fn wait_for_shutdown(&mut self) -> Result<()> {
        self.shutdown.cancelled().await;
        info!("Shutdown signal received, stopping services...");

        for (name, task) in self.frontends.drain(..) {
            if let Err(err) = task.await {
                warn!(service = name, error = %err, "Service task failed");
            }
        }

        // The engine drains its queue and performs the final flush
        self.handle = None;
        if let Some(engine) = self.engine.take() {
            engine.await.context("Aggregation engine task failed")?;
        }

        // Ends once the engine has released the summary channel
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.await.context("Sink dispatcher task failed")?;
        }

        info!("Shutdown complete");
        Ok(())
    }

    fn spawn_source(&mut self, source: Arc<dyn MetricsSource>, handle: EngineHandle) {
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = source.run(handle, shutdown.clone()).await {
                error!(source = source.name(), error = %err, "Source failed, shutting down");
                shutdown.cancel();
            }
        });
        self.frontends.push(("source", task));
    }

    fn spawn_frontend<F>(&mut self, name: &'static str, task: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            if let Err(err) = task.await {
                error!(service = name, error = %err, "Service failed");
            }
        });
        self.frontends.push((name, task));
    }

    fn setup_signal_handlers(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown.cancel();
                }
                Err(err) => {
                    warn!("Failed to listen for SIGINT: {}", err);
                }
            }
        });

        #[cfg(unix)]
        {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        info!("Received SIGTERM, initiating shutdown");
                        shutdown.cancel();
                    }
                    Err(err) => warn!("Failed to register SIGTERM handler: {}", err),
                }
            });
        }
    }
}
