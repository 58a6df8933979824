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

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tallyd::aggregation::percentile::Threshold;
use tallyd::config::{parse_duration, parse_listen_addr, TallydConfig};
use tallyd::sinks::SinkConfig;
use tallyd::Tallyd;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// StatsD-compatible metrics collector
#[derive(Parser, Debug)]
#[command(name = "tallyd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(short, long, env = "TALLYD_CONFIG")]
    config_path: Option<PathBuf>,

    /// Comma separated list of sinks (graphite, stdout)
    #[arg(long, value_delimiter = ',')]
    backends: Option<Vec<String>>,

    /// Idle time before a metric is forgotten, e.g. 5m; 0 disables expiry
    #[arg(long, value_parser = parse_duration)]
    expiry_interval: Option<Duration>,

    /// How often to flush to sinks, e.g. 1s
    #[arg(long, value_parser = parse_duration)]
    flush_interval: Option<Duration>,

    /// UDP address metrics are received on
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Prefix for every metric name
    #[arg(long)]
    namespace: Option<String>,

    /// Telnet console address, e.g. :8126; empty disables it
    #[arg(long)]
    console_addr: Option<String>,

    /// HTTP console address, e.g. :8181; empty disables it
    #[arg(long)]
    web_addr: Option<String>,

    /// Comma separated percentiles for timers, e.g. 90,99,-10
    #[arg(long, value_delimiter = ',', value_parser = Threshold::parse, allow_hyphen_values = true)]
    percent_threshold: Option<Vec<Threshold>>,

    /// Enable debug logging
    #[arg(short, long, env = "TALLYD_VERBOSE")]
    verbose: bool,
}

impl Cli {
    /// Overlay command line flags on a loaded configuration
    fn apply(self, mut config: TallydConfig) -> Result<TallydConfig> {
        if let Some(backends) = self.backends {
            config.backends = backends
                .iter()
                .filter(|name| !name.trim().is_empty())
                .map(|name| SinkConfig::from_name(name.trim()))
                .collect::<Result<_, _>>()?;
        }
        if let Some(interval) = self.expiry_interval {
            config.expiry_interval = interval;
        }
        if let Some(interval) = self.flush_interval {
            config.flush_interval = interval;
        }
        if let Some(address) = self.metrics_addr {
            config.metrics_addr = address;
        }
        if let Some(namespace) = self.namespace {
            config.namespace = Some(namespace).filter(|ns| !ns.is_empty());
        }
        if let Some(address) = self.console_addr {
            config.console_addr = parse_listen_addr(&address)?;
        }
        if let Some(address) = self.web_addr {
            config.web_console_addr = parse_listen_addr(&address)?;
        }
        if let Some(thresholds) = self.percent_threshold {
            config.percent_thresholds = thresholds.iter().map(Threshold::value).collect();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; RUST_LOG takes precedence over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &cli.config_path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            TallydConfig::from_file(path)?
        }
        None => TallydConfig::default(),
    };
    let config = cli.apply(config)?;
    info!("Configuration loaded successfully");

    let mut tallyd = Tallyd::new(config)?;
    tallyd.start().await?;
    info!("tallyd started successfully");

    tallyd.wait_for_shutdown().await?;
    Ok(())
}
