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

//! Metric sources for ingesting data from various protocols
//!
//! Sources are responsible for receiving metrics data from external systems,
//! decoding it into [`Metric`](crate::model::Metric) observations and handing
//! them to the aggregation engine.

use crate::aggregation::EngineHandle;
use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub mod parser;
pub mod statsd;

pub use statsd::StatsdSource;

/// Trait for all metric sources
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Receive metrics and submit them through `handle` until `shutdown` is
    /// cancelled
    async fn run(&self, handle: EngineHandle, shutdown: CancellationToken) -> Result<()>;

    /// Get the name of this source
    fn name(&self) -> &str;
}
