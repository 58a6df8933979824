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

//! Sink printing each summary as a single JSON line

use super::{DeliveryError, MetricsSink, Summary};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

/// Writes summaries to standard output
#[derive(Debug, Default)]
pub struct StdoutSink;

impl StdoutSink {
    /// Create the sink
    pub fn new() -> Self {
        Self
    }

    /// Encode a summary as one newline-terminated JSON document
    pub fn encode(summary: &Summary) -> Result<String, DeliveryError> {
        let mut line = serde_json::to_string(summary)?;
        line.push('\n');
        Ok(line)
    }
}

#[async_trait]
impl MetricsSink for StdoutSink {
    async fn send(&self, summary: &Summary) -> Result<(), DeliveryError> {
        let line = Self::encode(summary)?;
        let mut stdout = tokio::io::stdout();
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}
