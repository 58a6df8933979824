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

//! Line-oriented TCP console

use super::{render_counters, render_gauges, render_sets, render_stats, render_timers, HELP};
use crate::aggregation::state::{Snapshot, SnapshotFilter};
use crate::aggregation::EngineHandle;
use crate::model::MetricType;
use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accept console sessions until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    handle: EngineHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(address = %listener.local_addr()?, "Telnet console listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Console session opened");
                    tokio::spawn(session(stream, handle.clone(), shutdown.clone()));
                }
                Err(err) => warn!(error = %err, "Failed to accept console connection"),
            },
        }
    }

    info!("Telnet console stopped");
    Ok(())
}

async fn session(stream: TcpStream, handle: EngineHandle, shutdown: CancellationToken) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "Console session read failed");
                    break;
                }
            },
        };

        let Some(reply) = respond(&line, &handle).await else {
            break;
        };
        if let Err(err) = writer.write_all(reply.as_bytes()).await {
            debug!(error = %err, "Console session write failed");
            break;
        }
    }
}

/// Answer one console command; `None` ends the session
pub async fn respond(line: &str, handle: &EngineHandle) -> Option<String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Some(String::new());
    };
    let prefix = words.next();

    let (metric_type, render): (MetricType, fn(&Snapshot) -> String) = match command {
        "quit" | "exit" => return None,
        "help" => return Some(HELP.to_string()),
        "stats" => return Some(render_stats(&handle.stats())),
        "counters" => (MetricType::Counter, render_counters),
        "gauges" => (MetricType::Gauge, render_gauges),
        "timers" => (MetricType::Timer, render_timers),
        "sets" => (MetricType::Set, render_sets),
        _ => return Some("unknown command\n".to_string()),
    };

    let mut filter = SnapshotFilter::of_type(metric_type);
    if let Some(prefix) = prefix {
        filter = filter.with_prefix(prefix);
    }

    match handle.snapshot(filter).await {
        Ok(snapshot) => Some(render(&snapshot)),
        Err(err) => Some(format!("error: {}\n", err)),
    }
}
