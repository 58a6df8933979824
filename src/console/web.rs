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

//! HTTP console serving snapshots as JSON
//!
//! Routes:
//! - `GET /` full snapshot
//! - `GET /counters`, `/gauges`, `/timers`, `/sets` one kind, optional `?prefix=`
//! - `GET /stats` operational counters

use crate::aggregation::state::SnapshotFilter;
use crate::aggregation::EngineHandle;
use crate::model::MetricType;
use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Query parameters accepted by the snapshot routes
#[derive(Debug, Default, Deserialize)]
pub struct SnapshotQuery {
    /// Only include metric names starting with this prefix
    prefix: Option<String>,
}

/// Build the console router
pub fn router(handle: EngineHandle) -> Router {
    Router::new()
        .route("/", get(all_handler))
        .route("/counters", get(counters_handler))
        .route("/gauges", get(gauges_handler))
        .route("/timers", get(timers_handler))
        .route("/sets", get(sets_handler))
        .route("/stats", get(stats_handler))
        .with_state(handle)
}

/// Serve the console until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    handle: EngineHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(address = %listener.local_addr()?, "Web console listening");
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Web console stopped");
    Ok(())
}

async fn snapshot_response(handle: &EngineHandle, filter: SnapshotFilter) -> Response {
    match handle.snapshot(filter).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response(),
    }
}

fn filter(metric_type: Option<MetricType>, query: SnapshotQuery) -> SnapshotFilter {
    SnapshotFilter {
        metric_type,
        prefix: query.prefix,
    }
}

async fn all_handler(
    State(handle): State<EngineHandle>,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    snapshot_response(&handle, filter(None, query)).await
}

async fn counters_handler(
    State(handle): State<EngineHandle>,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    snapshot_response(&handle, filter(Some(MetricType::Counter), query)).await
}

async fn gauges_handler(
    State(handle): State<EngineHandle>,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    snapshot_response(&handle, filter(Some(MetricType::Gauge), query)).await
}

async fn timers_handler(
    State(handle): State<EngineHandle>,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    snapshot_response(&handle, filter(Some(MetricType::Timer), query)).await
}

async fn sets_handler(
    State(handle): State<EngineHandle>,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    snapshot_response(&handle, filter(Some(MetricType::Set), query)).await
}

async fn stats_handler(State(handle): State<EngineHandle>) -> impl IntoResponse {
    Json(handle.stats())
}
