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

//! Operator consoles for inspecting live aggregation state
//!
//! Both consoles are read-only: they go through
//! [`EngineHandle::snapshot`](crate::aggregation::EngineHandle::snapshot) and
//! never touch the table directly.

use crate::aggregation::state::Snapshot;
use crate::aggregation::StatsSnapshot;
use std::fmt::Write as _;

pub mod telnet;
pub mod web;

/// Commands understood by the telnet console
pub const HELP: &str = "\
Commands:
  stats                 operational counters
  counters [prefix]     current counters
  gauges [prefix]       current gauges
  timers [prefix]       current timers
  sets [prefix]         current sets
  help                  this message
  quit                  close the connection
";

/// One line per counter: `key: value (total)`
pub fn render_counters(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    for (key, counter) in &snapshot.counters {
        let _ = writeln!(
            out,
            "{}: {} (total {})",
            key, counter.value, counter.values_since_reset
        );
    }
    out
}

/// One line per gauge: `key: value`
pub fn render_gauges(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    for (key, gauge) in &snapshot.gauges {
        let _ = writeln!(out, "{}: {}", key, gauge.value);
    }
    out
}

/// One line per timer with its running statistics
pub fn render_timers(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    for (key, timer) in &snapshot.timers {
        match timer.mean() {
            Some(mean) => {
                let _ = writeln!(
                    out,
                    "{}: count={} sum={} min={} max={} mean={}",
                    key, timer.count, timer.sum, timer.min, timer.max, mean
                );
            }
            None => {
                let _ = writeln!(out, "{}: count=0", key);
            }
        }
    }
    out
}

/// One line per set: `key: cardinality [members]`
pub fn render_sets(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    for (key, set) in &snapshot.sets {
        let members: Vec<&str> = set.members.iter().map(String::as_str).collect();
        let _ = writeln!(
            out,
            "{}: {} [{}]",
            key,
            set.cardinality(),
            members.join(", ")
        );
    }
    out
}

/// Operational counters, one per line
pub fn render_stats(stats: &StatsSnapshot) -> String {
    format!(
        "metrics_received: {}\n\
         invalid_metrics: {}\n\
         dropped_metrics: {}\n\
         flushes: {}\n\
         expired_keys: {}\n\
         delivery_failures: {}\n\
         dropped_summaries: {}\n",
        stats.metrics_received,
        stats.invalid_metrics,
        stats.dropped_metrics,
        stats.flushes,
        stats.expired_keys,
        stats.delivery_failures,
        stats.dropped_summaries,
    )
}
