// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Workflow execution metrics.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

/// Per-workflow rollup.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WorkflowStat {
    /// Executions recorded.
    pub runs: u64,
    /// Successful executions.
    pub succeeded: u64,
    /// Rolling average duration, milliseconds.
    pub avg_duration_ms: f64,
}

/// Snapshot of the engine-wide metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Total executions.
    pub total: u64,
    /// Successful executions.
    pub succeeded: u64,
    /// Failed executions.
    pub failed: u64,
    /// Rolling average duration across all executions, milliseconds.
    pub avg_duration_ms: f64,
    /// Per-workflow rollups.
    pub per_workflow: HashMap<String, WorkflowStat>,
}

#[derive(Default)]
struct MetricsInner {
    total: u64,
    succeeded: u64,
    total_duration_ms: u128,
    per_workflow: HashMap<String, WorkflowStat>,
}

/// Counters updated after every workflow execution.
#[derive(Default)]
pub struct WorkflowMetrics {
    inner: Mutex<MetricsInner>,
}

impl WorkflowMetrics {
    /// Creates empty metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one finished execution.
    pub fn record(&self, workflow_id: &str, success: bool, duration_ms: u64) {
        let mut inner = self.inner.lock();
        inner.total += 1;
        if success {
            inner.succeeded += 1;
        }
        inner.total_duration_ms += u128::from(duration_ms);

        let stat = inner.per_workflow.entry(workflow_id.to_string()).or_default();
        stat.runs += 1;
        if success {
            stat.succeeded += 1;
        }
        // Incremental rolling average.
        #[allow(clippy::cast_precision_loss)]
        {
            stat.avg_duration_ms +=
                (duration_ms as f64 - stat.avg_duration_ms) / stat.runs as f64;
        }
    }

    /// Returns a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        #[allow(clippy::cast_precision_loss)]
        let avg = if inner.total == 0 {
            0.0
        } else {
            inner.total_duration_ms as f64 / inner.total as f64
        };
        MetricsSnapshot {
            total: inner.total,
            succeeded: inner.succeeded,
            failed: inner.total - inner.succeeded,
            avg_duration_ms: avg,
            per_workflow: inner.per_workflow.clone(),
        }
    }
}

impl std::fmt::Debug for WorkflowMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WorkflowMetrics")
            .field("total", &inner.total)
            .field("succeeded", &inner.succeeded)
            .finish()
    }
}
