//! Sliding-window orchestration metrics.
//!
//! Counters are cumulative. Throughput, success rate and scheduling latency
//! only look at events inside the configured window.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::workflow::JobStatus;

/// Lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricTotals {
    pub triggered: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub rolled_back: u64,
    pub cancelled: u64,
    pub routed: u64,
    pub route_rejections: u64,
}

/// Capacity figures sampled by the caller at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Utilization {
    /// Fraction of ledger capacity reserved, 0..1.
    pub ledger: f64,
    /// Mean CPU percent over routable instances.
    pub fleet_cpu: f64,
    /// Mean memory percent over routable instances.
    pub fleet_memory: f64,
}

/// Answer to `GetOrchestrationMetrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationMetrics {
    /// Terminal workflows per minute over the window.
    pub throughput_per_min: f64,
    /// Completed over terminal, within the window. 1.0 when nothing finished.
    pub success_rate: f64,
    /// Mean queue wait of dispatched jobs within the window.
    pub scheduling_latency_ms: f64,
    pub utilization: Utilization,
    pub queued: usize,
    pub running: usize,
    pub window_secs: u64,
    pub totals: MetricTotals,
}

/// Periodic snapshot persisted by the metrics-flush loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRollup {
    pub id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub metrics: OrchestrationMetrics,
}

#[derive(Debug)]
pub struct MetricsCollector {
    window: Duration,
    terminals: VecDeque<(Instant, bool)>,
    waits: VecDeque<(Instant, Duration)>,
    totals: MetricTotals,
}

impl MetricsCollector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            terminals: VecDeque::new(),
            waits: VecDeque::new(),
            totals: MetricTotals::default(),
        }
    }

    pub fn totals(&self) -> &MetricTotals {
        &self.totals
    }

    pub fn record_trigger(&mut self) {
        self.totals.triggered += 1;
    }

    pub fn record_dispatch(&mut self, waited: Duration, now: Instant) {
        self.totals.dispatched += 1;
        self.waits.push_back((now, waited));
        self.evict(now);
    }

    pub fn record_route(&mut self, routed: bool) {
        if routed {
            self.totals.routed += 1;
        } else {
            self.totals.route_rejections += 1;
        }
    }

    pub fn record_terminal(&mut self, status: JobStatus, now: Instant) {
        match status {
            JobStatus::Completed => self.totals.completed += 1,
            JobStatus::Failed => self.totals.failed += 1,
            JobStatus::RolledBack => self.totals.rolled_back += 1,
            JobStatus::Cancelled => self.totals.cancelled += 1,
            JobStatus::Pending | JobStatus::Running => return,
        }
        // Cancellations are the caller's choice and don't count against success.
        if status != JobStatus::Cancelled {
            self.terminals.push_back((now, status == JobStatus::Completed));
        }
        self.evict(now);
    }

    pub fn snapshot(
        &mut self,
        now: Instant,
        utilization: Utilization,
        queued: usize,
        running: usize,
    ) -> OrchestrationMetrics {
        self.evict(now);

        let finished = self.terminals.len();
        let succeeded = self.terminals.iter().filter(|(_, ok)| *ok).count();
        let success_rate = if finished == 0 {
            1.0
        } else {
            succeeded as f64 / finished as f64
        };
        let minutes = self.window.as_secs_f64() / 60.0;
        let throughput_per_min = if minutes > 0.0 {
            finished as f64 / minutes
        } else {
            0.0
        };
        let scheduling_latency_ms = if self.waits.is_empty() {
            0.0
        } else {
            let total: f64 = self.waits.iter().map(|(_, w)| w.as_secs_f64() * 1000.0).sum();
            total / self.waits.len() as f64
        };

        OrchestrationMetrics {
            throughput_per_min,
            success_rate,
            scheduling_latency_ms,
            utilization,
            queued,
            running,
            window_secs: self.window.as_secs(),
            totals: self.totals.clone(),
        }
    }

    pub fn rollup(&mut self, now: Instant, utilization: Utilization, queued: usize, running: usize) -> MetricsRollup {
        let metrics = self.snapshot(now, utilization, queued, running);
        let window_end = Utc::now();
        let window_start = window_end
            - chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::zero());
        MetricsRollup {
            id: Uuid::new_v4().to_string(),
            window_start,
            window_end,
            metrics,
        }
    }

    fn evict(&mut self, now: Instant) {
        let window = self.window;
        let expired = |at: &Instant| now.saturating_duration_since(*at) > window;
        while self.terminals.front().is_some_and(|(at, _)| expired(at)) {
            self.terminals.pop_front();
        }
        while self.waits.front().is_some_and(|(at, _)| expired(at)) {
            self.waits.pop_front();
        }
    }
}
