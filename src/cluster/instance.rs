use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::CircuitBreakerConfig;
use crate::ledger::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    Stopping,
}

impl InstanceStatus {
    /// Whether the balancer may route to an instance in this status.
    pub fn is_routable(self) -> bool {
        matches!(self, InstanceStatus::Healthy | InstanceStatus::Degraded)
    }

    pub fn health_score(self) -> f64 {
        match self {
            InstanceStatus::Healthy => 1.0,
            InstanceStatus::Degraded => 0.6,
            InstanceStatus::Starting => 0.3,
            InstanceStatus::Unhealthy | InstanceStatus::Stopping => 0.0,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Degraded => "degraded",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Capacity of one worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceCapacity {
    pub cpu: f64,
    pub memory: f64,
    pub io: f64,
    pub max_concurrent_workflows: u32,
}

impl Default for InstanceCapacity {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: 1.0,
            io: 1.0,
            max_concurrent_workflows: 4,
        }
    }
}

impl InstanceCapacity {
    pub fn resources(&self) -> Resources {
        Resources::new(self.cpu, self.memory, self.io)
    }
}

/// Current load. CPU, memory and IO are percentages of capacity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceLoad {
    pub cpu: f64,
    pub memory: f64,
    pub io: f64,
    pub active_connections: u32,
    pub queued_requests: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancePerformance {
    pub avg_response_time_ms: f64,
    pub requests_per_second: f64,
    /// Percent of completed requests that failed.
    pub error_rate: f64,
    /// Percent of completed requests that succeeded.
    pub success_rate: f64,
    pub completed: u64,
    pub failed: u64,
}

impl Default for InstancePerformance {
    fn default() -> Self {
        Self {
            avg_response_time_ms: 0.0,
            requests_per_second: 0.0,
            error_rate: 0.0,
            success_rate: 100.0,
            completed: 0,
            failed: 0,
        }
    }
}

impl InstancePerformance {
    fn record(&mut self, success: bool, elapsed: Duration, uptime: Duration) {
        self.completed += 1;
        if !success {
            self.failed += 1;
        }
        let n = self.completed as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_response_time_ms += (ms - self.avg_response_time_ms) / n;
        self.error_rate = self.failed as f64 / n * 100.0;
        self.success_rate = 100.0 - self.error_rate;
        let secs = uptime.as_secs_f64();
        if secs > 0.0 {
            self.requests_per_second = n / secs;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCounters {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct WorkerInstance {
    pub id: String,
    pub status: InstanceStatus,
    pub weight: f64,
    /// Base URL probed by the HTTP health probe.
    pub endpoint: Option<String>,
    /// Seed instances are never removed by scale-down.
    pub is_default: bool,
    pub load: InstanceLoad,
    pub performance: InstancePerformance,
    pub health: HealthCounters,
    pub capacity: InstanceCapacity,
    pub breaker: CircuitBreaker,
    pub created_at: Instant,
    pub draining_since: Option<Instant>,
}

impl WorkerInstance {
    pub fn new(id: impl Into<String>, capacity: InstanceCapacity, breaker: &CircuitBreakerConfig) -> Self {
        Self {
            id: id.into(),
            status: InstanceStatus::Starting,
            weight: 1.0,
            endpoint: None,
            is_default: false,
            load: InstanceLoad::default(),
            performance: InstancePerformance::default(),
            health: HealthCounters::default(),
            capacity,
            breaker: CircuitBreaker::new(breaker),
            created_at: Instant::now(),
            draining_since: None,
        }
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn has_free_slot(&self) -> bool {
        self.load.active_connections < self.capacity.max_concurrent_workflows
    }

    /// Routable status, breaker not open, a free workflow slot.
    pub fn is_eligible(&self) -> bool {
        self.status.is_routable()
            && self.breaker.state() != CircuitState::Open
            && self.has_free_slot()
    }

    /// Fraction of workflow slots in use.
    pub fn slot_utilization(&self) -> f64 {
        let max = self.capacity.max_concurrent_workflows.max(1);
        f64::from(self.load.active_connections) / f64::from(max)
    }

    /// Takes a workflow slot and adds the request's share of capacity to the load.
    pub fn assign(&mut self, requirements: &Resources) {
        self.load.active_connections += 1;
        self.nudge(requirements, 1.0);
    }

    /// Returns a slot. Counters never go below zero.
    pub fn complete(&mut self, requirements: &Resources, success: bool, elapsed: Duration) {
        self.load.active_connections = self.load.active_connections.saturating_sub(1);
        self.nudge(requirements, -1.0);
        let uptime = self.created_at.elapsed();
        self.performance.record(success, elapsed, uptime);
    }

    fn nudge(&mut self, requirements: &Resources, sign: f64) {
        let share = |part: f64, whole: f64| if whole > 0.0 { part / whole * 100.0 } else { 0.0 };
        let cap = &self.capacity;
        self.load.cpu = (self.load.cpu + sign * share(requirements.cpu, cap.cpu)).clamp(0.0, 100.0);
        self.load.memory =
            (self.load.memory + sign * share(requirements.memory, cap.memory)).clamp(0.0, 100.0);
        self.load.io = (self.load.io + sign * share(requirements.io, cap.io)).clamp(0.0, 100.0);
    }
}

/// Read-only view of an instance for health reports and the audit store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub status: InstanceStatus,
    pub circuit: CircuitState,
    pub failure_count: u32,
    pub weight: f64,
    pub is_default: bool,
    pub load: InstanceLoad,
    pub performance: InstancePerformance,
    pub health: HealthCounters,
    pub capacity: InstanceCapacity,
}

impl From<&WorkerInstance> for InstanceSnapshot {
    fn from(instance: &WorkerInstance) -> Self {
        Self {
            id: instance.id.clone(),
            status: instance.status,
            circuit: instance.breaker.state(),
            failure_count: instance.breaker.failure_count(),
            weight: instance.weight,
            is_default: instance.is_default,
            load: instance.load.clone(),
            performance: instance.performance.clone(),
            health: instance.health.clone(),
            capacity: instance.capacity,
        }
    }
}
