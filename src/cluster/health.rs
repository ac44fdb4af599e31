//! Instance health probing and status derivation.
//!
//! Probes run without any lock held. [`HealthMonitor::apply`] then folds one
//! probe result into an instance's counters, status and breaker.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::circuit_breaker::StateChange;
use super::instance::{InstanceStatus, WorkerInstance};
use crate::config::HealthConfig;

/// What a probe needs to know about an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub id: String,
    pub endpoint: Option<String>,
}

impl From<&WorkerInstance> for ProbeTarget {
    fn from(instance: &WorkerInstance) -> Self {
        Self {
            id: instance.id.clone(),
            endpoint: instance.endpoint.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub ok: bool,
    pub latency: Duration,
    pub detail: Option<String>,
}

impl ProbeResult {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            ok: true,
            latency,
            detail: None,
        }
    }

    pub fn failed(latency: Duration, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency,
            detail: Some(detail.into()),
        }
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult;
}

/// Probes `GET <endpoint>/health`; any 2xx within the timeout is healthy.
pub struct HttpProbe {
    client: Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, timeout }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
        let Some(endpoint) = &target.endpoint else {
            return ProbeResult::failed(Duration::ZERO, "no endpoint configured");
        };
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        let started = Instant::now();
        let response = tokio::time::timeout(self.timeout, self.client.get(&url).send()).await;
        let latency = started.elapsed();

        match response {
            Ok(Ok(resp)) if resp.status().is_success() => ProbeResult::healthy(latency),
            Ok(Ok(resp)) => ProbeResult::failed(latency, format!("status {}", resp.status())),
            Ok(Err(e)) => ProbeResult::failed(latency, e.to_string()),
            Err(_) => ProbeResult::failed(latency, "probe timed out"),
        }
    }
}

/// Scripted probe results keyed by instance id. Unknown ids are healthy.
#[derive(Default)]
pub struct SimulatedProbe {
    results: DashMap<String, ProbeResult>,
}

impl SimulatedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, instance_id: &str, result: ProbeResult) {
        self.results.insert(instance_id.to_string(), result);
    }
}

#[async_trait]
impl HealthProbe for SimulatedProbe {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
        self.results
            .get(&target.id)
            .map(|r| r.clone())
            .unwrap_or_else(|| ProbeResult::healthy(Duration::from_millis(5)))
    }
}

/// Changes produced by folding one probe result into an instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthUpdate {
    pub status: Option<(InstanceStatus, InstanceStatus)>,
    pub breaker: Option<StateChange>,
}

pub struct HealthMonitor {
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn apply(&self, instance: &mut WorkerInstance, result: &ProbeResult, now: Instant) -> HealthUpdate {
        let health = &mut instance.health;
        health.last_check = Some(Utc::now());
        health.last_latency_ms = Some(result.latency.as_millis() as u64);

        let previous = instance.status;
        let breaker = if result.ok {
            health.consecutive_successes += 1;
            health.consecutive_failures = 0;
            instance.breaker.record_success(now)
        } else {
            health.consecutive_failures += 1;
            health.consecutive_successes = 0;
            debug!(instance_id = %instance.id, detail = ?result.detail, "Health probe failed");
            instance.breaker.record_failure(now)
        };

        let next = self.derive_status(instance, result);
        instance.status = next;
        let status = (next != previous).then_some((previous, next));

        if let Some((from, to)) = status {
            if to == InstanceStatus::Unhealthy {
                warn!(instance_id = %instance.id, %from, %to, "Instance status changed");
            } else {
                info!(instance_id = %instance.id, %from, %to, "Instance status changed");
            }
        }
        HealthUpdate { status, breaker }
    }

    fn derive_status(&self, instance: &WorkerInstance, result: &ProbeResult) -> InstanceStatus {
        let health = &instance.health;
        let slow = result.latency > self.config.degraded_latency();
        let responsive = if slow {
            InstanceStatus::Degraded
        } else {
            InstanceStatus::Healthy
        };

        match instance.status {
            InstanceStatus::Stopping => InstanceStatus::Stopping,
            _ if !result.ok => {
                if health.consecutive_failures >= self.config.failover_threshold {
                    InstanceStatus::Unhealthy
                } else {
                    instance.status
                }
            }
            InstanceStatus::Starting | InstanceStatus::Unhealthy => {
                if health.consecutive_successes >= self.config.recovery_success_threshold {
                    responsive
                } else {
                    instance.status
                }
            }
            InstanceStatus::Healthy | InstanceStatus::Degraded => responsive,
        }
    }
}
