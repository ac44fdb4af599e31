//! Fleet sizing.
//!
//! Each evaluation measures the fleet, optionally forecasts the next few
//! samples, and adds or drains at most one instance. Drained instances leave
//! the ledger immediately and leave the pool once their last workflow ends
//! or the drain timeout passes.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::balancer::LoadBalancer;
use super::instance::{InstanceStatus, WorkerInstance};
use crate::config::{AutoScalerConfig, CircuitBreakerConfig};
use crate::ledger::ResourceLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    None,
}

/// Audit record of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub id: String,
    pub action: ScalingAction,
    pub instances_before: usize,
    pub instances_after: usize,
    pub avg_cpu: f64,
    pub avg_memory: f64,
    pub forecast: Option<f64>,
    pub instance_id: Option<String>,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

/// Predicts fleet load `horizon` samples ahead.
pub trait LoadForecaster: Send + Sync {
    fn forecast(&self, history: &[f64], horizon: usize) -> Option<f64>;
}

/// Least-squares line through the history, extrapolated.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearTrendForecaster;

impl LoadForecaster for LinearTrendForecaster {
    fn forecast(&self, history: &[f64], horizon: usize) -> Option<f64> {
        if history.len() < 3 {
            return None;
        }
        let n = history.len() as f64;
        let mean_x = (n - 1.0) / 2.0;
        let mean_y = history.iter().sum::<f64>() / n;
        let (mut num, mut den) = (0.0, 0.0);
        for (x, y) in history.iter().enumerate() {
            let dx = x as f64 - mean_x;
            num += dx * (y - mean_y);
            den += dx * dx;
        }
        let slope = if den > 0.0 { num / den } else { 0.0 };
        let last_x = n - 1.0;
        Some(mean_y + slope * (last_x + horizon as f64 - mean_x))
    }
}

pub struct AutoScaler {
    config: AutoScalerConfig,
    breaker: CircuitBreakerConfig,
    forecaster: Box<dyn LoadForecaster>,
    history: VecDeque<f64>,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
}

impl AutoScaler {
    pub fn new(config: AutoScalerConfig, breaker: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breaker,
            forecaster: Box::new(LinearTrendForecaster),
            history: VecDeque::new(),
            last_scale_up: None,
            last_scale_down: None,
        }
    }

    pub fn with_forecaster(mut self, forecaster: Box<dyn LoadForecaster>) -> Self {
        self.forecaster = forecaster;
        self
    }

    pub fn config(&self) -> &AutoScalerConfig {
        &self.config
    }

    /// Builds a fresh instance with the configured capacity.
    pub fn provision(&self) -> WorkerInstance {
        let id = Uuid::new_v4().simple().to_string();
        WorkerInstance::new(
            format!("worker-{}", &id[..8]),
            self.config.instance_capacity,
            &self.breaker,
        )
    }

    pub fn evaluate(
        &mut self,
        balancer: &mut LoadBalancer,
        ledger: &mut ResourceLedger,
        now: Instant,
    ) -> ScalingDecision {
        let before = balancer.instances().len();
        let active = balancer.active_count();
        let (avg_cpu, avg_memory, measured) = fleet_average(balancer.instances());

        let mut decision = ScalingDecision {
            id: Uuid::new_v4().to_string(),
            action: ScalingAction::None,
            instances_before: before,
            instances_after: before,
            avg_cpu,
            avg_memory,
            forecast: None,
            instance_id: None,
            reasoning: String::new(),
            timestamp: Utc::now(),
        };

        if !self.config.enabled {
            decision.reasoning = "autoscaler disabled".into();
            return decision;
        }
        if measured == 0 {
            decision.reasoning = "no healthy instances to measure".into();
            return decision;
        }

        self.history.push_back(avg_cpu.max(avg_memory));
        while self.history.len() > self.config.forecast_window.max(1) {
            self.history.pop_front();
        }
        if self.config.predictive {
            let history: Vec<f64> = self.history.iter().copied().collect();
            decision.forecast = self
                .forecaster
                .forecast(&history, self.config.forecast_horizon);
        }

        let up = self.config.scale_up_threshold;
        let down = self.config.scale_down_threshold;
        let overloaded = avg_cpu > up || avg_memory > up;
        let forecast_overloaded = decision.forecast.is_some_and(|f| f > up);

        if overloaded || forecast_overloaded {
            if before >= self.config.max_instances {
                decision.reasoning = format!("at max_instances {}", self.config.max_instances);
            } else if !elapsed(self.last_scale_up, self.config.scale_up_cooldown(), now) {
                decision.reasoning = "scale-up cooldown active".into();
            } else {
                let instance = self.provision();
                let id = instance.id.clone();
                let capacity = instance.capacity.resources();
                if let Err(e) = balancer.add_instance(instance) {
                    decision.reasoning = e.to_string();
                    return decision;
                }
                ledger.add_capacity(capacity);
                self.last_scale_up = Some(now);
                decision.action = ScalingAction::ScaleUp;
                decision.instances_after = before + 1;
                decision.instance_id = Some(id.clone());
                decision.reasoning = if overloaded {
                    format!("fleet load cpu {avg_cpu:.1}% mem {avg_memory:.1}% above {up}%")
                } else {
                    format!("forecast load above {up}%")
                };
                info!(
                    instance_id = %id,
                    avg_cpu,
                    avg_memory,
                    forecast = ?decision.forecast,
                    instances = decision.instances_after,
                    "Scaled up"
                );
            }
        } else if avg_cpu < down && avg_memory < down {
            if active <= self.config.min_instances {
                decision.reasoning = format!("at min_instances {}", self.config.min_instances);
            } else if !elapsed(self.last_scale_down, self.config.scale_down_cooldown(), now) {
                decision.reasoning = "scale-down cooldown active".into();
            } else if let Some(id) = drain_candidate(balancer.instances()) {
                let capacity = balancer
                    .instance(&id)
                    .map(|i| i.capacity.resources())
                    .unwrap_or_default();
                if let Err(e) = ledger.remove_capacity(capacity) {
                    decision.reasoning = e.to_string();
                    return decision;
                }
                if let Some(instance) = balancer.instance_mut(&id) {
                    instance.status = InstanceStatus::Stopping;
                    instance.draining_since = Some(now);
                }
                self.last_scale_down = Some(now);
                decision.action = ScalingAction::ScaleDown;
                decision.instances_after = active - 1;
                decision.instance_id = Some(id.clone());
                decision.reasoning =
                    format!("fleet load cpu {avg_cpu:.1}% mem {avg_memory:.1}% below {down}%");
                info!(instance_id = %id, avg_cpu, avg_memory, "Scaling down, draining instance");
            } else {
                decision.reasoning = "no removable instance".into();
            }
        } else {
            decision.reasoning = "load within thresholds".into();
        }

        debug!(action = ?decision.action, reasoning = %decision.reasoning, "Scaling evaluated");
        decision
    }

    /// Removes drained instances. Returns the ids removed.
    pub fn reap(&self, balancer: &mut LoadBalancer, now: Instant) -> Vec<String> {
        let timeout = self.config.drain_timeout();
        let ready: Vec<(String, bool)> = balancer
            .instances()
            .iter()
            .filter(|i| i.status == InstanceStatus::Stopping)
            .filter_map(|i| {
                let drained = i.load.active_connections == 0;
                let expired = i
                    .draining_since
                    .is_some_and(|since| now.duration_since(since) >= timeout);
                (drained || expired).then(|| (i.id.clone(), !drained))
            })
            .collect();

        let mut removed = Vec::new();
        for (id, forced) in ready {
            if forced {
                warn!(instance_id = %id, "Drain timeout elapsed, forcing removal");
            } else {
                info!(instance_id = %id, "Instance drained and removed");
            }
            if balancer.remove_instance(&id).is_some() {
                removed.push(id);
            }
        }
        removed
    }
}

fn elapsed(last: Option<Instant>, cooldown: std::time::Duration, now: Instant) -> bool {
    last.is_none_or(|at| now.duration_since(at) >= cooldown)
}

/// Mean CPU and memory over routable instances, and how many were measured.
fn fleet_average(instances: &[WorkerInstance]) -> (f64, f64, usize) {
    let measured: Vec<_> = instances.iter().filter(|i| i.status.is_routable()).collect();
    if measured.is_empty() {
        return (0.0, 0.0, 0);
    }
    let n = measured.len() as f64;
    let cpu = measured.iter().map(|i| i.load.cpu).sum::<f64>() / n;
    let memory = measured.iter().map(|i| i.load.memory).sum::<f64>() / n;
    (cpu, memory, measured.len())
}

/// Least-loaded instance that was not part of the seed fleet.
fn drain_candidate(instances: &[WorkerInstance]) -> Option<String> {
    instances
        .iter()
        .filter(|i| !i.is_default && i.status != InstanceStatus::Stopping)
        .min_by(|a, b| {
            a.load
                .active_connections
                .cmp(&b.load.active_connections)
                .then((a.load.cpu + a.load.memory).total_cmp(&(b.load.cpu + b.load.memory)))
        })
        .map(|i| i.id.clone())
}
