//! Instance selection over the worker pool.
//!
//! The balancer owns the pool. Instances keep their insertion order so the
//! round-robin cursor stays stable while instances come and go.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::circuit_breaker::StateChange;
use super::instance::{InstanceSnapshot, InstanceStatus, WorkerInstance};
use crate::config::LoadBalancerConfig;
use crate::error::{OrchestratorError, Result};
use crate::ledger::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingAlgorithm {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    ResourceAware,
    Adaptive,
}

/// A unit of work looking for an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub request_id: String,
    pub requirements: Resources,
}

impl RouteRequest {
    pub fn new(request_id: impl Into<String>, requirements: Resources) -> Self {
        Self {
            request_id: request_id.into(),
            requirements,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAction {
    Route,
    Reject,
}

/// Audit record of one selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancingDecision {
    pub id: String,
    pub request_id: String,
    pub action: RoutingAction,
    pub instance_id: Option<String>,
    pub algorithm: BalancingAlgorithm,
    pub reasoning: String,
    pub score: Option<f64>,
    pub eligible: usize,
    pub decision_time_us: u64,
    pub timestamp: DateTime<Utc>,
}

impl LoadBalancingDecision {
    pub fn is_routed(&self) -> bool {
        self.action == RoutingAction::Route
    }
}

/// Scores an instance for the adaptive algorithm. Higher is better.
pub trait InstanceScorer: Send + Sync {
    fn score(&self, instance: &WorkerInstance) -> f64;
}

/// `0.4·(1−cpu) + 0.3·(1−mem) + 0.2·(1−io) + 0.1·success`, each normalised to `[0, 1]`.
pub fn resource_aware_score(instance: &WorkerInstance) -> f64 {
    let load = &instance.load;
    0.4 * (1.0 - load.cpu / 100.0)
        + 0.3 * (1.0 - load.memory / 100.0)
        + 0.2 * (1.0 - load.io / 100.0)
        + 0.1 * (instance.performance.success_rate / 100.0)
}

/// Weighted sum of resource headroom, success rate, health and free slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveScorer;

impl InstanceScorer for AdaptiveScorer {
    fn score(&self, instance: &WorkerInstance) -> f64 {
        0.3 * resource_aware_score(instance)
            + 0.3 * (instance.performance.success_rate / 100.0)
            + 0.2 * instance.status.health_score()
            + 0.2 * (1.0 - instance.slot_utilization())
    }
}

pub struct LoadBalancer {
    algorithm: BalancingAlgorithm,
    instances: Vec<WorkerInstance>,
    cursor: usize,
    rng: StdRng,
    budget: Duration,
    scorer: Box<dyn InstanceScorer>,
}

impl LoadBalancer {
    pub fn new(config: &LoadBalancerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            algorithm: config.algorithm,
            instances: Vec::new(),
            cursor: 0,
            rng,
            budget: config.decision_budget(),
            scorer: Box::new(AdaptiveScorer),
        }
    }

    /// Replaces the adaptive scorer.
    pub fn with_scorer(mut self, scorer: Box<dyn InstanceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn algorithm(&self) -> BalancingAlgorithm {
        self.algorithm
    }

    pub fn add_instance(&mut self, instance: WorkerInstance) -> Result<()> {
        if self.instance(&instance.id).is_some() {
            return Err(OrchestratorError::InvalidInput(format!(
                "instance {} already registered",
                instance.id
            )));
        }
        self.instances.push(instance);
        Ok(())
    }

    pub fn remove_instance(&mut self, instance_id: &str) -> Option<WorkerInstance> {
        let pos = self.instances.iter().position(|i| i.id == instance_id)?;
        Some(self.instances.remove(pos))
    }

    pub fn instances(&self) -> &[WorkerInstance] {
        &self.instances
    }

    pub fn instances_mut(&mut self) -> &mut [WorkerInstance] {
        &mut self.instances
    }

    pub fn instance(&self, instance_id: &str) -> Option<&WorkerInstance> {
        self.instances.iter().find(|i| i.id == instance_id)
    }

    pub fn instance_mut(&mut self, instance_id: &str) -> Option<&mut WorkerInstance> {
        self.instances.iter_mut().find(|i| i.id == instance_id)
    }

    pub fn snapshots(&self) -> Vec<InstanceSnapshot> {
        self.instances.iter().map(InstanceSnapshot::from).collect()
    }

    /// Instances not being drained.
    pub fn active_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.status != InstanceStatus::Stopping)
            .count()
    }

    pub fn eligible_count(&self) -> usize {
        self.instances.iter().filter(|i| i.is_eligible()).count()
    }

    /// Largest capacity of any single instance that is not draining.
    pub fn max_instance_capacity(&self) -> Resources {
        self.instances
            .iter()
            .filter(|i| i.status != InstanceStatus::Stopping)
            .map(|i| i.capacity.resources())
            .fold(Resources::zero(), |acc, r| {
                Resources::new(acc.cpu.max(r.cpu), acc.memory.max(r.memory), acc.io.max(r.io))
            })
    }

    /// Advances every breaker whose recovery timeout has elapsed.
    pub fn poll_breakers(&mut self, now: Instant) -> Vec<(String, StateChange)> {
        self.instances
            .iter_mut()
            .filter_map(|i| i.breaker.poll(now).map(|c| (i.id.clone(), c)))
            .collect()
    }

    /// Picks an instance and takes a slot on it.
    ///
    /// An empty eligible set yields a `Reject` decision. Returning an instance
    /// whose breaker is open is reported as [`OrchestratorError::CircuitOpen`].
    pub fn select(&mut self, request: &RouteRequest) -> Result<LoadBalancingDecision> {
        let started = std::time::Instant::now();
        let eligible: Vec<usize> = self
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.is_eligible())
            .map(|(n, _)| n)
            .collect();

        if eligible.is_empty() {
            debug!(request_id = %request.request_id, "No eligible instance");
            return Ok(self.decision(request, None, None, "no healthy instances".into(), 0, started));
        }

        let (picked, score) = self.pick(&eligible);
        let instance = &mut self.instances[picked];
        if instance.breaker.is_open() {
            return Err(OrchestratorError::CircuitOpen(instance.id.clone()));
        }
        instance.assign(&request.requirements);
        let instance_id = instance.id.clone();
        let reasoning = format!(
            "{:?} selected {instance_id} from {} eligible",
            self.algorithm,
            eligible.len()
        );
        Ok(self.decision(request, Some(instance_id), score, reasoning, eligible.len(), started))
    }

    /// Returns the slot taken by `select` and feeds the outcome to the breaker.
    pub fn complete(
        &mut self,
        instance_id: &str,
        requirements: &Resources,
        success: bool,
        elapsed: Duration,
        now: Instant,
    ) -> Option<StateChange> {
        let Some(instance) = self.instance_mut(instance_id) else {
            debug!(instance_id, "Completion for an instance no longer in the pool");
            return None;
        };
        instance.complete(requirements, success, elapsed);
        if success {
            instance.breaker.record_success(now)
        } else {
            instance.breaker.record_failure(now)
        }
    }

    fn pick(&mut self, eligible: &[usize]) -> (usize, Option<f64>) {
        match self.algorithm {
            BalancingAlgorithm::RoundRobin => {
                let picked = eligible[self.cursor % eligible.len()];
                self.cursor = self.cursor.wrapping_add(1);
                (picked, None)
            }
            BalancingAlgorithm::LeastConnections => {
                let picked = eligible
                    .iter()
                    .copied()
                    .min_by(|&a, &b| {
                        let (a, b) = (&self.instances[a], &self.instances[b]);
                        a.load
                            .active_connections
                            .cmp(&b.load.active_connections)
                            .then(a.load.cpu.total_cmp(&b.load.cpu))
                    })
                    .unwrap_or(eligible[0]);
                (picked, None)
            }
            BalancingAlgorithm::WeightedRoundRobin => {
                let total: f64 = eligible.iter().map(|&n| self.instances[n].weight.max(0.0)).sum();
                if total <= 0.0 {
                    return (eligible[0], None);
                }
                let mut point = self.rng.gen_range(0.0..total);
                for &n in eligible {
                    let weight = self.instances[n].weight.max(0.0);
                    if point < weight {
                        return (n, Some(weight / total));
                    }
                    point -= weight;
                }
                (eligible[eligible.len() - 1], None)
            }
            BalancingAlgorithm::ResourceAware => {
                self.best_by(eligible, |_, i| resource_aware_score(i))
            }
            BalancingAlgorithm::Adaptive => self.best_by(eligible, |lb, i| lb.scorer.score(i)),
        }
    }

    /// Highest score wins; ties keep pool order.
    fn best_by(
        &self,
        eligible: &[usize],
        score: impl Fn(&Self, &WorkerInstance) -> f64,
    ) -> (usize, Option<f64>) {
        let mut best = (eligible[0], f64::NEG_INFINITY);
        for &n in eligible {
            let s = score(self, &self.instances[n]);
            if s > best.1 {
                best = (n, s);
            }
        }
        (best.0, Some(best.1))
    }

    fn decision(
        &self,
        request: &RouteRequest,
        instance_id: Option<String>,
        score: Option<f64>,
        reasoning: String,
        eligible: usize,
        started: std::time::Instant,
    ) -> LoadBalancingDecision {
        let elapsed = started.elapsed();
        if elapsed > self.budget {
            warn!(
                request_id = %request.request_id,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.budget.as_millis() as u64,
                "Load balancing decision exceeded its time budget"
            );
        }
        let action = if instance_id.is_some() {
            RoutingAction::Route
        } else {
            RoutingAction::Reject
        };
        LoadBalancingDecision {
            id: Uuid::new_v4().to_string(),
            request_id: request.request_id.clone(),
            action,
            instance_id,
            algorithm: self.algorithm,
            reasoning,
            score,
            eligible,
            decision_time_us: elapsed.as_micros() as u64,
            timestamp: Utc::now(),
        }
    }
}
