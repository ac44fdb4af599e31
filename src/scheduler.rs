//! Admission control and priority scheduling.
//!
//! Queued jobs live in one FIFO per priority tier. Each tick resolves
//! dependencies, orders the runnable set with the configured algorithm and
//! admits jobs while the global and per-tier ceilings, the ledger and the
//! balancer allow. Every job considered gets a [`SchedulingDecision`].

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::{LoadBalancer, RouteRequest};
use crate::config::SchedulerConfig;
use crate::error::{FailureKind, OrchestratorError};
use crate::ledger::{ResourceLedger, Resources};
use crate::workflow::{EntityType, JobStatus, Priority, WorkflowJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingAlgorithm {
    /// FIFO within each tier.
    Priority,
    /// Ignores tiers and rotates across entity types in arrival order.
    RoundRobin,
    /// Entity types with the least historical consumption first.
    FairShare,
    /// Entity types with the best recent success rate and latency first.
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Schedule,
    Defer,
    Reject,
    Prioritize,
}

/// State observed when a decision was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionMetrics {
    pub queued: usize,
    pub running: usize,
    pub ledger_utilization: f64,
    pub eligible_instances: usize,
}

/// Audit record of one scheduling decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingDecision {
    pub id: String,
    pub job_id: String,
    pub decision: DecisionKind,
    pub priority: Priority,
    pub instance_id: Option<String>,
    pub reasoning: String,
    pub confidence: f64,
    pub retry_at: Option<DateTime<Utc>>,
    pub metrics: DecisionMetrics,
    pub timestamp: DateTime<Utc>,
}

/// A job admitted this tick, with its reservation held and a slot taken.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub job: WorkflowJob,
    pub instance_id: String,
    /// Time spent queued.
    pub waited: std::time::Duration,
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub decisions: Vec<SchedulingDecision>,
    pub dispatched: Vec<Dispatch>,
    /// Jobs that can never run, already in a terminal status.
    pub failed: Vec<WorkflowJob>,
    /// Queued jobs bumped a tier this tick, with their new priority.
    pub escalated: Vec<WorkflowJob>,
    /// Set when admission hit an invariant violation and stopped early.
    pub fatal: Option<OrchestratorError>,
}

#[derive(Debug)]
struct QueuedJob {
    job: WorkflowJob,
    seq: u64,
    enqueued_at: Instant,
    ticks_waiting: u32,
}

#[derive(Debug, Clone)]
struct RunningJob {
    tier: Priority,
    entity_type: EntityType,
    requirements: Resources,
    eta: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct TypeStats {
    successes: u64,
    failures: u64,
    avg_secs: f64,
}

impl TypeStats {
    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    queues: [VecDeque<QueuedJob>; 4],
    next_seq: u64,
    running: HashMap<String, RunningJob>,
    finished: HashMap<String, JobStatus>,
    /// Archived ids whose terminal record a queued job still needs.
    archived: HashSet<String>,
    consumption: HashMap<EntityType, f64>,
    stats: HashMap<EntityType, TypeStats>,
}

enum Readiness {
    Ready,
    Waiting,
    Broken(String),
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            queues: Default::default(),
            next_seq: 0,
            running: HashMap::new(),
            finished: HashMap::new(),
            archived: HashSet::new(),
            consumption: HashMap::new(),
            stats: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn enqueue(&mut self, job: WorkflowJob, now: Instant) {
        self.finished.remove(&job.id);
        self.archived.remove(&job.id);
        let tier = job.priority.index();
        self.next_seq += 1;
        self.queues[tier].push_back(QueuedJob {
            job,
            seq: self.next_seq,
            enqueued_at: now,
            ticks_waiting: 0,
        });
    }

    pub fn queued_len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn is_queued(&self, job_id: &str) -> bool {
        self.queues.iter().flatten().any(|q| q.job.id == job_id)
    }

    /// Removes a queued job, for cancellation before dispatch.
    pub fn remove_queued(&mut self, job_id: &str) -> Option<WorkflowJob> {
        for queue in &mut self.queues {
            if let Some(pos) = queue.iter().position(|q| q.job.id == job_id) {
                return queue.remove(pos).map(|q| q.job);
            }
        }
        None
    }

    /// Requirements of every running job, for ledger reconciliation.
    pub fn running_requirements(&self) -> HashMap<String, Resources> {
        self.running
            .iter()
            .map(|(id, r)| (id.clone(), r.requirements))
            .collect()
    }

    /// Records a terminal job so dependents can resolve.
    pub fn record_terminal(&mut self, job_id: &str, status: JobStatus) {
        self.finished.insert(job_id.to_string(), status);
    }

    pub fn finished_status(&self, job_id: &str) -> Option<JobStatus> {
        self.finished.get(job_id).copied()
    }

    /// Drops terminal records for archived jobs. A record a queued job still
    /// depends on is kept until a later call finds it unneeded. Returns how
    /// many records were dropped.
    pub fn forget_finished<'a>(&mut self, job_ids: impl IntoIterator<Item = &'a str>) -> usize {
        self.archived.extend(job_ids.into_iter().map(str::to_string));
        let needed: HashSet<&str> = self
            .queues
            .iter()
            .flatten()
            .flat_map(|q| q.job.dependencies.iter().map(String::as_str))
            .collect();
        let releasable: Vec<String> = self
            .archived
            .iter()
            .filter(|id| !needed.contains(id.as_str()))
            .cloned()
            .collect();

        let mut dropped = 0;
        for id in releasable {
            self.archived.remove(&id);
            if self.finished.remove(&id).is_some() {
                dropped += 1;
            }
        }
        dropped
    }

    /// Called when a dispatched job reaches a terminal status.
    pub fn on_finished(&mut self, job: &WorkflowJob) {
        self.record_terminal(&job.id, job.status);
        let Some(run) = self.running.remove(&job.id) else {
            return;
        };
        let secs = job.elapsed().as_secs_f64();
        *self.consumption.entry(run.entity_type).or_default() += run.requirements.weight() * secs.max(1.0);

        let stats = self.stats.entry(run.entity_type).or_default();
        if job.status == JobStatus::Completed {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        let n = (stats.successes + stats.failures) as f64;
        stats.avg_secs += (secs - stats.avg_secs) / n;
    }

    pub fn tick(
        &mut self,
        ledger: &mut ResourceLedger,
        balancer: &mut LoadBalancer,
        now: Instant,
    ) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        self.fail_broken_dependencies(&mut outcome);

        let order = self.runnable_order();
        let max_single = balancer.max_instance_capacity();
        let mut admitted: Vec<(usize, u64, String)> = Vec::new();
        let mut deferred: Vec<(usize, u64)> = Vec::new();
        let mut rejected: Vec<(usize, u64)> = Vec::new();

        for (tier, seq) in order {
            let Some(queued) = self.queues[tier].iter().find(|q| q.seq == seq) else {
                continue;
            };
            let job_id = queued.job.id.clone();
            let priority = queued.job.priority;
            let requirements = queued.job.resource_requirements;
            let entity_type = queued.job.entity_type;
            let estimated_secs = queued.job.estimated_duration_secs;

            if balancer.active_count() > 0 && !requirements.fits_within(&max_single) {
                let reason = format!(
                    "requirements {requirements:?} exceed the largest instance capacity {max_single:?}"
                );
                let d = self.decision(&job_id, priority, DecisionKind::Reject, None, reason, 1.0, None, ledger, balancer);
                outcome.decisions.push(d);
                rejected.push((tier, seq));
                continue;
            }

            let tier_running = self.running.values().filter(|r| r.tier == priority).count();
            let blocked = if self.running.len() >= self.config.max_concurrent_workflows {
                Some("global concurrency ceiling reached".to_string())
            } else if tier_running >= self.config.tier_limits.for_priority(priority) {
                Some(format!("{priority} tier ceiling reached"))
            } else if let Some(reason) = ledger.halt_reason() {
                Some(format!("admissions halted: {reason}"))
            } else if !ledger.can_reserve(&requirements) {
                Some("insufficient free capacity".to_string())
            } else {
                None
            };

            if let Some(reason) = blocked {
                let retry_at = self.earliest_completion();
                let confidence = if self.running.is_empty() { 0.4 } else { 0.7 };
                let d = self.decision(&job_id, priority, DecisionKind::Defer, None, reason, confidence, Some(retry_at), ledger, balancer);
                outcome.decisions.push(d);
                deferred.push((tier, seq));
                continue;
            }

            if let Err(e) = ledger.reserve(&job_id, requirements) {
                outcome.fatal = Some(e);
                break;
            }
            let routed = match balancer.select(&RouteRequest::new(job_id.clone(), requirements)) {
                Ok(routed) => routed,
                Err(e) => {
                    if let Err(release) = ledger.release(&job_id) {
                        error!(job_id = %job_id, error = %release, "Failed to release reservation");
                    }
                    outcome.fatal = Some(e);
                    break;
                }
            };
            let Some(instance_id) = routed.instance_id else {
                if let Err(e) = ledger.release(&job_id) {
                    error!(job_id = %job_id, error = %e, "Failed to release reservation");
                    outcome.fatal = Some(e);
                    break;
                }
                let retry_at = self.earliest_completion();
                let d = self.decision(&job_id, priority, DecisionKind::Defer, None, routed.reasoning, 0.5, Some(retry_at), ledger, balancer);
                outcome.decisions.push(d);
                deferred.push((tier, seq));
                continue;
            };

            let confidence = (1.0 - 0.5 * ledger.utilization()).clamp(0.5, 1.0);
            let reasoning = format!("admitted to {instance_id}: {}", routed.reasoning);
            let d = self.decision(&job_id, priority, DecisionKind::Schedule, Some(instance_id.clone()), reasoning, confidence, None, ledger, balancer);
            outcome.decisions.push(d);

            let eta = Utc::now()
                + chrono::Duration::seconds(i64::try_from(estimated_secs).unwrap_or(i64::MAX / 1000));
            self.running.insert(
                job_id.clone(),
                RunningJob {
                    tier: priority,
                    entity_type,
                    requirements,
                    eta,
                },
            );
            info!(job_id = %job_id, instance_id = %instance_id, %priority, "Workflow admitted");
            admitted.push((tier, seq, instance_id));
        }

        for (tier, seq, instance_id) in admitted {
            let Some(pos) = self.queues[tier].iter().position(|q| q.seq == seq) else {
                continue;
            };
            if let Some(queued) = self.queues[tier].remove(pos) {
                outcome.dispatched.push(Dispatch {
                    waited: now.saturating_duration_since(queued.enqueued_at),
                    job: queued.job,
                    instance_id,
                });
            }
        }
        for (tier, seq) in rejected {
            if let Some(mut job) = self.take(tier, seq) {
                warn!(job_id = %job.id, "Workflow rejected, requirements exceed instance capacity");
                job.finish(
                    JobStatus::Failed,
                    Some(FailureKind::System("requirements exceed max instance capacity".into())),
                );
                self.record_terminal(&job.id, job.status);
                outcome.failed.push(job);
            }
        }
        for (tier, seq) in deferred {
            if let Some((d, job)) = self.note_deferral(tier, seq, ledger, balancer) {
                outcome.decisions.push(d);
                outcome.escalated.push(job);
            }
        }
        outcome
    }

    fn take(&mut self, tier: usize, seq: u64) -> Option<WorkflowJob> {
        let pos = self.queues[tier].iter().position(|q| q.seq == seq)?;
        self.queues[tier].remove(pos).map(|q| q.job)
    }

    /// Counts a missed tick and bumps the job one tier once it has starved.
    fn note_deferral(
        &mut self,
        tier: usize,
        seq: u64,
        ledger: &ResourceLedger,
        balancer: &LoadBalancer,
    ) -> Option<(SchedulingDecision, WorkflowJob)> {
        let starvation = self.config.starvation_ticks;
        let queued = self.queues[tier].iter_mut().find(|q| q.seq == seq)?;
        queued.ticks_waiting += 1;
        if queued.ticks_waiting < starvation || queued.job.priority == Priority::Critical {
            return None;
        }

        let pos = self.queues[tier].iter().position(|q| q.seq == seq)?;
        let mut queued = self.queues[tier].remove(pos)?;
        let from = queued.job.priority;
        let to = from.escalate();
        queued.job.priority = to;
        queued.ticks_waiting = 0;
        let job = queued.job.clone();
        let job_id = job.id.clone();
        let waited = queued.enqueued_at.elapsed();

        let target = &mut self.queues[to.index()];
        let at = target.iter().position(|q| q.seq > queued.seq).unwrap_or(target.len());
        target.insert(at, queued);

        info!(job_id = %job_id, %from, %to, "Starved workflow escalated");
        let reason = format!("not admitted for {starvation} ticks ({waited:?}); escalated from {from} to {to}");
        let decision = self.decision(&job_id, to, DecisionKind::Prioritize, None, reason, 0.8, None, ledger, balancer);
        Some((decision, job))
    }

    /// Fails queued jobs whose dependencies ended in anything but `completed`.
    fn fail_broken_dependencies(&mut self, outcome: &mut TickOutcome) {
        let mut broken = Vec::new();
        for (tier, queue) in self.queues.iter().enumerate() {
            for q in queue {
                if let Readiness::Broken(reason) = self.readiness(&q.job) {
                    broken.push((tier, q.seq, reason));
                }
            }
        }
        for (tier, seq, reason) in broken {
            if let Some(mut job) = self.take(tier, seq) {
                warn!(job_id = %job.id, %reason, "Workflow cannot run");
                job.finish(JobStatus::Failed, Some(FailureKind::System(reason)));
                self.record_terminal(&job.id, job.status);
                outcome.failed.push(job);
            }
        }
    }

    fn readiness(&self, job: &WorkflowJob) -> Readiness {
        let mut waiting = false;
        for dep in &job.dependencies {
            match self.finished.get(dep) {
                Some(JobStatus::Completed) => {}
                Some(status) => {
                    return Readiness::Broken(format!("dependency {dep} ended in {status:?}"));
                }
                None => waiting = true,
            }
        }
        if waiting { Readiness::Waiting } else { Readiness::Ready }
    }

    /// `(tier, seq)` of runnable jobs. Tiers go in priority order except
    /// under round robin, which rotates across all of them.
    fn runnable_order(&self) -> Vec<(usize, u64)> {
        if self.config.algorithm == SchedulingAlgorithm::RoundRobin {
            let mut all: Vec<(usize, &QueuedJob)> = self
                .queues
                .iter()
                .enumerate()
                .flat_map(|(tier, queue)| queue.iter().map(move |q| (tier, q)))
                .filter(|(_, q)| matches!(self.readiness(&q.job), Readiness::Ready))
                .collect();
            all.sort_by_key(|(_, q)| q.seq);

            let mut seen: HashMap<EntityType, usize> = HashMap::new();
            let mut keyed: Vec<(usize, u64, usize)> = all
                .into_iter()
                .map(|(tier, q)| {
                    let rank = seen.entry(q.job.entity_type).or_default();
                    let key = (*rank, q.seq, tier);
                    *rank += 1;
                    key
                })
                .collect();
            keyed.sort();
            return keyed.into_iter().map(|(_, seq, tier)| (tier, seq)).collect();
        }

        let mut order = Vec::new();
        for (tier, queue) in self.queues.iter().enumerate() {
            let mut runnable: Vec<&QueuedJob> = queue
                .iter()
                .filter(|q| matches!(self.readiness(&q.job), Readiness::Ready))
                .collect();
            match self.config.algorithm {
                SchedulingAlgorithm::Priority | SchedulingAlgorithm::RoundRobin => {
                    runnable.sort_by_key(|q| q.seq)
                }
                SchedulingAlgorithm::FairShare => runnable.sort_by(|a, b| {
                    let ca = self.consumption.get(&a.job.entity_type).copied().unwrap_or(0.0);
                    let cb = self.consumption.get(&b.job.entity_type).copied().unwrap_or(0.0);
                    ca.total_cmp(&cb).then(a.seq.cmp(&b.seq))
                }),
                SchedulingAlgorithm::Adaptive => runnable.sort_by(|a, b| {
                    let sa = self.adaptive_score(a.job.entity_type);
                    let sb = self.adaptive_score(b.job.entity_type);
                    sb.total_cmp(&sa).then(a.seq.cmp(&b.seq))
                }),
            }
            order.extend(runnable.into_iter().map(|q| (tier, q.seq)));
        }
        order
    }

    /// Recent success rate blended with how quickly the type finishes.
    fn adaptive_score(&self, entity_type: EntityType) -> f64 {
        let stats = self.stats.get(&entity_type).cloned().unwrap_or_default();
        0.7 * stats.success_rate() + 0.3 / (1.0 + stats.avg_secs / 60.0)
    }

    fn earliest_completion(&self) -> DateTime<Utc> {
        self.running
            .values()
            .map(|r| r.eta)
            .min()
            .unwrap_or_else(|| {
                Utc::now()
                    + chrono::Duration::milliseconds(self.config.tick_interval_ms.min(i64::MAX as u64) as i64)
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn decision(
        &self,
        job_id: &str,
        priority: Priority,
        decision: DecisionKind,
        instance_id: Option<String>,
        reasoning: String,
        confidence: f64,
        retry_at: Option<DateTime<Utc>>,
        ledger: &ResourceLedger,
        balancer: &LoadBalancer,
    ) -> SchedulingDecision {
        debug!(job_id, ?decision, %reasoning, "Scheduling decision");
        SchedulingDecision {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            decision,
            priority,
            instance_id,
            reasoning,
            confidence,
            retry_at,
            metrics: DecisionMetrics {
                queued: self.queued_len(),
                running: self.running.len(),
                ledger_utilization: ledger.utilization(),
                eligible_instances: balancer.eligible_count(),
            },
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::{InstanceCapacity, InstanceStatus, WorkerInstance};
    use crate::config::{CircuitBreakerConfig, LoadBalancerConfig, TierLimits};
    use crate::workflow::{RetryConfig, TriggerRequest};

    struct Fixture {
        scheduler: Scheduler,
        ledger: ResourceLedger,
        balancer: LoadBalancer,
    }

    impl Fixture {
        fn new(config: SchedulerConfig, instances: usize) -> Self {
            let mut balancer = LoadBalancer::new(&LoadBalancerConfig::default());
            let mut ledger = ResourceLedger::new(Resources::zero());
            for i in 0..instances {
                let w = WorkerInstance::new(
                    format!("w-{i}"),
                    InstanceCapacity::default(),
                    &CircuitBreakerConfig::default(),
                )
                .with_status(InstanceStatus::Healthy);
                ledger.add_capacity(w.capacity.resources());
                balancer.add_instance(w).unwrap();
            }
            Self {
                scheduler: Scheduler::new(config),
                ledger,
                balancer,
            }
        }

        fn submit(&mut self, request: TriggerRequest) -> String {
            let job = WorkflowJob::new(request, RetryConfig::default(), Duration::from_secs(60));
            let id = job.id.clone();
            self.scheduler.enqueue(job, Instant::now());
            id
        }

        fn tick(&mut self) -> TickOutcome {
            self.scheduler
                .tick(&mut self.ledger, &mut self.balancer, Instant::now())
        }

        fn finish(&mut self, dispatch: &Dispatch, status: JobStatus) {
            let mut job = dispatch.job.clone();
            job.start(&dispatch.instance_id);
            job.finish(status, None);
            self.ledger.release(&job.id).unwrap();
            self.balancer.complete(
                &dispatch.instance_id,
                &job.resource_requirements,
                status == JobStatus::Completed,
                Duration::from_millis(10),
                Instant::now(),
            );
            self.scheduler.on_finished(&job);
        }
    }

    fn req(id: &str, priority: Priority, cpu: f64) -> TriggerRequest {
        TriggerRequest::new(format!("entity-{id}"), EntityType::Document, priority)
            .with_id(id)
            .requiring(Resources::new(cpu, 0.1, 0.1))
    }

    fn decision_for<'a>(outcome: &'a TickOutcome, job_id: &str) -> Vec<&'a SchedulingDecision> {
        outcome.decisions.iter().filter(|d| d.job_id == job_id).collect()
    }

    #[test]
    fn critical_is_admitted_before_low() {
        let mut f = Fixture::new(SchedulerConfig::default(), 1);
        f.submit(req("low", Priority::Low, 0.6));
        f.submit(req("crit", Priority::Critical, 0.6));

        let outcome = f.tick();
        assert_eq!(outcome.dispatched.len(), 1);
        assert_eq!(outcome.dispatched[0].job.id, "crit");
        let low = decision_for(&outcome, "low");
        assert_eq!(low[0].decision, DecisionKind::Defer);
        assert!(low[0].retry_at.is_some());
        assert_eq!(f.ledger.allocation("crit"), Some(Resources::new(0.6, 0.1, 0.1)));
    }

    #[test]
    fn tier_ceiling_defers() {
        let config = SchedulerConfig {
            tier_limits: TierLimits {
                low: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut f = Fixture::new(config, 2);
        f.submit(req("a", Priority::Low, 0.1));
        f.submit(req("b", Priority::Low, 0.1));
        let outcome = f.tick();
        assert_eq!(outcome.dispatched.len(), 1);
        assert_eq!(decision_for(&outcome, "b")[0].reasoning, "low tier ceiling reached");
    }

    #[test]
    fn global_ceiling_defers() {
        let config = SchedulerConfig {
            max_concurrent_workflows: 1,
            ..Default::default()
        };
        let mut f = Fixture::new(config, 2);
        f.submit(req("a", Priority::High, 0.1));
        f.submit(req("b", Priority::High, 0.1));
        let outcome = f.tick();
        assert_eq!(outcome.dispatched.len(), 1);
        assert_eq!(
            decision_for(&outcome, "b")[0].reasoning,
            "global concurrency ceiling reached"
        );
    }

    #[test]
    fn oversized_requirement_is_rejected() {
        let mut f = Fixture::new(SchedulerConfig::default(), 2);
        f.submit(req("huge", Priority::High, 1.5));
        let outcome = f.tick();
        assert_eq!(decision_for(&outcome, "huge")[0].decision, DecisionKind::Reject);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].status, JobStatus::Failed);
        assert_eq!(f.scheduler.queued_len(), 0);
    }

    #[test]
    fn dependencies_gate_dispatch() {
        let mut f = Fixture::new(SchedulerConfig::default(), 2);
        f.submit(req("parent", Priority::Medium, 0.1));
        f.submit(req("child", Priority::Critical, 0.1).depends_on(["parent"]));

        let first = f.tick();
        assert_eq!(first.dispatched.len(), 1);
        assert_eq!(first.dispatched[0].job.id, "parent");
        assert!(decision_for(&first, "child").is_empty());

        let parent = first.dispatched[0].clone();
        f.finish(&parent, JobStatus::Completed);
        let second = f.tick();
        assert_eq!(second.dispatched[0].job.id, "child");
    }

    #[test]
    fn failed_dependency_fails_dependent() {
        let mut f = Fixture::new(SchedulerConfig::default(), 2);
        f.submit(req("parent", Priority::Medium, 0.1));
        f.submit(req("child", Priority::Medium, 0.1).depends_on(["parent"]));
        let first = f.tick();
        let parent = first.dispatched[0].clone();
        f.finish(&parent, JobStatus::RolledBack);

        let second = f.tick();
        assert_eq!(second.failed.len(), 1);
        let child = &second.failed[0];
        assert_eq!(child.id, "child");
        assert!(matches!(&child.failure, Some(FailureKind::System(r)) if r.contains("parent")));
    }

    #[test]
    fn starved_job_is_escalated() {
        let config = SchedulerConfig {
            starvation_ticks: 2,
            ..Default::default()
        };
        let mut f = Fixture::new(config, 1);
        f.submit(req("hog", Priority::Critical, 0.9));
        f.tick();
        f.submit(req("starved", Priority::Low, 0.5));

        let outcome = f.tick();
        assert!(decision_for(&outcome, "starved").iter().all(|d| d.decision == DecisionKind::Defer));
        let outcome = f.tick();
        let bumped = decision_for(&outcome, "starved");
        assert_eq!(bumped.last().unwrap().decision, DecisionKind::Prioritize);
        assert_eq!(bumped.last().unwrap().priority, Priority::Medium);
    }

    #[test]
    fn no_eligible_instance_defers_and_releases() {
        let mut f = Fixture::new(SchedulerConfig::default(), 1);
        f.balancer.instance_mut("w-0").unwrap().status = InstanceStatus::Degraded;
        f.balancer.instance_mut("w-0").unwrap().load.active_connections = 4;
        f.submit(req("a", Priority::High, 0.1));
        let outcome = f.tick();
        let d = decision_for(&outcome, "a");
        assert_eq!(d[0].decision, DecisionKind::Defer);
        assert_eq!(d[0].reasoning, "no healthy instances");
        assert_eq!(f.ledger.reservation_count(), 0);
    }

    #[test]
    fn fair_share_prefers_least_consumed_type() {
        let config = SchedulerConfig {
            algorithm: SchedulingAlgorithm::FairShare,
            max_concurrent_workflows: 1,
            ..Default::default()
        };
        let mut f = Fixture::new(config, 1);
        f.submit(req("doc-1", Priority::Medium, 0.1));
        let first = f.tick();
        let done = first.dispatched[0].clone();
        f.finish(&done, JobStatus::Completed);

        f.submit(req("doc-2", Priority::Medium, 0.1));
        f.submit(
            TriggerRequest::new("chunk-1", EntityType::Chunk, Priority::Medium)
                .with_id("chunk-job")
                .requiring(Resources::new(0.1, 0.1, 0.1)),
        );
        let second = f.tick();
        assert_eq!(second.dispatched[0].job.id, "chunk-job");
    }

    fn chunk(id: &str, priority: Priority) -> TriggerRequest {
        TriggerRequest::new(format!("entity-{id}"), EntityType::Chunk, priority)
            .with_id(id)
            .requiring(Resources::new(0.1, 0.1, 0.1))
    }

    #[test]
    fn round_robin_ignores_tiers() {
        let config = SchedulerConfig {
            algorithm: SchedulingAlgorithm::RoundRobin,
            max_concurrent_workflows: 1,
            ..Default::default()
        };
        let mut f = Fixture::new(config, 2);
        for n in 0..3 {
            f.submit(req(&format!("low-{n}"), Priority::Low, 0.1));
        }
        f.submit(req("crit", Priority::Critical, 0.1));

        let outcome = f.tick();
        assert_eq!(outcome.dispatched.len(), 1);
        assert_eq!(outcome.dispatched[0].job.id, "low-0");
        assert_eq!(decision_for(&outcome, "crit")[0].decision, DecisionKind::Defer);
    }

    #[test]
    fn round_robin_rotates_entity_types_across_tiers() {
        let config = SchedulerConfig {
            algorithm: SchedulingAlgorithm::RoundRobin,
            ..Default::default()
        };
        let mut f = Fixture::new(config, 4);
        f.submit(req("d1", Priority::Low, 0.1));
        f.submit(req("d2", Priority::High, 0.1));
        f.submit(chunk("c1", Priority::Medium));
        f.submit(chunk("c2", Priority::Critical));

        let outcome = f.tick();
        let ids: Vec<_> = outcome.dispatched.iter().map(|d| d.job.id.as_str()).collect();
        assert_eq!(ids, ["d1", "c1", "d2", "c2"]);
    }

    #[test]
    fn priority_keeps_fifo_within_tier() {
        let mut f = Fixture::new(SchedulerConfig::default(), 4);
        f.submit(req("m1", Priority::Medium, 0.1));
        f.submit(req("h1", Priority::High, 0.1));
        f.submit(req("m2", Priority::Medium, 0.1));
        let outcome = f.tick();
        let ids: Vec<_> = outcome.dispatched.iter().map(|d| d.job.id.as_str()).collect();
        assert_eq!(ids, ["h1", "m1", "m2"]);
    }

    #[test]
    fn adaptive_prefers_type_with_better_history() {
        let config = SchedulerConfig {
            algorithm: SchedulingAlgorithm::Adaptive,
            max_concurrent_workflows: 1,
            ..Default::default()
        };
        let mut f = Fixture::new(config, 1);
        f.submit(chunk("chunk-bad", Priority::Medium));
        let first = f.tick();
        let bad = first.dispatched[0].clone();
        f.finish(&bad, JobStatus::Failed);

        f.submit(req("doc-good", Priority::Medium, 0.1));
        let second = f.tick();
        let good = second.dispatched[0].clone();
        f.finish(&good, JobStatus::Completed);

        f.submit(chunk("chunk-next", Priority::Medium));
        f.submit(req("doc-next", Priority::Medium, 0.1));
        let third = f.tick();
        assert_eq!(third.dispatched[0].job.id, "doc-next");
        assert_eq!(decision_for(&third, "chunk-next")[0].decision, DecisionKind::Defer);
    }

    #[test]
    fn escalated_job_is_reported_with_new_priority() {
        let config = SchedulerConfig {
            starvation_ticks: 1,
            ..Default::default()
        };
        let mut f = Fixture::new(config, 0);
        f.submit(req("waiting", Priority::Low, 0.1));
        let outcome = f.tick();
        assert_eq!(outcome.escalated.len(), 1);
        assert_eq!(outcome.escalated[0].id, "waiting");
        assert_eq!(outcome.escalated[0].priority, Priority::Medium);
        assert_eq!(outcome.escalated[0].original_priority, Priority::Low);
    }

    #[test]
    fn requeued_id_clears_its_terminal_record() {
        let mut f = Fixture::new(SchedulerConfig::default(), 1);
        f.submit(req("job-1", Priority::High, 0.1));
        let first = f.tick();
        let done = first.dispatched[0].clone();
        f.finish(&done, JobStatus::Completed);
        assert_eq!(f.scheduler.finished_status("job-1"), Some(JobStatus::Completed));

        f.submit(req("job-1", Priority::Low, 0.1));
        assert_eq!(f.scheduler.finished_status("job-1"), None);
        f.submit(req("child", Priority::Critical, 0.1).depends_on(["job-1"]));
        let outcome = f.tick();
        let ids: Vec<_> = outcome.dispatched.iter().map(|d| d.job.id.as_str()).collect();
        assert_eq!(ids, ["job-1"]);
    }

    #[test]
    fn forget_keeps_records_queued_jobs_depend_on() {
        let config = SchedulerConfig {
            max_concurrent_workflows: 1,
            ..Default::default()
        };
        let mut f = Fixture::new(config, 1);
        f.submit(req("a", Priority::High, 0.1));
        f.submit(req("b", Priority::High, 0.1));
        let first = f.tick();
        let a = first.dispatched[0].clone();
        f.finish(&a, JobStatus::Completed);
        let second = f.tick();
        let b = second.dispatched[0].clone();
        f.submit(req("c", Priority::High, 0.1).depends_on(["a"]));
        f.finish(&b, JobStatus::Completed);

        assert_eq!(f.scheduler.forget_finished(["a", "b"]), 1);
        assert_eq!(f.scheduler.finished_status("a"), Some(JobStatus::Completed));
        assert_eq!(f.scheduler.finished_status("b"), None);

        let third = f.tick();
        assert_eq!(third.dispatched[0].job.id, "c");
        assert_eq!(f.scheduler.forget_finished(std::iter::empty()), 1);
        assert_eq!(f.scheduler.finished_status("a"), None);
    }

    #[test]
    fn removed_job_is_not_dispatched() {
        let mut f = Fixture::new(SchedulerConfig::default(), 1);
        f.submit(req("a", Priority::High, 0.1));
        assert!(f.scheduler.is_queued("a"));
        assert!(f.scheduler.remove_queued("a").is_some());
        assert!(f.tick().dispatched.is_empty());
    }
}
