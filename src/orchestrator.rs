//! The orchestrator: shared state plus the control loops that drive it.
//!
//! [`Orchestrator`] is a cheap handle around one shared core. Each
//! structure sits behind its own lock; when more than one is needed they are
//! always taken in the order scheduler, ledger, balancer, autoscaler. No lock
//! is held across a provider call or a health probe.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{
    AutoScaler, CircuitState, HealthMonitor, HealthProbe, InstanceSnapshot, InstanceStatus,
    LoadBalancer, LoadBalancingDecision, ProbeTarget, RouteRequest, ScalingAction, ScalingDecision,
    StateChange, WorkerInstance,
};
use crate::config::OrchestratorConfig;
use crate::error::{FailureKind, OrchestratorError, Result};
use crate::events::{EventBus, EventSeverity, OrchestrationEvent};
use crate::ledger::{ResourceLedger, Resources};
use crate::metrics::{MetricsCollector, OrchestrationMetrics, Utilization};
use crate::provider::QualityProvider;
use crate::scheduler::{Dispatch, Scheduler};
use crate::store::{AuditStore, AuditTable, BreakerSnapshot};
use crate::workflow::{JobRecord, JobStatus, TriggerRequest, WorkflowEngine, WorkflowJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthLevel,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: EventSeverity,
    pub component: String,
    pub message: String,
}

/// Answer to `GetSystemHealth`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub overall: HealthLevel,
    pub components: BTreeMap<String, ComponentHealth>,
    pub active_alerts: Vec<Alert>,
    pub instances: Vec<InstanceSnapshot>,
}

struct JobEntry {
    updates: Arc<watch::Sender<WorkflowJob>>,
    cancel: Arc<AtomicBool>,
    /// Set once capacity is released and the outcome recorded.
    finalized: watch::Sender<bool>,
}

struct Inner {
    config: OrchestratorConfig,
    engine: WorkflowEngine,
    scheduler: Mutex<Scheduler>,
    ledger: Mutex<ResourceLedger>,
    balancer: Mutex<LoadBalancer>,
    autoscaler: Mutex<AutoScaler>,
    health: HealthMonitor,
    probe: Arc<dyn HealthProbe>,
    metrics: Mutex<MetricsCollector>,
    jobs: DashMap<String, JobEntry>,
    store: Arc<dyn AuditStore>,
    events: EventBus,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        provider: Arc<dyn QualityProvider>,
        probe: Arc<dyn HealthProbe>,
        store: Arc<dyn AuditStore>,
    ) -> Result<Self> {
        config.validate()?;
        let engine = WorkflowEngine::new(provider, config.workflow.clone())?;
        let (shutdown, _) = watch::channel(false);
        let inner = Inner {
            engine,
            scheduler: Mutex::new(Scheduler::new(config.scheduler.clone())),
            ledger: Mutex::new(ResourceLedger::new(Resources::zero())),
            balancer: Mutex::new(LoadBalancer::new(&config.load_balancer)),
            autoscaler: Mutex::new(AutoScaler::new(
                config.autoscaler.clone(),
                config.circuit_breaker.clone(),
            )),
            health: HealthMonitor::new(config.health.clone()),
            probe,
            metrics: Mutex::new(MetricsCollector::new(config.metrics.window())),
            jobs: DashMap::new(),
            store,
            events: EventBus::new(),
            shutdown,
            loops: Mutex::new(Vec::new()),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.inner.store
    }

    /// Adds an instance to the pool and its capacity to the ledger.
    pub async fn add_instance(&self, instance: WorkerInstance) -> Result<()> {
        let mut ledger = self.inner.ledger.lock().await;
        let mut balancer = self.inner.balancer.lock().await;
        let capacity = instance.capacity.resources();
        balancer.add_instance(instance)?;
        ledger.add_capacity(capacity);
        Ok(())
    }

    /// Provisions `count` healthy default instances. Default instances are
    /// never drained by the autoscaler.
    pub async fn seed_fleet(&self, count: usize) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let instance = self
                .inner
                .autoscaler
                .lock()
                .await
                .provision()
                .as_default()
                .with_status(InstanceStatus::Healthy);
            ids.push(instance.id.clone());
            self.add_instance(instance).await?;
        }
        info!(count, "Seeded worker fleet");
        Ok(ids)
    }

    pub async fn instances(&self) -> Vec<InstanceSnapshot> {
        self.inner.balancer.lock().await.snapshots()
    }

    // ---- Exposed operations ----

    /// Validates and queues a workflow. Returns the job id.
    #[instrument(skip_all, fields(entity_id = %request.entity_id))]
    pub async fn trigger_workflow(&self, request: TriggerRequest) -> Result<String> {
        let started = Instant::now();
        if request.entity_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput("entity id must not be empty".into()));
        }
        if !request.resource_requirements.is_valid() {
            return Err(OrchestratorError::InvalidInput(format!(
                "invalid resource requirements {:?}",
                request.resource_requirements
            )));
        }

        let workflow = &self.inner.config.workflow;
        let mut job = WorkflowJob::new(
            request,
            workflow.retry.clone(),
            Duration::from_secs(workflow.default_estimated_duration_secs),
        );
        job.auto_rollback = workflow.enable_automatic_rollback;

        let mut scheduler = self.inner.scheduler.lock().await;
        for dep in &job.dependencies {
            if *dep == job.id {
                return Err(OrchestratorError::InvalidInput(format!("job {dep} depends on itself")));
            }
            if !self.inner.jobs.contains_key(dep) && scheduler.finished_status(dep).is_none() {
                return Err(OrchestratorError::InvalidInput(format!("unknown dependency {dep}")));
            }
        }

        if scheduler.finished_status(&job.id).is_some() {
            return Err(OrchestratorError::DuplicateJob(job.id));
        }
        match self.inner.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => {
                return Err(OrchestratorError::DuplicateJob(job.id));
            }
            Entry::Vacant(slot) => {
                let (updates, _) = watch::channel(job.clone());
                slot.insert(JobEntry {
                    updates: Arc::new(updates),
                    cancel: Arc::new(AtomicBool::new(false)),
                    finalized: watch::channel(false).0,
                });
            }
        }
        scheduler.enqueue(job.clone(), Instant::now());
        drop(scheduler);

        self.inner.metrics.lock().await.record_trigger();
        self.inner.events.emit(OrchestrationEvent::WorkflowTriggered {
            job_id: job.id.clone(),
            entity_id: job.entity_id.clone(),
            entity_type: job.entity_type,
            priority: job.priority,
            triggered_by: job.triggered_by,
        });

        let took = started.elapsed();
        if took > workflow.initiation_budget() {
            warn!(job_id = %job.id, took_ms = took.as_millis() as u64, "Workflow initiation exceeded its budget");
        }
        info!(job_id = %job.id, priority = %job.priority, "Workflow triggered");
        Ok(job.id)
    }

    /// Latest snapshot of a job. Archived jobs are no longer found.
    pub fn get_status(&self, job_id: &str) -> Result<WorkflowJob> {
        self.inner
            .jobs
            .get(job_id)
            .map(|entry| entry.updates.borrow().clone())
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }

    pub fn jobs(&self) -> Vec<WorkflowJob> {
        self.inner
            .jobs
            .iter()
            .map(|entry| entry.updates.borrow().clone())
            .collect()
    }

    /// Watches a job's snapshots as they are published.
    pub fn subscribe(&self, job_id: &str) -> Result<watch::Receiver<WorkflowJob>> {
        self.inner
            .jobs
            .get(job_id)
            .map(|entry| entry.updates.subscribe())
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }

    /// Resolves once the job is terminal and its capacity has been returned.
    pub async fn wait_for(&self, job_id: &str) -> Result<WorkflowJob> {
        let mut done = self
            .inner
            .jobs
            .get(job_id)
            .map(|entry| entry.finalized.subscribe())
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
        done.wait_for(|finalized| *finalized)
            .await
            .map_err(|_| OrchestratorError::JobNotFound(job_id.to_string()))?;
        self.get_status(job_id)
    }

    /// Requests cancellation. Returns `false` when the job already finished or
    /// a cancel was already requested.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let (cancel, updates) = {
            let entry = self
                .inner
                .jobs
                .get(job_id)
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
            (entry.cancel.clone(), entry.updates.clone())
        };
        if updates.borrow().status.is_terminal() {
            return Ok(false);
        }
        if cancel.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let queued = self.inner.scheduler.lock().await.remove_queued(job_id);
        if let Some(mut job) = queued {
            job.finish(JobStatus::Cancelled, Some(FailureKind::System("cancelled".into())));
            self.finalize(job, None, Duration::ZERO).await;
        }
        info!(job_id, "Cancellation requested");
        Ok(true)
    }

    /// Picks an instance for an external request. A rejection is a normal
    /// decision, not an error; callers re-submit.
    pub async fn route_request(&self, request: RouteRequest) -> Result<LoadBalancingDecision> {
        let decision = self.inner.balancer.lock().await.select(&request)?;
        self.inner.metrics.lock().await.record_route(decision.is_routed());
        self.inner.events.emit(OrchestrationEvent::RequestRouted {
            request_id: decision.request_id.clone(),
            instance_id: decision.instance_id.clone(),
            algorithm: decision.algorithm,
        });
        Ok(decision)
    }

    /// Returns the slot taken by a routed request.
    pub async fn release_route(
        &self,
        instance_id: &str,
        requirements: &Resources,
        success: bool,
        elapsed: Duration,
    ) {
        let change = self.inner.balancer.lock().await.complete(
            instance_id,
            requirements,
            success,
            elapsed,
            Instant::now(),
        );
        if let Some(change) = change {
            self.breaker_changed(instance_id, change).await;
        }
    }

    pub async fn get_system_health(&self) -> SystemHealth {
        let (halt, utilization) = {
            let ledger = self.inner.ledger.lock().await;
            (ledger.halt_reason().map(str::to_string), ledger.utilization())
        };
        let instances = self.inner.balancer.lock().await.snapshots();
        let (queued, running) = {
            let scheduler = self.inner.scheduler.lock().await;
            (scheduler.queued_len(), scheduler.running_len())
        };
        let success_rate = {
            let mut metrics = self.inner.metrics.lock().await;
            metrics
                .snapshot(Instant::now(), Utilization::default(), queued, running)
                .success_rate
        };

        let mut components = BTreeMap::new();
        let mut alerts = Vec::new();

        let ledger = match &halt {
            Some(reason) => {
                alerts.push(alert(EventSeverity::Error, "ledger", format!("admissions halted: {reason}")));
                component(HealthLevel::Critical, format!("halted: {reason}"))
            }
            None if utilization > 0.9 => {
                component(HealthLevel::Degraded, format!("{:.0}% reserved", utilization * 100.0))
            }
            None => component(HealthLevel::Healthy, format!("{:.0}% reserved", utilization * 100.0)),
        };
        components.insert("ledger".to_string(), ledger);

        let routable = instances.iter().filter(|i| i.status.is_routable()).count();
        for i in &instances {
            if i.circuit == CircuitState::Open {
                alerts.push(alert(EventSeverity::Warning, &i.id, "circuit open".into()));
            }
            if i.status == InstanceStatus::Unhealthy {
                alerts.push(alert(
                    EventSeverity::Warning,
                    &i.id,
                    format!("unhealthy after {} failed probes", i.health.consecutive_failures),
                ));
            }
        }
        let impaired = instances
            .iter()
            .filter(|i| i.circuit == CircuitState::Open || i.status == InstanceStatus::Unhealthy)
            .count();
        let pool = if routable == 0 {
            alerts.push(alert(EventSeverity::Error, "instances", "no routable instances".into()));
            component(HealthLevel::Critical, "no routable instances".into())
        } else if impaired > 0 {
            component(HealthLevel::Degraded, format!("{routable} routable, {impaired} impaired"))
        } else {
            component(HealthLevel::Healthy, format!("{routable} routable"))
        };
        components.insert("instances".to_string(), pool);

        let ceiling = self.inner.config.scheduler.max_concurrent_workflows;
        let scheduler = if queued > ceiling * 4 {
            component(HealthLevel::Degraded, format!("{queued} queued, {running} running"))
        } else {
            component(HealthLevel::Healthy, format!("{queued} queued, {running} running"))
        };
        components.insert("scheduler".to_string(), scheduler);

        let workflows = if success_rate < 0.5 {
            alerts.push(alert(
                EventSeverity::Warning,
                "workflows",
                format!("success rate {:.0}%", success_rate * 100.0),
            ));
            component(HealthLevel::Degraded, format!("success rate {:.0}%", success_rate * 100.0))
        } else {
            component(HealthLevel::Healthy, format!("success rate {:.0}%", success_rate * 100.0))
        };
        components.insert("workflows".to_string(), workflows);

        let overall = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthLevel::Healthy);
        SystemHealth {
            overall,
            components,
            active_alerts: alerts,
            instances,
        }
    }

    pub async fn get_orchestration_metrics(&self) -> OrchestrationMetrics {
        let (utilization, queued, running) = self.sample().await;
        self.inner
            .metrics
            .lock()
            .await
            .snapshot(Instant::now(), utilization, queued, running)
    }

    // ---- Control loop ticks ----

    /// Admits what fits and spawns an engine task per admitted job.
    /// Returns the number of jobs dispatched.
    pub async fn scheduling_tick(&self) -> Result<usize> {
        let now = Instant::now();
        let outcome = {
            let mut scheduler = self.inner.scheduler.lock().await;
            let mut ledger = self.inner.ledger.lock().await;
            let mut balancer = self.inner.balancer.lock().await;
            if ledger.is_halted() {
                warn!(reason = ?ledger.halt_reason(), "Reconciling halted ledger");
                ledger.reconcile(scheduler.running_requirements())?;
            }
            scheduler.tick(&mut ledger, &mut balancer, now)
        };

        for decision in &outcome.decisions {
            self.audit(AuditTable::SchedulingDecisions, decision).await;
        }
        for job in outcome.escalated {
            if let Some(entry) = self.inner.jobs.get(&job.id) {
                entry.updates.send_if_modified(|current| {
                    if current.status.is_terminal() {
                        return false;
                    }
                    *current = job;
                    true
                });
            }
        }
        for job in outcome.failed {
            self.finalize(job, None, Duration::ZERO).await;
        }
        let dispatched = outcome.dispatched.len();
        for dispatch in outcome.dispatched {
            self.dispatch(dispatch, now).await;
        }

        match outcome.fatal {
            Some(e) => {
                error!(error = %e, "Admission stopped");
                Err(e)
            }
            None => Ok(dispatched),
        }
    }

    /// Probes every instance, then folds the results in. Returns the number
    /// of status changes.
    pub async fn health_tick(&self) -> Result<usize> {
        let targets: Vec<ProbeTarget> = {
            let balancer = self.inner.balancer.lock().await;
            balancer.instances().iter().map(ProbeTarget::from).collect()
        };
        let probes = targets.iter().map(|t| self.inner.probe.probe(t));
        let results = futures::future::join_all(probes).await;

        let now = Instant::now();
        let mut status_changes = Vec::new();
        let mut breaker_changes = Vec::new();
        {
            let mut balancer = self.inner.balancer.lock().await;
            for (target, result) in targets.iter().zip(&results) {
                let Some(instance) = balancer.instance_mut(&target.id) else {
                    continue;
                };
                let update = self.inner.health.apply(instance, result, now);
                if let Some((from, to)) = update.status {
                    status_changes.push((target.id.clone(), from, to));
                }
                if let Some(change) = update.breaker {
                    breaker_changes.push((target.id.clone(), change));
                }
            }
            breaker_changes.extend(balancer.poll_breakers(now));
        }

        for (instance_id, from, to) in &status_changes {
            self.inner.events.emit(OrchestrationEvent::InstanceStatusChanged {
                instance_id: instance_id.clone(),
                from: *from,
                to: *to,
            });
        }
        for (instance_id, change) in breaker_changes {
            self.breaker_changed(&instance_id, change).await;
        }
        Ok(status_changes.len())
    }

    /// Reaps drained instances and runs one scaling evaluation.
    pub async fn scaling_tick(&self) -> Result<ScalingDecision> {
        let now = Instant::now();
        let (decision, reaped) = {
            let mut ledger = self.inner.ledger.lock().await;
            let mut balancer = self.inner.balancer.lock().await;
            let mut autoscaler = self.inner.autoscaler.lock().await;
            let reaped = autoscaler.reap(&mut balancer, now);
            let decision = autoscaler.evaluate(&mut balancer, &mut ledger, now);
            (decision, reaped)
        };
        if !reaped.is_empty() {
            debug!(?reaped, "Drained instances removed");
        }

        self.audit(AuditTable::ScalingDecisions, &decision).await;
        if decision.action != ScalingAction::None {
            self.inner.events.emit(OrchestrationEvent::ScalingCompleted {
                action: decision.action,
                instances_before: decision.instances_before,
                instances_after: decision.instances_after,
                instance_id: decision.instance_id.clone(),
            });
        }
        Ok(decision)
    }

    /// Appends a metrics rollup to the store.
    pub async fn metrics_tick(&self) -> Result<()> {
        let (utilization, queued, running) = self.sample().await;
        let rollup = self
            .inner
            .metrics
            .lock()
            .await
            .rollup(Instant::now(), utilization, queued, running);
        self.inner.store.record(AuditTable::MetricsRollups, &rollup).await
    }

    /// Drops finalized jobs older than the retention period from the live
    /// table. Their records are already in the store.
    pub async fn retention_tick(&self) -> Result<usize> {
        let Some(cutoff) = chrono::Duration::from_std(self.inner.config.workflow.retention())
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Ok(0);
        };
        let expired: Vec<String> = self
            .inner
            .jobs
            .iter()
            .filter(|entry| {
                let job = entry.updates.borrow();
                *entry.finalized.borrow() && job.ended_at.is_some_and(|at| at <= cutoff)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut scheduler = self.inner.scheduler.lock().await;
        for id in &expired {
            self.inner.jobs.remove(id);
        }
        let forgotten = scheduler.forget_finished(expired.iter().map(String::as_str));
        drop(scheduler);
        if !expired.is_empty() || forgotten > 0 {
            info!(archived = expired.len(), forgotten, "Archived terminal workflows");
        }
        Ok(expired.len())
    }

    /// Recomputes ledger allocations from the running set.
    pub async fn reconcile_ledger(&self) -> Result<()> {
        let scheduler = self.inner.scheduler.lock().await;
        let mut ledger = self.inner.ledger.lock().await;
        ledger.reconcile(scheduler.running_requirements())
    }

    // ---- Lifecycle ----

    /// Spawns the control loops. Each runs until [`Orchestrator::shutdown`].
    pub async fn start(&self) {
        let config = &self.inner.config;
        let handles = vec![
            self.spawn_loop("scheduling", config.scheduler.tick_interval(), |o| async move {
                o.scheduling_tick().await.map(|_| ())
            }),
            self.spawn_loop("health", config.health.interval(), |o| async move {
                o.health_tick().await.map(|_| ())
            }),
            self.spawn_loop("scaling", config.autoscaler.interval(), |o| async move {
                o.scaling_tick().await.map(|_| ())
            }),
            self.spawn_loop("metrics", config.metrics.flush_interval(), |o| async move {
                o.metrics_tick().await
            }),
            self.spawn_loop("retention", config.metrics.flush_interval(), |o| async move {
                o.retention_tick().await.map(|_| ())
            }),
        ];
        self.inner.loops.lock().await.extend(handles);
        info!("Control loops started");
    }

    /// Stops the control loops. Running workflows finish on their own tasks.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let handles: Vec<_> = self.inner.loops.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Control loop ended abnormally");
            }
        }
        info!("Control loops stopped");
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Orchestrator) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let this = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = tick(this.clone()).await {
                            error!(control_loop = name, error = %e, "Control loop iteration failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!(control_loop = name, "Control loop exiting");
        })
    }

    // ---- Internals ----

    async fn dispatch(&self, dispatch: Dispatch, now: Instant) {
        let Dispatch {
            mut job,
            instance_id,
            waited,
        } = dispatch;
        job.start(&instance_id);
        job.auto_rollback = self.inner.config.workflow.enable_automatic_rollback;
        self.inner.metrics.lock().await.record_dispatch(waited, now);

        let Some((updates, cancel)) = self
            .inner
            .jobs
            .get(&job.id)
            .map(|entry| (entry.updates.clone(), entry.cancel.clone()))
        else {
            // Unknown to the live table; give the capacity back.
            warn!(job_id = %job.id, "Dispatched job has no live entry");
            job.finish(JobStatus::Failed, Some(FailureKind::System("lost before dispatch".into())));
            self.finalize(job, Some(instance_id), Duration::ZERO).await;
            return;
        };
        updates.send_replace(job.clone());

        let this = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let finished = this.inner.engine.run(job, cancel, &updates).await;
            this.finalize(finished, Some(instance_id), started.elapsed()).await;
        });
    }

    /// Releases a terminal job's capacity and records the outcome.
    async fn finalize(&self, job: WorkflowJob, instance_id: Option<String>, elapsed: Duration) {
        let now = Instant::now();
        let instance_fault = matches!(&job.failure, Some(FailureKind::System(reason)) if reason != "cancelled");
        let breaker_change = {
            let mut scheduler = self.inner.scheduler.lock().await;
            let mut ledger = self.inner.ledger.lock().await;
            let mut balancer = self.inner.balancer.lock().await;
            let change = match &instance_id {
                Some(instance_id) => {
                    if let Err(e) = ledger.release(&job.id) {
                        error!(job_id = %job.id, error = %e, "Failed to release reservation");
                    }
                    balancer
                        .complete(instance_id, &job.resource_requirements, !instance_fault, elapsed, now)
                        .map(|change| (instance_id.clone(), change))
                }
                None => None,
            };
            if instance_id.is_some() {
                scheduler.on_finished(&job);
            } else {
                scheduler.record_terminal(&job.id, job.status);
            }
            change
        };
        if let Some((instance_id, change)) = breaker_change {
            self.breaker_changed(&instance_id, change).await;
        }

        self.inner.metrics.lock().await.record_terminal(job.status, now);
        let record = JobRecord::from_job(&job);
        self.audit(AuditTable::Jobs, &record).await;

        let event = match job.status {
            JobStatus::Completed => OrchestrationEvent::WorkflowCompleted {
                job_id: job.id.clone(),
                initial_score: job.context.initial_score,
                final_score: job.context.final_score,
                duration_ms: record.duration_ms,
            },
            JobStatus::RolledBack => OrchestrationEvent::WorkflowRolledBack {
                job_id: job.id.clone(),
                reverted: record.improvements_reverted,
                failure: job.failure.clone(),
            },
            JobStatus::Cancelled => OrchestrationEvent::WorkflowCancelled { job_id: job.id.clone() },
            _ => OrchestrationEvent::WorkflowFailed {
                job_id: job.id.clone(),
                failure: job.failure.clone(),
            },
        };
        self.inner.events.emit(event);

        info!(job_id = %job.id, status = ?job.status, failure = ?job.failure, "Workflow finished");
        if let Some(entry) = self.inner.jobs.get(&job.id) {
            entry.updates.send_replace(job);
            entry.finalized.send_replace(true);
        }
    }

    async fn breaker_changed(&self, instance_id: &str, change: StateChange) {
        if change.to == CircuitState::Open {
            warn!(instance_id, from = %change.from, to = %change.to, "Circuit breaker state changed");
        } else {
            info!(instance_id, from = %change.from, to = %change.to, "Circuit breaker state changed");
        }
        self.inner.events.emit(OrchestrationEvent::CircuitStateChanged {
            instance_id: instance_id.to_string(),
            from: change.from,
            to: change.to,
        });
        let snapshot = {
            let balancer = self.inner.balancer.lock().await;
            balancer.instance(instance_id).map(BreakerSnapshot::capture)
        };
        if let Some(snapshot) = snapshot {
            self.audit(AuditTable::BreakerSnapshots, &snapshot).await;
        }
    }

    /// Store failures are logged, never propagated into control decisions.
    async fn audit<T: Serialize + Sync>(&self, table: AuditTable, row: &T) {
        if let Err(e) = self.inner.store.record(table, row).await {
            error!(?table, error = %e, "Failed to append audit row");
        }
    }

    async fn sample(&self) -> (Utilization, usize, usize) {
        let (queued, running) = {
            let scheduler = self.inner.scheduler.lock().await;
            (scheduler.queued_len(), scheduler.running_len())
        };
        let ledger = self.inner.ledger.lock().await.utilization();
        let (fleet_cpu, fleet_memory) = {
            let balancer = self.inner.balancer.lock().await;
            let routable: Vec<_> = balancer
                .instances()
                .iter()
                .filter(|i| i.status.is_routable())
                .collect();
            if routable.is_empty() {
                (0.0, 0.0)
            } else {
                let n = routable.len() as f64;
                (
                    routable.iter().map(|i| i.load.cpu).sum::<f64>() / n,
                    routable.iter().map(|i| i.load.memory).sum::<f64>() / n,
                )
            }
        };
        let utilization = Utilization {
            ledger,
            fleet_cpu,
            fleet_memory,
        };
        (utilization, queued, running)
    }
}

fn component(status: HealthLevel, detail: String) -> ComponentHealth {
    ComponentHealth { status, detail }
}

fn alert(severity: EventSeverity, component: &str, message: String) -> Alert {
    Alert {
        severity,
        component: component.to_string(),
        message,
    }
}
