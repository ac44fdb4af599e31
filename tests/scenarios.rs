use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use qualflow::cluster::{
    AutoScaler, BalancingAlgorithm, CircuitState, InstanceCapacity, InstanceStatus, LoadBalancer,
    ProbeResult, RouteRequest, ScalingAction, SimulatedProbe, WorkerInstance,
};
use qualflow::config::{AutoScalerConfig, CircuitBreakerConfig, LoadBalancerConfig, OrchestratorConfig};
use qualflow::events::OrchestrationEvent;
use qualflow::ledger::{ResourceLedger, Resources};
use qualflow::orchestrator::HealthLevel;
use qualflow::provider::{
    Assessment, EntityRef, ImprovementResult, InverseAction, ProviderError, QualityIssue,
    QualityProvider, Severity, SimulatedProvider,
};
use qualflow::store::{AuditStore, AuditTable, JsonlStore, MemoryStore};
use qualflow::workflow::{EntityType, Improvement, JobRecord, JobStatus, Priority, TriggerRequest};
use qualflow::{Orchestrator, OrchestratorError};

fn config(instances: usize) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.autoscaler.min_instances = instances.max(1);
    config.workflow.retry.base_delay_ms = 1;
    config
}

async fn orchestrator_with(
    config: OrchestratorConfig,
    provider: Arc<dyn QualityProvider>,
    probe: Arc<SimulatedProbe>,
    store: Arc<dyn AuditStore>,
    instances: usize,
) -> Orchestrator {
    let orchestrator = Orchestrator::new(config, provider, probe, store).unwrap();
    orchestrator.seed_fleet(instances).await.unwrap();
    orchestrator
}

async fn simulated(instances: usize) -> Orchestrator {
    orchestrator_with(
        config(instances),
        Arc::new(SimulatedProvider::new()),
        Arc::new(SimulatedProbe::new()),
        Arc::new(MemoryStore::new()),
        instances,
    )
    .await
}

/// Applies improvements that look good, then re-assesses far below target.
struct RegressingProvider {
    assessments: AtomicU32,
    reverted: Mutex<Vec<String>>,
}

impl RegressingProvider {
    fn new() -> Self {
        Self {
            assessments: AtomicU32::new(0),
            reverted: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl QualityProvider for RegressingProvider {
    async fn assess(&self, entity: &EntityRef) -> Result<Assessment, ProviderError> {
        let first = self.assessments.fetch_add(1, Ordering::SeqCst) == 0;
        let issue = |kind: &str, severity| QualityIssue {
            id: format!("{}:{kind}", entity.id),
            kind: kind.into(),
            severity,
            description: kind.into(),
            expected_gain: 0.1,
        };
        Ok(Assessment {
            score: if first { 0.5 } else { 0.25 },
            issues: vec![issue("missing_sections", Severity::High), issue("formatting", Severity::Medium)],
            resource_usage: 0.6,
        })
    }

    async fn improve(
        &self,
        _entity: &EntityRef,
        improvement: &Improvement,
    ) -> Result<ImprovementResult, ProviderError> {
        Ok(ImprovementResult {
            success: true,
            before_score: 0.5,
            after_score: 0.55,
            issues_resolved: vec![improvement.issue_id.clone()],
            resource_usage: 0.5,
            inverse: InverseAction::new("restore", serde_json::json!({ "id": improvement.id })),
        })
    }

    async fn revert(&self, _entity: &EntityRef, inverse: &InverseAction) -> Result<(), ProviderError> {
        let id = inverse.payload["id"].as_str().unwrap_or_default().to_string();
        self.reverted.lock().await.push(id);
        Ok(())
    }
}

/// Parks inside the first `improve` call until released.
struct BlockingProvider {
    entered: Notify,
    release: Notify,
    blocked: AtomicBool,
    reverted: Mutex<Vec<String>>,
}

impl BlockingProvider {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Notify::new(),
            blocked: AtomicBool::new(false),
            reverted: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl QualityProvider for BlockingProvider {
    async fn assess(&self, entity: &EntityRef) -> Result<Assessment, ProviderError> {
        let issue = |kind: &str, severity| QualityIssue {
            id: format!("{}:{kind}", entity.id),
            kind: kind.into(),
            severity,
            description: kind.into(),
            expected_gain: 0.1,
        };
        Ok(Assessment {
            score: 0.5,
            issues: vec![issue("broken_links", Severity::Critical), issue("missing_sections", Severity::High)],
            resource_usage: 0.5,
        })
    }

    async fn improve(
        &self,
        _entity: &EntityRef,
        improvement: &Improvement,
    ) -> Result<ImprovementResult, ProviderError> {
        if !self.blocked.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(ImprovementResult {
            success: true,
            before_score: 0.5,
            after_score: 0.6,
            issues_resolved: vec![improvement.issue_id.clone()],
            resource_usage: 0.5,
            inverse: InverseAction::new("restore", serde_json::json!({ "id": improvement.id })),
        })
    }

    async fn revert(&self, _entity: &EntityRef, inverse: &InverseAction) -> Result<(), ProviderError> {
        let id = inverse.payload["id"].as_str().unwrap_or_default().to_string();
        self.reverted.lock().await.push(id);
        Ok(())
    }
}

#[tokio::test]
async fn scenario_a_critical_job_completes_and_releases_its_instance() {
    let orchestrator = simulated(1).await;
    let mut events = orchestrator.events().subscribe();

    let job_id = orchestrator
        .trigger_workflow(TriggerRequest::new("doc-1", EntityType::Document, Priority::Critical))
        .await
        .unwrap();
    assert_eq!(orchestrator.scheduling_tick().await.unwrap(), 1);

    let job = orchestrator.wait_for(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert!(job.context.final_score.unwrap() > job.context.initial_score.unwrap());

    let instances = orchestrator.instances().await;
    assert_eq!(instances[0].load.active_connections, 0);
    assert_eq!(job.assigned_instance.as_deref(), Some(instances[0].id.as_str()));

    let records: Vec<JobRecord> = orchestrator.store().read(AuditTable::Jobs).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, JobStatus::Completed);

    let mut names = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        names.push(envelope.event.name());
    }
    assert_eq!(names.first(), Some(&"workflow-triggered"));
    assert!(names.contains(&"workflow-completed"));
}

#[tokio::test]
async fn scenario_b_missed_target_rolls_back_every_improvement() {
    let provider = Arc::new(RegressingProvider::new());
    let orchestrator = orchestrator_with(
        config(1),
        provider.clone(),
        Arc::new(SimulatedProbe::new()),
        Arc::new(MemoryStore::new()),
        1,
    )
    .await;

    let job_id = orchestrator
        .trigger_workflow(TriggerRequest::new("doc-2", EntityType::Document, Priority::High))
        .await
        .unwrap();
    orchestrator.scheduling_tick().await.unwrap();
    let job = orchestrator.wait_for(&job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::RolledBack);
    let target = job.context.target_score.unwrap();
    assert!(job.context.final_score.unwrap() <= 0.5 * target + 1e-9);

    let applied: Vec<String> = job
        .context
        .applied_improvements
        .iter()
        .map(|a| a.improvement_id.clone())
        .collect();
    assert!(!applied.is_empty());
    let logged: Vec<String> = job
        .context
        .rollback_log
        .iter()
        .filter(|e| e.reverted)
        .map(|e| e.improvement_id.clone())
        .collect();
    let mut newest_first = applied.clone();
    newest_first.reverse();
    assert_eq!(logged, newest_first);
    assert_eq!(*provider.reverted.lock().await, newest_first);

    let instances = orchestrator.instances().await;
    assert_eq!(instances[0].load.active_connections, 0);
}

#[test]
fn scenario_c_hot_fleet_scales_up_by_one() {
    let mut balancer = LoadBalancer::new(&LoadBalancerConfig::default());
    let mut ledger = ResourceLedger::new(Resources::zero());
    for i in 0..2 {
        let mut w = WorkerInstance::new(format!("w-{i}"), InstanceCapacity::default(), &CircuitBreakerConfig::default())
            .with_status(InstanceStatus::Healthy)
            .as_default();
        w.load.cpu = 90.0;
        ledger.add_capacity(w.capacity.resources());
        balancer.add_instance(w).unwrap();
    }
    let mut scaler = AutoScaler::new(AutoScalerConfig::default(), CircuitBreakerConfig::default());

    let decision = scaler.evaluate(&mut balancer, &mut ledger, Instant::now());
    assert_eq!(decision.action, ScalingAction::ScaleUp);
    assert_eq!(decision.instances_before, 2);
    assert_eq!(decision.instances_after, 3);
    assert_eq!(balancer.instances().len(), 3);
    assert_eq!(ledger.total(), Resources::new(3.0, 3.0, 3.0));
}

#[test]
fn instance_count_stays_within_bounds() {
    let config = AutoScalerConfig {
        min_instances: 2,
        max_instances: 5,
        scale_up_cooldown_secs: 0,
        scale_down_cooldown_secs: 0,
        drain_timeout_secs: 0,
        ..Default::default()
    };
    let mut balancer = LoadBalancer::new(&LoadBalancerConfig::default());
    let mut ledger = ResourceLedger::new(Resources::zero());
    let mut scaler = AutoScaler::new(config, CircuitBreakerConfig::default());
    for _ in 0..2 {
        let w = scaler.provision().with_status(InstanceStatus::Healthy);
        ledger.add_capacity(w.capacity.resources());
        balancer.add_instance(w).unwrap();
    }

    let start = Instant::now();
    let loads = [95.0, 95.0, 95.0, 95.0, 95.0, 10.0, 10.0, 10.0, 10.0, 10.0, 80.0, 5.0];
    for (step, load) in loads.into_iter().enumerate() {
        let now = start + Duration::from_secs(step as u64 * 10);
        for instance in balancer.instances_mut() {
            instance.status = match instance.status {
                InstanceStatus::Starting => InstanceStatus::Healthy,
                other => other,
            };
            instance.load.cpu = load;
            instance.load.memory = load;
        }
        scaler.reap(&mut balancer, now);
        scaler.evaluate(&mut balancer, &mut ledger, now);

        let active = balancer.active_count();
        assert!((2..=5).contains(&active), "step {step}: {active} active instances");
        assert!(balancer.instances().len() <= 5);
        assert!(ledger.allocated().fits_within(&ledger.total()));
    }
}

#[test]
fn round_robin_spreads_requests_evenly() {
    let config = LoadBalancerConfig {
        algorithm: BalancingAlgorithm::RoundRobin,
        ..Default::default()
    };
    let mut balancer = LoadBalancer::new(&config);
    for i in 0..4 {
        let w = WorkerInstance::new(format!("w-{i}"), InstanceCapacity::default(), &CircuitBreakerConfig::default())
            .with_status(InstanceStatus::Healthy);
        balancer.add_instance(w).unwrap();
    }

    let req = Resources::new(0.01, 0.01, 0.01);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for n in 0..1000 {
        let decision = balancer.select(&RouteRequest::new(format!("r-{n}"), req)).unwrap();
        let id = decision.instance_id.unwrap();
        *counts.entry(id.clone()).or_default() += 1;
        balancer.complete(&id, &req, true, Duration::from_millis(1), Instant::now());
    }
    let max = counts.values().max().unwrap();
    let min = counts.values().min().unwrap();
    assert_eq!(counts.len(), 4);
    assert!(max - min <= 1, "{counts:?}");
}

#[tokio::test]
async fn open_breaker_is_never_routed() {
    let orchestrator = simulated(3).await;
    let victim = orchestrator.instances().await[0].id.clone();
    let req = Resources::new(0.01, 0.01, 0.01);

    for _ in 0..5 {
        orchestrator
            .release_route(&victim, &req, false, Duration::from_millis(5))
            .await;
    }
    let snapshot = orchestrator.instances().await;
    assert_eq!(snapshot[0].circuit, CircuitState::Open);

    for n in 0..60 {
        let decision = orchestrator
            .route_request(RouteRequest::new(format!("req-{n}"), req))
            .await
            .unwrap();
        let id = decision.instance_id.unwrap();
        assert_ne!(id, victim);
        orchestrator
            .release_route(&id, &req, true, Duration::from_millis(5))
            .await;
    }
    let metrics = orchestrator.get_orchestration_metrics().await;
    assert_eq!(metrics.totals.routed, 60);
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let orchestrator = simulated(1).await;
    let job_id = orchestrator
        .trigger_workflow(TriggerRequest::new("doc-3", EntityType::Document, Priority::Medium))
        .await
        .unwrap();

    assert!(orchestrator.cancel(&job_id).await.unwrap());
    assert!(!orchestrator.cancel(&job_id).await.unwrap());

    let job = orchestrator.wait_for(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(orchestrator.scheduling_tick().await.unwrap(), 0);
    assert!(matches!(
        orchestrator.cancel("missing").await,
        Err(OrchestratorError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn cancel_during_execution_rolls_back_and_frees_capacity() {
    let provider = Arc::new(BlockingProvider::new());
    let orchestrator = orchestrator_with(
        config(1),
        provider.clone(),
        Arc::new(SimulatedProbe::new()),
        Arc::new(MemoryStore::new()),
        1,
    )
    .await;
    let job_id = orchestrator
        .trigger_workflow(TriggerRequest::new("doc-5", EntityType::Document, Priority::High))
        .await
        .unwrap();
    assert_eq!(orchestrator.scheduling_tick().await.unwrap(), 1);
    assert!(orchestrator.get_orchestration_metrics().await.utilization.ledger > 0.0);

    provider.entered.notified().await;
    assert!(orchestrator.cancel(&job_id).await.unwrap());
    assert!(!orchestrator.cancel(&job_id).await.unwrap());
    provider.release.notify_one();

    let job = orchestrator.wait_for(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::RolledBack);
    assert!(!job.context.rollback_log.is_empty());
    assert!(job.context.rollback_log.iter().all(|e| e.reverted));
    assert_eq!(provider.reverted.lock().await.len(), job.context.applied_improvements.len());

    let instances = orchestrator.instances().await;
    assert_eq!(instances[0].load.active_connections, 0);
    assert_eq!(instances[0].circuit, CircuitState::Closed);
    let metrics = orchestrator.get_orchestration_metrics().await;
    assert_eq!(metrics.utilization.ledger, 0.0);
    assert_eq!(metrics.running, 0);
}

#[tokio::test]
async fn reused_job_id_never_satisfies_a_dependency_early() {
    let mut config = config(2);
    config.workflow.retention_secs = 0;
    let orchestrator = orchestrator_with(
        config,
        Arc::new(SimulatedProvider::new()),
        Arc::new(SimulatedProbe::new()),
        Arc::new(MemoryStore::new()),
        2,
    )
    .await;
    let parent = || TriggerRequest::new("doc-parent", EntityType::Document, Priority::Low).with_id("job-1");

    orchestrator.trigger_workflow(parent()).await.unwrap();
    orchestrator.scheduling_tick().await.unwrap();
    orchestrator.wait_for("job-1").await.unwrap();

    // A queued dependent keeps the archived id reserved.
    let waiting = TriggerRequest::new("doc-a", EntityType::Document, Priority::High).depends_on(["job-1"]);
    let waiting = orchestrator.trigger_workflow(waiting).await.unwrap();
    assert_eq!(orchestrator.retention_tick().await.unwrap(), 1);
    assert!(matches!(
        orchestrator.trigger_workflow(parent()).await,
        Err(OrchestratorError::DuplicateJob(id)) if id == "job-1"
    ));
    assert_eq!(orchestrator.scheduling_tick().await.unwrap(), 1);
    orchestrator.wait_for(&waiting).await.unwrap();
    orchestrator.retention_tick().await.unwrap();

    // Once nothing depends on it, the id is free and the new run gates its dependents.
    orchestrator.trigger_workflow(parent()).await.unwrap();
    let child = TriggerRequest::new("doc-child", EntityType::Document, Priority::Critical).depends_on(["job-1"]);
    let child = orchestrator.trigger_workflow(child).await.unwrap();
    assert_eq!(orchestrator.scheduling_tick().await.unwrap(), 1);
    assert_eq!(orchestrator.get_status(&child).unwrap().status, JobStatus::Pending);

    let parent_job = orchestrator.wait_for("job-1").await.unwrap();
    assert_eq!(orchestrator.scheduling_tick().await.unwrap(), 1);
    let child_job = orchestrator.wait_for(&child).await.unwrap();
    assert!(child_job.started_at.unwrap() >= parent_job.ended_at.unwrap());
}

#[tokio::test]
async fn escalated_priority_is_visible_while_queued() {
    let mut config = config(1);
    config.scheduler.starvation_ticks = 1;
    let orchestrator = orchestrator_with(
        config,
        Arc::new(SimulatedProvider::new()),
        Arc::new(SimulatedProbe::new()),
        Arc::new(MemoryStore::new()),
        0,
    )
    .await;
    let job_id = orchestrator
        .trigger_workflow(TriggerRequest::new("doc-7", EntityType::Document, Priority::Low))
        .await
        .unwrap();

    assert_eq!(orchestrator.scheduling_tick().await.unwrap(), 0);
    let job = orchestrator.get_status(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.priority, Priority::Medium);
    assert_eq!(job.original_priority, Priority::Low);
}

#[tokio::test]
async fn dependent_runs_after_its_parent() {
    let orchestrator = simulated(2).await;
    let parent = orchestrator
        .trigger_workflow(TriggerRequest::new("doc-parent", EntityType::Document, Priority::Low))
        .await
        .unwrap();
    let child = orchestrator
        .trigger_workflow(
            TriggerRequest::new("doc-child", EntityType::Chunk, Priority::Critical).depends_on([parent.clone()]),
        )
        .await
        .unwrap();

    assert_eq!(orchestrator.scheduling_tick().await.unwrap(), 1);
    orchestrator.wait_for(&parent).await.unwrap();
    assert_eq!(orchestrator.get_status(&child).unwrap().status, JobStatus::Pending);

    assert_eq!(orchestrator.scheduling_tick().await.unwrap(), 1);
    let child_job = orchestrator.wait_for(&child).await.unwrap();
    assert_eq!(child_job.status, JobStatus::Completed);
    assert!(child_job.started_at.unwrap() >= orchestrator.get_status(&parent).unwrap().ended_at.unwrap());
}

#[tokio::test]
async fn trigger_rejects_bad_input() {
    let orchestrator = simulated(1).await;
    let request = TriggerRequest::new("doc-1", EntityType::Document, Priority::High).with_id("job-1");
    orchestrator.trigger_workflow(request.clone()).await.unwrap();

    assert!(matches!(
        orchestrator.trigger_workflow(request).await,
        Err(OrchestratorError::DuplicateJob(id)) if id == "job-1"
    ));
    assert!(matches!(
        orchestrator
            .trigger_workflow(TriggerRequest::new(" ", EntityType::Document, Priority::High))
            .await,
        Err(OrchestratorError::InvalidInput(_))
    ));
    assert!(matches!(
        orchestrator
            .trigger_workflow(
                TriggerRequest::new("doc-2", EntityType::Document, Priority::High).depends_on(["nope"])
            )
            .await,
        Err(OrchestratorError::InvalidInput(_))
    ));
    assert!(matches!(
        orchestrator
            .trigger_workflow(
                TriggerRequest::new("doc-3", EntityType::Document, Priority::High)
                    .requiring(Resources::new(-1.0, 0.1, 0.1))
            )
            .await,
        Err(OrchestratorError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn archived_jobs_are_no_longer_found() {
    let mut config = config(1);
    config.workflow.retention_secs = 0;
    let orchestrator = orchestrator_with(
        config,
        Arc::new(SimulatedProvider::new()),
        Arc::new(SimulatedProbe::new()),
        Arc::new(MemoryStore::new()),
        1,
    )
    .await;
    let job_id = orchestrator
        .trigger_workflow(TriggerRequest::new("doc-9", EntityType::Document, Priority::High))
        .await
        .unwrap();
    orchestrator.scheduling_tick().await.unwrap();
    orchestrator.wait_for(&job_id).await.unwrap();

    assert_eq!(orchestrator.retention_tick().await.unwrap(), 1);
    assert!(matches!(
        orchestrator.get_status(&job_id),
        Err(OrchestratorError::JobNotFound(_))
    ));
    let records: Vec<JobRecord> = orchestrator.store().read(AuditTable::Jobs).await.unwrap();
    assert_eq!(records[0].job_id, job_id);
}

#[tokio::test]
async fn failing_probes_mark_instance_unhealthy() {
    let probe = Arc::new(SimulatedProbe::new());
    let orchestrator = orchestrator_with(
        config(2),
        Arc::new(SimulatedProvider::new()),
        probe.clone(),
        Arc::new(MemoryStore::new()),
        2,
    )
    .await;
    let sick = orchestrator.instances().await[1].id.clone();
    probe.set(&sick, ProbeResult::failed(Duration::from_millis(10), "connection refused"));
    let mut events = orchestrator.events().subscribe();

    for _ in 0..3 {
        orchestrator.health_tick().await.unwrap();
    }

    let health = orchestrator.get_system_health().await;
    assert_eq!(health.overall, HealthLevel::Degraded);
    assert_eq!(health.components["instances"].status, HealthLevel::Degraded);
    assert!(health.active_alerts.iter().any(|a| a.component == sick));

    let mut saw_change = false;
    while let Ok(envelope) = events.try_recv() {
        if let OrchestrationEvent::InstanceStatusChanged { instance_id, to, .. } = envelope.event {
            saw_change |= instance_id == sick && to == InstanceStatus::Unhealthy;
        }
    }
    assert!(saw_change);
}

#[tokio::test]
async fn control_loops_drive_jobs_into_a_jsonl_store() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn AuditStore> = Arc::new(JsonlStore::open(dir.path()).await.unwrap());
    let mut config = config(2);
    config.scheduler.tick_interval_ms = 10;
    config.metrics.flush_interval_secs = 1;
    let orchestrator = orchestrator_with(
        config,
        Arc::new(SimulatedProvider::new()),
        Arc::new(SimulatedProbe::new()),
        store,
        2,
    )
    .await;

    orchestrator.start().await;
    let mut ids = Vec::new();
    for n in 0..4 {
        let request = TriggerRequest::new(format!("doc-{n}"), EntityType::Document, Priority::High);
        ids.push(orchestrator.trigger_workflow(request).await.unwrap());
    }
    for id in &ids {
        let job = tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_for(id))
            .await
            .unwrap()
            .unwrap();
        assert!(job.status.is_terminal());
    }
    orchestrator.shutdown().await;

    let jobs = std::fs::read_to_string(dir.path().join("jobs.jsonl")).unwrap();
    assert_eq!(jobs.lines().count(), 4);
    let decisions = orchestrator.store().rows(AuditTable::SchedulingDecisions).await.unwrap();
    assert!(decisions.len() >= 4);
    let metrics = orchestrator.get_orchestration_metrics().await;
    assert_eq!(metrics.totals.triggered, 4);
    assert_eq!(metrics.running, 0);
}
