use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rollback::{RollbackEntry, RollbackPlan};
use super::stage::Stage;
use crate::error::FailureKind;
use crate::ledger::Resources;
use crate::provider::{OptimizationHints, QualityIssue, Severity};

/// Scheduling tier of a job. Declaration order is admission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// One tier up, saturating at `Critical`.
    pub fn escalate(self) -> Self {
        match self {
            Priority::Critical | Priority::High => Priority::Critical,
            Priority::Medium => Priority::High,
            Priority::Low => Priority::Medium,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Relative weight used by blended scheduling scores.
    pub fn weight(self) -> f64 {
        match self {
            Priority::Critical => 1.0,
            Priority::High => 0.75,
            Priority::Medium => 0.5,
            Priority::Low => 0.25,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Document,
    Chunk,
    System,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityType::Document => "document",
            EntityType::Chunk => "chunk",
            EntityType::System => "system",
        };
        f.write_str(s)
    }
}

/// What started a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    QualityDegradation,
    Manual,
    Schedule,
}

/// Tracks the lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::RolledBack
        )
    }
}

/// Configuration for retrying transient provider failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry budget for the whole job. Every stage draws from the same count.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = min(base_delay_ms * 2^(attempt - 1), max_delay_ms)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
    }
}

/// A candidate or planned change to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub id: String,
    pub issue_id: String,
    pub kind: String,
    pub severity: Severity,
    /// Score gain the provider estimated for this change.
    pub expected_gain: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedImprovement {
    pub improvement_id: String,
    pub kind: String,
    pub before_score: f64,
    pub after_score: f64,
    pub issues_resolved: Vec<String>,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageValidation {
    pub stage: Stage,
    pub passed: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Everything a workflow learns and does to its entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub initial_score: Option<f64>,
    pub target_score: Option<f64>,
    pub final_score: Option<f64>,
    pub initial_resource_usage: Option<f64>,
    pub final_resource_usage: Option<f64>,
    pub resource_reduction_target: f64,
    pub detected_issues: Vec<QualityIssue>,
    pub candidate_improvements: Vec<Improvement>,
    pub planned_improvements: Vec<Improvement>,
    pub applied_improvements: Vec<AppliedImprovement>,
    pub stage_validation_results: Vec<StageValidation>,
    pub rollback_log: Vec<RollbackEntry>,
    pub optimization_hints: Option<OptimizationHints>,
}

impl WorkflowContext {
    pub fn validate(&mut self, stage: Stage, passed: bool, detail: impl Into<String>) {
        self.stage_validation_results.push(StageValidation {
            stage,
            passed,
            detail: detail.into(),
            at: Utc::now(),
        });
    }
}

/// Input to `TriggerWorkflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Caller-chosen id. Generated when absent.
    pub job_id: Option<String>,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub priority: Priority,
    pub triggered_by: TriggerSource,
    pub dependencies: Vec<String>,
    pub resource_requirements: Resources,
    pub estimated_duration_secs: Option<u64>,
}

impl TriggerRequest {
    pub fn new(entity_id: impl Into<String>, entity_type: EntityType, priority: Priority) -> Self {
        Self {
            job_id: None,
            entity_id: entity_id.into(),
            entity_type,
            priority,
            triggered_by: TriggerSource::Manual,
            dependencies: Vec::new(),
            resource_requirements: Resources::new(0.25, 0.25, 0.1),
            estimated_duration_secs: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn requiring(mut self, resources: Resources) -> Self {
        self.resource_requirements = resources;
        self
    }

    pub fn triggered_by(mut self, source: TriggerSource) -> Self {
        self.triggered_by = source;
        self
    }
}

/// One remediation run for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub stage: Stage,
    pub stage_history: Vec<Stage>,
    pub status: JobStatus,
    pub progress: u8,
    pub priority: Priority,
    /// Tier at trigger time; `priority` may be escalated while queued.
    pub original_priority: Priority,
    pub triggered_by: TriggerSource,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub resource_requirements: Resources,
    pub estimated_duration_secs: u64,
    pub dependencies: Vec<String>,
    pub assigned_instance: Option<String>,
    pub context: WorkflowContext,
    pub rollback_plan: RollbackPlan,
    pub retry_count: u32,
    pub retry_config: RetryConfig,
    pub auto_rollback: bool,
    pub failure: Option<FailureKind>,
}

impl WorkflowJob {
    pub fn new(request: TriggerRequest, retry_config: RetryConfig, default_duration: Duration) -> Self {
        Self {
            id: request
                .job_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            entity_id: request.entity_id,
            entity_type: request.entity_type,
            stage: Stage::Initialization,
            stage_history: Vec::new(),
            status: JobStatus::Pending,
            progress: 0,
            priority: request.priority,
            original_priority: request.priority,
            triggered_by: request.triggered_by,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            resource_requirements: request.resource_requirements,
            estimated_duration_secs: request
                .estimated_duration_secs
                .unwrap_or(default_duration.as_secs()),
            dependencies: request.dependencies,
            assigned_instance: None,
            context: WorkflowContext::default(),
            rollback_plan: RollbackPlan::default(),
            retry_count: 0,
            retry_config,
            auto_rollback: true,
            failure: None,
        }
    }

    /// Raises progress, never lowering it.
    pub fn advance_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }

    pub fn start(&mut self, instance_id: &str) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.assigned_instance = Some(instance_id.to_string());
    }

    /// Moves the job to a terminal status.
    pub fn finish(&mut self, status: JobStatus, failure: Option<FailureKind>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.failure = failure;
        self.ended_at = Some(Utc::now());
        if status == JobStatus::Completed {
            self.progress = 100;
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at
            .map(|start| (Utc::now() - start).to_std().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Structured audit record produced when a job reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub priority: Priority,
    pub status: JobStatus,
    pub stage_transitions: Vec<Stage>,
    pub assigned_instance: Option<String>,
    pub initial_score: Option<f64>,
    pub target_score: Option<f64>,
    pub final_score: Option<f64>,
    pub improvements_applied: usize,
    pub improvements_reverted: usize,
    pub retry_count: u32,
    pub failure: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
}

impl JobRecord {
    pub fn from_job(job: &WorkflowJob) -> Self {
        let end = job.ended_at.unwrap_or_else(Utc::now);
        let mut transitions = job.stage_history.clone();
        transitions.push(job.stage);

        Self {
            job_id: job.id.clone(),
            entity_id: job.entity_id.clone(),
            entity_type: job.entity_type,
            priority: job.original_priority,
            status: job.status,
            stage_transitions: transitions,
            assigned_instance: job.assigned_instance.clone(),
            initial_score: job.context.initial_score,
            target_score: job.context.target_score,
            final_score: job.context.final_score,
            improvements_applied: job.context.applied_improvements.len(),
            improvements_reverted: job.context.rollback_log.iter().filter(|e| e.reverted).count(),
            retry_count: job.retry_count,
            failure: job.failure.clone(),
            created_at: job.created_at,
            ended_at: job.ended_at,
            duration_ms: (end - job.created_at).num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_job() -> WorkflowJob {
        WorkflowJob::new(
            TriggerRequest::new("doc-1", EntityType::Document, Priority::High),
            RetryConfig::default(),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn job_creation_defaults() {
        let job = make_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.stage, Stage::Initialization);
        assert_eq!(job.progress, 0);
        assert_eq!(job.retry_config.max_retries, 3);
        assert_eq!(job.estimated_duration_secs, 300);
        assert!(job.stage_history.is_empty());
        assert!(job.auto_rollback);
    }

    #[test]
    fn explicit_id_is_kept() {
        let job = WorkflowJob::new(
            TriggerRequest::new("doc-2", EntityType::Chunk, Priority::Low).with_id("job-42"),
            RetryConfig::default(),
            Duration::from_secs(60),
        );
        assert_eq!(job.id, "job-42");
    }

    #[test]
    fn retry_config_exponential_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
        };
        assert_eq!(config.delay_for_attempt(1), 1000);
        assert_eq!(config.delay_for_attempt(2), 2000);
        assert_eq!(config.delay_for_attempt(3), 4000);
        assert_eq!(config.delay_for_attempt(4), 5000);
        assert_eq!(config.delay_for_attempt(60), 5000);
    }

    #[test]
    fn progress_never_decreases() {
        let mut job = make_job();
        job.advance_progress(40);
        job.advance_progress(20);
        assert_eq!(job.progress, 40);
        job.advance_progress(250);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn priority_escalation_saturates() {
        assert_eq!(Priority::Low.escalate(), Priority::Medium);
        assert_eq!(Priority::Medium.escalate(), Priority::High);
        assert_eq!(Priority::High.escalate(), Priority::Critical);
        assert_eq!(Priority::Critical.escalate(), Priority::Critical);
        assert!(Priority::Critical < Priority::Low);
    }

    #[test]
    fn record_from_job() {
        let mut job = make_job();
        job.start("worker-1");
        job.finish(JobStatus::Completed, None);
        let record = JobRecord::from_job(&job);

        assert_eq!(record.job_id, job.id);
        assert_eq!(record.entity_id, "doc-1");
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.assigned_instance.as_deref(), Some("worker-1"));
        assert_eq!(record.stage_transitions, vec![Stage::Initialization]);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::RolledBack.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
