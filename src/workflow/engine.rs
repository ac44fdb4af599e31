//! Executes one admitted workflow through its stages.
//!
//! The engine task owns the job for its whole run. Every transition is
//! published on a watch channel so status readers never touch the job
//! itself. Cancellation is cooperative: the flag is read between stages and
//! between improvements, and a stage result that arrives after the flag was
//! raised is discarded.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use super::job::{AppliedImprovement, Improvement, Priority, WorkflowJob};
use super::rollback::{ExecutionSnapshot, RollbackEntry, RollbackPlan};
use super::rules::{Planner, PlanningFacts};
use super::stage::{Stage, StageMachine, StageOutcome, Transition};
use crate::config::WorkflowConfig;
use crate::error::{FailureKind, Result};
use crate::provider::{EntityRef, OptimizationHints, ProviderError, QualityProvider, Severity};

pub struct WorkflowEngine {
    provider: Arc<dyn QualityProvider>,
    config: WorkflowConfig,
    planner: Planner,
}

impl WorkflowEngine {
    pub fn new(provider: Arc<dyn QualityProvider>, config: WorkflowConfig) -> Result<Self> {
        let planner = Planner::new(&config.rules)?;
        Ok(Self {
            provider,
            config,
            planner,
        })
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Runs the job to a terminal status and returns it.
    #[instrument(skip_all, fields(job_id = %job.id, entity_id = %job.entity_id))]
    pub async fn run(
        &self,
        mut job: WorkflowJob,
        cancel: Arc<AtomicBool>,
        updates: &watch::Sender<WorkflowJob>,
    ) -> WorkflowJob {
        let entity = EntityRef {
            id: job.entity_id.clone(),
            entity_type: job.entity_type,
        };
        updates.send_replace(job.clone());

        while !job.status.is_terminal() {
            if cancel.load(Ordering::SeqCst) && job.stage != Stage::Rollback {
                let transition = StageMachine::cancel(&mut job);
                info!(stage = %job.stage, ?transition, "Workflow cancelled");
                updates.send_replace(job.clone());
                continue;
            }

            let past_validation = matches!(
                job.stage,
                Stage::Optimization | Stage::Completion | Stage::Rollback
            );
            if !past_validation && job.elapsed() > self.config.workflow_timeout() {
                let reason = format!(
                    "workflow timeout of {}s exceeded",
                    self.config.workflow_timeout_secs
                );
                warn!(stage = %job.stage, %reason, "Rollback trigger fired");
                StageMachine::next(&mut job, StageOutcome::Failure(FailureKind::System(reason)));
                updates.send_replace(job.clone());
                continue;
            }

            let stage = job.stage;
            let outcome = self.run_stage(&mut job, &entity, &cancel).await;

            if cancel.load(Ordering::SeqCst) && stage != Stage::Rollback {
                debug!(%stage, "Discarding stage result after cancellation");
                continue;
            }

            let transition = StageMachine::next(&mut job, outcome);
            match &transition {
                Transition::Next(next) => debug!(from = %stage, to = %next, "Stage advanced"),
                Transition::Retry { reason, .. } => {
                    let delay_ms = job.retry_config.delay_for_attempt(job.retry_count);
                    warn!(
                        %stage,
                        attempt = job.retry_count,
                        max = job.retry_config.max_retries,
                        %reason,
                        delay_ms,
                        "Retrying stage"
                    );
                    updates.send_replace(job.clone());
                    sleep(Duration::from_millis(delay_ms)).await;
                    continue;
                }
                Transition::RollBack(kind) => warn!(%stage, %kind, "Rolling back workflow"),
                Transition::Fail(kind) => warn!(%stage, %kind, "Workflow failed"),
                Transition::Complete => info!(
                    initial_score = ?job.context.initial_score,
                    final_score = ?job.context.final_score,
                    "Workflow completed"
                ),
                Transition::RolledBack => info!(
                    reverted = job.context.rollback_log.len(),
                    "Workflow rolled back"
                ),
                Transition::Cancelled => {}
            }
            updates.send_replace(job.clone());
        }

        job
    }

    async fn run_stage(
        &self,
        job: &mut WorkflowJob,
        entity: &EntityRef,
        cancel: &AtomicBool,
    ) -> StageOutcome {
        match job.stage {
            Stage::Initialization => self.initialize(job),
            Stage::Assessment => self.assess(job, entity).await,
            Stage::Analysis => self.analyze(job),
            Stage::Planning => self.plan(job),
            Stage::Execution => self.execute(job, entity, cancel).await,
            Stage::Validation => self.validate(job, entity).await,
            Stage::Optimization => self.optimize(job, entity).await,
            Stage::Completion => {
                job.context.validate(Stage::Completion, true, "workflow finished");
                StageOutcome::Success
            }
            Stage::Rollback => self.roll_back(job, entity).await,
        }
    }

    fn initialize(&self, job: &mut WorkflowJob) -> StageOutcome {
        if job.entity_id.trim().is_empty() {
            job.context.validate(Stage::Initialization, false, "empty entity id");
            return StageOutcome::Failure(FailureKind::Business("empty entity id".into()));
        }
        job.rollback_plan = RollbackPlan::from_config(&self.config);
        job.context.resource_reduction_target = self.config.resource_reduction_target;
        job.context.validate(Stage::Initialization, true, "rollback plan prepared");
        StageOutcome::Success
    }

    async fn assess(&self, job: &mut WorkflowJob, entity: &EntityRef) -> StageOutcome {
        let assessment = match self.call(self.provider.assess(entity)).await {
            Ok(a) => a,
            Err(e) => return provider_outcome(e),
        };
        if !(0.0..=1.0).contains(&assessment.score) {
            let detail = format!("score {} out of range", assessment.score);
            job.context.validate(Stage::Assessment, false, detail.clone());
            return StageOutcome::Failure(FailureKind::System(detail));
        }

        job.context.validate(
            Stage::Assessment,
            true,
            format!(
                "score {:.3} with {} issues",
                assessment.score,
                assessment.issues.len()
            ),
        );
        job.context.initial_score = Some(assessment.score);
        job.context.initial_resource_usage = Some(assessment.resource_usage);
        job.context.detected_issues = assessment.issues;
        StageOutcome::Success
    }

    fn analyze(&self, job: &mut WorkflowJob) -> StageOutcome {
        let low_priority = job.priority == Priority::Low;
        let candidates: Vec<Improvement> = job
            .context
            .detected_issues
            .iter()
            .filter(|issue| !low_priority || issue.severity <= Severity::High)
            .enumerate()
            .map(|(n, issue)| Improvement {
                id: format!("{}-imp-{}", job.id, n + 1),
                issue_id: issue.id.clone(),
                kind: issue.kind.clone(),
                severity: issue.severity,
                expected_gain: issue.expected_gain,
            })
            .collect();

        if candidates.is_empty() {
            job.context.validate(Stage::Analysis, false, "no applicable improvements");
            return StageOutcome::Failure(FailureKind::Business(
                "no applicable improvements".into(),
            ));
        }
        job.context.validate(
            Stage::Analysis,
            true,
            format!("{} candidate improvements", candidates.len()),
        );
        job.context.candidate_improvements = candidates;
        StageOutcome::Success
    }

    fn plan(&self, job: &mut WorkflowJob) -> StageOutcome {
        let ctx = &job.context;
        let facts = PlanningFacts {
            entity_type: job.entity_type,
            priority: job.priority,
            initial_score: ctx.initial_score.unwrap_or_default(),
            issue_count: ctx.detected_issues.len(),
            critical_issues: ctx
                .detected_issues
                .iter()
                .filter(|i| i.severity == Severity::Critical)
                .count(),
            resource_usage: ctx.initial_resource_usage.unwrap_or_default(),
        };
        let outcome = self.planner.plan(
            &facts,
            ctx.candidate_improvements.clone(),
            ctx.resource_reduction_target,
        );

        if outcome.improvements.is_empty() {
            job.context.validate(Stage::Planning, false, "plan is empty");
            return StageOutcome::Failure(FailureKind::Business("plan is empty".into()));
        }
        debug!(rules = ?outcome.applied_rules, target = outcome.target_score, "Plan computed");
        job.context.validate(
            Stage::Planning,
            true,
            format!(
                "{} improvements, target {:.3}",
                outcome.improvements.len(),
                outcome.target_score
            ),
        );
        job.context.planned_improvements = outcome.improvements;
        job.context.target_score = Some(outcome.target_score);
        job.context.resource_reduction_target = outcome.resource_reduction_target;
        StageOutcome::Success
    }

    async fn execute(
        &self,
        job: &mut WorkflowJob,
        entity: &EntityRef,
        cancel: &AtomicBool,
    ) -> StageOutcome {
        let planned = job.context.planned_improvements.clone();
        let total = planned.len().max(1);
        let initial = job.context.initial_score.unwrap_or_default();

        for (n, improvement) in planned.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                return StageOutcome::Success;
            }
            let already_applied = job
                .context
                .applied_improvements
                .iter()
                .any(|a| a.improvement_id == improvement.id);
            if already_applied {
                continue;
            }

            let result = match self.call(self.provider.improve(entity, improvement)).await {
                Ok(r) => r,
                Err(e) => return provider_outcome(e),
            };
            if !result.success {
                return StageOutcome::Failure(FailureKind::Business(format!(
                    "improvement {} was not applied",
                    improvement.id
                )));
            }

            job.rollback_plan.record(&improvement.id, result.inverse.clone());
            job.context.applied_improvements.push(AppliedImprovement {
                improvement_id: improvement.id.clone(),
                kind: improvement.kind.clone(),
                before_score: result.before_score,
                after_score: result.after_score,
                issues_resolved: result.issues_resolved.clone(),
                applied_at: Utc::now(),
            });
            let span = Stage::Execution.checkpoint() - Stage::Execution.entry_progress();
            job.advance_progress(
                Stage::Execution.entry_progress() + (usize::from(span) * (n + 1) / total) as u8,
            );

            let snapshot = ExecutionSnapshot {
                initial_score: initial,
                current_score: result.after_score,
                resource_usage: result.resource_usage,
                elapsed: job.elapsed(),
            };
            if let Some(reason) = job.rollback_plan.check(&snapshot) {
                warn!(improvement_id = %improvement.id, %reason, "Rollback trigger fired");
                job.context.validate(Stage::Execution, false, reason.clone());
                return StageOutcome::Failure(FailureKind::System(reason));
            }
        }

        job.context.validate(
            Stage::Execution,
            true,
            format!("{} improvements applied", job.context.applied_improvements.len()),
        );
        StageOutcome::Success
    }

    async fn validate(&self, job: &mut WorkflowJob, entity: &EntityRef) -> StageOutcome {
        let assessment = match self.call(self.provider.assess(entity)).await {
            Ok(a) => a,
            Err(e) => return provider_outcome(e),
        };
        let ctx = &mut job.context;
        ctx.final_score = Some(assessment.score);
        ctx.final_resource_usage = Some(assessment.resource_usage);

        let initial = ctx.initial_score.unwrap_or_default();
        let target = ctx.target_score.unwrap_or(initial);
        let reduction = ctx.initial_resource_usage.unwrap_or_default() - assessment.resource_usage;

        let mut misses = Vec::new();
        if assessment.score < self.config.validation_ratio * target {
            misses.push(format!(
                "score {:.3} below {:.0}% of target {target:.3}",
                assessment.score,
                self.config.validation_ratio * 100.0
            ));
        }
        if reduction + 1e-9 < ctx.resource_reduction_target {
            misses.push(format!(
                "resource reduction {reduction:.3} below {:.3}",
                ctx.resource_reduction_target
            ));
        }
        if assessment.score <= initial {
            misses.push(format!(
                "score {:.3} did not improve on {initial:.3}",
                assessment.score
            ));
        }

        if misses.is_empty() {
            ctx.validate(Stage::Validation, true, format!("final score {:.3}", assessment.score));
            StageOutcome::Success
        } else {
            let detail = misses.join("; ");
            ctx.validate(Stage::Validation, false, detail.clone());
            StageOutcome::Failure(FailureKind::Business(format!("validation failed: {detail}")))
        }
    }

    async fn optimize(&self, job: &mut WorkflowJob, entity: &EntityRef) -> StageOutcome {
        let before = job.context.initial_resource_usage.unwrap_or_default();
        let after = job.context.final_resource_usage.unwrap_or(before);
        let scale = if before > 0.0 { (after / before).clamp(0.1, 1.0) } else { 1.0 };
        let req = job.resource_requirements;
        let hints = OptimizationHints {
            cpu: req.cpu * scale,
            memory: req.memory * scale,
            io: req.io * scale,
        };
        job.context.optimization_hints = Some(hints);

        match self.call(self.provider.tune(entity, &hints)).await {
            Ok(()) => {
                job.context.validate(Stage::Optimization, true, "tuning hints applied");
                StageOutcome::Success
            }
            Err(e) => {
                warn!(error = %e, "Optimization failed, continuing");
                job.context.validate(Stage::Optimization, false, e.to_string());
                StageOutcome::Failure(FailureKind::System(e.to_string()))
            }
        }
    }

    /// Reverts applied improvements newest first. Every step is logged.
    async fn roll_back(&self, job: &mut WorkflowJob, entity: &EntityRef) -> StageOutcome {
        let steps: Vec<_> = job.rollback_plan.undo_order().cloned().collect();
        let mut failed = 0usize;

        for step in steps {
            let already_reverted = job
                .context
                .rollback_log
                .iter()
                .any(|e| e.reverted && e.improvement_id == step.improvement_id);
            if already_reverted {
                continue;
            }
            let result = self.call(self.provider.revert(entity, &step.inverse)).await;
            let (reverted, detail) = match &result {
                Ok(()) => (true, "reverted".to_string()),
                Err(e) => {
                    failed += 1;
                    warn!(improvement_id = %step.improvement_id, error = %e, "Undo step failed");
                    (false, e.to_string())
                }
            };
            job.context.rollback_log.push(RollbackEntry {
                improvement_id: step.improvement_id.clone(),
                inverse_kind: step.inverse.kind.clone(),
                reverted,
                detail,
                at: Utc::now(),
            });
        }

        if failed == 0 {
            StageOutcome::Success
        } else {
            StageOutcome::Failure(FailureKind::System(format!(
                "rollback incomplete: {failed} undo steps failed"
            )))
        }
    }

    /// Bounds a provider call by the stage timeout.
    async fn call<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, ProviderError>>,
    ) -> std::result::Result<T, ProviderError> {
        match timeout(self.config.stage_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transient(format!(
                "provider call exceeded {}s",
                self.config.stage_timeout_secs
            ))),
        }
    }
}

fn provider_outcome(error: ProviderError) -> StageOutcome {
    match error {
        ProviderError::Transient(msg) => StageOutcome::Retryable(msg),
        ProviderError::Permanent(msg) => StageOutcome::Failure(FailureKind::System(msg)),
    }
}
