use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::{JobStatus, WorkflowJob};
use crate::error::FailureKind;

/// Stages of a remediation workflow.
///
/// Each job flows through: INITIALIZATION → ASSESSMENT → ANALYSIS → PLANNING →
/// EXECUTION → VALIDATION → OPTIMIZATION → COMPLETION, or diverts to ROLLBACK
/// once improvements have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initialization,
    Assessment,
    Analysis,
    Planning,
    Execution,
    Validation,
    Optimization,
    Completion,
    Rollback,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Initialization => write!(f, "INITIALIZATION"),
            Stage::Assessment => write!(f, "ASSESSMENT"),
            Stage::Analysis => write!(f, "ANALYSIS"),
            Stage::Planning => write!(f, "PLANNING"),
            Stage::Execution => write!(f, "EXECUTION"),
            Stage::Validation => write!(f, "VALIDATION"),
            Stage::Optimization => write!(f, "OPTIMIZATION"),
            Stage::Completion => write!(f, "COMPLETION"),
            Stage::Rollback => write!(f, "ROLLBACK"),
        }
    }
}

impl Stage {
    /// The stage that follows a successful run of this one.
    pub fn successor(self) -> Option<Stage> {
        match self {
            Stage::Initialization => Some(Stage::Assessment),
            Stage::Assessment => Some(Stage::Analysis),
            Stage::Analysis => Some(Stage::Planning),
            Stage::Planning => Some(Stage::Execution),
            Stage::Execution => Some(Stage::Validation),
            Stage::Validation => Some(Stage::Optimization),
            Stage::Optimization => Some(Stage::Completion),
            Stage::Completion | Stage::Rollback => None,
        }
    }

    /// Progress reported once this stage has finished.
    pub fn checkpoint(self) -> u8 {
        match self {
            Stage::Initialization => 5,
            Stage::Assessment => 15,
            Stage::Analysis => 25,
            Stage::Planning => 35,
            Stage::Execution => 75,
            Stage::Validation => 85,
            Stage::Optimization => 95,
            Stage::Completion => 100,
            Stage::Rollback => 0,
        }
    }

    /// Progress when this stage begins.
    pub fn entry_progress(self) -> u8 {
        match self {
            Stage::Initialization => 0,
            Stage::Assessment => 5,
            Stage::Analysis => 15,
            Stage::Planning => 25,
            Stage::Execution => 35,
            Stage::Validation => 75,
            Stage::Optimization => 85,
            Stage::Completion => 95,
            Stage::Rollback => 0,
        }
    }
}

/// The result of running one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    /// Transient failure that may succeed on another attempt.
    Retryable(String),
    Failure(FailureKind),
}

/// The result of evaluating a stage transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to the next stage.
    Next(Stage),
    /// Run the current stage again after a backoff.
    Retry { stage: Stage, reason: String },
    /// Undo applied improvements before terminating.
    RollBack(FailureKind),
    /// Terminal success.
    Complete,
    /// Terminal failure without side effects to undo.
    Fail(FailureKind),
    /// Rollback finished.
    RolledBack,
    /// Cancelled with nothing to undo.
    Cancelled,
}

/// Drives a `WorkflowJob` through its stages.
pub struct StageMachine;

impl StageMachine {
    /// Compute and apply the next transition for the given job based on its
    /// current stage and the outcome of running it.
    ///
    /// - Success advances to the successor stage; `Completion` is terminal.
    /// - Retryable failures retry while the job has retries left.
    /// - `Optimization` failures are ignored and advance to `Completion`.
    /// - Other failures roll back when improvements were applied and automatic
    ///   rollback is enabled; otherwise the job fails.
    pub fn next(job: &mut WorkflowJob, outcome: StageOutcome) -> Transition {
        let transition = match (job.stage, outcome) {
            (Stage::Rollback, StageOutcome::Success) => Transition::RolledBack,
            (Stage::Rollback, StageOutcome::Retryable(msg)) => {
                Transition::Fail(FailureKind::System(format!("rollback incomplete: {msg}")))
            }
            (Stage::Rollback, StageOutcome::Failure(kind)) => Transition::Fail(kind),
            (Stage::Completion, StageOutcome::Success) => Transition::Complete,
            (stage, StageOutcome::Success) => match stage.successor() {
                Some(next) => Transition::Next(next),
                None => Transition::Complete,
            },
            (Stage::Optimization, _) => Transition::Next(Stage::Completion),
            (_, StageOutcome::Retryable(reason)) => Self::handle_retryable(job, reason),
            (_, StageOutcome::Failure(kind)) => Self::handle_failure(job, kind),
        };

        Self::apply(job, &transition);
        transition
    }

    /// Cooperative cancellation: roll back applied work, otherwise stop.
    pub fn cancel(job: &mut WorkflowJob) -> Transition {
        let transition = if job.stage == Stage::Rollback {
            // Already undoing; the rollback finishes on its own.
            return Transition::RollBack(FailureKind::System("cancelled".into()));
        } else if job.context.applied_improvements.is_empty() {
            Transition::Cancelled
        } else {
            Transition::RollBack(FailureKind::System("cancelled".into()))
        };
        Self::apply(job, &transition);
        transition
    }

    fn handle_retryable(job: &mut WorkflowJob, reason: String) -> Transition {
        job.retry_count += 1;
        if job.retry_count <= job.retry_config.max_retries {
            Transition::Retry {
                stage: job.stage,
                reason,
            }
        } else {
            Self::handle_failure(job, FailureKind::System(reason))
        }
    }

    fn handle_failure(job: &WorkflowJob, kind: FailureKind) -> Transition {
        let has_side_effects = !job.context.applied_improvements.is_empty();
        if has_side_effects && job.auto_rollback {
            Transition::RollBack(kind)
        } else {
            Transition::Fail(kind)
        }
    }

    fn apply(job: &mut WorkflowJob, transition: &Transition) {
        match transition {
            Transition::Next(next_stage) => {
                job.advance_progress(job.stage.checkpoint());
                job.stage_history.push(job.stage);
                job.stage = *next_stage;
            }
            Transition::Retry { stage, .. } => {
                // Stage stays the same; retry count was already incremented.
                job.stage_history.push(*stage);
            }
            Transition::RollBack(kind) => {
                job.stage_history.push(job.stage);
                job.stage = Stage::Rollback;
                job.failure = Some(kind.clone());
            }
            Transition::Complete => job.finish(JobStatus::Completed, None),
            Transition::Fail(kind) => job.finish(JobStatus::Failed, Some(kind.clone())),
            Transition::RolledBack => {
                let reason = job.failure.clone();
                job.finish(JobStatus::RolledBack, reason);
            }
            Transition::Cancelled => {
                job.finish(JobStatus::Cancelled, Some(FailureKind::System("cancelled".into())))
            }
        }
    }
}
