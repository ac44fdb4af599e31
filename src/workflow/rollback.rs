//! Rollback plans: the inverse actions recorded while improvements are
//! applied, and the conditions that pre-empt execution.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::WorkflowConfig;
use crate::provider::InverseAction;

/// Condition evaluated after every applied improvement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackTrigger {
    /// Score fell more than `threshold` below the initial score.
    QualityDegradation { threshold: f64 },
    /// Entity resource usage exceeded `threshold`.
    ResourceUsage { threshold: f64 },
    /// The workflow ran longer than `timeout_secs`.
    ExecutionTime { timeout_secs: u64 },
}

/// Observations taken during execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionSnapshot {
    pub initial_score: f64,
    pub current_score: f64,
    pub resource_usage: f64,
    pub elapsed: Duration,
}

impl RollbackTrigger {
    /// Returns the reason when this trigger fires.
    pub fn fired(&self, snapshot: &ExecutionSnapshot) -> Option<String> {
        match *self {
            RollbackTrigger::QualityDegradation { threshold } => {
                let degradation = snapshot.initial_score - snapshot.current_score;
                (degradation > threshold).then(|| {
                    format!("quality degraded by {degradation:.3} (limit {threshold:.3})")
                })
            }
            RollbackTrigger::ResourceUsage { threshold } => {
                (snapshot.resource_usage > threshold).then(|| {
                    format!(
                        "resource usage {:.3} above limit {threshold:.3}",
                        snapshot.resource_usage
                    )
                })
            }
            RollbackTrigger::ExecutionTime { timeout_secs } => {
                (snapshot.elapsed > Duration::from_secs(timeout_secs)).then(|| {
                    format!(
                        "execution time {}s exceeded timeout {timeout_secs}s",
                        snapshot.elapsed.as_secs()
                    )
                })
            }
        }
    }
}

/// Inverse of one applied improvement, recorded at apply time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackStep {
    pub improvement_id: String,
    pub inverse: InverseAction,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub steps: Vec<RollbackStep>,
    pub triggers: Vec<RollbackTrigger>,
}

impl RollbackPlan {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            steps: Vec::new(),
            triggers: vec![
                RollbackTrigger::QualityDegradation {
                    threshold: config.quality_degradation_threshold,
                },
                RollbackTrigger::ResourceUsage {
                    threshold: config.resource_usage_threshold,
                },
                RollbackTrigger::ExecutionTime {
                    timeout_secs: config.workflow_timeout_secs,
                },
            ],
        }
    }

    pub fn record(&mut self, improvement_id: &str, inverse: InverseAction) {
        self.steps.push(RollbackStep {
            improvement_id: improvement_id.to_string(),
            inverse,
            recorded_at: Utc::now(),
        });
    }

    /// First trigger that fires for the snapshot, if any.
    pub fn check(&self, snapshot: &ExecutionSnapshot) -> Option<String> {
        self.triggers.iter().find_map(|t| t.fired(snapshot))
    }

    /// Steps in reverse application order.
    pub fn undo_order(&self) -> impl Iterator<Item = &RollbackStep> {
        self.steps.iter().rev()
    }
}

/// One executed undo step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub improvement_id: String,
    pub inverse_kind: String,
    pub reverted: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}
