//! The quality assessment collaborator.
//!
//! [`QualityProvider`] is the narrow interface the workflow engine drives:
//! score an entity, apply one improvement, undo one improvement through the
//! inverse action recorded when it was applied, and accept tuning hints.
//! [`SimulatedProvider`] is a deterministic in-memory implementation used by
//! the CLI and tests.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::workflow::{EntityType, Improvement};

/// Issue severity. Declaration order is most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub id: String,
    pub kind: String,
    pub severity: Severity,
    pub description: String,
    /// Score gain expected from resolving this issue.
    pub expected_gain: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    /// Quality score in `[0, 1]`.
    pub score: f64,
    pub issues: Vec<QualityIssue>,
    /// Fraction of its resource budget the entity consumes.
    pub resource_usage: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
    pub entity_type: EntityType,
}

/// Explicit undo for one applied improvement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverseAction {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl InverseAction {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementResult {
    pub success: bool,
    pub before_score: f64,
    pub after_score: f64,
    pub issues_resolved: Vec<String>,
    pub resource_usage: f64,
    pub inverse: InverseAction,
}

/// Secondary tuning hints produced by the optimization stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizationHints {
    pub cpu: f64,
    pub memory: f64,
    pub io: f64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// Worth retrying: timeouts, rate limits, unavailable backends.
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("provider failure: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait QualityProvider: Send + Sync {
    async fn assess(&self, entity: &EntityRef) -> Result<Assessment, ProviderError>;

    async fn improve(
        &self,
        entity: &EntityRef,
        improvement: &Improvement,
    ) -> Result<ImprovementResult, ProviderError>;

    /// Applies a previously recorded inverse action.
    async fn revert(&self, entity: &EntityRef, inverse: &InverseAction) -> Result<(), ProviderError>;

    async fn tune(&self, _entity: &EntityRef, _hints: &OptimizationHints) -> Result<(), ProviderError> {
        Ok(())
    }
}

const ISSUE_CATALOGUE: &[(&str, Severity, f64)] = &[
    ("broken_links", Severity::Critical, 0.12),
    ("missing_sections", Severity::High, 0.1),
    ("inconsistent_terminology", Severity::Medium, 0.06),
    ("long_sentences", Severity::Medium, 0.05),
    ("formatting", Severity::Low, 0.03),
];

#[derive(Debug, Clone)]
struct EntityState {
    score: f64,
    resource_usage: f64,
    resolved: HashSet<String>,
}

/// Deterministic provider: scores derive from the entity id, improvements
/// add their expected gain scaled by `efficiency`.
pub struct SimulatedProvider {
    entities: DashMap<String, EntityState>,
    efficiency: f64,
    latency: Duration,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            efficiency: 1.0,
            latency: Duration::ZERO,
        }
    }

    /// Fraction of the expected gain each improvement actually delivers.
    pub fn with_efficiency(mut self, efficiency: f64) -> Self {
        self.efficiency = efficiency;
        self
    }

    /// Delay added to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn score_of(&self, entity_id: &str) -> Option<f64> {
        self.entities.get(entity_id).map(|s| s.score)
    }

    fn initial_state(entity_id: &str) -> EntityState {
        let spread = entity_id.bytes().map(u32::from).sum::<u32>() % 30;
        EntityState {
            score: 0.35 + f64::from(spread) / 100.0,
            resource_usage: 0.6,
            resolved: HashSet::new(),
        }
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl QualityProvider for SimulatedProvider {
    async fn assess(&self, entity: &EntityRef) -> Result<Assessment, ProviderError> {
        self.pause().await;
        let state = self
            .entities
            .entry(entity.id.clone())
            .or_insert_with(|| Self::initial_state(&entity.id))
            .clone();

        let issues = ISSUE_CATALOGUE
            .iter()
            .filter(|(kind, _, _)| !state.resolved.contains(*kind))
            .map(|(kind, severity, gain)| QualityIssue {
                id: format!("{}:{kind}", entity.id),
                kind: (*kind).to_string(),
                severity: *severity,
                description: format!("{kind} detected in {}", entity.id),
                expected_gain: *gain,
            })
            .collect();

        Ok(Assessment {
            score: state.score,
            issues,
            resource_usage: state.resource_usage,
        })
    }

    async fn improve(
        &self,
        entity: &EntityRef,
        improvement: &Improvement,
    ) -> Result<ImprovementResult, ProviderError> {
        self.pause().await;
        let mut state = self
            .entities
            .entry(entity.id.clone())
            .or_insert_with(|| Self::initial_state(&entity.id));

        let before = state.score;
        let after = (before + improvement.expected_gain * self.efficiency).min(1.0);
        let delta = after - before;
        let usage_delta = 0.02_f64.min(state.resource_usage);
        state.score = after;
        state.resource_usage -= usage_delta;
        state.resolved.insert(improvement.kind.clone());

        Ok(ImprovementResult {
            success: true,
            before_score: before,
            after_score: after,
            issues_resolved: vec![improvement.issue_id.clone()],
            resource_usage: state.resource_usage,
            inverse: InverseAction::new(
                "restore_score",
                serde_json::json!({
                    "score_delta": delta,
                    "usage_delta": usage_delta,
                    "kind": improvement.kind,
                }),
            ),
        })
    }

    async fn revert(&self, entity: &EntityRef, inverse: &InverseAction) -> Result<(), ProviderError> {
        self.pause().await;
        let mut state = self
            .entities
            .get_mut(&entity.id)
            .ok_or_else(|| ProviderError::Permanent(format!("unknown entity {}", entity.id)))?;

        let payload = &inverse.payload;
        let score_delta = payload["score_delta"].as_f64().unwrap_or(0.0);
        let usage_delta = payload["usage_delta"].as_f64().unwrap_or(0.0);
        state.score = (state.score - score_delta).max(0.0);
        state.resource_usage += usage_delta;
        if let Some(kind) = payload["kind"].as_str() {
            state.resolved.remove(kind);
        }
        Ok(())
    }
}
