//! Orchestrator configuration loaded from `qualflow.toml`.
//!
//! [`OrchestratorConfig`] holds every tunable of the control loops. Values
//! missing from the file fall back to defaults. `QUALFLOW_CONFIG` names an
//! alternate file and `QUALFLOW_LOG` overrides the log level.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::{BalancingAlgorithm, InstanceCapacity};
use crate::error::{OrchestratorError, Result};
use crate::scheduler::SchedulingAlgorithm;
use crate::workflow::{Priority, RetryConfig, RuleSpec};

pub const DEFAULT_CONFIG_FILE: &str = "qualflow.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub log_level: LogLevel,
    pub scheduler: SchedulerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub autoscaler: AutoScalerConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health: HealthConfig,
    pub workflow: WorkflowConfig,
    pub metrics: MetricsConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        Self("info".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub algorithm: SchedulingAlgorithm,
    pub tick_interval_ms: u64,
    /// Global ceiling on running workflows.
    pub max_concurrent_workflows: usize,
    pub tier_limits: TierLimits,
    /// Consecutive unadmitted ticks before a job is bumped one tier.
    pub starvation_ticks: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            algorithm: SchedulingAlgorithm::Priority,
            tick_interval_ms: 1000,
            max_concurrent_workflows: 32,
            tier_limits: TierLimits::default(),
            starvation_ticks: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Per-priority concurrency ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierLimits {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            critical: 16,
            high: 8,
            medium: 6,
            low: 2,
        }
    }
}

impl TierLimits {
    pub fn for_priority(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub algorithm: BalancingAlgorithm,
    pub decision_budget_ms: u64,
    /// Seed for weighted sampling. Unset means entropy-seeded.
    pub seed: Option<u64>,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: BalancingAlgorithm::Adaptive,
            decision_budget_ms: 50,
            seed: None,
        }
    }
}

impl LoadBalancerConfig {
    pub fn decision_budget(&self) -> Duration {
        Duration::from_millis(self.decision_budget_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScalerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub min_instances: usize,
    pub max_instances: usize,
    /// Percent CPU or memory above which the fleet grows.
    pub scale_up_threshold: f64,
    /// Percent CPU and memory below which the fleet shrinks.
    pub scale_down_threshold: f64,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
    pub predictive: bool,
    /// Load samples kept for the forecast.
    pub forecast_window: usize,
    /// Samples ahead the forecast looks.
    pub forecast_horizon: usize,
    pub drain_timeout_secs: u64,
    pub instance_capacity: InstanceCapacity,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            min_instances: 2,
            max_instances: 10,
            scale_up_threshold: 75.0,
            scale_down_threshold: 25.0,
            scale_up_cooldown_secs: 300,
            scale_down_cooldown_secs: 600,
            predictive: false,
            forecast_window: 10,
            forecast_horizon: 3,
            drain_timeout_secs: 120,
            instance_capacity: InstanceCapacity::default(),
        }
    }
}

impl AutoScalerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn scale_up_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_up_cooldown_secs)
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_down_cooldown_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub error_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            success_threshold: 3,
            recovery_timeout_secs: 30,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub timeout_ms: u64,
    pub failover_threshold: u32,
    pub recovery_success_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_ms: 2000,
            failover_threshold: 3,
            recovery_success_threshold: 2,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Probe latency above which an instance counts as degraded.
    pub fn degraded_latency(&self) -> Duration {
        self.timeout().mul_f64(0.8)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub enable_automatic_rollback: bool,
    pub workflow_timeout_secs: u64,
    /// Upper bound on a single provider call.
    pub stage_timeout_secs: u64,
    /// Trigger admission into the queue must finish within this budget.
    pub initiation_budget_secs: u64,
    /// Required fraction of the target score at validation.
    pub validation_ratio: f64,
    /// Required drop in resource usage between assessment and validation.
    pub resource_reduction_target: f64,
    /// Rollback trigger: score drop below the initial score during execution.
    pub quality_degradation_threshold: f64,
    /// Rollback trigger: resource usage reported during execution.
    pub resource_usage_threshold: f64,
    pub default_estimated_duration_secs: u64,
    pub retention_secs: u64,
    pub retry: RetryConfig,
    /// Extra optimization rules applied after the built-in strategy.
    pub rules: Vec<RuleSpec>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            enable_automatic_rollback: true,
            workflow_timeout_secs: 1800,
            stage_timeout_secs: 120,
            initiation_budget_secs: 60,
            validation_ratio: 0.9,
            resource_reduction_target: 0.0,
            quality_degradation_threshold: 0.1,
            resource_usage_threshold: 0.95,
            default_estimated_duration_secs: 300,
            retention_secs: 86_400,
            retry: RetryConfig::default(),
            rules: Vec::new(),
        }
    }
}

impl WorkflowConfig {
    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn initiation_budget(&self) -> Duration {
        Duration::from_secs(self.initiation_budget_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub flush_interval_secs: u64,
    /// Sliding window for throughput and success rate.
    pub window_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 60,
            window_secs: 300,
        }
    }
}

impl MetricsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Jsonl {
        path: String,
    },
}

impl OrchestratorConfig {
    /// Loads `QUALFLOW_CONFIG` or `qualflow.toml` from the working directory.
    /// Uses defaults if the file does not exist.
    pub fn load() -> Result<Self> {
        let path = std::env::var("QUALFLOW_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<OrchestratorConfig>(&contents)?
        } else {
            Self::default()
        };

        if let Ok(level) = std::env::var("QUALFLOW_LOG") {
            if !level.is_empty() {
                config.log_level = LogLevel(level);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let scaler = &self.autoscaler;
        if scaler.min_instances == 0 {
            return Err(invalid("autoscaler.min_instances must be at least 1"));
        }
        if scaler.min_instances > scaler.max_instances {
            return Err(invalid(format!(
                "autoscaler.min_instances ({}) exceeds max_instances ({})",
                scaler.min_instances, scaler.max_instances
            )));
        }
        if scaler.scale_down_threshold >= scaler.scale_up_threshold {
            return Err(invalid("autoscaler.scale_down_threshold must be below scale_up_threshold"));
        }
        if !(0.0..=100.0).contains(&scaler.scale_up_threshold) {
            return Err(invalid("autoscaler.scale_up_threshold must be a percentage"));
        }
        if self.circuit_breaker.error_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(invalid("circuit_breaker thresholds must be positive"));
        }
        if self.health.failover_threshold == 0 || self.health.recovery_success_threshold == 0 {
            return Err(invalid("health thresholds must be positive"));
        }
        if self.scheduler.max_concurrent_workflows == 0 {
            return Err(invalid("scheduler.max_concurrent_workflows must be positive"));
        }
        let ratio = self.workflow.validation_ratio;
        if ratio <= 0.0 || ratio > 1.0 {
            return Err(invalid("workflow.validation_ratio must be in (0, 1]"));
        }
        for spec in &self.workflow.rules {
            spec.compile()?;
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> OrchestratorError {
    OrchestratorError::Config(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.log_level.0, "info");
        assert_eq!(config.circuit_breaker.error_threshold, 5);
        assert_eq!(config.circuit_breaker.success_threshold, 3);
        assert_eq!(config.load_balancer.decision_budget_ms, 50);
        assert_eq!(config.autoscaler.scale_up_threshold, 75.0);
        assert_eq!(config.workflow.validation_ratio, 0.9);
        assert_eq!(config.workflow.initiation_budget(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            log_level = "debug"

            [scheduler]
            algorithm = "fair_share"
            starvation_ticks = 2

            [load_balancer]
            algorithm = "least_connections"

            [autoscaler]
            min_instances = 1
            max_instances = 4

            [store]
            kind = "jsonl"
            path = "/var/lib/qualflow"
        "#;
        let config: OrchestratorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_level.0, "debug");
        assert_eq!(config.scheduler.algorithm, SchedulingAlgorithm::FairShare);
        assert_eq!(config.scheduler.starvation_ticks, 2);
        assert_eq!(config.scheduler.tier_limits.critical, 16);
        assert_eq!(config.load_balancer.algorithm, BalancingAlgorithm::LeastConnections);
        assert_eq!(config.autoscaler.max_instances, 4);
        assert_eq!(config.autoscaler.scale_down_threshold, 25.0);
        assert!(matches!(config.store, StoreConfig::Jsonl { ref path } if path == "/var/lib/qualflow"));
    }

    #[test]
    fn rules_parse_from_toml() {
        let toml_str = r#"
            [[workflow.rules]]
            name = "big-docs"
            entity_types = ["document"]
            when = ["initial_score.lt.0.5"]
            action = { raise_target = 0.05 }
        "#;
        let config: OrchestratorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workflow.rules.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_instance_bounds() {
        let mut config = OrchestratorConfig::default();
        config.autoscaler.min_instances = 5;
        config.autoscaler.max_instances = 3;
        assert!(matches!(config.validate(), Err(OrchestratorError::Config(_))));
    }

    #[test]
    fn validate_rejects_inverted_thresholds() {
        let mut config = OrchestratorConfig::default();
        config.autoscaler.scale_down_threshold = 80.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_rule() {
        let toml_str = r#"
            [[workflow.rules]]
            name = "broken"
            when = ["initial_score.between.0.5"]
            action = { raise_target = 0.05 }
        "#;
        let config: OrchestratorConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load_from(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.scheduler.max_concurrent_workflows, 32);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qualflow.toml");
        std::fs::write(&path, "[health]\nfailover_threshold = 7\n").unwrap();
        let config = OrchestratorConfig::load_from(&path).unwrap();
        assert_eq!(config.health.failover_threshold, 7);
        assert_eq!(config.health.degraded_latency(), Duration::from_millis(1600));
    }
}
