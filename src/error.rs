use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No capacity or dependency unmet. The job is deferred, not failed.
    #[error("Admission deferred: {0}")]
    Admission(String),

    /// No eligible instance for a request. Callers re-submit.
    #[error("Routing rejected: {0}")]
    Routing(String),

    #[error("Stage {stage} failed: {message}")]
    Stage { stage: String, message: String },

    /// Ledger over-allocation or double release. Admissions halt until reconciled.
    #[error("Resource invariant violated: {0}")]
    ResourceInvariant(String),

    /// An open breaker was about to receive traffic. Always a selection bug.
    #[error("Circuit open for instance {0}")]
    CircuitOpen(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn stage(stage: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// Whether this error must stop new admissions.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ResourceInvariant(_) | Self::CircuitOpen(_))
    }
}

/// Classifies a job failure for the reason recorded on the job.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Quality outcome failure (validation bar missed, no improvement possible)
    Business(String),
    /// Infrastructure failure (provider unreachable, timeout, cancelled)
    System(String),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Business(msg) => write!(f, "Business failure: {msg}"),
            FailureKind::System(msg) => write!(f, "System failure: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_display() {
        let biz = FailureKind::Business("validation bar missed".into());
        assert_eq!(biz.to_string(), "Business failure: validation bar missed");

        let sys = FailureKind::System("provider timeout".into());
        assert_eq!(sys.to_string(), "System failure: provider timeout");
    }

    #[test]
    fn fatal_classification() {
        assert!(OrchestratorError::ResourceInvariant("double release".into()).is_fatal());
        assert!(OrchestratorError::CircuitOpen("w-1".into()).is_fatal());
        assert!(!OrchestratorError::Admission("no capacity".into()).is_fatal());
        assert!(!OrchestratorError::Routing("no healthy instances".into()).is_fatal());
    }

    #[test]
    fn stage_error_display() {
        let err = OrchestratorError::stage("ASSESSMENT", "provider unreachable");
        assert_eq!(err.to_string(), "Stage ASSESSMENT failed: provider unreachable");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OrchestratorError>();
    }
}
