//! Orchestration event fan-out.
//!
//! Every state change worth telling the outside world about goes through the
//! [`EventBus`] as an [`EventEnvelope`]. Sending never blocks and never fails
//! when nobody is listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::cluster::{BalancingAlgorithm, CircuitState, InstanceStatus, ScalingAction};
use crate::error::FailureKind;
use crate::workflow::{EntityType, Priority, TriggerSource};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OrchestrationEvent {
    WorkflowTriggered {
        job_id: String,
        entity_id: String,
        entity_type: EntityType,
        priority: Priority,
        triggered_by: TriggerSource,
    },
    WorkflowCompleted {
        job_id: String,
        initial_score: Option<f64>,
        final_score: Option<f64>,
        duration_ms: i64,
    },
    WorkflowFailed {
        job_id: String,
        failure: Option<FailureKind>,
    },
    WorkflowRolledBack {
        job_id: String,
        reverted: usize,
        failure: Option<FailureKind>,
    },
    WorkflowCancelled {
        job_id: String,
    },
    ScalingCompleted {
        action: ScalingAction,
        instances_before: usize,
        instances_after: usize,
        instance_id: Option<String>,
    },
    RequestRouted {
        request_id: String,
        instance_id: Option<String>,
        algorithm: BalancingAlgorithm,
    },
    InstanceStatusChanged {
        instance_id: String,
        from: InstanceStatus,
        to: InstanceStatus,
    },
    CircuitStateChanged {
        instance_id: String,
        from: CircuitState,
        to: CircuitState,
    },
}

impl OrchestrationEvent {
    /// Wire name of the event, as used by subscribers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowTriggered { .. } => "workflow-triggered",
            Self::WorkflowCompleted { .. } => "workflow-completed",
            Self::WorkflowFailed { .. } => "workflow-failed",
            Self::WorkflowRolledBack { .. } => "workflow-rolled-back",
            Self::WorkflowCancelled { .. } => "workflow-cancelled",
            Self::ScalingCompleted { .. } => "scaling-completed",
            Self::RequestRouted { .. } => "request-routed",
            Self::InstanceStatusChanged { .. } => "instance-status-changed",
            Self::CircuitStateChanged { .. } => "circuit-state-changed",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            Self::WorkflowFailed { .. } => EventSeverity::Error,
            Self::WorkflowRolledBack { .. } => EventSeverity::Warning,
            Self::InstanceStatusChanged { to, .. } if *to == InstanceStatus::Unhealthy => {
                EventSeverity::Warning
            }
            Self::CircuitStateChanged { to, .. } if *to == CircuitState::Open => EventSeverity::Warning,
            Self::RequestRouted { instance_id: None, .. } => EventSeverity::Warning,
            _ => EventSeverity::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    pub event: OrchestrationEvent,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Wraps and broadcasts an event. Returns the envelope id.
    pub fn emit(&self, event: OrchestrationEvent) -> Uuid {
        let envelope = EventEnvelope {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity: event.severity(),
            event,
        };
        let id = envelope.id;
        trace!(event = envelope.event.name(), %id, "Event emitted");
        // No subscribers is fine.
        let _ = self.tx.send(envelope);
        id
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
