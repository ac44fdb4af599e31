pub mod engine;
pub mod job;
pub mod rollback;
pub mod rules;
pub mod stage;

pub use engine::WorkflowEngine;
pub use job::{
    AppliedImprovement, EntityType, Improvement, JobRecord, JobStatus, Priority, RetryConfig,
    TriggerRequest, TriggerSource, WorkflowContext, WorkflowJob,
};
pub use rollback::{ExecutionSnapshot, RollbackEntry, RollbackPlan, RollbackTrigger};
pub use rules::{Planner, RuleAction, RuleSpec};
pub use stage::{Stage, StageMachine, StageOutcome, Transition};
