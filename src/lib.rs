//! qualflow: an autonomous orchestration engine for document quality
//! remediation workflows.
//!
//! Workflows move through a staged state machine ([`workflow`]) on worker
//! instances picked by a load balancer ([`cluster`]). A scheduler admits
//! them against a capacity [`ledger`], and the fleet is sized by an
//! autoscaler. [`orchestrator::Orchestrator`] wires everything together and
//! runs the control loops.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod scheduler;
pub mod store;
pub mod ui;
pub mod workflow;

pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
