//! Command line interface for qualflow, built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (run, trigger, health,
//! config) and the global flags (--config, --verbose, --json-logs).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::workflow::{EntityType, Priority};

/// qualflow: autonomous orchestration of document quality remediation.
#[derive(Debug, Parser)]
#[command(name = "qualflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file. Defaults to `QUALFLOW_CONFIG` or `qualflow.toml`.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Critical,
    High,
    Medium,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Critical => Priority::Critical,
            PriorityArg::High => Priority::High,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::Low => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EntityTypeArg {
    Document,
    Chunk,
    System,
}

impl From<EntityTypeArg> for EntityType {
    fn from(arg: EntityTypeArg) -> Self {
        match arg {
            EntityTypeArg::Document => EntityType::Document,
            EntityTypeArg::Chunk => EntityType::Chunk,
            EntityTypeArg::System => EntityType::System,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the control loops against a simulated fleet and submits demo workflows.
    Run {
        /// How long to keep the loops running.
        #[arg(long, default_value_t = 30)]
        duration_secs: u64,

        /// Number of demo workflows to submit.
        #[arg(long, default_value_t = 8)]
        jobs: usize,
    },

    /// Runs a single workflow to completion and prints its audit record.
    Trigger {
        /// Entity to remediate.
        entity_id: String,

        #[arg(long, value_enum, default_value_t = EntityTypeArg::Document)]
        entity_type: EntityTypeArg,

        #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
        priority: PriorityArg,

        /// Entities remediated first; this workflow depends on each of them.
        #[arg(long)]
        after: Vec<String>,
    },

    /// Prints a system health report for a freshly seeded simulated fleet.
    Health,

    /// Prints the effective configuration as TOML.
    Config,
}
