//! Terminal output: spinners and colored summaries.
//!
//! Uses `indicatif` for the progress spinner and `console` for colors.
//! [`JobProgress`] follows one workflow through its stages.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::metrics::OrchestrationMetrics;
use crate::orchestrator::{HealthLevel, SystemHealth};
use crate::workflow::{JobRecord, JobStatus, WorkflowJob};

/// Spinner that tracks a workflow's stage and progress.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    pub fn start(entity_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} [{elapsed}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("queued: {entity_id}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn update(&self, job: &WorkflowJob) {
        self.pb
            .set_message(format!("{} {:>3}% {}", job.stage, job.progress, job.entity_id));
    }

    pub fn retry(&self, attempt: u32, max: u32, stage: impl std::fmt::Display) {
        self.pb.println(format!(
            "  {} Retry {attempt}/{max} in {stage}",
            self.yellow.apply_to("↻")
        ));
    }

    pub fn finish(&self, job: &WorkflowJob) {
        self.pb.finish_and_clear();
        match job.status {
            JobStatus::Completed => println!(
                "  {} Workflow completed: score {:.2} -> {:.2}",
                self.green.apply_to("✓"),
                job.context.initial_score.unwrap_or_default(),
                job.context.final_score.unwrap_or_default(),
            ),
            JobStatus::RolledBack => println!(
                "  {} Workflow rolled back: {}",
                self.yellow.apply_to("↺"),
                reason(job)
            ),
            _ => println!("  {} Workflow {:?}: {}", self.red.apply_to("✗"), job.status, reason(job)),
        }
    }

    /// Prints the audit record as pretty JSON.
    pub fn print_record(&self, record: &JobRecord) {
        let style = match record.status {
            JobStatus::Completed => &self.green,
            JobStatus::Failed => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", style.apply_to("─── Job Record ───"));
        println!("{}", serde_json::to_string_pretty(record).unwrap_or_default());
    }
}

fn reason(job: &WorkflowJob) -> String {
    job.failure
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "no reason recorded".into())
}

pub fn print_health(health: &SystemHealth) {
    let style = level_style(health.overall);
    println!("{} {:?}", style.apply_to("System health:"), health.overall);
    for (name, component) in &health.components {
        println!(
            "  {:<10} {} {}",
            name,
            level_style(component.status).apply_to(format!("{:?}", component.status)),
            component.detail
        );
    }
    for alert in &health.active_alerts {
        println!("  ! [{:?}] {}: {}", alert.severity, alert.component, alert.message);
    }
    for instance in &health.instances {
        println!(
            "  {:<16} {:<9} circuit={} cpu={:.0}% mem={:.0}% active={}",
            instance.id,
            instance.status,
            instance.circuit,
            instance.load.cpu,
            instance.load.memory,
            instance.load.active_connections
        );
    }
}

pub fn print_metrics(metrics: &OrchestrationMetrics) {
    let bold = Style::new().bold();
    println!("{}", bold.apply_to("─── Orchestration Metrics ───"));
    println!("{}", serde_json::to_string_pretty(metrics).unwrap_or_default());
}

fn level_style(level: HealthLevel) -> Style {
    match level {
        HealthLevel::Healthy => Style::new().green(),
        HealthLevel::Degraded => Style::new().yellow(),
        HealthLevel::Critical => Style::new().red().bold(),
    }
}
