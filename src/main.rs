use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::Rng;
use tracing::{info, warn};

use qualflow::cli::{Cli, Command};
use qualflow::cluster::SimulatedProbe;
use qualflow::config::OrchestratorConfig;
use qualflow::provider::SimulatedProvider;
use qualflow::ui::{self, JobProgress};
use qualflow::workflow::{EntityType, JobRecord, Priority, TriggerRequest, TriggerSource};
use qualflow::{Orchestrator, logging, store};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::load_from(path),
        None => OrchestratorConfig::load(),
    }
    .context("failed to load configuration")?;
    let level = if cli.verbose { "debug" } else { config.log_level.0.as_str() };
    logging::init(level, cli.json_logs);

    match cli.command {
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Command::Health => {
            let orchestrator = build(config).await?;
            orchestrator.health_tick().await?;
            ui::print_health(&orchestrator.get_system_health().await);
        }
        Command::Trigger {
            entity_id,
            entity_type,
            priority,
            after,
        } => {
            let orchestrator = build(config).await?;
            trigger(&orchestrator, entity_id, entity_type.into(), priority.into(), after).await?;
        }
        Command::Run { duration_secs, jobs } => {
            let orchestrator = build(config).await?;
            run(&orchestrator, Duration::from_secs(duration_secs), jobs).await?;
        }
    }
    Ok(())
}

/// Orchestrator over a simulated provider and fleet, seeded to `min_instances`.
async fn build(config: OrchestratorConfig) -> Result<Orchestrator> {
    let store = store::open(&config.store)
        .await
        .context("failed to open audit store")?;
    let provider = Arc::new(SimulatedProvider::new().with_latency(Duration::from_millis(150)));
    let probe = Arc::new(SimulatedProbe::new());
    let seed = config.autoscaler.min_instances;

    let orchestrator = Orchestrator::new(config, provider, probe, store)?;
    orchestrator.seed_fleet(seed).await?;
    Ok(orchestrator)
}

async fn trigger(
    orchestrator: &Orchestrator,
    entity_id: String,
    entity_type: EntityType,
    priority: Priority,
    after: Vec<String>,
) -> Result<()> {
    orchestrator.start().await;

    let mut dependencies = Vec::with_capacity(after.len());
    for parent in after {
        let id = orchestrator
            .trigger_workflow(TriggerRequest::new(parent, entity_type, priority))
            .await?;
        dependencies.push(id);
    }
    let request = TriggerRequest::new(entity_id.clone(), entity_type, priority).depends_on(dependencies);
    let job_id = orchestrator.trigger_workflow(request).await?;

    let progress = JobProgress::start(&entity_id);
    let mut rx = orchestrator.subscribe(&job_id)?;
    let mut retries = 0;
    loop {
        let job = rx.borrow_and_update().clone();
        if job.retry_count > retries {
            retries = job.retry_count;
            progress.retry(retries, job.retry_config.max_retries, job.stage);
        }
        progress.update(&job);
        if job.status.is_terminal() {
            progress.finish(&job);
            progress.print_record(&JobRecord::from_job(&job));
            break;
        }
        if rx.changed().await.is_err() {
            break;
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

async fn run(orchestrator: &Orchestrator, duration: Duration, jobs: usize) -> Result<()> {
    orchestrator.start().await;

    let requests: Vec<TriggerRequest> = {
        let mut rng = rand::thread_rng();
        (0..jobs)
            .map(|n| {
                let priority = Priority::ALL[rng.gen_range(0..Priority::ALL.len())];
                let entity_type = if n % 3 == 2 {
                    EntityType::Chunk
                } else {
                    EntityType::Document
                };
                TriggerRequest::new(format!("doc-{n}"), entity_type, priority)
                    .triggered_by(TriggerSource::Schedule)
            })
            .collect()
    };

    let mut ids = Vec::with_capacity(requests.len());
    for request in requests {
        ids.push(orchestrator.trigger_workflow(request).await?);
    }
    info!(count = ids.len(), "Demo workflows submitted");

    let all_done = futures::future::join_all(ids.iter().map(|id| orchestrator.wait_for(id)));
    tokio::select! {
        results = all_done => {
            let finished = results.iter().filter(|r| r.is_ok()).count();
            info!(finished, "All demo workflows reached a terminal status");
        }
        _ = tokio::time::sleep(duration) => {
            warn!(?duration, "Run duration elapsed with workflows still active");
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted");
        }
    }

    orchestrator.shutdown().await;
    ui::print_metrics(&orchestrator.get_orchestration_metrics().await);
    ui::print_health(&orchestrator.get_system_health().await);
    Ok(())
}
