use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde::Serialize;
use tokio::{select, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use trellis_core::app::{
    DriverOptions, HandlerError, RunStatus, SchedulerBuilder, TaskContext, TaskHandler,
};
use trellis_core::config::Settings;
use trellis_core::impls::{CronScheduleCalculator, MemoryStore};
use trellis_core::ports::{StorePorts, SystemClock, UlidGenerator};

#[derive(Debug, Parser)]
#[command(name = "trellis", about = "Cron-driven DAG scheduler (in-memory store)")]
struct Args {
    /// Settings file (scheduler options and job catalog).
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    run_for: Option<u64>,

    /// Validate the settings and catalog, then exit.
    #[arg(long)]
    check: bool,
}

/// Logs the task and succeeds.
struct Echo;

#[async_trait]
impl TaskHandler for Echo {
    async fn handle(&self, ctx: &TaskContext) -> Result<(), HandlerError> {
        info!(task = %ctx.task.name, attempt = ctx.attempt(), "echo");
        Ok(())
    }
}

/// Sleeps, then succeeds.
struct Sleep(Duration);

#[async_trait]
impl TaskHandler for Sleep {
    async fn handle(&self, ctx: &TaskContext) -> Result<(), HandlerError> {
        info!(task = %ctx.task.name, sleep = ?self.0, "sleeping");
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

/// Fails the first `n` times it is called.
struct Flaky {
    remaining_failures: AtomicU32,
}

impl Flaky {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl TaskHandler for Flaky {
    async fn handle(&self, ctx: &TaskContext) -> Result<(), HandlerError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::failed(format!(
                "intentional failure (left={left}, attempt={})",
                ctx.attempt()
            )));
        }
        info!(task = %ctx.task.name, attempt = ctx.attempt(), "flaky task succeeded");
        Ok(())
    }
}

#[derive(Serialize)]
struct JobReport {
    job: String,
    runs: Vec<RunStatus>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let config = &settings.scheduler;

    let store = Arc::new(MemoryStore::with_options(
        Arc::new(UlidGenerator::new(SystemClock)),
        config.lock_timeout(),
    ));
    store.provision_worker_slots(config.worker_slots);

    let scheduler = SchedulerBuilder::new(StorePorts::from_store(store))
        .cron(Arc::new(CronScheduleCalculator::new()))
        .with_config(config)
        .handler("echo", Arc::new(Echo))?
        .handler("sleep", Arc::new(Sleep(Duration::from_millis(500))))?
        .handler("flaky", Arc::new(Flaky::new(2)))?
        .expect_catalog(&settings.catalog)
        .build()?;

    if args.check {
        settings
            .catalog
            .validate(&CronScheduleCalculator::new())
            .context("invalid catalog")?;
        info!(jobs = settings.catalog.jobs.len(), "configuration is valid");
        return Ok(());
    }

    let jobs = scheduler.register_catalog(&settings.catalog).await?;
    let instance = format!("trellis-{}", ulid::Ulid::new());
    let group = scheduler.spawn(DriverOptions::from_config(config, instance));
    info!(
        jobs = jobs.len(),
        workers = config.worker_slots,
        tick_interval_ms = config.tick_interval_ms,
        "scheduler started - waiting for shutdown signal"
    );

    wait_for_shutdown(args.run_for.map(Duration::from_secs)).await?;
    info!("stopping loops");
    let summaries = group.shutdown_and_join().await;
    info!(
        completed = summaries.iter().map(|s| s.completed).sum::<usize>(),
        failed = summaries.iter().map(|s| s.failed).sum::<usize>(),
        "loops stopped"
    );

    let mut reports = Vec::with_capacity(jobs.len());
    for job in jobs {
        reports.push(JobReport {
            runs: scheduler.job_status(job.id).await?,
            job: job.name,
        });
    }
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

async fn wait_for_shutdown(run_for: Option<Duration>) -> Result<()> {
    let deadline = async {
        match run_for {
            Some(run_for) => tokio::time::sleep(run_for).await,
            None => std::future::pending::<()>().await,
        }
    };
    select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Ctrl+C received");
        }
        _ = deadline => {
            info!("run-for deadline reached");
        }
    }
    Ok(())
}
