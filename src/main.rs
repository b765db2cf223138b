//! dagsched - A small DAG workflow scheduler.
//!
//! Usage:
//!   dagsched run [--config <file>]    Run the scheduler until Ctrl+C
//!   dagsched list [--config <file>]   List DAGs with their hashes

use chrono::{DurationRound, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use dagsched::config::ConfiguredTask;
use dagsched::{
    Dag, DagBuilder, DagRun, FixedSchedule, InMemoryStorage, Node, RunQueue, Scheduler,
    SchedulerConfig, Storage, StorageConfig, build_dags, load_config,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// dagsched - A small DAG workflow scheduler
#[derive(Parser)]
#[command(name = "dagsched")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler
    Run {
        /// Path to the YAML configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// List DAGs with schedule, validity and hashes
    List {
        /// Path to the YAML configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Run { config } | Commands::List { config } => config.clone(),
    };
    let config = match config_path {
        Some(path) => load_config(path)?,
        None => SchedulerConfig::default(),
    };

    // RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let dags = if config.dags.is_empty() {
        info!("No DAGs configured, using the sample DAG");
        vec![sample_dag()?]
    } else {
        build_dags(&config)?
    };

    match cli.command {
        Commands::Run { .. } => run(config, dags).await?,
        Commands::List { .. } => list(&dags)?,
    }

    Ok(())
}

/// Hourly `hello -> world` DAG starting at the current hour.
fn sample_dag() -> Result<Dag, Box<dyn std::error::Error>> {
    let start = Utc::now().duration_trunc(TimeDelta::hours(1))?;
    let world = Node::new(ConfiguredTask::new("world", Some("World".into())));
    let hello = Node::with_children(ConfiguredTask::new("hello", Some("Hello".into())), vec![world]);

    Ok(DagBuilder::new("hello_dag")
        .schedule(FixedSchedule::new(start, TimeDelta::hours(1))?)
        .root(hello)
        .build())
}

async fn run(config: SchedulerConfig, dags: Vec<Dag>) -> Result<(), Box<dyn std::error::Error>> {
    match &config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory storage");
            run_with_storage(InMemoryStorage::new(), &config, dags).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!(path = %path, "Using SQLite storage");
            let storage = dagsched::SqliteStorage::new(path).await?;
            run_with_storage(storage, &config, dags).await
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("SQLite storage requires the `sqlite` feature".into())
        }
    }
}

async fn run_with_storage<S: Storage + 'static>(
    storage: S,
    config: &SchedulerConfig,
    dags: Vec<Dag>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut scheduler = Scheduler::new(storage)
        .with_tick_interval(config.tick_interval())
        .with_queue_capacity(config.queue_capacity);

    info!("Loaded {} DAG(s):", dags.len());
    for dag in dags {
        let schedule = dag
            .schedule()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "manual".into());
        info!(
            dag_id = %dag.id(),
            schedule = %schedule,
            tasks = dag.flatten().len(),
            "Registering DAG"
        );
        scheduler.register(dag)?;
    }

    let queue = scheduler.queue();
    info!(
        tick_interval_secs = config.tick_interval_secs,
        "Starting scheduler, press Ctrl+C to stop"
    );
    let (handle, scheduler_task) = scheduler.start().await;
    let drain_task = tokio::spawn(drain_queue(queue, config.tick_interval()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            warn!("Scheduler stopped unexpectedly");
        }
    }

    drain_task.abort();
    Ok(())
}

/// Pop queued runs and log them. Stands in for a worker pool.
async fn drain_queue(queue: Arc<RunQueue<DagRun>>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        while let Ok(run) = queue.pop() {
            info!(dag_id = %run.dag_id, run = %run, "Dequeued DAG run");
        }
    }
}

fn list(dags: &[Dag]) -> Result<(), Box<dyn std::error::Error>> {
    for dag in dags {
        print!("{}", dag);
        match dag.validate() {
            Ok(()) => println!("  Valid: yes"),
            Err(e) => println!("  Valid: no ({})", e),
        }
        println!("  Meta hash: {}", dag.hash_dag_meta()?);
        println!("  Tasks hash: {}", dag.hash_tasks());
        println!();
    }
    Ok(())
}
