//! importq CLI: run workflows and inspect their queues.

use clap::{Parser, Subcommand};
use importq::clock::SystemClock;
use importq::config::{Config, WorkflowConfig, WorkflowRegistry};
use importq::db::Db;
use importq::engine::{Collaborators, Phase, Pipeline, Scheduler};
use importq::model::EntryId;
use importq::store::QueueStore;
use importq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "importq", about = "Durable staging queue for batch record imports")]
struct Cli {
    /// Directory containing workflow TOML configs (overrides IMPORTQ_WORKFLOWS)
    #[arg(long, global = true)]
    workflows: Option<PathBuf>,
    /// Use a throwaway in-process queue instead of Postgres
    #[arg(long, global = true)]
    in_memory: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every workflow on its tick interval until interrupted
    Serve,
    /// Run a single tick of one workflow
    Tick {
        workflow: String,
    },
    /// Queue entry operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Quarantine operations
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List entries of a workflow's queue
    List {
        workflow: String,
        /// Show claimed entries instead of unclaimed ones
        #[arg(long)]
        claimed: bool,
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum QuarantineAction {
    /// List quarantined entries
    List {
        workflow: String,
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Remove quarantined entries without reporting them
    Clear {
        workflow: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Put a quarantined entry back on the queue
    Requeue {
        workflow: String,
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let workflows_dir = cli.workflows.unwrap_or_else(|| config.workflows_dir.clone());
    let registry = WorkflowRegistry::load_from_dir(&workflows_dir)?;

    match cli.command {
        Command::Serve => {
            let _guard = telemetry(&config)?;
            let store = open_store(&config, cli.in_memory).await?;
            cmd_serve(&registry, store).await
        }
        Command::Tick { workflow } => {
            let _guard = telemetry(&config)?;
            let store = open_store(&config, cli.in_memory).await?;
            cmd_tick(workflow_config(&registry, &workflow)?, store).await
        }
        Command::Queue {
            action:
                QueueAction::List {
                    workflow,
                    claimed,
                    limit,
                },
        } => {
            let store = open_store(&config, cli.in_memory).await?;
            cmd_queue_list(workflow_config(&registry, &workflow)?, &store, claimed, limit).await
        }
        Command::Quarantine { action } => {
            let store = open_store(&config, cli.in_memory).await?;
            match action {
                QuarantineAction::List { workflow, limit } => {
                    cmd_quarantine_list(workflow_config(&registry, &workflow)?, &store, limit).await
                }
                QuarantineAction::Clear { workflow, ids } => {
                    cmd_quarantine_clear(workflow_config(&registry, &workflow)?, &store, ids).await
                }
                QuarantineAction::Requeue { workflow, id } => {
                    cmd_quarantine_requeue(workflow_config(&registry, &workflow)?, &store, id)
                        .await
                }
            }
        }
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    let guard = init_telemetry(TelemetryConfig::from_config(config))?;
    tracing::debug!(exporting = guard.is_exporting(), "telemetry initialized");
    Ok(guard)
}

async fn open_store(config: &Config, in_memory: bool) -> anyhow::Result<QueueStore> {
    if in_memory {
        return Ok(QueueStore::in_memory());
    }
    let url = config.require_database_url()?;
    let db = Db::connect(url.expose_secret()).await?;
    db.migrate().await?;
    Ok(QueueStore::new(Arc::new(db), Arc::new(SystemClock)))
}

fn workflow_config<'a>(
    registry: &'a WorkflowRegistry,
    name: &str,
) -> anyhow::Result<&'a WorkflowConfig> {
    registry
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("unknown workflow '{name}'"))
}

async fn cmd_serve(registry: &WorkflowRegistry, store: QueueStore) -> anyhow::Result<()> {
    if registry.is_empty() {
        anyhow::bail!("no workflows configured");
    }

    let scheduler = Scheduler::new();
    for config in registry.iter() {
        let collaborators = Collaborators::from_config(config, Arc::clone(store.clock()));
        let pipeline = Pipeline::new(config, store.clone(), collaborators);
        tracing::info!(
            workflow = %config.name,
            queue = %config.queue_name(),
            interval = %humantime::format_duration(config.tick_interval),
            "workflow registered"
        );
        scheduler.add(pipeline, config.tick_interval);
    }

    let handle = scheduler.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    scheduler.run().await;
    Ok(())
}

async fn cmd_tick(config: &WorkflowConfig, store: QueueStore) -> anyhow::Result<()> {
    let collaborators = Collaborators::from_config(config, Arc::clone(store.clock()));
    let pipeline = Pipeline::new(config, store, collaborators);
    let report = pipeline.tick().await?;

    match report.stage {
        Phase::Ran(s) => {
            println!(
                "stage:   {} batch(es), {} processed, {} bad, {} record(s) staged, {} skipped (claimed)",
                s.batches,
                s.processed,
                s.bad,
                s.records,
                s.skipped_claimed.len()
            );
            for skipped in &s.skipped_claimed {
                println!("         not restaged: {} from {}", skipped.id, skipped.batch);
            }
        }
        Phase::Skipped => println!("stage:   skipped"),
    }
    match report.process {
        Phase::Ran(p) => println!(
            "process: {} claimed, {} completed, {} quarantined",
            p.claimed, p.completed, p.quarantined
        ),
        Phase::Skipped => println!("process: skipped"),
    }
    match report.alert {
        Phase::Ran(a) => println!("alert:   {} reported", a.reported),
        Phase::Skipped => println!("alert:   skipped"),
    }
    match report.health.stats {
        Some(stats) => println!(
            "health:  {} claimed, oldest {}, backed up: {}",
            stats.len,
            humantime::format_duration(std::time::Duration::from_secs(stats.oldest.as_secs())),
            report.health.backed_up
        ),
        None => println!("health:  no claimed entries"),
    }
    Ok(())
}

async fn cmd_queue_list(
    config: &WorkflowConfig,
    store: &QueueStore,
    claimed: bool,
    limit: usize,
) -> anyhow::Result<()> {
    let queue = config.queue_name();
    let entries = if claimed {
        store.list_claimed(&queue, limit).await?
    } else {
        store.list_unclaimed(&queue, limit).await?
    };

    if entries.is_empty() {
        println!("No entries in {queue}.");
        return Ok(());
    }

    println!("{:<24}  {:<30}  CLAIMED AT", "ID", "SOURCE BATCH");
    println!("{}", "-".repeat(80));
    for entry in &entries {
        println!(
            "{:<24}  {:<30}  {}",
            entry.id,
            entry.origin().as_deref().unwrap_or("-"),
            entry
                .claimed_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!("\n{} entry(ies)", entries.len());
    Ok(())
}

async fn cmd_quarantine_list(
    config: &WorkflowConfig,
    store: &QueueStore,
    limit: usize,
) -> anyhow::Result<()> {
    let queue = config.queue_name();
    let entries = store.list_quarantined(&queue, limit).await?;

    if entries.is_empty() {
        println!("No quarantined entries in {queue}.");
        return Ok(());
    }

    println!("{:<24}  {:<30}  REASON", "ID", "SOURCE BATCH");
    println!("{}", "-".repeat(100));
    for entry in &entries {
        println!(
            "{:<24}  {:<30}  {}",
            entry.id,
            entry.origin.as_deref().unwrap_or("-"),
            entry.reason
        );
    }
    println!("\n{} entry(ies)", entries.len());
    Ok(())
}

async fn cmd_quarantine_clear(
    config: &WorkflowConfig,
    store: &QueueStore,
    ids: Vec<String>,
) -> anyhow::Result<()> {
    let ids: Vec<EntryId> = ids.into_iter().map(EntryId::new).collect();
    store.delete_quarantined(&config.queue_name(), &ids).await?;
    println!("Cleared {} entry(ies).", ids.len());
    Ok(())
}

async fn cmd_quarantine_requeue(
    config: &WorkflowConfig,
    store: &QueueStore,
    id: String,
) -> anyhow::Result<()> {
    let id = EntryId::new(id);
    if store.requeue_quarantined(&config.queue_name(), &id).await? {
        println!("Requeued {id}.");
    } else {
        anyhow::bail!("{id} is not quarantined or is currently claimed");
    }
    Ok(())
}
