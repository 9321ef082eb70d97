use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use mpw_storage::{
    AlertStore, MemoryStore, MetricsStore, PgStore, ScheduleStore, SharedStore, SyncQueueStore,
};
use mpw_sync::{
    AlertEngine, CachingGeocoder, DeltaConfig, DeltaEngine, Exporter, NullGeocoder,
    PatternAnalyzer, Runner, Scheduler, SourceRegistry, StalenessMonitor, SyncConfig, SyncPipeline,
};
use mpw_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "mpw")]
#[command(about = "Missing Persons Watch sync engine")]
struct Cli {
    /// Use an in-memory store instead of Postgres (dry runs).
    #[arg(long, global = true)]
    memory: bool,

    /// Debug logging (RUST_LOG still wins when set).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect from every enabled source, or one source.
    Sync {
        #[arg(long)]
        source: Option<String>,
    },
    /// Schedule recommendations.
    Schedules {
        #[command(subcommand)]
        command: SchedulesCommand,
    },
    /// Sync operation queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    /// Print the derived metrics and recommendation for one source.
    Analyze { source: String },
    /// Data freshness and system health.
    Monitor {
        #[command(subcommand)]
        command: MonitorCommand,
    },
    /// List active alerts.
    Alerts,
    /// Write the CSV roster and parquet snapshots.
    Export,
    /// Serve the dashboard and JSON API.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8000")]
        addr: String,
    },
    /// Run the full scheduling daemon until interrupted.
    Daemon,
}

#[derive(Debug, Subcommand)]
enum SchedulesCommand {
    /// Recompute recommendations for every enabled source.
    Update,
    /// Show the latest recommendation per source.
    Show,
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// Apply one batch of pending operations.
    Process,
    /// Show the pending count.
    Status,
}

#[derive(Debug, Subcommand)]
enum MonitorCommand {
    /// Check artifact freshness and print the report.
    Check,
    /// Run a full monitoring cycle: alerts, health snapshot, retention.
    Summary,
}

async fn open_store(config: &SyncConfig, memory: bool) -> Result<SharedStore> {
    if memory {
        return Ok(MemoryStore::shared());
    }
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

async fn build_pipeline(
    config: &SyncConfig,
    store: SharedStore,
    alerts: Arc<AlertEngine>,
) -> Result<Arc<SyncPipeline>> {
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let pipeline = SyncPipeline::new(config.clone(), registry, store)?
        .with_alerts(alerts)
        .with_geocoder(Arc::new(CachingGeocoder::new(NullGeocoder)));
    Ok(Arc::new(pipeline))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
    let config = SyncConfig::from_env();
    let store = open_store(&config, cli.memory).await?;
    let alerts = Arc::new(AlertEngine::new(store.clone(), &config));

    match cli.command {
        Commands::Sync { source } => {
            let pipeline = build_pipeline(&config, store, alerts).await?;
            let summaries = match source {
                Some(source_id) => vec![pipeline.run_one(&source_id).await?],
                None => pipeline
                    .run_all()
                    .await
                    .into_iter()
                    .collect::<Result<Vec<_>>>()?,
            };
            for summary in summaries {
                println!(
                    "{}: collected={} invalid={} duplicates={} inserted={} updated={} skipped={}",
                    summary.source_id,
                    summary.collected,
                    summary.invalid,
                    summary.duplicates_dropped,
                    summary.queue.inserted,
                    summary.queue.updated,
                    summary.skipped,
                );
            }
        }
        Commands::Schedules { command } => match command {
            SchedulesCommand::Update => {
                let registry = SourceRegistry::load(&config.workspace_root).await?;
                let source_ids: Vec<String> = registry
                    .enabled()
                    .map(|s| s.source_id.clone())
                    .collect();
                let scheduler = Scheduler::from_config(&config);
                let recs = scheduler
                    .update_all(store.as_ref(), &source_ids, Utc::now())
                    .await?;
                for rec in recs {
                    println!(
                        "{}: {} every {}m (confidence {:.2}) - {}",
                        rec.source_id,
                        rec.tier.as_str(),
                        rec.interval_minutes,
                        rec.confidence,
                        rec.reason,
                    );
                }
            }
            SchedulesCommand::Show => {
                for rec in store.latest_recommendations().await? {
                    println!(
                        "{}: {} every {}m, next at {} - {}",
                        rec.source_id,
                        rec.tier.as_str(),
                        rec.interval_minutes,
                        rec.next_run_at.to_rfc3339(),
                        rec.reason,
                    );
                }
            }
        },
        Commands::Queue { command } => match command {
            QueueCommand::Process => {
                let delta = DeltaEngine::new(DeltaConfig {
                    priority_threshold: config.queue_priority_threshold,
                    min_confidence: config.queue_min_confidence,
                    batch_limit: config.queue_batch_limit,
                });
                let report = delta.process_queue(store.as_ref()).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            QueueCommand::Status => {
                println!("pending operations: {}", store.pending_count().await?);
            }
        },
        Commands::Analyze { source } => {
            let analyzer = PatternAnalyzer {
                window_hours: config.learning_window_hours,
                min_samples: config.min_samples,
            };
            let now = Utc::now();
            let since = now - chrono::Duration::hours(config.learning_window_hours);
            let samples = store.samples_since(&source, since).await?;
            let metrics = analyzer.analyze(&source, &samples, now);
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            let scheduler = Scheduler::from_config(&config);
            let rec = if samples.len() >= config.min_samples {
                scheduler.recommend(&metrics, now)
            } else {
                scheduler.fallback(&source, now)
            };
            println!("{}", serde_json::to_string_pretty(&rec)?);
        }
        Commands::Monitor { command } => {
            let monitor = StalenessMonitor::new(store.clone(), alerts, &config);
            match command {
                MonitorCommand::Check => {
                    let report = monitor.check(Utc::now()).await?;
                    println!("overall: {}", report.overall.as_str());
                    for artifact in &report.artifacts {
                        let age = artifact
                            .age_hours
                            .map(|a| format!("{a:.1}h"))
                            .unwrap_or_else(|| "missing".into());
                        println!("  {}: {} ({})", artifact.name, artifact.level.as_str(), age);
                    }
                }
                MonitorCommand::Summary => {
                    let report = monitor.run_cycle(Utc::now()).await?;
                    monitor.run_retention(&config, Utc::now()).await?;
                    println!("overall: {}", report.overall.as_str());
                    if let Some(snapshot) = store.latest_health_snapshot().await? {
                        println!("health score: {:.0}", snapshot.overall_health_score);
                        println!("pending operations: {}", snapshot.pending_operations);
                        println!("data freshness: {:.1}h", snapshot.data_freshness_hours);
                    }
                }
            }
        }
        Commands::Alerts => {
            for alert in store.active_alerts().await? {
                println!(
                    "[{}] {} {}: {}",
                    alert.severity.as_str(),
                    alert.created_at.to_rfc3339(),
                    alert.title,
                    alert.message,
                );
            }
        }
        Commands::Export => {
            let registry = SourceRegistry::load(&config.workspace_root).await?;
            let exporter = Exporter::new(store, config);
            let summary = exporter.export_all(&registry).await?;
            println!(
                "exported {} cases; csv={} manifest={}",
                summary.cases, summary.csv_path, summary.parquet_manifest
            );
        }
        Commands::Serve { addr } => {
            let pipeline = build_pipeline(&config, store.clone(), alerts).await?;
            info!(%addr, "serving dashboard");
            mpw_web::serve(AppState::new(store).with_pipeline(pipeline), &addr).await?;
        }
        Commands::Daemon => {
            let pipeline = build_pipeline(&config, store.clone(), alerts.clone()).await?;
            let scheduler = Arc::new(Scheduler::from_config(&config));
            let monitor = Arc::new(StalenessMonitor::new(store, alerts, &config));
            Runner::new(config, pipeline, scheduler, monitor).run().await?;
        }
    }

    Ok(())
}
