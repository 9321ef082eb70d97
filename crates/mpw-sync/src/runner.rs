//! Long-running daemon loop: scheduled collection, cron jobs for the
//! fallback sweep and freshness checks, and staleness-triggered runs.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use mpw_core::StalenessLevel;

use crate::config::SyncConfig;
use crate::monitor::StalenessMonitor;
use crate::pipeline::SyncPipeline;
use crate::schedule::Scheduler;

/// Out-of-band run requests, raised when monitoring finds the data badly
/// stale and waiting for the next due slot would make it worse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRequest {
    Incremental,
    Full,
}

pub struct Runner {
    config: SyncConfig,
    pipeline: Arc<SyncPipeline>,
    scheduler: Arc<Scheduler>,
    monitor: Arc<StalenessMonitor>,
}

impl Runner {
    pub fn new(
        config: SyncConfig,
        pipeline: Arc<SyncPipeline>,
        scheduler: Arc<Scheduler>,
        monitor: Arc<StalenessMonitor>,
    ) -> Self {
        Self {
            config,
            pipeline,
            scheduler,
            monitor,
        }
    }

    /// Runs until ctrl-c. One tick loop drives due collections under the
    /// worker pool; cron jobs handle the fallback sweep and freshness checks.
    pub async fn run(self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<RunRequest>(8);
        let sched = self.build_cron(tx.clone()).await?;
        sched.start().await.context("starting cron scheduler")?;

        let workers = Arc::new(Semaphore::new(self.config.worker_pool_size.max(1)));
        let mut tick =
            tokio::time::interval(std::time::Duration::from_secs(self.config.collection_tick_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            tick_secs = self.config.collection_tick_secs,
            workers = self.config.worker_pool_size,
            "daemon started"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.collect_due(&workers).await;
                    self.refresh_schedules().await;
                }
                Some(request) = rx.recv() => {
                    info!(?request, "out-of-band run requested");
                    self.sweep_all(request).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        let mut sched = sched;
        sched.shutdown().await.context("stopping cron scheduler")?;
        Ok(())
    }

    async fn build_cron(&self, tx: mpsc::Sender<RunRequest>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating cron scheduler")?;

        let monitor = self.monitor.clone();
        let config = self.config.clone();
        let freshness = Job::new_async(self.config.freshness_cron.as_str(), move |_uuid, _l| {
            let monitor = monitor.clone();
            let config = config.clone();
            let tx = tx.clone();
            Box::pin(async move {
                let now = Utc::now();
                match monitor.run_cycle(now).await {
                    Ok(report) => {
                        if report.overall >= StalenessLevel::Critical {
                            let request = if report.overall == StalenessLevel::Emergency {
                                RunRequest::Full
                            } else {
                                RunRequest::Incremental
                            };
                            if tx.try_send(request).is_err() {
                                warn!("run request channel full; immediate run dropped");
                            }
                        }
                    }
                    Err(err) => error!(error = %err, "freshness cycle failed"),
                }
                if let Err(err) = monitor.run_retention(&config, now).await {
                    error!(error = %err, "retention cleanup failed");
                }
            })
        })
        .with_context(|| format!("creating freshness job for cron {}", self.config.freshness_cron))?;
        sched.add(freshness).await.context("adding freshness job")?;

        let pipeline = self.pipeline.clone();
        let sweep = Job::new_async(self.config.incremental_cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                for outcome in pipeline.run_all().await {
                    if let Err(err) = outcome {
                        error!(error = %err, "sweep run failed");
                    }
                }
            })
        })
        .with_context(|| {
            format!(
                "creating sweep job for cron {}",
                self.config.incremental_cron
            )
        })?;
        sched.add(sweep).await.context("adding sweep job")?;

        Ok(sched)
    }

    /// Runs every due source with bounded parallelism and a hard per-source
    /// timeout, so one wedged portal cannot hold a worker forever.
    async fn collect_due(&self, workers: &Arc<Semaphore>) {
        let now = Utc::now();
        let due: Vec<String> = match self.pipeline.due_sources(now).await {
            Ok(ids) => ids,
            Err(err) => {
                error!(error = %err, "reading due sources failed");
                return;
            }
        };
        if due.is_empty() {
            return;
        }

        let timeout = std::time::Duration::from_secs(self.config.collection_timeout_mins * 60);
        let mut tasks = JoinSet::new();
        for source_id in due {
            let permit = match workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let pipeline = self.pipeline.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = tokio::time::timeout(timeout, pipeline.run_one(&source_id)).await;
                match outcome {
                    Ok(Ok(summary)) => info!(
                        source_id = %summary.source_id,
                        inserted = summary.queue.inserted,
                        updated = summary.queue.updated,
                        "scheduled collection finished"
                    ),
                    Ok(Err(err)) => warn!(source_id, error = %err, "scheduled collection failed"),
                    Err(_) => warn!(source_id, "scheduled collection timed out"),
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Emergency staleness throws away the incremental window; Critical
    /// re-runs within it.
    async fn sweep_all(&self, request: RunRequest) {
        let outcomes = match request {
            RunRequest::Full => self.pipeline.run_all_full().await,
            RunRequest::Incremental => self.pipeline.run_all().await,
        };
        for outcome in outcomes {
            if let Err(err) = outcome {
                error!(error = %err, "immediate run failed");
            }
        }
    }

    async fn refresh_schedules(&self) {
        let source_ids: Vec<String> = self
            .pipeline
            .registry()
            .enabled()
            .map(|s| s.source_id.clone())
            .collect();
        if let Err(err) = self
            .scheduler
            .update_all(self.pipeline.store().as_ref(), &source_ids, Utc::now())
            .await
        {
            error!(error = %err, "refreshing schedules failed");
        }
    }
}
