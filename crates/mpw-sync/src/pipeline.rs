//! Per-source collection pipeline: fetch, clean, validate, dedup, delta,
//! queue processing, metric sample and watermark.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use mpw_adapters::{adapter_for_source, AdapterContext, Collected};
use mpw_core::{AlertSeverity, AlertType, CaseRecord, SourceMetricSample, SourceSyncMetadata, SyncOp};
use mpw_storage::{
    CaseStore, HttpClientConfig, HttpFetcher, MetricsStore, ScheduleStore, SharedStore,
    SyncQueueStore, WatermarkStore,
};

use crate::config::{SourceConfig, SourceRegistry, SyncConfig};
use crate::dedup::{DedupConfig, DedupEngine};
use crate::delta::{DeltaConfig, DeltaEngine, QueueReport};
use crate::geocode::{enrich_coordinates, Geocoder};
use crate::monitor::AlertEngine;
use crate::validate::{clean_record, validate_record};

/// Outcome of one collection pass against one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceRunSummary {
    pub source_id: String,
    pub run_id: Uuid,
    pub collected: usize,
    pub invalid: usize,
    pub duplicates_dropped: usize,
    pub enqueued: usize,
    pub skipped: usize,
    pub queue: QueueReport,
    pub urgency_score: f64,
    pub extraction_confidence: f64,
    pub duration_ms: i64,
}

/// Share-based urgency over a batch: minors and recently-missing cases pull
/// the score up. Bounded to [0, 1].
fn batch_urgency(records: &[CaseRecord], now: DateTime<Utc>) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let n = records.len() as f64;
    let minors = records
        .iter()
        .filter(|r| r.age.map(|a| a < 18).unwrap_or(false))
        .count() as f64;
    let week_ago = (now - chrono::Duration::days(7)).date_naive();
    let recent = records
        .iter()
        .filter(|r| r.date_missing.map(|d| d >= week_ago).unwrap_or(false))
        .count() as f64;
    (0.7 * minors / n + 0.5 * recent / n).clamp(0.0, 1.0)
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: SharedStore,
    http: Arc<HttpFetcher>,
    registry: SourceRegistry,
    delta: DeltaEngine,
    dedup: DedupEngine,
    alerts: Option<Arc<AlertEngine>>,
    geocoder: Option<Arc<dyn Geocoder>>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        store: SharedStore,
    ) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: std::time::Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })?;
        let delta = DeltaEngine::new(DeltaConfig {
            priority_threshold: config.queue_priority_threshold,
            min_confidence: config.queue_min_confidence,
            batch_limit: config.queue_batch_limit,
        });
        let dedup = DedupEngine::new(DedupConfig {
            threshold: config.dedup_threshold,
        });
        Ok(Self {
            config,
            store,
            http: Arc::new(http),
            registry,
            delta,
            dedup,
            alerts: None,
            geocoder: None,
        })
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertEngine>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Enabled sources whose latest recommendation is due at `now`. Sources
    /// with no recommendation yet are due by definition.
    pub async fn due_sources(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        let recommendations: HashMap<String, DateTime<Utc>> = self
            .store
            .latest_recommendations()
            .await?
            .into_iter()
            .map(|r| (r.source_id.clone(), r.next_run_at))
            .collect();

        Ok(self
            .registry
            .enabled()
            .filter(|source| {
                recommendations
                    .get(&source.source_id)
                    .map(|next| *next <= now)
                    .unwrap_or(true)
            })
            .map(|source| source.source_id.clone())
            .collect())
    }

    /// Runs one source by id.
    pub async fn run_one(&self, source_id: &str) -> anyhow::Result<SourceRunSummary> {
        let source = self
            .registry
            .get(source_id)
            .ok_or_else(|| anyhow::anyhow!("unknown source {source_id}"))?
            .clone();
        self.run_source(&source).await
    }

    /// Runs the full pipeline for one source. On collection failure an error
    /// sample is recorded and the watermark stays put, so the next run covers
    /// the same window again.
    pub async fn run_source(&self, source: &SourceConfig) -> anyhow::Result<SourceRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, source_id = %source.source_id);
        self.run_source_inner(source, run_id, false)
            .instrument(span)
            .await
    }

    /// Like [`run_source`], but ignores the watermark so the whole roster is
    /// re-examined. Used when staleness monitoring escalates to Emergency.
    ///
    /// [`run_source`]: Self::run_source
    pub async fn run_source_full(&self, source: &SourceConfig) -> anyhow::Result<SourceRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run_full", %run_id, source_id = %source.source_id);
        self.run_source_inner(source, run_id, true)
            .instrument(span)
            .await
    }

    async fn run_source_inner(
        &self,
        source: &SourceConfig,
        run_id: Uuid,
        full: bool,
    ) -> anyhow::Result<SourceRunSummary> {
        let started = std::time::Instant::now();
        let now = Utc::now();

        let endpoint = source
            .endpoint(&self.config.workspace_root)
            .ok_or_else(|| anyhow::anyhow!("source {} has no endpoint", source.source_id))?;
        let adapter = adapter_for_source(&source.source_id, &source.kind, endpoint)
            .ok_or_else(|| anyhow::anyhow!("unknown adapter kind {}", source.kind))?;

        let since = if full {
            None
        } else {
            self.store
                .watermark(&source.source_id)
                .await?
                .and_then(|w| w.last_successful_sync)
        };

        let ctx = AdapterContext {
            run_id,
            fetched_at: now,
        };
        let collected = match adapter.collect(&self.http, &ctx, since).await {
            Ok(collected) => collected,
            Err(err) => {
                warn!(error = %err, "collection failed");
                self.record_failure_sample(&source.source_id, now).await;
                if let Some(alerts) = &self.alerts {
                    alerts
                        .raise(
                            AlertType::SyncFailure,
                            AlertSeverity::Medium,
                            format!("sync failed for {}", source.source_id),
                            err.to_string(),
                            Some(source.source_id.clone()),
                            json!({}),
                            json!({}),
                        )
                        .await?;
                }
                return Err(err.into());
            }
        };

        let summary = self.apply_batch(source, run_id, collected, now).await?;
        info!(
            collected = summary.collected,
            invalid = summary.invalid,
            duplicates = summary.duplicates_dropped,
            enqueued = summary.enqueued,
            inserted = summary.queue.inserted,
            updated = summary.queue.updated,
            duration_ms = started.elapsed().as_millis() as i64,
            "sync run complete"
        );
        Ok(SourceRunSummary {
            duration_ms: started.elapsed().as_millis() as i64,
            ..summary
        })
    }

    async fn apply_batch(
        &self,
        source: &SourceConfig,
        run_id: Uuid,
        collected: Collected,
        now: DateTime<Utc>,
    ) -> anyhow::Result<SourceRunSummary> {
        let total = collected.records.len();

        let mut invalid = 0usize;
        let mut valid = Vec::with_capacity(total);
        for raw in &collected.records {
            let cleaned = clean_record(raw);
            let verdict = validate_record(&cleaned);
            if verdict.is_valid {
                valid.push(cleaned);
            } else {
                invalid += 1;
                warn!(
                    case_number = %cleaned.case_number,
                    errors = ?verdict.errors,
                    "record rejected by validation"
                );
            }
        }

        let mut outcome = self.dedup.dedup(valid);
        if let Some(geocoder) = &self.geocoder {
            enrich_coordinates(geocoder.as_ref(), &mut outcome.records).await;
        }
        let urgency = batch_urgency(&outcome.records, now);

        let existing: HashMap<String, CaseRecord> = self
            .store
            .cases_for_source(&source.source_id)
            .await?
            .into_iter()
            .map(|r| (r.case_key(), r))
            .collect();

        let mut enqueued = 0usize;
        let mut skipped = 0usize;
        for record in &outcome.records {
            let op = self
                .delta
                .analyze(record, existing.get(&record.case_key()), now);
            if op.op == SyncOp::Skip {
                // Unchanged refetches never hit the queue.
                skipped += 1;
            } else {
                self.store.enqueue(&op).await?;
                enqueued += 1;
            }
        }

        let queue = self.delta.process_queue(self.store.as_ref()).await?;

        if urgency > 0.7 {
            if let Some(alerts) = &self.alerts {
                alerts
                    .raise(
                        AlertType::UrgentCaseDetected,
                        AlertSeverity::High,
                        format!("urgent case cluster in {}", source.source_id),
                        format!("batch urgency {urgency:.2} over {} cases", outcome.records.len()),
                        Some(source.source_id.clone()),
                        json!({ "urgency": urgency }),
                        json!({ "threshold": 0.7 }),
                    )
                    .await?;
            }
        }

        self.store
            .record_sample(&SourceMetricSample {
                source_id: source.source_id.clone(),
                timestamp: now,
                records_processed: total as u32,
                records_changed: (queue.inserted + queue.updated) as u32,
                errors_count: queue.failed as u32,
                response_time_ms: collected.response_time_ms,
                urgency_score: urgency,
                system_load: self.config.system_load,
            })
            .await?;

        self.store
            .put_watermark(&SourceSyncMetadata {
                source_id: source.source_id.clone(),
                last_sync_time: now,
                last_successful_sync: Some(now),
                records_processed: total as u32,
                records_inserted: queue.inserted as u32,
                records_updated: queue.updated as u32,
                records_skipped: skipped as u32,
                error_count: queue.failed as u32,
                sync_duration_ms: 0,
            })
            .await?;

        Ok(SourceRunSummary {
            source_id: source.source_id.clone(),
            run_id,
            collected: total,
            invalid,
            duplicates_dropped: outcome.dropped,
            enqueued,
            skipped,
            queue,
            urgency_score: urgency,
            extraction_confidence: collected.extraction_confidence,
            duration_ms: 0,
        })
    }

    /// Failed runs advance `last_sync_time` only; `last_successful_sync` and
    /// the incremental window are untouched.
    async fn record_failure_sample(&self, source_id: &str, now: DateTime<Utc>) {
        let sample = SourceMetricSample {
            source_id: source_id.to_string(),
            timestamp: now,
            records_processed: 0,
            records_changed: 0,
            errors_count: 1,
            response_time_ms: 0.0,
            urgency_score: 0.0,
            system_load: self.config.system_load,
        };
        if let Err(err) = self.store.record_sample(&sample).await {
            warn!(source_id, error = %err, "recording failure sample failed");
        }
        match self.store.watermark(source_id).await {
            Ok(existing) => {
                let mut meta = existing.unwrap_or(SourceSyncMetadata {
                    source_id: source_id.to_string(),
                    last_sync_time: now,
                    last_successful_sync: None,
                    records_processed: 0,
                    records_inserted: 0,
                    records_updated: 0,
                    records_skipped: 0,
                    error_count: 0,
                    sync_duration_ms: 0,
                });
                meta.last_sync_time = now;
                meta.error_count += 1;
                if let Err(err) = self.store.put_watermark(&meta).await {
                    warn!(source_id, error = %err, "updating failure watermark failed");
                }
            }
            Err(err) => warn!(source_id, error = %err, "reading watermark failed"),
        }
    }

    /// Runs every enabled source regardless of schedule.
    pub async fn run_all(&self) -> Vec<anyhow::Result<SourceRunSummary>> {
        let mut out = Vec::new();
        for source in self.registry.enabled() {
            out.push(self.run_source(source).await);
        }
        out
    }

    /// Watermark-ignoring sweep over every enabled source.
    pub async fn run_all_full(&self) -> Vec<anyhow::Result<SourceRunSummary>> {
        let mut out = Vec::new();
        for source in self.registry.enabled() {
            out.push(self.run_source_full(source).await);
        }
        out
    }

    /// Runs the enabled sources whose latest recommendation is due.
    pub async fn run_due(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<SourceRunSummary>> {
        let mut out = Vec::new();
        for source_id in self.due_sources(now).await? {
            match self.run_one(&source_id).await {
                Ok(summary) => out.push(summary),
                Err(err) => warn!(source_id, error = %err, "scheduled run failed"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpw_core::ScheduleRecommendation;
    use mpw_storage::{MemoryStore, SyncQueueStore};
    use std::path::Path;

    const ROSTER_JSON: &str = r#"{
      "results": [
        {
          "case_number": "mp-4410",
          "full_name": "maria delgado",
          "age": 16,
          "sex": "Female",
          "city": "tucson",
          "state": "az",
          "date_missing": "2026-02-11",
          "status": "Active",
          "last_updated": "2026-02-20T08:30:00Z"
        },
        {
          "case_number": "MP-4412",
          "full_name": "Robert Hale",
          "age": 44,
          "sex": "Male",
          "city": "Flagstaff",
          "state": "AZ",
          "date_missing": "2026-01-05",
          "status": "active"
        },
        {
          "case_number": "???bad???",
          "full_name": "Broken Row",
          "age": 300
        }
      ]
    }"#;

    fn write_fixture(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("roster.json");
        std::fs::write(&path, ROSTER_JSON).unwrap();
        path
    }

    fn pipeline_for(dir: &Path, fixture: &Path) -> (SyncPipeline, SharedStore) {
        let mut config = SyncConfig::from_env();
        config.workspace_root = dir.to_path_buf();
        let registry = SourceRegistry {
            sources: vec![SourceConfig {
                source_id: "namus".into(),
                display_name: "National Clearinghouse".into(),
                enabled: true,
                kind: "json_roster".into(),
                url: None,
                fixture: Some(fixture.strip_prefix(dir).unwrap().to_path_buf()),
                notes: None,
            }],
        };
        let store: SharedStore = Arc::new(MemoryStore::new());
        let pipeline = SyncPipeline::new(config, registry, store.clone()).unwrap();
        (pipeline, store)
    }

    #[tokio::test]
    async fn first_run_inserts_valid_records_and_advances_watermark() {
        let tmp = tempfile::tempdir().unwrap();
        let fixture = write_fixture(tmp.path());
        let (pipeline, store) = pipeline_for(tmp.path(), &fixture);
        let source = pipeline.registry().get("namus").unwrap().clone();

        let summary = pipeline.run_source(&source).await.unwrap();
        assert_eq!(summary.collected, 3);
        assert_eq!(summary.invalid, 1);
        assert_eq!(summary.enqueued, 2);
        assert_eq!(summary.queue.inserted, 2);
        assert_eq!(summary.queue.failed, 0);

        let cases = store.cases_for_source("namus").await.unwrap();
        assert_eq!(cases.len(), 2);
        // Cleaning normalized the identity fields before storage.
        assert!(cases.iter().any(|c| c.case_number == "MP-4410"
            && c.name.as_deref() == Some("Maria Delgado")
            && c.state.as_deref() == Some("AZ")));

        let meta = store.watermark("namus").await.unwrap().unwrap();
        assert!(meta.last_successful_sync.is_some());
        assert_eq!(meta.records_inserted, 2);

        let since = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.samples_since("namus", since).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unchanged_refetch_skips_without_queueing() {
        let tmp = tempfile::tempdir().unwrap();
        let fixture = write_fixture(tmp.path());
        let (pipeline, store) = pipeline_for(tmp.path(), &fixture);
        let source = pipeline.registry().get("namus").unwrap().clone();

        pipeline.run_source(&source).await.unwrap();
        let second = pipeline.run_source(&source).await.unwrap();

        // The fixture carries a last_updated stamp older than the watermark
        // for one record; the other two have none and are refetched.
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.queue.claimed, 0);
        assert!(second.skipped > 0);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_fixture_fails_without_touching_the_window() {
        let tmp = tempfile::tempdir().unwrap();
        let fixture = tmp.path().join("missing.json");
        let (pipeline, store) = pipeline_for(tmp.path(), &fixture);
        let source = pipeline.registry().get("namus").unwrap().clone();

        assert!(pipeline.run_source(&source).await.is_err());

        let meta = store.watermark("namus").await.unwrap().unwrap();
        assert!(meta.last_successful_sync.is_none());
        assert_eq!(meta.error_count, 1);

        let since = Utc::now() - chrono::Duration::hours(1);
        let samples = store.samples_since("namus", since).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].errors_count, 1);
    }

    #[tokio::test]
    async fn run_due_honors_future_recommendations() {
        let tmp = tempfile::tempdir().unwrap();
        let fixture = write_fixture(tmp.path());
        let (pipeline, store) = pipeline_for(tmp.path(), &fixture);
        let now = Utc::now();

        store
            .save_recommendation(&ScheduleRecommendation {
                source_id: "namus".into(),
                tier: mpw_core::FrequencyTier::Low,
                interval_minutes: 720,
                next_run_at: now + chrono::Duration::hours(12),
                reason: "standard monitoring".into(),
                confidence: 0.5,
                factors: serde_json::json!({}),
                created_at: now,
            })
            .await
            .unwrap();
        assert!(pipeline.run_due(now).await.unwrap().is_empty());

        // An overdue recommendation makes the source run.
        let ran = pipeline
            .run_due(now + chrono::Duration::hours(13))
            .await
            .unwrap();
        assert_eq!(ran.len(), 1);
        assert_eq!(ran[0].source_id, "namus");
    }

    #[test]
    fn urgency_weights_minors_and_recent_cases() {
        let now = Utc::now();
        let minor = CaseRecord {
            case_number: "MP-1".into(),
            source_id: "s".into(),
            age: Some(12),
            date_missing: Some((now - chrono::Duration::days(2)).date_naive()),
            ..Default::default()
        };
        let adult = CaseRecord {
            case_number: "MP-2".into(),
            source_id: "s".into(),
            age: Some(50),
            date_missing: Some((now - chrono::Duration::days(400)).date_naive()),
            ..Default::default()
        };
        assert_eq!(batch_urgency(&[], now), 0.0);
        // A lone recently-missing minor saturates the score.
        assert_eq!(batch_urgency(&[minor.clone()], now), 1.0);
        assert!(batch_urgency(&[minor.clone()], now) > batch_urgency(&[minor, adult], now));
    }
}
