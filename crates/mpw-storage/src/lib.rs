//! Persistence contracts and HTTP fetch utilities for MPW.
//!
//! The engine talks to storage through the trait seams defined here. Two
//! implementations are provided: an in-memory store for tests and fixture
//! runs, and a Postgres store using runtime-bound sqlx queries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::info_span;
use uuid::Uuid;

use mpw_core::{
    Alert, AlertSeverity, AlertStatus, AlertType, CaseRecord, FrequencyTier, HealthSnapshot,
    NotificationAttempt, ScheduleRecommendation, SourceMetricSample, SourceSyncMetadata, SyncOp,
    SyncOperation,
};

pub const CRATE_NAME: &str = "mpw-storage";

/// Embedded schema migrations, applied on Postgres connect.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored value could not be decoded: {0}")]
    Decode(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Append-only per-source collection measurements.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn record_sample(&self, sample: &SourceMetricSample) -> Result<(), StoreError>;
    async fn samples_since(
        &self,
        source_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SourceMetricSample>, StoreError>;
    async fn prune_samples_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Append-only schedule recommendations; the newest row per source wins.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn save_recommendation(&self, rec: &ScheduleRecommendation) -> Result<(), StoreError>;
    async fn latest_recommendation(
        &self,
        source_id: &str,
    ) -> Result<Option<ScheduleRecommendation>, StoreError>;
    /// Latest recommendation for every source that has one.
    async fn latest_recommendations(&self) -> Result<Vec<ScheduleRecommendation>, StoreError>;
}

#[async_trait]
pub trait SyncQueueStore: Send + Sync {
    async fn enqueue(&self, op: &SyncOperation) -> Result<(), StoreError>;
    /// Unprocessed operations at `priority <= max_priority` and
    /// `confidence >= min_confidence`, ordered by (priority, created_at).
    async fn pending_batch(
        &self,
        max_priority: i16,
        min_confidence: f64,
        limit: i64,
    ) -> Result<Vec<SyncOperation>, StoreError>;
    /// Records the terminal outcome of one operation. Returns false when the
    /// operation was already processed, so outcomes land exactly once.
    async fn mark_processed(
        &self,
        id: Uuid,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;
    async fn pending_count(&self) -> Result<i64, StoreError>;
    async fn prune_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Durable sync watermarks, one row per source.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn watermark(&self, source_id: &str) -> Result<Option<SourceSyncMetadata>, StoreError>;
    async fn put_watermark(&self, meta: &SourceSyncMetadata) -> Result<(), StoreError>;
    async fn all_watermarks(&self) -> Result<Vec<SourceSyncMetadata>, StoreError>;
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Idempotent write keyed on (source_id, case_number). Returns true when
    /// the case did not exist before.
    async fn upsert_case(&self, record: &CaseRecord) -> Result<bool, StoreError>;
    async fn cases_for_source(&self, source_id: &str) -> Result<Vec<CaseRecord>, StoreError>;
    async fn all_cases(&self) -> Result<Vec<CaseRecord>, StoreError>;
    async fn case_count(&self) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError>;
    async fn active_alerts(&self) -> Result<Vec<Alert>, StoreError>;
    /// Count of active-or-acknowledged alerts of the same (type, source)
    /// created since `since`. This query is the cooldown source of truth.
    async fn similar_alerts_since(
        &self,
        alert_type: AlertType,
        source: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
    async fn alerts_created_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError>;
    async fn set_alert_status(
        &self,
        id: Uuid,
        status: AlertStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn record_notification(&self, attempt: &NotificationAttempt) -> Result<(), StoreError>;
    async fn insert_health_snapshot(&self, snap: &HealthSnapshot) -> Result<(), StoreError>;
    async fn latest_health_snapshot(&self) -> Result<Option<HealthSnapshot>, StoreError>;
    async fn prune_resolved_alerts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
    async fn prune_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Umbrella trait for passing one store handle through the engine.
pub trait Store:
    MetricsStore + ScheduleStore + SyncQueueStore + WatermarkStore + CaseStore + AlertStore
{
}

impl<T> Store for T where
    T: MetricsStore + ScheduleStore + SyncQueueStore + WatermarkStore + CaseStore + AlertStore
{
}

pub type SharedStore = Arc<dyn Store>;

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryInner {
    samples: Vec<SourceMetricSample>,
    recommendations: Vec<ScheduleRecommendation>,
    queue: Vec<SyncOperation>,
    watermarks: HashMap<String, SourceSyncMetadata>,
    cases: HashMap<String, CaseRecord>,
    alerts: Vec<Alert>,
    notifications: Vec<NotificationAttempt>,
    snapshots: Vec<HealthSnapshot>,
}

/// Process-local store used by tests, fixture runs and `--dry-run` flows.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn record_sample(&self, sample: &SourceMetricSample) -> Result<(), StoreError> {
        self.inner.write().await.samples.push(sample.clone());
        Ok(())
    }

    async fn samples_since(
        &self,
        source_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SourceMetricSample>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .samples
            .iter()
            .filter(|s| s.source_id == source_id && s.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn prune_samples_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.samples.len();
        inner.samples.retain(|s| s.timestamp >= cutoff);
        Ok((before - inner.samples.len()) as u64)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn save_recommendation(&self, rec: &ScheduleRecommendation) -> Result<(), StoreError> {
        self.inner.write().await.recommendations.push(rec.clone());
        Ok(())
    }

    async fn latest_recommendation(
        &self,
        source_id: &str,
    ) -> Result<Option<ScheduleRecommendation>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .recommendations
            .iter()
            .filter(|r| r.source_id == source_id)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn latest_recommendations(&self) -> Result<Vec<ScheduleRecommendation>, StoreError> {
        let inner = self.inner.read().await;
        let mut latest: HashMap<&str, &ScheduleRecommendation> = HashMap::new();
        for rec in &inner.recommendations {
            match latest.get(rec.source_id.as_str()) {
                Some(existing) if existing.created_at >= rec.created_at => {}
                _ => {
                    latest.insert(rec.source_id.as_str(), rec);
                }
            }
        }
        let mut out: Vec<ScheduleRecommendation> = latest.into_values().cloned().collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(out)
    }
}

#[async_trait]
impl SyncQueueStore for MemoryStore {
    async fn enqueue(&self, op: &SyncOperation) -> Result<(), StoreError> {
        self.inner.write().await.queue.push(op.clone());
        Ok(())
    }

    async fn pending_batch(
        &self,
        max_priority: i16,
        min_confidence: f64,
        limit: i64,
    ) -> Result<Vec<SyncOperation>, StoreError> {
        let inner = self.inner.read().await;
        let mut batch: Vec<SyncOperation> = inner
            .queue
            .iter()
            .filter(|op| {
                op.processed_at.is_none()
                    && op.priority <= max_priority
                    && op.confidence >= min_confidence
            })
            .cloned()
            .collect();
        batch.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        batch.truncate(limit.max(0) as usize);
        Ok(batch)
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        for op in inner.queue.iter_mut() {
            if op.id == id {
                if op.processed_at.is_some() {
                    return Ok(false);
                }
                op.processed_at = Some(Utc::now());
                op.result = result.map(str::to_string);
                op.error = error.map(str::to_string);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn pending_count(&self) -> Result<i64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.queue.iter().filter(|op| op.processed_at.is_none()).count() as i64)
    }

    async fn prune_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.queue.len();
        inner
            .queue
            .retain(|op| match op.processed_at {
                Some(at) => at >= cutoff,
                None => true,
            });
        Ok((before - inner.queue.len()) as u64)
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn watermark(&self, source_id: &str) -> Result<Option<SourceSyncMetadata>, StoreError> {
        Ok(self.inner.read().await.watermarks.get(source_id).cloned())
    }

    async fn put_watermark(&self, meta: &SourceSyncMetadata) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .watermarks
            .insert(meta.source_id.clone(), meta.clone());
        Ok(())
    }

    async fn all_watermarks(&self) -> Result<Vec<SourceSyncMetadata>, StoreError> {
        let mut out: Vec<SourceSyncMetadata> =
            self.inner.read().await.watermarks.values().cloned().collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(out)
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    async fn upsert_case(&self, record: &CaseRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let inserted = inner
            .cases
            .insert(record.case_key(), record.clone())
            .is_none();
        Ok(inserted)
    }

    async fn cases_for_source(&self, source_id: &str) -> Result<Vec<CaseRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<CaseRecord> = inner
            .cases
            .values()
            .filter(|c| c.source_id == source_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.case_number.cmp(&b.case_number));
        Ok(out)
    }

    async fn all_cases(&self) -> Result<Vec<CaseRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<CaseRecord> = inner.cases.values().cloned().collect();
        out.sort_by(|a, b| a.case_key().cmp(&b.case_key()));
        Ok(out)
    }

    async fn case_count(&self) -> Result<i64, StoreError> {
        Ok(self.inner.read().await.cases.len() as i64)
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.inner.write().await.alerts.push(alert.clone());
        Ok(())
    }

    async fn active_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Alert> = inner
            .alerts
            .iter()
            .filter(|a| a.status == AlertStatus::Active)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn similar_alerts_since(
        &self,
        alert_type: AlertType,
        source: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .alerts
            .iter()
            .filter(|a| {
                a.alert_type == alert_type
                    && a.source.as_deref() == source
                    && matches!(a.status, AlertStatus::Active | AlertStatus::Acknowledged)
                    && a.created_at >= since
            })
            .count() as u64)
    }

    async fn alerts_created_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.alerts.iter().filter(|a| a.created_at >= since).count() as u64)
    }

    async fn set_alert_status(
        &self,
        id: Uuid,
        status: AlertStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        for alert in inner.alerts.iter_mut() {
            if alert.id == id {
                alert.status = status;
                match status {
                    AlertStatus::Acknowledged => alert.acknowledged_at = Some(at),
                    AlertStatus::Resolved => alert.resolved_at = Some(at),
                    _ => {}
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn record_notification(&self, attempt: &NotificationAttempt) -> Result<(), StoreError> {
        self.inner.write().await.notifications.push(attempt.clone());
        Ok(())
    }

    async fn insert_health_snapshot(&self, snap: &HealthSnapshot) -> Result<(), StoreError> {
        self.inner.write().await.snapshots.push(snap.clone());
        Ok(())
    }

    async fn latest_health_snapshot(&self) -> Result<Option<HealthSnapshot>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.snapshots.iter().max_by_key(|s| s.timestamp).cloned())
    }

    async fn prune_resolved_alerts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.alerts.len();
        inner.alerts.retain(|a| {
            !(a.status == AlertStatus::Resolved
                && a.resolved_at.map(|at| at < cutoff).unwrap_or(false))
        });
        Ok((before - inner.alerts.len()) as u64)
    }

    async fn prune_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.snapshots.len();
        inner.snapshots.retain(|s| s.timestamp >= cutoff);
        Ok((before - inner.snapshots.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn decode_tier(s: &str) -> Result<FrequencyTier, StoreError> {
    match s {
        "critical" => Ok(FrequencyTier::Critical),
        "high" => Ok(FrequencyTier::High),
        "normal" => Ok(FrequencyTier::Normal),
        "low" => Ok(FrequencyTier::Low),
        "minimal" => Ok(FrequencyTier::Minimal),
        other => Err(StoreError::Decode(format!("unknown frequency tier {other:?}"))),
    }
}

fn decode_sync_op(s: &str) -> Result<SyncOp, StoreError> {
    match s {
        "insert" => Ok(SyncOp::Insert),
        "update" => Ok(SyncOp::Update),
        "delete" => Ok(SyncOp::Delete),
        "skip" => Ok(SyncOp::Skip),
        other => Err(StoreError::Decode(format!("unknown sync op {other:?}"))),
    }
}

fn decode_alert_type(s: &str) -> Result<AlertType, StoreError> {
    match s {
        "data_staleness" => Ok(AlertType::DataStaleness),
        "sync_failure" => Ok(AlertType::SyncFailure),
        "high_error_rate" => Ok(AlertType::HighErrorRate),
        "performance_degradation" => Ok(AlertType::PerformanceDegradation),
        "system_resource" => Ok(AlertType::SystemResource),
        "urgent_case_detected" => Ok(AlertType::UrgentCaseDetected),
        "source_unavailable" => Ok(AlertType::SourceUnavailable),
        other => Err(StoreError::Decode(format!("unknown alert type {other:?}"))),
    }
}

fn decode_severity(s: &str) -> Result<AlertSeverity, StoreError> {
    match s {
        "info" => Ok(AlertSeverity::Info),
        "low" => Ok(AlertSeverity::Low),
        "medium" => Ok(AlertSeverity::Medium),
        "high" => Ok(AlertSeverity::High),
        "critical" => Ok(AlertSeverity::Critical),
        other => Err(StoreError::Decode(format!("unknown severity {other:?}"))),
    }
}

fn decode_alert_status(s: &str) -> Result<AlertStatus, StoreError> {
    match s {
        "active" => Ok(AlertStatus::Active),
        "acknowledged" => Ok(AlertStatus::Acknowledged),
        "resolved" => Ok(AlertStatus::Resolved),
        "suppressed" => Ok(AlertStatus::Suppressed),
        other => Err(StoreError::Decode(format!("unknown alert status {other:?}"))),
    }
}

impl PgStore {
    /// Connects and applies pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_case(row: &sqlx::postgres::PgRow) -> Result<CaseRecord, StoreError> {
        Ok(CaseRecord {
            case_number: row.try_get("case_number")?,
            source_id: row.try_get("source_id")?,
            name: row.try_get("name")?,
            age: row.try_get("age")?,
            gender: row.try_get("gender")?,
            ethnicity: row.try_get("ethnicity")?,
            city: row.try_get("city")?,
            county: row.try_get("county")?,
            state: row.try_get("state")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            date_missing: row.try_get("date_missing")?,
            date_reported: row.try_get("date_reported")?,
            status: row.try_get("status")?,
            category: row.try_get("category")?,
            description: row.try_get("description")?,
            contact_phone: row.try_get("contact_phone")?,
            contact_email: row.try_get("contact_email")?,
            source_updated_at: row.try_get("source_updated_at")?,
        })
    }

    fn row_to_operation(row: &sqlx::postgres::PgRow) -> Result<SyncOperation, StoreError> {
        let op_str: String = row.try_get("op")?;
        let record_json: serde_json::Value = row.try_get("record")?;
        Ok(SyncOperation {
            id: row.try_get("id")?,
            source_id: row.try_get("source_id")?,
            case_id: row.try_get("case_id")?,
            op: decode_sync_op(&op_str)?,
            record: serde_json::from_value(record_json)?,
            source_hash: row.try_get("source_hash")?,
            existing_hash: row.try_get("existing_hash")?,
            confidence: row.try_get("confidence")?,
            priority: row.try_get("priority")?,
            reason: row.try_get("reason")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
        })
    }

    fn row_to_recommendation(
        row: &sqlx::postgres::PgRow,
    ) -> Result<ScheduleRecommendation, StoreError> {
        let tier: String = row.try_get("tier")?;
        Ok(ScheduleRecommendation {
            source_id: row.try_get("source_id")?,
            tier: decode_tier(&tier)?,
            interval_minutes: row.try_get("interval_minutes")?,
            next_run_at: row.try_get("next_run_at")?,
            reason: row.try_get("reason")?,
            confidence: row.try_get("confidence")?,
            factors: row.try_get("factors")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_alert(row: &sqlx::postgres::PgRow) -> Result<Alert, StoreError> {
        let alert_type: String = row.try_get("alert_type")?;
        let severity: String = row.try_get("severity")?;
        let status: String = row.try_get("status")?;
        Ok(Alert {
            id: row.try_get("id")?,
            alert_type: decode_alert_type(&alert_type)?,
            severity: decode_severity(&severity)?,
            title: row.try_get("title")?,
            message: row.try_get("message")?,
            source: row.try_get("source")?,
            metric_values: row.try_get("metric_values")?,
            threshold_values: row.try_get("threshold_values")?,
            status: decode_alert_status(&status)?,
            created_at: row.try_get("created_at")?,
            acknowledged_at: row.try_get("acknowledged_at")?,
            resolved_at: row.try_get("resolved_at")?,
            suppressed_until: row.try_get("suppressed_until")?,
        })
    }
}

#[async_trait]
impl MetricsStore for PgStore {
    async fn record_sample(&self, sample: &SourceMetricSample) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO source_metrics_history
              (source_id, timestamp, records_processed, records_changed,
               errors_count, response_time_ms, urgency_score, system_load)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&sample.source_id)
        .bind(sample.timestamp)
        .bind(sample.records_processed as i32)
        .bind(sample.records_changed as i32)
        .bind(sample.errors_count as i32)
        .bind(sample.response_time_ms)
        .bind(sample.urgency_score)
        .bind(sample.system_load)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn samples_since(
        &self,
        source_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SourceMetricSample>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, timestamp, records_processed, records_changed,
                   errors_count, response_time_ms, urgency_score, system_load
            FROM source_metrics_history
            WHERE source_id = $1 AND timestamp >= $2
            ORDER BY timestamp ASC
            "#,
        )
        .bind(source_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(SourceMetricSample {
                source_id: row.try_get("source_id")?,
                timestamp: row.try_get("timestamp")?,
                records_processed: row.try_get::<i32, _>("records_processed")? as u32,
                records_changed: row.try_get::<i32, _>("records_changed")? as u32,
                errors_count: row.try_get::<i32, _>("errors_count")? as u32,
                response_time_ms: row.try_get("response_time_ms")?,
                urgency_score: row.try_get("urgency_score")?,
                system_load: row.try_get("system_load")?,
            });
        }
        Ok(out)
    }

    async fn prune_samples_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM source_metrics_history WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn save_recommendation(&self, rec: &ScheduleRecommendation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO schedule_recommendations
              (source_id, tier, interval_minutes, next_run_at, reason, confidence, factors, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&rec.source_id)
        .bind(rec.tier.as_str())
        .bind(rec.interval_minutes)
        .bind(rec.next_run_at)
        .bind(&rec.reason)
        .bind(rec.confidence)
        .bind(&rec.factors)
        .bind(rec.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_recommendation(
        &self,
        source_id: &str,
    ) -> Result<Option<ScheduleRecommendation>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT source_id, tier, interval_minutes, next_run_at, reason, confidence, factors, created_at
            FROM schedule_recommendations
            WHERE source_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::row_to_recommendation(&r)).transpose()
    }

    async fn latest_recommendations(&self) -> Result<Vec<ScheduleRecommendation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (source_id)
                   source_id, tier, interval_minutes, next_run_at, reason, confidence, factors, created_at
            FROM schedule_recommendations
            ORDER BY source_id, created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_recommendation).collect()
    }
}

#[async_trait]
impl SyncQueueStore for PgStore {
    async fn enqueue(&self, op: &SyncOperation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_operations
              (id, source_id, case_id, op, record, source_hash, existing_hash,
               confidence, priority, reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(op.id)
        .bind(&op.source_id)
        .bind(&op.case_id)
        .bind(op.op.as_str())
        .bind(serde_json::to_value(&op.record)?)
        .bind(&op.source_hash)
        .bind(&op.existing_hash)
        .bind(op.confidence)
        .bind(op.priority)
        .bind(&op.reason)
        .bind(op.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_batch(
        &self,
        max_priority: i16,
        min_confidence: f64,
        limit: i64,
    ) -> Result<Vec<SyncOperation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, case_id, op, record, source_hash, existing_hash,
                   confidence, priority, reason, created_at, processed_at, result, error
            FROM sync_operations
            WHERE processed_at IS NULL AND priority <= $1 AND confidence >= $2
            ORDER BY priority ASC, created_at ASC
            LIMIT $3
            "#,
        )
        .bind(max_priority)
        .bind(min_confidence)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_operation).collect()
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE sync_operations
            SET processed_at = NOW(), result = $2, error = $3
            WHERE id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(result)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn pending_count(&self) -> Result<i64, StoreError> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM sync_operations WHERE processed_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(row.try_get("n")?)
    }

    async fn prune_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM sync_operations WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl WatermarkStore for PgStore {
    async fn watermark(&self, source_id: &str) -> Result<Option<SourceSyncMetadata>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT source_id, last_sync_time, last_successful_sync, records_processed,
                   records_inserted, records_updated, records_skipped, error_count, sync_duration_ms
            FROM source_sync_metadata
            WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(SourceSyncMetadata {
                source_id: r.try_get("source_id")?,
                last_sync_time: r.try_get("last_sync_time")?,
                last_successful_sync: r.try_get("last_successful_sync")?,
                records_processed: r.try_get::<i32, _>("records_processed")? as u32,
                records_inserted: r.try_get::<i32, _>("records_inserted")? as u32,
                records_updated: r.try_get::<i32, _>("records_updated")? as u32,
                records_skipped: r.try_get::<i32, _>("records_skipped")? as u32,
                error_count: r.try_get::<i32, _>("error_count")? as u32,
                sync_duration_ms: r.try_get("sync_duration_ms")?,
            })
        })
        .transpose()
    }

    async fn put_watermark(&self, meta: &SourceSyncMetadata) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO source_sync_metadata
              (source_id, last_sync_time, last_successful_sync, records_processed,
               records_inserted, records_updated, records_skipped, error_count, sync_duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source_id) DO UPDATE SET
              last_sync_time = EXCLUDED.last_sync_time,
              last_successful_sync = EXCLUDED.last_successful_sync,
              records_processed = EXCLUDED.records_processed,
              records_inserted = EXCLUDED.records_inserted,
              records_updated = EXCLUDED.records_updated,
              records_skipped = EXCLUDED.records_skipped,
              error_count = EXCLUDED.error_count,
              sync_duration_ms = EXCLUDED.sync_duration_ms
            "#,
        )
        .bind(&meta.source_id)
        .bind(meta.last_sync_time)
        .bind(meta.last_successful_sync)
        .bind(meta.records_processed as i32)
        .bind(meta.records_inserted as i32)
        .bind(meta.records_updated as i32)
        .bind(meta.records_skipped as i32)
        .bind(meta.error_count as i32)
        .bind(meta.sync_duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn all_watermarks(&self) -> Result<Vec<SourceSyncMetadata>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, last_sync_time, last_successful_sync, records_processed,
                   records_inserted, records_updated, records_skipped, error_count, sync_duration_ms
            FROM source_sync_metadata
            ORDER BY source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in &rows {
            out.push(SourceSyncMetadata {
                source_id: r.try_get("source_id")?,
                last_sync_time: r.try_get("last_sync_time")?,
                last_successful_sync: r.try_get("last_successful_sync")?,
                records_processed: r.try_get::<i32, _>("records_processed")? as u32,
                records_inserted: r.try_get::<i32, _>("records_inserted")? as u32,
                records_updated: r.try_get::<i32, _>("records_updated")? as u32,
                records_skipped: r.try_get::<i32, _>("records_skipped")? as u32,
                error_count: r.try_get::<i32, _>("error_count")? as u32,
                sync_duration_ms: r.try_get("sync_duration_ms")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl CaseStore for PgStore {
    async fn upsert_case(&self, record: &CaseRecord) -> Result<bool, StoreError> {
        // xmax = 0 distinguishes a fresh insert from a conflict update.
        let row = sqlx::query(
            r#"
            INSERT INTO cases
              (case_number, source_id, name, age, gender, ethnicity, city, county, state,
               latitude, longitude, date_missing, date_reported, status, category,
               description, contact_phone, contact_email, source_updated_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, NOW())
            ON CONFLICT (source_id, case_number) DO UPDATE SET
              name = EXCLUDED.name,
              age = EXCLUDED.age,
              gender = EXCLUDED.gender,
              ethnicity = EXCLUDED.ethnicity,
              city = EXCLUDED.city,
              county = EXCLUDED.county,
              state = EXCLUDED.state,
              latitude = EXCLUDED.latitude,
              longitude = EXCLUDED.longitude,
              date_missing = EXCLUDED.date_missing,
              date_reported = EXCLUDED.date_reported,
              status = EXCLUDED.status,
              category = EXCLUDED.category,
              description = EXCLUDED.description,
              contact_phone = EXCLUDED.contact_phone,
              contact_email = EXCLUDED.contact_email,
              source_updated_at = EXCLUDED.source_updated_at,
              updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.case_number)
        .bind(&record.source_id)
        .bind(&record.name)
        .bind(record.age)
        .bind(&record.gender)
        .bind(&record.ethnicity)
        .bind(&record.city)
        .bind(&record.county)
        .bind(&record.state)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.date_missing)
        .bind(record.date_reported)
        .bind(&record.status)
        .bind(&record.category)
        .bind(&record.description)
        .bind(&record.contact_phone)
        .bind(&record.contact_email)
        .bind(record.source_updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("inserted")?)
    }

    async fn cases_for_source(&self, source_id: &str) -> Result<Vec<CaseRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT case_number, source_id, name, age, gender, ethnicity, city, county, state,
                   latitude, longitude, date_missing, date_reported, status, category,
                   description, contact_phone, contact_email, source_updated_at
            FROM cases
            WHERE source_id = $1
            ORDER BY case_number
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_case).collect()
    }

    async fn all_cases(&self) -> Result<Vec<CaseRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT case_number, source_id, name, age, gender, ethnicity, city, county, state,
                   latitude, longitude, date_missing, date_reported, status, category,
                   description, contact_phone, contact_email, source_updated_at
            FROM cases
            ORDER BY source_id, case_number
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_case).collect()
    }

    async fn case_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM cases")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn insert_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO alerts
              (id, alert_type, severity, title, message, source, metric_values,
               threshold_values, status, created_at, acknowledged_at, resolved_at, suppressed_until)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(alert.id)
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(&alert.source)
        .bind(&alert.metric_values)
        .bind(&alert.threshold_values)
        .bind(alert.status.as_str())
        .bind(alert.created_at)
        .bind(alert.acknowledged_at)
        .bind(alert.resolved_at)
        .bind(alert.suppressed_until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, alert_type, severity, title, message, source, metric_values,
                   threshold_values, status, created_at, acknowledged_at, resolved_at, suppressed_until
            FROM alerts
            WHERE status = 'active'
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_alert).collect()
    }

    async fn similar_alerts_since(
        &self,
        alert_type: AlertType,
        source: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM alerts
            WHERE alert_type = $1
              AND source IS NOT DISTINCT FROM $2
              AND status IN ('active', 'acknowledged')
              AND created_at >= $3
            "#,
        )
        .bind(alert_type.as_str())
        .bind(source)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn alerts_created_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM alerts WHERE created_at >= $1")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn set_alert_status(
        &self,
        id: Uuid,
        status: AlertStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let res = match status {
            AlertStatus::Acknowledged => {
                sqlx::query("UPDATE alerts SET status = $2, acknowledged_at = $3 WHERE id = $1")
                    .bind(id)
                    .bind(status.as_str())
                    .bind(at)
                    .execute(&self.pool)
                    .await?
            }
            AlertStatus::Resolved => {
                sqlx::query("UPDATE alerts SET status = $2, resolved_at = $3 WHERE id = $1")
                    .bind(id)
                    .bind(status.as_str())
                    .bind(at)
                    .execute(&self.pool)
                    .await?
            }
            _ => {
                sqlx::query("UPDATE alerts SET status = $2 WHERE id = $1")
                    .bind(id)
                    .bind(status.as_str())
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(res.rows_affected() == 1)
    }

    async fn record_notification(&self, attempt: &NotificationAttempt) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO alert_notifications (id, alert_id, channel, success, detail, attempted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.alert_id)
        .bind(&attempt.channel)
        .bind(attempt.success)
        .bind(&attempt.detail)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_health_snapshot(&self, snap: &HealthSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO system_health_snapshots
              (timestamp, error_count_1h, data_freshness_hours, pending_operations, overall_health_score)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(snap.timestamp)
        .bind(snap.error_count_1h as i32)
        .bind(snap.data_freshness_hours)
        .bind(snap.pending_operations)
        .bind(snap.overall_health_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_health_snapshot(&self) -> Result<Option<HealthSnapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT timestamp, error_count_1h, data_freshness_hours, pending_operations, overall_health_score
            FROM system_health_snapshots
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(HealthSnapshot {
                timestamp: r.try_get("timestamp")?,
                error_count_1h: r.try_get::<i32, _>("error_count_1h")? as u32,
                data_freshness_hours: r.try_get("data_freshness_hours")?,
                pending_operations: r.try_get("pending_operations")?,
                overall_health_score: r.try_get("overall_health_score")?,
            })
        })
        .transpose()
    }

    async fn prune_resolved_alerts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let res =
            sqlx::query("DELETE FROM alerts WHERE status = 'resolved' AND resolved_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(res.rows_affected())
    }

    async fn prune_snapshots_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM system_health_snapshots WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            // Public records portals are slow and easily overwhelmed.
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub elapsed_ms: f64,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("building http client: {0}")]
    Build(reqwest::Error),
}

/// Shared fetcher with a global concurrency ceiling and lazily-created
/// per-source limits, so one slow portal never starves the rest.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(FetchError::Build)?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let started = std::time::Instant::now();
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
