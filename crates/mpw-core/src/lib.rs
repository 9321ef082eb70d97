//! Core domain model for MPW: canonical case records plus the persisted
//! bookkeeping types shared by the sync engine, scheduler and monitors.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mpw-core";

/// Canonical missing-person record as stored after cleaning/validation.
///
/// A case is identified by `(source_id, case_number)`; every other field is
/// best-effort and may be absent depending on what the source publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CaseRecord {
    pub case_number: String,
    pub source_id: String,
    pub name: Option<String>,
    pub age: Option<i32>,
    pub gender: Option<String>,
    pub ethnicity: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub state: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub date_missing: Option<NaiveDate>,
    pub date_reported: Option<NaiveDate>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    /// Last-modified timestamp as reported by the source, when available.
    pub source_updated_at: Option<DateTime<Utc>>,
}

impl CaseRecord {
    /// Stable identifier for the case within this system.
    pub fn case_key(&self) -> String {
        format!("{}:{}", self.source_id, self.case_number)
    }
}

/// One append-only measurement of a collection run against a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetricSample {
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub records_processed: u32,
    pub records_changed: u32,
    pub errors_count: u32,
    pub response_time_ms: f64,
    pub urgency_score: f64,
    pub system_load: f64,
}

/// Behavior classification of a source over its recent history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPattern {
    Burst,
    Steady,
    Periodic,
    Sporadic,
    Dormant,
}

impl ActivityPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityPattern::Burst => "burst",
            ActivityPattern::Steady => "steady",
            ActivityPattern::Periodic => "periodic",
            ActivityPattern::Sporadic => "sporadic",
            ActivityPattern::Dormant => "dormant",
        }
    }
}

/// Aggregated view over a source's metric history; derived, not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetrics {
    pub source_id: String,
    pub avg_records_per_hour: f64,
    pub change_rate: f64,
    pub error_rate: f64,
    pub response_time_avg: f64,
    pub activity_pattern: ActivityPattern,
    /// Hours of day (UTC) in which this source historically produces updates.
    pub peak_hours: Vec<u32>,
    pub last_significant_update: Option<DateTime<Utc>>,
    pub urgency_score: f64,
    pub sample_count: usize,
}

/// Polling frequency band with fixed interval bounds in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyTier {
    Critical,
    High,
    Normal,
    Low,
    Minimal,
}

impl FrequencyTier {
    /// Inclusive (min, max) polling interval in minutes for this tier.
    pub fn bounds(&self) -> (i64, i64) {
        match self {
            FrequencyTier::Critical => (5, 15),
            FrequencyTier::High => (30, 60),
            FrequencyTier::Normal => (120, 360),
            FrequencyTier::Low => (720, 1440),
            FrequencyTier::Minimal => (1440, 4320),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrequencyTier::Critical => "critical",
            FrequencyTier::High => "high",
            FrequencyTier::Normal => "normal",
            FrequencyTier::Low => "low",
            FrequencyTier::Minimal => "minimal",
        }
    }
}

/// Scheduling decision for one source. Append-only; the newest row per
/// source is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecommendation {
    pub source_id: String,
    pub tier: FrequencyTier,
    pub interval_minutes: i64,
    pub next_run_at: DateTime<Utc>,
    pub reason: String,
    pub confidence: f64,
    /// Raw weighted factor values that produced the decision.
    pub factors: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOp {
    Insert,
    Update,
    Delete,
    Skip,
}

impl SyncOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOp::Insert => "insert",
            SyncOp::Update => "update",
            SyncOp::Delete => "delete",
            SyncOp::Skip => "skip",
        }
    }
}

/// One queued change detected by the delta analyzer, carrying the full
/// candidate record so processing never has to re-fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: Uuid,
    pub source_id: String,
    pub case_id: String,
    pub op: SyncOp,
    pub record: CaseRecord,
    pub source_hash: String,
    pub existing_hash: Option<String>,
    pub confidence: f64,
    /// 1 (most urgent) through 5 (no-op).
    pub priority: i16,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Durable per-source watermark, overwritten after each sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSyncMetadata {
    pub source_id: String,
    pub last_sync_time: DateTime<Utc>,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub records_processed: u32,
    pub records_inserted: u32,
    pub records_updated: u32,
    pub records_skipped: u32,
    pub error_count: u32,
    pub sync_duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    DataStaleness,
    SyncFailure,
    HighErrorRate,
    PerformanceDegradation,
    SystemResource,
    UrgentCaseDetected,
    SourceUnavailable,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::DataStaleness => "data_staleness",
            AlertType::SyncFailure => "sync_failure",
            AlertType::HighErrorRate => "high_error_rate",
            AlertType::PerformanceDegradation => "performance_degradation",
            AlertType::SystemResource => "system_resource",
            AlertType::UrgentCaseDetected => "urgent_case_detected",
            AlertType::SourceUnavailable => "source_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Suppressed => "suppressed",
        }
    }
}

/// Persisted operational alert. The alert table is the source of truth for
/// cooldown decisions; nothing is cached in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub source: Option<String>,
    pub metric_values: serde_json::Value,
    pub threshold_values: serde_json::Value,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub suppressed_until: Option<DateTime<Utc>>,
}

/// Outcome of pushing one alert through one notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAttempt {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub channel: String,
    pub success: bool,
    pub detail: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Point-in-time system health reading taken by the monitoring loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub error_count_1h: u32,
    pub data_freshness_hours: f64,
    pub pending_operations: i64,
    pub overall_health_score: f64,
}

/// Freshness classification, ordered from healthy to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessLevel {
    Ok,
    Warning,
    Critical,
    Emergency,
}

impl StalenessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StalenessLevel::Ok => "ok",
            StalenessLevel::Warning => "warning",
            StalenessLevel::Critical => "critical",
            StalenessLevel::Emergency => "emergency",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_bounds_are_contiguous_and_ordered() {
        let tiers = [
            FrequencyTier::Critical,
            FrequencyTier::High,
            FrequencyTier::Normal,
            FrequencyTier::Low,
            FrequencyTier::Minimal,
        ];
        for t in tiers {
            let (lo, hi) = t.bounds();
            assert!(lo < hi, "{:?} bounds inverted", t);
        }
        assert!(FrequencyTier::Critical.bounds().1 < FrequencyTier::High.bounds().0 + 16);
        assert_eq!(FrequencyTier::Minimal.bounds(), (1440, 4320));
    }

    #[test]
    fn staleness_levels_order_by_badness() {
        assert!(StalenessLevel::Ok < StalenessLevel::Warning);
        assert!(StalenessLevel::Warning < StalenessLevel::Critical);
        assert!(StalenessLevel::Critical < StalenessLevel::Emergency);
        let worst = [StalenessLevel::Warning, StalenessLevel::Emergency, StalenessLevel::Ok]
            .into_iter()
            .max();
        assert_eq!(worst, Some(StalenessLevel::Emergency));
    }

    #[test]
    fn enum_wire_names_are_snake_case() {
        let j = serde_json::to_string(&ActivityPattern::Burst).unwrap();
        assert_eq!(j, "\"burst\"");
        let j = serde_json::to_string(&AlertType::DataStaleness).unwrap();
        assert_eq!(j, "\"data_staleness\"");
        let back: FrequencyTier = serde_json::from_str("\"minimal\"").unwrap();
        assert_eq!(back, FrequencyTier::Minimal);
    }

    #[test]
    fn case_key_combines_source_and_case_number() {
        let rec = CaseRecord {
            case_number: "MP-100".into(),
            source_id: "namus".into(),
            ..Default::default()
        };
        assert_eq!(rec.case_key(), "namus:MP-100");
    }
}
