//! Staleness monitoring, alert dispatch and system health snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use mpw_core::{
    Alert, AlertSeverity, AlertStatus, AlertType, HealthSnapshot, NotificationAttempt,
    StalenessLevel,
};
use mpw_storage::{AlertStore, MetricsStore, SharedStore, SyncQueueStore, WatermarkStore};

use crate::config::{StalenessThresholds, SyncConfig};

/// Freshness verdict for one monitored artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactReport {
    pub name: String,
    pub level: StalenessLevel,
    /// None when the artifact is missing entirely.
    pub age_hours: Option<f64>,
    pub thresholds: StalenessThresholds,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StalenessReport {
    pub checked_at: DateTime<Utc>,
    pub overall: StalenessLevel,
    pub artifacts: Vec<ArtifactReport>,
}

pub fn level_for_age(age_hours: f64, thresholds: &StalenessThresholds) -> StalenessLevel {
    if age_hours >= thresholds.emergency_hours {
        StalenessLevel::Emergency
    } else if age_hours >= thresholds.critical_hours {
        StalenessLevel::Critical
    } else if age_hours >= thresholds.warning_hours {
        StalenessLevel::Warning
    } else {
        StalenessLevel::Ok
    }
}

fn severity_for_level(level: StalenessLevel) -> AlertSeverity {
    match level {
        StalenessLevel::Emergency => AlertSeverity::Critical,
        StalenessLevel::Critical => AlertSeverity::High,
        StalenessLevel::Warning => AlertSeverity::Medium,
        StalenessLevel::Ok => AlertSeverity::Info,
    }
}

/// Health contribution of one artifact: full below warning, half between
/// warning and critical, zero at or past critical.
fn health_factor(report: &ArtifactReport) -> f64 {
    match report.age_hours {
        None => 0.0,
        Some(age) => {
            if age < report.thresholds.warning_hours {
                1.0
            } else if age < report.thresholds.critical_hours {
                0.5
            } else {
                0.0
            }
        }
    }
}

fn file_age_hours(path: &Path, now: DateTime<Utc>) -> Option<f64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let modified: DateTime<Utc> = modified.into();
    Some((now - modified).num_seconds().max(0) as f64 / 3600.0)
}

#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Logs alerts through the tracing pipeline; always available.
#[derive(Debug, Default)]
pub struct ConsoleChannel;

#[async_trait]
impl AlertChannel for ConsoleChannel {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::High => {
                error!(
                    alert_type = alert.alert_type.as_str(),
                    severity = alert.severity.as_str(),
                    source = alert.source.as_deref().unwrap_or("-"),
                    "{}: {}",
                    alert.title,
                    alert.message
                );
            }
            _ => {
                warn!(
                    alert_type = alert.alert_type.as_str(),
                    severity = alert.severity.as_str(),
                    source = alert.source.as_deref().unwrap_or("-"),
                    "{}: {}",
                    alert.title,
                    alert.message
                );
            }
        }
        Ok(())
    }
}

/// POSTs the alert as JSON to a configured endpoint.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        let resp = self.client.post(&self.url).json(alert).send().await?;
        resp.error_for_status()?;
        Ok(())
    }
}

/// Creates and dispatches alerts. The persisted alert table is the only
/// cooldown state; restarting the process never resets suppression.
pub struct AlertEngine {
    store: SharedStore,
    channels: Vec<Box<dyn AlertChannel>>,
    cooldown_minutes: i64,
    hourly_limit: u64,
}

impl AlertEngine {
    pub fn new(store: SharedStore, config: &SyncConfig) -> Self {
        let mut channels: Vec<Box<dyn AlertChannel>> = vec![Box::new(ConsoleChannel)];
        if let Some(url) = &config.webhook_url {
            channels.push(Box::new(WebhookChannel::new(url.clone())));
        }
        Self {
            store,
            channels,
            cooldown_minutes: config.alert_cooldown_minutes,
            hourly_limit: config.alert_hourly_limit,
        }
    }

    pub fn with_channels(
        store: SharedStore,
        channels: Vec<Box<dyn AlertChannel>>,
        cooldown_minutes: i64,
        hourly_limit: u64,
    ) -> Self {
        Self {
            store,
            channels,
            cooldown_minutes,
            hourly_limit,
        }
    }

    /// Raises an alert unless suppressed by cooldown or the global hourly
    /// budget. Returns the created alert, or None when suppressed.
    pub async fn raise(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        source: Option<String>,
        metric_values: serde_json::Value,
        threshold_values: serde_json::Value,
    ) -> anyhow::Result<Option<Alert>> {
        let now = Utc::now();
        let cooldown_start = now - chrono::Duration::minutes(self.cooldown_minutes);
        let similar = self
            .store
            .similar_alerts_since(alert_type, source.as_deref(), cooldown_start)
            .await?;
        if similar > 0 {
            info!(
                alert_type = alert_type.as_str(),
                source = source.as_deref().unwrap_or("-"),
                "alert suppressed by cooldown"
            );
            return Ok(None);
        }

        let recent = self
            .store
            .alerts_created_since(now - chrono::Duration::hours(1))
            .await?;
        if recent >= self.hourly_limit {
            warn!(
                alert_type = alert_type.as_str(),
                "alert suppressed by hourly rate limit"
            );
            return Ok(None);
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            title: title.into(),
            message: message.into(),
            source,
            metric_values,
            threshold_values,
            status: AlertStatus::Active,
            created_at: now,
            acknowledged_at: None,
            resolved_at: None,
            suppressed_until: None,
        };
        self.store.insert_alert(&alert).await?;
        self.dispatch(&alert).await;
        Ok(Some(alert))
    }

    /// Fans out to every channel; one failing channel never blocks another,
    /// and each attempt is recorded independently.
    async fn dispatch(&self, alert: &Alert) {
        for channel in &self.channels {
            let outcome = channel.send(alert).await;
            let attempt = NotificationAttempt {
                id: Uuid::new_v4(),
                alert_id: alert.id,
                channel: channel.name().to_string(),
                success: outcome.is_ok(),
                detail: outcome.as_ref().err().map(|e| e.to_string()),
                attempted_at: Utc::now(),
            };
            if let Err(err) = &outcome {
                warn!(channel = channel.name(), error = %err, "alert notification failed");
            }
            if let Err(err) = self.store.record_notification(&attempt).await {
                warn!(channel = channel.name(), error = %err, "recording notification attempt failed");
            }
        }
    }
}

/// Checks data freshness across the monitored artifacts and turns findings
/// into alerts and health snapshots.
pub struct StalenessMonitor {
    store: SharedStore,
    alerts: Arc<AlertEngine>,
    export_path: PathBuf,
    export_thresholds: StalenessThresholds,
}

impl StalenessMonitor {
    pub fn new(store: SharedStore, alerts: Arc<AlertEngine>, config: &SyncConfig) -> Self {
        Self {
            store,
            alerts,
            export_path: config.export_csv_path(),
            export_thresholds: config.export_thresholds,
        }
    }

    /// Pure freshness check; no alerts raised.
    pub async fn check(&self, now: DateTime<Utc>) -> anyhow::Result<StalenessReport> {
        let mut artifacts = Vec::with_capacity(2);

        let export_age = file_age_hours(&self.export_path, now);
        artifacts.push(ArtifactReport {
            name: "export_csv".into(),
            level: export_age
                .map(|age| level_for_age(age, &self.export_thresholds))
                .unwrap_or(StalenessLevel::Emergency),
            age_hours: export_age,
            thresholds: self.export_thresholds,
        });

        let store_thresholds = self.export_thresholds.relaxed_for_store();
        let watermarks = self.store.all_watermarks().await?;
        let store_age = watermarks
            .iter()
            .map(|w| w.last_sync_time)
            .max()
            .map(|latest| (now - latest).num_seconds().max(0) as f64 / 3600.0);
        artifacts.push(ArtifactReport {
            name: "case_store".into(),
            level: store_age
                .map(|age| level_for_age(age, &store_thresholds))
                .unwrap_or(StalenessLevel::Emergency),
            age_hours: store_age,
            thresholds: store_thresholds,
        });

        let overall = artifacts
            .iter()
            .map(|a| a.level)
            .max()
            .unwrap_or(StalenessLevel::Ok);
        Ok(StalenessReport {
            checked_at: now,
            overall,
            artifacts,
        })
    }

    /// Full monitoring pass: check freshness, raise alerts for degraded
    /// artifacts, and persist a health snapshot.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> anyhow::Result<StalenessReport> {
        let report = self.check(now).await?;

        for artifact in &report.artifacts {
            if artifact.level >= StalenessLevel::Warning {
                let age_text = artifact
                    .age_hours
                    .map(|a| format!("{a:.1}h old"))
                    .unwrap_or_else(|| "missing".to_string());
                self.alerts
                    .raise(
                        AlertType::DataStaleness,
                        severity_for_level(artifact.level),
                        format!("{} is {}", artifact.name, artifact.level.as_str()),
                        format!("artifact {} is {age_text}", artifact.name),
                        Some(artifact.name.clone()),
                        json!({ "age_hours": artifact.age_hours }),
                        json!({
                            "warning_hours": artifact.thresholds.warning_hours,
                            "critical_hours": artifact.thresholds.critical_hours,
                            "emergency_hours": artifact.thresholds.emergency_hours,
                        }),
                    )
                    .await?;
            }
        }

        let snapshot = self.health_snapshot(&report, now).await?;
        self.store.insert_health_snapshot(&snapshot).await?;
        Ok(report)
    }

    async fn health_snapshot(
        &self,
        report: &StalenessReport,
        now: DateTime<Utc>,
    ) -> anyhow::Result<HealthSnapshot> {
        let factors: Vec<f64> = report.artifacts.iter().map(health_factor).collect();
        let score = if factors.is_empty() {
            100.0
        } else {
            factors.iter().sum::<f64>() / factors.len() as f64 * 100.0
        };

        let hour_ago = now - chrono::Duration::hours(1);
        let error_count_1h = self
            .store
            .all_watermarks()
            .await?
            .iter()
            .filter(|w| w.last_sync_time >= hour_ago)
            .map(|w| w.error_count)
            .sum();
        let freshness = report
            .artifacts
            .iter()
            .filter_map(|a| a.age_hours)
            .fold(0.0_f64, f64::max);

        Ok(HealthSnapshot {
            timestamp: now,
            error_count_1h,
            data_freshness_hours: freshness,
            pending_operations: self.store.pending_count().await?,
            overall_health_score: score,
        })
    }

    /// Deletes aged-out history per the retention policy.
    pub async fn run_retention(&self, config: &SyncConfig, now: DateTime<Utc>) -> anyhow::Result<()> {
        let metrics_cutoff = now - chrono::Duration::days(config.metrics_retention_days);
        let snapshot_cutoff = now - chrono::Duration::days(config.snapshot_retention_days);
        let alert_cutoff = now - chrono::Duration::days(config.resolved_alert_retention_days);
        let op_cutoff = now - chrono::Duration::days(config.processed_op_retention_days);

        let samples = self.store.prune_samples_before(metrics_cutoff).await?;
        let snapshots = self.store.prune_snapshots_before(snapshot_cutoff).await?;
        let alerts = self.store.prune_resolved_alerts_before(alert_cutoff).await?;
        let ops = self.store.prune_processed_before(op_cutoff).await?;
        if samples + snapshots + alerts + ops > 0 {
            info!(samples, snapshots, alerts, ops, "retention cleanup removed rows");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mpw_core::{SourceSyncMetadata, StalenessLevel};
    use mpw_storage::{AlertStore, MemoryStore, WatermarkStore};

    fn thresholds() -> StalenessThresholds {
        StalenessThresholds::new(12.0, 24.0, 48.0)
    }

    fn config_with_root(root: &Path) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        config.export_dir = root.to_path_buf();
        config.export_thresholds = thresholds();
        config.webhook_url = None;
        config
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap()
    }

    #[test]
    fn thirty_hour_old_artifact_is_critical() {
        assert_eq!(level_for_age(30.0, &thresholds()), StalenessLevel::Critical);
        assert_eq!(level_for_age(6.0, &thresholds()), StalenessLevel::Ok);
        assert_eq!(level_for_age(12.0, &thresholds()), StalenessLevel::Warning);
        assert_eq!(level_for_age(48.0, &thresholds()), StalenessLevel::Emergency);
    }

    #[test]
    fn health_factor_steps_at_thresholds() {
        let mk = |age: Option<f64>| ArtifactReport {
            name: "export_csv".into(),
            level: StalenessLevel::Ok,
            age_hours: age,
            thresholds: thresholds(),
        };
        assert_eq!(health_factor(&mk(Some(1.0))), 1.0);
        assert_eq!(health_factor(&mk(Some(18.0))), 0.5);
        assert_eq!(health_factor(&mk(Some(30.0))), 0.0);
        assert_eq!(health_factor(&mk(None)), 0.0);
    }

    #[tokio::test]
    async fn missing_artifacts_report_emergency() {
        let tmp = tempfile::tempdir().unwrap();
        let store: SharedStore = Arc::new(MemoryStore::new());
        let config = config_with_root(&tmp.path().join("nowhere"));
        let alerts = Arc::new(AlertEngine::with_channels(store.clone(), Vec::new(), 30, 10));
        let monitor = StalenessMonitor::new(store, alerts, &config);

        let report = monitor.check(now()).await.unwrap();
        assert_eq!(report.overall, StalenessLevel::Emergency);
        assert!(report.artifacts.iter().all(|a| a.age_hours.is_none()));
    }

    #[tokio::test]
    async fn fresh_store_watermark_keeps_store_artifact_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let store: SharedStore = Arc::new(MemoryStore::new());
        store
            .put_watermark(&SourceSyncMetadata {
                source_id: "namus".into(),
                last_sync_time: now() - chrono::Duration::hours(2),
                last_successful_sync: Some(now() - chrono::Duration::hours(2)),
                records_processed: 10,
                records_inserted: 1,
                records_updated: 2,
                records_skipped: 7,
                error_count: 0,
                sync_duration_ms: 900,
            })
            .await
            .unwrap();
        let config = config_with_root(tmp.path());
        let alerts = Arc::new(AlertEngine::with_channels(store.clone(), Vec::new(), 30, 10));
        let monitor = StalenessMonitor::new(store, alerts, &config);

        let report = monitor.check(now()).await.unwrap();
        let case_store = report
            .artifacts
            .iter()
            .find(|a| a.name == "case_store")
            .unwrap();
        assert_eq!(case_store.level, StalenessLevel::Ok);
    }

    #[tokio::test]
    async fn cooldown_leaves_single_active_alert() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let engine = AlertEngine::with_channels(store.clone(), Vec::new(), 30, 10);

        let first = engine
            .raise(
                AlertType::DataStaleness,
                AlertSeverity::High,
                "stale",
                "export stale",
                Some("export_csv".into()),
                json!({}),
                json!({}),
            )
            .await
            .unwrap();
        assert!(first.is_some());

        let second = engine
            .raise(
                AlertType::DataStaleness,
                AlertSeverity::High,
                "stale",
                "export stale",
                Some("export_csv".into()),
                json!({}),
                json!({}),
            )
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(store.active_alerts().await.unwrap().len(), 1);

        // A different source is not in cooldown.
        let other = engine
            .raise(
                AlertType::DataStaleness,
                AlertSeverity::High,
                "stale",
                "store stale",
                Some("case_store".into()),
                json!({}),
                json!({}),
            )
            .await
            .unwrap();
        assert!(other.is_some());
    }

    #[tokio::test]
    async fn hourly_budget_caps_alert_volume() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let engine = AlertEngine::with_channels(store.clone(), Vec::new(), 30, 2);

        for i in 0..4 {
            engine
                .raise(
                    AlertType::SyncFailure,
                    AlertSeverity::Medium,
                    format!("failure {i}"),
                    "sync failed",
                    Some(format!("source-{i}")),
                    json!({}),
                    json!({}),
                )
                .await
                .unwrap();
        }
        assert_eq!(store.active_alerts().await.unwrap().len(), 2);
    }

    struct FailingChannel;

    #[async_trait]
    impl AlertChannel for FailingChannel {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn send(&self, _alert: &Alert) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn channel_failure_never_blocks_other_channels() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let channels: Vec<Box<dyn AlertChannel>> =
            vec![Box::new(FailingChannel), Box::new(ConsoleChannel)];
        let engine = AlertEngine::with_channels(store.clone(), channels, 30, 10);

        let alert = engine
            .raise(
                AlertType::HighErrorRate,
                AlertSeverity::High,
                "errors",
                "error rate elevated",
                Some("namus".into()),
                json!({}),
                json!({}),
            )
            .await
            .unwrap();
        assert!(alert.is_some());
        // The alert row exists regardless of notification outcomes.
        assert_eq!(store.active_alerts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_cycle_writes_health_snapshot_and_alerts() {
        let tmp = tempfile::tempdir().unwrap();
        let store: SharedStore = Arc::new(MemoryStore::new());
        let config = config_with_root(tmp.path());
        let alerts = Arc::new(AlertEngine::with_channels(store.clone(), Vec::new(), 30, 10));
        let monitor = StalenessMonitor::new(store.clone(), alerts, &config);

        let report = monitor.run_cycle(now()).await.unwrap();
        assert_eq!(report.overall, StalenessLevel::Emergency);
        let snap = store.latest_health_snapshot().await.unwrap().unwrap();
        assert_eq!(snap.overall_health_score, 0.0);
        assert!(!store.active_alerts().await.unwrap().is_empty());
    }
}
