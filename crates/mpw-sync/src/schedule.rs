//! Adaptive polling recommendations from weighted source metrics.

use chrono::{DateTime, Timelike, Utc};
use serde_json::json;
use tracing::warn;

use mpw_core::{ActivityPattern, FrequencyTier, ScheduleRecommendation, SourceMetrics};
use mpw_storage::{MetricsStore, ScheduleStore, Store};

use crate::config::SyncConfig;
use crate::pattern::PatternAnalyzer;

// Signed factor weights; negative factors push toward slower polling.
const W_ACTIVITY: f64 = 0.25;
const W_CHANGE: f64 = 0.20;
const W_URGENCY: f64 = 0.20;
const W_ERROR: f64 = -0.15;
const W_RESPONSE: f64 = -0.10;
const W_LOAD: f64 = -0.10;

fn pattern_multiplier(pattern: ActivityPattern) -> f64 {
    match pattern {
        ActivityPattern::Burst => 1.3,
        ActivityPattern::Steady => 1.0,
        ActivityPattern::Periodic => 0.9,
        ActivityPattern::Sporadic => 0.7,
        ActivityPattern::Dormant => 0.5,
    }
}

fn tier_for_score(score: f64) -> FrequencyTier {
    if score >= 0.8 {
        FrequencyTier::Critical
    } else if score >= 0.6 {
        FrequencyTier::High
    } else if score >= 0.4 {
        FrequencyTier::Normal
    } else if score >= 0.2 {
        FrequencyTier::Low
    } else {
        FrequencyTier::Minimal
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    pub system_load: f64,
    pub analyzer: PatternAnalyzer,
}

impl Scheduler {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            system_load: config.system_load,
            analyzer: PatternAnalyzer {
                window_hours: config.learning_window_hours,
                min_samples: config.min_samples,
            },
        }
    }

    /// Produces the scheduling decision for one source from its derived
    /// metrics. The interval always lands inside the chosen tier's bounds,
    /// peak-hour acceleration included.
    pub fn recommend(&self, metrics: &SourceMetrics, now: DateTime<Utc>) -> ScheduleRecommendation {
        let activity = (metrics.avg_records_per_hour / 100.0).clamp(0.0, 1.0);
        let change = (metrics.change_rate * 10.0).clamp(0.0, 1.0);
        let urgency = metrics.urgency_score.clamp(0.0, 1.0);
        let error = (metrics.error_rate * 10.0).clamp(0.0, 1.0);
        let response = (metrics.response_time_avg / 1000.0).clamp(0.0, 1.0);
        let load = self.system_load.clamp(0.0, 1.0);

        let weighted = W_ACTIVITY * activity
            + W_CHANGE * change
            + W_URGENCY * urgency
            + W_ERROR * error
            + W_RESPONSE * response
            + W_LOAD * load;
        let multiplier = pattern_multiplier(metrics.activity_pattern);
        let score = (weighted * multiplier).clamp(0.0, 1.0);

        let tier = tier_for_score(score);
        let (min, max) = tier.bounds();
        let mut interval = min as f64 + (max - min) as f64 * (1.0 - score);
        if metrics.peak_hours.contains(&now.hour()) {
            interval *= 0.7;
        }
        let interval_minutes = (interval.round() as i64).clamp(min, max);

        let mut reasons = Vec::new();
        if activity > 0.7 {
            reasons.push("high activity");
        }
        if change > 0.5 {
            reasons.push("frequent changes");
        }
        if urgency > 0.7 {
            reasons.push("urgent cases present");
        }
        if error > 0.3 {
            reasons.push("elevated error rate");
        }
        let reason = if reasons.is_empty() {
            "standard monitoring".to_string()
        } else {
            reasons.join(", ")
        };

        ScheduleRecommendation {
            source_id: metrics.source_id.clone(),
            tier,
            interval_minutes,
            next_run_at: now + chrono::Duration::minutes(interval_minutes),
            reason,
            confidence: (score + 0.2).min(1.0),
            factors: json!({
                "activity": activity,
                "change_rate": change,
                "urgency": urgency,
                "error_rate": error,
                "response_time": response,
                "system_load": load,
                "pattern": metrics.activity_pattern.as_str(),
                "pattern_multiplier": multiplier,
                "score": score,
            }),
            created_at: now,
        }
    }

    /// Safe decision used when metric analysis for a source fails: the
    /// source stays scheduled at a middling cadence instead of going dark.
    pub fn fallback(&self, source_id: &str, now: DateTime<Utc>) -> ScheduleRecommendation {
        ScheduleRecommendation {
            source_id: source_id.to_string(),
            tier: FrequencyTier::Normal,
            interval_minutes: 240,
            next_run_at: now + chrono::Duration::minutes(240),
            reason: "analysis unavailable".into(),
            confidence: 0.5,
            factors: json!({}),
            created_at: now,
        }
    }

    /// Refreshes recommendations for the given sources. Analysis failures
    /// are isolated per source and replaced with the fallback decision.
    pub async fn update_all(
        &self,
        store: &dyn Store,
        source_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecommendation>, mpw_storage::StoreError> {
        let since = now - chrono::Duration::hours(self.analyzer.window_hours);
        let mut out = Vec::with_capacity(source_ids.len());
        for source_id in source_ids {
            let rec = match store.samples_since(source_id, since).await {
                Ok(samples) if samples.len() >= self.analyzer.min_samples => {
                    let metrics = self.analyzer.analyze(source_id, &samples, now);
                    self.recommend(&metrics, now)
                }
                Ok(_) => self.fallback(source_id, now),
                Err(err) => {
                    warn!(source_id, error = %err, "metric query failed; using fallback schedule");
                    self.fallback(source_id, now)
                }
            };
            store.save_recommendation(&rec).await?;
            out.push(rec);
        }
        Ok(out)
    }
}
