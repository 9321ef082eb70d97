//! Activity pattern analysis over a source's metric history.

use chrono::{DateTime, Timelike, Utc};

use mpw_core::{ActivityPattern, SourceMetricSample, SourceMetrics};

#[derive(Debug, Clone, Copy)]
pub struct PatternAnalyzer {
    /// How far back the learning window reaches, in hours.
    pub window_hours: i64,
    /// Below this sample count the analyzer refuses to classify.
    pub min_samples: usize,
}

impl Default for PatternAnalyzer {
    fn default() -> Self {
        Self {
            window_hours: 168,
            min_samples: 10,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn classify(hourly: &[f64; 24]) -> ActivityPattern {
    let total: f64 = hourly.iter().sum();
    if total < 10.0 {
        return ActivityPattern::Dormant;
    }

    let avg = total / 24.0;
    let sd = std_dev(hourly, avg);
    let cv = if avg > 0.0 { sd / avg } else { 0.0 };
    let max = hourly.iter().cloned().fold(0.0_f64, f64::max);

    if cv > 2.0 {
        return if max > 5.0 * avg {
            ActivityPattern::Burst
        } else {
            ActivityPattern::Sporadic
        };
    }
    if cv < 0.5 {
        return ActivityPattern::Steady;
    }
    let above_average = hourly.iter().filter(|v| **v > avg).count();
    if (6..=12).contains(&above_average) {
        ActivityPattern::Periodic
    } else {
        ActivityPattern::Steady
    }
}

impl PatternAnalyzer {
    /// Derives a metrics view for one source. With fewer than `min_samples`
    /// observations the result is the conservative default: sporadic, zero
    /// activity, zero urgency.
    pub fn analyze(
        &self,
        source_id: &str,
        samples: &[SourceMetricSample],
        now: DateTime<Utc>,
    ) -> SourceMetrics {
        let cutoff = now - chrono::Duration::hours(self.window_hours);
        let recent: Vec<&SourceMetricSample> =
            samples.iter().filter(|s| s.timestamp >= cutoff).collect();

        if recent.len() < self.min_samples {
            return SourceMetrics {
                source_id: source_id.to_string(),
                avg_records_per_hour: 0.0,
                change_rate: 0.0,
                error_rate: 0.0,
                response_time_avg: 0.0,
                activity_pattern: ActivityPattern::Sporadic,
                peak_hours: Vec::new(),
                last_significant_update: None,
                urgency_score: 0.0,
                sample_count: recent.len(),
            };
        }

        let total_processed: u64 = recent.iter().map(|s| s.records_processed as u64).sum();
        let total_changed: u64 = recent.iter().map(|s| s.records_changed as u64).sum();
        let total_errors: u64 = recent.iter().map(|s| s.errors_count as u64).sum();

        let mut hourly = [0.0_f64; 24];
        for sample in &recent {
            hourly[sample.timestamp.hour() as usize] += sample.records_changed as f64;
        }

        let max_bucket = hourly.iter().cloned().fold(0.0_f64, f64::max);
        let peak_hours: Vec<u32> = if max_bucket > 0.0 {
            (0..24u32)
                .filter(|h| hourly[*h as usize] >= 0.75 * max_bucket)
                .collect()
        } else {
            Vec::new()
        };

        let response_times: Vec<f64> = recent.iter().map(|s| s.response_time_ms).collect();
        let urgencies: Vec<f64> = recent.iter().map(|s| s.urgency_score).collect();

        SourceMetrics {
            source_id: source_id.to_string(),
            avg_records_per_hour: total_processed as f64 / self.window_hours as f64,
            change_rate: if total_processed > 0 {
                total_changed as f64 / total_processed as f64
            } else {
                0.0
            },
            error_rate: if total_processed > 0 {
                total_errors as f64 / total_processed as f64
            } else if total_errors > 0 {
                1.0
            } else {
                0.0
            },
            response_time_avg: mean(&response_times),
            activity_pattern: classify(&hourly),
            peak_hours,
            last_significant_update: recent
                .iter()
                .filter(|s| s.records_changed > 0)
                .map(|s| s.timestamp)
                .max(),
            urgency_score: mean(&urgencies).clamp(0.0, 1.0),
            sample_count: recent.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap()
    }

    fn sample(hours_ago: i64, processed: u32, changed: u32, errors: u32) -> SourceMetricSample {
        SourceMetricSample {
            source_id: "namus".into(),
            timestamp: now() - chrono::Duration::hours(hours_ago),
            records_processed: processed,
            records_changed: changed,
            errors_count: errors,
            response_time_ms: 400.0,
            urgency_score: 0.2,
            system_load: 0.3,
        }
    }

    #[test]
    fn too_little_history_yields_conservative_default() {
        let analyzer = PatternAnalyzer::default();
        let samples: Vec<SourceMetricSample> = (0..5).map(|i| sample(i, 10, 2, 0)).collect();
        let metrics = analyzer.analyze("namus", &samples, now());
        assert_eq!(metrics.activity_pattern, ActivityPattern::Sporadic);
        assert_eq!(metrics.urgency_score, 0.0);
        assert_eq!(metrics.avg_records_per_hour, 0.0);
        assert_eq!(metrics.sample_count, 5);
    }

    #[test]
    fn samples_outside_window_are_ignored() {
        let analyzer = PatternAnalyzer::default();
        let mut samples: Vec<SourceMetricSample> = (0..12).map(|i| sample(i, 10, 2, 0)).collect();
        // Ancient history should not count toward the minimum.
        samples.extend((0..20).map(|i| sample(200 + i, 100, 50, 0)));
        let metrics = analyzer.analyze("namus", &samples, now());
        assert_eq!(metrics.sample_count, 12);
        assert!((metrics.change_rate - 0.2).abs() < 1e-9);
    }

    #[test]
    fn steady_activity_classifies_steady() {
        let analyzer = PatternAnalyzer::default();
        // Uniform changes around the clock.
        let samples: Vec<SourceMetricSample> = (0..48).map(|i| sample(i, 20, 5, 0)).collect();
        let metrics = analyzer.analyze("namus", &samples, now());
        assert_eq!(metrics.activity_pattern, ActivityPattern::Steady);
        assert!(metrics.peak_hours.len() >= 12);
    }

    #[test]
    fn single_spike_classifies_burst() {
        let analyzer = PatternAnalyzer::default();
        let mut samples: Vec<SourceMetricSample> = (0..24).map(|i| sample(i, 5, 0, 0)).collect();
        samples.push(sample(2, 300, 120, 0));
        let metrics = analyzer.analyze("namus", &samples, now());
        assert_eq!(metrics.activity_pattern, ActivityPattern::Burst);
        let spike_hour = (now() - chrono::Duration::hours(2)).hour();
        assert_eq!(metrics.peak_hours, vec![spike_hour]);
    }

    #[test]
    fn no_changes_classifies_dormant() {
        let analyzer = PatternAnalyzer::default();
        let samples: Vec<SourceMetricSample> = (0..24).map(|i| sample(i, 50, 0, 0)).collect();
        let metrics = analyzer.analyze("namus", &samples, now());
        assert_eq!(metrics.activity_pattern, ActivityPattern::Dormant);
        assert!(metrics.peak_hours.is_empty());
        assert!(metrics.last_significant_update.is_none());
    }

    #[test]
    fn error_rate_reflects_failed_share() {
        let analyzer = PatternAnalyzer::default();
        let samples: Vec<SourceMetricSample> = (0..20).map(|i| sample(i, 10, 5, 1)).collect();
        let metrics = analyzer.analyze("namus", &samples, now());
        assert!((metrics.error_rate - 0.1).abs() < 1e-9);
        assert!(metrics.last_significant_update.is_some());
    }
}
