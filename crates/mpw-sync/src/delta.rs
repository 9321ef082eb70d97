//! Change detection and queue processing between source snapshots and the
//! canonical case table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use mpw_core::{CaseRecord, SyncOp, SyncOperation};
use mpw_storage::{CaseStore, Store, StoreError, SyncQueueStore};

fn norm_text(s: &str) -> String {
    s.trim().to_lowercase()
}

fn content_map(record: &CaseRecord) -> BTreeMap<&'static str, String> {
    let mut map = BTreeMap::new();
    let mut put = |key: &'static str, value: Option<String>| {
        if let Some(v) = value {
            map.insert(key, v);
        }
    };
    put("name", record.name.as_deref().map(norm_text));
    put("age", record.age.map(|a| a.to_string()));
    put("gender", record.gender.as_deref().map(norm_text));
    put("ethnicity", record.ethnicity.as_deref().map(norm_text));
    put("city", record.city.as_deref().map(norm_text));
    put("county", record.county.as_deref().map(norm_text));
    put("state", record.state.as_deref().map(norm_text));
    put("latitude", record.latitude.map(|v| v.to_string()));
    put("longitude", record.longitude.map(|v| v.to_string()));
    put("date_missing", record.date_missing.map(|d| d.to_string()));
    put("date_reported", record.date_reported.map(|d| d.to_string()));
    put("status", record.status.as_deref().map(norm_text));
    put("category", record.category.as_deref().map(norm_text));
    put("description", record.description.as_deref().map(norm_text));
    put("contact_phone", record.contact_phone.as_deref().map(norm_text));
    put("contact_email", record.contact_email.as_deref().map(norm_text));
    map
}

/// Content hash over the normalized projection of a record. Bookkeeping
/// fields (identity, source timestamps) are excluded so refetching unchanged
/// data hashes identically.
pub fn record_hash(record: &CaseRecord) -> String {
    let map = content_map(record);
    // BTreeMap gives a stable key order, so the JSON text is canonical.
    let json = serde_json::to_string(&map).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}

fn changed_fields(new: &CaseRecord, old: &CaseRecord) -> Vec<&'static str> {
    let new_map = content_map(new);
    let old_map = content_map(old);
    let mut changed = Vec::new();
    for key in new_map.keys().chain(old_map.keys()) {
        if new_map.get(key) != old_map.get(key) && !changed.contains(key) {
            changed.push(*key);
        }
    }
    changed
}

const RESOLVED_STATUSES: [&str; 3] = ["found", "deceased", "located"];

fn update_priority(changed: &[&str], new: &CaseRecord) -> i16 {
    if changed.contains(&"status") {
        let resolved = new
            .status
            .as_deref()
            .map(|s| RESOLVED_STATUSES.contains(&norm_text(s).as_str()))
            .unwrap_or(false);
        return if resolved { 1 } else { 2 };
    }
    if changed.contains(&"contact_phone") || changed.contains(&"contact_email") {
        return 2;
    }
    if ["city", "county", "state", "latitude", "longitude"]
        .iter()
        .any(|f| changed.contains(f))
    {
        return 3;
    }
    4
}

fn update_confidence(new: &CaseRecord, old: &CaseRecord) -> f64 {
    let mut confidence = 0.8;
    if let (Some(n), Some(o)) = (new.source_updated_at, old.source_updated_at) {
        if n > o {
            confidence += 0.15;
        }
    }
    let mut matches = 0;
    if new.name.as_deref().map(norm_text) == old.name.as_deref().map(norm_text) {
        matches += 1;
    }
    if new.age == old.age {
        matches += 1;
    }
    if new.gender.as_deref().map(norm_text) == old.gender.as_deref().map(norm_text) {
        matches += 1;
    }
    confidence += (matches as f64 / 3.0) * 0.1;
    confidence.min(1.0)
}

#[derive(Debug, Clone, Copy)]
pub struct DeltaConfig {
    pub priority_threshold: i16,
    pub min_confidence: f64,
    pub batch_limit: i64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            priority_threshold: 3,
            min_confidence: 0.7,
            batch_limit: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeltaEngine {
    config: DeltaConfig,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct QueueReport {
    pub claimed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl DeltaEngine {
    pub fn new(config: DeltaConfig) -> Self {
        Self { config }
    }

    /// Compares one incoming record against its stored counterpart and
    /// produces the sync operation describing the difference.
    pub fn analyze(
        &self,
        record: &CaseRecord,
        existing: Option<&CaseRecord>,
        now: DateTime<Utc>,
    ) -> SyncOperation {
        let source_hash = record_hash(record);
        let mut op = SyncOperation {
            id: Uuid::new_v4(),
            source_id: record.source_id.clone(),
            case_id: record.case_key(),
            op: SyncOp::Insert,
            record: record.clone(),
            source_hash,
            existing_hash: None,
            confidence: 1.0,
            priority: 2,
            reason: "new case".into(),
            created_at: now,
            processed_at: None,
            result: None,
            error: None,
        };

        let Some(old) = existing else {
            return op;
        };

        let existing_hash = record_hash(old);
        op.existing_hash = Some(existing_hash.clone());

        if existing_hash == op.source_hash {
            op.op = SyncOp::Skip;
            op.priority = 5;
            op.confidence = 1.0;
            op.reason = "no changes detected".into();
            return op;
        }

        let changed = changed_fields(record, old);
        let shown = changed
            .iter()
            .take(3)
            .copied()
            .collect::<Vec<_>>()
            .join(", ");
        op.op = SyncOp::Update;
        op.priority = update_priority(&changed, record);
        op.confidence = update_confidence(record, old);
        op.reason = if changed.len() > 3 {
            format!("changed: {shown} (+{} more)", changed.len() - 3)
        } else {
            format!("changed: {shown}")
        };
        op
    }

    /// Claims one batch of pending operations and applies them through the
    /// idempotent case upsert. Each operation's outcome lands exactly once;
    /// failures never abort the batch and are never auto-retried.
    pub async fn process_queue(&self, store: &dyn Store) -> Result<QueueReport, StoreError> {
        let batch = store
            .pending_batch(
                self.config.priority_threshold,
                self.config.min_confidence,
                self.config.batch_limit,
            )
            .await?;

        let mut report = QueueReport {
            claimed: batch.len(),
            ..QueueReport::default()
        };

        for op in batch {
            match op.op {
                SyncOp::Insert | SyncOp::Update => match store.upsert_case(&op.record).await {
                    Ok(true) => {
                        report.inserted += 1;
                        store.mark_processed(op.id, Some("inserted"), None).await?;
                    }
                    Ok(false) => {
                        report.updated += 1;
                        store.mark_processed(op.id, Some("updated"), None).await?;
                    }
                    Err(err) => {
                        report.failed += 1;
                        warn!(case_id = %op.case_id, error = %err, "applying sync operation failed");
                        store
                            .mark_processed(op.id, None, Some(&err.to_string()))
                            .await?;
                    }
                },
                SyncOp::Delete | SyncOp::Skip => {
                    // Sources never retract cases; queued deletes and skips
                    // are closed out without touching the case table.
                    report.ignored += 1;
                    store.mark_processed(op.id, Some("ignored"), None).await?;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mpw_storage::{CaseStore, MemoryStore, SyncQueueStore};

    fn base_record() -> CaseRecord {
        CaseRecord {
            case_number: "MP-4410".into(),
            source_id: "namus".into(),
            name: Some("Maria Delgado".into()),
            age: Some(16),
            gender: Some("female".into()),
            city: Some("Tucson".into()),
            state: Some("AZ".into()),
            status: Some("active".into()),
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn hash_ignores_case_and_whitespace() {
        let a = base_record();
        let mut b = base_record();
        b.name = Some("  MARIA delgado ".into());
        b.city = Some("TUCSON".into());
        assert_eq!(record_hash(&a), record_hash(&b));
    }

    #[test]
    fn hash_ignores_bookkeeping_fields() {
        let a = base_record();
        let mut b = base_record();
        b.source_updated_at = Some(now());
        b.case_number = "OTHER-1".into();
        assert_eq!(record_hash(&a), record_hash(&b));
    }

    #[test]
    fn new_case_inserts_at_priority_two() {
        let engine = DeltaEngine::new(DeltaConfig::default());
        let op = engine.analyze(&base_record(), None, now());
        assert_eq!(op.op, SyncOp::Insert);
        assert_eq!(op.priority, 2);
        assert_eq!(op.confidence, 1.0);
    }

    #[test]
    fn identical_refetch_skips_with_full_confidence() {
        let engine = DeltaEngine::new(DeltaConfig::default());
        let existing = base_record();
        let op = engine.analyze(&base_record(), Some(&existing), now());
        assert_eq!(op.op, SyncOp::Skip);
        assert_eq!(op.priority, 5);
        assert_eq!(op.confidence, 1.0);
        assert_eq!(op.existing_hash.as_deref(), Some(op.source_hash.as_str()));
    }

    #[test]
    fn resolution_outranks_contact_outranks_location() {
        let engine = DeltaEngine::new(DeltaConfig::default());
        let existing = base_record();

        let mut resolved = base_record();
        resolved.status = Some("found".into());
        let resolved_op = engine.analyze(&resolved, Some(&existing), now());
        assert_eq!(resolved_op.priority, 1);

        let mut contact = base_record();
        contact.contact_phone = Some("520-555-0100".into());
        let contact_op = engine.analyze(&contact, Some(&existing), now());
        assert_eq!(contact_op.priority, 2);

        let mut moved = base_record();
        moved.city = Some("Phoenix".into());
        let moved_op = engine.analyze(&moved, Some(&existing), now());
        assert_eq!(moved_op.priority, 3);
        assert!(contact_op.priority <= moved_op.priority);

        let mut cosmetic = base_record();
        cosmetic.description = Some("Updated circumstances.".into());
        assert_eq!(engine.analyze(&cosmetic, Some(&existing), now()).priority, 4);
    }

    #[test]
    fn update_confidence_rewards_newer_data_and_identity_match() {
        let engine = DeltaEngine::new(DeltaConfig::default());
        let mut existing = base_record();
        existing.source_updated_at = Some(now() - chrono::Duration::days(2));

        let mut update = base_record();
        update.city = Some("Phoenix".into());
        update.source_updated_at = Some(now());
        let op = engine.analyze(&update, Some(&existing), now());
        // 0.8 + 0.15 newer + 3/3 identity * 0.1, capped.
        assert_eq!(op.confidence, 1.0);

        let mut renamed = update.clone();
        renamed.name = Some("Maria D.".into());
        renamed.age = None;
        let op = engine.analyze(&renamed, Some(&existing), now());
        assert!((op.confidence - (0.8 + 0.15 + 0.1 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn reason_lists_first_three_changed_fields() {
        let engine = DeltaEngine::new(DeltaConfig::default());
        let existing = base_record();
        let mut update = base_record();
        update.age = Some(17);
        update.city = Some("Phoenix".into());
        update.state = Some("NV".into());
        update.description = Some("x".into());
        let op = engine.analyze(&update, Some(&existing), now());
        assert!(op.reason.starts_with("changed: "));
        assert!(op.reason.contains("+1 more"), "reason: {}", op.reason);
    }

    #[tokio::test]
    async fn queue_processing_applies_in_order_so_latest_wins() {
        let engine = DeltaEngine::new(DeltaConfig::default());
        let store = MemoryStore::new();

        let mut first = base_record();
        first.city = Some("Phoenix".into());
        let mut op1 = engine.analyze(&first, None, now());
        op1.created_at = now();

        let mut second = base_record();
        second.city = Some("Flagstaff".into());
        let mut op2 = engine.analyze(&second, Some(&first), now());
        op2.created_at = now() + chrono::Duration::minutes(1);

        store.enqueue(&op1).await.unwrap();
        store.enqueue(&op2).await.unwrap();

        let report = engine.process_queue(&store).await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 0);

        let cases = store.cases_for_source("namus").await.unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].city.as_deref(), Some("Flagstaff"));
    }

    #[tokio::test]
    async fn low_priority_ops_stay_queued() {
        let engine = DeltaEngine::new(DeltaConfig::default());
        let store = MemoryStore::new();
        let existing = base_record();
        let mut cosmetic = base_record();
        cosmetic.description = Some("minor edit".into());
        let op = engine.analyze(&cosmetic, Some(&existing), now());
        assert_eq!(op.priority, 4);
        store.enqueue(&op).await.unwrap();

        let report = engine.process_queue(&store).await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }
}
