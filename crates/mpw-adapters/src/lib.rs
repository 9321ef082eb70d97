//! Source adapter contracts + fixture-first adapter implementations.
//!
//! Adapters turn whatever a source publishes (JSON case rosters, public HTML
//! tables) into raw [`CaseRecord`]s. Parsing is best-effort: a record the
//! adapter cannot fully extract is still returned with whatever fields were
//! recovered, and the overall extraction confidence reflects how much of the
//! payload parsed cleanly. Cleaning and validation happen downstream.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use mpw_core::CaseRecord;
use mpw_storage::HttpFetcher;

pub const CRATE_NAME: &str = "mpw-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Crawlability {
    Api,
    PublicHtml,
    ManualOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Where an adapter reads its payload from. Fixture endpoints make adapters
/// fully testable offline and back the dry-run flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Url(String),
    Fixture(PathBuf),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] mpw_storage::FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Output of one collection pass against a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collected {
    pub records: Vec<CaseRecord>,
    /// Fraction of payload entries that parsed with the identity fields
    /// (case number + name) intact.
    pub extraction_confidence: f64,
    pub response_time_ms: f64,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn crawlability(&self) -> Crawlability;

    /// Collects records changed since `since` when the source supports
    /// incremental queries, otherwise a full snapshot. Repeat-safe; an empty
    /// result is not an error.
    async fn collect(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        since: Option<DateTime<Utc>>,
    ) -> Result<Collected, AdapterError>;
}

/// Fallback identifier for sources that publish entries without case numbers.
pub fn synthesized_case_number(source_id: &str, name: &str, date_missing: Option<NaiveDate>) -> String {
    let seed = format!(
        "{source_id}:{}:{}",
        name.trim().to_lowercase(),
        date_missing.map(|d| d.to_string()).unwrap_or_default()
    );
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes());
    format!("GEN-{}", &id.simple().to_string()[..12])
}

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%B %d, %Y"];

pub fn parse_flexible_date(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Some(d);
        }
    }
    // Timestamps like "2026-03-01T14:00:00Z" reduce to their date part.
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).date_naive())
}

async fn load_endpoint(
    http: &HttpFetcher,
    ctx: &AdapterContext,
    source_id: &str,
    endpoint: &Endpoint,
) -> Result<(String, f64), AdapterError> {
    match endpoint {
        Endpoint::Fixture(path) => {
            let body = fs::read_to_string(path)
                .with_context(|| format!("reading fixture {}", path.display()))?;
            Ok((body, 0.0))
        }
        Endpoint::Url(url) => {
            let resp = http.fetch(ctx.run_id, source_id, url).await?;
            let body = String::from_utf8_lossy(&resp.body).into_owned();
            Ok((body, resp.elapsed_ms))
        }
    }
}

fn keep_since(record: &CaseRecord, since: Option<DateTime<Utc>>) -> bool {
    match (since, record.source_updated_at) {
        (Some(cutoff), Some(updated)) => updated >= cutoff,
        // Without a source timestamp we cannot prove the record is stale.
        _ => true,
    }
}

fn json_str<'a>(value: &'a JsonValue, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(k).and_then(JsonValue::as_str))
}

fn json_f64(value: &JsonValue, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| {
        let v = value.get(k)?;
        v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    })
}

fn json_i32(value: &JsonValue, keys: &[&str]) -> Option<i32> {
    keys.iter().find_map(|k| {
        let v = value.get(k)?;
        v.as_i64()
            .map(|n| n as i32)
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    })
}

fn owned(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Adapter for JSON case rosters of the shape `{"results": [...]}` published
/// by national clearinghouse APIs.
#[derive(Debug, Clone)]
pub struct JsonRosterAdapter {
    source_id: String,
    endpoint: Endpoint,
}

impl JsonRosterAdapter {
    pub fn new(source_id: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            source_id: source_id.into(),
            endpoint,
        }
    }

    pub fn parse(&self, body: &str) -> Result<(Vec<CaseRecord>, f64), AdapterError> {
        let value: JsonValue = serde_json::from_str(body)
            .map_err(|e| AdapterError::Message(format!("invalid roster JSON: {e}")))?;
        let results = value
            .get("results")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::Message("roster JSON missing results array".into()))?;

        let mut records = Vec::with_capacity(results.len());
        let mut complete = 0usize;
        for entry in results {
            let name = owned(json_str(entry, &["full_name", "name", "subject_name"]));
            let date_missing = json_str(entry, &["date_missing", "date_of_last_contact"])
                .and_then(parse_flexible_date);
            let case_number = owned(json_str(entry, &["case_number", "case_id", "id_formatted"]))
                .unwrap_or_else(|| {
                    synthesized_case_number(
                        &self.source_id,
                        name.as_deref().unwrap_or("unknown"),
                        date_missing,
                    )
                });
            if name.is_some() && !case_number.starts_with("GEN-") {
                complete += 1;
            }
            records.push(CaseRecord {
                case_number,
                source_id: self.source_id.clone(),
                name,
                age: json_i32(entry, &["age", "missing_age", "computed_age"]),
                gender: owned(json_str(entry, &["gender", "sex"])),
                ethnicity: owned(json_str(entry, &["ethnicity", "race"])),
                city: owned(json_str(entry, &["city", "city_of_last_contact"])),
                county: owned(json_str(entry, &["county"])),
                state: owned(json_str(entry, &["state", "state_of_last_contact"])),
                latitude: json_f64(entry, &["latitude", "lat"]),
                longitude: json_f64(entry, &["longitude", "lon", "lng"]),
                date_missing,
                date_reported: json_str(entry, &["date_reported"]).and_then(parse_flexible_date),
                status: owned(json_str(entry, &["status"])),
                category: owned(json_str(entry, &["category", "case_type"])),
                description: owned(json_str(entry, &["description", "circumstances"])),
                contact_phone: owned(json_str(entry, &["contact_phone", "phone"])),
                contact_email: owned(json_str(entry, &["contact_email", "email"])),
                source_updated_at: json_str(entry, &["last_updated", "modified_at"])
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
            });
        }

        let confidence = if records.is_empty() {
            1.0
        } else {
            complete as f64 / records.len() as f64
        };
        Ok((records, confidence))
    }
}

#[async_trait]
impl SourceAdapter for JsonRosterAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    async fn collect(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        since: Option<DateTime<Utc>>,
    ) -> Result<Collected, AdapterError> {
        let (body, response_time_ms) = load_endpoint(http, ctx, &self.source_id, &self.endpoint).await?;
        let (mut records, extraction_confidence) = self.parse(&body)?;
        records.retain(|r| keep_since(r, since));
        Ok(Collected {
            records,
            extraction_confidence,
            response_time_ms,
        })
    }
}

/// Adapter for public-HTML case rosters rendered as a table, one row per
/// case with `data-field`-free positional cells.
#[derive(Debug, Clone)]
pub struct HtmlRosterAdapter {
    source_id: String,
    endpoint: Endpoint,
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn cell_text(cells: &[String], idx: usize) -> Option<String> {
    cells.get(idx).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl HtmlRosterAdapter {
    pub fn new(source_id: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            source_id: source_id.into(),
            endpoint,
        }
    }

    /// Expected column order: case number, name, age, city, state,
    /// date missing, status. Rows missing trailing cells still parse.
    pub fn parse(&self, body: &str) -> Result<(Vec<CaseRecord>, f64), AdapterError> {
        let document = Html::parse_document(body);
        let row_sel = selector("table tbody tr")?;
        let cell_sel = selector("td")?;

        let mut records = Vec::new();
        let mut complete = 0usize;
        let mut rows = 0usize;
        for row in document.select(&row_sel) {
            rows += 1;
            let cells: Vec<String> = row
                .select(&cell_sel)
                .map(|c| c.text().collect::<String>())
                .collect();
            if cells.is_empty() {
                continue;
            }
            let name = cell_text(&cells, 1);
            let date_missing = cell_text(&cells, 5).and_then(|s| parse_flexible_date(&s));
            let case_number = cell_text(&cells, 0).unwrap_or_else(|| {
                synthesized_case_number(
                    &self.source_id,
                    name.as_deref().unwrap_or("unknown"),
                    date_missing,
                )
            });
            if name.is_some() && !case_number.starts_with("GEN-") && date_missing.is_some() {
                complete += 1;
            }
            records.push(CaseRecord {
                case_number,
                source_id: self.source_id.clone(),
                name,
                age: cell_text(&cells, 2).and_then(|s| s.parse().ok()),
                city: cell_text(&cells, 3),
                state: cell_text(&cells, 4),
                date_missing,
                status: cell_text(&cells, 6),
                ..Default::default()
            });
        }

        let confidence = if rows == 0 {
            0.0
        } else {
            complete as f64 / rows as f64
        };
        Ok((records, confidence))
    }
}

#[async_trait]
impl SourceAdapter for HtmlRosterAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::PublicHtml
    }

    async fn collect(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        since: Option<DateTime<Utc>>,
    ) -> Result<Collected, AdapterError> {
        let (body, response_time_ms) = load_endpoint(http, ctx, &self.source_id, &self.endpoint).await?;
        let (mut records, extraction_confidence) = self.parse(&body)?;
        // HTML rosters carry no per-row modification stamps; `since` only
        // applies when a row happens to carry one.
        records.retain(|r| keep_since(r, since));
        Ok(Collected {
            records,
            extraction_confidence,
            response_time_ms,
        })
    }
}

/// Builds the adapter for a registry entry. `kind` comes from sources.yaml.
pub fn adapter_for_source(
    source_id: &str,
    kind: &str,
    endpoint: Endpoint,
) -> Option<Box<dyn SourceAdapter>> {
    match kind {
        "json_roster" => Some(Box::new(JsonRosterAdapter::new(source_id, endpoint))),
        "html_roster" => Some(Box::new(HtmlRosterAdapter::new(source_id, endpoint))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROSTER_JSON: &str = r#"{
      "count": 3,
      "results": [
        {
          "case_number": "MP-4410",
          "full_name": "Maria Delgado",
          "age": 16,
          "sex": "Female",
          "city": "Tucson",
          "state": "AZ",
          "latitude": 32.22,
          "longitude": -110.97,
          "date_missing": "2026-02-11",
          "status": "active",
          "circumstances": "Last seen near school.",
          "contact_phone": "520-555-0100",
          "last_updated": "2026-02-20T08:30:00Z"
        },
        {
          "full_name": "Robert Hale",
          "age": "44",
          "sex": "Male",
          "city": "Flagstaff",
          "state": "AZ",
          "date_missing": "01/05/2026",
          "status": "active"
        },
        {
          "case_number": "MP-4411",
          "age": 30,
          "state": "AZ"
        }
      ]
    }"#;

    const ROSTER_HTML: &str = r#"<html><body>
      <table>
        <thead><tr><th>Case</th><th>Name</th><th>Age</th><th>City</th><th>State</th><th>Missing Since</th><th>Status</th></tr></thead>
        <tbody>
          <tr><td>FL-2026-001</td><td>Denise Carter</td><td>34</td><td>Ocala</td><td>FL</td><td>2026-01-18</td><td>Active</td></tr>
          <tr><td>FL-2026-002</td><td>Tyler Nguyen</td><td>12</td><td>Miami</td><td>FL</td><td>02/02/2026</td><td>Active</td></tr>
          <tr><td></td><td>Unknown Row</td><td></td><td></td><td></td><td></td><td></td></tr>
        </tbody>
      </table>
    </body></html>"#;

    #[test]
    fn json_roster_parses_records_and_scores_confidence() {
        let adapter = JsonRosterAdapter::new("namus", Endpoint::Fixture(PathBuf::new()));
        let (records, confidence) = adapter.parse(ROSTER_JSON).unwrap();
        assert_eq!(records.len(), 3);

        let maria = &records[0];
        assert_eq!(maria.case_number, "MP-4410");
        assert_eq!(maria.name.as_deref(), Some("Maria Delgado"));
        assert_eq!(maria.age, Some(16));
        assert_eq!(maria.latitude, Some(32.22));
        assert_eq!(
            maria.date_missing,
            Some(NaiveDate::from_ymd_opt(2026, 2, 11).unwrap())
        );
        assert!(maria.source_updated_at.is_some());

        // Second record has no case number, so one is synthesized.
        assert!(records[1].case_number.starts_with("GEN-"));
        assert_eq!(records[1].age, Some(44));

        // 1 of 3 entries carried both identity fields.
        assert!((confidence - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn json_roster_rejects_malformed_payload() {
        let adapter = JsonRosterAdapter::new("namus", Endpoint::Fixture(PathBuf::new()));
        assert!(adapter.parse("{\"rows\": []}").is_err());
        assert!(adapter.parse("not json").is_err());
    }

    #[test]
    fn html_roster_parses_table_rows() {
        let adapter = HtmlRosterAdapter::new("fl_mepic", Endpoint::Fixture(PathBuf::new()));
        let (records, confidence) = adapter.parse(ROSTER_HTML).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].case_number, "FL-2026-001");
        assert_eq!(records[0].name.as_deref(), Some("Denise Carter"));
        assert_eq!(records[0].state.as_deref(), Some("FL"));
        assert_eq!(
            records[1].date_missing,
            Some(NaiveDate::from_ymd_opt(2026, 2, 2).unwrap())
        );
        assert!(records[2].case_number.starts_with("GEN-"));
        assert!((confidence - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn synthesized_case_numbers_are_deterministic() {
        let d = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let a = synthesized_case_number("az_dps", "Robert Hale", Some(d));
        let b = synthesized_case_number("az_dps", " robert hale ", Some(d));
        let c = synthesized_case_number("az_dps", "Robert Hale", None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn flexible_dates_accept_common_formats() {
        let expected = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        for text in ["2026-03-01", "03/01/2026", "03-01-2026", "March 1, 2026", "2026-03-01T10:00:00Z"] {
            assert_eq!(parse_flexible_date(text), Some(expected), "failed for {text}");
        }
        assert_eq!(parse_flexible_date("  "), None);
        assert_eq!(parse_flexible_date("sometime last year"), None);
    }

    #[test]
    fn registry_builds_known_kinds() {
        assert!(adapter_for_source("namus", "json_roster", Endpoint::Url("http://x".into())).is_some());
        assert!(adapter_for_source("fl", "html_roster", Endpoint::Url("http://x".into())).is_some());
        assert!(adapter_for_source("x", "rss", Endpoint::Url("http://x".into())).is_none());
    }
}
