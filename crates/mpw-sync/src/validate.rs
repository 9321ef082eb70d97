//! Record cleaning, weighted validation and completeness scoring.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate, Utc};
use serde::Serialize;

use mpw_core::CaseRecord;

/// Outcome of validating one record. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub quality_score: f64,
    pub completeness: f64,
    pub field_completeness: BTreeMap<&'static str, bool>,
}

const US_STATES: [&str; 51] = [
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "DC", "FL", "GA", "HI", "ID", "IL", "IN",
    "IA", "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH",
    "NJ", "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT",
    "VT", "VA", "WA", "WV", "WI", "WY",
];

// Continental US bounding box.
const LAT_RANGE: (f64, f64) = (24.0, 49.0);
const LON_RANGE: (f64, f64) = (-125.0, -66.0);

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn clean_text(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Normalizes a raw adapter record into canonical form. Deterministic:
/// cleaning an already-clean record is a no-op.
pub fn clean_record(record: &CaseRecord) -> CaseRecord {
    let mut out = record.clone();
    out.case_number = record.case_number.trim().to_uppercase();
    out.name = clean_text(&record.name).map(|s| title_case(&s));
    out.city = clean_text(&record.city).map(|s| title_case(&s));
    out.county = clean_text(&record.county).map(|s| title_case(&s));
    out.state = clean_text(&record.state).map(|s| s.to_uppercase());
    out.status = clean_text(&record.status).map(|s| s.to_lowercase());
    out.gender = clean_text(&record.gender).map(|s| s.to_lowercase());
    out.ethnicity = clean_text(&record.ethnicity);
    out.category = clean_text(&record.category).map(|s| s.to_lowercase());
    out.description = clean_text(&record.description);
    out.contact_phone = clean_text(&record.contact_phone);
    out.contact_email = clean_text(&record.contact_email).map(|s| s.to_lowercase());
    out
}

fn case_number_well_formed(case_number: &str) -> bool {
    !case_number.is_empty()
        && case_number
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn date_sane(date: NaiveDate) -> bool {
    let year = date.year();
    year >= 1900 && year <= Utc::now().year() + 1
}

/// Fields counted toward completeness, in reporting order.
const COMPLETENESS_FIELDS: [&str; 10] = [
    "name",
    "age",
    "gender",
    "ethnicity",
    "city",
    "state",
    "date_missing",
    "latitude",
    "longitude",
    "description",
];

pub fn field_completeness(record: &CaseRecord) -> BTreeMap<&'static str, bool> {
    let mut map = BTreeMap::new();
    for field in COMPLETENESS_FIELDS {
        let present = match field {
            "name" => record.name.is_some(),
            "age" => record.age.is_some(),
            "gender" => record.gender.is_some(),
            "ethnicity" => record.ethnicity.is_some(),
            "city" => record.city.is_some(),
            "state" => record.state.is_some(),
            "date_missing" => record.date_missing.is_some(),
            "latitude" => record.latitude.is_some(),
            "longitude" => record.longitude.is_some(),
            "description" => record.description.is_some(),
            _ => false,
        };
        map.insert(field, present);
    }
    map
}

pub fn completeness(record: &CaseRecord) -> f64 {
    let map = field_completeness(record);
    map.values().filter(|present| **present).count() as f64 / map.len() as f64
}

/// Runs the ordered weighted rule set. A record is valid only when every
/// rule passes; the quality score is the passing weight fraction either way.
pub fn validate_record(record: &CaseRecord) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut passed_weight = 0.0;
    let mut total_weight = 0.0;

    let mut rule = |weight: f64, ok: bool, error: Option<String>| {
        total_weight += weight;
        if ok {
            passed_weight += weight;
        } else if let Some(msg) = error {
            errors.push(msg);
        }
    };

    rule(
        2.0,
        record.name.is_some(),
        Some("missing required field: name".into()),
    );
    rule(
        2.0,
        !record.case_number.is_empty(),
        Some("missing required field: case_number".into()),
    );
    rule(
        1.5,
        case_number_well_formed(&record.case_number),
        Some(format!("malformed case number {:?}", record.case_number)),
    );
    rule(
        1.0,
        record.age.map(|a| (0..=120).contains(&a)).unwrap_or(true),
        record.age.map(|a| format!("age {a} out of range 0-120")),
    );
    rule(
        1.0,
        record
            .state
            .as_deref()
            .map(|s| US_STATES.contains(&s))
            .unwrap_or(true),
        record.state.as_deref().map(|s| format!("unknown state code {s:?}")),
    );
    rule(
        1.0,
        record.date_missing.map(date_sane).unwrap_or(true),
        record
            .date_missing
            .map(|d| format!("date_missing {d} outside 1900..next year")),
    );

    // Coordinates are both-or-neither and must sit inside the US box.
    let coords_ok = match (record.latitude, record.longitude) {
        (None, None) => true,
        (Some(lat), Some(lon)) => {
            (LAT_RANGE.0..=LAT_RANGE.1).contains(&lat) && (LON_RANGE.0..=LON_RANGE.1).contains(&lon)
        }
        _ => false,
    };
    rule(
        1.0,
        coords_ok,
        Some(format!(
            "coordinates invalid: lat={:?} lon={:?}",
            record.latitude, record.longitude
        )),
    );

    if record.date_missing.is_none() {
        warnings.push("no date_missing; staleness tracking degraded".into());
    }
    if record.age.map(|a| a >= 100).unwrap_or(false) {
        warnings.push("age 100+; verify source data".into());
    }

    let field_completeness = field_completeness(record);
    let completeness = field_completeness.values().filter(|p| **p).count() as f64
        / field_completeness.len() as f64;

    ValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        quality_score: if total_weight > 0.0 {
            passed_weight / total_weight
        } else {
            0.0
        },
        completeness,
        field_completeness,
    }
}
