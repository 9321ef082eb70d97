//! Golden snapshot tests: each fixture roster must parse to exactly the
//! committed snapshot, so parser drift shows up as a diff.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use mpw_adapters::{Endpoint, HtmlRosterAdapter, JsonRosterAdapter};
use mpw_core::CaseRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GoldenRecord {
    case_number: String,
    name: Option<String>,
    age: Option<i32>,
    city: Option<String>,
    state: Option<String>,
    date_missing: Option<NaiveDate>,
    status: Option<String>,
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture_path(source_id: &str, file: &str) -> PathBuf {
    workspace_root().join("fixtures").join(source_id).join("sample").join(file)
}

fn to_golden(records: &[CaseRecord]) -> Vec<GoldenRecord> {
    records
        .iter()
        .map(|r| GoldenRecord {
            case_number: r.case_number.clone(),
            name: r.name.clone(),
            age: r.age,
            city: r.city.clone(),
            state: r.state.clone(),
            date_missing: r.date_missing,
            status: r.status.clone(),
        })
        .collect()
}

fn read_snapshot(path: &Path) -> Vec<GoldenRecord> {
    let text = fs::read_to_string(path).expect("read snapshot");
    serde_json::from_str(&text).expect("parse snapshot")
}

#[test]
fn golden_json_snapshot_namus() {
    let adapter = JsonRosterAdapter::new("namus", Endpoint::Fixture(fixture_path("namus", "roster.json")));
    let body = fs::read_to_string(fixture_path("namus", "roster.json")).expect("read fixture");
    let (records, confidence) = adapter.parse(&body).expect("parse roster");
    assert_eq!(confidence, 1.0);
    assert_eq!(to_golden(&records), read_snapshot(&fixture_path("namus", "snapshot.json")));
}

#[test]
fn golden_html_snapshot_fl_mepic() {
    let adapter =
        HtmlRosterAdapter::new("fl_mepic", Endpoint::Fixture(fixture_path("fl_mepic", "roster.html")));
    let body = fs::read_to_string(fixture_path("fl_mepic", "roster.html")).expect("read fixture");
    let (records, confidence) = adapter.parse(&body).expect("parse roster");
    assert_eq!(confidence, 1.0);
    assert_eq!(to_golden(&records), read_snapshot(&fixture_path("fl_mepic", "snapshot.json")));
}
