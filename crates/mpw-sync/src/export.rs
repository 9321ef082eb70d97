//! Durable data products: the public CSV roster and parquet snapshots for
//! downstream analysis.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use mpw_core::{CaseRecord, ScheduleRecommendation};
use mpw_storage::{CaseStore, ScheduleStore, SharedStore};

use crate::config::{SourceRegistry, SyncConfig};

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub cases: usize,
    pub csv_path: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

const CSV_HEADER: &str = "case_number,source_id,name,age,gender,ethnicity,city,county,state,latitude,longitude,date_missing,date_reported,status,category,description,contact_phone,contact_email";

fn csv_field(value: Option<&str>) -> String {
    let Some(raw) = value else {
        return String::new();
    };
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn csv_row(record: &CaseRecord) -> String {
    let cells = [
        csv_field(Some(&record.case_number)),
        csv_field(Some(&record.source_id)),
        csv_field(record.name.as_deref()),
        record.age.map(|v| v.to_string()).unwrap_or_default(),
        csv_field(record.gender.as_deref()),
        csv_field(record.ethnicity.as_deref()),
        csv_field(record.city.as_deref()),
        csv_field(record.county.as_deref()),
        csv_field(record.state.as_deref()),
        record.latitude.map(|v| v.to_string()).unwrap_or_default(),
        record.longitude.map(|v| v.to_string()).unwrap_or_default(),
        record.date_missing.map(|d| d.to_string()).unwrap_or_default(),
        record.date_reported.map(|d| d.to_string()).unwrap_or_default(),
        csv_field(record.status.as_deref()),
        csv_field(record.category.as_deref()),
        csv_field(record.description.as_deref()),
        csv_field(record.contact_phone.as_deref()),
        csv_field(record.contact_email.as_deref()),
    ];
    cells.join(",")
}

pub struct Exporter {
    store: SharedStore,
    config: SyncConfig,
}

impl Exporter {
    pub fn new(store: SharedStore, config: SyncConfig) -> Self {
        Self { store, config }
    }

    /// Writes the CSV roster and a timestamped parquet snapshot directory,
    /// returning where everything landed.
    pub async fn export_all(&self, registry: &SourceRegistry) -> Result<ExportSummary> {
        let cases = self.store.all_cases().await?;
        let schedules = self.store.latest_recommendations().await?;

        fs::create_dir_all(&self.config.export_dir)
            .await
            .with_context(|| format!("creating {}", self.config.export_dir.display()))?;

        let csv_path = self.config.export_csv_path();
        self.write_csv(&csv_path, &cases).await?;

        let snapshot_dir = self
            .config
            .export_dir
            .join("snapshots")
            .join(Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
        let manifest_path = self
            .export_parquet_snapshots(&snapshot_dir, &cases, &schedules, registry)
            .await?;

        info!(
            cases = cases.len(),
            csv = %csv_path.display(),
            manifest = %manifest_path.display(),
            "export complete"
        );
        Ok(ExportSummary {
            cases: cases.len(),
            csv_path: csv_path.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        })
    }

    async fn write_csv(&self, path: &Path, cases: &[CaseRecord]) -> Result<()> {
        let mut lines = Vec::with_capacity(cases.len() + 1);
        lines.push(CSV_HEADER.to_string());
        lines.extend(cases.iter().map(csv_row));
        let mut body = lines.join("\n");
        body.push('\n');
        fs::write(path, body)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    async fn export_parquet_snapshots(
        &self,
        snapshot_dir: &Path,
        cases: &[CaseRecord],
        schedules: &[ScheduleRecommendation],
        registry: &SourceRegistry,
    ) -> Result<PathBuf> {
        fs::create_dir_all(snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let cases_path = snapshot_dir.join("cases.parquet");
        let schedules_path = snapshot_dir.join("schedules.parquet");
        let sources_path = snapshot_dir.join("sources.parquet");

        write_cases_parquet(&cases_path, cases)?;
        write_schedules_parquet(&schedules_path, schedules)?;
        write_sources_parquet(&sources_path, registry)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("cases", snapshot_dir, &cases_path)?,
                manifest_entry("schedules", snapshot_dir, &schedules_path)?,
                manifest_entry("sources", snapshot_dir, &sources_path)?,
            ],
        };

        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn opt_str_array<'a, I>(values: I) -> StringArray
where
    I: Iterator<Item = Option<&'a str>>,
{
    StringArray::from(values.collect::<Vec<_>>())
}

fn write_cases_parquet(path: &Path, cases: &[CaseRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("case_number", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, true),
        ArrowField::new("age", DataType::Int32, true),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("state", DataType::Utf8, true),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("date_missing", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, true),
    ]));

    let case_numbers = opt_str_array(cases.iter().map(|c| Some(c.case_number.as_str())));
    let source_ids = opt_str_array(cases.iter().map(|c| Some(c.source_id.as_str())));
    let names = opt_str_array(cases.iter().map(|c| c.name.as_deref()));
    let ages = Int32Array::from(cases.iter().map(|c| c.age).collect::<Vec<_>>());
    let cities = opt_str_array(cases.iter().map(|c| c.city.as_deref()));
    let states = opt_str_array(cases.iter().map(|c| c.state.as_deref()));
    let latitudes = Float64Array::from(cases.iter().map(|c| c.latitude).collect::<Vec<_>>());
    let longitudes = Float64Array::from(cases.iter().map(|c| c.longitude).collect::<Vec<_>>());
    let dates = StringArray::from(
        cases
            .iter()
            .map(|c| c.date_missing.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
    );
    let statuses = opt_str_array(cases.iter().map(|c| c.status.as_deref()));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(case_numbers),
            Arc::new(source_ids),
            Arc::new(names),
            Arc::new(ages),
            Arc::new(cities),
            Arc::new(states),
            Arc::new(latitudes),
            Arc::new(longitudes),
            Arc::new(dates),
            Arc::new(statuses),
        ],
    )
    .context("building cases record batch")?;
    write_parquet(path, batch)
}

fn write_schedules_parquet(path: &Path, schedules: &[ScheduleRecommendation]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("tier", DataType::Utf8, false),
        ArrowField::new("interval_minutes", DataType::Int64, false),
        ArrowField::new("next_run_at", DataType::Utf8, false),
        ArrowField::new("reason", DataType::Utf8, false),
        ArrowField::new("confidence", DataType::Float64, false),
    ]));

    let source_ids = opt_str_array(schedules.iter().map(|s| Some(s.source_id.as_str())));
    let tiers = StringArray::from(
        schedules
            .iter()
            .map(|s| Some(s.tier.as_str()))
            .collect::<Vec<_>>(),
    );
    let intervals = Int64Array::from(
        schedules
            .iter()
            .map(|s| s.interval_minutes)
            .collect::<Vec<_>>(),
    );
    let next_runs = StringArray::from(
        schedules
            .iter()
            .map(|s| Some(s.next_run_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let reasons = opt_str_array(schedules.iter().map(|s| Some(s.reason.as_str())));
    let confidences =
        Float64Array::from(schedules.iter().map(|s| s.confidence).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(tiers),
            Arc::new(intervals),
            Arc::new(next_runs),
            Arc::new(reasons),
            Arc::new(confidences),
        ],
    )
    .context("building schedules record batch")?;
    write_parquet(path, batch)
}

fn write_sources_parquet(path: &Path, registry: &SourceRegistry) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("display_name", DataType::Utf8, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("enabled", DataType::Utf8, false),
    ]));

    let source_ids = opt_str_array(registry.sources.iter().map(|s| Some(s.source_id.as_str())));
    let display_names = opt_str_array(registry.sources.iter().map(|s| Some(s.display_name.as_str())));
    let kinds = opt_str_array(registry.sources.iter().map(|s| Some(s.kind.as_str())));
    let enabled = StringArray::from(
        registry
            .sources
            .iter()
            .map(|s| Some(if s.enabled { "true" } else { "false" }))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(display_names),
            Arc::new(kinds),
            Arc::new(enabled),
        ],
    )
    .context("building sources record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, snapshot_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(snapshot_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
