//! Adaptive synchronization engine: validation, delta detection, activity
//! analysis, scheduling, and staleness monitoring for missing-persons
//! case sources.

pub mod config;
pub mod dedup;
pub mod delta;
pub mod export;
pub mod geocode;
pub mod monitor;
pub mod pattern;
pub mod pipeline;
pub mod runner;
pub mod schedule;
pub mod validate;

pub const CRATE_NAME: &str = "mpw-sync";

pub use config::{SourceConfig, SourceRegistry, SyncConfig};
pub use dedup::{DedupConfig, DedupEngine};
pub use delta::{record_hash, DeltaConfig, DeltaEngine, QueueReport};
pub use export::{ExportSummary, Exporter};
pub use geocode::{CachingGeocoder, Geocoder, NullGeocoder};
pub use monitor::{AlertChannel, AlertEngine, ConsoleChannel, StalenessMonitor, WebhookChannel};
pub use pattern::PatternAnalyzer;
pub use pipeline::{SourceRunSummary, SyncPipeline};
pub use runner::Runner;
pub use schedule::Scheduler;
pub use validate::{clean_record, completeness, validate_record, ValidationResult};
