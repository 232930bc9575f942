// FX Feature Pipeline - Core Library
// Exposes all modules for use in CLI, status server, and tests

pub mod config;
pub mod data_quality;   // Quality Gate
pub mod db;
pub mod error;
pub mod extract;        // Extractor
pub mod features;       // Feature Engineer
pub mod logging;
pub mod pipeline;       // Run driver
pub mod profile;        // Profiler
pub mod snapshot;
pub mod stats;          // Training statistics
pub mod table;
pub mod tracking;       // Experiment tracking
pub mod version;        // Versioner

// Re-export commonly used types
pub use config::{BlobStoreConfig, PipelineConfig, QualityThresholds};
pub use data_quality::{CheckResult, QualityGate, QualityVerdict, Severity};
pub use db::{
    Event,
    open_database, setup_database, load_history, get_dataset_versions,
    get_runs, get_tracking_runs, get_events_for_entity,
};
pub use error::{PipelineError, Result};
pub use extract::{FileRateSource, HttpRateSource, RateSource, RatesResponse};
pub use features::{CalendarFields, CurrencyFeatures, FeatureEngineer, FeatureRow, FeatureTable};
pub use pipeline::{Pipeline, RunOutcome, RunRecord, RunReport, RunState};
pub use profile::{ColumnProfile, DatasetProfile};
pub use snapshot::{RateObservation, RawSnapshot, SnapshotHistory};
pub use stats::TrainingStats;
pub use table::DataTable;
pub use tracking::TrackingRun;
pub use version::{BlobStore, DatasetVersion, HttpBlobStore, LocalBlobStore, Versioner};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
