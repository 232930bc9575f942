// 🔁 Run driver - Extract → Validate → Engineer → Profile → Version
//
// A plain sequential composition. Each stage's full output is the next
// stage's input; every state transition is saved and appended to the
// audit trail.

use crate::config::PipelineConfig;
use crate::data_quality::{QualityGate, QualityVerdict};
use crate::db::{self, Event};
use crate::error::{PipelineError, Result};
use crate::extract::{extract, HttpRateSource, RateSource};
use crate::features::{FeatureEngineer, FeatureTable};
use crate::profile::{self, DatasetProfile};
use crate::snapshot::{timestamp_label, RawSnapshot};
use crate::stats::{self, TrainingStats};
use crate::table::DataTable;
use crate::tracking::{self, TrackingRun};
use crate::version::{build_blob_store, DatasetVersion, Versioner};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

const ACTOR: &str = "pipeline";
const ENTITY: &str = "pipeline_run";

// ============================================================================
// RUN STATE
// ============================================================================

/// Strictly linear: each state has at most one successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Started,
    Extracted,
    Validated,
    FeatureEngineered,
    Profiled,
    Versioned,
    Failed,
    Degraded,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Started => "started",
            RunState::Extracted => "extracted",
            RunState::Validated => "validated",
            RunState::FeatureEngineered => "feature_engineered",
            RunState::Profiled => "profiled",
            RunState::Versioned => "versioned",
            RunState::Failed => "failed",
            RunState::Degraded => "degraded",
        }
    }

    pub fn parse(raw: &str) -> Option<RunState> {
        match raw {
            "started" => Some(RunState::Started),
            "extracted" => Some(RunState::Extracted),
            "validated" => Some(RunState::Validated),
            "feature_engineered" => Some(RunState::FeatureEngineered),
            "profiled" => Some(RunState::Profiled),
            "versioned" => Some(RunState::Versioned),
            "failed" => Some(RunState::Failed),
            "degraded" => Some(RunState::Degraded),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<RunState> {
        match self {
            RunState::Started => Some(RunState::Extracted),
            RunState::Extracted => Some(RunState::Validated),
            RunState::Validated => Some(RunState::FeatureEngineered),
            RunState::FeatureEngineered => Some(RunState::Profiled),
            RunState::Profiled => Some(RunState::Versioned),
            RunState::Versioned | RunState::Failed | RunState::Degraded => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Versioned | RunState::Failed | RunState::Degraded)
    }
}

/// One invocation of the run driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub timestamp: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    /// Stage being attempted when the run stopped
    pub failed_stage: Option<RunState>,
    pub reason: Option<String>,
    pub content_hash: Option<String>,
}

impl RunRecord {
    pub fn new(timestamp: &str, started_at: DateTime<Utc>) -> Self {
        RunRecord {
            run_id: uuid::Uuid::new_v4().to_string(),
            timestamp: timestamp.to_string(),
            started_at,
            finished_at: None,
            state: RunState::Started,
            failed_stage: None,
            reason: None,
            content_hash: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Succeeded,
    /// Quality gate (or schema) halt: data out of tolerance
    Halted,
    /// Features written locally, version push failed
    Degraded,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Halted => "halted",
            RunOutcome::Degraded => "degraded",
            RunOutcome::Failed => "failed",
        }
    }

    /// Process exit code for the orchestrator.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed => 1,
            RunOutcome::Halted => 2,
            RunOutcome::Degraded => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub record: RunRecord,
    pub outcome: RunOutcome,
    pub reasons: Vec<String>,
    /// Whether retrying the run later may succeed
    pub retryable: bool,
    pub verdict: Option<QualityVerdict>,
    pub raw_path: Option<PathBuf>,
    pub dataset_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub feature_rows: usize,
    pub version: Option<DatasetVersion>,
}

impl RunReport {
    fn new(record: RunRecord) -> Self {
        RunReport {
            record,
            outcome: RunOutcome::Failed,
            reasons: Vec::new(),
            retryable: false,
            verdict: None,
            raw_path: None,
            dataset_path: None,
            report_path: None,
            feature_rows: 0,
            version: None,
        }
    }

    pub fn summary(&self) -> String {
        match self.outcome {
            RunOutcome::Succeeded => format!(
                "Run {} succeeded: {} feature rows, version {}",
                self.record.timestamp,
                self.feature_rows,
                self.version.as_ref().map(|v| v.short_hash()).unwrap_or("-")
            ),
            _ => format!(
                "Run {} {} at {}: {}",
                self.record.timestamp,
                self.outcome.as_str(),
                self.record.failed_stage.map(|s| s.as_str()).unwrap_or("-"),
                self.reasons.join("; ")
            ),
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    config: PipelineConfig,
    conn: Connection,
    source: Box<dyn RateSource>,
    gate: QualityGate,
    engineer: FeatureEngineer,
    versioner: Versioner,
}

impl Pipeline {
    /// Production wiring: HTTP rate source + configured blob store.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let source = HttpRateSource::new(&config.api_url, config.request_timeout())?;
        Self::with_source(config, Box::new(source))
    }

    pub fn with_source(config: PipelineConfig, source: Box<dyn RateSource>) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;
        let conn = db::open_database(&config.db_path)?;
        let store = build_blob_store(&config.blob_store, config.request_timeout())?;

        Ok(Pipeline {
            conn,
            source,
            gate: QualityGate::new(config.thresholds),
            engineer: FeatureEngineer::new(&config.tracked_currencies),
            versioner: Versioner::new(store),
            config,
        })
    }

    pub fn with_versioner(mut self, versioner: Versioner) -> Self {
        self.versioner = versioner;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    pub fn versioner(&self) -> &Versioner {
        &self.versioner
    }

    /// Execute one full run at `now`. Stage failures end up in the report;
    /// only failures to record the run itself are returned as errors.
    pub fn run(&self, now: DateTime<Utc>) -> Result<RunReport> {
        let timestamp = timestamp_label(now);
        let mut report = RunReport::new(RunRecord::new(&timestamp, now));

        let span = tracing::info_span!("pipeline_run", run_id = %report.record.run_id, timestamp = %timestamp);
        let _enter = span.enter();

        db::save_run(&self.conn, &report.record)?;
        self.log_event(&report.record, "run_started", json!({ "timestamp": timestamp }))?;
        tracing::info!("pipeline run started");

        match self.execute(&mut report, now, &timestamp) {
            Ok(()) => report.outcome = RunOutcome::Succeeded,
            Err(e) => self.fail(&mut report, e)?,
        }

        report.record.finished_at = Some(Utc::now());
        db::save_run(&self.conn, &report.record)?;
        self.log_event(
            &report.record,
            "run_finished",
            json!({
                "outcome": report.outcome.as_str(),
                "reason": report.record.reason,
                "content_hash": report.record.content_hash,
            }),
        )?;

        match report.outcome {
            RunOutcome::Succeeded => tracing::info!(outcome = "succeeded", "{}", report.summary()),
            RunOutcome::Halted | RunOutcome::Degraded => {
                tracing::warn!(outcome = report.outcome.as_str(), "{}", report.summary())
            }
            RunOutcome::Failed => tracing::error!(outcome = "failed", "{}", report.summary()),
        }

        Ok(report)
    }

    fn execute(&self, report: &mut RunReport, now: DateTime<Utc>, timestamp: &str) -> Result<()> {
        // Extract
        let extraction = extract(
            self.source.as_ref(),
            &self.config.raw_dir(),
            &self.config.base_currency,
            now,
        )?;
        report.raw_path = Some(extraction.raw_path.clone());
        self.advance(report, RunState::Extracted)?;

        // Validate
        let verdict = self.gate.evaluate(&extraction.table);
        tracing::info!(
            null_ratio = verdict.null_ratio,
            currencies = verdict.currency_count,
            pass = verdict.pass,
            "quality gate evaluated"
        );
        for warning in verdict.warnings() {
            tracing::warn!(rule = %warning.rule_name, "{}", warning.message);
        }
        let reasons = verdict.reasons.clone();
        let passed = verdict.pass;
        report.verdict = Some(verdict);
        if !passed {
            return Err(PipelineError::QualityGate { reasons });
        }

        // History grows only with validated snapshots
        let source_file = extraction.raw_path.display().to_string();
        for snapshot in RawSnapshot::from_table(&extraction.table)? {
            if !db::insert_snapshot(&self.conn, &snapshot, &source_file)? {
                return Err(PipelineError::History(format!(
                    "snapshot at {} already recorded",
                    snapshot.observed_at.to_rfc3339()
                )));
            }
        }
        self.advance(report, RunState::Validated)?;

        // Engineer
        let features = self.engineer_features()?;
        let dataset_path = self.config.dataset_path();
        report.feature_rows = features.row_count();
        report.dataset_path = Some(dataset_path.clone());
        self.advance(report, RunState::FeatureEngineered)?;

        // Profile
        let (dataset_profile, report_path) = self.profile_dataset(timestamp)?;
        report.report_path = Some(report_path.clone());
        if self.config.tracking_enabled {
            self.track(timestamp, &features, &dataset_profile, report, &report_path);
        }
        self.advance(report, RunState::Profiled)?;

        // Version
        let version = self.versioner.commit(
            &self.conn,
            &dataset_path,
            features.row_count(),
            now,
            timestamp,
        )?;
        report.record.content_hash = Some(version.content_hash.clone());
        report.version = Some(version);
        self.advance(report, RunState::Versioned)?;

        Ok(())
    }

    fn advance(&self, report: &mut RunReport, to: RunState) -> Result<()> {
        let from = report.record.state;
        report.record.state = to;
        db::save_run(&self.conn, &report.record)?;
        self.log_event(
            &report.record,
            "state_changed",
            json!({ "from": from.as_str(), "to": to.as_str() }),
        )?;
        tracing::info!(stage = to.as_str(), "stage completed");
        Ok(())
    }

    fn fail(&self, report: &mut RunReport, error: PipelineError) -> Result<()> {
        let attempted = report.record.state.next().unwrap_or(report.record.state);
        let storage_failure = matches!(
            error,
            PipelineError::Storage(_) | PipelineError::StorageAuth(_)
        );

        report.outcome = if error.halts_pipeline() {
            RunOutcome::Halted
        } else if attempted == RunState::Versioned && storage_failure {
            RunOutcome::Degraded
        } else {
            RunOutcome::Failed
        };
        report.retryable = error.is_retryable();
        report.reasons = error.reasons();

        let from = report.record.state;
        let to = if report.outcome == RunOutcome::Degraded {
            RunState::Degraded
        } else {
            RunState::Failed
        };
        report.record.state = to;
        report.record.failed_stage = Some(attempted);
        report.record.reason = Some(report.reasons.join("; "));

        db::save_run(&self.conn, &report.record)?;
        self.log_event(
            &report.record,
            "state_changed",
            json!({
                "from": from.as_str(),
                "to": to.as_str(),
                "stage": attempted.as_str(),
                "reasons": report.reasons,
            }),
        )?;
        Ok(())
    }

    fn log_event(&self, record: &RunRecord, event_type: &str, data: serde_json::Value) -> Result<()> {
        db::insert_event(
            &self.conn,
            &Event::new(event_type, ENTITY, &record.run_id, data, ACTOR),
        )
    }

    fn track(
        &self,
        timestamp: &str,
        features: &FeatureTable,
        dataset_profile: &DatasetProfile,
        report: &RunReport,
        report_path: &Path,
    ) {
        let mut run = TrackingRun::new(&format!("data_pipeline_{}", timestamp));
        run.log_param("timestamp", timestamp);
        run.log_param("num_rows", features.row_count());
        run.log_param("num_features", features.feature_count());
        run.log_param("base_currency", &self.config.base_currency);
        if let Some(verdict) = &report.verdict {
            run.log_metrics(&verdict.metrics());
        }
        run.log_metric("dataset_missing_ratio", dataset_profile.missing_ratio);
        run.log_artifact(&report_path.display().to_string());
        tracking::record(&self.conn, &run);
    }

    // ========================================================================
    // STAGE ENTRY POINTS (also used by the CLI)
    // ========================================================================

    /// Regenerate the full feature dataset from the stored history.
    pub fn engineer_features(&self) -> Result<FeatureTable> {
        let history = db::load_history(&self.conn)?;
        let features = self.engineer.engineer(&history);

        let path = self.config.dataset_path();
        features.to_table().write_csv_file(&path)?;
        tracing::info!(
            path = %path.display(),
            rows = features.row_count(),
            tracked = features.tracked.len(),
            "feature dataset written"
        );

        Ok(features)
    }

    /// Profile the dataset on disk and write the HTML report.
    pub fn profile_dataset(&self, timestamp: &str) -> Result<(DatasetProfile, PathBuf)> {
        let path = self.config.dataset_path();
        if !path.exists() {
            return Err(PipelineError::NotFound(format!(
                "no feature dataset at {}",
                path.display()
            )));
        }
        let table = DataTable::from_csv_path(&path)?;
        let dataset_profile = profile::profile(&table);
        let report_path = profile::write_report(&dataset_profile, &self.config.reports_dir, timestamp)?;
        Ok((dataset_profile, report_path))
    }

    pub fn training_stats(&self, now: DateTime<Utc>) -> Result<(TrainingStats, PathBuf)> {
        let history = db::load_history(&self.conn)?;
        let training = stats::compute(
            &history,
            &self.config.training_target,
            self.config.training_lags,
            now,
        )?;
        let path = self.config.training_stats_path();
        stats::write(&training, &path)?;
        Ok((training, path))
    }

    /// Restore a committed dataset. Defaults to the live dataset path.
    pub fn checkout(&self, reference: &str, dest: Option<&Path>) -> Result<DatasetVersion> {
        let dest = dest
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.dataset_path());
        self.versioner.checkout(&self.conn, reference, &dest)
    }

    /// Run the quality gate on a raw CSV file without touching any state.
    pub fn validate_file(&self, path: &Path) -> Result<QualityVerdict> {
        let table = DataTable::from_csv_path(path)?;
        Ok(self.gate.evaluate(&table))
    }
}
