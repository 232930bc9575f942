// 🧪 Experiment tracking - opaque key/value run logging
//
// Params, metrics and artifact paths of each pipeline run, stored in the
// local tracking table. Tracking never fails a run.

use crate::db;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRun {
    pub run_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub artifacts: Vec<String>,
}

impl TrackingRun {
    pub fn new(name: &str) -> Self {
        TrackingRun {
            run_id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            started_at: Utc::now(),
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn log_param(&mut self, key: &str, value: impl ToString) {
        self.params.insert(key.to_string(), value.to_string());
    }

    /// Non-finite values are dropped; they cannot be compared across runs.
    pub fn log_metric(&mut self, key: &str, value: f64) {
        if value.is_finite() {
            self.metrics.insert(key.to_string(), value);
        }
    }

    pub fn log_metrics(&mut self, metrics: &BTreeMap<String, f64>) {
        for (key, value) in metrics {
            self.log_metric(key, *value);
        }
    }

    pub fn log_artifact(&mut self, path: &str) {
        self.artifacts.push(path.to_string());
    }
}

/// Persist a run. Errors become warnings.
pub fn record(conn: &Connection, run: &TrackingRun) -> bool {
    match db::insert_tracking_run(conn, run) {
        Ok(()) => {
            tracing::debug!(run_id = %run.run_id, name = %run.name, "tracking run recorded");
            true
        }
        Err(e) => {
            tracing::warn!(name = %run.name, error = %e, "failed to record tracking run");
            false
        }
    }
}
