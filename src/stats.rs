// 📈 Training statistics - lag feature summary used for drift checks

use crate::error::{PipelineError, Result};
use crate::snapshot::SnapshotHistory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    pub target: String,
    pub n_lags: usize,
    /// Rows left after dropping those with a missing lag
    pub sample_count: usize,
    pub generated_at: DateTime<Utc>,
    pub features: BTreeMap<String, FeatureStats>,
}

pub fn lag_column(target: &str, lag: usize) -> String {
    format!("{}_lag_{}", target, lag)
}

/// Build lags 1..=n_lags over the non-null series of `target`.
pub fn compute(
    history: &SnapshotHistory,
    target: &str,
    n_lags: usize,
    generated_at: DateTime<Utc>,
) -> Result<TrainingStats> {
    if n_lags == 0 {
        return Err(PipelineError::Config("n_lags must be >= 1".to_string()));
    }

    let series: Vec<f64> = history.series(target).into_iter().flatten().collect();
    if series.len() < n_lags + 1 {
        return Err(PipelineError::InsufficientData(format!(
            "{} has {} observations, need at least {}",
            target,
            series.len(),
            n_lags + 1
        )));
    }

    // Rows n_lags.. have every lag defined
    let sample_count = series.len() - n_lags;
    let mut features = BTreeMap::new();

    for lag in 1..=n_lags {
        let values = &series[n_lags - lag..series.len() - lag];
        features.insert(lag_column(target, lag), describe(values));
    }

    Ok(TrainingStats {
        target: target.to_string(),
        n_lags,
        sample_count,
        generated_at,
        features,
    })
}

fn describe(values: &[f64]) -> FeatureStats {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = if values.len() > 1 {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };

    FeatureStats {
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean,
        std,
    }
}

pub fn write(stats: &TrainingStats, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(stats)?)?;
    tracing::info!(path = %path.display(), samples = stats.sample_count, "training statistics written");
    Ok(())
}

pub fn read(path: &Path) -> Result<TrainingStats> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
