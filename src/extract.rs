// 📥 Extractor - fetch latest rates and persist a timestamped raw snapshot
//
// RateSource is the only required interface: add a new upstream by
// implementing it, nothing else changes.

use crate::error::{PipelineError, Result};
use crate::snapshot::{timestamp_label, METADATA_COLUMNS};
use crate::table::DataTable;
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// UPSTREAM RESPONSE
// ============================================================================

/// Body of `GET /v4/latest/{base}`.
///
/// Rates are kept as raw JSON values: a null or a string must reach the raw
/// file untouched so the quality gate can see it.
#[derive(Debug, Clone, Deserialize)]
pub struct RatesResponse {
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time_last_updated: Option<i64>,
    #[serde(default)]
    pub rates: BTreeMap<String, Value>,
}

// ============================================================================
// RATE SOURCES
// ============================================================================

pub trait RateSource: Send + Sync {
    /// Fetch the latest rates. Transport failures are `PipelineError::Network`.
    fn fetch_latest(&self) -> Result<RatesResponse>;

    /// Where the data came from (URL or path), for logs.
    fn describe(&self) -> String;
}

/// Public exchange-rate HTTP API.
pub struct HttpRateSource {
    client: Client,
    url: String,
}

impl HttpRateSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fx-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpRateSource {
            client,
            url: url.to_string(),
        })
    }
}

impl RateSource for HttpRateSource {
    fn fetch_latest(&self) -> Result<RatesResponse> {
        let response = self.client.get(&self.url).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Network(format!(
                "GET {} returned {}",
                self.url, status
            )));
        }

        response
            .json::<RatesResponse>()
            .map_err(|e| PipelineError::Network(format!("invalid response body: {}", e)))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// A saved API response on disk. Used for offline replays.
pub struct FileRateSource {
    path: PathBuf,
}

impl FileRateSource {
    pub fn new(path: &Path) -> Self {
        FileRateSource {
            path: path.to_path_buf(),
        }
    }
}

impl RateSource for FileRateSource {
    fn fetch_latest(&self) -> Result<RatesResponse> {
        let body = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&body)?)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

// ============================================================================
// EXTRACTION
// ============================================================================

#[derive(Debug, Clone)]
pub struct Extraction {
    /// `YYYYMMDD_HHMMSS` label shared by every artifact of the run
    pub timestamp: String,
    pub raw_path: PathBuf,
    pub table: DataTable,
    pub currency_count: usize,
}

/// Render one JSON rate as a raw cell. Numbers keep their original text.
fn rate_cell(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Build the one-row raw batch for a response captured at `now`.
pub fn build_raw_table(response: &RatesResponse, fallback_base: &str, now: DateTime<Utc>) -> DataTable {
    let timestamp = timestamp_label(now);
    let base = response
        .base
        .clone()
        .unwrap_or_else(|| fallback_base.to_string());
    let api_date = response
        .date
        .clone()
        .unwrap_or_else(|| now.format("%Y-%m-%d").to_string());

    let mut headers: Vec<String> = METADATA_COLUMNS.iter().map(|c| c.to_string()).collect();
    let mut row = vec![
        Some(timestamp),
        Some(now.to_rfc3339()),
        Some(base),
        Some(api_date),
        response.time_last_updated.map(|t| t.to_string()),
    ];

    for (code, value) in &response.rates {
        // A currency named like a metadata column would shadow it
        if METADATA_COLUMNS.contains(&code.as_str()) {
            continue;
        }
        headers.push(code.clone());
        row.push(rate_cell(value));
    }

    DataTable {
        headers,
        rows: vec![row],
    }
}

pub fn raw_file_name(timestamp: &str) -> String {
    format!("exchange_rates_raw_{}.csv", timestamp)
}

/// Fetch from `source` and save the raw snapshot under `raw_dir`.
///
/// Raw snapshots are immutable: a second extraction with the same
/// `YYYYMMDD_HHMMSS` label fails with a history error and leaves the
/// existing file as it was.
pub fn extract(
    source: &dyn RateSource,
    raw_dir: &Path,
    fallback_base: &str,
    now: DateTime<Utc>,
) -> Result<Extraction> {
    tracing::info!(source = %source.describe(), "fetching latest exchange rates");

    let timestamp = timestamp_label(now);
    let raw_path = raw_dir.join(raw_file_name(&timestamp));
    if raw_path.exists() {
        return Err(PipelineError::History(format!(
            "raw snapshot {} already exists",
            raw_path.display()
        )));
    }

    let response = source.fetch_latest()?;
    let table = build_raw_table(&response, fallback_base, now);
    table.write_csv_file_new(&raw_path)?;

    let currency_count = response.rates.len();
    tracing::info!(
        path = %raw_path.display(),
        currencies = currency_count,
        timestamp = %timestamp,
        "raw snapshot saved"
    );

    Ok(Extraction {
        timestamp,
        raw_path,
        table,
        currency_count,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::snapshot::{target_columns, RawSnapshot};
    use chrono::TimeZone;

    /// In-memory source for tests across the crate.
    pub(crate) struct StaticRateSource {
        pub body: String,
    }

    impl RateSource for StaticRateSource {
        fn fetch_latest(&self) -> Result<RatesResponse> {
            Ok(serde_json::from_str(&self.body)?)
        }

        fn describe(&self) -> String {
            "static".to_string()
        }
    }

    /// Always fails like an unreachable API.
    pub(crate) struct OfflineRateSource;

    impl RateSource for OfflineRateSource {
        fn fetch_latest(&self) -> Result<RatesResponse> {
            Err(PipelineError::Network("connection refused".to_string()))
        }

        fn describe(&self) -> String {
            "offline".to_string()
        }
    }

    pub(crate) fn sample_body(eur: f64) -> String {
        format!(
            r#"{{"base":"USD","date":"2025-11-03","time_last_updated":1762128000,
                "rates":{{"USD":1,"EUR":{},"GBP":0.79,"JPY":151.2,"CAD":1.38,"AUD":1.52,
                          "CHF":0.88,"CNY":7.12,"INR":83.1,"MXN":18.4,"PKR":281.5}}}}"#,
            eur
        )
    }

    #[test]
    fn test_extract_writes_timestamped_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = StaticRateSource {
            body: sample_body(0.91),
        };
        let now = Utc.with_ymd_and_hms(2025, 11, 3, 6, 0, 1).unwrap();

        let extraction = extract(&source, dir.path(), "USD", now).unwrap();

        assert_eq!(extraction.timestamp, "20251103_060001");
        assert!(extraction
            .raw_path
            .ends_with("exchange_rates_raw_20251103_060001.csv"));
        assert!(extraction.raw_path.exists());
        assert_eq!(extraction.currency_count, 11);

        let on_disk = DataTable::from_csv_path(&extraction.raw_path).unwrap();
        assert_eq!(on_disk.row_count(), 1);
        assert_eq!(on_disk.cell(0, "EUR"), Some("0.91"));
        assert_eq!(on_disk.cell(0, "base_currency"), Some("USD"));
        assert_eq!(target_columns(&on_disk).len(), 11);

        let snapshots = RawSnapshot::from_table(&on_disk).unwrap();
        assert_eq!(snapshots[0].observed_at, now);
        assert_eq!(snapshots[0].time_last_updated, Some(1762128000));
    }

    #[test]
    fn test_missing_base_and_date_fall_back() {
        let response: RatesResponse =
            serde_json::from_str(r#"{"rates":{"EUR":null,"GBP":"n/a"}}"#).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();

        let table = build_raw_table(&response, "USD", now);

        assert_eq!(table.cell(0, "base_currency"), Some("USD"));
        assert_eq!(table.cell(0, "api_date"), Some("2025-01-02"));
        assert_eq!(table.cell(0, "EUR"), None);
        assert_eq!(table.cell(0, "GBP"), Some("n/a"));
        assert_eq!(table.cell(0, "time_last_updated"), None);
    }

    #[test]
    fn test_network_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();

        let err = extract(&OfflineRateSource, dir.path(), "USD", now).unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_file_source_replays_saved_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest.json");
        std::fs::write(&path, sample_body(0.9)).unwrap();

        let response = FileRateSource::new(&path).fetch_latest().unwrap();
        assert_eq!(response.base.as_deref(), Some("USD"));
        assert_eq!(response.rates.len(), 11);
    }

    #[test]
    fn test_same_label_never_replaces_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 11, 3, 6, 0, 0).unwrap();
        let first = extract(&StaticRateSource { body: sample_body(0.91) }, dir.path(), "USD", now).unwrap();
        let before = std::fs::read(&first.raw_path).unwrap();

        let later = now + chrono::Duration::milliseconds(500);
        let err = extract(&StaticRateSource { body: sample_body(0.95) }, dir.path(), "USD", later)
            .unwrap_err();

        assert!(matches!(err, PipelineError::History(_)));
        assert_eq!(std::fs::read(&first.raw_path).unwrap(), before);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
