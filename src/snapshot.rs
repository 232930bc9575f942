// Raw snapshots and the ordered snapshot history
//
// A snapshot is one capture of every rate the upstream API returned.
// History is the explicit, append-only input of the feature engineer.

use crate::error::{PipelineError, Result};
use crate::table::{format_float, DataTable};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// RAW FILE SCHEMA
// ============================================================================

pub const COL_TIMESTAMP: &str = "timestamp";
pub const COL_COLLECTION_DATETIME: &str = "collection_datetime";
pub const COL_BASE_CURRENCY: &str = "base_currency";
pub const COL_API_DATE: &str = "api_date";
pub const COL_TIME_LAST_UPDATED: &str = "time_last_updated";

/// Columns every raw batch must carry.
pub const REQUIRED_COLUMNS: &[&str] = &[
    COL_TIMESTAMP,
    COL_COLLECTION_DATETIME,
    COL_BASE_CURRENCY,
    COL_API_DATE,
];

/// Metadata columns that are never currency (target) columns.
pub const METADATA_COLUMNS: &[&str] = &[
    COL_TIMESTAMP,
    COL_COLLECTION_DATETIME,
    COL_BASE_CURRENCY,
    COL_API_DATE,
    COL_TIME_LAST_UPDATED,
];

/// Label format embedded in file names (UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub fn timestamp_label(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Every column of a raw batch that is not metadata, in file order.
pub fn target_columns(table: &DataTable) -> Vec<&str> {
    table
        .headers
        .iter()
        .map(String::as_str)
        .filter(|h| !METADATA_COLUMNS.contains(h))
        .collect()
}

/// Parse `collection_datetime`: RFC 3339, or a naive ISO datetime taken as UTC.
pub fn parse_observed_at(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

// ============================================================================
// RAW SNAPSHOT
// ============================================================================

/// One currency pair at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateObservation {
    pub base_currency: String,
    pub target_currency: String,
    pub rate: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

/// All pairs captured by a single extraction. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub snapshot_id: String,
    pub observed_at: DateTime<Utc>,
    /// `YYYYMMDD_HHMMSS` label of the extraction
    pub timestamp: String,
    pub base_currency: String,
    pub api_date: String,
    pub time_last_updated: Option<i64>,
    pub rates: BTreeMap<String, Option<f64>>,
}

impl RawSnapshot {
    pub fn new(
        observed_at: DateTime<Utc>,
        base_currency: &str,
        api_date: &str,
        rates: BTreeMap<String, Option<f64>>,
    ) -> Self {
        RawSnapshot {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            observed_at,
            timestamp: timestamp_label(observed_at),
            base_currency: base_currency.to_string(),
            api_date: api_date.to_string(),
            time_last_updated: None,
            rates,
        }
    }

    pub fn rate(&self, currency: &str) -> Option<f64> {
        self.rates.get(currency).copied().flatten()
    }

    /// Row-per-pair view of this snapshot.
    pub fn observations(&self) -> impl Iterator<Item = RateObservation> + '_ {
        self.rates.iter().map(move |(target, rate)| RateObservation {
            base_currency: self.base_currency.clone(),
            target_currency: target.clone(),
            rate: *rate,
            observed_at: self.observed_at,
        })
    }

    /// Parse every row of a validated raw batch into snapshots.
    pub fn from_table(table: &DataTable) -> Result<Vec<RawSnapshot>> {
        for col in REQUIRED_COLUMNS {
            if !table.has_column(col) {
                return Err(PipelineError::Schema(format!(
                    "missing required column: {}",
                    col
                )));
            }
        }

        let targets = target_columns(table);
        let mut snapshots = Vec::with_capacity(table.row_count());

        for row in 0..table.row_count() {
            let required = |col: &str| {
                table.cell(row, col).ok_or_else(|| {
                    PipelineError::Schema(format!("row {}: {} is empty", row + 1, col))
                })
            };

            let observed_raw = required(COL_COLLECTION_DATETIME)?;
            let observed_at = parse_observed_at(observed_raw).ok_or_else(|| {
                PipelineError::Schema(format!(
                    "row {}: invalid collection_datetime {}",
                    row + 1,
                    observed_raw
                ))
            })?;

            let mut rates = BTreeMap::new();
            for target in &targets {
                let rate = match table.cell(row, target) {
                    None => None,
                    Some(raw) => Some(raw.parse::<f64>().map_err(|_| {
                        PipelineError::Schema(format!("column {} is not numeric", target))
                    })?),
                };
                rates.insert(target.to_string(), rate);
            }

            snapshots.push(RawSnapshot {
                snapshot_id: uuid::Uuid::new_v4().to_string(),
                observed_at,
                timestamp: required(COL_TIMESTAMP)?.to_string(),
                base_currency: required(COL_BASE_CURRENCY)?.to_string(),
                api_date: required(COL_API_DATE)?.to_string(),
                time_last_updated: table
                    .cell(row, COL_TIME_LAST_UPDATED)
                    .and_then(|v| v.parse().ok()),
                rates,
            });
        }

        Ok(snapshots)
    }

    /// Render as a one-row raw batch (the raw file layout).
    pub fn to_table(&self) -> DataTable {
        let mut headers: Vec<String> = METADATA_COLUMNS.iter().map(|c| c.to_string()).collect();
        headers.extend(self.rates.keys().cloned());

        let mut row = vec![
            Some(self.timestamp.clone()),
            Some(self.observed_at.to_rfc3339()),
            Some(self.base_currency.clone()),
            Some(self.api_date.clone()),
            self.time_last_updated.map(|t| t.to_string()),
        ];
        row.extend(self.rates.values().map(|r| r.map(format_float)));

        DataTable {
            headers,
            rows: vec![row],
        }
    }
}

// ============================================================================
// SNAPSHOT HISTORY
// ============================================================================

/// Snapshots sorted by `observed_at`, with no duplicate timestamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotHistory {
    snapshots: Vec<RawSnapshot>,
}

impl SnapshotHistory {
    /// Sort by observation time and reject duplicate timestamps.
    pub fn new(mut snapshots: Vec<RawSnapshot>) -> Result<Self> {
        snapshots.sort_by_key(|s| s.observed_at);

        if let Some(pair) = snapshots
            .windows(2)
            .find(|pair| pair[0].observed_at == pair[1].observed_at)
        {
            return Err(PipelineError::History(format!(
                "duplicate observation timestamp {}",
                pair[1].observed_at.to_rfc3339()
            )));
        }

        Ok(SnapshotHistory { snapshots })
    }

    /// Append a snapshot strictly after the latest one.
    pub fn push(&mut self, snapshot: RawSnapshot) -> Result<()> {
        if let Some(last) = self.snapshots.last() {
            if snapshot.observed_at <= last.observed_at {
                return Err(PipelineError::History(format!(
                    "snapshot at {} is not after latest {}",
                    snapshot.observed_at.to_rfc3339(),
                    last.observed_at.to_rfc3339()
                )));
            }
        }
        self.snapshots.push(snapshot);
        Ok(())
    }

    pub fn snapshots(&self) -> &[RawSnapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&RawSnapshot> {
        self.snapshots.last()
    }

    /// Union of currency codes seen anywhere in the history, sorted.
    pub fn currencies(&self) -> Vec<String> {
        let set: BTreeSet<&String> = self.snapshots.iter().flat_map(|s| s.rates.keys()).collect();
        set.into_iter().cloned().collect()
    }

    /// Rate series of one currency in observation order (null where absent).
    pub fn series(&self, currency: &str) -> Vec<Option<f64>> {
        self.snapshots.iter().map(|s| s.rate(currency)).collect()
    }

    /// The first `n` observations. Used to check features never look ahead.
    pub fn prefix(&self, n: usize) -> SnapshotHistory {
        SnapshotHistory {
            snapshots: self.snapshots.iter().take(n).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot_at(day: u32, eur: f64) -> RawSnapshot {
        let at = Utc.with_ymd_and_hms(2025, 1, day, 12, 0, 0).unwrap();
        let mut rates = BTreeMap::new();
        rates.insert("EUR".to_string(), Some(eur));
        rates.insert("GBP".to_string(), None);
        RawSnapshot::new(at, "USD", "2025-01-01", rates)
    }

    #[test]
    fn test_timestamp_label_format() {
        let at = Utc.with_ymd_and_hms(2025, 11, 3, 7, 5, 9).unwrap();
        assert_eq!(timestamp_label(at), "20251103_070509");
    }

    #[test]
    fn test_parse_observed_at_accepts_naive_iso() {
        let parsed = parse_observed_at("2025-11-03T07:05:09.123456").unwrap();
        assert_eq!(timestamp_label(parsed), "20251103_070509");
        assert!(parse_observed_at("2025-11-03T07:05:09+00:00").is_some());
        assert!(parse_observed_at("yesterday").is_none());
    }

    #[test]
    fn test_observations_one_per_pair() {
        let snapshot = snapshot_at(1, 0.91);
        let obs: Vec<RateObservation> = snapshot.observations().collect();
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].target_currency, "EUR");
        assert_eq!(obs[0].rate, Some(0.91));
        assert_eq!(obs[1].rate, None);
        assert!(obs.iter().all(|o| o.base_currency == "USD"));
    }

    #[test]
    fn test_table_round_trip_through_raw_layout() {
        let snapshot = snapshot_at(2, 0.92);
        let table = snapshot.to_table();
        assert_eq!(target_columns(&table), vec!["EUR", "GBP"]);

        let parsed = RawSnapshot::from_table(&table).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].observed_at, snapshot.observed_at);
        assert_eq!(parsed[0].rates, snapshot.rates);
        assert_eq!(parsed[0].timestamp, snapshot.timestamp);
    }

    #[test]
    fn test_from_table_rejects_non_numeric_rate() {
        let csv = "timestamp,collection_datetime,base_currency,api_date,EUR\n\
                   20250101_120000,2025-01-01T12:00:00+00:00,USD,2025-01-01,abc\n";
        let table = DataTable::from_reader(csv.as_bytes()).unwrap();
        let err = RawSnapshot::from_table(&table).unwrap_err();
        assert!(matches!(err, PipelineError::Schema(_)));
    }

    #[test]
    fn test_history_sorts_and_rejects_duplicates() {
        let history =
            SnapshotHistory::new(vec![snapshot_at(3, 0.93), snapshot_at(1, 0.91)]).unwrap();
        assert_eq!(history.series("EUR"), vec![Some(0.91), Some(0.93)]);

        let err = SnapshotHistory::new(vec![snapshot_at(1, 0.91), snapshot_at(1, 0.95)])
            .unwrap_err();
        assert!(matches!(err, PipelineError::History(_)));
    }

    #[test]
    fn test_history_push_must_move_forward() {
        let mut history = SnapshotHistory::new(vec![snapshot_at(2, 0.92)]).unwrap();
        assert!(history.push(snapshot_at(1, 0.91)).is_err());
        assert!(history.push(snapshot_at(3, 0.93)).is_ok());
        assert_eq!(history.len(), 2);
        assert_eq!(history.currencies(), vec!["EUR", "GBP"]);
    }
}
