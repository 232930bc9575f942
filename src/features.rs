// 🧮 Feature Engineer - lag, rolling-window and calendar features
//
// Input is the whole ordered snapshot history; output is regenerated in
// full each run. Row T only ever reads observations at positions <= T.

use crate::snapshot::SnapshotHistory;
use crate::table::{format_optional, DataTable};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

pub const LAG_SHORT: usize = 1;
pub const LAG_LONG: usize = 7;
pub const WINDOW_SHORT: usize = 7;
pub const WINDOW_LONG: usize = 30;

/// Suffixes of the per-currency feature columns, in output order.
pub const FEATURE_SUFFIXES: [&str; 8] = [
    "lag1",
    "lag7",
    "rolling_mean_7",
    "rolling_mean_30",
    "rolling_std_7",
    "rolling_std_30",
    "pct_change_1d",
    "pct_change_7d",
];

pub const CALENDAR_COLUMNS: [&str; 6] = ["day_of_week", "day_of_month", "month", "quarter", "year", "hour"];

// ============================================================================
// SERIES OPERATORS
// ============================================================================
//
// All operators take a series in observation order and return one value
// per position. Missing inputs propagate as None.

/// Value `offset` positions back.
pub fn lag(series: &[Option<f64>], offset: usize) -> Vec<Option<f64>> {
    (0..series.len())
        .map(|i| i.checked_sub(offset).and_then(|j| series[j]))
        .collect()
}

/// Trailing window ending at `end` (inclusive), if full and without nulls.
fn window(series: &[Option<f64>], end: usize, size: usize) -> Option<Vec<f64>> {
    if size == 0 || end + 1 < size {
        return None;
    }
    series[end + 1 - size..=end].iter().copied().collect()
}

/// Mean shifted by the first value, so a constant window is exact.
fn shifted_mean(values: &[f64]) -> f64 {
    let shift = values[0];
    shift + values.iter().map(|v| v - shift).sum::<f64>() / values.len() as f64
}

pub fn rolling_mean(series: &[Option<f64>], size: usize) -> Vec<Option<f64>> {
    (0..series.len())
        .map(|i| window(series, i, size).map(|w| shifted_mean(&w)))
        .collect()
}

/// Sample standard deviation (n - 1) over a trailing window.
pub fn rolling_std(series: &[Option<f64>], size: usize) -> Vec<Option<f64>> {
    (0..series.len())
        .map(|i| {
            let w = window(series, i, size)?;
            if w.len() < 2 {
                return None;
            }
            let mean = shifted_mean(&w);
            let var = w.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (w.len() - 1) as f64;
            Some(var.sqrt())
        })
        .collect()
}

/// (x[t] - x[t-p]) / x[t-p]; None on a zero base.
pub fn pct_change(series: &[Option<f64>], periods: usize) -> Vec<Option<f64>> {
    let base = lag(series, periods);
    series
        .iter()
        .zip(base)
        .map(|(current, previous)| match (current, previous) {
            (Some(c), Some(p)) if p != 0.0 => Some((c - p) / p),
            _ => None,
        })
        .collect()
}

// ============================================================================
// FEATURE ROWS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalendarFields {
    /// 0 = Monday
    pub day_of_week: u32,
    pub day_of_month: u32,
    pub month: u32,
    pub quarter: u32,
    pub year: i32,
    pub hour: u32,
}

impl CalendarFields {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        CalendarFields {
            day_of_week: at.weekday().num_days_from_monday(),
            day_of_month: at.day(),
            month: at.month(),
            quarter: (at.month() - 1) / 3 + 1,
            year: at.year(),
            hour: at.hour(),
        }
    }

    fn cells(&self) -> [String; 6] {
        [
            self.day_of_week.to_string(),
            self.day_of_month.to_string(),
            self.month.to_string(),
            self.quarter.to_string(),
            self.year.to_string(),
            self.hour.to_string(),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CurrencyFeatures {
    pub lag_1: Option<f64>,
    pub lag_7: Option<f64>,
    pub rolling_mean_7: Option<f64>,
    pub rolling_mean_30: Option<f64>,
    pub rolling_std_7: Option<f64>,
    pub rolling_std_30: Option<f64>,
    pub pct_change_1d: Option<f64>,
    pub pct_change_7d: Option<f64>,
}

impl CurrencyFeatures {
    /// Values in `FEATURE_SUFFIXES` order.
    pub fn values(&self) -> [Option<f64>; 8] {
        [
            self.lag_1,
            self.lag_7,
            self.rolling_mean_7,
            self.rolling_mean_30,
            self.rolling_std_7,
            self.rolling_std_30,
            self.pct_change_1d,
            self.pct_change_7d,
        ]
    }
}

/// One row per observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureRow {
    pub observed_at: DateTime<Utc>,
    pub timestamp: String,
    pub base_currency: String,
    pub calendar: CalendarFields,
    /// Raw rate of every currency in the history
    pub rates: BTreeMap<String, Option<f64>>,
    /// Derived features of tracked currencies
    pub features: BTreeMap<String, CurrencyFeatures>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureTable {
    pub currencies: Vec<String>,
    pub tracked: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn latest(&self) -> Option<&FeatureRow> {
        self.rows.last()
    }

    pub fn column_names(&self) -> Vec<String> {
        let mut columns = vec![
            "timestamp".to_string(),
            "observed_at".to_string(),
            "base_currency".to_string(),
        ];
        columns.extend(CALENDAR_COLUMNS.iter().map(|c| c.to_string()));
        columns.extend(self.currencies.iter().cloned());
        for currency in &self.tracked {
            columns.extend(FEATURE_SUFFIXES.iter().map(|s| format!("{}_{}", currency, s)));
        }
        columns
    }

    /// Derived feature columns only (no metadata, no raw rates).
    pub fn feature_count(&self) -> usize {
        CALENDAR_COLUMNS.len() + self.tracked.len() * FEATURE_SUFFIXES.len()
    }

    pub fn to_table(&self) -> DataTable {
        let mut table = DataTable::new(self.column_names());

        for row in &self.rows {
            let mut cells: Vec<Option<String>> = vec![
                Some(row.timestamp.clone()),
                Some(row.observed_at.to_rfc3339()),
                Some(row.base_currency.clone()),
            ];
            cells.extend(row.calendar.cells().into_iter().map(Some));
            cells.extend(
                self.currencies
                    .iter()
                    .map(|c| format_optional(row.rates.get(c).copied().flatten())),
            );
            for currency in &self.tracked {
                let features = row.features.get(currency).copied().unwrap_or_default();
                cells.extend(features.values().into_iter().map(format_optional));
            }
            table.rows.push(cells);
        }

        table
    }
}

// ============================================================================
// FEATURE ENGINEER
// ============================================================================

#[derive(Debug, Clone)]
pub struct FeatureEngineer {
    tracked: Vec<String>,
}

impl FeatureEngineer {
    pub fn new(tracked: &[String]) -> Self {
        FeatureEngineer {
            tracked: tracked.to_vec(),
        }
    }

    fn currency_features(series: &[Option<f64>]) -> Vec<CurrencyFeatures> {
        let lag_1 = lag(series, LAG_SHORT);
        let lag_7 = lag(series, LAG_LONG);
        let mean_7 = rolling_mean(series, WINDOW_SHORT);
        let mean_30 = rolling_mean(series, WINDOW_LONG);
        let std_7 = rolling_std(series, WINDOW_SHORT);
        let std_30 = rolling_std(series, WINDOW_LONG);
        let pct_1 = pct_change(series, LAG_SHORT);
        let pct_7 = pct_change(series, LAG_LONG);

        (0..series.len())
            .map(|i| CurrencyFeatures {
                lag_1: lag_1[i],
                lag_7: lag_7[i],
                rolling_mean_7: mean_7[i],
                rolling_mean_30: mean_30[i],
                rolling_std_7: std_7[i],
                rolling_std_30: std_30[i],
                pct_change_1d: pct_1[i],
                pct_change_7d: pct_7[i],
            })
            .collect()
    }

    /// Derive the full feature table from the history.
    ///
    /// Tracked currencies absent from the whole history get no columns.
    pub fn engineer(&self, history: &SnapshotHistory) -> FeatureTable {
        let currencies = history.currencies();
        let tracked: Vec<String> = self
            .tracked
            .iter()
            .filter(|c| currencies.contains(*c))
            .cloned()
            .collect();

        let per_currency: BTreeMap<&str, Vec<CurrencyFeatures>> = tracked
            .iter()
            .map(|c| (c.as_str(), Self::currency_features(&history.series(c))))
            .collect();

        let rows = history
            .snapshots()
            .iter()
            .enumerate()
            .map(|(i, snapshot)| FeatureRow {
                observed_at: snapshot.observed_at,
                timestamp: snapshot.timestamp.clone(),
                base_currency: snapshot.base_currency.clone(),
                calendar: CalendarFields::from_datetime(snapshot.observed_at),
                rates: currencies
                    .iter()
                    .map(|c| (c.clone(), snapshot.rate(c)))
                    .collect(),
                features: per_currency
                    .iter()
                    .map(|(c, values)| (c.to_string(), values[i]))
                    .collect(),
            })
            .collect();

        tracing::debug!(
            observations = history.len(),
            currencies = currencies.len(),
            tracked = tracked.len(),
            "features engineered"
        );

        FeatureTable {
            currencies,
            tracked,
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::RawSnapshot;
    use chrono::{Duration, TimeZone};

    fn tracked() -> Vec<String> {
        vec!["EUR".to_string(), "GBP".to_string()]
    }

    fn history_of(eur: &[Option<f64>]) -> SnapshotHistory {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 6, 0, 0).unwrap();
        let snapshots = eur
            .iter()
            .enumerate()
            .map(|(i, rate)| {
                let mut rates = BTreeMap::new();
                rates.insert("EUR".to_string(), *rate);
                rates.insert("GBP".to_string(), Some(0.79));
                rates.insert("JPY".to_string(), Some(151.0));
                RawSnapshot::new(start + Duration::days(i as i64), "USD", "2025-01-01", rates)
            })
            .collect();
        SnapshotHistory::new(snapshots).unwrap()
    }

    #[test]
    fn test_single_snapshot_has_no_lag_or_rolling_features() {
        let table = FeatureEngineer::new(&tracked()).engineer(&history_of(&[Some(0.91)]));

        assert_eq!(table.row_count(), 1);
        let row = &table.rows[0];
        assert_eq!(row.rates["EUR"], Some(0.91));
        for features in row.features.values() {
            assert!(features.values().iter().all(Option::is_none));
        }
    }

    #[test]
    fn test_constant_series_rolling_stats() {
        let v = 0.91;
        let table = FeatureEngineer::new(&tracked()).engineer(&history_of(&[Some(v); 30]));

        let last = &table.latest().unwrap().features["EUR"];
        assert_eq!(last.rolling_mean_7, Some(v));
        assert_eq!(last.rolling_mean_30, Some(v));
        assert_eq!(last.rolling_std_7, Some(0.0));
        assert_eq!(last.rolling_std_30, Some(0.0));
        assert_eq!(last.pct_change_1d, Some(0.0));

        // 30-window is undefined until the 30th observation
        assert!(table.rows[28].features["EUR"].rolling_mean_30.is_none());
        assert!(table.rows[6].features["EUR"].rolling_mean_7.is_some());
        assert!(table.rows[5].features["EUR"].rolling_mean_7.is_none());
    }

    #[test]
    fn test_lags_and_percent_changes() {
        let series: Vec<Option<f64>> = (1..=8).map(|i| Some(i as f64)).collect();
        let table = FeatureEngineer::new(&tracked()).engineer(&history_of(&series));

        let last = &table.rows[7].features["EUR"];
        assert_eq!(last.lag_1, Some(7.0));
        assert_eq!(last.lag_7, Some(1.0));
        assert_eq!(last.pct_change_7d, Some(7.0));
        assert!((last.pct_change_1d.unwrap() - 1.0 / 7.0).abs() < 1e-12);
        assert!(table.rows[6].features["EUR"].lag_7.is_none());
    }

    #[test]
    fn test_rolling_std_is_sample_std() {
        let series = [Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(5.0), Some(6.0), Some(7.0)];
        let std = rolling_std(&series, 7);
        // Sample variance of 1..=7 is 28 / 6
        assert!((std[6].unwrap() - (28.0f64 / 6.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_null_inside_window_yields_null() {
        let mut series = vec![Some(1.0); 10];
        series[5] = None;

        let mean = rolling_mean(&series, 7);
        assert!(mean[9].is_none());
        assert!(mean[6].is_none());

        let lagged = lag(&series, 1);
        assert_eq!(lagged[6], None);
        assert_eq!(lagged[7], Some(1.0));
    }

    #[test]
    fn test_zero_base_percent_change_is_null() {
        let pct = pct_change(&[Some(0.0), Some(1.0)], 1);
        assert_eq!(pct, vec![None, None]);
    }

    #[test]
    fn test_no_look_ahead() {
        let series: Vec<Option<f64>> = (0..40).map(|i| Some(1.0 + (i as f64 * 0.37).sin() / 10.0)).collect();
        let history = history_of(&series);
        let engineer = FeatureEngineer::new(&tracked());
        let full = engineer.engineer(&history);

        for k in [1, 7, 8, 29, 30, 31] {
            let partial = engineer.engineer(&history.prefix(k));
            assert_eq!(partial.rows[..], full.rows[..k], "prefix {} diverged", k);
        }
    }

    #[test]
    fn test_calendar_fields() {
        // 2025-11-03 is a Monday
        let at = Utc.with_ymd_and_hms(2025, 11, 3, 14, 30, 0).unwrap();
        let calendar = CalendarFields::from_datetime(at);
        assert_eq!(calendar.day_of_week, 0);
        assert_eq!(calendar.day_of_month, 3);
        assert_eq!(calendar.month, 11);
        assert_eq!(calendar.quarter, 4);
        assert_eq!(calendar.year, 2025);
        assert_eq!(calendar.hour, 14);
    }

    #[test]
    fn test_table_layout() {
        let engineer = FeatureEngineer::new(&["EUR".to_string(), "XAU".to_string()]);
        let table = engineer.engineer(&history_of(&[Some(0.91), Some(0.92)]));

        // XAU never observed: no feature columns for it
        assert_eq!(table.tracked, vec!["EUR"]);

        let data = table.to_table();
        assert_eq!(data.row_count(), 2);
        assert_eq!(data.column_count(), 3 + 6 + 3 + 8);
        assert!(data.has_column("EUR_lag1"));
        assert!(data.has_column("EUR_pct_change_7d"));
        assert!(data.has_column("JPY"));
        assert!(!data.has_column("JPY_lag1"));
        assert_eq!(data.cell(1, "EUR_lag1"), Some("0.91"));
        assert_eq!(data.cell(0, "EUR_lag1"), None);
        assert_eq!(table.feature_count(), 6 + 8);
    }
}
