// 📊 Profiler - descriptive statistics + self-contained HTML report

use crate::error::Result;
use crate::table::{write_new, DataTable};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Numeric,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericSummary {
    pub mean: f64,
    /// Sample std; None with fewer than two values
    pub std: Option<f64>,
    pub min: f64,
    pub q25: f64,
    pub median: f64,
    pub q75: f64,
    pub max: f64,
    pub zeros: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnProfile {
    pub name: String,
    pub kind: ColumnKind,
    pub count: usize,
    pub missing: usize,
    pub missing_ratio: f64,
    pub distinct: usize,
    pub numeric: Option<NumericSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetProfile {
    pub rows: usize,
    pub columns: usize,
    pub missing_cells: usize,
    pub missing_ratio: f64,
    pub column_profiles: Vec<ColumnProfile>,
}

/// Linear interpolation between closest ranks. `sorted` must be non-empty.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn summarize(values: &[f64]) -> Option<NumericSummary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len() as f64;
    let mean = sorted.iter().sum::<f64>() / n;
    let std = (sorted.len() > 1).then(|| {
        (sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    });

    Some(NumericSummary {
        mean,
        std,
        min: sorted[0],
        q25: quantile(&sorted, 0.25),
        median: quantile(&sorted, 0.5),
        q75: quantile(&sorted, 0.75),
        max: sorted[sorted.len() - 1],
        zeros: sorted.iter().filter(|v| **v == 0.0).count(),
    })
}

fn profile_column(name: &str, cells: &[Option<&str>]) -> ColumnProfile {
    let present: Vec<&str> = cells.iter().flatten().copied().collect();
    let missing = cells.len() - present.len();
    let distinct = present.iter().collect::<BTreeSet<_>>().len();

    let parsed: Option<Vec<f64>> = present.iter().map(|c| c.parse::<f64>().ok()).collect();
    // An all-missing column has nothing to summarize and counts as text
    let (kind, numeric) = match parsed {
        Some(values) if !values.is_empty() => (ColumnKind::Numeric, summarize(&values)),
        _ => (ColumnKind::Text, None),
    };

    ColumnProfile {
        name: name.to_string(),
        kind,
        count: present.len(),
        missing,
        missing_ratio: if cells.is_empty() {
            0.0
        } else {
            missing as f64 / cells.len() as f64
        },
        distinct,
        numeric,
    }
}

pub fn profile(table: &DataTable) -> DatasetProfile {
    let column_profiles: Vec<ColumnProfile> = table
        .headers
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let cells: Vec<Option<&str>> = table
                .rows
                .iter()
                .map(|row| row.get(index).and_then(|c| c.as_deref()))
                .collect();
            profile_column(name, &cells)
        })
        .collect();

    let missing_cells: usize = column_profiles.iter().map(|c| c.missing).sum();
    let total = table.row_count() * table.column_count();

    DatasetProfile {
        rows: table.row_count(),
        columns: table.column_count(),
        missing_cells,
        missing_ratio: if total == 0 {
            0.0
        } else {
            missing_cells as f64 / total as f64
        },
        column_profiles,
    }
}

// ============================================================================
// HTML REPORT
// ============================================================================

pub fn report_title(timestamp: &str) -> String {
    format!("Exchange Rate Data Quality Report - {}", timestamp)
}

pub fn report_file_name(timestamp: &str) -> String {
    format!("data_profile_{}.html", timestamp)
}

pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn num(value: f64) -> String {
    format!("{:.6}", value)
}

const STYLE: &str = "body{font-family:sans-serif;margin:2em;color:#222}\
table{border-collapse:collapse;margin-bottom:2em}\
th,td{border:1px solid #ccc;padding:4px 8px;text-align:right}\
th{background:#f0f0f0}td.name{text-align:left;font-weight:bold}";

pub fn render_html(profile: &DatasetProfile, title: &str) -> String {
    let mut html = String::new();
    let title = escape_html(title);

    // Writing to a String cannot fail
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title>\
         <style>{STYLE}</style></head><body>\n<h1>{title}</h1>\n"
    );

    let _ = write!(
        html,
        "<h2>Overview</h2>\n<table><tr><th>Rows</th><th>Columns</th><th>Missing cells</th>\
         <th>Missing ratio</th></tr>\n<tr><td>{}</td><td>{}</td><td>{}</td><td>{:.4}</td></tr></table>\n",
        profile.rows, profile.columns, profile.missing_cells, profile.missing_ratio
    );

    html.push_str(
        "<h2>Columns</h2>\n<table><tr><th>Column</th><th>Kind</th><th>Count</th><th>Missing</th>\
         <th>Missing ratio</th><th>Distinct</th><th>Mean</th><th>Std</th><th>Min</th>\
         <th>25%</th><th>50%</th><th>75%</th><th>Max</th><th>Zeros</th></tr>\n",
    );

    for column in &profile.column_profiles {
        let kind = match column.kind {
            ColumnKind::Numeric => "numeric",
            ColumnKind::Text => "text",
        };
        let _ = write!(
            html,
            "<tr><td class=\"name\">{}</td><td>{}</td><td>{}</td><td>{}</td><td>{:.4}</td><td>{}</td>",
            escape_html(&column.name),
            kind,
            column.count,
            column.missing,
            column.missing_ratio,
            column.distinct
        );
        match &column.numeric {
            Some(s) => {
                let _ = write!(
                    html,
                    "<td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td>",
                    num(s.mean),
                    s.std.map(num).unwrap_or_default(),
                    num(s.min),
                    num(s.q25),
                    num(s.median),
                    num(s.q75),
                    num(s.max),
                    s.zeros
                );
            }
            None => html.push_str(&"<td></td>".repeat(8)),
        }
        html.push_str("</tr>\n");
    }

    html.push_str("</table>\n</body></html>\n");
    html
}

/// Write `data_profile_{timestamp}.html` under `reports_dir`. An existing
/// report for the same label is never replaced.
pub fn write_report(profile: &DatasetProfile, reports_dir: &Path, timestamp: &str) -> Result<PathBuf> {
    let path = reports_dir.join(report_file_name(timestamp));
    write_new(&path, render_html(profile, &report_title(timestamp)).as_bytes())?;

    tracing::info!(path = %path.display(), columns = profile.columns, "profile report written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DataTable {
        let csv = "timestamp,EUR,note\n\
                   20250101_000000,1,a\n\
                   20250102_000000,2,\n\
                   20250103_000000,3,<b>\n\
                   20250104_000000,,a\n\
                   20250105_000000,0,c\n";
        DataTable::from_reader(csv.as_bytes()).unwrap()
    }

    #[test]
    fn test_quantiles_interpolate_linearly() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&sorted, 0.0), 1.0);
        assert_eq!(quantile(&sorted, 0.5), 2.5);
        assert_eq!(quantile(&sorted, 0.25), 1.75);
        assert_eq!(quantile(&sorted, 1.0), 4.0);
        assert_eq!(quantile(&[7.0], 0.75), 7.0);
    }

    #[test]
    fn test_column_profiles() {
        let profile = profile(&sample());

        assert_eq!(profile.rows, 5);
        assert_eq!(profile.columns, 3);
        assert_eq!(profile.missing_cells, 2);

        let eur = &profile.column_profiles[1];
        assert_eq!(eur.kind, ColumnKind::Numeric);
        assert_eq!(eur.count, 4);
        assert_eq!(eur.missing, 1);
        assert_eq!(eur.missing_ratio, 0.2);
        let stats = eur.numeric.as_ref().unwrap();
        assert_eq!(stats.mean, 1.5);
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.median, 1.5);
        assert_eq!(stats.max, 3.0);
        assert_eq!(stats.zeros, 1);

        let note = &profile.column_profiles[2];
        assert_eq!(note.kind, ColumnKind::Text);
        assert_eq!(note.distinct, 3);
        assert!(note.numeric.is_none());
    }

    #[test]
    fn test_report_is_escaped_and_titled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_report(&profile(&sample()), dir.path(), "20250105_000000").unwrap();

        assert!(path.ends_with("data_profile_20250105_000000.html"));
        let html = std::fs::read_to_string(path).unwrap();
        assert!(html.contains("<title>Exchange Rate Data Quality Report - 20250105_000000</title>"));
        assert!(!html.contains("<b>"));
    }

    #[test]
    fn test_report_for_same_label_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_report(&profile(&sample()), dir.path(), "20250105_000000").unwrap();
        let before = std::fs::read(&path).unwrap();

        let empty = profile(&DataTable::new(vec!["x".to_string()]));
        let err = write_report(&empty, dir.path(), "20250105_000000").unwrap_err();

        assert!(matches!(err, crate::error::PipelineError::History(_)));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_empty_table() {
        let profile = profile(&DataTable::new(vec!["x".to_string()]));
        assert_eq!(profile.rows, 0);
        assert_eq!(profile.missing_ratio, 0.0);
        assert_eq!(profile.column_profiles[0].kind, ColumnKind::Text);
    }
}
