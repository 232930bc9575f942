// ✅ Quality Gate - fail-fast validation of raw snapshot batches
//
// Pure function of the batch and the thresholds: same input, same verdict.
// A failing verdict halts the run; nothing downstream sees the batch.

use crate::config::QualityThresholds;
use crate::error::{PipelineError, Result};
use crate::snapshot::{target_columns, REQUIRED_COLUMNS};
use crate::table::DataTable;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// CHECK RESULT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // Batch must not flow downstream
    Warning,  // Within tolerance but worth a look
    Info,     // Check passed
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub passed: bool,
    pub rule_name: String,
    pub message: String,
    pub severity: Severity,
}

impl CheckResult {
    pub fn pass(rule_name: &str, message: &str) -> Self {
        CheckResult {
            passed: true,
            rule_name: rule_name.to_string(),
            message: message.to_string(),
            severity: Severity::Info,
        }
    }

    pub fn warn(rule_name: &str, message: &str) -> Self {
        CheckResult {
            passed: true,
            rule_name: rule_name.to_string(),
            message: message.to_string(),
            severity: Severity::Warning,
        }
    }

    pub fn fail(rule_name: &str, message: &str) -> Self {
        CheckResult {
            passed: false,
            rule_name: rule_name.to_string(),
            message: message.to_string(),
            severity: Severity::Critical,
        }
    }
}

// ============================================================================
// QUALITY VERDICT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub pass: bool,
    pub null_ratio: f64,
    pub currency_count: usize,
    /// Messages of every failed check, in evaluation order
    pub reasons: Vec<String>,
    pub checks: Vec<CheckResult>,
    pub row_count: usize,
    pub column_count: usize,
}

impl QualityVerdict {
    pub fn summary(&self) -> String {
        format!(
            "{}: null_ratio {:.4}, {} currencies, {} rows x {} columns, {} of {} checks passed",
            if self.pass { "PASSED" } else { "FAILED" },
            self.null_ratio,
            self.currency_count,
            self.row_count,
            self.column_count,
            self.checks.iter().filter(|c| c.passed).count(),
            self.checks.len()
        )
    }

    /// Metrics handed to experiment tracking.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();
        metrics.insert("null_ratio".to_string(), self.null_ratio);
        metrics.insert("num_currencies".to_string(), self.currency_count as f64);
        metrics.insert("num_rows".to_string(), self.row_count as f64);
        metrics.insert("num_columns".to_string(), self.column_count as f64);
        metrics
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks
            .iter()
            .filter(|c| c.passed && c.severity == Severity::Warning)
    }
}

// ============================================================================
// QUALITY GATE
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    thresholds: QualityThresholds,
}

impl QualityGate {
    pub fn new(thresholds: QualityThresholds) -> Self {
        QualityGate { thresholds }
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Evaluate every check and collect the verdict.
    pub fn evaluate(&self, batch: &DataTable) -> QualityVerdict {
        let targets = target_columns(batch);
        let mut checks = Vec::new();

        // Rule 1: batch has rows
        checks.push(self.check_rows(batch));

        // Rule 2: required columns present
        checks.extend(self.check_required_columns(batch));

        // Rule 3: no duplicated column names
        checks.push(self.check_unique_columns(batch));

        // Rule 4: null ratio over target cells
        let null_ratio = null_ratio(batch, &targets);
        checks.push(self.check_null_ratio(null_ratio));

        // Rule 5: enough non-null currency columns
        let currency_count = currency_count(batch, &targets);
        checks.push(self.check_currency_count(currency_count));

        // Rule 6: every target column numeric
        checks.extend(self.check_numeric(batch, &targets));

        let reasons: Vec<String> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.message.clone())
            .collect();

        QualityVerdict {
            pass: reasons.is_empty(),
            null_ratio,
            currency_count,
            reasons,
            checks,
            row_count: batch.row_count(),
            column_count: batch.column_count(),
        }
    }

    /// Evaluate and turn a failing verdict into the halting error.
    pub fn enforce(&self, batch: &DataTable) -> Result<QualityVerdict> {
        let verdict = self.evaluate(batch);
        if verdict.pass {
            Ok(verdict)
        } else {
            Err(PipelineError::QualityGate {
                reasons: verdict.reasons,
            })
        }
    }

    // ========================================================================
    // VALIDATION RULES
    // ========================================================================

    fn check_rows(&self, batch: &DataTable) -> CheckResult {
        if batch.row_count() == 0 {
            return CheckResult::fail("rows_present", "batch contains no rows");
        }
        CheckResult::pass(
            "rows_present",
            &format!("batch contains {} rows", batch.row_count()),
        )
    }

    fn check_required_columns(&self, batch: &DataTable) -> Vec<CheckResult> {
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|col| !batch.has_column(col))
            .collect();

        if missing.is_empty() {
            return vec![CheckResult::pass(
                "required_columns",
                "all required columns present",
            )];
        }

        missing
            .into_iter()
            .map(|col| {
                CheckResult::fail(
                    "required_columns",
                    &format!("missing required column: {}", col),
                )
            })
            .collect()
    }

    fn check_unique_columns(&self, batch: &DataTable) -> CheckResult {
        let mut seen = BTreeSet::new();
        for header in &batch.headers {
            if !seen.insert(header.as_str()) {
                return CheckResult::fail("unique_columns", &format!("duplicate column: {}", header));
            }
        }
        CheckResult::pass("unique_columns", "column names are unique")
    }

    fn check_null_ratio(&self, ratio: f64) -> CheckResult {
        let max = self.thresholds.max_null_ratio;
        if ratio > max {
            return CheckResult::fail(
                "null_ratio",
                &format!("null_ratio {:.2} exceeds {:.2}", ratio, max),
            );
        }
        if ratio > 0.0 {
            return CheckResult::warn(
                "null_ratio",
                &format!("null_ratio {:.4} within tolerance {:.2}", ratio, max),
            );
        }
        CheckResult::pass("null_ratio", "no null target cells")
    }

    fn check_currency_count(&self, count: usize) -> CheckResult {
        let min = self.thresholds.min_currency_count;
        if count < min {
            return CheckResult::fail(
                "currency_count",
                &format!("currency_count {} below minimum {}", count, min),
            );
        }
        CheckResult::pass(
            "currency_count",
            &format!("{} currencies present (minimum {})", count, min),
        )
    }

    fn check_numeric(&self, batch: &DataTable, targets: &[&str]) -> Vec<CheckResult> {
        let failures: Vec<CheckResult> = targets
            .iter()
            .filter(|col| !is_numeric_column(batch, col))
            .map(|col| CheckResult::fail("numeric_rates", &format!("column {} is not numeric", col)))
            .collect();

        if failures.is_empty() {
            vec![CheckResult::pass("numeric_rates", "all currency columns are numeric")]
        } else {
            failures
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// nulls / total target cells. Zero when there are no target cells.
pub fn null_ratio(batch: &DataTable, targets: &[&str]) -> f64 {
    let total = batch.row_count() * targets.len();
    if total == 0 {
        return 0.0;
    }

    let nulls: usize = targets
        .iter()
        .filter_map(|col| batch.column(col))
        .map(|cells| cells.iter().filter(|c| c.is_none()).count())
        .sum();

    nulls as f64 / total as f64
}

/// Target columns with at least one non-null cell.
pub fn currency_count(batch: &DataTable, targets: &[&str]) -> usize {
    targets
        .iter()
        .filter_map(|col| batch.column(col))
        .filter(|cells| cells.iter().any(|c| c.is_some()))
        .count()
}

fn is_numeric_column(batch: &DataTable, name: &str) -> bool {
    batch.column(name).map_or(true, |cells| {
        cells
            .iter()
            .flatten()
            .all(|cell| cell.parse::<f64>().map_or(false, f64::is_finite))
    })
}

// ============================================================================
// TESTS
// ============================================================================
