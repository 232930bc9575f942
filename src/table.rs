// Tabular CSV batches
// Header + rows of optional text cells; an empty cell is a null.

use crate::error::{PipelineError, Result};
use std::io::{Read, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl DataTable {
    pub fn new(headers: Vec<String>) -> Self {
        DataTable {
            headers,
            rows: Vec::new(),
        }
    }

    /// Append a row. The row must have exactly one cell per header.
    pub fn push_row(&mut self, row: Vec<Option<String>>) -> Result<()> {
        if row.len() != self.headers.len() {
            return Err(PipelineError::Schema(format!(
                "row has {} cells, expected {}",
                row.len(),
                self.headers.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Parse CSV with a header row. Ragged rows are a schema error.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);

        let headers: Vec<String> = rdr
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut table = DataTable::new(headers);

        for (index, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| match e.kind() {
                csv::ErrorKind::UnequalLengths { .. } => {
                    PipelineError::Schema(format!("malformed row {}: {}", index + 1, e))
                }
                _ => PipelineError::Csv(e),
            })?;

            let row = record
                .iter()
                .map(|cell| {
                    let cell = cell.trim();
                    if cell.is_empty() {
                        None
                    } else {
                        Some(cell.to_string())
                    }
                })
                .collect();
            table.push_row(row)?;
        }

        Ok(table)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row.iter().map(|c| c.as_deref().unwrap_or("")))?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        Ok(buf)
    }

    /// Write the table to `path`, replacing any existing file atomically.
    pub fn write_csv_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("csv.tmp");
        {
            let file = std::fs::File::create(&tmp)?;
            self.write_csv(file)?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Write the table to `path`, refusing to touch an existing file.
    pub fn write_csv_file_new(&self, path: &Path) -> Result<()> {
        write_new(path, &self.to_csv_bytes()?)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Cells of one column, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<Option<&str>>> {
        let index = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(index).and_then(|c| c.as_deref()))
                .collect(),
        )
    }

    pub fn cell(&self, row: usize, name: &str) -> Option<&str> {
        let index = self.column_index(name)?;
        self.rows.get(row)?.get(index)?.as_deref()
    }
}

/// Format a float for CSV output. Shortest round-trip representation.
pub fn format_float(value: f64) -> String {
    format!("{}", value)
}

pub fn format_optional(value: Option<f64>) -> Option<String> {
    value.filter(|v| v.is_finite()).map(format_float)
}

/// Create `path` and write `bytes`. An existing file is left untouched and
/// reported as a history error: run artifacts are immutable once written.
pub fn write_new(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(PipelineError::History(format!(
                "{} already exists",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    if let Err(e) = file.write_all(bytes).and_then(|_| file.sync_all()) {
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cells_are_null() {
        let csv = "timestamp,EUR,GBP\n20250101_000000,0.91,\n";
        let table = DataTable::from_reader(csv.as_bytes()).unwrap();

        assert_eq!(table.headers, vec!["timestamp", "EUR", "GBP"]);
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.cell(0, "EUR"), Some("0.91"));
        assert_eq!(table.cell(0, "GBP"), None);
    }

    #[test]
    fn test_ragged_rows_are_schema_errors() {
        let csv = "a,b\n1,2\n3\n";
        let err = DataTable::from_reader(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::Schema(_)));
    }

    #[test]
    fn test_write_then_read_preserves_nulls() {
        let mut table = DataTable::new(vec!["x".to_string(), "y".to_string()]);
        table
            .push_row(vec![Some("1.5".to_string()), None])
            .unwrap();

        let bytes = table.to_csv_bytes().unwrap();
        assert_eq!(String::from_utf8(bytes.clone()).unwrap(), "x,y\n1.5,\n");

        let back = DataTable::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_push_row_checks_width() {
        let mut table = DataTable::new(vec!["x".to_string()]);
        assert!(table.push_row(vec![None, None]).is_err());
    }

    #[test]
    fn test_format_optional_drops_non_finite() {
        assert_eq!(format_optional(Some(0.5)), Some("0.5".to_string()));
        assert_eq!(format_optional(Some(f64::NAN)), None);
        assert_eq!(format_optional(None), None);
    }

    #[test]
    fn test_write_new_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw").join("batch.csv");
        let mut first = DataTable::new(vec!["x".to_string()]);
        first.push_row(vec![Some("1".to_string())]).unwrap();
        first.write_csv_file_new(&path).unwrap();

        let mut second = DataTable::new(vec!["x".to_string()]);
        second.push_row(vec![Some("2".to_string())]).unwrap();
        let err = second.write_csv_file_new(&path).unwrap_err();

        assert!(matches!(err, PipelineError::History(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x\n1\n");
    }
}
