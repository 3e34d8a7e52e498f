//! Tabular row buffering and CSV materialization.
//!
//! Rows move through the system as string maps; column order is only imposed
//! when a batch is materialized to CSV, where the journal's required columns
//! come first and any remaining columns follow alphabetically.

use crate::error::{EdgekitError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// One tabular record. Keys are column names.
pub type Row = BTreeMap<String, String>;

/// An in-memory batch of rows destined for one cloud journal file.
#[derive(Debug, Clone)]
pub struct RowBatch {
    required_columns: Vec<String>,
    rows: Vec<Row>,
}

impl RowBatch {
    pub fn new(required_columns: Vec<String>) -> Self {
        Self {
            required_columns,
            rows: Vec::new(),
        }
    }

    pub fn required_columns(&self) -> &[String] {
        &self.required_columns
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Add a row, rejecting it if a required column is missing.
    pub fn add_row(&mut self, row: Row) -> Result<()> {
        for col in &self.required_columns {
            if !row.contains_key(col) {
                return Err(EdgekitError::invalid_config(format!(
                    "row missing required column {col}"
                )));
            }
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn add_rows(&mut self, rows: Vec<Row>) -> Result<()> {
        for row in rows {
            self.add_row(row)?;
        }
        Ok(())
    }

    /// Drain the buffered rows, leaving the batch empty.
    pub fn take_rows(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.rows)
    }

    /// Full column order for materialization: required columns first, then
    /// any extra columns seen in the rows, alphabetically.
    pub fn column_order(&self) -> Vec<String> {
        column_order(&self.required_columns, &self.rows)
    }

    /// Write the buffered rows to a CSV file and clear the buffer.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        let columns = self.column_order();
        let rows = self.take_rows();
        write_rows_csv(path, &columns, &rows)?;
        debug!("Materialized {} rows to {}", rows.len(), path.display());
        Ok(())
    }
}

/// Column order for a set of rows: `required` first, extras alphabetically.
pub fn column_order(required: &[String], rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = required.to_vec();
    let required_set: BTreeSet<&str> = required.iter().map(String::as_str).collect();
    let mut extras: BTreeSet<&str> = BTreeSet::new();
    for row in rows {
        for key in row.keys() {
            if !required_set.contains(key.as_str()) {
                extras.insert(key);
            }
        }
    }
    columns.extend(extras.into_iter().map(str::to_string));
    columns
}

/// Write rows to a CSV file under the given column order. Cells for columns a
/// row does not carry are left empty.
pub fn write_rows_csv(path: &Path, columns: &[String], rows: &[Row]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(columns)?;
    for row in rows {
        let record: Vec<&str> = columns
            .iter()
            .map(|c| row.get(c).map(String::as_str).unwrap_or(""))
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a CSV file back into rows. Empty cells are omitted from the row map.
pub fn read_rows_csv(path: &Path) -> Result<Vec<Row>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = Row::new();
        for (col, value) in headers.iter().zip(record.iter()) {
            if !value.is_empty() {
                row.insert(col.clone(), value.to_string());
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Read only the header row of a CSV file.
pub fn read_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)?;
    Ok(reader.headers()?.iter().map(str::to_string).collect())
}

/// Parse CSV content from a byte buffer into (header, rows).
pub fn parse_csv_bytes(bytes: &[u8]) -> Result<(Vec<String>, Vec<Row>)> {
    let mut reader = csv::Reader::from_reader(bytes);
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = Row::new();
        for (col, value) in headers.iter().zip(record.iter()) {
            if !value.is_empty() {
                row.insert(col.clone(), value.to_string());
            }
        }
        rows.push(row);
    }
    Ok((headers, rows))
}

/// Serialize (header, rows) to CSV bytes.
pub fn rows_to_csv_bytes(columns: &[String], rows: &[Row]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(columns)?;
    for row in rows {
        let record: Vec<&str> = columns
            .iter()
            .map(|c| row.get(c).map(String::as_str).unwrap_or(""))
            .collect();
        writer.write_record(&record)?;
    }
    writer
        .into_inner()
        .map_err(|e| EdgekitError::invalid_config(format!("csv flush failed: {e}")))
}

/// Serialize rows to CSV bytes without a header row, for appending to a blob
/// that already carries one.
pub fn rows_to_csv_body_bytes(columns: &[String], rows: &[Row]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        let record: Vec<&str> = columns
            .iter()
            .map(|c| row.get(c).map(String::as_str).unwrap_or(""))
            .collect();
        writer.write_record(&record)?;
    }
    writer
        .into_inner()
        .map_err(|e| EdgekitError::invalid_config(format!("csv flush failed: {e}")))
}
