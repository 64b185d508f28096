//! Shared Excel reading and writing helpers.
//!
//! Reading goes through `calamine`, writing through `rust_xlsxwriter`. Every
//! module that touches a workbook funnels through here so the cell handling
//! quirks live in one place.

use std::collections::HashMap;
use std::path::Path;

use calamine::{open_workbook, Data, Range, Reader, Xlsx};
use rust_xlsxwriter::{Workbook, Worksheet};

use crate::error::AppError;
use crate::normalize::{self, REQUIRED_COLUMNS};

/// Opens the first worksheet of an `.xlsx` file as an in-memory range.
pub fn open_first_sheet(path: &Path) -> Result<Range<Data>, AppError> {
    let mut workbook: Xlsx<_> = open_workbook(path).map_err(AppError::from)?;
    let sheet_names = workbook.sheet_names().to_owned();
    let first = sheet_names
        .first()
        .ok_or_else(|| AppError::Spreadsheet("workbook has no sheets".into()))?;
    workbook.worksheet_range(first).map_err(AppError::from)
}

/// Builds a map from column index to canonical dataset key by scanning the
/// header row. Unrecognized headers are skipped.
pub fn header_map(header_row: &[Data]) -> HashMap<usize, &'static str> {
    let mut map = HashMap::new();
    for (idx, cell) in header_row.iter().enumerate() {
        if let Some(raw) = normalize::parse_string(cell) {
            if let Some(key) = normalize::normalize_key(&raw) {
                map.insert(idx, key);
            }
        }
    }
    map
}

/// Outcome of probing an upload's header row.
#[derive(Debug)]
pub enum ColumnCheck {
    /// All sixteen dataset columns were recognized.
    Valid,
    /// Some columns are absent; carries the canonical names of the missing
    /// ones for the error message shown to the uploader.
    Missing(Vec<&'static str>),
}

/// Checks that an upload carries every required dataset column.
///
/// Only the header row is inspected, the body of the file is not parsed.
pub fn validate_columns(path: &Path) -> Result<ColumnCheck, AppError> {
    let range = open_first_sheet(path)?;
    let header_row = match range.rows().next() {
        Some(row) => row,
        None => return Ok(ColumnCheck::Missing(REQUIRED_COLUMNS.to_vec())),
    };
    let map = header_map(header_row);
    let missing: Vec<&'static str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|key| !map.values().any(|v| v == key))
        .collect();
    if missing.is_empty() {
        Ok(ColumnCheck::Valid)
    } else {
        Ok(ColumnCheck::Missing(missing))
    }
}

/// A writable cell value for the workbook builder.
#[derive(Debug, Clone)]
pub enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Text(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Text(s)
    }
}

impl From<Option<String>> for Cell {
    fn from(v: Option<String>) -> Self {
        v.map(Cell::Text).unwrap_or(Cell::Empty)
    }
}

impl From<Option<f64>> for Cell {
    fn from(v: Option<f64>) -> Self {
        v.map(Cell::Number).unwrap_or(Cell::Empty)
    }
}

impl From<Option<i64>> for Cell {
    fn from(v: Option<i64>) -> Self {
        v.map(|n| Cell::Number(n as f64)).unwrap_or(Cell::Empty)
    }
}

/// Converts a JSON value (as returned by the remote store) to a cell.
pub fn cell_from_json(value: &serde_json::Value) -> Cell {
    match value {
        serde_json::Value::Null => Cell::Empty,
        serde_json::Value::Number(n) => n.as_f64().map(Cell::Number).unwrap_or(Cell::Empty),
        serde_json::Value::String(s) => Cell::Text(s.clone()),
        serde_json::Value::Bool(b) => Cell::Text(b.to_string()),
        other => Cell::Text(other.to_string()),
    }
}

/// Minimal single-sheet workbook builder used by every export path.
pub struct SheetWriter {
    worksheet: Worksheet,
    next_row: u32,
}

impl SheetWriter {
    /// Starts a sheet and writes the header row.
    pub fn with_headers(sheet_name: &str, headers: &[&str]) -> Result<Self, AppError> {
        let mut worksheet = Worksheet::new();
        worksheet.set_name(sheet_name)?;
        for (col, header) in headers.iter().enumerate() {
            worksheet.write_string(0, col as u16, *header)?;
        }
        Ok(SheetWriter {
            worksheet,
            next_row: 1,
        })
    }

    /// Appends one data row.
    pub fn push_row(&mut self, cells: &[Cell]) -> Result<(), AppError> {
        for (col, cell) in cells.iter().enumerate() {
            match cell {
                Cell::Text(s) => {
                    self.worksheet.write_string(self.next_row, col as u16, s)?;
                }
                Cell::Number(n) => {
                    self.worksheet.write_number(self.next_row, col as u16, *n)?;
                }
                Cell::Empty => {}
            }
        }
        self.next_row += 1;
        Ok(())
    }

    /// Number of data rows written so far (header excluded).
    pub fn row_count(&self) -> u32 {
        self.next_row - 1
    }

    /// Finishes the workbook and returns the `.xlsx` bytes.
    pub fn finish_buffer(self) -> Result<Vec<u8>, AppError> {
        let mut workbook = Workbook::new();
        workbook.push_worksheet(self.worksheet);
        Ok(workbook.save_to_buffer()?)
    }

    /// Finishes the workbook and saves it to `path`.
    pub fn finish_file(self, path: &Path) -> Result<(), AppError> {
        let mut workbook = Workbook::new();
        workbook.push_worksheet(self.worksheet);
        workbook.save(path)?;
        Ok(())
    }
}

/// Convenience for the "no data" case: a workbook with headers only.
pub fn empty_workbook_buffer(sheet_name: &str, headers: &[&str]) -> Result<Vec<u8>, AppError> {
    SheetWriter::with_headers(sheet_name, headers)?.finish_buffer()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_sheet(path: &Path, headers: &[&str], rows: &[Vec<Cell>]) {
        let mut writer = SheetWriter::with_headers("Planilha1", headers).unwrap();
        for row in rows {
            writer.push_row(row).unwrap();
        }
        writer.finish_file(path).unwrap();
    }

    #[test]
    fn header_map_resolves_aliases_and_positions() {
        let row = vec![
            Data::String("CTO".into()),
            Data::String("Lat".into()),
            Data::String("Long".into()),
            Data::String("Observação".into()),
        ];
        let map = header_map(&row);
        assert_eq!(map.get(&0), Some(&"cto"));
        assert_eq!(map.get(&1), Some(&"latitude"));
        assert_eq!(map.get(&2), Some(&"longitude"));
        assert_eq!(map.get(&3), None);
    }

    #[test]
    fn validate_reports_missing_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.xlsx");
        write_sheet(&path, &["cto", "latitude", "longitude"], &[]);

        match validate_columns(&path).unwrap() {
            ColumnCheck::Missing(missing) => {
                assert!(missing.contains(&"cid_rede"));
                assert!(missing.contains(&"pct_ocup"));
                assert!(!missing.contains(&"latitude"));
            }
            ColumnCheck::Valid => panic!("expected missing columns"),
        }
    }

    #[test]
    fn validate_accepts_full_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.xlsx");
        write_sheet(&path, &REQUIRED_COLUMNS, &[]);
        assert!(matches!(validate_columns(&path).unwrap(), ColumnCheck::Valid));
    }

    #[test]
    fn round_trip_preserves_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roundtrip.xlsx");
        write_sheet(
            &path,
            &["nome", "valor"],
            &[
                vec![Cell::Text("alpha".into()), Cell::Number(1.5)],
                vec![Cell::Text("beta".into()), Cell::Empty],
            ],
        );

        let range = open_first_sheet(&path).unwrap();
        let rows: Vec<_> = range.rows().collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][0], Data::String("alpha".into()));
        assert_eq!(rows[1][1], Data::Float(1.5));
        assert_eq!(rows[2][0], Data::String("beta".into()));
    }
}
