//! Cycler telemetry normalization
//!
//! Renames vendor columns to the canonical schema, drops ignored columns,
//! coerces each canonical column to its fixed dtype and derives the
//! timestamp and step columns. Input is an already-delimited table with a
//! header row; quoting is not supported.

use chrono::{NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;

/// Vendor header (trimmed, lowercase) to canonical column name
pub const COLUMN_MAPPING: &[(&str, &str)] = &[
    ("test_time (s)", "test_time"),
    ("date_time", "date_time"),
    ("cycle_index", "cycle_index"),
    ("cycle_time (s)", "cycle_time"),
    ("current (a)", "current"),
    ("voltage (v)", "voltage"),
    ("charge_capacity (ah)", "charge_capacity"),
    ("discharge_capacity (ah)", "discharge_capacity"),
    ("charge_energy (wh)", "charge_energy"),
    ("discharge_energy (wh)", "discharge_energy"),
    ("cell_temperature (c)", "temperature"),
];

/// Vendor columns dropped during normalization
pub const COLUMNS_IGNORE: &[&str] = &["environment_temperature (c)"];

/// Timestamp format of the vendor `date_time` column
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Float64,
    Float32,
    Int32,
    Text,
}

const DTYPES: &[(&str, Dtype)] = &[
    ("test_time", Dtype::Float64),
    ("cycle_index", Dtype::Int32),
    ("cycle_time", Dtype::Float64),
    ("current", Dtype::Float32),
    ("voltage", Dtype::Float32),
    ("charge_capacity", Dtype::Float64),
    ("discharge_capacity", Dtype::Float64),
    ("charge_energy", Dtype::Float64),
    ("discharge_energy", Dtype::Float64),
    ("temperature", Dtype::Float32),
];

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Table has no header row")]
    MissingHeader,

    #[error("Row {row}: expected {expected} fields, found {found}")]
    RowLength { row: usize, expected: usize, found: usize },

    #[error("Row {row}: quoted fields are not supported")]
    QuotedField { row: usize },

    #[error("Row {row}: invalid {column} value {value:?}")]
    InvalidValue { row: usize, column: String, value: String },

    #[error("Column {0} appears more than once")]
    DuplicateColumn(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "dtype", content = "values", rename_all = "lowercase")]
pub enum ColumnData {
    Float64(Vec<Option<f64>>),
    Float32(Vec<Option<f32>>),
    Int32(Vec<Option<i32>>),
    Text(Vec<Option<String>>),
}

impl ColumnData {
    pub fn dtype(&self) -> Dtype {
        match self {
            ColumnData::Float64(_) => Dtype::Float64,
            ColumnData::Float32(_) => Dtype::Float32,
            ColumnData::Int32(_) => Dtype::Int32,
            ColumnData::Text(_) => Dtype::Text,
        }
    }

    fn display(&self, row: usize) -> String {
        match self {
            ColumnData::Float64(v) => v[row].map(|x| x.to_string()),
            ColumnData::Float32(v) => v[row].map(|x| x.to_string()),
            ColumnData::Int32(v) => v[row].map(|x| x.to_string()),
            ColumnData::Text(v) => v[row].clone(),
        }
        .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(flatten)]
    pub data: ColumnData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryTable {
    pub columns: Vec<Column>,
    pub row_count: usize,
}

fn canonical_name(header: &str) -> Option<String> {
    let key = header.trim().to_lowercase();
    if COLUMNS_IGNORE.contains(&key.as_str()) {
        return None;
    }
    let name = COLUMN_MAPPING
        .iter()
        .find(|(vendor, _)| *vendor == key)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| header.trim().to_string());
    Some(name)
}

fn dtype_of(name: &str) -> Dtype {
    DTYPES
        .iter()
        .find(|(column, _)| *column == name)
        .map(|(_, dtype)| *dtype)
        .unwrap_or(Dtype::Text)
}

fn parse_cells<T: std::str::FromStr>(
    name: &str,
    cells: &[&str],
) -> Result<Vec<Option<T>>, TelemetryError> {
    cells
        .iter()
        .enumerate()
        .map(|(row, cell)| {
            let cell = cell.trim();
            if cell.is_empty() {
                return Ok(None);
            }
            cell.parse::<T>().map(Some).map_err(|_| TelemetryError::InvalidValue {
                row: row + 1,
                column: name.to_string(),
                value: cell.to_string(),
            })
        })
        .collect()
}

/// `date_time` cells to unix seconds and RFC 3339 UTC strings.
fn parse_timestamps(cells: &[&str]) -> Result<(Vec<Option<f64>>, Vec<Option<String>>), TelemetryError> {
    let mut seconds = Vec::with_capacity(cells.len());
    let mut iso = Vec::with_capacity(cells.len());
    for (row, cell) in cells.iter().enumerate() {
        let cell = cell.trim();
        if cell.is_empty() {
            seconds.push(None);
            iso.push(None);
            continue;
        }
        let naive = NaiveDateTime::parse_from_str(cell, DATE_TIME_FORMAT).map_err(|_| {
            TelemetryError::InvalidValue {
                row: row + 1,
                column: "date_time".to_string(),
                value: cell.to_string(),
            }
        })?;
        let utc = Utc.from_utc_datetime(&naive);
        seconds.push(Some(utc.timestamp() as f64 + f64::from(utc.timestamp_subsec_nanos()) / 1e9));
        iso.push(Some(utc.to_rfc3339_opts(SecondsFormat::AutoSi, true)));
    }
    Ok((seconds, iso))
}

impl TelemetryTable {
    /// Normalize a delimited table whose first line is the header.
    pub fn from_delimited(text: &str, delimiter: char) -> Result<Self, TelemetryError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header_line = lines.next().ok_or(TelemetryError::MissingHeader)?;
        if header_line.contains('"') {
            return Err(TelemetryError::QuotedField { row: 0 });
        }
        let headers: Vec<&str> = header_line.split(delimiter).collect();

        let mut rows: Vec<Vec<&str>> = Vec::new();
        for (index, line) in lines.enumerate() {
            let row = index + 1;
            if line.contains('"') {
                return Err(TelemetryError::QuotedField { row });
            }
            let fields: Vec<&str> = line.split(delimiter).collect();
            if fields.len() != headers.len() {
                return Err(TelemetryError::RowLength {
                    row,
                    expected: headers.len(),
                    found: fields.len(),
                });
            }
            rows.push(fields);
        }

        let mut columns: Vec<Column> = Vec::new();
        let mut extra: Vec<Column> = Vec::new();
        for (index, header) in headers.iter().enumerate() {
            let Some(name) = canonical_name(header) else {
                tracing::debug!("dropping ignored column {}", header.trim());
                continue;
            };
            if columns.iter().any(|c| c.name == name) {
                return Err(TelemetryError::DuplicateColumn(name));
            }
            let cells: Vec<&str> = rows.iter().map(|r| r[index]).collect();

            if name == "date_time" {
                let (seconds, iso) = parse_timestamps(&cells)?;
                columns.push(Column {
                    name: name.clone(),
                    data: ColumnData::Float64(seconds),
                });
                extra.push(Column {
                    name: "date_time_iso".to_string(),
                    data: ColumnData::Text(iso),
                });
                continue;
            }

            let data = match dtype_of(&name) {
                Dtype::Float64 => ColumnData::Float64(parse_cells(&name, &cells)?),
                Dtype::Float32 => ColumnData::Float32(parse_cells(&name, &cells)?),
                Dtype::Int32 => ColumnData::Int32(parse_cells(&name, &cells)?),
                Dtype::Text => ColumnData::Text(
                    cells
                        .iter()
                        .map(|c| Some(c.trim().to_string()).filter(|s| !s.is_empty()))
                        .collect(),
                ),
            };
            columns.push(Column { name, data });
        }

        for (source, derived) in [("cycle_index", "step_index"), ("cycle_time", "step_time")] {
            if let Some(column) = columns.iter().find(|c| c.name == source) {
                extra.push(Column {
                    name: derived.to_string(),
                    data: column.data.clone(),
                });
            }
        }
        columns.extend(extra);

        tracing::info!("Normalized {} rows, {} columns", rows.len(), columns.len());
        Ok(Self {
            columns,
            row_count: rows.len(),
        })
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Write back out with canonical headers.
    pub fn to_delimited(&self, delimiter: char) -> String {
        let sep = delimiter.to_string();
        let mut out = self.column_names().join(&sep);
        out.push('\n');
        for row in 0..self.row_count {
            let cells: Vec<String> = self.columns.iter().map(|c| c.data.display(row)).collect();
            out.push_str(&cells.join(&sep));
            out.push('\n');
        }
        out
    }
}
