//! Spreadsheet ingestion: parse the first sheet of an uploaded workbook or CSV
//! file and reduce every numeric column to summary statistics.

use calamine::{ open_workbook_auto_from_rs, Data, Reader };
use serde::Serialize;
use serde_json::{ Map, Number, Value };
use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;

use crate::error::{ ChatError, ChatResult };

/// Number of leading rows kept in `Analysis::preview`.
pub const PREVIEW_ROWS: usize = 5;

#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl Cell {
    fn to_json(&self) -> Value {
        match self {
            // Whole numbers render as integers in the preview.
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 =>
                Value::from(*n as i64),
            Cell::Number(n) =>
                Number::from_f64(*n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            Cell::Text(s) => Value::String(s.clone()),
            Cell::Bool(b) => Value::Bool(*b),
        }
    }
}

/// A row maps column position -> cell; empty cells are absent.
pub type Row = Vec<(usize, Cell)>;

#[derive(Clone, Debug, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColumnStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std: f64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub columns: Vec<String>,
    pub row_count: usize,
    pub column_count: usize,
    /// Only columns with at least one numeric cell, in column order.
    pub summary: Map<String, Value>,
    pub preview: Vec<Map<String, Value>>,
    #[serde(skip)]
    stats: Vec<(String, ColumnStats)>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Format {
    Csv,
    Workbook,
}

fn detect_format(file_name: &str) -> ChatResult<Format> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => Ok(Format::Csv),
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Ok(Format::Workbook),
        _ => Err(ChatError::UnsupportedFile(format!("'{}' is not a spreadsheet", file_name))),
    }
}

pub fn is_spreadsheet(file_name: &str) -> bool {
    detect_format(file_name).is_ok()
}

/// Blank headers get `__EMPTY`, `__EMPTY_1`, ... and a repeated name gets a
/// `_1`, `_2`, ... suffix, so every column has a distinct name.
fn normalize_headers(raw: Vec<String>) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut names = Vec::with_capacity(raw.len());
    for h in raw {
        let h = h.trim();
        let base = if h.is_empty() { "__EMPTY" } else { h };
        let mut name = base.to_string();
        let mut n = 0usize;
        while taken.contains(&name) {
            n += 1;
            name = format!("{}_{}", base, n);
        }
        taken.insert(name.clone());
        names.push(name);
    }
    names
}

fn build_row(width: usize, cells: impl Iterator<Item = Option<Cell>>) -> Row {
    cells
        .take(width)
        .enumerate()
        .filter_map(|(i, cell)| cell.map(|c| (i, c)))
        .collect()
}

fn csv_cell(field: &str) -> Option<Cell> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        if n.is_finite() {
            return Some(Cell::Number(n));
        }
    }
    match trimmed.to_lowercase().as_str() {
        "true" => Some(Cell::Bool(true)),
        "false" => Some(Cell::Bool(false)),
        _ => Some(Cell::Text(field.to_string())),
    }
}

fn workbook_cell(data: &Data) -> Option<Cell> {
    match data {
        Data::Empty => None,
        Data::Int(i) => Some(Cell::Number(*i as f64)),
        Data::Float(f) => Some(Cell::Number(*f)),
        Data::Bool(b) => Some(Cell::Bool(*b)),
        Data::String(s) if s.is_empty() => None,
        Data::String(s) => Some(Cell::Text(s.clone())),
        Data::DateTime(dt) => Some(Cell::Number(dt.as_f64())),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(Cell::Text(s.clone())),
        Data::Error(e) => Some(Cell::Text(format!("#{:?}", e))),
    }
}

fn read_csv(bytes: &[u8]) -> ChatResult<Table> {
    let mut reader = csv::ReaderBuilder::new().has_headers(false).flexible(true).from_reader(bytes);
    let mut records = reader.records();
    let headers = match records.next() {
        Some(header) => {
            let header = header.map_err(|e| ChatError::Spreadsheet(e.to_string()))?;
            normalize_headers(header.iter().map(str::to_string).collect())
        }
        None => {
            return Ok(Table::default());
        }
    };
    let mut rows = Vec::new();
    for record in records {
        let record = record.map_err(|e| ChatError::Spreadsheet(e.to_string()))?;
        let row = build_row(headers.len(), record.iter().map(csv_cell));
        if !row.is_empty() {
            rows.push(row);
        }
    }
    Ok(Table { headers, rows })
}

fn read_workbook(bytes: &[u8]) -> ChatResult<Table> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|e|
        ChatError::Spreadsheet(e.to_string())
    )?;
    let sheet = match workbook.sheet_names().first() {
        Some(name) => name.clone(),
        None => {
            return Ok(Table::default());
        }
    };
    let range = workbook.worksheet_range(&sheet).map_err(|e| ChatError::Spreadsheet(e.to_string()))?;

    let mut rows_iter = range.rows();
    let headers = match rows_iter.next() {
        Some(header) =>
            normalize_headers(
                header
                    .iter()
                    .map(|d| match d {
                        Data::Empty => String::new(),
                        other => other.to_string(),
                    })
                    .collect()
            ),
        None => {
            return Ok(Table::default());
        }
    };
    let rows = rows_iter
        .map(|cells| build_row(headers.len(), cells.iter().map(workbook_cell)))
        .filter(|row| !row.is_empty())
        .collect();
    Ok(Table { headers, rows })
}

/// Parses the first sheet of `bytes`, choosing the parser from the file extension.
pub fn read_table(file_name: &str, bytes: &[u8]) -> ChatResult<Table> {
    match detect_format(file_name)? {
        Format::Csv => read_csv(bytes),
        Format::Workbook => read_workbook(bytes),
    }
}

/// Population statistics over `values`; `None` when empty.
pub fn column_stats(values: &[f64]) -> Option<ColumnStats> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance =
        values
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>() / n;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(ColumnStats { mean, min, max, std: variance.sqrt() })
}

/// Columns are the ones populated in the first data row, so a header-only
/// table reports none.
pub fn summarize(table: &Table) -> Analysis {
    let positions: Vec<usize> = table.rows
        .first()
        .map(|row| row.iter().map(|(i, _)| *i).collect())
        .unwrap_or_default();
    let columns: Vec<String> = positions
        .iter()
        .filter_map(|i| table.headers.get(*i).cloned())
        .collect();

    let mut stats = Vec::new();
    for (&position, column) in positions.iter().zip(&columns) {
        let values: Vec<f64> = table.rows
            .iter()
            .filter_map(|row| {
                row.iter().find_map(|(i, cell)| {
                    match cell {
                        Cell::Number(n) if *i == position => Some(*n),
                        _ => None,
                    }
                })
            })
            .collect();
        if let Some(s) = column_stats(&values) {
            stats.push((column.clone(), s));
        }
    }

    let summary = stats
        .iter()
        .filter_map(|(name, s)| serde_json::to_value(s).ok().map(|v| (name.clone(), v)))
        .collect();

    let preview = table.rows
        .iter()
        .take(PREVIEW_ROWS)
        .map(|row|
            row
                .iter()
                .filter_map(|(i, cell)| table.headers.get(*i).map(|h| (h.clone(), cell.to_json())))
                .collect::<Map<String, Value>>()
        )
        .collect();

    Analysis {
        column_count: columns.len(),
        columns,
        row_count: table.rows.len(),
        summary,
        preview,
        stats,
    }
}

pub fn analyze(file_name: &str, bytes: &[u8]) -> ChatResult<Analysis> {
    Ok(summarize(&read_table(file_name, bytes)?))
}

impl Analysis {
    pub fn stats(&self, column: &str) -> Option<&ColumnStats> {
        self.stats
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, s)| s)
    }

    /// The text placed in the chat input after a spreadsheet has been analysed.
    pub fn to_prompt(&self, file_name: &str) -> String {
        let stats = self.stats
            .iter()
            .map(|(col, s)| {
                format!(
                    "{}:\n  Mean: {:.2}\n  Min: {:.2}\n  Max: {:.2}\n  Std Dev: {:.2}",
                    col,
                    s.mean,
                    s.min,
                    s.max,
                    s.std
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let preview = serde_json::to_string_pretty(&self.preview).unwrap_or_else(|_| "[]".into());

        format!(
            "Excel Analysis Results:\n\nFile: {}\nRows: {}\nColumns: {}\n\nColumns: {}\n\nNumeric Column Statistics:\n{}\n\nData Preview:\n{}",
            file_name,
            self.row_count,
            self.column_count,
            self.columns.join(", "),
            stats,
            preview
        )
    }
}
