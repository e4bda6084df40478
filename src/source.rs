//! Tabular source rows for the vectorizer.
//!
//! The source is a CSV export of the category table:
//!
//! ```text
//! id,name,source_url,created_at,updated_at
//! c-001,Laptops,https://shop.example.com/c/laptops,2024-05-01 10:00:00,2024-05-02 08:30:00
//! c-002,"Phones, Tablets",https://shop.example.com/c/phones,,
//! ```
//!
//! `id` and `name` are required columns; the others may be absent or blank. Quoted fields may
//! contain commas, doubled quotes and line breaks. Rows missing a required value are not fatal:
//! they come back in [`SourceTable::rejected`] so the vectorizer can count them as failures.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::{fs, io::ErrorKind, path::Path};

use crate::error::{Error, Result};

/// One usable source row.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// 1-based line where the row starts, for error messages.
    pub line: usize,
    pub id: String,
    pub name: String,
    pub source_url: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SourceRow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            line: 0,
            id: id.into(),
            name: name.into(),
            source_url: source_url.into(),
            created_at: None,
            updated_at: None,
        }
    }

    /// The text that gets embedded: name and URL separated by a space.
    pub fn embedding_text(&self) -> String {
        format!("{} {}", self.name.trim(), self.source_url.trim())
            .trim()
            .to_string()
    }
}

/// A row that could not be used.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub line: usize,
    pub id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceTable {
    pub rows: Vec<SourceRow>,
    pub rejected: Vec<RowError>,
}

/// Read and parse a CSV source file.
///
/// # Errors
/// - [`Error::InvalidInput`] if the file does not exist, the header lacks `id` or `name`, or a
///   quoted field is never closed.
/// - [`Error::PersistenceFailure`] for other read errors.
pub fn read_source(path: &Path) -> Result<SourceTable> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(Error::invalid_input(format!(
                "source file not found: {}",
                path.display()
            )));
        }
        Err(e) => return Err(Error::persistence(path, e)),
    };
    parse_source(&text)
}

/// Parse CSV text with a header row.
pub fn parse_source(text: &str) -> Result<SourceTable> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut records = split_records(text)?.into_iter();

    let Some((_, header)) = records.next() else {
        return Ok(SourceTable::default());
    };
    let column = |name: &str| {
        header
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    };
    let id_col = column("id").ok_or_else(|| Error::invalid_input("source has no `id` column"))?;
    let name_col =
        column("name").ok_or_else(|| Error::invalid_input("source has no `name` column"))?;
    let url_col = column("source_url");
    let created_col = column("created_at");
    let updated_col = column("updated_at");

    let mut table = SourceTable::default();
    for (line, fields) in records {
        let get = |col: Option<usize>| {
            col.and_then(|c| fields.get(c))
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };
        let id = get(Some(id_col));
        let name = get(Some(name_col));
        if id.is_empty() || name.is_empty() {
            table.rejected.push(RowError {
                line,
                id: (!id.is_empty()).then_some(id),
                message: "row is missing `id` or `name`".to_string(),
            });
            continue;
        }
        table.rows.push(SourceRow {
            line,
            id,
            name,
            source_url: get(url_col),
            created_at: parse_timestamp(&get(created_col)),
            updated_at: parse_timestamp(&get(updated_col)),
        });
    }
    Ok(table)
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]`, `YYYY-MM-DDTHH:MM:SS[.fff]` and
/// `YYYY-MM-DD`. Naive values are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Split CSV text into records of fields, remembering the line each record starts on.
fn split_records(text: &str) -> Result<Vec<(usize, Vec<String>)>> {
    let mut records = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => fields.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                push_record(&mut records, record_line, std::mem::take(&mut fields));
                line += 1;
                record_line = line;
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(Error::invalid_input(format!(
            "unterminated quoted field in record starting at line {record_line}"
        )));
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        push_record(&mut records, record_line, fields);
    }
    Ok(records)
}

fn push_record(records: &mut Vec<(usize, Vec<String>)>, line: usize, fields: Vec<String>) {
    let blank = fields.iter().all(|f| f.trim().is_empty());
    if !blank {
        records.push((line, fields));
    }
}
