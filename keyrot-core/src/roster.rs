//! Roster parsing.
//!
//! The roster is delimited text whose first row names the columns.  Parsing is
//! a single pass straight into [`UserRecord`]s: a row with the wrong number of
//! fields, an empty required value or an invalid account/username aborts the
//! whole parse with the offending row number.  Rows are never dropped.
//!
//! Fields may be wrapped in double quotes (RFC 4180 style, `""` escapes a
//! quote) when they need to contain the delimiter.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::RotationError;
use crate::model::{AccountId, LocalUsername, UserRecord};

const UTF8_BOM: &str = "\u{feff}";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RosterError {
    #[error("roster is empty")]
    Empty,
    #[error("roster is not valid {0}")]
    Encoding(&'static str),
    #[error("row {row}: expected {expected} fields, found {found}")]
    FieldCount {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("row {row}: unterminated quoted field")]
    UnterminatedQuote { row: usize },
    #[error("header has no column named {0:?}")]
    MissingColumn(String),
    #[error("header names column {0:?} more than once")]
    DuplicateColumn(String),
    #[error("row {row}: column {column:?} is empty")]
    EmptyValue { row: usize, column: String },
    #[error("row {row}: {reason}")]
    InvalidValue { row: usize, reason: String },
}

impl RosterError {
    /// The 1-based row the error refers to (the header is row 1).
    pub fn row(&self) -> usize {
        match self {
            Self::Empty | Self::Encoding(_) | Self::MissingColumn(_) | Self::DuplicateColumn(_) => 1,
            Self::FieldCount { row, .. }
            | Self::UnterminatedQuote { row }
            | Self::EmptyValue { row, .. }
            | Self::InvalidValue { row, .. } => *row,
        }
    }
}

impl From<RosterError> for RotationError {
    fn from(err: RosterError) -> Self {
        RotationError::MalformedRoster {
            row: err.row(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RosterEncoding {
    #[serde(alias = "utf8")]
    Utf8,
    #[serde(alias = "iso-8859-1")]
    Latin1,
}

/// Which header names map to the [`UserRecord`] fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    #[serde(default = "default_account_column")]
    pub account_column: String,
    #[serde(default = "default_username_column")]
    pub username_column: String,
    #[serde(default = "default_email_column")]
    pub email_column: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            account_column: default_account_column(),
            username_column: default_username_column(),
            email_column: default_email_column(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterFormat {
    pub delimiter: char,
    pub encoding: RosterEncoding,
    pub columns: ColumnMap,
}

impl Default for RosterFormat {
    fn default() -> Self {
        Self {
            delimiter: ',',
            encoding: RosterEncoding::Utf8,
            columns: ColumnMap::default(),
        }
    }
}

/// Parse raw roster bytes into user records, in roster order.
pub fn parse(raw: &[u8], format: &RosterFormat) -> Result<Vec<UserRecord>, RosterError> {
    let text = decode(raw, format.encoding)?;
    let text = text.strip_prefix(UTF8_BOM).unwrap_or(&text);

    let mut rows = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.trim().is_empty());

    let (header_row, header_line) = rows.next().ok_or(RosterError::Empty)?;
    let header = split_row(header_line, format.delimiter, header_row)?;
    let header: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();

    for (i, name) in header.iter().enumerate() {
        if header[..i].contains(name) {
            return Err(RosterError::DuplicateColumn(name.clone()));
        }
    }
    let column = |name: &str| {
        header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| RosterError::MissingColumn(name.to_string()))
    };
    let account_idx = column(&format.columns.account_column)?;
    let username_idx = column(&format.columns.username_column)?;
    let email_idx = column(&format.columns.email_column)?;

    let mut records = Vec::new();
    // One row per account: two rows for the same user would fight over one tag.
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    for (row, line) in rows {
        let fields = split_row(line, format.delimiter, row)?;
        if fields.len() != header.len() {
            return Err(RosterError::FieldCount {
                row,
                expected: header.len(),
                found: fields.len(),
            });
        }

        let value = |idx: usize| {
            let v = fields[idx].trim();
            if v.is_empty() {
                Err(RosterError::EmptyValue {
                    row,
                    column: header[idx].clone(),
                })
            } else {
                Ok(v)
            }
        };
        let invalid = |e: RotationError| RosterError::InvalidValue {
            row,
            reason: e.to_string(),
        };

        let record = UserRecord {
            row,
            account_id: AccountId::parse(value(account_idx)?).map_err(invalid)?,
            local_username: LocalUsername::parse(value(username_idx)?).map_err(invalid)?,
            email: value(email_idx)?.to_string(),
        };
        if let Some(first) = first_seen.insert(record.local_username.as_str().to_string(), row) {
            return Err(RosterError::InvalidValue {
                row,
                reason: format!(
                    "duplicate local username {:?} (first seen at row {first})",
                    record.local_username.as_str()
                ),
            });
        }
        records.push(record);
    }

    Ok(records)
}

fn decode(raw: &[u8], encoding: RosterEncoding) -> Result<String, RosterError> {
    match encoding {
        RosterEncoding::Utf8 => String::from_utf8(raw.to_vec()).map_err(|_| RosterError::Encoding("UTF-8")),
        // Every byte maps to the code point of the same value.
        RosterEncoding::Latin1 => Ok(raw.iter().map(|&b| char::from(b)).collect()),
    }
}

/// Split one physical line on `delim`, honouring double-quoted fields.
fn split_row(line: &str, delim: char, row: usize) -> Result<Vec<String>, RosterError> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
        } else if c == '"' && field.trim().is_empty() {
            field.clear();
            in_quotes = true;
        } else if c == delim {
            fields.push(std::mem::take(&mut field));
        } else {
            field.push(c);
        }
    }

    if in_quotes {
        return Err(RosterError::UnterminatedQuote { row });
    }
    fields.push(field);
    Ok(fields)
}

fn default_account_column() -> String {
    "aws_username".to_string()
}

fn default_username_column() -> String {
    "linux_username".to_string()
}

fn default_email_column() -> String {
    "email".to_string()
}
