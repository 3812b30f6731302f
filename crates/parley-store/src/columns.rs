//! Typed column access that names the offending table and column when a
//! stored value no longer parses.

use chrono::{DateTime, Utc};
use rusqlite::types::FromSql;
use rusqlite::Row;

use crate::error::StoreError;

/// Text form written for every timestamp column.
pub fn stamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339()
}

pub struct RowReader<'a, 'stmt> {
    row: &'a Row<'stmt>,
    table: &'static str,
}

impl<'a, 'stmt> RowReader<'a, 'stmt> {
    pub fn new(row: &'a Row<'stmt>, table: &'static str) -> Self {
        Self { row, table }
    }

    fn corrupt(&self, column: &'static str, detail: impl ToString) -> StoreError {
        StoreError::CorruptRow {
            table: self.table,
            column,
            detail: detail.to_string(),
        }
    }

    /// Reads `column` by name; NULL is only accepted when `T` is an `Option`.
    pub fn value<T: FromSql>(&self, column: &'static str) -> Result<T, StoreError> {
        self.row.get(column).map_err(|e| self.corrupt(column, e))
    }

    pub fn timestamp(&self, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
        let raw: String = self.value(column)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|e| self.corrupt(column, format!("{raw:?}: {e}")))
    }

    pub fn json(&self, column: &'static str) -> Result<serde_json::Value, StoreError> {
        let raw: String = self.value(column)?;
        serde_json::from_str(&raw).map_err(|e| self.corrupt(column, e))
    }
}
