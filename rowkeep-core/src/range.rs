//! A1-notation ranges over the record table.

use crate::{Column, StorageError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static A1_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:'((?:[^']|'')+)'|([^!']+))!([A-Za-z])(\d+)(?::([A-Za-z])(\d+)?)?$")
        .expect("A1 pattern is valid")
});

/// A rectangular (possibly open-ended) range of the table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct A1Range {
    pub sheet: String,
    pub start_column: Column,
    pub start_row: u32,
    pub end_column: Column,
    /// `None` means "to the last row".
    pub end_row: Option<u32>,
}

impl A1Range {
    /// Columns `from..=to` of a single row.
    pub fn row_span(sheet: &str, row: u32, from: Column, to: Column) -> Self {
        Self {
            sheet: sheet.to_string(),
            start_column: from,
            start_row: row,
            end_column: to,
            end_row: Some(row),
        }
    }

    /// All five columns of a single row.
    pub fn full_row(sheet: &str, row: u32) -> Self {
        Self::row_span(sheet, row, Column::Id, Column::LastModified)
    }

    /// Columns `from..=to` from `start_row` to the end of the table.
    pub fn open_columns(sheet: &str, from: Column, to: Column, start_row: u32) -> Self {
        Self {
            sheet: sheet.to_string(),
            start_column: from,
            start_row,
            end_column: to,
            end_row: None,
        }
    }

    /// Number of columns covered.
    pub fn width(&self) -> usize {
        self.end_column.index() + 1 - self.start_column.index()
    }

    /// Number of rows covered, if bounded.
    pub fn height(&self) -> Option<u32> {
        self.end_row.map(|end| end + 1 - self.start_row)
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        s.parse()
    }
}

impl fmt::Display for A1Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let needs_quotes = self
            .sheet
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '_'));
        if needs_quotes {
            write!(f, "'{}'!", self.sheet.replace('\'', "''"))?;
        } else {
            write!(f, "{}!", self.sheet)?;
        }
        write!(
            f,
            "{}{}:{}",
            self.start_column.letter(),
            self.start_row,
            self.end_column.letter()
        )?;
        if let Some(end_row) = self.end_row {
            write!(f, "{}", end_row)?;
        }
        Ok(())
    }
}

impl FromStr for A1Range {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| StorageError::InvalidCell {
            column: Column::Id,
            reason: format!("invalid A1 range {:?}: {}", s, reason),
        };

        let caps = A1_PATTERN
            .captures(s.trim())
            .ok_or_else(|| invalid("does not match Sheet!A1[:B2]"))?;

        let sheet = caps
            .get(1)
            .map(|m| m.as_str().replace("''", "'"))
            .or_else(|| caps.get(2).map(|m| m.as_str().to_string()))
            .ok_or_else(|| invalid("missing sheet"))?;

        let letter = |idx: usize| caps.get(idx).and_then(|m| m.as_str().chars().next());
        let start_column = letter(3)
            .and_then(Column::from_letter)
            .ok_or_else(|| invalid("start column outside A..E"))?;
        let start_row: u32 = caps[4].parse().map_err(|_| invalid("bad start row"))?;

        let (end_column, end_row) = match letter(5) {
            Some(l) => {
                let col = Column::from_letter(l).ok_or_else(|| invalid("end column outside A..E"))?;
                let row = match caps.get(6) {
                    Some(m) => Some(m.as_str().parse().map_err(|_| invalid("bad end row"))?),
                    None => None,
                };
                (col, row)
            }
            None => (start_column, Some(start_row)),
        };

        if end_column < start_column {
            return Err(invalid("end column precedes start column"));
        }
        if matches!(end_row, Some(end) if end < start_row) {
            return Err(invalid("end row precedes start row"));
        }

        Ok(Self {
            sheet,
            start_column,
            start_row,
            end_column,
            end_row,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_row_span() {
        let range = A1Range::row_span("Records", 7, Column::IsActive, Column::LastModified);
        assert_eq!(range.to_string(), "Records!C7:E7");
        assert_eq!(range.width(), 3);
        assert_eq!(range.height(), Some(1));
    }

    #[test]
    fn test_display_quotes_sheet_names() {
        let range = A1Range::open_columns("Q&A Users", Column::Id, Column::OwnerKey, 2);
        assert_eq!(range.to_string(), "'Q&A Users'!A2:B");
        assert_eq!(range.height(), None);
    }

    #[test]
    fn test_parse_append_updated_range() {
        let range = A1Range::parse("Records!A12:E12").unwrap();
        assert_eq!(range, A1Range::full_row("Records", 12));
    }

    #[test]
    fn test_parse_quoted_and_single_cell() {
        let range = A1Range::parse("'Bob''s sheet'!e3").unwrap();
        assert_eq!(range.sheet, "Bob's sheet");
        assert_eq!(range.start_column, Column::LastModified);
        assert_eq!(range.end_row, Some(3));
    }

    #[test]
    fn test_parse_rejects_out_of_schema_columns() {
        assert!(A1Range::parse("Records!A2:Z9").is_err());
        assert!(A1Range::parse("Records!C2:A2").is_err());
        assert!(A1Range::parse("A2:E2").is_err());
    }

    #[test]
    fn test_display_parse_agree() {
        for range in [
            A1Range::full_row("Records", 2),
            A1Range::open_columns("Records", Column::Id, Column::LastModified, 2),
            A1Range::row_span("Team sheet", 40, Column::Payload, Column::Payload),
        ] {
            assert_eq!(A1Range::parse(&range.to_string()).unwrap(), range);
        }
    }
}
