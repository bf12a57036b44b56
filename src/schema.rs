//! Source table metadata.
//!
//! Column names, type categories and primary-key layout are queried from
//! `INFORMATION_SCHEMA.COLUMNS` once per rule at startup and refreshed when
//! a DDL statement touching the table is observed on the binlog. Binlog row
//! events carry no column names, so everything downstream (document ids,
//! field projection, type conversion) depends on this cache.

use crate::error::{Result, RiverError};
use mysql_async::prelude::*;
use mysql_async::Pool;
use serde::{Deserialize, Serialize};

/// Category of a MySQL column type, as far as document conversion cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Number,
    Float,
    String,
    Enum,
    Set,
    Bit,
    Json,
    Datetime,
    Timestamp,
    Date,
}

/// A single column descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    pub col_type: ColumnType,
    /// Literals of an ENUM column, in declaration order (1-based on the wire)
    pub enum_values: Vec<String>,
    /// Literals of a SET column, in declaration order (bit i on the wire)
    pub set_values: Vec<String>,
}

/// Ordered column metadata for one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub columns: Vec<TableColumn>,
    /// Indexes into `columns` of the primary-key columns, in key order
    pub pk_columns: Vec<usize>,
}

impl TableInfo {
    /// Fetch column metadata for `schema.table` from the source catalog.
    pub async fn fetch(pool: &Pool, schema: &str, table: &str) -> Result<TableInfo> {
        let mut conn = pool.get_conn().await?;

        let rows: Vec<(String, String, String)> = conn
            .exec(
                r"SELECT COLUMN_NAME, COLUMN_TYPE, COLUMN_KEY
                  FROM INFORMATION_SCHEMA.COLUMNS
                  WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
                  ORDER BY ORDINAL_POSITION",
                (schema, table),
            )
            .await?;

        if rows.is_empty() {
            return Err(RiverError::schema(format!(
                "table {}.{} not found in source catalog",
                schema, table
            )));
        }

        let mut info = TableInfo {
            schema: schema.to_string(),
            name: table.to_string(),
            columns: Vec::with_capacity(rows.len()),
            pk_columns: Vec::new(),
        };

        for (i, (name, raw_type, key)) in rows.into_iter().enumerate() {
            if key == "PRI" {
                info.pk_columns.push(i);
            }
            info.columns.push(parse_column(&name, &raw_type));
        }

        Ok(info)
    }

    /// Find a column position by name.
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Parse one `COLUMN_TYPE` value (e.g. `int(11) unsigned`, `enum('a','b')`)
/// into a column descriptor.
fn parse_column(name: &str, raw_type: &str) -> TableColumn {
    let lower = raw_type.to_lowercase();

    let mut column = TableColumn {
        name: name.to_string(),
        col_type: ColumnType::String,
        enum_values: Vec::new(),
        set_values: Vec::new(),
    };

    if let Some(body) = lower.strip_prefix("enum(") {
        column.col_type = ColumnType::Enum;
        column.enum_values = parse_literals(body);
    } else if let Some(body) = lower.strip_prefix("set(") {
        column.col_type = ColumnType::Set;
        column.set_values = parse_literals(body);
    } else if lower.starts_with("bit") {
        column.col_type = ColumnType::Bit;
    } else if lower.starts_with("json") {
        column.col_type = ColumnType::Json;
    } else if lower.starts_with("datetime") {
        column.col_type = ColumnType::Datetime;
    } else if lower.starts_with("timestamp") {
        column.col_type = ColumnType::Timestamp;
    } else if lower.starts_with("date") {
        column.col_type = ColumnType::Date;
    } else if lower.starts_with("float")
        || lower.starts_with("double")
        || lower.starts_with("decimal")
        || lower.starts_with("numeric")
        || lower.starts_with("real")
    {
        column.col_type = ColumnType::Float;
    } else if lower.contains("int") || lower.starts_with("year") {
        // tinyint, smallint, mediumint, int, bigint, year
        column.col_type = ColumnType::Number;
    }

    column
}

/// Parse the literal list of an enum/set definition body: `'a','b','c')`.
///
/// MySQL doubles embedded single quotes inside the literals.
fn parse_literals(body: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    current.push('\'');
                } else {
                    in_string = false;
                    values.push(std::mem::take(&mut current));
                }
            } else {
                current.push(c);
            }
        } else if c == '\'' {
            in_string = true;
        } else if c == ')' {
            break;
        }
        // commas and whitespace between literals are skipped
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric_types() {
        assert_eq!(parse_column("n", "int(11)").col_type, ColumnType::Number);
        assert_eq!(
            parse_column("n", "bigint(20) unsigned").col_type,
            ColumnType::Number
        );
        assert_eq!(parse_column("n", "tinyint(1)").col_type, ColumnType::Number);
        assert_eq!(parse_column("n", "year(4)").col_type, ColumnType::Number);
        assert_eq!(parse_column("n", "float").col_type, ColumnType::Float);
        assert_eq!(
            parse_column("n", "decimal(10,2)").col_type,
            ColumnType::Float
        );
    }

    #[test]
    fn test_parse_temporal_types() {
        assert_eq!(
            parse_column("t", "datetime(6)").col_type,
            ColumnType::Datetime
        );
        assert_eq!(
            parse_column("t", "timestamp").col_type,
            ColumnType::Timestamp
        );
        // "date" must not swallow "datetime"
        assert_eq!(parse_column("t", "date").col_type, ColumnType::Date);
    }

    #[test]
    fn test_parse_enum() {
        let col = parse_column("e", "enum('e1','e2','e3')");
        assert_eq!(col.col_type, ColumnType::Enum);
        assert_eq!(col.enum_values, vec!["e1", "e2", "e3"]);
    }

    #[test]
    fn test_parse_set() {
        let col = parse_column("s", "set('a','b','c')");
        assert_eq!(col.col_type, ColumnType::Set);
        assert_eq!(col.set_values, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_parse_enum_embedded_quote() {
        let col = parse_column("e", "enum('it''s','plain')");
        assert_eq!(col.enum_values, vec!["it's", "plain"]);
    }

    #[test]
    fn test_parse_misc_types() {
        assert_eq!(parse_column("b", "bit(8)").col_type, ColumnType::Bit);
        assert_eq!(parse_column("j", "json").col_type, ColumnType::Json);
        assert_eq!(
            parse_column("s", "varchar(256)").col_type,
            ColumnType::String
        );
        assert_eq!(parse_column("s", "text").col_type, ColumnType::String);
        assert_eq!(parse_column("s", "blob").col_type, ColumnType::String);
    }

    #[test]
    fn test_find_column() {
        let info = TableInfo {
            schema: "test".into(),
            name: "t".into(),
            columns: vec![
                parse_column("id", "int(11)"),
                parse_column("title", "varchar(256)"),
            ],
            pk_columns: vec![0],
        };
        assert_eq!(info.find_column("title"), Some(1));
        assert_eq!(info.find_column("missing"), None);
    }
}
