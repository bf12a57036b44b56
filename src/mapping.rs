//! Row-to-document mapping engine.
//!
//! Converts each row tuple of a source event, through its matching rule,
//! into bulk document actions: inserts become `index`, deletes become
//! `delete`, and updates become either a partial `update`, a full `index`
//! (when an ingest pipeline is configured), or a `delete` plus `index` pair
//! when the document identity itself changed.
//!
//! Values arrive in two shapes for the same logical row — dump literals and
//! binlog images — and conversion makes both land on the same JSON: enum
//! ordinals resolve to their literals, set bitmasks to joined member lists,
//! temporal values to RFC 3339.

use crate::canal::RowAction;
use crate::error::{Result, RiverError};
use crate::es::{BulkAction, BulkRequest};
use crate::rule::{Rule, FIELD_TYPE_DATE, FIELD_TYPE_LIST};
use crate::schema::{ColumnType, TableColumn};
use chrono::{Local, NaiveDate, NaiveDateTime, TimeZone};
use mysql_async::Value;
use serde_json::{json, Map, Value as Json};
use tracing::warn;

/// Build bulk requests for one row event.
pub fn make_requests(rule: &Rule, action: RowAction, rows: &[Vec<Value>]) -> Result<Vec<BulkRequest>> {
    match action {
        RowAction::Insert => make_insert_requests(rule, rows),
        RowAction::Delete => make_delete_requests(rule, rows),
        RowAction::Update => make_update_requests(rule, rows),
    }
}

fn make_insert_requests(rule: &Rule, rows: &[Vec<Value>]) -> Result<Vec<BulkRequest>> {
    let mut requests = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(id) = doc_id(rule, row)? else {
            warn!("nil id for row of {}.{}, skip", rule.schema, rule.table);
            continue;
        };
        requests.push(BulkRequest {
            action: BulkAction::Index,
            index: rule.index.clone(),
            doc_type: rule.doc_type.clone(),
            id,
            parent: resolve_parent(rule, row)?,
            pipeline: rule.pipeline.clone(),
            data: insert_body(rule, row),
        });
    }
    Ok(requests)
}

fn make_delete_requests(rule: &Rule, rows: &[Vec<Value>]) -> Result<Vec<BulkRequest>> {
    let mut requests = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(id) = doc_id(rule, row)? else {
            warn!("nil id for row of {}.{}, skip", rule.schema, rule.table);
            continue;
        };
        requests.push(BulkRequest {
            action: BulkAction::Delete,
            index: rule.index.clone(),
            doc_type: rule.doc_type.clone(),
            id,
            parent: resolve_parent(rule, row)?,
            ..Default::default()
        });
    }
    Ok(requests)
}

fn make_update_requests(rule: &Rule, rows: &[Vec<Value>]) -> Result<Vec<BulkRequest>> {
    if rows.len() % 2 != 0 {
        return Err(RiverError::mapping(format!(
            "invalid update rows event, must have 2x rows, but {}",
            rows.len()
        )));
    }

    let mut requests = Vec::with_capacity(rows.len());
    for pair in rows.chunks(2) {
        let (before, after) = (&pair[0], &pair[1]);

        let (Some(before_id), Some(after_id)) = (doc_id(rule, before)?, doc_id(rule, after)?)
        else {
            warn!("nil id for row of {}.{}, skip", rule.schema, rule.table);
            continue;
        };

        let before_parent = resolve_parent(rule, before)?;
        let after_parent = resolve_parent(rule, after)?;

        if before_id != after_id || before_parent != after_parent {
            // the document moved: remove the old identity, index the new one
            requests.push(BulkRequest {
                action: BulkAction::Delete,
                index: rule.index.clone(),
                doc_type: rule.doc_type.clone(),
                id: before_id,
                parent: before_parent,
                ..Default::default()
            });
            requests.push(BulkRequest {
                action: BulkAction::Index,
                index: rule.index.clone(),
                doc_type: rule.doc_type.clone(),
                id: after_id,
                parent: after_parent,
                pipeline: rule.pipeline.clone(),
                data: insert_body(rule, after),
            });
        } else if !rule.pipeline.is_empty() {
            // pipelines only run on index actions, so re-index the full body
            requests.push(BulkRequest {
                action: BulkAction::Index,
                index: rule.index.clone(),
                doc_type: rule.doc_type.clone(),
                id: after_id,
                parent: after_parent,
                pipeline: rule.pipeline.clone(),
                data: insert_body(rule, after),
            });
        } else {
            requests.push(BulkRequest {
                action: BulkAction::Update,
                index: rule.index.clone(),
                doc_type: rule.doc_type.clone(),
                id: after_id,
                parent: after_parent,
                data: update_body(rule, before, after),
                ..Default::default()
            });
        }
    }
    Ok(requests)
}

/// Compute the document id for one row.
///
/// Explicit id columns win; otherwise the (single) primary-key column is
/// used. Components join with `:`. `Ok(None)` marks a nil component — the
/// row is skipped by the caller; unknown columns are real errors.
pub fn doc_id(rule: &Rule, row: &[Value]) -> Result<Option<String>> {
    let info = &rule.table_info;
    let mut parts = Vec::new();

    match &rule.id {
        Some(columns) => {
            for name in columns {
                let idx = info.find_column(name).ok_or_else(|| {
                    RiverError::mapping(format!(
                        "id column {} not found in {}.{}",
                        name, rule.schema, rule.table
                    ))
                })?;
                match row.get(idx).and_then(value_text) {
                    Some(text) => parts.push(text),
                    None => return Ok(None),
                }
            }
        }
        None => {
            if info.pk_columns.is_empty() {
                return Err(RiverError::mapping(format!(
                    "{}.{} has no primary key and no id columns",
                    rule.schema, rule.table
                )));
            }
            for &idx in &info.pk_columns {
                match row.get(idx).and_then(value_text) {
                    Some(text) => parts.push(text),
                    None => return Ok(None),
                }
            }
        }
    }

    Ok(Some(parts.join(":")))
}

fn resolve_parent(rule: &Rule, row: &[Value]) -> Result<String> {
    if rule.parent.is_empty() {
        return Ok(String::new());
    }
    parent_id(rule, row)
}

/// Stringify the configured parent column's value.
pub fn parent_id(rule: &Rule, row: &[Value]) -> Result<String> {
    let idx = rule.table_info.find_column(&rule.parent).ok_or_else(|| {
        RiverError::mapping(format!(
            "parent id not found {}({})",
            rule.table, rule.parent
        ))
    })?;
    Ok(row.get(idx).and_then(value_text).unwrap_or_default())
}

/// Full document body for index actions.
fn insert_body(rule: &Rule, row: &[Value]) -> Map<String, Json> {
    let mut data = Map::with_capacity(rule.table_info.columns.len());
    for (i, column) in rule.table_info.columns.iter().enumerate() {
        if !rule.check_filter(&column.name) {
            continue;
        }
        let value = row.get(i).unwrap_or(&Value::NULL);
        let (target, converted) = project_field(rule, column, value);
        data.insert(target, converted);
    }
    data
}

/// Partial body for update actions: only the columns whose value changed.
fn update_body(rule: &Rule, before: &[Value], after: &[Value]) -> Map<String, Json> {
    let mut data = Map::new();
    for (i, column) in rule.table_info.columns.iter().enumerate() {
        if !rule.check_filter(&column.name) {
            continue;
        }
        if before.get(i) == after.get(i) {
            continue;
        }
        let value = after.get(i).unwrap_or(&Value::NULL);
        let (target, converted) = project_field(rule, column, value);
        data.insert(target, converted);
    }
    data
}

fn project_field(rule: &Rule, column: &TableColumn, value: &Value) -> (String, Json) {
    match rule.field_mapping.get(&column.name) {
        Some(mapped) => {
            let (target, field_type) = parse_field_spec(&column.name, mapped);
            (target.to_string(), field_value(column, field_type, value))
        }
        None => (column.name.clone(), convert_column(column, value)),
    }
}

/// Split a field mapping value `<target>[,<fieldType>]`; an empty target
/// means "same name as the source column".
fn parse_field_spec<'a>(source: &'a str, mapped: &'a str) -> (&'a str, &'a str) {
    let (target, field_type) = match mapped.split_once(',') {
        Some((target, field_type)) => (target, field_type),
        None => (mapped, ""),
    };
    if target.is_empty() {
        (source, field_type)
    } else {
        (target, field_type)
    }
}

/// Apply a field type hint on top of the plain conversion.
fn field_value(column: &TableColumn, field_type: &str, value: &Value) -> Json {
    match field_type {
        FIELD_TYPE_LIST => match convert_column(column, value) {
            Json::String(s) => json!(s.split(',').collect::<Vec<_>>()),
            other => other,
        },
        FIELD_TYPE_DATE if column.col_type == ColumnType::Number => {
            let seconds = match value {
                Value::Int(n) => Some(*n),
                Value::UInt(n) => Some(*n as i64),
                _ => None,
            };
            match seconds.and_then(|s| Local.timestamp_opt(s, 0).earliest()) {
                Some(dt) => json!(dt.to_rfc3339()),
                None => convert_column(column, value),
            }
        }
        _ => convert_column(column, value),
    }
}

/// Convert one column value into its document representation.
///
/// Dump literals and binlog images converge here: an ENUM can be a string
/// (dump) or a 1-based ordinal (binlog), a SET a string or a bitmask, BIT a
/// byte or an integer, and temporal values a string or decoded parts.
pub fn convert_column(column: &TableColumn, value: &Value) -> Json {
    match column.col_type {
        ColumnType::Enum => match value {
            Value::Int(n) => enum_text(column, *n),
            Value::UInt(n) => enum_text(column, *n as i64),
            _ => generic_value(value),
        },

        ColumnType::Set => match value {
            Value::Int(n) => set_text(column, *n as u64),
            Value::UInt(n) => set_text(column, *n),
            _ => generic_value(value),
        },

        ColumnType::Bit => match value {
            Value::Bytes(bytes) => json!(if bytes.first() == Some(&1) { 1 } else { 0 }),
            _ => generic_value(value),
        },

        ColumnType::Json => match value {
            Value::Bytes(bytes) => {
                serde_json::from_slice(bytes).unwrap_or_else(|_| generic_value(value))
            }
            _ => generic_value(value),
        },

        ColumnType::Datetime | ColumnType::Timestamp => match value {
            Value::Bytes(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                match parse_local_datetime(&text) {
                    Some(dt) => json!(dt),
                    None => Json::Null,
                }
            }
            Value::Date(y, mo, d, h, mi, s, us) => {
                match datetime_from_parts(*y, *mo, *d, *h, *mi, *s, *us) {
                    Some(dt) => json!(dt),
                    None => Json::Null,
                }
            }
            _ => generic_value(value),
        },

        ColumnType::Date => match value {
            Value::Date(y, mo, d, ..) => {
                match NaiveDate::from_ymd_opt(*y as i32, *mo as u32, *d as u32) {
                    Some(date) => json!(date.format("%Y-%m-%d").to_string()),
                    None => Json::Null,
                }
            }
            _ => generic_value(value),
        },

        ColumnType::Number | ColumnType::Float | ColumnType::String => generic_value(value),
    }
}

fn enum_text(column: &TableColumn, ordinal: i64) -> Json {
    // binlog enum values are 1-based
    let index = ordinal - 1;
    if index < 0 || index as usize >= column.enum_values.len() {
        warn!(
            "invalid binlog enum index {} for enum {:?}",
            index, column.enum_values
        );
        return json!("");
    }
    json!(column.enum_values[index as usize])
}

fn set_text(column: &TableColumn, bitmask: u64) -> Json {
    let members: Vec<&str> = column
        .set_values
        .iter()
        .enumerate()
        .filter(|(i, _)| bitmask & (1 << i) != 0)
        .map(|(_, v)| v.as_str())
        .collect();
    json!(members.join(","))
}

/// Type-agnostic fallback conversion.
fn generic_value(value: &Value) -> Json {
    match value {
        Value::NULL => Json::Null,
        Value::Int(n) => json!(n),
        Value::UInt(n) => json!(n),
        Value::Float(f) => json!(f),
        Value::Double(d) => json!(d),
        Value::Bytes(bytes) => json!(String::from_utf8_lossy(bytes)),
        Value::Date(y, mo, d, h, mi, s, us) => {
            json!(format_datetime_text(*y, *mo, *d, *h, *mi, *s, *us))
        }
        Value::Time(neg, days, h, mi, s, us) => {
            let sign = if *neg { "-" } else { "" };
            let hours = u32::from(*h) + days * 24;
            if *us > 0 {
                json!(format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, mi, s, us))
            } else {
                json!(format!("{}{:02}:{:02}:{:02}", sign, hours, mi, s))
            }
        }
    }
}

/// Natural text form of a value, for document and parent ids. `None` for
/// NULL.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(n) => Some(n.to_string()),
        Value::UInt(n) => Some(n.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(d) => Some(d.to_string()),
        other => match generic_value(other) {
            Json::String(s) => Some(s),
            other => Some(other.to_string()),
        },
    }
}

/// Parse a MySQL datetime string in the local zone and re-emit RFC 3339.
/// Zero dates have no valid reading and turn into `None`.
fn parse_local_datetime(text: &str) -> Option<String> {
    if text.is_empty() || text.starts_with("0000-00-00") {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
        .ok()?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    Some(local.to_rfc3339())
}

fn datetime_from_parts(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
) -> Option<String> {
    let naive = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)?
        .and_hms_micro_opt(hour as u32, minute as u32, second as u32, micros)?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    Some(local.to_rfc3339())
}

fn format_datetime_text(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
) -> String {
    if micros > 0 {
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            year, month, day, hour, minute, second, micros
        )
    } else {
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year, month, day, hour, minute, second
        )
    }
}
