//! Binlog follower: registers as a pseudo-replica and turns the server's
//! replication stream into [`EventHandler`] callbacks.
//!
//! The stream is restartable from any checkpointed position. Transient
//! connection errors reconnect internally from the last synced position;
//! everything downstream (mapping failures, closed channels) propagates and
//! ends the stream.

use super::{Canal, RowAction, RowsEvent};
use crate::error::{Result, RiverError};
use crate::position::Position;
use futures_util::StreamExt;
use mysql_async::binlog::events::{EventData, RowsEventData, TableMapEvent};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::{BinlogStreamRequest, Conn, Value};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Matches the DDL statements that invalidate cached table metadata and
/// captures the (possibly schema-qualified) table identifier.
static DDL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?ix)^\s*
           (?: TRUNCATE (?:\s+TABLE)? | (?:CREATE|ALTER|DROP|RENAME)\s+TABLE )
           \s+ (?:IF\s+(?:NOT\s+)?EXISTS\s+)?
           [`"]?([^\s`".(]+)[`"]?
           (?:\s*\.\s*[`"]?([^\s`".(]+)[`"]?)?"#,
    )
    .expect("ddl pattern is valid")
});

/// Follow the binlog from `start` until cancellation, reconnecting across
/// transient connection failures.
pub(crate) async fn run(canal: &Canal, start: Position) -> Result<()> {
    info!(
        "starting {} binlog stream at {} (server_id={})",
        canal.config.flavor, start, canal.config.server_id
    );

    let mut pos = start;
    loop {
        match stream_events(canal, pos.clone()).await {
            Ok(()) => return Ok(()),
            Err(_) if canal.shutdown.is_cancelled() => return Ok(()),
            Err(e) if matches!(e, RiverError::Mysql(_) | RiverError::Io(_)) => {
                error!("binlog stream error: {}, reconnecting", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                let synced = canal.synced_position();
                if !synced.is_empty() {
                    pos = synced;
                }
            }
            Err(e) => return Err(e),
        }
    }
}

async fn stream_events(canal: &Canal, start: Position) -> Result<()> {
    let conn = Conn::new(canal.conn_opts()?).await?;
    let request = BinlogStreamRequest::new(canal.server_id())
        .with_filename(start.name.as_bytes())
        .with_pos(u64::from(start.pos));
    let mut stream = conn.get_binlog_stream(request).await?;

    let handler = canal.handler()?;
    let mut current_file = start.name;

    loop {
        let event = tokio::select! {
            _ = canal.shutdown.cancelled() => {
                debug!("binlog stream cancelled");
                let _ = stream.close().await;
                return Ok(());
            }
            next = stream.next() => match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(RiverError::replication("binlog stream closed by server")),
            },
        };

        let header = event.header();
        let log_pos = header.log_pos();
        let timestamp = header.timestamp();

        let data = match event.read_data() {
            Ok(Some(data)) => data,
            Ok(None) => continue,
            Err(e) => {
                warn!("undecodable binlog event: {}", e);
                continue;
            }
        };

        match data {
            EventData::RotateEvent(rotate) => {
                current_file = rotate.name().to_string();
                let pos = Position::new(current_file.clone(), rotate.position() as u32);
                debug!("rotate to {}", pos);
                canal.set_synced_position(pos.clone(), timestamp);
                handler.on_rotate(pos).await?;
            }

            EventData::RowsEvent(rows_data) => {
                let Some(tme) = stream.get_tme(rows_data.table_id()) else {
                    warn!("no table map for table id {}", rows_data.table_id());
                    continue;
                };
                if let Some(rows_event) = decode_rows(canal, &rows_data, tme)? {
                    handler.on_row(rows_event).await?;
                }
                canal.set_synced_position(
                    Position::new(current_file.clone(), log_pos),
                    timestamp,
                );
            }

            EventData::QueryEvent(query) => {
                let sql = query.query();
                let Some((schema, table)) = ddl_target(&query.schema(), &sql) else {
                    continue;
                };
                debug!("ddl touching {}.{}: {}", schema, table, sql);

                let next_pos = Position::new(current_file.clone(), log_pos);
                handler.on_table_changed(&schema, &table).await?;
                canal.set_synced_position(next_pos.clone(), timestamp);
                handler.on_ddl(next_pos).await?;
            }

            EventData::XidEvent(_) => {
                let next_pos = Position::new(current_file.clone(), log_pos);
                canal.set_synced_position(next_pos.clone(), timestamp);
                handler.on_xid(next_pos).await?;
            }

            // GTID bookkeeping, format descriptions, heartbeats
            _ => {}
        }
    }
}

/// Decode a rows event into ordered row tuples, skipping tables without a
/// registered rule.
fn decode_rows(
    canal: &Canal,
    rows_data: &RowsEventData<'_>,
    tme: &TableMapEvent<'_>,
) -> Result<Option<RowsEvent>> {
    let schema = tme.database_name().to_string();
    let table = tme.table_name().to_string();

    if canal.registry.get(&schema, &table).is_none() {
        return Ok(None);
    }

    let action = match rows_data {
        RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => RowAction::Insert,
        RowsEventData::UpdateRowsEvent(_) | RowsEventData::UpdateRowsEventV1(_) => {
            RowAction::Update
        }
        RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
            RowAction::Delete
        }
        _ => return Ok(None),
    };

    let mut rows = Vec::new();
    for row in rows_data.rows(tme) {
        let (before, after) =
            row.map_err(|e| RiverError::replication(format!("row image decode: {}", e)))?;

        match action {
            RowAction::Insert => {
                if let Some(after) = after {
                    rows.push(row_values(&after)?);
                }
            }
            RowAction::Delete => {
                if let Some(before) = before {
                    rows.push(row_values(&before)?);
                }
            }
            RowAction::Update => {
                let before = before.ok_or_else(|| {
                    RiverError::replication("update row without before image, full image required")
                })?;
                let after = after.ok_or_else(|| {
                    RiverError::replication("update row without after image, full image required")
                })?;
                rows.push(row_values(&before)?);
                rows.push(row_values(&after)?);
            }
        }
    }

    Ok(Some(RowsEvent {
        action,
        schema,
        table,
        rows,
    }))
}

/// Flatten one binlog row image into wire values. JSON columns arrive as
/// binary jsonb and are re-encoded as JSON text for the mapping engine.
fn row_values(row: &BinlogRow) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(row.len());
    for i in 0..row.len() {
        let value = match row.as_ref(i) {
            Some(BinlogValue::Value(v)) => v.clone(),
            Some(BinlogValue::Jsonb(v)) => {
                let json = serde_json::Value::try_from(v.clone())
                    .map_err(|e| RiverError::replication(format!("jsonb decode: {}", e)))?;
                Value::Bytes(serde_json::to_vec(&json)?)
            }
            Some(BinlogValue::JsonDiff(_)) => {
                return Err(RiverError::replication(
                    "partial JSON row image, full row image required",
                ))
            }
            None => Value::NULL,
        };
        values.push(value);
    }
    Ok(values)
}

/// Resolve the table a DDL statement touches, defaulting to the statement's
/// session schema when the identifier is unqualified.
fn ddl_target(default_schema: &str, sql: &str) -> Option<(String, String)> {
    let caps = DDL_RE.captures(sql)?;
    match caps.get(2) {
        Some(table) => Some((caps[1].to_string(), table.as_str().to_string())),
        None => {
            if default_schema.is_empty() {
                return None;
            }
            Some((default_schema.to_string(), caps[1].to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_target_unqualified() {
        assert_eq!(
            ddl_target("test", "ALTER TABLE t ADD COLUMN x INT"),
            Some(("test".to_string(), "t".to_string()))
        );
        assert_eq!(
            ddl_target("test", "create table if not exists t2 (id int)"),
            Some(("test".to_string(), "t2".to_string()))
        );
        assert_eq!(
            ddl_target("test", "TRUNCATE t3"),
            Some(("test".to_string(), "t3".to_string()))
        );
    }

    #[test]
    fn test_ddl_target_qualified() {
        assert_eq!(
            ddl_target("other", "ALTER TABLE `test`.`t` DROP COLUMN x"),
            Some(("test".to_string(), "t".to_string()))
        );
        assert_eq!(
            ddl_target("", "DROP TABLE shop.orders"),
            Some(("shop".to_string(), "orders".to_string()))
        );
    }

    #[test]
    fn test_ddl_target_ignores_dml() {
        assert_eq!(ddl_target("test", "BEGIN"), None);
        assert_eq!(
            ddl_target("test", "INSERT INTO t VALUES (1)"),
            None
        );
        assert_eq!(ddl_target("", "TRUNCATE t"), None);
    }
}
