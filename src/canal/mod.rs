//! Source driver: one ordered event stream out of a MySQL/MariaDB primary.
//!
//! The driver owns two phases. When no checkpoint exists it first drives an
//! external dump tool for a consistent baseline (`dump`), converting parsed
//! rows into insert events; it then follows the binary log (`binlog`) from
//! the position at which the baseline was taken. Both phases feed the same
//! registered [`EventHandler`], so downstream code never cares which phase
//! produced an event.

pub mod binlog;
pub mod dump;

use crate::config::{Config, Flavor};
use crate::error::{Result, RiverError};
use crate::position::Position;
use crate::registry::RuleRegistry;
use crate::rule::Rule;
use crate::schema::{ColumnType, TableColumn};
use async_trait::async_trait;
use dump::{DumpHandler, Dumper};
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool, Row, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Rows flushed per synthetic insert event during the dump phase.
const DUMP_BATCH_ROWS: usize = 128;

/// Row event action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for RowAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowAction::Insert => write!(f, "insert"),
            RowAction::Update => write!(f, "update"),
            RowAction::Delete => write!(f, "delete"),
        }
    }
}

/// A decoded row event.
///
/// For insert/delete every element of `rows` is one row tuple; for update
/// the tuples come in `[before, after]` pairs, back to back.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub action: RowAction,
    pub schema: String,
    pub table: String,
    pub rows: Vec<Vec<Value>>,
}

/// Consumer interface for the single ordered event stream.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Binlog rotated to a new file; checkpoint must be forced.
    async fn on_rotate(&self, pos: Position) -> Result<()>;
    async fn on_row(&self, event: RowsEvent) -> Result<()>;
    /// DDL touched a table; rule metadata should be refreshed.
    async fn on_table_changed(&self, schema: &str, table: &str) -> Result<()>;
    /// Commit boundary of a DDL transaction (forced checkpoint).
    async fn on_ddl(&self, next_pos: Position) -> Result<()>;
    /// Commit boundary of a DML transaction (unforced checkpoint).
    async fn on_xid(&self, next_pos: Position) -> Result<()>;
    /// Out-of-band position sync, e.g. after the dump phase.
    async fn on_pos_synced(&self, pos: Position, force: bool) -> Result<()>;
}

/// Connection settings for the source driver.
#[derive(Debug, Clone)]
pub struct CanalConfig {
    pub addr: String,
    pub user: String,
    pub password: String,
    pub charset: String,
    pub server_id: u32,
    pub flavor: Flavor,
    pub dump_exec: String,
}

impl CanalConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            addr: config.my_addr.clone(),
            user: config.my_user.clone(),
            password: config.my_pass.clone(),
            charset: config.my_charset.clone(),
            server_id: config.server_id,
            flavor: config.flavor,
            dump_exec: config.mysqldump.clone(),
        }
    }
}

/// The source driver.
pub struct Canal {
    config: CanalConfig,
    pool: Pool,
    registry: Arc<RuleRegistry>,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
    shutdown: CancellationToken,
    dump_done_tx: watch::Sender<bool>,
    dump_done_rx: watch::Receiver<bool>,
    synced_pos: RwLock<Position>,
    delay_secs: AtomicU64,
    running: AtomicBool,
}

impl Canal {
    pub fn new(
        config: CanalConfig,
        registry: Arc<RuleRegistry>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let pool = Pool::new(conn_opts(&config)?);
        let (dump_done_tx, dump_done_rx) = watch::channel(false);

        Ok(Self {
            config,
            pool,
            registry,
            handler: RwLock::new(None),
            shutdown,
            dump_done_tx,
            dump_done_rx,
            synced_pos: RwLock::new(Position::default()),
            delay_secs: AtomicU64::new(0),
            running: AtomicBool::new(false),
        })
    }

    /// Connection pool for catalog lookups (shared with the registry).
    pub fn make_pool(config: &Config) -> Result<Pool> {
        Ok(Pool::new(conn_opts(&CanalConfig::from_config(config))?))
    }

    pub fn register_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn handler(&self) -> Result<Arc<dyn EventHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| RiverError::replication("no event handler registered"))
    }

    /// The replication stream is only usable with row-based, full-image
    /// logging; anything else fails startup.
    pub async fn check_binlog_row_format(&self) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;

        let format: Option<(String, String)> = conn
            .query_first("SHOW GLOBAL VARIABLES LIKE 'binlog_format'")
            .await?;
        match format {
            Some((_, value)) if value.eq_ignore_ascii_case("ROW") => {}
            Some((_, value)) => {
                return Err(RiverError::replication(format!(
                    "binlog_format must be ROW, got {}",
                    value
                )))
            }
            None => return Err(RiverError::replication("binlog_format variable not found")),
        }

        let image: Option<(String, String)> = conn
            .query_first("SHOW GLOBAL VARIABLES LIKE 'binlog_row_image'")
            .await?;
        match image {
            Some((_, value)) if value.eq_ignore_ascii_case("FULL") => {}
            Some((_, value)) => {
                return Err(RiverError::replication(format!(
                    "binlog_row_image must be FULL, got {}",
                    value
                )))
            }
            // predates the variable; those servers always log full rows
            None => warn!("binlog_row_image variable not found, assuming FULL"),
        }

        Ok(())
    }

    /// Current server-side binlog position (`SHOW MASTER STATUS`).
    pub async fn master_status(&self) -> Result<Position> {
        let mut conn = self.pool.get_conn().await?;
        let row: Option<Row> = conn.query_first("SHOW MASTER STATUS").await?;
        let row = row.ok_or_else(|| {
            RiverError::replication("SHOW MASTER STATUS returned no rows, is binlog enabled?")
        })?;

        let name: String = row.get(0).unwrap_or_default();
        let pos: u64 = row.get(1).unwrap_or_default();
        Ok(Position::new(name, pos as u32))
    }

    /// Drive the pipeline: dump first when no checkpoint exists, then follow
    /// the binlog until cancelled.
    pub async fn run_from(&self, pos: Position) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let result = self.run_inner(pos).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self, mut pos: Position) -> Result<()> {
        if pos.is_empty() {
            pos = self.dump().await?;
            info!("dump done, binlog replication starts at {}", pos);
            self.handler()?.on_pos_synced(pos.clone(), true).await?;
        } else {
            info!("skip dump, use last binlog replication pos {}", pos);
        }
        let _ = self.dump_done_tx.send(true);

        binlog::run(self, pos).await
    }

    /// Block until the dump phase finished (or was skipped).
    pub async fn wait_dump_done(&self) {
        let mut rx = self.dump_done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn dump(&self) -> Result<Position> {
        let mut dumper = Dumper::new(
            &self.config.dump_exec,
            &self.config.addr,
            &self.config.user,
            &self.config.password,
            &self.config.charset,
        );
        let rules = self.registry.all();
        let mut schemas: Vec<&str> = Vec::new();
        for rule in &rules {
            if !schemas.contains(&rule.schema.as_str()) {
                schemas.push(&rule.schema);
            }
            dumper.add_table(&rule.schema, &rule.table);
        }

        // with --databases the tool would dump every table of each schema;
        // explicitly ignore the ones no rule covers
        if schemas.len() > 1 {
            let mut conn = self.pool.get_conn().await?;
            for schema in schemas {
                let tables: Vec<String> = conn
                    .exec(
                        "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = ?",
                        (schema,),
                    )
                    .await?;
                for table in tables {
                    if self.registry.get(schema, &table).is_none() {
                        dumper.add_ignore_table(schema, table);
                    }
                }
            }
        }

        let mut sink = DumpSink {
            registry: &self.registry,
            handler: self.handler()?,
            position: None,
            schema: String::new(),
            table: String::new(),
            rule: None,
            rows: Vec::new(),
        };
        dumper.dump(&mut sink).await?;
        sink.finish().await
    }

    /// Position of the last binlog event handed downstream.
    pub fn synced_position(&self) -> Position {
        self.synced_pos
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_synced_position(&self, pos: Position, event_ts: u32) {
        *self.synced_pos.write().unwrap_or_else(|e| e.into_inner()) = pos;
        let now = chrono::Utc::now().timestamp() as u64;
        self.delay_secs
            .store(now.saturating_sub(event_ts as u64), Ordering::Relaxed);
    }

    /// Seconds the follower lags behind the newest observed event.
    pub fn delay(&self) -> u64 {
        self.delay_secs.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn conn_opts(&self) -> Result<Opts> {
        conn_opts(&self.config)
    }

    pub(crate) fn server_id(&self) -> u32 {
        self.config.server_id
    }
}

fn conn_opts(config: &CanalConfig) -> Result<Opts> {
    let (host, port) = config
        .addr
        .rsplit_once(':')
        .and_then(|(h, p)| Some((h, p.parse::<u16>().ok()?)))
        .ok_or_else(|| {
            RiverError::config(format!("invalid mysql addr {}, must be host:port", config.addr))
        })?;

    let mut builder = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(port)
        .user(Some(config.user.clone()))
        .pass(Some(config.password.clone()));
    if !config.charset.is_empty() {
        builder = builder.init(vec![format!("SET NAMES {}", config.charset)]);
    }
    Ok(builder.into())
}

/// Converts parsed dump rows into insert events, batching per table.
struct DumpSink<'a> {
    registry: &'a RuleRegistry,
    handler: Arc<dyn EventHandler>,
    position: Option<Position>,
    schema: String,
    table: String,
    rule: Option<Arc<Rule>>,
    rows: Vec<Vec<Value>>,
}

impl DumpSink<'_> {
    async fn flush(&mut self) -> Result<()> {
        if self.rows.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.rows);
        self.handler
            .on_row(RowsEvent {
                action: RowAction::Insert,
                schema: self.schema.clone(),
                table: self.table.clone(),
                rows,
            })
            .await
    }

    async fn finish(mut self) -> Result<Position> {
        self.flush().await?;
        self.position
            .take()
            .ok_or_else(|| RiverError::dump("dump output carried no master position"))
    }
}

#[async_trait]
impl DumpHandler for DumpSink<'_> {
    async fn binlog(&mut self, name: &str, pos: u32) -> Result<()> {
        self.position = Some(Position::new(name, pos));
        Ok(())
    }

    async fn use_db(&mut self, _db: &str) -> Result<()> {
        Ok(())
    }

    async fn data(&mut self, db: &str, table: &str, values: Vec<String>) -> Result<()> {
        if db != self.schema || table != self.table {
            self.flush().await?;
            self.schema = db.to_string();
            self.table = table.to_string();
            self.rule = self.registry.get(db, table);
            if self.rule.is_none() {
                warn!("no rule for {}.{}, rows skipped", db, table);
            }
        }

        let Some(rule) = &self.rule else {
            return Ok(());
        };

        let columns = &rule.table_info.columns;
        if values.len() != columns.len() {
            warn!(
                "row of {}.{} has {} values, table has {} columns, skip",
                db,
                table,
                values.len(),
                columns.len()
            );
            return Ok(());
        }

        let mut row = Vec::with_capacity(values.len());
        for (token, column) in values.iter().zip(columns) {
            match token_to_value(token, column) {
                Some(value) => row.push(value),
                None => {
                    warn!(
                        "unparseable literal {:?} for {}.{}.{}, row skipped",
                        token, db, table, column.name
                    );
                    return Ok(());
                }
            }
        }

        self.rows.push(row);
        if self.rows.len() >= DUMP_BATCH_ROWS {
            self.flush().await?;
        }
        Ok(())
    }
}

/// Convert one raw dump literal into a wire value, guided by the column's
/// type category.
fn token_to_value(token: &str, column: &TableColumn) -> Option<Value> {
    if token == "NULL" {
        return Some(Value::NULL);
    }

    let token = token.strip_prefix("_binary ").unwrap_or(token);

    if let Some(bits) = token.strip_prefix("b'") {
        let bits = bits.strip_suffix('\'')?;
        return u64::from_str_radix(bits, 2).ok().map(Value::UInt);
    }

    if let Some(inner) = token.strip_prefix('\'') {
        let inner = inner.strip_suffix('\'')?;
        return Some(Value::Bytes(unescape(inner)));
    }

    if let Some(hex) = token.strip_prefix("0x") {
        return decode_hex(hex).map(Value::Bytes);
    }

    match column.col_type {
        ColumnType::Float => token.parse::<f64>().ok().map(Value::Double),
        ColumnType::Number | ColumnType::Bit => token
            .parse::<i64>()
            .ok()
            .map(Value::Int)
            .or_else(|| token.parse::<u64>().ok().map(Value::UInt)),
        _ => None,
    }
}

/// Undo mysqldump's string escaping (`\'`, `\\`, `\n`, doubled quotes, …).
fn unescape(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => {
                let escaped = bytes[i + 1];
                out.push(match escaped {
                    b'0' => 0,
                    b'b' => 8,
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    b'Z' => 26,
                    other => other,
                });
                i += 2;
            }
            b'\'' if i + 1 < bytes.len() && bytes[i + 1] == b'\'' => {
                out.push(b'\'');
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}
