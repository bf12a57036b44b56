//! Snapshot dumper: drives an external `mysqldump`-compatible tool and
//! parses its stdout as a forward-only stream.
//!
//! The flag set matters: one INSERT per row, no DDL, no locks, and the
//! master position comment — the parser depends on exactly this shape. The
//! dump is never buffered; each line is handled as it arrives.

use crate::error::{Result, RiverError};
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

static BINLOG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:-- )?CHANGE MASTER TO MASTER_LOG_FILE='([^']+)',\s*MASTER_LOG_POS=(\d+)")
        .expect("binlog position pattern is valid")
});

static USE_DB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^USE `(.+?)`;").expect("use-db pattern is valid"));

static INSERT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^INSERT INTO `(.+?)` VALUES \((.+)\);$").expect("insert pattern is valid")
});

/// Callbacks for the streaming parser.
///
/// `data` receives one raw SQL literal per column, in table-declaration
/// order: `NULL`, an unquoted number, a quoted string (quotes included), or
/// a `_binary '…'` literal. The consumer owns the conversion and decides
/// whether a malformed row is skipped.
#[async_trait]
pub trait DumpHandler: Send {
    /// The binlog position at which this snapshot is consistent.
    async fn binlog(&mut self, name: &str, pos: u32) -> Result<()>;
    async fn use_db(&mut self, db: &str) -> Result<()>;
    async fn data(&mut self, db: &str, table: &str, values: Vec<String>) -> Result<()>;
}

/// Driver for the external dump tool.
pub struct Dumper {
    exec: String,
    addr: String,
    user: String,
    password: String,
    charset: String,
    /// db -> tables; when exactly one db is present the tool is invoked as
    /// `<db> <tables…>`, otherwise with `--databases`
    tables: BTreeMap<String, Vec<String>>,
    ignore_tables: Vec<(String, String)>,
}

impl Dumper {
    pub fn new(
        exec: impl Into<String>,
        addr: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        charset: impl Into<String>,
    ) -> Self {
        Self {
            exec: exec.into(),
            addr: addr.into(),
            user: user.into(),
            password: password.into(),
            charset: charset.into(),
            tables: BTreeMap::new(),
            ignore_tables: Vec::new(),
        }
    }

    pub fn add_table(&mut self, db: impl Into<String>, table: impl Into<String>) {
        self.tables.entry(db.into()).or_default().push(table.into());
    }

    pub fn add_ignore_table(&mut self, db: impl Into<String>, table: impl Into<String>) {
        self.ignore_tables.push((db.into(), table.into()));
    }

    fn args(&self) -> Result<Vec<String>> {
        let (host, port) = self
            .addr
            .rsplit_once(':')
            .ok_or_else(|| RiverError::config(format!("invalid mysql addr {}", self.addr)))?;

        let mut args = vec![
            format!("--host={}", host),
            format!("--port={}", port),
            format!("--user={}", self.user),
            format!("--password={}", self.password),
            // consistent snapshot without locks
            "--single-transaction".to_string(),
            "--skip-lock-tables".to_string(),
            // bare INSERTs only, one row each
            "--compact".to_string(),
            "--skip-opt".to_string(),
            "--quick".to_string(),
            "--no-create-info".to_string(),
            "--skip-extended-insert".to_string(),
            // position comment the parser reads
            "--master-data=2".to_string(),
        ];
        if !self.charset.is_empty() {
            args.push(format!("--default-character-set={}", self.charset));
        }
        for (db, table) in &self.ignore_tables {
            args.push(format!("--ignore-table={}.{}", db, table));
        }

        if self.tables.len() == 1 {
            let (db, tables) = self.tables.iter().next().expect("len checked");
            args.push(db.clone());
            args.extend(tables.iter().cloned());
        } else {
            args.push("--databases".to_string());
            args.extend(self.tables.keys().cloned());
        }

        Ok(args)
    }

    /// Run the tool and stream its output through the handler.
    pub async fn dump<H: DumpHandler>(&self, handler: &mut H) -> Result<()> {
        let args = self.args()?;
        info!("dumping with {} ({} schemas)", self.exec, self.tables.len());

        let mut child = Command::new(&self.exec)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RiverError::dump(format!("spawn {}: {}", self.exec, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RiverError::dump("dump stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RiverError::dump("dump stderr not captured"))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("mysqldump: {}", line);
            }
        });

        let parse_result = parse_stream(BufReader::new(stdout), handler).await;

        let status = child
            .wait()
            .await
            .map_err(|e| RiverError::dump(format!("wait for {}: {}", self.exec, e)))?;
        stderr_task.abort();

        parse_result?;
        if !status.success() {
            return Err(RiverError::dump(format!(
                "{} exited with {}",
                self.exec, status
            )));
        }
        Ok(())
    }
}

/// Parse a dump stream line by line, emitting handler callbacks.
///
/// Forward-only and restartable: no state beyond the current database and
/// whether the position comment was seen.
pub async fn parse_stream<R, H>(reader: R, handler: &mut H) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    H: DumpHandler,
{
    let mut lines = reader.lines();
    let mut db = String::new();
    let mut binlog_seen = false;

    while let Some(line) = lines.next_line().await? {
        if !binlog_seen {
            if let Some(caps) = BINLOG_RE.captures(&line) {
                let name = &caps[1];
                let pos: u32 = caps[2]
                    .parse()
                    .map_err(|_| RiverError::dump(format!("bad master position in: {}", line)))?;
                handler.binlog(name, pos).await?;
                binlog_seen = true;
                continue;
            }
        }

        if let Some(caps) = USE_DB_RE.captures(&line) {
            db = caps[1].to_string();
            handler.use_db(&db).await?;
            continue;
        }

        if let Some(caps) = INSERT_RE.captures(&line) {
            let table = caps[1].to_string();
            match split_values(&caps[2]) {
                Some(values) => handler.data(&db, &table, values).await?,
                None => {
                    error!("unbalanced row literal, skip: {}", truncate(&line, 256));
                    continue;
                }
            }
        }
    }

    if !binlog_seen {
        warn!("dump finished without a master position comment");
    }
    Ok(())
}

/// Split the body of `VALUES (…)` into raw per-column literals, respecting
/// quoted strings, backslash escapes and `_binary` prefixes.
fn split_values(body: &str) -> Option<Vec<String>> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut chars = body.chars();

    while let Some(c) = chars.next() {
        if in_string {
            current.push(c);
            match c {
                '\\' => {
                    // escaped char belongs to the literal verbatim
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    } else {
                        return None;
                    }
                }
                '\'' => in_string = false,
                _ => {}
            }
        } else {
            match c {
                '\'' => {
                    in_string = true;
                    current.push(c);
                }
                ',' => values.push(std::mem::take(&mut current).trim().to_string()),
                _ => current.push(c),
            }
        }
    }

    if in_string {
        return None;
    }
    values.push(current.trim().to_string());
    Some(values)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        binlog: Option<(String, u32)>,
        dbs: Vec<String>,
        rows: Vec<(String, String, Vec<String>)>,
    }

    #[async_trait]
    impl DumpHandler for Recorder {
        async fn binlog(&mut self, name: &str, pos: u32) -> Result<()> {
            self.binlog = Some((name.to_string(), pos));
            Ok(())
        }

        async fn use_db(&mut self, db: &str) -> Result<()> {
            self.dbs.push(db.to_string());
            Ok(())
        }

        async fn data(&mut self, db: &str, table: &str, values: Vec<String>) -> Result<()> {
            self.rows.push((db.to_string(), table.to_string(), values));
            Ok(())
        }
    }

    async fn parse(input: &str) -> Recorder {
        let mut recorder = Recorder::default();
        parse_stream(input.as_bytes(), &mut recorder).await.unwrap();
        recorder
    }

    #[tokio::test]
    async fn test_parse_dump_stream() {
        let dump = "\
-- CHANGE MASTER TO MASTER_LOG_FILE='mysql-bin.000002', MASTER_LOG_POS=1234;
USE `test`;
INSERT INTO `t` VALUES (1,'first',NULL);
INSERT INTO `t` VALUES (2,'second',3.5);
";
        let recorder = parse(dump).await;

        assert_eq!(
            recorder.binlog,
            Some(("mysql-bin.000002".to_string(), 1234))
        );
        assert_eq!(recorder.dbs, vec!["test"]);
        assert_eq!(recorder.rows.len(), 2);
        assert_eq!(recorder.rows[0].2, vec!["1", "'first'", "NULL"]);
        assert_eq!(recorder.rows[1].2, vec!["2", "'second'", "3.5"]);
    }

    #[tokio::test]
    async fn test_parse_statement_form_position() {
        let dump = "CHANGE MASTER TO MASTER_LOG_FILE='bin.000001', MASTER_LOG_POS=4;\n";
        let recorder = parse(dump).await;
        assert_eq!(recorder.binlog, Some(("bin.000001".to_string(), 4)));
    }

    #[test]
    fn test_split_values_quotes_and_escapes() {
        let values = split_values(r"1,'a,b','it\'s',_binary 'x',NULL").unwrap();
        assert_eq!(
            values,
            vec!["1", "'a,b'", r"'it\'s'", "_binary 'x'", "NULL"]
        );
    }

    #[test]
    fn test_split_values_json_literal() {
        let values = split_values(r#"5,'{"first":"a","second":"b"}'"#).unwrap();
        assert_eq!(values[1], r#"'{"first":"a","second":"b"}'"#);
    }

    #[test]
    fn test_split_values_unbalanced() {
        assert!(split_values("1,'open").is_none());
        assert!(split_values(r"1,'trailing\").is_none());
    }

    #[test]
    fn test_dump_args_single_schema() {
        let mut dumper = Dumper::new("mysqldump", "db:3306", "root", "pw", "utf8");
        dumper.add_table("test", "t1");
        dumper.add_table("test", "t2");
        dumper.add_ignore_table("mysql", "user");

        let args = dumper.args().unwrap();
        assert!(args.contains(&"--single-transaction".to_string()));
        assert!(args.contains(&"--skip-extended-insert".to_string()));
        assert!(args.contains(&"--master-data=2".to_string()));
        assert!(args.contains(&"--ignore-table=mysql.user".to_string()));

        // single schema: `<schema> <tables…>`, no --databases
        assert!(!args.contains(&"--databases".to_string()));
        let db_at = args.iter().position(|a| a == "test").unwrap();
        assert_eq!(args[db_at + 1], "t1");
        assert_eq!(args[db_at + 2], "t2");
    }

    #[test]
    fn test_dump_args_multi_schema() {
        let mut dumper = Dumper::new("mysqldump", "db:3306", "root", "pw", "utf8");
        dumper.add_table("a", "t1");
        dumper.add_table("b", "t2");

        let args = dumper.args().unwrap();
        let flag_at = args.iter().position(|a| a == "--databases").unwrap();
        assert_eq!(&args[flag_at + 1..], &["a".to_string(), "b".to_string()]);
    }
}
