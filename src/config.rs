//! TOML configuration for the pipeline.
//!
//! ```toml
//! my_addr = "127.0.0.1:3306"
//! my_user = "root"
//! my_pass = ""
//! es_addr = "127.0.0.1:9200"
//! data_dir = "./var"
//! server_id = 1001
//! flavor = "mysql"
//! bulk_size = 128
//! flush_bulk_time = "200ms"
//!
//! [[source]]
//! schema = "test"
//! tables = ["t", "t_[0-9]{4}"]
//!
//! [[rule]]
//! schema = "test"
//! table = "t"
//! index = "river"
//! type = "river"
//! [rule.field]
//! title = "es_title"
//! ```

use crate::error::{Result, RiverError};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Source server flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    #[default]
    Mysql,
    Mariadb,
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flavor::Mysql => write!(f, "mysql"),
            Flavor::Mariadb => write!(f, "mariadb"),
        }
    }
}

/// One `[[source]]` entry: a schema plus table names or regex patterns.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub schema: String,
    pub tables: Vec<String>,
}

/// One `[[rule]]` entry overriding the default mapping for a table (or a
/// wildcard pattern registered by a source entry).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleConfig {
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub index: String,
    #[serde(default, rename = "type")]
    pub doc_type: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub pipeline: String,
    #[serde(default)]
    pub id: Option<Vec<String>>,
    #[serde(default)]
    pub filter: Vec<String>,
    /// source column -> `<target_field>[,<fieldType>]`
    #[serde(default, rename = "field")]
    pub field_mapping: HashMap<String, String>,
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// MySQL address, `host:port`
    pub my_addr: String,
    pub my_user: String,
    #[serde(default)]
    pub my_pass: String,
    #[serde(default = "default_charset")]
    pub my_charset: String,

    /// Elasticsearch address, `host:port`
    pub es_addr: String,
    #[serde(default)]
    pub es_user: String,
    #[serde(default)]
    pub es_pass: String,
    #[serde(default)]
    pub es_https: bool,

    /// Checkpoint location: a directory, or `es:` followed by a URL whose
    /// path designates `/index/type[?id=…]` in the target cluster
    pub data_dir: String,

    /// Unique pseudo-replica server id
    pub server_id: u32,
    #[serde(default)]
    pub flavor: Flavor,

    /// Path of the mysqldump-compatible executable
    #[serde(default = "default_dump_exec")]
    pub mysqldump: String,

    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    #[serde(default = "default_flush_bulk_time", with = "humantime_serde")]
    pub flush_bulk_time: Duration,

    /// Status HTTP endpoint, `host:port`; disabled when unset
    #[serde(default)]
    pub stat_addr: Option<String>,
    #[serde(default = "default_stat_path")]
    pub stat_path: String,

    /// Skip (instead of reject) tables without a single-column primary key
    #[serde(default)]
    pub skip_no_pk_table: bool,

    #[serde(default, rename = "source")]
    pub sources: Vec<SourceConfig>,
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,
}

fn default_charset() -> String {
    "utf8".to_string()
}

fn default_dump_exec() -> String {
    "mysqldump".to_string()
}

fn default_bulk_size() -> usize {
    128
}

fn default_flush_bulk_time() -> Duration {
    Duration::from_millis(200)
}

fn default_stat_path() -> String {
    "/metrics".to_string()
}

impl Config {
    /// Parse configuration from a TOML string.
    pub fn from_str(data: &str) -> Result<Self> {
        let config: Config = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_str(&data)
    }

    /// Split `my_addr` into host and port.
    pub fn my_host_port(&self) -> Result<(String, u16)> {
        split_addr(&self.my_addr)
            .ok_or_else(|| RiverError::config(format!("invalid my_addr {}, must be host:port", self.my_addr)))
    }

    fn validate(&self) -> Result<()> {
        self.my_host_port()?;
        if self.server_id == 0 {
            return Err(RiverError::config("server_id must be non-zero"));
        }
        if self.sources.is_empty() {
            return Err(RiverError::config("no source data defined"));
        }
        for source in &self.sources {
            if source.schema.is_empty() {
                return Err(RiverError::config("empty schema in source entry"));
            }
            if source.tables.is_empty() {
                return Err(RiverError::config(format!(
                    "source {} has no tables",
                    source.schema
                )));
            }
        }
        for rule in &self.rules {
            if rule.schema.is_empty() {
                return Err(RiverError::config("empty schema in rule entry"));
            }
            if rule.table.is_empty() {
                return Err(RiverError::config(format!(
                    "rule for schema {} has no table",
                    rule.schema
                )));
            }
        }
        Ok(())
    }
}

fn split_addr(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
my_addr = "127.0.0.1:3306"
my_user = "root"
my_pass = "secret"
es_addr = "127.0.0.1:9200"
data_dir = "./var"
server_id = 1001
flavor = "mariadb"
flush_bulk_time = "500ms"
bulk_size = 256

[[source]]
schema = "test"
tables = ["t", "t_[0-9]{4}"]

[[rule]]
schema = "test"
table = "t"
index = "river"
type = "river"
id = ["id", "title"]
filter = ["id", "title", "tags"]

[rule.field]
title = "es_title"
tags = "es_tags,list"
"#;

    #[test]
    fn test_parse_full() {
        let config = Config::from_str(SAMPLE).unwrap();

        assert_eq!(config.my_addr, "127.0.0.1:3306");
        assert_eq!(config.my_pass, "secret");
        assert_eq!(config.flavor, Flavor::Mariadb);
        assert_eq!(config.flush_bulk_time, Duration::from_millis(500));
        assert_eq!(config.bulk_size, 256);
        assert_eq!(config.stat_addr, None);

        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].tables.len(), 2);

        let rule = &config.rules[0];
        assert_eq!(rule.index, "river");
        assert_eq!(rule.doc_type, "river");
        assert_eq!(rule.id.as_deref(), Some(&["id".to_string(), "title".to_string()][..]));
        assert_eq!(rule.field_mapping.get("tags").unwrap(), "es_tags,list");
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
my_addr = "db:3306"
my_user = "repl"
es_addr = "es:9200"
data_dir = "/var/lib/river"
server_id = 7

[[source]]
schema = "shop"
tables = ["orders"]
"#;
        let config = Config::from_str(minimal).unwrap();
        assert_eq!(config.flavor, Flavor::Mysql);
        assert_eq!(config.bulk_size, 128);
        assert_eq!(config.flush_bulk_time, Duration::from_millis(200));
        assert_eq!(config.mysqldump, "mysqldump");
        assert_eq!(config.stat_path, "/metrics");
        assert!(!config.skip_no_pk_table);
    }

    #[test]
    fn test_rejects_bad_addr() {
        let bad = r#"
my_addr = "no-port"
my_user = "root"
es_addr = "es:9200"
data_dir = "./var"
server_id = 1

[[source]]
schema = "s"
tables = ["t"]
"#;
        assert!(Config::from_str(bad).is_err());
    }

    #[test]
    fn test_rejects_empty_schema() {
        let bad = r#"
my_addr = "db:3306"
my_user = "root"
es_addr = "es:9200"
data_dir = "./var"
server_id = 1

[[source]]
schema = ""
tables = ["t"]
"#;
        assert!(Config::from_str(bad).is_err());
    }

    #[test]
    fn test_rejects_zero_server_id() {
        let bad = r#"
my_addr = "db:3306"
my_user = "root"
es_addr = "es:9200"
data_dir = "./var"
server_id = 0

[[source]]
schema = "s"
tables = ["t"]
"#;
        assert!(Config::from_str(bad).is_err());
    }
}
