//! Error types for the replication pipeline.

use thiserror::Error;

/// Pipeline errors.
#[derive(Error, Debug)]
pub enum RiverError {
    /// Configuration error (startup-fatal)
    #[error("configuration error: {0}")]
    Config(String),

    /// MySQL protocol or query error
    #[error("mysql error: {0}")]
    Mysql(#[from] mysql_async::Error),

    /// Binlog replication error
    #[error("replication error: {0}")]
    Replication(String),

    /// Schema introspection error
    #[error("schema error: {0}")]
    Schema(String),

    /// No rule registered for the given table
    #[error("no rule for {schema}.{table}")]
    RuleNotExist { schema: String, table: String },

    /// Dump subprocess or parse error
    #[error("dump error: {0}")]
    Dump(String),

    /// Row-to-document mapping error
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Elasticsearch returned a non-success status
    #[error("elasticsearch error (status {status}): {message}")]
    Elastic { status: u16, message: String },

    /// HTTP transport error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration parse error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error (checkpoint records)
    #[error("toml error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// URL parse error (es:-style data paths)
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),

    /// Pipeline was cancelled
    #[error("pipeline closed")]
    Closed,
}

impl RiverError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a new schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a new dump error
    pub fn dump(msg: impl Into<String>) -> Self {
        Self::Dump(msg.into())
    }

    /// Create a new mapping error
    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::Mapping(msg.into())
    }

    /// Create a new Elasticsearch status error
    pub fn elastic(status: u16, message: impl Into<String>) -> Self {
        Self::Elastic {
            status,
            message: message.into(),
        }
    }

    pub fn rule_not_exist(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self::RuleNotExist {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Check whether this error means a rule lookup missed (swallowed on
    /// DDL refresh for untracked tables).
    pub fn is_rule_not_exist(&self) -> bool {
        matches!(self, Self::RuleNotExist { .. })
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, RiverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RiverError::config("empty schema");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("empty schema"));

        let err = RiverError::elastic(503, "unavailable");
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_rule_not_exist() {
        let err = RiverError::rule_not_exist("test", "t1");
        assert!(err.is_rule_not_exist());
        assert!(!RiverError::config("x").is_rule_not_exist());
        assert_eq!(err.to_string(), "no rule for test.t1");
    }
}
