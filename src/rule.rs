//! Mapping rules: one source table to one target (index, type).

use crate::config::RuleConfig;
use crate::schema::TableInfo;
use std::collections::HashMap;
use std::sync::Arc;

/// Field type hint: split a string value on commas into a list.
pub const FIELD_TYPE_LIST: &str = "list";
/// Field type hint: reinterpret a numeric column as epoch seconds.
pub const FIELD_TYPE_DATE: &str = "date";

/// A resolved mapping rule.
///
/// Immutable after preparation; DDL refresh builds a new value and swaps the
/// registry entry, so readers only ever hold a consistent snapshot.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub schema: String,
    pub table: String,
    pub index: String,
    pub doc_type: String,
    /// Column holding the parent document id, if any
    pub parent: String,
    /// Ingest pipeline applied on index actions, if any
    pub pipeline: String,
    /// Explicit document-id columns; `None` falls back to the primary key
    pub id: Option<Vec<String>>,
    /// Columns to project; empty means all
    pub filter: Vec<String>,
    /// source column -> `<target_field>[,<fieldType>]`
    pub field_mapping: HashMap<String, String>,
    /// Cached column metadata, filled by the registry
    pub table_info: Arc<TableInfo>,
}

impl Rule {
    /// The default rule for a source entry: index and type named after the
    /// table, all columns projected under their own names.
    pub fn new_default(schema: impl Into<String>, table: impl Into<String>) -> Self {
        let table = table.into();
        Rule {
            schema: schema.into(),
            index: table.clone(),
            doc_type: table.clone(),
            table,
            ..Default::default()
        }
    }

    /// Copy the user-facing attributes of a configured override onto this
    /// rule, keeping schema/table/table_info. Empty index/type fall back to
    /// the table name in [`Rule::prepare`].
    pub fn apply_override(&mut self, cfg: &RuleConfig) {
        self.index = cfg.index.clone();
        self.doc_type = cfg.doc_type.clone();
        self.parent = cfg.parent.clone();
        self.pipeline = cfg.pipeline.clone();
        self.id = cfg.id.clone();
        self.filter = cfg.filter.clone();
        self.field_mapping = cfg.field_mapping.clone();
    }

    /// Index and type fall back to the table name and are always stored
    /// lower-cased (Elasticsearch index names must be lowercase).
    pub fn prepare(&mut self) {
        if self.index.is_empty() {
            self.index = self.table.clone();
        }
        if self.doc_type.is_empty() {
            self.doc_type = self.index.clone();
        }
        self.index = self.index.to_lowercase();
        self.doc_type = self.doc_type.to_lowercase();
    }

    /// Whether a column passes the projection filter.
    pub fn check_filter(&self, column: &str) -> bool {
        self.filter.is_empty() || self.filter.iter().any(|f| f == column)
    }
}

/// Registry key for a (schema, table) pair.
pub fn rule_key(schema: &str, table: &str) -> String {
    format!("{}:{}", schema, table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rule() {
        let rule = Rule::new_default("test", "orders");
        assert_eq!(rule.schema, "test");
        assert_eq!(rule.table, "orders");
        assert_eq!(rule.index, "orders");
        assert_eq!(rule.doc_type, "orders");
        assert!(rule.id.is_none());
        assert!(rule.check_filter("anything"));
    }

    #[test]
    fn test_prepare_lowercases() {
        let mut rule = Rule::new_default("test", "t");
        rule.index = "MyIndex".into();
        rule.doc_type = String::new();
        rule.prepare();
        assert_eq!(rule.index, "myindex");
        assert_eq!(rule.doc_type, "myindex");
    }

    #[test]
    fn test_filter() {
        let mut rule = Rule::new_default("test", "t");
        rule.filter = vec!["id".into(), "title".into()];
        assert!(rule.check_filter("id"));
        assert!(!rule.check_filter("body"));
    }

    #[test]
    fn test_apply_override_keeps_defaults() {
        let mut rule = Rule::new_default("test", "t");
        let cfg = RuleConfig {
            schema: "test".into(),
            table: "t".into(),
            doc_type: "doc".into(),
            ..Default::default()
        };
        rule.apply_override(&cfg);
        rule.prepare();
        // index not set in the override: falls back to the table name
        assert_eq!(rule.index, "t");
        assert_eq!(rule.doc_type, "doc");
    }

    #[test]
    fn test_rule_key() {
        assert_eq!(rule_key("test", "t"), "test:t");
    }
}
