//! Rule registry: resolves `(schema, table)` to a [`Rule`] at startup and
//! keeps the resolution current across observed DDL.
//!
//! Source entries register default rules, with regex table names expanded
//! against the source catalog; configured `[[rule]]` overrides then replace
//! or decorate them. After preparation the registry is effectively
//! immutable: a DDL refresh builds a new `Rule` value with re-fetched table
//! metadata and atomically swaps the map entry behind a short-held write
//! lock, so row-event readers only ever see a consistent rule snapshot.

use crate::config::Config;
use crate::error::{Result, RiverError};
use crate::rule::{rule_key, Rule};
use crate::schema::TableInfo;
use mysql_async::prelude::*;
use mysql_async::Pool;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// A table entry in a source is a literal name unless regex metacharacters
/// make its quoted form differ.
fn is_literal_table(table: &str) -> bool {
    regex::escape(table) == table
}

/// Resolved rule set, keyed by `schema:table`.
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Arc<Rule>>>,
    pool: Pool,
    skip_no_pk_table: bool,
}

impl RuleRegistry {
    /// Resolve all configured sources and rule overrides against the source
    /// catalog. Any inconsistency here is startup-fatal.
    pub async fn prepare(config: &Config, pool: Pool) -> Result<Self> {
        let mut rules: HashMap<String, Rule> = HashMap::new();
        // pattern key -> tables it matched, for pattern overrides
        let mut wildcards: HashMap<String, Vec<String>> = HashMap::new();

        for source in &config.sources {
            if source.schema.is_empty() {
                return Err(RiverError::config("empty schema in source entry"));
            }

            for table in &source.tables {
                if is_literal_table(table) {
                    register_default(&mut rules, &source.schema, table)?;
                } else {
                    let matched = matched_tables(&pool, &source.schema, table).await?;
                    if matched.is_empty() {
                        warn!(
                            "wildcard {}.{} matched no tables in source catalog",
                            source.schema, table
                        );
                    }
                    for name in &matched {
                        register_default(&mut rules, &source.schema, name)?;
                    }
                    wildcards.insert(rule_key(&source.schema, table), matched);
                }
            }
        }

        if rules.is_empty() {
            return Err(RiverError::config("no source data defined"));
        }

        apply_overrides(&mut rules, &wildcards, config)?;

        let mut prepared: HashMap<String, Arc<Rule>> = HashMap::with_capacity(rules.len());
        for (key, mut rule) in rules {
            let info = TableInfo::fetch(&pool, &rule.schema, &rule.table).await?;

            if rule.id.is_none() && info.pk_columns.len() != 1 {
                if config.skip_no_pk_table {
                    warn!(
                        "ignored table {}.{} without a single-column primary key",
                        rule.schema, rule.table
                    );
                    continue;
                }
                return Err(RiverError::config(format!(
                    "table {}.{} must have exactly one primary-key column, or set id columns in its rule",
                    rule.schema, rule.table
                )));
            }

            rule.table_info = Arc::new(info);
            rule.prepare();
            prepared.insert(key, Arc::new(rule));
        }

        info!("prepared {} rules", prepared.len());

        Ok(Self {
            rules: RwLock::new(prepared),
            pool,
            skip_no_pk_table: config.skip_no_pk_table,
        })
    }

    /// Look up the rule for a table. Cheap clone of an `Arc`; callers hold
    /// the snapshot for the duration of one row event.
    pub fn get(&self, schema: &str, table: &str) -> Option<Arc<Rule>> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&rule_key(schema, table))
            .cloned()
    }

    /// Snapshot of all rules, for the dump table list and the status page.
    pub fn all(&self) -> Vec<Arc<Rule>> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Refresh a rule's table metadata after observed DDL. The new rule is
    /// built outside the lock and swapped in atomically.
    pub async fn update_rule(&self, schema: &str, table: &str) -> Result<()> {
        let key = rule_key(schema, table);

        let current = self
            .rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
            .ok_or_else(|| RiverError::rule_not_exist(schema, table))?;

        let info = TableInfo::fetch(&self.pool, schema, table).await?;

        if current.id.is_none() && info.pk_columns.len() != 1 && !self.skip_no_pk_table {
            return Err(RiverError::schema(format!(
                "table {}.{} lost its single-column primary key",
                schema, table
            )));
        }

        let mut refreshed = (*current).clone();
        refreshed.table_info = Arc::new(info);

        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::new(refreshed));

        info!("refreshed table info for {}.{}", schema, table);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn from_rules(pool: Pool, rules: Vec<Rule>) -> Self {
        let map = rules
            .into_iter()
            .map(|r| (rule_key(&r.schema, &r.table), Arc::new(r)))
            .collect();
        Self {
            rules: RwLock::new(map),
            pool,
            skip_no_pk_table: false,
        }
    }
}

fn register_default(rules: &mut HashMap<String, Rule>, schema: &str, table: &str) -> Result<()> {
    let key = rule_key(schema, table);
    if rules.contains_key(&key) {
        return Err(RiverError::config(format!(
            "duplicate source {}.{} defined in config",
            schema, table
        )));
    }
    rules.insert(key, Rule::new_default(schema, table));
    Ok(())
}

/// Expand a table name pattern against the source catalog using the
/// server's own regex dialect.
async fn matched_tables(pool: &Pool, schema: &str, pattern: &str) -> Result<Vec<String>> {
    let mut conn = pool.get_conn().await?;
    let tables: Vec<String> = conn
        .exec(
            r"SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES
              WHERE TABLE_SCHEMA = ? AND TABLE_NAME RLIKE ?",
            (schema, pattern),
        )
        .await?;
    Ok(tables)
}

/// Replace or decorate default rules with the configured `[[rule]]` entries.
fn apply_overrides(
    rules: &mut HashMap<String, Rule>,
    wildcards: &HashMap<String, Vec<String>>,
    config: &Config,
) -> Result<()> {
    for cfg in &config.rules {
        if cfg.schema.is_empty() {
            return Err(RiverError::config("empty schema in rule entry"));
        }

        if is_literal_table(&cfg.table) {
            let key = rule_key(&cfg.schema, &cfg.table);
            let rule = rules.get_mut(&key).ok_or_else(|| {
                RiverError::config(format!(
                    "rule {}.{} not defined in source",
                    cfg.schema, cfg.table
                ))
            })?;
            rule.apply_override(cfg);
        } else {
            let key = rule_key(&cfg.schema, &cfg.table);
            let matched = wildcards.get(&key).ok_or_else(|| {
                RiverError::config(format!(
                    "wildcard rule {}.{} not defined in source",
                    cfg.schema, cfg.table
                ))
            })?;
            if cfg.index.is_empty() {
                return Err(RiverError::config(format!(
                    "wildcard rule {}.{} must set an index",
                    cfg.schema, cfg.table
                )));
            }
            for table in matched {
                let rule = rules
                    .get_mut(&rule_key(&cfg.schema, table))
                    .expect("wildcard match registered above");
                rule.apply_override(cfg);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;

    fn base_config(rules: Vec<RuleConfig>) -> Config {
        Config::from_str(
            r#"
my_addr = "db:3306"
my_user = "root"
es_addr = "es:9200"
data_dir = "./var"
server_id = 1

[[source]]
schema = "test"
tables = ["t"]
"#,
        )
        .map(|mut c| {
            c.rules = rules;
            c
        })
        .unwrap()
    }

    #[test]
    fn test_is_literal_table() {
        assert!(is_literal_table("orders"));
        assert!(is_literal_table("order_items"));
        assert!(!is_literal_table("t_[0-9]{4}"));
        assert!(!is_literal_table("logs_.*"));
    }

    #[test]
    fn test_register_default_rejects_duplicates() {
        let mut rules = HashMap::new();
        register_default(&mut rules, "test", "t").unwrap();
        let err = register_default(&mut rules, "test", "t").unwrap_err();
        assert!(err.to_string().contains("duplicate source"));
    }

    #[test]
    fn test_override_unknown_table_fails() {
        let mut rules = HashMap::new();
        register_default(&mut rules, "test", "t").unwrap();

        let config = base_config(vec![RuleConfig {
            schema: "test".into(),
            table: "other".into(),
            ..Default::default()
        }]);

        let err = apply_overrides(&mut rules, &HashMap::new(), &config).unwrap_err();
        assert!(err.to_string().contains("not defined in source"));
    }

    #[test]
    fn test_override_replaces_literal() {
        let mut rules = HashMap::new();
        register_default(&mut rules, "test", "t").unwrap();

        let config = base_config(vec![RuleConfig {
            schema: "test".into(),
            table: "t".into(),
            index: "river".into(),
            doc_type: "river".into(),
            ..Default::default()
        }]);

        apply_overrides(&mut rules, &HashMap::new(), &config).unwrap();
        let rule = &rules[&rule_key("test", "t")];
        assert_eq!(rule.index, "river");
        assert_eq!(rule.doc_type, "river");
    }

    #[test]
    fn test_wildcard_override_requires_index() {
        let mut rules = HashMap::new();
        register_default(&mut rules, "test", "t_2024").unwrap();
        register_default(&mut rules, "test", "t_2025").unwrap();

        let mut wildcards = HashMap::new();
        wildcards.insert(
            rule_key("test", "t_[0-9]{4}"),
            vec!["t_2024".to_string(), "t_2025".to_string()],
        );

        let config = base_config(vec![RuleConfig {
            schema: "test".into(),
            table: "t_[0-9]{4}".into(),
            ..Default::default()
        }]);
        let err = apply_overrides(&mut rules, &wildcards, &config).unwrap_err();
        assert!(err.to_string().contains("must set an index"));
    }

    #[test]
    fn test_wildcard_override_applies_to_all_matches() {
        let mut rules = HashMap::new();
        register_default(&mut rules, "test", "t_2024").unwrap();
        register_default(&mut rules, "test", "t_2025").unwrap();

        let mut wildcards = HashMap::new();
        wildcards.insert(
            rule_key("test", "t_[0-9]{4}"),
            vec!["t_2024".to_string(), "t_2025".to_string()],
        );

        let config = base_config(vec![RuleConfig {
            schema: "test".into(),
            table: "t_[0-9]{4}".into(),
            index: "river".into(),
            ..Default::default()
        }]);
        apply_overrides(&mut rules, &wildcards, &config).unwrap();

        assert_eq!(rules[&rule_key("test", "t_2024")].index, "river");
        assert_eq!(rules[&rule_key("test", "t_2025")].index, "river");
        // table identity is preserved
        assert_eq!(rules[&rule_key("test", "t_2025")].table, "t_2025");
    }

    #[test]
    fn test_registry_get() {
        let pool = Pool::new("mysql://root@localhost:3306/");
        let registry = RuleRegistry::from_rules(pool, vec![Rule::new_default("test", "t")]);

        assert!(registry.get("test", "t").is_some());
        assert!(registry.get("test", "missing").is_none());
        assert_eq!(registry.all().len(), 1);
    }
}
