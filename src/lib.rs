//! # mysql-es-river
//!
//! Change data capture from MySQL/MariaDB into Elasticsearch.
//!
//! The pipeline takes an initial consistent snapshot through an external
//! `mysqldump`-compatible tool, then follows the server's binary log and
//! converts committed row changes into bulk document actions against an
//! Elasticsearch-compatible cluster. Replication positions are checkpointed
//! durably so a restart resumes where the previous run left off, with
//! at-least-once delivery keyed by deterministic document ids.
//!
//! ## Architecture
//!
//! ```text
//! MySQL ──▶ Canal (dump | binlog) ──▶ mapping ──▶ sync loop ──▶ ES bulk API
//!                                                    │
//!                                                    └──▶ checkpoint store
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mysql_es_river::{Config, River};
//!
//! # async fn example() -> mysql_es_river::Result<()> {
//! let config = Config::from_file("river.toml")?;
//! let river = River::new(config).await?;
//! river.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod canal;
pub mod config;
pub mod error;
pub mod es;
pub mod mapping;
pub mod master;
pub mod position;
pub mod registry;
pub mod river;
pub mod rule;
pub mod schema;
pub mod stat;
pub mod sync;

pub use config::{Config, Flavor, RuleConfig, SourceConfig};
pub use error::{Result, RiverError};
pub use position::Position;
pub use river::River;
pub use rule::Rule;
pub use schema::{ColumnType, TableColumn, TableInfo};
