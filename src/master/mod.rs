//! Durable replication-position checkpointing.
//!
//! Two interchangeable stores behind one trait: a local TOML file under the
//! data directory, and a document kept in the target cluster itself
//! (selected by an `es:`-prefixed data path). Positions persist only after
//! the preceding bulk batch was acknowledged, which is what gives the
//! pipeline its at-least-once guarantee across restarts.

mod elastic;
mod file;

use crate::config::Config;
use crate::error::Result;
use crate::position::Position;
use async_trait::async_trait;
use std::sync::Arc;

pub use elastic::ElasticMasterInfo;
pub use file::FileMasterInfo;

/// A persisted replication position.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Persist a position. Implementations may rate-limit actual writes but
    /// must always retain the latest value in memory.
    async fn save(&self, pos: Position) -> Result<()>;

    /// The last known position; empty when no checkpoint exists yet.
    async fn position(&self) -> Position;

    /// Final forced persist and release of resources.
    async fn close(&self) -> Result<()>;
}

/// Shared checkpoint store handle.
pub type SharedPositionStore = Arc<dyn PositionStore>;

/// Open the checkpoint store selected by the configured data path.
///
/// A `data_dir` of the form `es:http://host:9200/index/type?id=1` selects
/// the target-document variant; anything else is a local directory.
pub async fn open_store(config: &Config) -> Result<SharedPositionStore> {
    if let Some(url) = config.data_dir.strip_prefix("es:") {
        Ok(Arc::new(ElasticMasterInfo::load(url, &config.my_addr).await?))
    } else {
        Ok(Arc::new(
            FileMasterInfo::load(&config.data_dir, &config.my_addr).await?,
        ))
    }
}
