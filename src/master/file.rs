//! File-backed checkpoint: `<data_dir>/master.info`.

use super::PositionStore;
use crate::error::Result;
use crate::position::Position;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

const MASTER_INFO_FILE: &str = "master.info";

/// Disk rate limit: binlog commit marks can arrive far faster than the
/// checkpoint needs to be durable.
const SAVE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Serialize, Deserialize)]
struct MasterInfoRecord {
    #[serde(default)]
    addr: String,
    #[serde(default)]
    bin_name: String,
    #[serde(default)]
    bin_pos: u32,
}

struct Inner {
    pos: Position,
    last_saved: Option<Instant>,
}

/// Checkpoint stored as a small TOML file, written atomically.
pub struct FileMasterInfo {
    path: PathBuf,
    addr: String,
    inner: RwLock<Inner>,
}

impl FileMasterInfo {
    /// Load (or initialise) the checkpoint under `data_dir`.
    ///
    /// A record written against a different source endpoint is discarded so
    /// one server's positions are never replayed against another.
    pub async fn load(data_dir: impl AsRef<Path>, my_addr: &str) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(MASTER_INFO_FILE);

        let mut pos = Position::default();
        if let Ok(data) = fs::read_to_string(&path).await {
            let record: MasterInfoRecord = toml::from_str(&data)?;
            if !record.addr.is_empty() && record.addr != my_addr {
                info!(
                    "MySQL addr {} in old master.info, but new {}, reset",
                    record.addr, my_addr
                );
            } else {
                pos = Position::new(record.bin_name, record.bin_pos);
            }
        }

        Ok(Self {
            path,
            addr: my_addr.to_string(),
            inner: RwLock::new(Inner {
                pos,
                last_saved: None,
            }),
        })
    }

    async fn write_record(&self, pos: &Position) -> Result<()> {
        let record = MasterInfoRecord {
            addr: self.addr.clone(),
            bin_name: pos.name.clone(),
            bin_pos: pos.pos,
        };
        let data = toml::to_string(&record)?;

        // temp file + rename keeps the record intact across crashes
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&tmp, &self.path).await?;

        debug!("saved position {}", pos);
        Ok(())
    }
}

#[async_trait]
impl PositionStore for FileMasterInfo {
    async fn save(&self, pos: Position) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.pos = pos;

        if let Some(last) = inner.last_saved {
            if last.elapsed() < SAVE_INTERVAL {
                return Ok(());
            }
        }
        inner.last_saved = Some(Instant::now());

        let pos = inner.pos.clone();
        drop(inner);
        self.write_record(&pos).await
    }

    async fn position(&self) -> Position {
        self.inner.read().await.pos.clone()
    }

    async fn close(&self) -> Result<()> {
        let pos = self.position().await;
        self.write_record(&pos).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_empty() {
        let dir = tempdir().unwrap();
        let store = FileMasterInfo::load(dir.path(), "127.0.0.1:3306")
            .await
            .unwrap();
        assert!(store.position().await.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let store = FileMasterInfo::load(dir.path(), "127.0.0.1:3306")
            .await
            .unwrap();

        store
            .save(Position::new("mysql-bin.000002", 1234))
            .await
            .unwrap();
        store.close().await.unwrap();

        let reloaded = FileMasterInfo::load(dir.path(), "127.0.0.1:3306")
            .await
            .unwrap();
        let pos = reloaded.position().await;
        assert_eq!(pos.name, "mysql-bin.000002");
        assert_eq!(pos.pos, 1234);
    }

    #[tokio::test]
    async fn test_endpoint_change_resets_position() {
        let dir = tempdir().unwrap();
        let store = FileMasterInfo::load(dir.path(), "old-db:3306").await.unwrap();
        store
            .save(Position::new("mysql-bin.000009", 99))
            .await
            .unwrap();
        store.close().await.unwrap();

        let other = FileMasterInfo::load(dir.path(), "new-db:3306").await.unwrap();
        assert!(other.position().await.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_keeps_latest_in_memory() {
        let dir = tempdir().unwrap();
        let store = FileMasterInfo::load(dir.path(), "127.0.0.1:3306")
            .await
            .unwrap();

        store.save(Position::new("mysql-bin.000001", 10)).await.unwrap();
        // second save inside the interval skips the disk write but the
        // in-memory position advances
        store.save(Position::new("mysql-bin.000001", 20)).await.unwrap();
        assert_eq!(store.position().await.pos, 20);

        // close forces the pending value out
        store.close().await.unwrap();
        let reloaded = FileMasterInfo::load(dir.path(), "127.0.0.1:3306")
            .await
            .unwrap();
        assert_eq!(reloaded.position().await.pos, 20);
    }
}
