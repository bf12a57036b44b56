//! Checkpoint kept as a document in the target cluster.
//!
//! Selected by a data path of the form `es:http://host:9200/index/type?id=1`.
//! Saves are unconditional — the target is the system of record here, and a
//! lost write would widen the replay window after a crash.

use super::PositionStore;
use crate::error::{Result, RiverError};
use crate::es::{Client, ClientConfig};
use crate::position::Position;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};
use url::Url;

pub struct ElasticMasterInfo {
    es: Client,
    index: String,
    doc_type: String,
    id: String,
    addr: String,
    pos: RwLock<Position>,
}

impl ElasticMasterInfo {
    /// Parse the `es:`-stripped URL, ensure the mapping exists, and load the
    /// stored position (if any).
    pub async fn load(url: &str, my_addr: &str) -> Result<Self> {
        let url = Url::parse(url)?;

        let host = url
            .host_str()
            .ok_or_else(|| RiverError::config(format!("no host in checkpoint url {}", url)))?;
        let addr = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut segments = url
            .path_segments()
            .ok_or_else(|| RiverError::config("checkpoint url has no path"))?;
        let index = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RiverError::config("checkpoint url path must be /index/type"))?
            .to_string();
        let doc_type = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RiverError::config("checkpoint url path must be /index/type"))?
            .to_string();

        let id = url
            .query_pairs()
            .find(|(k, _)| k == "id")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_else(|| "1".to_string());

        let es = Client::new(&ClientConfig {
            addr,
            user: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
            https: url.scheme() == "https",
        })?;

        let store = Self {
            es,
            index,
            doc_type,
            id,
            addr: my_addr.to_string(),
            pos: RwLock::new(Position::default()),
        };
        store.load_position().await?;
        Ok(store)
    }

    async fn load_position(&self) -> Result<()> {
        let (code, _) = self.es.get_mapping(&self.index, &self.doc_type).await?;
        if code == 404 {
            self.create_mapping().await?;
        }

        let doc = self.es.get_doc(&self.index, &self.doc_type, &self.id).await?;
        if doc.found {
            let stored_addr = doc
                .source
                .get("addr")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if !stored_addr.is_empty() && stored_addr != self.addr {
                info!(
                    "MySQL addr {} in stored checkpoint, but new {}, reset",
                    stored_addr, self.addr
                );
                return Ok(());
            }

            let name = doc
                .source
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let pos = doc.source.get("pos").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            *self.pos.write().await = Position::new(name, pos);
        }
        Ok(())
    }

    async fn create_mapping(&self) -> Result<()> {
        // keyword arrived in 5.x; older clusters still use string
        let name_type = match self.es.major_version().await {
            Ok(major) if major < 5 => "string",
            Ok(_) => "keyword",
            Err(e) => {
                warn!("cluster version discovery failed ({}), assuming modern", e);
                "keyword"
            }
        };

        let mapping = json!({
            "properties": {
                "name": { "type": name_type },
                "pos": { "type": "long" },
            }
        });
        self.es
            .create_mapping(&self.index, &self.doc_type, &mapping)
            .await
    }
}

#[async_trait]
impl PositionStore for ElasticMasterInfo {
    async fn save(&self, pos: Position) -> Result<()> {
        {
            let mut guard = self.pos.write().await;
            *guard = pos.clone();
        }

        let doc = json!({
            "addr": self.addr,
            "name": pos.name,
            "pos": pos.pos,
        });
        self.es
            .put_doc(&self.index, &self.doc_type, &self.id, &doc)
            .await
    }

    async fn position(&self) -> Position {
        self.pos.read().await.clone()
    }

    async fn close(&self) -> Result<()> {
        let pos = self.position().await;
        let doc = json!({
            "addr": self.addr,
            "name": pos.name,
            "pos": pos.pos,
        });
        self.es
            .put_doc(&self.index, &self.doc_type, &self.id, &doc)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_parsing() {
        let url = Url::parse("http://user:pw@es.internal:9200/river_meta/master?id=7").unwrap();
        let mut segments = url.path_segments().unwrap();
        assert_eq!(segments.next(), Some("river_meta"));
        assert_eq!(segments.next(), Some("master"));
        assert_eq!(url.username(), "user");
        assert_eq!(
            url.query_pairs().find(|(k, _)| k == "id").unwrap().1,
            "7"
        );
    }
}
