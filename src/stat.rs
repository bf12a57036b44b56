//! Replication counters and the status HTTP endpoint.
//!
//! Counters are increment-only atomics written by the event handler and
//! read by the status server. The endpoint exposes Prometheus-style text on
//! the configured metrics path plus a human-readable `/stat` page showing
//! the server's current binlog position against the synced one.

use crate::canal::Canal;
use crate::es::BulkAction;
use crate::master::SharedPositionStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Cumulative document counters.
#[derive(Debug, Default)]
pub struct Stat {
    pub inserted: AtomicU64,
    pub updated: AtomicU64,
    pub deleted: AtomicU64,
}

impl Stat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one emitted bulk action.
    pub fn record(&self, action: BulkAction) {
        match action {
            BulkAction::Index | BulkAction::Create => {
                self.inserted.fetch_add(1, Ordering::Relaxed);
            }
            BulkAction::Update => {
                self.updated.fetch_add(1, Ordering::Relaxed);
            }
            BulkAction::Delete => {
                self.deleted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Shared state of the status server.
pub struct StatState {
    pub stat: Arc<Stat>,
    pub canal: Arc<Canal>,
    pub store: SharedPositionStore,
}

/// Serve the status endpoint until the process exits.
pub async fn serve(addr: String, metrics_path: String, state: Arc<StatState>) {
    let socket_addr: SocketAddr = match addr.parse() {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("invalid stat_addr {}: {}", addr, e);
            return;
        }
    };

    let app = Router::new()
        .route(&metrics_path, get(metrics_handler))
        .route("/stat", get(stat_handler))
        .with_state(state);

    info!("status endpoint listening on http://{}", socket_addr);

    let listener = match tokio::net::TcpListener::bind(socket_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("bind stat addr {} failed: {}", socket_addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("status endpoint failed: {}", e);
    }
}

async fn metrics_handler(State(state): State<Arc<StatState>>) -> String {
    let mut output = String::new();

    output.push_str("# HELP mysql2es_inserted_num The number of docs inserted to elasticsearch\n");
    output.push_str("# TYPE mysql2es_inserted_num counter\n");
    output.push_str(&format!(
        "mysql2es_inserted_num {}\n",
        state.stat.inserted.load(Ordering::Relaxed)
    ));

    output.push_str("# HELP mysql2es_updated_num The number of docs updated to elasticsearch\n");
    output.push_str("# TYPE mysql2es_updated_num counter\n");
    output.push_str(&format!(
        "mysql2es_updated_num {}\n",
        state.stat.updated.load(Ordering::Relaxed)
    ));

    output.push_str("# HELP mysql2es_deleted_num The number of docs deleted from elasticsearch\n");
    output.push_str("# TYPE mysql2es_deleted_num counter\n");
    output.push_str(&format!(
        "mysql2es_deleted_num {}\n",
        state.stat.deleted.load(Ordering::Relaxed)
    ));

    output.push_str("# HELP mysql2es_canal_state The canal slave running state: 0=stopped, 1=ok\n");
    output.push_str("# TYPE mysql2es_canal_state gauge\n");
    output.push_str(&format!(
        "mysql2es_canal_state {}\n",
        u8::from(state.canal.is_running())
    ));

    output.push_str("# HELP mysql2es_canal_delay The canal slave lag in seconds\n");
    output.push_str("# TYPE mysql2es_canal_delay gauge\n");
    output.push_str(&format!("mysql2es_canal_delay {}\n", state.canal.delay()));

    output
}

async fn stat_handler(
    State(state): State<Arc<StatState>>,
) -> Result<String, (StatusCode, String)> {
    let server_pos = state
        .canal
        .master_status()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("execute sql error {}", e)))?;

    let mut output = String::new();
    output.push_str(&format!("server_current_binlog:{}\n", server_pos));
    output.push_str(&format!("read_binlog:{}\n", state.canal.synced_position()));
    output.push_str(&format!("saved_binlog:{}\n", state.store.position().await));
    output.push_str(&format!(
        "insert_num:{}\n",
        state.stat.inserted.load(Ordering::Relaxed)
    ));
    output.push_str(&format!(
        "update_num:{}\n",
        state.stat.updated.load(Ordering::Relaxed)
    ));
    output.push_str(&format!(
        "delete_num:{}\n",
        state.stat.deleted.load(Ordering::Relaxed)
    ));

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_by_action() {
        let stat = Stat::new();
        stat.record(BulkAction::Index);
        stat.record(BulkAction::Index);
        stat.record(BulkAction::Update);
        stat.record(BulkAction::Delete);

        assert_eq!(stat.inserted.load(Ordering::Relaxed), 2);
        assert_eq!(stat.updated.load(Ordering::Relaxed), 1);
        assert_eq!(stat.deleted.load(Ordering::Relaxed), 1);
    }
}
