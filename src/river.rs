//! Composition root: wires the source driver, rule registry, mapping
//! engine, sync loop and checkpoint store together and owns the lifecycle.

use crate::canal::{Canal, CanalConfig, EventHandler, RowsEvent};
use crate::config::Config;
use crate::error::{Result, RiverError};
use crate::es::{self, Client};
use crate::mapping;
use crate::master::{self, SharedPositionStore};
use crate::position::Position;
use crate::registry::RuleRegistry;
use crate::stat::{self, Stat, StatState};
use crate::sync::{SyncLoop, SyncMsg, SYNC_CHANNEL_CAPACITY};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The replication pipeline.
pub struct River {
    config: Config,
    cancel: CancellationToken,
    registry: Arc<RuleRegistry>,
    canal: Arc<Canal>,
    store: SharedPositionStore,
    stat: Arc<Stat>,
    sync_loop: Mutex<Option<SyncLoop>>,
}

impl River {
    /// Build the pipeline: load the checkpoint, resolve rules against the
    /// source, verify the binlog format and wire the event flow. All
    /// configuration problems surface here, before anything runs.
    pub async fn new(config: Config) -> Result<Self> {
        let cancel = CancellationToken::new();

        let store = master::open_store(&config).await?;

        let pool = Canal::make_pool(&config)?;
        let registry = Arc::new(RuleRegistry::prepare(&config, pool).await?);

        let canal = Arc::new(Canal::new(
            CanalConfig::from_config(&config),
            registry.clone(),
            cancel.child_token(),
        )?);
        canal.check_binlog_row_format().await?;

        let es = Arc::new(Client::new(&es::ClientConfig {
            addr: config.es_addr.clone(),
            user: config.es_user.clone(),
            password: config.es_pass.clone(),
            https: config.es_https,
        })?);

        let stat = Arc::new(Stat::new());

        let (sync_tx, sync_rx) = mpsc::channel(SYNC_CHANNEL_CAPACITY);
        let sync_loop = SyncLoop::new(
            sync_rx,
            es,
            store.clone(),
            config.bulk_size,
            config.flush_bulk_time,
            cancel.clone(),
        );

        canal.register_event_handler(Arc::new(RiverEventHandler {
            registry: registry.clone(),
            stat: stat.clone(),
            tx: sync_tx,
            cancel: cancel.clone(),
        }));

        Ok(Self {
            config,
            cancel,
            registry,
            canal,
            store,
            stat,
            sync_loop: Mutex::new(Some(sync_loop)),
        })
    }

    /// Run until cancelled: start the sync consumer and the status server,
    /// then drive the source (dump first when no checkpoint exists).
    pub async fn run(&self) -> Result<()> {
        if let Some(stat_addr) = self.config.stat_addr.clone() {
            let state = Arc::new(StatState {
                stat: self.stat.clone(),
                canal: self.canal.clone(),
                store: self.store.clone(),
            });
            tokio::spawn(stat::serve(
                stat_addr,
                self.config.stat_path.clone(),
                state,
            ));
        }

        let sync_loop = self
            .sync_loop
            .lock()
            .await
            .take()
            .ok_or_else(|| RiverError::replication("river already ran"))?;
        let sync_handle = tokio::spawn(sync_loop.run());

        let pos = self.store.position().await;
        let result = self.canal.run_from(pos).await;
        let deliberate_stop = self.cancel.is_cancelled();

        // stop everything and let the consumer drain
        self.cancel.cancel();
        let _ = sync_handle.await;
        if let Err(e) = self.store.close().await {
            error!("final checkpoint close failed: {}", e);
        }

        match result {
            Ok(()) | Err(RiverError::Closed) => Ok(()),
            Err(e) if deliberate_stop => {
                info!("source driver stopped: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Request a clean shutdown: the run loop performs the final flush and
    /// checkpoint save before returning.
    pub fn close(&self) {
        info!("closing river");
        self.cancel.cancel();
    }

    /// Root cancellation token, honored by every task of the pipeline.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until the snapshot phase finished (or was skipped).
    pub async fn wait_dump_done(&self) {
        self.canal.wait_dump_done().await;
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn stat(&self) -> &Stat {
        &self.stat
    }
}

/// Bridges source events into the sync channel.
struct RiverEventHandler {
    registry: Arc<RuleRegistry>,
    stat: Arc<Stat>,
    tx: mpsc::Sender<SyncMsg>,
    cancel: CancellationToken,
}

impl RiverEventHandler {
    async fn send(&self, msg: SyncMsg) -> Result<()> {
        tokio::select! {
            sent = self.tx.send(msg) => sent.map_err(|_| RiverError::Closed),
            _ = self.cancel.cancelled() => Err(RiverError::Closed),
        }
    }
}

#[async_trait]
impl EventHandler for RiverEventHandler {
    async fn on_rotate(&self, pos: Position) -> Result<()> {
        self.send(SyncMsg::PosMark { pos, force: true }).await
    }

    async fn on_row(&self, event: RowsEvent) -> Result<()> {
        let Some(rule) = self.registry.get(&event.schema, &event.table) else {
            return Ok(());
        };

        let requests = match mapping::make_requests(&rule, event.action, &event.rows) {
            Ok(requests) => requests,
            Err(e) => {
                error!(
                    "make {} request for {}.{} failed: {}, close sync",
                    event.action, event.schema, event.table, e
                );
                self.cancel.cancel();
                return Err(e);
            }
        };

        if requests.is_empty() {
            return Ok(());
        }
        for request in &requests {
            self.stat.record(request.action);
        }
        self.send(SyncMsg::Docs(requests)).await
    }

    async fn on_table_changed(&self, schema: &str, table: &str) -> Result<()> {
        match self.registry.update_rule(schema, table).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_rule_not_exist() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn on_ddl(&self, next_pos: Position) -> Result<()> {
        self.send(SyncMsg::PosMark {
            pos: next_pos,
            force: true,
        })
        .await
    }

    async fn on_xid(&self, next_pos: Position) -> Result<()> {
        self.send(SyncMsg::PosMark {
            pos: next_pos,
            force: false,
        })
        .await
    }

    async fn on_pos_synced(&self, pos: Position, force: bool) -> Result<()> {
        self.send(SyncMsg::PosMark { pos, force }).await
    }
}
