//! Single-consumer sync loop.
//!
//! Drains the bounded event channel, owns the pending bulk buffer and the
//! flush timer, and persists checkpoints strictly after the batch they
//! follow was acknowledged. The channel carries exactly two payloads —
//! document batches and position marks — so ordering between data and
//! checkpoints is the channel order.

use crate::error::Result;
use crate::es::{BulkRequest, Client};
use crate::master::SharedPositionStore;
use crate::position::Position;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Bound of the sync channel. A full channel blocks the source driver,
/// which transparently backpressures the binlog connection.
pub const SYNC_CHANNEL_CAPACITY: usize = 4096;

/// Unforced position marks are persisted at most this often.
const SAVE_CADENCE: Duration = Duration::from_secs(3);

/// Payloads crossing the sync channel.
#[derive(Debug)]
pub enum SyncMsg {
    /// Mapped document actions, in source commit order
    Docs(Vec<BulkRequest>),
    /// A replication position that is safe to persist once everything
    /// before it has been applied
    PosMark { pos: Position, force: bool },
}

/// The consumer side of the pipeline.
pub struct SyncLoop {
    rx: mpsc::Receiver<SyncMsg>,
    es: Arc<Client>,
    store: SharedPositionStore,
    bulk_size: usize,
    flush_interval: Duration,
    cancel: CancellationToken,
}

impl SyncLoop {
    pub fn new(
        rx: mpsc::Receiver<SyncMsg>,
        es: Arc<Client>,
        store: SharedPositionStore,
        bulk_size: usize,
        flush_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            es,
            store,
            bulk_size: bulk_size.max(1),
            flush_interval,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut reqs: Vec<BulkRequest> = Vec::with_capacity(self.bulk_size);
        let mut pos: Option<Position> = None;
        let mut last_saved = Instant::now();

        loop {
            let mut need_flush = false;
            let mut need_save = false;

            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(SyncMsg::Docs(mut docs)) => {
                        reqs.append(&mut docs);
                        need_flush = reqs.len() >= self.bulk_size;
                    }
                    Some(SyncMsg::PosMark { pos: mark, force }) => {
                        // always retained so the shutdown drain can persist
                        // the newest mark even when the cadence skipped it
                        pos = Some(mark);
                        if force || last_saved.elapsed() > SAVE_CADENCE {
                            last_saved = Instant::now();
                            need_flush = true;
                            need_save = true;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => need_flush = true,
                _ = self.cancel.cancelled() => break,
            }

            if need_flush && !reqs.is_empty() {
                if let Err(e) = self.do_bulk(&mut reqs).await {
                    error!("bulk submit failed: {}, close sync", e);
                    self.cancel.cancel();
                    return;
                }
            }

            if need_save {
                if let Some(mark) = &pos {
                    if let Err(e) = self.store.save(mark.clone()).await {
                        error!("save sync position {} failed: {}, close sync", mark, e);
                        self.cancel.cancel();
                        return;
                    }
                }
            }
        }

        self.drain(reqs, pos).await;
    }

    /// Final drain on shutdown: pull whatever is already queued, flush once,
    /// persist the newest mark. Everything beyond this is replayed on the
    /// next run.
    async fn drain(&mut self, mut reqs: Vec<BulkRequest>, mut pos: Option<Position>) {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                SyncMsg::Docs(mut docs) => reqs.append(&mut docs),
                SyncMsg::PosMark { pos: mark, .. } => pos = Some(mark),
            }
        }

        if !reqs.is_empty() {
            if let Err(e) = self.do_bulk(&mut reqs).await {
                error!("final bulk flush failed: {}", e);
                return;
            }
        }
        if let Some(mark) = pos {
            if let Err(e) = self.store.save(mark.clone()).await {
                error!("final position save {} failed: {}", mark, e);
            }
        }

        info!("sync loop drained and stopped");
    }

    async fn do_bulk(&self, reqs: &mut Vec<BulkRequest>) -> Result<()> {
        debug!("bulk flush of {} actions", reqs.len());
        let response = self.es.bulk(reqs).await?;

        // per-item failures are logged and skipped; the batch as a whole
        // succeeded and the position may advance past it
        if response.errors {
            for item in response.items.iter().flatten() {
                let (action, result) = item;
                if let Some(error) = &result.error {
                    error!(
                        "{} index: {}, type: {}, id: {}, status: {}, error: {}",
                        action, result.index, result.doc_type, result.id, result.status, error
                    );
                }
            }
        }

        reqs.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::es::BulkAction;

    #[test]
    fn test_sync_msg_shapes() {
        let docs = SyncMsg::Docs(vec![BulkRequest {
            action: BulkAction::Index,
            index: "river".into(),
            doc_type: "river".into(),
            id: "1".into(),
            ..Default::default()
        }]);
        match docs {
            SyncMsg::Docs(reqs) => assert_eq!(reqs.len(), 1),
            _ => panic!("expected docs"),
        }

        let mark = SyncMsg::PosMark {
            pos: Position::new("mysql-bin.000001", 4),
            force: true,
        };
        match mark {
            SyncMsg::PosMark { force, .. } => assert!(force),
            _ => panic!("expected mark"),
        }
    }
}
