use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::wal::{StoreOp, Wal};

use super::tree::Tree;
use super::{segments, DocumentStore, KeyGen, Revision, StoreError, Versioned, Write};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        op: StoreOp,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        ops: Vec<StoreOp>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued, then
/// does a single fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { op, response } => {
                let mut batch = vec![(op, response)];
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { op, response }) => batch.push((op, response)),
                        Ok(other) => {
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(StoreOp, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(StoreOp, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (op, _) in batch {
        if let Err(e) = wal.append_buffered(op) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { ops, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &ops).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Durable store: the in-memory tree plus a write-ahead log that is replayed on open.
pub struct WalStore {
    tree: RwLock<Tree>,
    wal_tx: mpsc::Sender<WalCommand>,
    keys: KeyGen,
}

impl WalStore {
    /// Replay `path` and start the writer task. Must be called inside a Tokio runtime.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let ops = Wal::replay(path)?;
        let mut tree = Tree::new();
        let mut skipped = 0usize;
        for op in &ops {
            let applied = op.decode().and_then(|write| tree.apply(&write));
            if let Err(e) = applied {
                skipped += 1;
                debug!("skipping unreadable WAL op: {e}");
            }
        }
        if skipped > 0 {
            warn!("{skipped} WAL ops could not be applied during replay");
        }
        info!("replayed {} WAL ops from {}", ops.len(), path.display());

        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            tree: RwLock::new(tree),
            wal_tx,
            keys: KeyGen::default(),
        })
    }

    async fn wal_append(&self, op: StoreOp) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { op, response: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)??;
        Ok(())
    }

    /// Log first, then apply. The caller holds the tree write lock across both.
    async fn persist_and_apply(&self, tree: &mut Tree, write: &Write) -> Result<(), StoreError> {
        Tree::check(write)?;
        self.wal_append(StoreOp::encode(write)?).await?;
        tree.apply(write)
    }

    async fn write(&self, write: Write) -> Result<(), StoreError> {
        let mut tree = self.tree.write().await;
        self.persist_and_apply(&mut tree, &write).await
    }

    pub async fn appends_since_compact(&self) -> Result<u64, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    /// Rewrite the log as a single snapshot of the current tree.
    pub async fn compact(&self) -> Result<(), StoreError> {
        // Readers may proceed; writers wait until the swap is done.
        let tree = self.tree.read().await;
        let snapshot = StoreOp::Set {
            path: String::new(),
            json: serde_json::to_string(tree.root())?,
        };
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                ops: vec![snapshot],
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)??;
        Ok(())
    }
}

/// Background task that compacts the log once enough appends have piled up.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = match store.appends_since_compact().await {
            Ok(n) => n,
            Err(_) => return,
        };
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[async_trait]
impl DocumentStore for WalStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.tree.read().await.get(path)
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.write(Write::Set {
            path: path.to_string(),
            value,
        })
        .await
    }

    async fn update(&self, path: &str, partial: Map<String, Value>) -> Result<(), StoreError> {
        self.write(Write::Update {
            path: path.to_string(),
            partial,
        })
        .await
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.write(Write::Remove {
            path: path.to_string(),
        })
        .await
    }

    async fn push(&self, path: &str) -> Result<String, StoreError> {
        segments(path)?;
        Ok(self.keys.next_key())
    }

    async fn snapshot(&self, path: &str) -> Result<Versioned<Option<Value>>, StoreError> {
        let tree = self.tree.read().await;
        Ok(Versioned {
            value: tree.get(path)?,
            revision: tree.revision(path)?,
        })
    }

    async fn commit_if(
        &self,
        collection: &str,
        expected: Revision,
        write: Write,
    ) -> Result<bool, StoreError> {
        let mut tree = self.tree.write().await;
        if tree.revision(collection)? != expected {
            return Ok(false);
        }
        self.persist_and_apply(&mut tree, &write).await?;
        Ok(true)
    }
}
