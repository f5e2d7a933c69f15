//! Topology store
//!
//! Single-writer, copy-on-write holder of the account topology. Readers
//! take an `Arc` snapshot and never block writers for longer than the
//! pointer swap; edits are applied to a private copy and committed only if
//! they succeed.

use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tracing::trace;

use crate::error::ControlResult;
use crate::topology::Topology;

struct StoreInner {
    current: RwLock<Arc<Topology>>,
    /// Serialises writers so no edit is lost between clone and swap
    writer: Mutex<()>,
    changes: watch::Sender<u64>,
}

/// Handle to the topology. Cloning shares the same state.
#[derive(Clone)]
pub struct TopologyStore {
    inner: Arc<StoreInner>,
}

impl TopologyStore {
    pub fn new(topology: Topology) -> Self {
        let (changes, _) = watch::channel(topology.serial);
        Self {
            inner: Arc::new(StoreInner {
                current: RwLock::new(Arc::new(topology)),
                writer: Mutex::new(()),
                changes,
            }),
        }
    }

    /// Current state
    pub async fn snapshot(&self) -> Arc<Topology> {
        self.inner.current.read().await.clone()
    }

    /// Serial of the current state
    pub async fn serial(&self) -> u64 {
        self.inner.current.read().await.serial
    }

    /// Apply `edit` to a copy of the state and publish it if it succeeds.
    /// On error nothing changes.
    pub async fn mutate<F, R>(&self, edit: F) -> ControlResult<R>
    where
        F: FnOnce(&mut Topology) -> ControlResult<R>,
    {
        let _writer = self.inner.writer.lock().await;

        let mut next = Topology::clone(&*self.snapshot().await);
        let result = edit(&mut next)?;
        next.serial += 1;
        let serial = next.serial;

        *self.inner.current.write().await = Arc::new(next);
        self.inner.changes.send_replace(serial);
        trace!("Topology committed at serial {}", serial);

        Ok(result)
    }

    /// Receiver notified with the serial after every commit
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }
}
