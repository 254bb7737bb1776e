//! Pending replication work.

use std::collections::VecDeque;
use std::sync::Mutex;

use archivist_protocol::FileId;

/// FIFO of file identifiers waiting to be pushed to another node.
///
/// Duplicates are allowed; the replicator tolerates seeing an id twice.
#[derive(Debug, Default)]
pub struct ReplicationQueue {
    pending: Mutex<VecDeque<FileId>>,
}

impl ReplicationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut VecDeque<FileId>) -> R) -> R {
        // Each critical section is one deque call, so a poisoned queue is still whole.
        let mut guard = match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn enqueue(&self, id: FileId) {
        self.with(|q| q.push_back(id));
    }

    /// Put ids back, preserving their order, after everything already queued.
    pub fn requeue(&self, ids: impl IntoIterator<Item = FileId>) {
        self.with(|q| q.extend(ids));
    }

    /// Take up to `max` ids in insertion order. Never waits.
    pub fn drain(&self, max: usize) -> Vec<FileId> {
        self.with(|q| {
            let n = max.min(q.len());
            q.drain(..n).collect()
        })
    }

    /// Drop every queued occurrence of `id`. Returns how many were removed.
    pub fn remove(&self, id: &FileId) -> usize {
        self.with(|q| {
            let before = q.len();
            q.retain(|queued| queued != id);
            before - q.len()
        })
    }

    pub fn len(&self) -> usize {
        self.with(|q| q.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &FileId) -> bool {
        self.with(|q| q.contains(id))
    }
}
