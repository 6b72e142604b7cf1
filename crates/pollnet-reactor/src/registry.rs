//! Deferred-mutation bookkeeping for the active socket set.
//!
//! Registration changes made while the active set is being walked are staged
//! in three side sets and merged at the next [`Registry::commit`], so the
//! active set never changes under an iterator.

use indexmap::IndexSet;

use crate::socket::SocketId;

#[derive(Debug, Default)]
pub struct Registry {
    pending_add: IndexSet<SocketId>,
    active: IndexSet<SocketId>,
    pending_close: IndexSet<SocketId>,
    pending_destroy: IndexSet<SocketId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `id` for activation, cancelling any staged close or destroy.
    pub fn register(&mut self, id: SocketId) {
        self.pending_add.insert(id);
        self.pending_close.shift_remove(&id);
        self.pending_destroy.shift_remove(&id);
    }

    /// Stage `id` for eviction from the active set.
    pub fn deregister(&mut self, id: SocketId) {
        if self.pending_destroy.contains(&id) {
            return;
        }
        self.pending_close.insert(id);
        self.pending_add.shift_remove(&id);
    }

    /// Stage `id` for eviction and deallocation.
    pub fn destroy(&mut self, id: SocketId) {
        self.pending_destroy.insert(id);
        self.pending_add.shift_remove(&id);
        self.pending_close.shift_remove(&id);
    }

    /// Merge staged changes: adds, then destroys, then closes.
    ///
    /// Returns the ids whose storage the caller must now release.
    pub fn commit(&mut self) -> Vec<SocketId> {
        for id in self.pending_add.drain(..) {
            self.active.insert(id);
        }
        let destroyed: Vec<SocketId> = self.pending_destroy.drain(..).collect();
        for id in &destroyed {
            self.active.shift_remove(id);
        }
        for id in self.pending_close.drain(..) {
            self.active.shift_remove(&id);
        }
        destroyed
    }

    /// Snapshot of the active set in insertion order.
    pub fn active_ids(&self) -> Vec<SocketId> {
        self.active.iter().copied().collect()
    }

    pub fn is_active(&self, id: SocketId) -> bool {
        self.active.contains(&id)
    }

    pub fn is_pending_add(&self, id: SocketId) -> bool {
        self.pending_add.contains(&id)
    }

    pub fn is_pending_close(&self, id: SocketId) -> bool {
        self.pending_close.contains(&id)
    }

    pub fn is_pending_destroy(&self, id: SocketId) -> bool {
        self.pending_destroy.contains(&id)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// True when nothing is active and nothing is staged.
    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
            && self.pending_add.is_empty()
            && self.pending_close.is_empty()
            && self.pending_destroy.is_empty()
    }
}
