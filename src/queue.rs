//! Ordered work queue with identity-based lookup.
//!
//! The queue holds no lock of its own; the owning flow serializes every
//! operation under its state lock. The head, once dispatched, stays in the
//! queue until its completion removes it by identity.

use crate::model::TaskId;
use crate::task::TaskHandle;

/// Ordered sequence of task handles. No identity appears twice.
pub struct WorkQueue<T> {
    handles: Vec<TaskHandle<T>>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Insert at the tail. Returns false (and changes nothing) if the
    /// identity is already queued.
    pub fn append(&mut self, handle: TaskHandle<T>) -> bool {
        if self.index_of(handle.id()).is_some() {
            return false;
        }
        self.handles.push(handle);
        true
    }

    /// Insert at position 0. An already-queued handle with the same identity
    /// is moved rather than duplicated, taking the new context and delay.
    pub fn insert_front(&mut self, handle: TaskHandle<T>) {
        let handle = self.take_existing(handle);
        self.handles.insert(0, handle);
    }

    /// Insert immediately after `target`. No-op when `target` is absent or is
    /// the same identity as `handle`. Returns whether the queue changed.
    pub fn insert_after(&mut self, target: TaskId, handle: TaskHandle<T>) -> bool {
        if handle.id() == target {
            return false;
        }
        let Some(i) = self.index_of(target) else {
            return false;
        };
        let index = match self.index_of(handle.id()) {
            // Removing from before the target shifts it left by one.
            Some(j) if i > j => i,
            _ => i + 1,
        };
        let handle = self.take_existing(handle);
        self.handles.insert(index, handle);
        true
    }

    /// Insert immediately before `target`. No-op when `target` is absent, at
    /// position 0 (already executing), or the same identity as `handle`.
    /// Returns whether the queue changed.
    pub fn insert_before(&mut self, target: TaskId, handle: TaskHandle<T>) -> bool {
        if handle.id() == target {
            return false;
        }
        let i = match self.index_of(target) {
            Some(i) if i > 0 => i,
            _ => return false,
        };
        let index = match self.index_of(handle.id()) {
            Some(j) if i > j => i - 1,
            _ => i,
        };
        let handle = self.take_existing(handle);
        self.handles.insert(index, handle);
        true
    }

    /// Remove the handle with this identity, if queued.
    pub fn remove(&mut self, id: TaskId) -> Option<TaskHandle<T>> {
        let index = self.index_of(id)?;
        Some(self.handles.remove(index))
    }

    pub fn peek_head(&self) -> Option<&TaskHandle<T>> {
        self.handles.first()
    }

    pub fn pop_head(&mut self) -> Option<TaskHandle<T>> {
        if self.handles.is_empty() {
            None
        } else {
            Some(self.handles.remove(0))
        }
    }

    /// Position of the handle with this identity.
    pub fn index_of(&self, id: TaskId) -> Option<usize> {
        self.iter().position(|h| h.id() == id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }

    /// Identities in queue order.
    pub fn ids(&self) -> Vec<TaskId> {
        self.iter().map(TaskHandle::id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskHandle<T>> {
        self.handles.iter()
    }

    /// If `handle`'s identity is queued, pull that handle out and give it the
    /// new context and delay; otherwise hand back `handle` unchanged.
    fn take_existing(&mut self, handle: TaskHandle<T>) -> TaskHandle<T> {
        match self.remove(handle.id()) {
            Some(mut existing) => {
                existing.context = handle.context;
                existing.delay = handle.delay;
                existing
            }
            None => handle,
        }
    }
}
