//! Grant table interface
//!
//! The grant table is a single, finite pool shared by the whole system.
//! References are taken from it in batches: `alloc_references` moves N free
//! references into a [`GrantBatch`], the caller claims them one by one,
//! releases them back into the batch when done, and finally returns the
//! batch to the pool with `free_references`.

use alloc::boxed::Box;
use alloc::vec::Vec;

use syscall::error::Result;

pub type GrantRef = u32;
pub type DomId = u16;

/// Run once, when the requested number of references is free again.
pub type FreeCallback = Box<dyn FnOnce() + Send>;

/// A batch of unclaimed grant references.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GrantBatch {
    refs: Vec<GrantRef>,
}

impl GrantBatch {
    pub fn new(refs: Vec<GrantRef>) -> Self {
        GrantBatch { refs }
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn pop(&mut self) -> Option<GrantRef> {
        self.refs.pop()
    }

    pub fn push(&mut self, gref: GrantRef) {
        self.refs.push(gref);
    }

    pub fn into_refs(self) -> Vec<GrantRef> {
        self.refs
    }
}

pub trait GrantTable: Send + Sync {
    /// Move `count` free references into a new batch. Fails when the pool
    /// does not have `count` free references.
    fn alloc_references(&self, count: usize) -> Result<GrantBatch>;

    /// Take one reference out of `batch`.
    fn claim_reference(&self, batch: &mut GrantBatch) -> Option<GrantRef>;

    /// Put a claimed reference back into `batch`.
    fn release_reference(&self, batch: &mut GrantBatch, gref: GrantRef);

    /// Return every reference still in `batch` to the pool.
    fn free_references(&self, batch: GrantBatch);

    /// Let `domid` access `frame` through `gref`.
    fn grant_foreign_access_ref(&self, gref: GrantRef, domid: DomId, frame: u64, readonly: bool) -> Result<()>;

    /// Revoke the foreign access granted through `gref`.
    fn end_foreign_access_ref(&self, gref: GrantRef);

    /// Call `callback` once `count` references are free. If they already
    /// are, the callback may run before this function returns.
    fn request_free_callback(&self, count: usize, callback: FreeCallback);
}
