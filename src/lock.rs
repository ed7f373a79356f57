//! Caller-supplied lock around deferred completions
//!
//! A driver that lets its loads block gets its completion called back from
//! whatever context finished the load. The tag's lock is taken around that
//! call so the driver sees the same locking it had when it issued the load.

use spin::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOp {
    Lock,
    Unlock,
}

pub trait DmaLock: Send + Sync {
    fn op(&self, op: LockOp);

    fn lock(&self) {
        self.op(LockOp::Lock);
    }

    fn unlock(&self) {
        self.op(LockOp::Unlock);
    }
}

/// Lock of tags whose loads never defer. Being called is a driver bug.
pub struct DefaultLock;

impl DmaLock for DefaultLock {
    fn op(&self, op: LockOp) {
        panic!("busdma_xen: driver error: default lock called ({:?})", op);
    }
}

/// A spin mutex usable as a lock/unlock pair.
pub struct MutexLock {
    inner: Mutex<()>,
}

impl MutexLock {
    pub const fn new() -> Self {
        MutexLock { inner: Mutex::new(()) }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl Default for MutexLock {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaLock for MutexLock {
    fn op(&self, op: LockOp) {
        match op {
            LockOp::Lock => core::mem::forget(self.inner.lock()),
            LockOp::Unlock => {
                assert!(self.inner.is_locked(), "busdma_xen: unlock of an unlocked tag lock");
                // SAFETY: the guard of the matching Lock was forgotten above.
                unsafe { self.inner.force_unlock() }
            }
        }
    }
}

/// Run `f` with `lock` held.
pub(crate) fn with_lock<T>(lock: &dyn DmaLock, f: impl FnOnce() -> T) -> T {
    lock.lock();
    let ret = f();
    lock.unlock();
    ret
}
