//! # Xen grant-table DMA
//!
//! A DMA layer for paravirtualized drivers. It wraps a generic mapping
//! backend and, for every segment the backend resolves, obtains a grant
//! reference from the hypervisor's grant table and grants the remote domain
//! access to the segment's frame. Drivers get back segments whose addresses
//! are grant references, which is what the backend domain on the other end
//! of the bus understands.
//!
//! Both collaborators are injected: the backend as a [`MappingBackend`], the
//! grant table as a [`GrantTable`]. Either may defer a load, in which case
//! the driver's completion runs later under the tag's [`DmaLock`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub use self::backend::{BackendMapId, BackendTagId, MappingBackend, TagConstraints};
pub use self::flags::*;
pub use self::gnttab::{DomId, FreeCallback, GrantBatch, GrantRef, GrantTable};
pub use self::lock::{DefaultLock, DmaLock, LockOp, MutexLock};
pub use self::map::XenMap;
pub use self::segment::*;
pub use self::tag::{ParentTag, TagId, XenBusDma};

/// Generic mapping backend interface
pub mod backend;

/// Flag word encoding
pub mod flags;

/// Grant table interface
pub mod gnttab;

/// Load engine and deferred completions
mod load;

/// Tag lock
pub mod lock;

/// Maps
mod map;

/// Segments and buffer descriptions
pub mod segment;

/// Tags
mod tag;

/// Unload and teardown
mod unload;

/// Test doubles and end-to-end tests
#[cfg(test)]
pub mod tests;
