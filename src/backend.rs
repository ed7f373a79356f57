//! The generic mapping backend that this layer wraps
//!
//! The backend knows nothing about grants. It turns a buffer description into
//! a list of bus-addressed segments, bounce-buffering or remapping as needed,
//! and it owns the real tags and maps. Every Xen tag and map carries one of
//! each.

use syscall::error::Result;

use crate::segment::{AddressSpace, DmaCallback, LoadStatus, MemDesc, Segment, SyncOp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendTagId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendMapId(pub usize);

/// Constraints of a tag, forwarded verbatim to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TagConstraints {
    pub alignment: u64,
    pub boundary: u64,
    pub lowaddr: u64,
    pub highaddr: u64,
    pub maxsize: u64,
    pub nsegments: usize,
    pub maxsegsz: u64,
}

/// Operations the Xen layer needs from the generic backend.
///
/// The load functions write segments into `segs` starting at `*segp` and
/// leave `*segp` one past the last segment written. They return
/// `LoadStatus::InProgress` only after a `waitok` registration, and in that
/// case invoke the registered callback exactly once, later, without holding
/// the tag lock and never from inside the load call itself.
pub trait MappingBackend: Send + Sync {
    fn tag_create(&self, parent: Option<BackendTagId>, constraints: &TagConstraints, flags: u32) -> Result<BackendTagId>;
    fn tag_destroy(&self, tag: BackendTagId) -> Result<()>;
    fn tag_set_domain(&self, tag: BackendTagId) -> Result<()>;

    fn map_create(&self, tag: BackendTagId, flags: u32) -> Result<BackendMapId>;
    fn map_destroy(&self, tag: BackendTagId, map: BackendMapId) -> Result<()>;

    /// Allocate DMA-able memory together with a map for it. Returns the
    /// virtual address of the memory.
    fn mem_alloc(&self, tag: BackendTagId, flags: u32) -> Result<(usize, BackendMapId)>;
    fn mem_free(&self, tag: BackendTagId, vaddr: usize, map: BackendMapId);

    #[allow(clippy::too_many_arguments)]
    fn load_ma(
        &self,
        tag: BackendTagId,
        map: BackendMapId,
        pages: &[u64],
        len: u64,
        offset: u64,
        flags: u32,
        segs: &mut [Segment],
        segp: &mut usize,
    ) -> Result<LoadStatus>;

    #[allow(clippy::too_many_arguments)]
    fn load_phys(
        &self,
        tag: BackendTagId,
        map: BackendMapId,
        paddr: u64,
        len: u64,
        flags: u32,
        segs: &mut [Segment],
        segp: &mut usize,
    ) -> Result<LoadStatus>;

    #[allow(clippy::too_many_arguments)]
    fn load_buffer(
        &self,
        tag: BackendTagId,
        map: BackendMapId,
        vaddr: usize,
        len: u64,
        space: AddressSpace,
        flags: u32,
        segs: &mut [Segment],
        segp: &mut usize,
    ) -> Result<LoadStatus>;

    /// Register the completion used if the next load of `map` is deferred.
    fn waitok(&self, tag: BackendTagId, map: BackendMapId, mem: MemDesc, callback: DmaCallback);

    /// Finalize the first `nsegs` entries of `segs` after a load.
    fn complete(&self, tag: BackendTagId, map: BackendMapId, segs: &mut [Segment], nsegs: usize, error: Option<i32>);

    fn unload(&self, tag: BackendTagId, map: BackendMapId);
    fn sync(&self, tag: BackendTagId, map: BackendMapId, op: SyncOp);
}
