//! Deterministic stand-ins for the mapping backend and the grant table,
//! plus the end-to-end tests built on them.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use hashbrown::HashMap;
use spin::Mutex;

use syscall::error::{Error, Result, EFBIG, EINVAL, ENOSPC};

use crate::backend::{BackendMapId, BackendTagId, MappingBackend, TagConstraints};
use crate::gnttab::{DomId, FreeCallback, GrantBatch, GrantRef, GrantTable};
use crate::lock::{DmaLock, MutexLock};
use crate::segment::{AddressSpace, DmaCallback, LoadStatus, MemDesc, Segment, SyncOp, BUS_SPACE_MAXADDR, PAGE_SIZE};
use crate::tag::{ParentTag, XenBusDma};


pub const ROOT: ParentTag = ParentTag::None;

/// First reference handed out by a fresh [`FakeGrantTable`]. Chosen so
/// references never collide with the frame numbers used in tests.
pub const FIRST_REF: GrantRef = 1000;

pub fn constraints(nsegments: usize) -> TagConstraints {
    TagConstraints {
        alignment: 1,
        boundary: 0,
        lowaddr: BUS_SPACE_MAXADDR,
        highaddr: BUS_SPACE_MAXADDR,
        maxsize: nsegments as u64 * PAGE_SIZE,
        nsegments,
        maxsegsz: PAGE_SIZE,
    }
}

pub fn setup(references: usize) -> (XenBusDma, Arc<FakeBackend>, Arc<FakeGrantTable>) {
    let backend = Arc::new(FakeBackend::new());
    let gnttab = Arc::new(FakeGrantTable::new(references));
    let dma = XenBusDma::new(backend.clone(), gnttab.clone());
    (dma, backend, gnttab)
}

/// A tag lock tests can inspect, along with the form `tag_create` takes.
pub fn mutex_lock() -> (Arc<MutexLock>, Option<Arc<dyn DmaLock>>) {
    let lock = Arc::new(MutexLock::new());
    let tag_lock: Arc<dyn DmaLock> = lock.clone();
    (lock, Some(tag_lock))
}

pub type Completions = Arc<Mutex<Vec<core::result::Result<Vec<Segment>, i32>>>>;

/// A completion that records what it was called with.
pub fn recorder() -> (Completions, DmaCallback) {
    let completions: Completions = Arc::new(Mutex::new(Vec::new()));
    let sink = completions.clone();
    let callback: DmaCallback = Box::new(move |result: Result<&[Segment]>| {
        sink.lock().push(result.map(|segs| segs.to_vec()).map_err(|err| err.errno));
    });
    (completions, callback)
}

/// Split `[addr, addr + len)` the way a backend with one-page segments would.
pub fn split(mut addr: u64, mut len: u64, maxsegsz: u64, out: &mut Vec<Segment>) {
    while len > 0 {
        let to_page_end = PAGE_SIZE - (addr & (PAGE_SIZE - 1));
        let chunk = len.min(to_page_end).min(maxsegsz);
        out.push(Segment::new(addr, chunk));
        addr += chunk;
        len -= chunk;
    }
}

struct FakeTag {
    constraints: TagConstraints,
}

#[derive(Default)]
struct FakeMap {
    tag: usize,
    flags: u32,
    loaded: bool,
    callback: Option<DmaCallback>,
    deferred: Option<Vec<Segment>>,
    completes: usize,
    syncs: Vec<SyncOp>,
}

#[derive(Default)]
struct BackendState {
    next_id: usize,
    tags: HashMap<usize, FakeTag>,
    tags_created: Vec<(TagConstraints, u32)>,
    maps: HashMap<usize, FakeMap>,
    fail_tag_create: Option<i32>,
    fail_tag_destroy: Option<i32>,
    fail_map_destroy: Option<i32>,
    fail_load: Option<i32>,
    defer_loads: bool,
    domains_set: usize,
    unloads: usize,
}

/// A backend resolving addresses one to one, split at page boundaries.
#[derive(Default)]
pub struct FakeBackend {
    inner: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_tag_create(&self, errno: i32) {
        self.inner.lock().fail_tag_create = Some(errno);
    }

    pub fn fail_next_tag_destroy(&self, errno: i32) {
        self.inner.lock().fail_tag_destroy = Some(errno);
    }

    pub fn fail_next_map_destroy(&self, errno: i32) {
        self.inner.lock().fail_map_destroy = Some(errno);
    }

    pub fn fail_next_load(&self, errno: i32) {
        self.inner.lock().fail_load = Some(errno);
    }

    /// Defer loads of maps that went through `waitok`.
    pub fn defer_loads(&self, defer: bool) {
        self.inner.lock().defer_loads = defer;
    }

    /// Finish the deferred load of `map` from the caller's context.
    pub fn finish_deferred(&self, map: BackendMapId) {
        let (callback, segs) = {
            let mut state = self.inner.lock();
            let map = state.maps.get_mut(&map.0).expect("no such map");
            let segs = map.deferred.take().expect("map has no deferred load");
            map.loaded = true;
            (map.callback.take().expect("map has no waitok callback"), segs)
        };
        callback(Ok(&segs));
    }

    pub fn fail_deferred(&self, map: BackendMapId, errno: i32) {
        let callback = {
            let mut state = self.inner.lock();
            let map = state.maps.get_mut(&map.0).expect("no such map");
            map.deferred = None;
            map.callback.take().expect("map has no waitok callback")
        };
        callback(Err(Error::new(errno)));
    }

    pub fn tags_created(&self) -> Vec<(TagConstraints, u32)> {
        self.inner.lock().tags_created.clone()
    }

    pub fn live_tags(&self) -> usize {
        self.inner.lock().tags.len()
    }

    pub fn live_maps(&self) -> usize {
        self.inner.lock().maps.len()
    }

    pub fn is_loaded(&self, map: BackendMapId) -> bool {
        self.inner.lock().maps.get(&map.0).map_or(false, |map| map.loaded)
    }

    pub fn map_flags(&self, map: BackendMapId) -> Option<u32> {
        self.inner.lock().maps.get(&map.0).map(|map| map.flags)
    }

    pub fn completes(&self, map: BackendMapId) -> usize {
        self.inner.lock().maps.get(&map.0).map_or(0, |map| map.completes)
    }

    pub fn syncs(&self, map: BackendMapId) -> Vec<SyncOp> {
        self.inner.lock().maps.get(&map.0).map_or_else(Vec::new, |map| map.syncs.clone())
    }

    pub fn unloads(&self) -> usize {
        self.inner.lock().unloads
    }

    pub fn domains_set(&self) -> usize {
        self.inner.lock().domains_set
    }

    fn resolve(&self, map: BackendMapId, produced: Vec<Segment>, segs: &mut [Segment], segp: &mut usize) -> Result<LoadStatus> {
        let mut state = self.inner.lock();
        if let Some(errno) = state.fail_load.take() {
            return Err(Error::new(errno));
        }

        let defer = state.defer_loads;
        let fake = state.maps.get(&map.0).ok_or(Error::new(EINVAL))?;
        let limit = state.tags[&fake.tag].constraints.nsegments;
        let room = segs.len().saturating_sub(*segp);
        if produced.len() > limit || produced.len() > room {
            return Err(Error::new(EFBIG));
        }

        let fake = state.maps.get_mut(&map.0).ok_or(Error::new(EINVAL))?;
        if defer && fake.callback.is_some() {
            fake.deferred = Some(produced);
            return Ok(LoadStatus::InProgress);
        }

        for seg in produced {
            segs[*segp] = seg;
            *segp += 1;
        }
        fake.loaded = true;
        Ok(LoadStatus::Complete)
    }

    fn maxsegsz(&self, map: BackendMapId) -> u64 {
        let state = self.inner.lock();
        state
            .maps
            .get(&map.0)
            .and_then(|map| state.tags.get(&map.tag))
            .map_or(PAGE_SIZE, |tag| tag.constraints.maxsegsz)
    }
}

impl MappingBackend for FakeBackend {
    fn tag_create(&self, _parent: Option<BackendTagId>, constraints: &TagConstraints, flags: u32) -> Result<BackendTagId> {
        let mut state = self.inner.lock();
        if let Some(errno) = state.fail_tag_create.take() {
            return Err(Error::new(errno));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.tags.insert(id, FakeTag { constraints: *constraints });
        state.tags_created.push((*constraints, flags));
        Ok(BackendTagId(id))
    }

    fn tag_destroy(&self, tag: BackendTagId) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(errno) = state.fail_tag_destroy.take() {
            return Err(Error::new(errno));
        }
        state.tags.remove(&tag.0).map(|_| ()).ok_or(Error::new(EINVAL))
    }

    fn tag_set_domain(&self, _tag: BackendTagId) -> Result<()> {
        self.inner.lock().domains_set += 1;
        Ok(())
    }

    fn map_create(&self, tag: BackendTagId, flags: u32) -> Result<BackendMapId> {
        let mut state = self.inner.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.maps.insert(id, FakeMap { tag: tag.0, flags, ..FakeMap::default() });
        Ok(BackendMapId(id))
    }

    fn map_destroy(&self, _tag: BackendTagId, map: BackendMapId) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(errno) = state.fail_map_destroy.take() {
            return Err(Error::new(errno));
        }
        state.maps.remove(&map.0).map(|_| ()).ok_or(Error::new(EINVAL))
    }

    fn mem_alloc(&self, tag: BackendTagId, flags: u32) -> Result<(usize, BackendMapId)> {
        let map = self.map_create(tag, flags)?;
        Ok((0x10_0000 * map.0, map))
    }

    fn mem_free(&self, _tag: BackendTagId, _vaddr: usize, map: BackendMapId) {
        self.inner.lock().maps.remove(&map.0);
    }

    fn load_ma(
        &self,
        _tag: BackendTagId,
        map: BackendMapId,
        pages: &[u64],
        len: u64,
        offset: u64,
        _flags: u32,
        segs: &mut [Segment],
        segp: &mut usize,
    ) -> Result<LoadStatus> {
        let maxsegsz = self.maxsegsz(map);
        let mut produced = Vec::new();
        let mut left = len;
        let mut offset = offset;
        for &page in pages {
            if left == 0 {
                break;
            }
            let chunk = left.min(PAGE_SIZE - offset);
            split(page + offset, chunk, maxsegsz, &mut produced);
            left -= chunk;
            offset = 0;
        }
        if left != 0 {
            return Err(Error::new(EINVAL));
        }
        self.resolve(map, produced, segs, segp)
    }

    fn load_phys(
        &self,
        _tag: BackendTagId,
        map: BackendMapId,
        paddr: u64,
        len: u64,
        _flags: u32,
        segs: &mut [Segment],
        segp: &mut usize,
    ) -> Result<LoadStatus> {
        let mut produced = Vec::new();
        split(paddr, len, self.maxsegsz(map), &mut produced);
        self.resolve(map, produced, segs, segp)
    }

    fn load_buffer(
        &self,
        _tag: BackendTagId,
        map: BackendMapId,
        vaddr: usize,
        len: u64,
        _space: AddressSpace,
        _flags: u32,
        segs: &mut [Segment],
        segp: &mut usize,
    ) -> Result<LoadStatus> {
        let mut produced = Vec::new();
        split(vaddr as u64, len, self.maxsegsz(map), &mut produced);
        self.resolve(map, produced, segs, segp)
    }

    fn waitok(&self, _tag: BackendTagId, map: BackendMapId, _mem: MemDesc, callback: DmaCallback) {
        if let Some(map) = self.inner.lock().maps.get_mut(&map.0) {
            map.callback = Some(callback);
        }
    }

    fn complete(&self, _tag: BackendTagId, map: BackendMapId, _segs: &mut [Segment], _nsegs: usize, _error: Option<i32>) {
        if let Some(map) = self.inner.lock().maps.get_mut(&map.0) {
            map.completes += 1;
        }
    }

    fn unload(&self, _tag: BackendTagId, map: BackendMapId) {
        let mut state = self.inner.lock();
        state.unloads += 1;
        if let Some(map) = state.maps.get_mut(&map.0) {
            map.loaded = false;
        }
    }

    fn sync(&self, _tag: BackendTagId, map: BackendMapId, op: SyncOp) {
        if let Some(map) = self.inner.lock().maps.get_mut(&map.0) {
            map.syncs.push(op);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Grant {
    pub domid: DomId,
    pub frame: u64,
    pub readonly: bool,
}

#[derive(Default)]
struct PoolState {
    free: Vec<GrantRef>,
    next_ref: GrantRef,
    grants: HashMap<GrantRef, Grant>,
    revoked: Vec<GrantRef>,
    waiters: Vec<(usize, FreeCallback)>,
    /// Grant calls left before the next one fails.
    fail_grant_after: Option<usize>,
    fail_alloc: bool,
}

/// A grant table with a fixed set of references that tests can drain and
/// refill at will.
pub struct FakeGrantTable {
    inner: Mutex<PoolState>,
}

impl FakeGrantTable {
    pub fn new(references: usize) -> Self {
        let table = FakeGrantTable {
            inner: Mutex::new(PoolState {
                next_ref: FIRST_REF,
                ..PoolState::default()
            }),
        };
        table.add_references(references);
        table
    }

    /// Make `count` brand new references free, running any free callback
    /// that can now be satisfied.
    pub fn add_references(&self, count: usize) {
        {
            let mut state = self.inner.lock();
            for _ in 0..count {
                let gref = state.next_ref;
                state.next_ref += 1;
                // Handed out lowest first.
                state.free.insert(0, gref);
            }
        }
        self.run_waiters();
    }

    pub fn fail_grant_after(&self, grants: usize) {
        self.inner.lock().fail_grant_after = Some(grants);
    }

    /// Refuse the next allocation even if enough references are free, so
    /// the free callback requested after it runs straight away.
    pub fn fail_next_alloc(&self) {
        self.inner.lock().fail_alloc = true;
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn waiters(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn grant(&self, gref: GrantRef) -> Option<Grant> {
        self.inner.lock().grants.get(&gref).copied()
    }

    pub fn granted(&self) -> usize {
        self.inner.lock().grants.len()
    }

    pub fn revoked(&self) -> Vec<GrantRef> {
        self.inner.lock().revoked.clone()
    }

    /// Run free callbacks, first registered first, while the pool can
    /// satisfy them. Each runs without the pool lock so it can allocate.
    fn run_waiters(&self) {
        loop {
            let callback = {
                let mut state = self.inner.lock();
                let free = state.free.len();
                match state.waiters.iter().position(|(count, _)| *count <= free) {
                    Some(i) => state.waiters.remove(i).1,
                    None => return,
                }
            };
            callback();
        }
    }
}

impl GrantTable for FakeGrantTable {
    fn alloc_references(&self, count: usize) -> Result<GrantBatch> {
        let mut state = self.inner.lock();
        if mem::take(&mut state.fail_alloc) || state.free.len() < count {
            return Err(Error::new(ENOSPC));
        }
        let at = state.free.len() - count;
        // Claimed by popping, the lowest reference is already last.
        Ok(GrantBatch::new(state.free.split_off(at)))
    }

    fn claim_reference(&self, batch: &mut GrantBatch) -> Option<GrantRef> {
        batch.pop()
    }

    fn release_reference(&self, batch: &mut GrantBatch, gref: GrantRef) {
        batch.push(gref);
    }

    fn free_references(&self, batch: GrantBatch) {
        {
            let mut state = self.inner.lock();
            for gref in batch.into_refs() {
                assert!(!state.grants.contains_key(&gref), "reference {} freed while granted", gref);
                state.free.push(gref);
            }
        }
        self.run_waiters();
    }

    fn grant_foreign_access_ref(&self, gref: GrantRef, domid: DomId, frame: u64, readonly: bool) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(left) = state.fail_grant_after {
            if left == 0 {
                state.fail_grant_after = None;
                return Err(Error::new(EINVAL));
            }
            state.fail_grant_after = Some(left - 1);
        }
        let previous = state.grants.insert(gref, Grant { domid, frame, readonly });
        assert!(previous.is_none(), "reference {} granted twice", gref);
        Ok(())
    }

    fn end_foreign_access_ref(&self, gref: GrantRef) {
        let mut state = self.inner.lock();
        assert!(state.grants.remove(&gref).is_some(), "reference {} revoked while not granted", gref);
        state.revoked.push(gref);
    }

    fn request_free_callback(&self, count: usize, callback: FreeCallback) {
        self.inner.lock().waiters.push((count, callback));
        self.run_waiters();
    }
}
