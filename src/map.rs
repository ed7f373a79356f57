//! Xen DMA maps
//!
//! A map carries the grant references of one transfer. Its state moves
//! `Idle -> Resolving -> [AwaitingRefs ->] Bound -> Idle`, the last step
//! being the unload. `AwaitingRefs` owns the copy of the resolved segments
//! that the grant table's free callback binds once references are back.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use syscall::error::{Error, Result, EINVAL, ENOMEM};

use crate::backend::BackendMapId;
use crate::flags::{decode_map_flags, GrantAccess};
use crate::gnttab::{DomId, GrantBatch, GrantRef, GrantTable};
use crate::segment::{DmaCallback, Segment, BUS_SPACE_UNRESTRICTED};
use crate::tag::{Shared, TagId, TagInfo, XenBusDma};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub(crate) struct MapFlags: u8 {
        /// The driver allowed the current load to wait for resources.
        const SLEEPABLE = 1 << 0;
        /// References were reserved at creation and live as long as the map.
        const PREALLOCATED = 1 << 1;
    }
}

pub(crate) enum LoadState {
    Idle,
    /// The backend is resolving segments, possibly deferred.
    Resolving,
    /// The grant table ran dry; a free callback is registered.
    /// `resolved_inline` is set when the backend resolved the segments
    /// within the load call and so still expects its finalize step.
    AwaitingRefs { snapshot: Vec<Segment>, resolved_inline: bool },
    /// The first `nsegs` references are granted.
    Bound,
}

pub(crate) struct MapState {
    pub(crate) flags: MapFlags,
    pub(crate) refs: Vec<GrantRef>,
    /// Batch the references were claimed from, released into on unload.
    pub(crate) batch: Option<GrantBatch>,
    pub(crate) nsegs: usize,
    pub(crate) access: GrantAccess,
    pub(crate) load: LoadState,
    /// Driver completion stashed by `waitok`.
    pub(crate) callback: Option<DmaCallback>,
}

impl MapState {
    fn new(flags: MapFlags) -> Self {
        MapState {
            flags,
            refs: Vec::new(),
            batch: None,
            nsegs: 0,
            access: GrantAccess::empty(),
            load: LoadState::Idle,
            callback: None,
        }
    }

    pub(crate) fn sleepable(&self) -> bool {
        self.flags.contains(MapFlags::SLEEPABLE)
    }

    pub(crate) fn preallocated(&self) -> bool {
        self.flags.contains(MapFlags::PREALLOCATED)
    }
}

pub(crate) struct MapInner {
    pub(crate) shared: Arc<Shared>,
    pub(crate) tag_id: TagId,
    pub(crate) tag: Arc<TagInfo>,
    pub(crate) backend_map: BackendMapId,
    pub(crate) state: Mutex<MapState>,
}

impl MapInner {
    pub(crate) fn gnttab(&self) -> &dyn GrantTable {
        &*self.shared.gnttab
    }
}

/// A DMA map whose segments are handed out as grant references.
///
/// Owned by one driver and used by one load at a time.
pub struct XenMap {
    pub(crate) inner: Arc<MapInner>,
}

impl XenMap {
    pub(crate) fn new(shared: &Arc<Shared>, tag_id: TagId, tag: Arc<TagInfo>, backend_map: BackendMapId, state: MapState) -> Self {
        XenMap {
            inner: Arc::new(MapInner {
                shared: Arc::clone(shared),
                tag_id,
                tag,
                backend_map,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn tag(&self) -> TagId {
        self.inner.tag_id
    }

    pub fn domain_id(&self) -> DomId {
        self.inner.tag.domid
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.inner.state.lock().load, LoadState::Bound)
    }

    /// Whether a deferred load is still waiting on the backend or the grant
    /// table.
    pub fn is_pending(&self) -> bool {
        matches!(self.inner.state.lock().load, LoadState::Resolving | LoadState::AwaitingRefs { .. })
    }

    pub fn is_preallocated(&self) -> bool {
        self.inner.state.lock().preallocated()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.state.lock().nsegs
    }

    /// Run `f` on the map's reference array.
    ///
    /// For a loaded map the first `segment_count()` entries are the granted
    /// references, in segment order. A preallocated map always exposes its
    /// whole reservation.
    pub fn with_references<T>(&self, f: impl FnOnce(&[GrantRef]) -> T) -> T {
        let state = self.inner.state.lock();
        f(&state.refs)
    }
}

impl XenBusDma {
    /// Create a map on `tag`.
    ///
    /// With `BUS_DMA_XEN_PREALLOC_REFS` in `flags`, the map reserves one
    /// grant reference per segment the tag allows right away and keeps them
    /// until it is destroyed. That reservation never waits: an exhausted
    /// grant table fails the creation with `ENOMEM`.
    pub fn map_create(&self, tag: TagId, flags: u32) -> Result<XenMap> {
        let (flags, prealloc) = decode_map_flags(flags);

        let info = self.shared.ref_map(tag)?;

        match self.map_create_inner(tag, &info, flags, prealloc) {
            Ok(map) => Ok(map),
            Err(err) => {
                self.shared.unref_map(tag);
                Err(err)
            }
        }
    }

    fn map_create_inner(&self, tag: TagId, info: &Arc<TagInfo>, flags: u32, prealloc: bool) -> Result<XenMap> {
        if prealloc && info.max_segments() == BUS_SPACE_UNRESTRICTED {
            log::warn!("busdma_xen: cannot preallocate references for an unrestricted tag");
            return Err(Error::new(EINVAL));
        }

        let backend = &self.shared.backend;
        let backend_map = backend.map_create(info.backend_tag, flags)?;

        let mut state = MapState::new(MapFlags::empty());
        if prealloc {
            let count = info.max_segments();
            match self.shared.gnttab.alloc_references(count) {
                Ok(mut batch) => {
                    state.refs = claim_references(&*self.shared.gnttab, &mut batch, count);
                    state.batch = Some(batch);
                    state.flags.insert(MapFlags::PREALLOCATED);
                }
                Err(err) => {
                    log::warn!("busdma_xen: could not preallocate {} references: {}", count, err);
                    if let Err(err) = backend.map_destroy(info.backend_tag, backend_map) {
                        log::error!("busdma_xen: failed to roll back backend map {:?}: {}", backend_map, err);
                    }
                    return Err(Error::new(ENOMEM));
                }
            }
        }

        Ok(XenMap::new(&self.shared, tag, Arc::clone(info), backend_map, state))
    }

    /// Allocate DMA memory on `tag`, returning its address and its map.
    pub fn mem_alloc(&self, tag: TagId, flags: u32) -> Result<(usize, XenMap)> {
        let info = self.shared.ref_map(tag)?;

        match self.shared.backend.mem_alloc(info.backend_tag, flags) {
            Ok((vaddr, backend_map)) => {
                let map = XenMap::new(&self.shared, tag, info, backend_map, MapState::new(MapFlags::empty()));
                Ok((vaddr, map))
            }
            Err(err) => {
                self.shared.unref_map(tag);
                Err(err)
            }
        }
    }
}

/// Claim `count` references out of a batch the grant table promised holds
/// that many.
pub(crate) fn claim_references(gnttab: &dyn GrantTable, batch: &mut GrantBatch, count: usize) -> Vec<GrantRef> {
    let mut refs = Vec::with_capacity(count);
    for i in 0..count {
        match gnttab.claim_reference(batch) {
            Some(gref) => refs.push(gref),
            None => panic!("busdma_xen: grant batch ran dry after {} of {} references", i, count),
        }
    }
    refs
}
