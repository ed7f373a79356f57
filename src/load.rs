//! Loading maps
//!
//! The three load variants share one routine: the backend resolves the
//! buffer into segments, then one grant reference per segment is obtained and
//! bound to the segment's frame. On the way back the segment addresses are
//! replaced by the references, which is all the other end of a paravirtual
//! bus can dereference.
//!
//! Either step can defer. The backend defers when it is short of resources
//! and the driver allowed waiting; it then calls
//! [`MapInner::backend_resolved`]. The grant table defers the same way and
//! calls [`MapInner::references_freed`] once enough references are free.
//! Both resume through [`MapInner::acquire`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use syscall::error::{Error, Result, ENOMEM};

use crate::backend::{BackendMapId, BackendTagId, MappingBackend};
use crate::flags::{decode_load_flags, DmaFlags, GrantAccess};
use crate::lock::with_lock;
use crate::map::{claim_references, LoadState, MapFlags, MapInner, MapState, XenMap};
use crate::segment::{AddressSpace, DmaCallback, LoadStatus, MemDesc, Segment, SyncOp};

enum Acquired {
    Bound,
    /// The grant table is exhausted and the load may wait for it.
    Exhausted,
}

/// Outcome of the synchronous part of a load.
enum Resolved {
    Done(LoadStatus),
    /// The map is waiting for `nsegs` references, but the free callback is
    /// not registered yet. The caller registers it once it holds no locks.
    AwaitRefs(usize),
}

impl XenMap {
    /// Load a list of pages, entering the first one at `offset`.
    ///
    /// Segments are written to `segs` from `*segp` on, and `*segp` is left
    /// past the last one. The high half of `flags` holds the grant access
    /// mode, see [`BUS_DMA_XEN_RO`](crate::BUS_DMA_XEN_RO).
    #[allow(clippy::too_many_arguments)]
    pub fn load_ma(&self, pages: &[u64], len: u64, offset: u64, flags: u32, segs: &mut [Segment], segp: &mut usize) -> Result<LoadStatus> {
        let resolved = self.resolve_ma(pages, len, offset, flags, segs, segp)?;
        Ok(self.inner.settle(resolved))
    }

    pub fn load_phys(&self, paddr: u64, len: u64, flags: u32, segs: &mut [Segment], segp: &mut usize) -> Result<LoadStatus> {
        let resolved = self.resolve_phys(paddr, len, flags, segs, segp)?;
        Ok(self.inner.settle(resolved))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn load_buffer(&self, vaddr: usize, len: u64, space: AddressSpace, flags: u32, segs: &mut [Segment], segp: &mut usize) -> Result<LoadStatus> {
        let resolved = self.resolve_buffer(vaddr, len, space, flags, segs, segp)?;
        Ok(self.inner.settle(resolved))
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_ma(&self, pages: &[u64], len: u64, offset: u64, flags: u32, segs: &mut [Segment], segp: &mut usize) -> Result<Resolved> {
        let (flags, access) = decode_load_flags(flags);
        self.inner.load_with(access, segs, segp, |backend, tag, map, segs, segp| {
            backend.load_ma(tag, map, pages, len, offset, flags, segs, segp)
        })
    }

    fn resolve_phys(&self, paddr: u64, len: u64, flags: u32, segs: &mut [Segment], segp: &mut usize) -> Result<Resolved> {
        let (flags, access) = decode_load_flags(flags);
        self.inner.load_with(access, segs, segp, |backend, tag, map, segs, segp| {
            backend.load_phys(tag, map, paddr, len, flags, segs, segp)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_buffer(&self, vaddr: usize, len: u64, space: AddressSpace, flags: u32, segs: &mut [Segment], segp: &mut usize) -> Result<Resolved> {
        let (flags, access) = decode_load_flags(flags);
        self.inner.load_with(access, segs, segp, |backend, tag, map, segs, segp| {
            backend.load_buffer(tag, map, vaddr, len, space, flags, segs, segp)
        })
    }

    /// Allow the next load to wait for resources.
    ///
    /// If that load returns `InProgress`, `callback` is called exactly once,
    /// with the tag lock held, when it finishes.
    pub fn waitok(&self, mem: MemDesc, callback: DmaCallback) {
        {
            let mut state = self.inner.state.lock();
            assert!(matches!(state.load, LoadState::Idle), "busdma_xen: waitok on a map that is already loaded or loading");
            state.callback = Some(callback);
            state.flags.insert(MapFlags::SLEEPABLE);
        }

        let inner = Arc::clone(&self.inner);
        self.inner.shared.backend.waitok(
            self.inner.tag.backend_tag,
            self.inner.backend_map,
            mem,
            Box::new(move |result| inner.backend_resolved(result)),
        );
    }

    pub fn complete(&self, segs: &mut [Segment], nsegs: usize, error: Option<i32>) {
        self.inner.shared.backend.complete(self.inner.tag.backend_tag, self.inner.backend_map, segs, nsegs, error);
    }

    pub fn sync(&self, op: SyncOp) {
        self.inner.shared.backend.sync(self.inner.tag.backend_tag, self.inner.backend_map, op);
    }

    /// Load `mem` and hand the granted segments to `callback`.
    ///
    /// Unless `flags` contains `NOWAIT`, the load may defer; it then returns
    /// `InProgress` and `callback` runs later under the tag lock. Otherwise
    /// `callback` runs before this returns, with the segments or the error.
    ///
    /// Every error handed to `callback` is also returned, not only `ENOMEM`
    /// as `bus_dmamap_load` does, so callers can use `?` either way.
    ///
    /// Segments are resolved into the tag's shared segment buffer, which is
    /// held only while the backend fills it and the references are bound.
    pub fn load(&self, mem: MemDesc, flags: u32, callback: DmaCallback) -> Result<LoadStatus> {
        let (backend_flags, _) = decode_load_flags(flags);
        let nowait = DmaFlags::from_bits_retain(backend_flags).contains(DmaFlags::NOWAIT);

        let callback = if nowait {
            Some(callback)
        } else {
            self.waitok(mem.clone(), callback);
            None
        };

        let mut segments = self.inner.tag.segments.lock();
        let mut segp = 0;
        let resolved = match &mem {
            MemDesc::Pages { pages, offset, len } => self.resolve_ma(pages, *len, *offset, flags, &mut segments[..], &mut segp),
            MemDesc::Phys { paddr, len } => self.resolve_phys(*paddr, *len, flags, &mut segments[..], &mut segp),
            MemDesc::Buffer { vaddr, len, space } => self.resolve_buffer(*vaddr, *len, *space, flags, &mut segments[..], &mut segp),
        };

        let status = match resolved {
            Ok(Resolved::Done(LoadStatus::Complete)) => Ok(LoadStatus::Complete),
            Ok(Resolved::Done(LoadStatus::InProgress)) => return Ok(LoadStatus::InProgress),
            Ok(Resolved::AwaitRefs(nsegs)) => {
                // The free callback may run right away and load again on this tag.
                drop(segments);
                self.inner.wait_for_references(nsegs);
                return Ok(LoadStatus::InProgress);
            }
            Err(err) => Err(err),
        };

        // Not deferred, so the completion is ours to call.
        let callback = callback.or_else(|| self.inner.state.lock().callback.take());

        let error = status.as_ref().err().map(|err| err.errno);
        self.complete(&mut segments[..], segp, error);
        let bound: Vec<Segment> = segments[..segp].to_vec();
        drop(segments);

        match callback {
            Some(callback) => match &status {
                Ok(_) => callback(Ok(&bound[..])),
                Err(err) => callback(Err(Error::new(err.errno))),
            },
            None => log::warn!("busdma_xen: load finished with no completion registered"),
        }

        status
    }
}

impl MapInner {
    fn load_with<F>(&self, access: GrantAccess, segs: &mut [Segment], segp: &mut usize, resolve: F) -> Result<Resolved>
    where
        F: FnOnce(&dyn MappingBackend, BackendTagId, BackendMapId, &mut [Segment], &mut usize) -> Result<LoadStatus>,
    {
        {
            let mut state = self.state.lock();
            assert!(matches!(state.load, LoadState::Idle), "busdma_xen: load of a map that is already loaded or loading");
            state.access = access;
            state.load = LoadState::Resolving;
        }

        // segp holds the first segment on entry and one past the last on exit.
        let start = *segp;

        match resolve(&*self.shared.backend, self.tag.backend_tag, self.backend_map, segs, segp) {
            Ok(LoadStatus::Complete) => (),
            Ok(LoadStatus::InProgress) => {
                log::debug!("busdma_xen: backend deferred load of map {:?}", self.backend_map);
                return Ok(Resolved::Done(LoadStatus::InProgress));
            }
            Err(err) => {
                self.reset(&mut self.state.lock());
                return Err(err);
            }
        }

        let nsegs = *segp - start;
        assert!(
            nsegs <= self.tag.max_segments(),
            "busdma_xen: segcount too large: segcount = {}, max_segments = {}",
            nsegs,
            self.tag.max_segments()
        );
        let segs = &mut segs[start..*segp];

        let mut state = self.state.lock();
        state.nsegs = nsegs;

        match self.acquire(&mut state, segs) {
            Ok(Acquired::Bound) => Ok(Resolved::Done(LoadStatus::Complete)),
            Ok(Acquired::Exhausted) => {
                // The caller's buffer is gone by the time the references are.
                state.load = LoadState::AwaitingRefs {
                    snapshot: segs.to_vec(),
                    resolved_inline: true,
                };
                Ok(Resolved::AwaitRefs(nsegs))
            }
            Err(err) => {
                drop(state);
                self.shared.backend.unload(self.tag.backend_tag, self.backend_map);
                Err(err)
            }
        }
    }

    /// Obtain references for the `state.nsegs` segments in `segs` and bind
    /// them.
    ///
    /// On `Exhausted` nothing has been taken from the grant table. On error
    /// the map is back to idle, the backend mapping is left to the caller.
    fn acquire(&self, state: &mut MapState, segs: &mut [Segment]) -> Result<Acquired> {
        let nsegs = state.nsegs;

        if !state.preallocated() {
            match self.gnttab().alloc_references(nsegs) {
                Ok(mut batch) => {
                    state.refs = claim_references(self.gnttab(), &mut batch, nsegs);
                    state.batch = Some(batch);
                }
                Err(err) if state.sleepable() => {
                    log::debug!("busdma_xen: grant table exhausted ({}), waiting for {} references", err, nsegs);
                    return Ok(Acquired::Exhausted);
                }
                Err(err) => {
                    log::debug!("busdma_xen: grant table exhausted ({}), failing load of {} segments", err, nsegs);
                    self.reset(state);
                    return Err(Error::new(ENOMEM));
                }
            }
        }

        self.bind(state, segs)?;
        state.load = LoadState::Bound;
        Ok(Acquired::Bound)
    }

    /// Grant the domain access to every segment's frame and rewrite the
    /// segment addresses to the references.
    ///
    /// A failure revokes what was already granted and gives the references
    /// back before returning.
    fn bind(&self, state: &mut MapState, segs: &mut [Segment]) -> Result<()> {
        let readonly = state.access.read_only();
        let count = segs.len();

        for (i, seg) in segs.iter_mut().enumerate() {
            let gref = state.refs[i];
            if let Err(err) = self.gnttab().grant_foreign_access_ref(gref, self.tag.domid, seg.frame(), readonly) {
                log::warn!("busdma_xen: granting reference {} of {} failed: {}", i, count, err);
                self.revoke(&state.refs[..i]);
                self.release_references(state);
                self.reset(state);
                return Err(err);
            }
            seg.addr = u64::from(gref);
        }

        Ok(())
    }

    fn settle(self: &Arc<Self>, resolved: Resolved) -> LoadStatus {
        match resolved {
            Resolved::Done(status) => status,
            Resolved::AwaitRefs(nsegs) => {
                self.wait_for_references(nsegs);
                LoadStatus::InProgress
            }
        }
    }

    fn wait_for_references(self: &Arc<Self>, count: usize) {
        let map = Arc::clone(self);
        self.gnttab().request_free_callback(count, Box::new(move || map.references_freed()));
    }

    /// The grant table has `nsegs` free references again.
    pub(crate) fn references_freed(self: &Arc<Self>) {
        let mut state = self.state.lock();

        let (mut segs, resolved_inline) = match mem::replace(&mut state.load, LoadState::Resolving) {
            LoadState::AwaitingRefs { snapshot, resolved_inline } => (snapshot, resolved_inline),
            _ => panic!("busdma_xen: grant free callback on a map that is not waiting for references"),
        };

        let nsegs = state.nsegs;
        let mut batch = self.gnttab().alloc_references(nsegs).unwrap_or_else(|err| {
            panic!("busdma_xen: allocation of {} grant references in the free callback failed: {}", nsegs, err)
        });
        state.refs = claim_references(self.gnttab(), &mut batch, nsegs);
        state.batch = Some(batch);

        let result = self.bind(&mut state, &mut segs);
        if result.is_ok() {
            state.load = LoadState::Bound;
        }
        let callback = state.callback.take();
        drop(state);

        match result {
            Err(_) => self.shared.backend.unload(self.tag.backend_tag, self.backend_map),
            // A backend that deferred has finalized the segments itself.
            Ok(()) if resolved_inline => {
                self.shared.backend.complete(self.tag.backend_tag, self.backend_map, &mut segs, nsegs, None);
            }
            Ok(()) => (),
        }

        self.deliver(callback, result.map(|()| &segs[..]));
    }

    /// The backend finished a load it had deferred.
    pub(crate) fn backend_resolved(self: &Arc<Self>, result: Result<&[Segment]>) {
        let segs = match result {
            Ok(segs) => segs,
            Err(err) => {
                let callback = {
                    let mut state = self.state.lock();
                    self.reset(&mut state);
                    state.callback.take()
                };
                self.deliver(callback, Err(err));
                return;
            }
        };

        assert!(
            segs.len() <= self.tag.max_segments(),
            "busdma_xen: segcount too large: segcount = {}, max_segments = {}",
            segs.len(),
            self.tag.max_segments()
        );

        // No telling when, or from where, the grant table calls back.
        let mut snapshot = segs.to_vec();

        let mut state = self.state.lock();
        assert!(matches!(state.load, LoadState::Resolving), "busdma_xen: backend completion on a map that is not loading");
        state.nsegs = snapshot.len();

        match self.acquire(&mut state, &mut snapshot) {
            Ok(Acquired::Bound) => {
                let callback = state.callback.take();
                drop(state);
                self.deliver(callback, Ok(&snapshot[..]));
            }
            Ok(Acquired::Exhausted) => {
                let nsegs = state.nsegs;
                state.load = LoadState::AwaitingRefs {
                    snapshot,
                    resolved_inline: false,
                };
                drop(state);
                self.wait_for_references(nsegs);
            }
            Err(err) => {
                let callback = state.callback.take();
                drop(state);
                self.shared.backend.unload(self.tag.backend_tag, self.backend_map);
                self.deliver(callback, Err(err));
            }
        }
    }

    /// Run the driver's completion from a deferred context.
    fn deliver(&self, callback: Option<DmaCallback>, result: Result<&[Segment]>) {
        match callback {
            Some(callback) => with_lock(&*self.tag.lock, || callback(result)),
            None => log::warn!("busdma_xen: deferred load of map {:?} finished with no completion registered", self.backend_map),
        }
    }
}
