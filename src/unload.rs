//! Unloading and destroying maps

use alloc::vec::Vec;
use core::mem;

use syscall::error::Error;

use crate::gnttab::{GrantBatch, GrantRef};
use crate::map::{LoadState, MapFlags, MapInner, MapState, XenMap};
use crate::tag::XenBusDma;

impl XenMap {
    /// Revoke every granted reference and unload the backend mapping.
    ///
    /// References of a preallocated map stay with the map; the others go
    /// back to the grant table. Unloading a map whose load is still
    /// deferred is a driver bug: there is no way to call back the pending
    /// resolution or free callback.
    pub fn unload(&self) {
        let inner = &self.inner;

        let (refs, batch) = {
            let mut state = inner.state.lock();
            match state.load {
                LoadState::Resolving | LoadState::AwaitingRefs { .. } => {
                    panic!("busdma_xen: unload of map {:?} with a deferred load outstanding", inner.backend_map)
                }
                LoadState::Bound => inner.revoke(&state.refs[..state.nsegs]),
                LoadState::Idle => (),
            }

            let held = if state.preallocated() {
                (Vec::new(), None)
            } else {
                (mem::take(&mut state.refs), state.batch.take())
            };
            inner.reset(&mut state);
            state.callback = None;
            held
        };

        inner.give_back(refs, batch);
        inner.shared.backend.unload(inner.tag.backend_tag, inner.backend_map);
    }

    /// Destroy an unloaded map.
    ///
    /// The backend map is destroyed first. If the backend refuses, the map
    /// is handed back untouched together with the error.
    pub fn destroy(self) -> core::result::Result<(), (XenMap, Error)> {
        {
            let state = self.inner.state.lock();
            assert!(
                matches!(state.load, LoadState::Idle),
                "busdma_xen: destroy of a loaded map, check if unload was called"
            );
            assert!(
                state.preallocated() || state.refs.is_empty(),
                "busdma_xen: map references not released, check if unload was called"
            );
        }

        let inner = &self.inner;
        if let Err(err) = inner.shared.backend.map_destroy(inner.tag.backend_tag, inner.backend_map) {
            return Err((self, err));
        }

        let (refs, batch) = {
            let mut state = inner.state.lock();
            state.flags.remove(MapFlags::PREALLOCATED);
            (mem::take(&mut state.refs), state.batch.take())
        };
        inner.give_back(refs, batch);

        inner.shared.unref_map(inner.tag_id);
        Ok(())
    }
}

impl XenBusDma {
    /// Free memory obtained from [`XenBusDma::mem_alloc`] along with its map.
    pub fn mem_free(&self, vaddr: usize, map: XenMap) {
        let inner = &map.inner;
        {
            let state = inner.state.lock();
            assert!(
                matches!(state.load, LoadState::Idle) && state.refs.is_empty(),
                "busdma_xen: map references not released, check if unload was called"
            );
        }

        self.shared.backend.mem_free(inner.tag.backend_tag, vaddr, inner.backend_map);
        self.shared.unref_map(inner.tag_id);
    }
}

impl MapInner {
    pub(crate) fn revoke(&self, refs: &[GrantRef]) {
        for &gref in refs {
            self.gnttab().end_foreign_access_ref(gref);
        }
    }

    /// Hand the references of a non-preallocated map back to the grant
    /// table.
    pub(crate) fn release_references(&self, state: &mut MapState) {
        if state.preallocated() {
            return;
        }
        let refs = mem::take(&mut state.refs);
        let batch = state.batch.take();
        self.give_back(refs, batch);
    }

    pub(crate) fn give_back(&self, refs: Vec<GrantRef>, batch: Option<GrantBatch>) {
        let Some(mut batch) = batch else {
            debug_assert!(refs.is_empty(), "busdma_xen: references without a batch");
            return;
        };
        for gref in refs {
            self.gnttab().release_reference(&mut batch, gref);
        }
        self.gnttab().free_references(batch);
    }

    /// Back to idle, as if never loaded.
    pub(crate) fn reset(&self, state: &mut MapState) {
        state.nsegs = 0;
        state.flags.remove(MapFlags::SLEEPABLE);
        state.load = LoadState::Idle;
    }
}
