//! Xen DMA tags
//!
//! A Xen tag wraps one backend tag and adds the domain the grants are issued
//! to. Tags live in an arena owned by [`XenBusDma`]. A tag created from
//! another Xen tag holds a reference on it, so the parent's node outlives all
//! of its children even after the driver has destroyed the parent.

use alloc::sync::Arc;
use alloc::vec::Vec;

use slab::Slab;
use spin::Mutex;

use syscall::error::{Error, Result, EBUSY, EINVAL, ENOMEM};

use crate::backend::{BackendTagId, MappingBackend, TagConstraints};
use crate::flags::{decode_tag_flags, encode_tag_flags};
use crate::gnttab::{DomId, GrantTable};
use crate::lock::{DefaultLock, DmaLock};
use crate::segment::{Segment, BUS_SPACE_MAXADDR, BUS_SPACE_UNRESTRICTED, MAXPHYS, PAGE_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagId(usize);

impl TagId {
    pub fn get(self) -> usize {
        self.0
    }
}

/// Where a new tag hangs in the tag hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentTag {
    /// No parent at all, the backend applies its own defaults.
    None,
    /// A plain backend tag, such as the one of the bus the device sits on.
    Backend(BackendTagId),
    Xen(TagId),
}

/// The part of a tag maps need to reach.
pub(crate) struct TagInfo {
    pub(crate) backend_tag: BackendTagId,
    pub(crate) constraints: TagConstraints,
    pub(crate) domid: DomId,
    pub(crate) lock: Arc<dyn DmaLock>,
    /// Segment buffer shared by every load on this tag through
    /// [`XenMap::load`](crate::XenMap::load).
    pub(crate) segments: Mutex<Vec<Segment>>,
}

impl TagInfo {
    pub(crate) fn max_segments(&self) -> usize {
        self.constraints.nsegments
    }
}

struct TagNode {
    info: Arc<TagInfo>,
    parent: Option<TagId>,
    /// One for the driver's handle plus one per child tag.
    ref_count: usize,
    map_count: usize,
    destroyed: bool,
}

pub(crate) struct Shared {
    pub(crate) backend: Arc<dyn MappingBackend>,
    pub(crate) gnttab: Arc<dyn GrantTable>,
    tags: Mutex<Slab<TagNode>>,
}

impl Shared {
    /// Look up a live tag and account for one more map on it.
    pub(crate) fn ref_map(&self, tag: TagId) -> Result<Arc<TagInfo>> {
        let mut tags = self.tags.lock();
        let node = tags.get_mut(tag.0).filter(|node| !node.destroyed).ok_or(Error::new(EINVAL))?;
        node.map_count += 1;
        Ok(Arc::clone(&node.info))
    }

    pub(crate) fn unref_map(&self, tag: TagId) {
        let mut tags = self.tags.lock();
        match tags.get_mut(tag.0) {
            Some(node) if node.map_count > 0 => node.map_count -= 1,
            _ => panic!("busdma_xen: map released on tag {:?} which has no maps", tag),
        }
    }
}

/// The Xen-aware DMA layer.
///
/// Holds the backend and grant table every tag and map of the layer talks to.
/// Cloning yields another handle to the same layer.
#[derive(Clone)]
pub struct XenBusDma {
    pub(crate) shared: Arc<Shared>,
}

impl XenBusDma {
    pub fn new(backend: Arc<dyn MappingBackend>, gnttab: Arc<dyn GrantTable>) -> Self {
        XenBusDma {
            shared: Arc::new(Shared {
                backend,
                gnttab,
                tags: Mutex::new(Slab::new()),
            }),
        }
    }

    /// Create a tag whose grants go to the domain encoded in the high half
    /// of `flags`.
    ///
    /// `lock` brackets completions run from deferred contexts. Tags created
    /// without one must never see a load defer.
    pub fn tag_create(&self, parent: ParentTag, constraints: TagConstraints, flags: u32, lock: Option<Arc<dyn DmaLock>>) -> Result<TagId> {
        if constraints.maxsegsz == 0 || constraints.maxsegsz > PAGE_SIZE {
            log::warn!("busdma_xen: segment size {:#x} does not fit in one page", constraints.maxsegsz);
            return Err(Error::new(EINVAL));
        }
        if constraints.nsegments == 0 {
            return Err(Error::new(EINVAL));
        }

        let (flags, domid) = decode_tag_flags(flags);

        let mut tags = self.shared.tags.lock();

        let (backend_parent, parent) = match parent {
            ParentTag::None => (None, None),
            ParentTag::Backend(tag) => (Some(tag), None),
            ParentTag::Xen(id) => {
                let node = tags.get(id.0).filter(|node| !node.destroyed).ok_or(Error::new(EINVAL))?;
                (Some(node.info.backend_tag), Some(id))
            }
        };

        let backend_tag = self.shared.backend.tag_create(backend_parent, &constraints, flags)?;

        let mut segments = Vec::new();
        if segments.try_reserve_exact(segment_capacity(&constraints)).is_err() {
            log::warn!("busdma_xen: no memory for the segment buffer of a {} segment tag", constraints.nsegments);
            if let Err(err) = self.shared.backend.tag_destroy(backend_tag) {
                log::error!("busdma_xen: failed to roll back backend tag {:?}: {}", backend_tag, err);
            }
            return Err(Error::new(ENOMEM));
        }
        segments.resize(segment_capacity(&constraints), Segment::default());

        let info = Arc::new(TagInfo {
            backend_tag,
            constraints,
            domid,
            lock: lock.unwrap_or_else(|| Arc::new(DefaultLock)),
            segments: Mutex::new(segments),
        });

        if let Some(parent) = parent {
            tags[parent.0].ref_count += 1;
        }

        let key = tags.insert(TagNode {
            info,
            parent,
            ref_count: 1,
            map_count: 0,
            destroyed: false,
        });

        log::debug!("busdma_xen: tag {} for domain {} on backend tag {:?}", key, domid, backend_tag);

        Ok(TagId(key))
    }

    /// The tag drivers of paravirtualized devices normally use: page sized,
    /// page aligned segments that never cross a page, with no other
    /// restriction.
    pub fn xen_get_dma_tag(&self, parent: ParentTag, domid: DomId) -> Result<TagId> {
        let constraints = TagConstraints {
            alignment: PAGE_SIZE,
            boundary: PAGE_SIZE,
            lowaddr: BUS_SPACE_MAXADDR,
            highaddr: BUS_SPACE_MAXADDR,
            maxsize: MAXPHYS,
            nsegments: BUS_SPACE_UNRESTRICTED,
            maxsegsz: PAGE_SIZE,
        };
        self.tag_create(parent, constraints, encode_tag_flags(0, domid), None)
    }

    /// Destroy a tag.
    ///
    /// The backend tag goes first; only if it could be destroyed is the Xen
    /// tag dropped. Its node stays in the arena until its last child is gone.
    pub fn tag_destroy(&self, tag: TagId) -> Result<()> {
        let mut tags = self.shared.tags.lock();

        let node = tags.get_mut(tag.0).filter(|node| !node.destroyed).ok_or(Error::new(EINVAL))?;
        if node.map_count != 0 {
            return Err(Error::new(EBUSY));
        }

        self.shared.backend.tag_destroy(node.info.backend_tag)?;
        node.destroyed = true;

        release_tag(&mut tags, tag);
        Ok(())
    }

    pub fn tag_set_domain(&self, tag: TagId) -> Result<()> {
        let backend_tag = self.tag_info(tag)?.backend_tag;
        self.shared.backend.tag_set_domain(backend_tag)
    }

    pub fn tag_domain(&self, tag: TagId) -> Result<DomId> {
        Ok(self.tag_info(tag)?.domid)
    }

    /// Number of tags still held in the arena, destroyed parents included.
    pub fn tag_count(&self) -> usize {
        self.shared.tags.lock().len()
    }

    fn tag_info(&self, tag: TagId) -> Result<Arc<TagInfo>> {
        let tags = self.shared.tags.lock();
        let node = tags.get(tag.0).filter(|node| !node.destroyed).ok_or(Error::new(EINVAL))?;
        Ok(Arc::clone(&node.info))
    }
}

/// Drop one reference on `tag`, freeing it and walking up to its parent
/// every time a count reaches zero.
fn release_tag(tags: &mut Slab<TagNode>, tag: TagId) {
    let mut key = tag.0;
    loop {
        let node = &mut tags[key];
        node.ref_count -= 1;
        if node.ref_count > 0 {
            break;
        }

        let node = tags.remove(key);
        debug_assert!(node.destroyed, "busdma_xen: tag {} freed before its backend tag", key);
        log::debug!("busdma_xen: freed tag {}", key);

        match node.parent {
            Some(parent) => key = parent.0,
            None => break,
        }
    }
}

/// Number of segments a single load on a tag with `constraints` can produce.
fn segment_capacity(constraints: &TagConstraints) -> usize {
    let pages = constraints.maxsize.div_ceil(PAGE_SIZE).saturating_add(1);
    constraints.nsegments.min(usize::try_from(pages).unwrap_or(usize::MAX))
}
