//! Flag words understood by the Xen DMA layer
//!
//! Drivers talk to this layer with the same `u32` flag words they would hand
//! to the generic backend. The low 16 bits are ordinary backend flags; the
//! high 16 bits carry Xen-specific information, which is stripped before the
//! word is forwarded:
//!
//! * tag creation: `flags | (domid << BUS_DMA_XEN_DOMID_SHIFT)`
//! * load: `flags | (access << BUS_DMA_XEN_GNTTAB_FLAGS_SHIFT)`
//! * map creation: `flags | BUS_DMA_XEN_PREALLOC_REFS`

use bitflags::bitflags;

use crate::gnttab::DomId;

/// Shift needed to encode/decode grant table flags in DMA load flags.
pub const BUS_DMA_XEN_GNTTAB_FLAGS_SHIFT: u32 = 16;
/// Grant read-only access.
pub const BUS_DMA_XEN_RO: u32 = (GrantAccess::READ_ONLY.bits() as u32) << BUS_DMA_XEN_GNTTAB_FLAGS_SHIFT;
/// Shift needed to encode/decode the domain id in DMA tag create flags.
pub const BUS_DMA_XEN_DOMID_SHIFT: u32 = 16;
/// Reserve the grant references of a map when it is created.
pub const BUS_DMA_XEN_PREALLOC_REFS: u32 = MapCreateFlags::XEN_PREALLOC_REFS.bits();

const BACKEND_FLAGS_MASK: u32 = 0xffff;

bitflags! {
    /// Backend flags, the low half of every flag word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DmaFlags: u32 {
        /// Blocking is not permitted; exhaustion fails with `ENOMEM`.
        const NOWAIT = 0x01;
        const ALLOCNOW = 0x02;
        const COHERENT = 0x04;
        const ZERO = 0x08;
        const NOCACHE = 0x10;
        const NOWRITE = 0x100;
    }
}

bitflags! {
    /// Access mode requested for the grants of one load.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct GrantAccess: u16 {
        const READ_ONLY = 1 << 0;
    }
}

bitflags! {
    /// Map creation flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapCreateFlags: u32 {
        const COHERENT = DmaFlags::COHERENT.bits();
        const XEN_PREALLOC_REFS = 1 << 16;
    }
}

impl GrantAccess {
    pub fn read_only(self) -> bool {
        self.contains(GrantAccess::READ_ONLY)
    }
}

pub fn encode_tag_flags(flags: u32, domid: DomId) -> u32 {
    (flags & BACKEND_FLAGS_MASK) | (u32::from(domid) << BUS_DMA_XEN_DOMID_SHIFT)
}

/// Split tag creation flags into the backend flags and the domain id.
pub fn decode_tag_flags(flags: u32) -> (u32, DomId) {
    let domid = (flags >> BUS_DMA_XEN_DOMID_SHIFT) as DomId;
    (flags & BACKEND_FLAGS_MASK, domid)
}

pub fn encode_load_flags(flags: u32, access: GrantAccess) -> u32 {
    (flags & BACKEND_FLAGS_MASK) | (u32::from(access.bits()) << BUS_DMA_XEN_GNTTAB_FLAGS_SHIFT)
}

/// Split load flags into the backend flags and the grant access mode.
///
/// Unknown access bits are retained so that decoding never loses
/// information a newer driver may have encoded.
pub fn decode_load_flags(flags: u32) -> (u32, GrantAccess) {
    let access = GrantAccess::from_bits_retain((flags >> BUS_DMA_XEN_GNTTAB_FLAGS_SHIFT) as u16);
    (flags & BACKEND_FLAGS_MASK, access)
}

/// Split map creation flags into the backend flags and the preallocation
/// request.
pub fn decode_map_flags(flags: u32) -> (u32, bool) {
    let prealloc = MapCreateFlags::from_bits_retain(flags).contains(MapCreateFlags::XEN_PREALLOC_REFS);
    (flags & BACKEND_FLAGS_MASK, prealloc)
}
