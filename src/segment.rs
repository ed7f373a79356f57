use alloc::boxed::Box;
use alloc::vec::Vec;

use syscall::error::Result;

/// Size of a hypervisor page; one grant covers at most one page.
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Default maximum transfer size, in bytes.
pub const MAXPHYS: u64 = 1024 * 1024;

pub const BUS_SPACE_MAXADDR: u64 = u64::MAX;
pub const BUS_SPACE_MAXSIZE: u64 = u64::MAX;
/// Segment count meaning "no limit".
pub const BUS_SPACE_UNRESTRICTED: usize = !0;

/// One contiguous piece of a transfer.
///
/// Straight out of the backend `addr` is a bus address. After this layer has
/// bound the segment, `addr` is the grant reference instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u64,
}

impl Segment {
    pub const fn new(addr: u64, len: u64) -> Self {
        Segment { addr, len }
    }

    pub const fn frame(&self) -> u64 {
        self.addr >> PAGE_SHIFT
    }
}

/// Opaque identifier of an address space known to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AddressSpace(pub usize);

impl AddressSpace {
    pub const KERNEL: AddressSpace = AddressSpace(0);
}

/// Description of the memory behind one load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemDesc {
    /// A list of page frame addresses, the first one entered at `offset`.
    Pages { pages: Vec<u64>, offset: u64, len: u64 },
    Phys { paddr: u64, len: u64 },
    Buffer { vaddr: usize, len: u64, space: AddressSpace },
}

impl MemDesc {
    pub fn len(&self) -> u64 {
        match *self {
            MemDesc::Pages { len, .. } | MemDesc::Phys { len, .. } | MemDesc::Buffer { len, .. } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a load that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    Complete,
    /// The load was deferred. The completion registered through `waitok`
    /// fires exactly once when it finishes.
    InProgress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOp {
    PreRead,
    PostRead,
    PreWrite,
    PostWrite,
}

/// Completion of a load, handed the final segment list or the error.
pub type DmaCallback = Box<dyn FnOnce(Result<&[Segment]>) + Send>;
