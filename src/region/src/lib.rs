// Client-side view of the region manager, the service that owns the layout of an address
// space: which ranges are reserved as areas and which dataspace is attached where.

mod local;

pub use local::{LocalRegionManager, RegionInfo};

use bitflags::bitflags;
use dataspace::DataspaceRef;
use mem::{Addr, AddrRange};
use utils::SysResult;

bitflags! {
    pub struct AreaFlags: u32 {
        // pick any free range of the requested size instead of the given address
        const SEARCH_ADDR = 0x1;
    }
}

bitflags! {
    pub struct AttachFlags: u32 {
        const SEARCH_ADDR    = 0x01;
        // the region must lie inside a reserved area
        const IN_AREA        = 0x02;
        const READ_ONLY      = 0x04;
        // drop the dataspace's backing of the region when it is detached
        const FREE_ON_DETACH = 0x08;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetachKind {
    // the region was removed entirely; the caller owns the reference it held
    Removed,
    // the region was cut in two; both halves reference the dataspace
    Split,
    // the region was shortened and keeps its reference
    Trimmed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetachedRegion {
    pub kind: DetachKind,
    pub dataspace: DataspaceRef,
    // the part of the address space that was unmapped by this call
    pub range: AddrRange,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DetachResult {
    // the last region overlapping the range was handled
    Done(DetachedRegion),
    // one region was handled and more overlap the range; detach again
    PartialRetry(DetachedRegion),
    NothingMapped,
}

// Every call is a synchronous invocation of the owning service. The region manager never
// touches dataspace reference counts; the client settles them according to each
// DetachedRegion::kind.
pub trait RegionManager: Send + Sync {
    // reserve_area conflicts only with other areas. An area reserved at an exact address may
    // cover regions that are already attached; they stay attached and count as inside it.
    fn reserve_area(&self, addr: Addr, size: u64, flags: AreaFlags) -> SysResult<Addr>;
    // free_area drops the area starting at `addr`. Regions attached inside it stay attached.
    fn free_area(&self, addr: Addr) -> SysResult<()>;
    fn attach(
        &self,
        addr: Addr,
        size: u64,
        flags: AttachFlags,
        ds: &DataspaceRef,
        offset: u64,
    ) -> SysResult<Addr>;
    fn detach(&self, addr: Addr, size: u64) -> SysResult<DetachResult>;
}
