// Capability handles for dataspaces, the remotely owned memory objects that back mappings.
// A dataspace's reference count lives with the service that owns it. Dropping a handle
// releases nothing; holders call take and release explicitly.

mod memory;

pub use memory::{AllocatorStats, MemoryAllocator, MemoryDataspace};

use std::sync::Arc;

use utils::{bail_libc, err_libc, SysError, SysResult};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cap(pub u64);

impl Cap {
    pub const INVALID: Cap = Cap(0);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Debug for Cap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "cap:{:#x}", self.0)
        } else {
            write!(f, "cap:invalid")
        }
    }
}

pub trait Dataspace: std::fmt::Debug + Send + Sync {
    fn cap(&self) -> Cap;
    fn size(&self) -> SysResult<u64>;
    // allocate commits physical backing for [offset, offset + size).
    fn allocate(&self, offset: u64, size: u64) -> SysResult<()>;
    // clear drops the physical backing of [offset, offset + size); the range reads as zeros
    // afterwards.
    fn clear(&self, offset: u64, size: u64) -> SysResult<()>;
    fn copy_in(&self, dst_offset: u64, src: &DataspaceRef, src_offset: u64, size: u64)
        -> SysResult<()>;
    fn read(&self, offset: u64, dst: &mut [u8]) -> SysResult<usize>;
    fn write(&self, offset: u64, src: &[u8]) -> SysResult<usize>;
    fn take(&self) -> SysResult<()>;
    // release drops one reference and returns how many remain.
    fn release(&self) -> SysResult<u32>;
}

// A possibly-invalid handle to a dataspace.
#[derive(Clone, Default)]
pub struct DataspaceRef(Option<Arc<dyn Dataspace>>);

impl DataspaceRef {
    pub fn new(ds: Arc<dyn Dataspace>) -> Self {
        Self(Some(ds))
    }

    pub fn invalid() -> Self {
        Self(None)
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_some()
    }

    pub fn cap(&self) -> Cap {
        self.0.as_ref().map_or(Cap::INVALID, |ds| ds.cap())
    }

    fn get(&self) -> SysResult<&Arc<dyn Dataspace>> {
        match self.0 {
            Some(ref ds) => Ok(ds),
            None => err_libc!(libc::EINVAL),
        }
    }

    pub fn size(&self) -> SysResult<u64> {
        self.get()?.size()
    }

    pub fn allocate(&self, offset: u64, size: u64) -> SysResult<()> {
        self.get()?.allocate(offset, size)
    }

    pub fn clear(&self, offset: u64, size: u64) -> SysResult<()> {
        self.get()?.clear(offset, size)
    }

    pub fn copy_in(
        &self,
        dst_offset: u64,
        src: &DataspaceRef,
        src_offset: u64,
        size: u64,
    ) -> SysResult<()> {
        if !src.is_valid() {
            bail_libc!(libc::EINVAL);
        }
        self.get()?.copy_in(dst_offset, src, src_offset, size)
    }

    pub fn read(&self, offset: u64, dst: &mut [u8]) -> SysResult<usize> {
        self.get()?.read(offset, dst)
    }

    pub fn write(&self, offset: u64, src: &[u8]) -> SysResult<usize> {
        self.get()?.write(offset, src)
    }

    pub fn take(&self) -> SysResult<()> {
        self.get()?.take()
    }

    pub fn release(&self) -> SysResult<u32> {
        self.get()?.release()
    }
}

impl PartialEq for DataspaceRef {
    fn eq(&self, other: &Self) -> bool {
        self.cap() == other.cap()
    }
}

impl Eq for DataspaceRef {}

impl std::fmt::Debug for DataspaceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DataspaceRef({:?})", self.cap())
    }
}

pub trait DataspaceAllocator: Send + Sync {
    // alloc creates a dataspace of at least `size` bytes holding one reference, owned by the
    // caller.
    fn alloc(&self, size: u64) -> SysResult<DataspaceRef>;
}
