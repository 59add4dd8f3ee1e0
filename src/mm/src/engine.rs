use std::sync::{Arc, RwLock};

use dataspace::{DataspaceAllocator, DataspaceRef};
use mem::{page_range, page_round_up, AccessType, Addr, PAGE_SIZE};
use region::{AreaFlags, AttachFlags, DetachKind, DetachResult, DetachedRegion, RegionManager};
use utils::{bail_libc, SysError, SysResult};
use vfs::FdTable;

use super::{AnonArena, AnonStrategy, MmapConfig, MmapOpts};

// Backing resolved for one mapping request. `ds` carries a reference owned by the mapping.
#[derive(Debug)]
struct Backing {
    ds: DataspaceRef,
    offset: u64,
    flags: AttachFlags,
}

pub struct MmapEngine {
    rm: Arc<dyn RegionManager>,
    allocator: Arc<dyn DataspaceAllocator>,
    files: Arc<RwLock<FdTable>>,
    arena: AnonArena,
    config: MmapConfig,
}

impl std::fmt::Debug for MmapEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapEngine")
            .field("arena", &self.arena)
            .field("config", &self.config)
            .finish()
    }
}

impl MmapEngine {
    pub fn new(
        rm: Arc<dyn RegionManager>,
        allocator: Arc<dyn DataspaceAllocator>,
        files: Arc<RwLock<FdTable>>,
        config: MmapConfig,
    ) -> SysResult<Self> {
        config.validate()?;
        Ok(Self {
            rm,
            allocator,
            files,
            arena: AnonArena::new(config.arena_size),
            config,
        })
    }

    pub fn config(&self) -> &MmapConfig {
        &self.config
    }

    pub fn arena(&self) -> &AnonArena {
        &self.arena
    }

    pub fn map(&mut self, opts: &MmapOpts) -> SysResult<Addr> {
        if opts.length == 0 {
            bail_libc!(libc::EINVAL);
        }
        if opts.fixed && opts.addr.is_null() {
            bail_libc!(libc::EINVAL);
        }
        let start = opts.addr.round_down();
        let size = page_round_up(opts.length).ok_or_else(|| SysError::new(libc::ENOMEM))?;

        if opts.reserve_only {
            let area = self.rm.reserve_area(start, size, AreaFlags::SEARCH_ADDR)?;
            logger::debug!("reserved [{}, +{:#x})", area, size);
            return Ok(area);
        }

        let backing = self.resolve_backing(opts, size)?;
        match self.place(opts, start, size, &backing) {
            Ok(addr) => Ok(addr),
            Err(e) => {
                self.put_back(&backing.ds);
                Err(e)
            }
        }
    }

    pub fn unmap(&mut self, addr: Addr, length: u64) -> SysResult<()> {
        if length == 0 {
            bail_libc!(libc::EINVAL);
        }
        let ar = page_range(addr, length).ok_or_else(|| SysError::new(libc::EINVAL))?;
        self.detach_range(Addr(ar.start), ar.len())
    }

    // remap is not supported: regions cannot be resized in place.
    pub fn remap(
        &mut self,
        old_addr: Addr,
        old_size: u64,
        new_size: u64,
        _flags: i32,
    ) -> SysResult<Addr> {
        logger::debug!(
            "mremap of [{}, +{:#x}) to {:#x} bytes refused",
            old_addr,
            old_size,
            new_size
        );
        bail_libc!(libc::ENOMEM);
    }

    // change_protection only accepts protections without write access. Attached regions keep
    // the permissions they were mapped with.
    pub fn change_protection(&mut self, addr: Addr, size: u64, perms: AccessType) -> SysResult<()> {
        if perms.write {
            logger::debug!("mprotect [{}, +{:#x}) {:?} refused", addr, size, perms);
            bail_libc!(libc::EINVAL);
        }
        Ok(())
    }

    pub fn sync(&mut self, _addr: Addr, _size: u64) -> SysResult<()> {
        Ok(())
    }

    pub fn advise(&mut self, _addr: Addr, _size: u64) -> SysResult<()> {
        Ok(())
    }

    // shutdown drops the engine's own reference to the anonymous arena.
    pub fn shutdown(&mut self) -> SysResult<()> {
        self.arena.retire()
    }

    fn resolve_backing(&mut self, opts: &MmapOpts, size: u64) -> SysResult<Backing> {
        let file_ds = if opts.anonymous {
            None
        } else {
            let offset = opts
                .byte_offset()
                .ok_or_else(|| SysError::new(libc::EINVAL))?;
            Some((self.file_dataspace(opts.fd, offset, size)?, offset))
        };

        if !opts.needs_copy() {
            let (ds, offset) = file_ds.ok_or_else(|| SysError::new(libc::EBADF))?;
            ds.take()?;
            return Ok(Backing {
                ds,
                offset,
                flags: AttachFlags::empty(),
            });
        }

        let (ds, offset) = self.acquire_anon(size)?;
        let backing = Backing {
            ds,
            offset,
            flags: AttachFlags::FREE_ON_DETACH,
        };
        if let Err(e) = self.seed(&backing, file_ds.as_ref(), size) {
            self.put_back(&backing.ds);
            return Err(e);
        }
        Ok(backing)
    }

    // seed commits the anonymous backing if configured to and copies in the file contents
    // of a private file mapping.
    fn seed(
        &self,
        backing: &Backing,
        file_ds: Option<&(DataspaceRef, u64)>,
        size: u64,
    ) -> SysResult<()> {
        if self.config.early_commit {
            AnonArena::allocate_now(&backing.ds, backing.offset, size)?;
        }
        if let Some((src, src_offset)) = file_ds {
            logger::debug!(
                "copy-on-write {:?}+{:#x} into {:?}+{:#x}",
                src,
                src_offset,
                backing.ds,
                backing.offset
            );
            backing.ds.copy_in(backing.offset, src, *src_offset, size)?;
        }
        Ok(())
    }

    fn acquire_anon(&mut self, size: u64) -> SysResult<(DataspaceRef, u64)> {
        let (ds, offset) = match self.config.strategy {
            AnonStrategy::SharedArena => self.arena.acquire(size, &*self.allocator)?,
            // the allocation's own reference belongs to the mapping
            AnonStrategy::PerMapping => (self.allocator.alloc(size)?, 0),
        };
        logger::debug!("anonymous memory {:?}+{:#x} size={:#x}", ds, offset, size);
        Ok((ds, offset))
    }

    fn file_dataspace(&self, fd: i32, offset: u64, size: u64) -> SysResult<DataspaceRef> {
        let file = self
            .files
            .read()
            .expect("failed to acquire read lock")
            .file(fd)?;
        let ds = file.data_space();
        if !ds.is_valid() {
            bail_libc!(libc::EINVAL);
        }
        let file_size = page_round_up(ds.size()?).ok_or_else(|| SysError::new(libc::EINVAL))?;
        if offset.checked_add(size).map_or(true, |end| end > file_size) {
            bail_libc!(libc::EINVAL);
        }
        Ok(ds)
    }

    fn place(
        &mut self,
        opts: &MmapOpts,
        start: Addr,
        size: u64,
        backing: &Backing,
    ) -> SysResult<Addr> {
        let mut flags = backing.flags;
        let mut placeholder = None;
        let hint = if opts.fixed {
            // Keep concurrent searches out of the target range while it is cleared. The
            // range may already lie in an area reserved by the caller, in which case no
            // placeholder is needed.
            match self.rm.reserve_area(start, size, AreaFlags::empty()) {
                Ok(area) => placeholder = Some(area),
                Err(e) => logger::debug!("no placeholder for [{}, +{:#x}): {}", start, size, e),
            }
            flags |= AttachFlags::IN_AREA;
            if let Err(e) = self.detach_range(start, size) {
                self.free_placeholder(placeholder);
                return Err(e);
            }
            start
        } else {
            flags |= AttachFlags::SEARCH_ADDR;
            if start.is_null() {
                Addr(PAGE_SIZE as u64)
            } else {
                start
            }
        };
        if !opts.perms.write {
            flags |= AttachFlags::READ_ONLY;
        }

        let res = self.rm.attach(hint, size, flags, &backing.ds, backing.offset);
        logger::debug!(
            "attach {:?}+{:#x} size={:#x} flags={:?} at {}: {:?}",
            backing.ds,
            backing.offset,
            size,
            flags,
            hint,
            res
        );
        self.free_placeholder(placeholder);
        let addr = res?;
        if !start.is_null() && addr.is_null() {
            bail_libc!(libc::EINVAL);
        }
        Ok(addr)
    }

    fn free_placeholder(&self, placeholder: Option<Addr>) {
        if let Some(area) = placeholder {
            if let Err(e) = self.rm.free_area(area) {
                logger::warn!("failed to free placeholder area at {}: {}", area, e);
            }
        }
    }

    // detach_range detaches everything in [start, start + size). The region manager handles
    // one region per call, so the number of calls is bounded by the number of pages.
    fn detach_range(&mut self, start: Addr, size: u64) -> SysResult<()> {
        let max_calls = size / PAGE_SIZE as u64 + 1;
        for _ in 0..max_calls {
            let res = self.rm.detach(start, size)?;
            logger::debug!("detach [{}, +{:#x}): {:?}", start, size, res);
            match res {
                DetachResult::NothingMapped => return Ok(()),
                DetachResult::Done(region) => return self.settle(&region),
                DetachResult::PartialRetry(region) => self.settle(&region)?,
            }
        }
        logger::error!(
            "detach of [{}, +{:#x}) did not finish after {} calls",
            start,
            size,
            max_calls
        );
        bail_libc!(libc::EIO);
    }

    // settle fixes up reference counts after the region manager detached a region.
    fn settle(&self, region: &DetachedRegion) -> SysResult<()> {
        match region.kind {
            DetachKind::Removed => self.put_back(&region.dataspace),
            DetachKind::Split if region.dataspace.is_valid() => region.dataspace.take()?,
            DetachKind::Split | DetachKind::Trimmed => (),
        }
        Ok(())
    }

    fn put_back(&self, ds: &DataspaceRef) {
        if !ds.is_valid() {
            return;
        }
        match ds.release() {
            Ok(remaining) => logger::debug!("released {:?}, {} references left", ds, remaining),
            Err(e) => logger::warn!("failed to release {:?}: {}", ds, e),
        }
    }
}
