use std::{
    fs::File as StdFile,
    os::unix::{fs::FileExt, io::AsRawFd},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use mem::page_round_up;
use nix::fcntl::{fallocate, FallocateFlags};
use utils::{bail_libc, mem::create_mem_file, SysError, SysResult};

use super::{Cap, Dataspace, DataspaceAllocator, DataspaceRef};

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Default, Debug)]
pub struct AllocatorStats {
    allocations: AtomicU64,
    live: AtomicU64,
    bytes: AtomicU64,
}

impl AllocatorStats {
    // allocations counts every dataspace ever handed out.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::SeqCst)
    }

    // live counts dataspaces whose reference count has not yet dropped to zero.
    pub fn live(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }
}

// Dataspace backed by a sparse memfd of host memory.
#[derive(Debug)]
pub struct MemoryDataspace {
    cap: Cap,
    file: StdFile,
    size: u64,
    refs: AtomicU32,
    gone: AtomicBool,
    stats: Arc<AllocatorStats>,
}

impl MemoryDataspace {
    fn check_alive(&self) -> SysResult<()> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(SysError::remote_with_msg(
                libc::ENOENT,
                format!("{:?} has been torn down", self.cap),
            ));
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, size: u64) -> SysResult<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(SysError::remote_with_msg(
                libc::ERANGE,
                format!(
                    "{:?}: [{:#x}, +{:#x}) exceeds size {:#x}",
                    self.cap, offset, size, self.size
                ),
            )),
        }
    }

    // committed_bytes reports how much host memory currently backs this dataspace.
    pub fn committed_bytes(&self) -> SysResult<u64> {
        let stat = nix::sys::stat::fstat(self.file.as_raw_fd()).map_err(SysError::from_nix_errno)?;
        Ok(stat.st_blocks as u64 * 512)
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    fn tear_down(&self) {
        self.gone.store(true, Ordering::SeqCst);
        if let Err(e) = self.file.set_len(0) {
            logger::warn!("failed to drop backing of {:?}: {}", self.cap, e);
        }
        self.stats.live.fetch_sub(1, Ordering::SeqCst);
        self.stats.bytes.fetch_sub(self.size, Ordering::SeqCst);
        logger::debug!("dataspace {:?} torn down", self.cap);
    }
}

impl Dataspace for MemoryDataspace {
    fn cap(&self) -> Cap {
        self.cap
    }

    fn size(&self) -> SysResult<u64> {
        self.check_alive()?;
        Ok(self.size)
    }

    fn allocate(&self, offset: u64, size: u64) -> SysResult<()> {
        self.check_alive()?;
        self.check_range(offset, size)?;
        if size == 0 {
            return Ok(());
        }
        fallocate(
            self.file.as_raw_fd(),
            FallocateFlags::empty(),
            offset as libc::off_t,
            size as libc::off_t,
        )
        .map_err(|e| SysError::remote(e as i32))
    }

    fn clear(&self, offset: u64, size: u64) -> SysResult<()> {
        self.check_alive()?;
        self.check_range(offset, size)?;
        if size == 0 {
            return Ok(());
        }
        fallocate(
            self.file.as_raw_fd(),
            FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            size as libc::off_t,
        )
        .map_err(|e| SysError::remote(e as i32))
    }

    fn copy_in(
        &self,
        dst_offset: u64,
        src: &DataspaceRef,
        src_offset: u64,
        size: u64,
    ) -> SysResult<()> {
        self.check_alive()?;
        self.check_range(dst_offset, size)?;
        let mut buf = vec![0; std::cmp::min(size as usize, COPY_CHUNK)];
        let mut done = 0u64;
        while done < size {
            let n = std::cmp::min(size - done, buf.len() as u64) as usize;
            let read = src.read(src_offset + done, &mut buf[..n])?;
            if read != n {
                return Err(SysError::remote(libc::ERANGE));
            }
            self.write(dst_offset + done, &buf[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    fn read(&self, offset: u64, dst: &mut [u8]) -> SysResult<usize> {
        self.check_alive()?;
        self.check_range(offset, dst.len() as u64)?;
        self.file
            .read_exact_at(dst, offset)
            .map_err(SysError::from_io_error)?;
        Ok(dst.len())
    }

    fn write(&self, offset: u64, src: &[u8]) -> SysResult<usize> {
        self.check_alive()?;
        self.check_range(offset, src.len() as u64)?;
        self.file
            .write_all_at(src, offset)
            .map_err(SysError::from_io_error)?;
        Ok(src.len())
    }

    fn take(&self) -> SysResult<()> {
        self.check_alive()?;
        self.refs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> SysResult<u32> {
        self.check_alive()?;
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.tear_down();
        }
        Ok(prev - 1)
    }
}

#[derive(Debug)]
pub struct MemoryAllocator {
    next_cap: AtomicU64,
    quota: Option<u64>,
    stats: Arc<AllocatorStats>,
}

impl Default for MemoryAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAllocator {
    pub fn new() -> Self {
        Self {
            next_cap: AtomicU64::new(1),
            quota: None,
            stats: Arc::new(AllocatorStats::default()),
        }
    }

    // with_quota limits the total bytes of live dataspaces; allocations beyond it fail with
    // ENOMEM.
    pub fn with_quota(quota: u64) -> Self {
        Self {
            quota: Some(quota),
            ..Self::new()
        }
    }

    pub fn stats(&self) -> &AllocatorStats {
        &self.stats
    }

    pub fn alloc_memory(&self, size: u64) -> SysResult<Arc<MemoryDataspace>> {
        if size == 0 {
            bail_libc!(libc::EINVAL);
        }
        let size = page_round_up(size).ok_or_else(|| SysError::remote(libc::ENOMEM))?;
        let used = self.stats.bytes.fetch_add(size, Ordering::SeqCst);
        if self.quota.map_or(false, |q| used.saturating_add(size) > q) {
            self.stats.bytes.fetch_sub(size, Ordering::SeqCst);
            return Err(SysError::remote_with_msg(
                libc::ENOMEM,
                format!("quota exhausted allocating {:#x} bytes", size),
            ));
        }
        let cap = Cap(self.next_cap.fetch_add(1, Ordering::SeqCst));
        let file = match create_mem_file(&format!("dataspace-{:x}", cap.0), size) {
            Ok(f) => f,
            Err(e) => {
                self.stats.bytes.fetch_sub(size, Ordering::SeqCst);
                return Err(SysError::remote_with_msg(
                    libc::ENOMEM,
                    format!("failed to create backing for {:?}: {}", cap, e),
                ));
            }
        };
        self.stats.allocations.fetch_add(1, Ordering::SeqCst);
        self.stats.live.fetch_add(1, Ordering::SeqCst);
        logger::debug!("allocated dataspace {:?} size={:#x}", cap, size);
        Ok(Arc::new(MemoryDataspace {
            cap,
            file,
            size,
            refs: AtomicU32::new(1),
            gone: AtomicBool::new(false),
            stats: Arc::clone(&self.stats),
        }))
    }
}

impl DataspaceAllocator for MemoryAllocator {
    fn alloc(&self, size: u64) -> SysResult<DataspaceRef> {
        let ds = self.alloc_memory(size)?;
        Ok(DataspaceRef::new(ds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mem::PAGE_SIZE;

    const PAGE: u64 = PAGE_SIZE as u64;

    #[test]
    fn alloc_rounds_to_pages() {
        let allocator = MemoryAllocator::new();
        let ds = allocator.alloc(PAGE + 1).expect("alloc failed");
        assert_eq!(ds.size(), Ok(2 * PAGE));
        assert_eq!(allocator.stats().allocations(), 1);
        assert_eq!(allocator.stats().live(), 1);
        assert_eq!(allocator.alloc(0), Err(SysError::new(libc::EINVAL)));
    }

    #[test]
    fn last_release_tears_down() {
        let allocator = MemoryAllocator::new();
        let ds = allocator.alloc(PAGE).expect("alloc failed");
        ds.take().expect("take failed");
        assert_eq!(ds.release(), Ok(1));
        assert_eq!(allocator.stats().live(), 1);
        assert_eq!(ds.release(), Ok(0));
        assert_eq!(allocator.stats().live(), 0);
        assert_eq!(allocator.stats().bytes(), 0);
        let err = ds.size().expect_err("size on a dead dataspace");
        assert_eq!(err.kind(), utils::SysErrorKind::Remote);
        assert_eq!(err.code(), libc::ENOENT);
    }

    #[test]
    fn quota_exhaustion_is_enomem() {
        let allocator = MemoryAllocator::with_quota(4 * PAGE);
        let _a = allocator.alloc(3 * PAGE).expect("alloc failed");
        let err = allocator.alloc(2 * PAGE).expect_err("quota should be exhausted");
        assert_eq!(err.code(), libc::ENOMEM);
        let _b = allocator.alloc(PAGE).expect("alloc failed");
    }

    #[test]
    fn allocate_and_clear_commit() {
        let allocator = MemoryAllocator::new();
        let ds = allocator.alloc_memory(16 * PAGE).expect("alloc failed");
        assert_eq!(ds.committed_bytes(), Ok(0));
        ds.allocate(0, 4 * PAGE).expect("allocate failed");
        assert!(ds.committed_bytes().unwrap() >= 4 * PAGE);
        ds.clear(0, 4 * PAGE).expect("clear failed");
        assert_eq!(ds.committed_bytes(), Ok(0));
        assert!(ds.allocate(15 * PAGE, 2 * PAGE).is_err());
    }

    #[test]
    fn copy_in_duplicates_contents() {
        let allocator = MemoryAllocator::new();
        let src = allocator.alloc(2 * PAGE).expect("alloc failed");
        let dst = allocator.alloc(4 * PAGE).expect("alloc failed");
        src.write(PAGE, b"hello").expect("write failed");
        dst.copy_in(2 * PAGE, &src, PAGE, PAGE).expect("copy_in failed");

        let mut buf = [0u8; 5];
        dst.read(2 * PAGE, &mut buf).expect("read failed");
        assert_eq!(&buf, b"hello");

        src.write(PAGE, b"world").expect("write failed");
        dst.read(2 * PAGE, &mut buf).expect("read failed");
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn cleared_range_reads_zero() {
        let allocator = MemoryAllocator::new();
        let ds = allocator.alloc(2 * PAGE).expect("alloc failed");
        ds.write(0, &[0xaa; 16]).expect("write failed");
        ds.clear(0, PAGE).expect("clear failed");
        let mut buf = [0xffu8; 16];
        ds.read(0, &mut buf).expect("read failed");
        assert_eq!(buf, [0u8; 16]);
    }
}
