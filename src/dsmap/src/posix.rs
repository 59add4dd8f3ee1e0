// The mapping calls as a C library exposes them, run against the process-wide context.

use mem::{AccessType, Addr};
use mm::MmapOpts;
use utils::SysError;

use crate::context;

// Flag bit asking mmap to only reserve address space.
pub const MAP_RESERVE_AREA: i32 = 0x0100_0000;

pub type Result = std::result::Result<usize, SysError>;

// status converts a result into what a C caller sees: the value on success and a
// negative errno on failure.
pub fn status(res: &Result) -> i64 {
    match res {
        Ok(v) => *v as i64,
        Err(e) => e.as_status(),
    }
}

// mmap_opts translates raw mmap2 arguments.
pub fn mmap_opts(
    start: usize,
    length: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    page_offset: u64,
) -> MmapOpts {
    MmapOpts {
        addr: Addr(start as u64),
        length: length as u64,
        perms: AccessType::from_prot(prot),
        anonymous: flags & libc::MAP_ANONYMOUS != 0,
        private: flags & libc::MAP_PRIVATE != 0,
        fixed: flags & libc::MAP_FIXED != 0,
        reserve_only: flags & MAP_RESERVE_AREA != 0,
        fd,
        page_offset,
    }
}

// mmap2 is mmap with the file offset given in pages.
pub fn mmap2(start: usize, length: usize, prot: i32, flags: i32, fd: i32, page_offset: u64) -> Result {
    let opts = mmap_opts(start, length, prot, flags, fd, page_offset);
    let ctx = context::context();
    let mut engine = ctx.engine();
    engine.map(&opts).map(|addr| addr.0 as usize)
}

pub fn munmap(start: usize, length: usize) -> Result {
    let ctx = context::context();
    let mut engine = ctx.engine();
    engine.unmap(Addr(start as u64), length as u64).map(|()| 0)
}

pub fn mremap(old_addr: usize, old_size: usize, new_size: usize, flags: i32) -> Result {
    let ctx = context::context();
    let mut engine = ctx.engine();
    engine
        .remap(Addr(old_addr as u64), old_size as u64, new_size as u64, flags)
        .map(|addr| addr.0 as usize)
}

pub fn mprotect(addr: usize, size: usize, prot: i32) -> Result {
    let ctx = context::context();
    let mut engine = ctx.engine();
    engine
        .change_protection(Addr(addr as u64), size as u64, AccessType::from_prot(prot))
        .map(|()| 0)
}

pub fn msync(addr: usize, size: usize, _flags: i32) -> Result {
    let ctx = context::context();
    let mut engine = ctx.engine();
    engine.sync(Addr(addr as u64), size as u64).map(|()| 0)
}

pub fn madvise(addr: usize, size: usize, _advice: i32) -> Result {
    let ctx = context::context();
    let mut engine = ctx.engine();
    engine.advise(Addr(addr as u64), size as u64).map(|()| 0)
}
