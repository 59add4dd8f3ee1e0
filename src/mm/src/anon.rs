use dataspace::{DataspaceAllocator, DataspaceRef};
use mem::page_round_up;
use utils::{bail_libc, SysError, SysResult};

// Bump allocator over one dataspace at a time. Space is never reused. On rollover the arena
// drops its own reference to the old dataspace; mappings into it keep their own.
#[derive(Debug)]
pub struct AnonArena {
    ds: DataspaceRef,
    size: u64,
    offset: u64,
    default_size: u64,
}

impl AnonArena {
    pub fn new(default_size: u64) -> Self {
        Self {
            ds: DataspaceRef::invalid(),
            size: 0,
            offset: 0,
            default_size,
        }
    }

    pub fn dataspace(&self) -> &DataspaceRef {
        &self.ds
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn remaining(&self) -> u64 {
        self.size - self.offset
    }

    // acquire carves `size` bytes out of the arena and returns the arena together with the
    // offset of the carved range. The returned reference has been taken on behalf of the
    // caller.
    pub fn acquire(
        &mut self,
        size: u64,
        allocator: &dyn DataspaceAllocator,
    ) -> SysResult<(DataspaceRef, u64)> {
        if size == 0 {
            bail_libc!(libc::EINVAL);
        }
        let size = page_round_up(size).ok_or_else(|| SysError::new(libc::ENOMEM))?;
        if !self.ds.is_valid() || self.remaining() < size {
            self.rollover(size, allocator)?;
        }
        self.ds.take()?;
        let offset = self.offset;
        self.offset += size;
        Ok((self.ds.clone(), offset))
    }

    fn rollover(&mut self, size: u64, allocator: &dyn DataspaceAllocator) -> SysResult<()> {
        let arena_size = std::cmp::max(self.default_size, size);
        let ds = allocator.alloc(arena_size)?;
        logger::debug!(
            "new anonymous arena {:?} size={:#x}, replacing {:?}",
            ds,
            arena_size,
            self.ds
        );
        let old = std::mem::replace(&mut self.ds, ds);
        self.size = arena_size;
        self.offset = 0;
        if old.is_valid() {
            if let Err(e) = old.release() {
                logger::warn!("failed to release old arena {:?}: {}", old, e);
            }
        }
        Ok(())
    }

    // allocate_now commits the backing of [offset, offset + size) right away.
    pub fn allocate_now(ds: &DataspaceRef, offset: u64, size: u64) -> SysResult<()> {
        ds.allocate(offset, size)
    }

    // retire drops the arena's own reference to the current arena.
    pub fn retire(&mut self) -> SysResult<()> {
        let old = std::mem::take(&mut self.ds);
        self.size = 0;
        self.offset = 0;
        if old.is_valid() {
            old.release()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataspace::MemoryAllocator;

    const PAGE: u64 = mem::PAGE_SIZE as u64;

    #[test]
    fn bump_allocates_within_one_arena() {
        let allocator = MemoryAllocator::new();
        let mut arena = AnonArena::new(8 * PAGE);
        let (a, off_a) = arena.acquire(1, &allocator).expect("acquire failed");
        let (b, off_b) = arena.acquire(2 * PAGE, &allocator).expect("acquire failed");
        assert_eq!(a, b);
        assert_eq!(off_a, 0);
        assert_eq!(off_b, PAGE);
        assert_eq!(arena.remaining(), 5 * PAGE);
        assert_eq!(allocator.stats().allocations(), 1);
    }

    #[test]
    fn rollover_keeps_old_arena_alive_for_its_users() {
        let allocator = MemoryAllocator::new();
        let mut arena = AnonArena::new(4 * PAGE);
        let (old, _) = arena.acquire(3 * PAGE, &allocator).expect("acquire failed");
        let (new, offset) = arena.acquire(2 * PAGE, &allocator).expect("acquire failed");
        assert_ne!(old, new);
        assert_eq!(offset, 0);
        assert_eq!(allocator.stats().allocations(), 2);
        assert_eq!(allocator.stats().live(), 2);

        // the mapping's reference is the last one on the old arena
        assert_eq!(old.release(), Ok(0));
        assert_eq!(allocator.stats().live(), 1);
    }

    #[test]
    fn oversized_request_gets_its_own_arena() {
        let allocator = MemoryAllocator::new();
        let mut arena = AnonArena::new(4 * PAGE);
        let (ds, offset) = arena.acquire(6 * PAGE, &allocator).expect("acquire failed");
        assert_eq!(offset, 0);
        assert_eq!(ds.size(), Ok(6 * PAGE));
        assert_eq!(arena.remaining(), 0);
    }

    #[test]
    fn exact_fit_does_not_roll_over() {
        let allocator = MemoryAllocator::new();
        let mut arena = AnonArena::new(4 * PAGE);
        arena.acquire(2 * PAGE, &allocator).expect("acquire failed");
        arena.acquire(2 * PAGE, &allocator).expect("acquire failed");
        assert_eq!(allocator.stats().allocations(), 1);
    }

    #[test]
    fn failed_rollover_keeps_current_arena() {
        let allocator = MemoryAllocator::with_quota(4 * PAGE);
        let mut arena = AnonArena::new(4 * PAGE);
        let (first, _) = arena.acquire(3 * PAGE, &allocator).expect("acquire failed");
        let err = arena
            .acquire(2 * PAGE, &allocator)
            .expect_err("quota should be exhausted");
        assert_eq!(err.code(), libc::ENOMEM);
        assert_eq!(arena.dataspace(), &first);
        assert_eq!(arena.remaining(), PAGE);
    }

    #[test]
    fn retire_releases_arena_reference() {
        let allocator = MemoryAllocator::new();
        let mut arena = AnonArena::new(4 * PAGE);
        let (ds, _) = arena.acquire(PAGE, &allocator).expect("acquire failed");
        arena.retire().expect("retire failed");
        assert!(!arena.dataspace().is_valid());
        assert_eq!(allocator.stats().live(), 1);
        assert_eq!(ds.release(), Ok(0));
        assert_eq!(allocator.stats().live(), 0);
    }
}
