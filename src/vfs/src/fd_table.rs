use std::{collections::HashMap, sync::Arc};

use utils::{bail_libc, SysError, SysResult};

use super::File;

pub const DEFAULT_MAX_FDS: i32 = 1024;

#[derive(Debug)]
pub struct FdTable {
    next: i32, // start position to find fd
    descriptor_table: HashMap<i32, Arc<dyn File>>,
    limit: i32,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::init()
    }
}

impl FdTable {
    pub fn init() -> Self {
        Self::with_limit(DEFAULT_MAX_FDS)
    }

    pub fn with_limit(limit: i32) -> Self {
        Self {
            next: 0,
            descriptor_table: HashMap::new(),
            limit,
        }
    }

    pub fn get(&self, fd: i32) -> Option<Arc<dyn File>> {
        self.descriptor_table.get(&fd).map(Arc::clone)
    }

    // file resolves a descriptor for a request that needs one.
    pub fn file(&self, fd: i32) -> SysResult<Arc<dyn File>> {
        self.get(fd).ok_or_else(|| SysError::new(libc::EBADF))
    }

    // set installs `file` at `fd`, or clears `fd` when `file` is None, and returns
    // whatever was installed there before.
    pub fn set(&mut self, fd: i32, file: Option<&Arc<dyn File>>) -> Option<Arc<dyn File>> {
        match file {
            Some(f) => self.descriptor_table.insert(fd, Arc::clone(f)),
            None => self.descriptor_table.remove(&fd),
        }
    }

    pub fn len(&self) -> usize {
        self.descriptor_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor_table.is_empty()
    }

    // alloc_fd installs `file` at the lowest free descriptor.
    pub fn alloc_fd(&mut self, file: &Arc<dyn File>) -> SysResult<i32> {
        let fd = (self.next..self.limit)
            .find(|fd| !self.descriptor_table.contains_key(fd))
            .ok_or_else(|| SysError::new(libc::EMFILE))?;
        self.set(fd, Some(file));
        self.next = fd + 1;
        logger::debug!("fd {} -> {:?}", fd, file);
        Ok(fd)
    }

    pub fn set_fd(&mut self, fd: i32, file: &Arc<dyn File>) -> SysResult<Option<Arc<dyn File>>> {
        if fd < 0 {
            bail_libc!(libc::EBADF);
        }
        if fd >= self.limit {
            bail_libc!(libc::EMFILE);
        }
        Ok(self.set(fd, Some(file)))
    }

    pub fn free_fd(&mut self, fd: i32) -> Option<Arc<dyn File>> {
        if fd < 0 {
            return None;
        }
        let orig = self.set(fd, None)?;
        if fd < self.next {
            self.next = fd;
        }
        Some(orig)
    }
}
