use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dataspace::MemoryAllocator;
use mem::AddrRange;
use mm::MmapEngine;
use once_cell::sync::OnceCell;
use region::LocalRegionManager;
use utils::{SysError, SysResult};
use vfs::{DataspaceFile, FdTable, File};

use crate::config::DsmapConfig;

pub struct Context {
    // serializes all mapping operations of the address space
    engine: Mutex<MmapEngine>,
    files: Arc<RwLock<FdTable>>,
    rm: Arc<LocalRegionManager>,
    allocator: Arc<MemoryAllocator>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("engine", &self.engine)
            .field("files", &self.files)
            .field("rm", &self.rm)
            .field("allocator", &self.allocator)
            .finish()
    }
}

impl Context {
    pub fn new(config: &DsmapConfig) -> SysResult<Self> {
        let rm = Arc::new(LocalRegionManager::new(AddrRange {
            start: config.min_addr,
            end: config.max_addr,
        }));
        let allocator = Arc::new(match config.quota {
            Some(quota) => MemoryAllocator::with_quota(quota),
            None => MemoryAllocator::new(),
        });
        let files = Arc::new(RwLock::new(FdTable::with_limit(config.max_fds)));
        let engine = MmapEngine::new(
            rm.clone(),
            allocator.clone(),
            files.clone(),
            config.mmap.clone(),
        )?;
        logger::debug!("context created with {:?}", config);
        Ok(Self {
            engine: Mutex::new(engine),
            files,
            rm,
            allocator,
        })
    }

    pub fn engine(&self) -> MutexGuard<'_, MmapEngine> {
        self.engine.lock().expect("failed to acquire engine lock")
    }

    pub fn files(&self) -> RwLockReadGuard<'_, FdTable> {
        self.files.read().expect("failed to acquire read lock")
    }

    pub fn files_mut(&self) -> RwLockWriteGuard<'_, FdTable> {
        self.files.write().expect("failed to acquire write lock")
    }

    pub fn region_manager(&self) -> &LocalRegionManager {
        &self.rm
    }

    pub fn allocator(&self) -> &MemoryAllocator {
        &self.allocator
    }

    // open_bytes installs a read-only file holding `contents` at the lowest free descriptor.
    pub fn open_bytes(&self, name: &str, contents: &[u8]) -> SysResult<i32> {
        let file: Arc<dyn File> = Arc::new(DataspaceFile::from_bytes(
            name,
            contents,
            self.allocator.as_ref(),
        )?);
        let res = self.files_mut().alloc_fd(&file);
        if res.is_err() {
            if let Err(e) = file.data_space().release() {
                logger::warn!("failed to release backing of {}: {}", name, e);
            }
        }
        res
    }
}

static CONTEXT: OnceCell<Context> = OnceCell::new();

pub fn init_context(config: &DsmapConfig) -> SysResult<()> {
    let ctx = Context::new(config)?;
    CONTEXT
        .set(ctx)
        .map_err(|_| SysError::new_with_msg(libc::EBUSY, "Context is already set".to_string()))
}

pub fn context() -> &'static Context {
    CONTEXT.get().expect("Context is not set")
}

#[cfg(test)]
pub fn init_for_test() {
    CONTEXT
        .get_or_try_init(|| Context::new(&DsmapConfig::default()))
        .expect("failed to initialize the context");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_bytes_uses_lowest_descriptor() {
        let ctx = Context::new(&DsmapConfig {
            max_fds: 2,
            ..DsmapConfig::default()
        })
        .expect("failed to create context");
        assert_eq!(ctx.open_bytes("a", b"a"), Ok(0));
        assert_eq!(ctx.open_bytes("b", b"b"), Ok(1));
        assert_eq!(ctx.allocator().stats().live(), 2);

        assert_eq!(ctx.open_bytes("c", b"c"), Err(SysError::new(libc::EMFILE)));
        assert_eq!(ctx.allocator().stats().live(), 2);
        assert!(ctx.files().file(1).is_ok());
    }

    #[test]
    fn quota_reaches_the_allocator() {
        let ctx = Context::new(&DsmapConfig {
            quota: Some(0x1000),
            ..DsmapConfig::default()
        })
        .expect("failed to create context");
        assert!(ctx.open_bytes("a", b"a").is_ok());
        let err = ctx.open_bytes("b", b"b").expect_err("quota should be exhausted");
        assert_eq!(err.code(), libc::ENOMEM);
    }

    #[test]
    fn global_context_is_set_once() {
        init_for_test();
        init_for_test();
        assert!(init_context(&DsmapConfig::default()).is_err());
        assert_eq!(context().engine().config(), &mm::MmapConfig::default());
    }
}
