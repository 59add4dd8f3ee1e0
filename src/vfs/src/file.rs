use dataspace::{DataspaceAllocator, DataspaceRef};
use utils::SysResult;

use super::File;

// Read-only file whose contents live in a dataspace, like a boot module.
#[derive(Debug)]
pub struct DataspaceFile {
    name: String,
    ds: DataspaceRef,
}

impl DataspaceFile {
    pub fn new(name: &str, ds: DataspaceRef) -> Self {
        Self {
            name: name.to_string(),
            ds,
        }
    }

    // from_bytes allocates a dataspace large enough for `contents` and fills it.
    pub fn from_bytes(
        name: &str,
        contents: &[u8],
        allocator: &dyn DataspaceAllocator,
    ) -> SysResult<Self> {
        let ds = allocator.alloc(std::cmp::max(contents.len() as u64, 1))?;
        if let Err(e) = ds.write(0, contents) {
            if let Err(release_err) = ds.release() {
                logger::warn!("failed to release {:?}: {}", ds, release_err);
            }
            return Err(e);
        }
        logger::debug!("file {} backed by {:?} ({} bytes)", name, ds, contents.len());
        Ok(Self::new(name, ds))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl File for DataspaceFile {
    fn data_space(&self) -> DataspaceRef {
        self.ds.clone()
    }
}
