mod fd_table;
mod file;

pub use fd_table::{FdTable, DEFAULT_MAX_FDS};
pub use file::DataspaceFile;

use dataspace::DataspaceRef;

/// A file-like object that can back a mapping.
pub trait File: Send + Sync + std::fmt::Debug {
    // data_space returns the dataspace holding the file's contents, or an invalid
    // reference if the file cannot be mapped.
    fn data_space(&self) -> DataspaceRef;
}
