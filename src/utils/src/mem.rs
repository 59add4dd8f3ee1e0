use std::{ffi::CString, fs::File as StdFile, os::unix::prelude::FromRawFd};

use nix::sys::memfd::{self, MemFdCreateFlag};

use crate::{SysError, SysResult};

pub fn create_mem_fd(name: &str, flags: MemFdCreateFlag) -> nix::Result<i32> {
    let name = CString::new(name).map_err(|_| nix::errno::Errno::EINVAL)?;
    memfd::memfd_create(&name, flags)
}

// create_mem_file returns an anonymous host file of `len` bytes. The file is sparse, so no
// host memory is consumed until its pages are written or allocated.
pub fn create_mem_file(name: &str, len: u64) -> SysResult<StdFile> {
    let fd = create_mem_fd(name, MemFdCreateFlag::MFD_CLOEXEC).map_err(SysError::from_nix_errno)?;
    let file = unsafe { StdFile::from_raw_fd(fd) };
    file.set_len(len).map_err(SysError::from_io_error)?;
    Ok(file)
}
