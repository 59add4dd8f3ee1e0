use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysErrorKind {
    Libc,
    Nix, // from nix crate
    StdIoError,
    // returned by an invocation of another service (region manager, dataspace, allocator) and
    // handed back to the caller unchanged
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysError {
    code: i32,
    desc: Option<String>,
    kind: SysErrorKind,
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SysError occured with code: {} {:?} {:?}",
            self.code, self.desc, self.kind
        )
    }
}

impl std::error::Error for SysError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl SysError {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            desc: None,
            kind: SysErrorKind::Libc,
        }
    }

    pub fn new_with_msg(code: i32, msg: String) -> Self {
        Self {
            code,
            desc: Some(msg),
            kind: SysErrorKind::Libc,
        }
    }

    pub fn remote(code: i32) -> Self {
        Self {
            code,
            desc: None,
            kind: SysErrorKind::Remote,
        }
    }

    pub fn remote_with_msg(code: i32, msg: String) -> Self {
        Self {
            code,
            desc: Some(msg),
            kind: SysErrorKind::Remote,
        }
    }

    pub fn kind(&self) -> SysErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn desc(&self) -> Option<&str> {
        self.desc.as_deref()
    }

    // as_status returns the negative integer a C caller sees for this error.
    pub fn as_status(&self) -> i64 {
        -(self.code.abs() as i64)
    }

    pub fn from_io_error(e: std::io::Error) -> Self {
        Self {
            code: e.raw_os_error().unwrap_or(libc::EIO),
            desc: Some(e.to_string()),
            kind: SysErrorKind::StdIoError,
        }
    }

    pub fn from_nix_errno(e: nix::errno::Errno) -> Self {
        Self {
            code: e as i32,
            desc: Some(e.desc().to_string()),
            kind: SysErrorKind::Nix,
        }
    }
}

#[macro_export]
macro_rules! err_libc {
    ($libc_code:expr) => {
        Err(SysError::new($libc_code))
    };
}

#[macro_export]
macro_rules! bail_libc {
    ($libc_code:expr) => {
        return Err(SysError::new($libc_code))
    };
}

pub type SysResult<T> = std::result::Result<T, SysError>;
