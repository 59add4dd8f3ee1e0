#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessType {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl std::fmt::Debug for AccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { "r" } else { "-" },
            if self.write { "w" } else { "-" },
            if self.execute { "x" } else { "-" }
        )
    }
}

impl AccessType {
    pub const fn no_access() -> Self {
        Self {
            read: false,
            write: false,
            execute: false,
        }
    }

    pub const fn read() -> Self {
        Self {
            read: true,
            write: false,
            execute: false,
        }
    }

    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
        }
    }

    pub fn from_prot(prot: i32) -> Self {
        Self {
            read: prot & libc::PROT_READ != 0,
            write: prot & libc::PROT_WRITE != 0,
            execute: prot & libc::PROT_EXEC != 0,
        }
    }
}
