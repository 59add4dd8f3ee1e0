use mem::{pages_to_bytes, AccessType, Addr};

#[derive(Default, Debug, Clone)]
pub struct MmapOpts {
    pub addr: Addr,
    pub length: u64,
    pub perms: AccessType,
    pub anonymous: bool,
    pub private: bool,
    pub fixed: bool,
    // only reserve address space; nothing is attached
    pub reserve_only: bool,
    pub fd: i32,
    // offset into the file, in pages
    pub page_offset: u64,
}

impl MmapOpts {
    pub fn anon(length: u64, perms: AccessType) -> Self {
        Self {
            length,
            perms,
            anonymous: true,
            private: true,
            fd: -1,
            ..Self::default()
        }
    }

    pub fn byte_offset(&self) -> Option<u64> {
        pages_to_bytes(self.page_offset)
    }

    // needs_copy reports whether the mapping is backed by anonymous memory of its own,
    // either zero-filled or seeded from a file.
    pub fn needs_copy(&self) -> bool {
        self.anonymous || self.private
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_offset_is_scaled() {
        let opts = MmapOpts {
            page_offset: 3,
            ..MmapOpts::default()
        };
        assert_eq!(opts.byte_offset(), Some(3 * 4096));
        let opts = MmapOpts {
            page_offset: u64::MAX,
            ..MmapOpts::default()
        };
        assert_eq!(opts.byte_offset(), None);
    }

    #[test]
    fn shared_file_mapping_needs_no_copy() {
        let shared = MmapOpts {
            fd: 3,
            ..MmapOpts::default()
        };
        assert!(!shared.needs_copy());
        assert!(MmapOpts {
            private: true,
            ..shared.clone()
        }
        .needs_copy());
        assert!(MmapOpts::anon(1, AccessType::read()).needs_copy());
    }
}
