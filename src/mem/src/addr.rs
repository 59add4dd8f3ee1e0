use super::PAGE_SIZE;
use utils::Range;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub u64);

impl Addr {
    pub const NULL: Addr = Addr(0);

    #[inline]
    pub fn round_up(&self) -> Option<Self> {
        let addr = self.0.checked_add(PAGE_SIZE as u64 - 1)?;
        Some(Addr(addr).round_down())
    }

    pub const fn round_down(&self) -> Self {
        Addr(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    #[inline]
    pub fn is_page_aligned(&self) -> bool {
        self.page_offset() == 0
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn to_range(self, length: u64) -> Option<AddrRange> {
        self.add_length(length).map(|end| AddrRange {
            start: self.0,
            end: end.0,
        })
    }

    #[inline]
    pub fn add_length(&self, length: u64) -> Option<Self> {
        let end = self.0.checked_add(length)?;
        Some(Addr(end))
    }

    #[inline]
    pub fn page_offset(&self) -> u64 {
        self.0 & (PAGE_SIZE as u64 - 1)
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

pub type AddrRange = Range<u64>;

// page_range returns the smallest page-aligned range covering [addr, addr + length).
pub fn page_range(addr: Addr, length: u64) -> Option<AddrRange> {
    let end = addr.add_length(length)?.round_up()?;
    Some(AddrRange {
        start: addr.round_down().0,
        end: end.0,
    })
}
