mod access_type;
mod addr;

pub use access_type::AccessType;
pub use addr::*;

pub const PAGE_SHIFT: i32 = 12;
pub const PAGE_SIZE: i32 = 1 << PAGE_SHIFT;

// page_round_up rounds a byte length up to whole pages. None on overflow.
#[inline]
pub fn page_round_up(length: u64) -> Option<u64> {
    Addr(length).round_up().map(|a| a.0)
}

// pages_to_bytes scales a page count to a byte count. None on overflow.
#[inline]
pub fn pages_to_bytes(pages: u64) -> Option<u64> {
    pages.checked_mul(PAGE_SIZE as u64)
}
