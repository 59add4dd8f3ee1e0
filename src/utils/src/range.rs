#[derive(PartialEq, Eq, Copy, Clone, Default, Hash)]
pub struct Range<T> {
    pub start: T,
    pub end: T,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Range<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x?}, {:#x?})", self.start, self.end)
    }
}

impl<T: num::Integer + Copy> Range<T> {
    #[inline]
    pub fn len(&self) -> T {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn intersect(&self, r: &Self) -> Self {
        let start = std::cmp::max(r.start, self.start);
        let end = std::cmp::max(std::cmp::min(r.end, self.end), start);
        Self { start, end }
    }

    #[inline]
    pub fn overlaps(&self, r: &Self) -> bool {
        self.start < r.end && r.start < self.end
    }

    #[inline]
    pub fn contains(&self, k: T) -> bool {
        self.start <= k && k < self.end
    }

    #[inline]
    pub fn is_superset_of(&self, r: &Self) -> bool {
        self.start <= r.start && r.end <= self.end
    }

    // strictly_contains reports whether r lies inside self without touching either end, i.e.
    // removing r from self leaves two non-empty pieces.
    #[inline]
    pub fn strictly_contains(&self, r: &Self) -> bool {
        self.start < r.start && r.end < self.end
    }
}
