use std::{collections::BTreeMap, sync::RwLock};

use dataspace::DataspaceRef;
use mem::{Addr, AddrRange, PAGE_SIZE};
use utils::{bail_libc, SysError, SysResult};

use super::{AreaFlags, AttachFlags, DetachKind, DetachResult, DetachedRegion, RegionManager};

// Lowest user address handed out by default; the first page stays unmapped.
const DEFAULT_MIN_ADDR: u64 = PAGE_SIZE as u64;
const DEFAULT_MAX_ADDR: u64 = 1 << 47;

#[derive(Clone, Debug)]
struct Region {
    end: u64,
    ds: DataspaceRef,
    offset: u64,
    flags: AttachFlags,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub range: AddrRange,
    pub dataspace: DataspaceRef,
    pub offset: u64,
    pub flags: AttachFlags,
}

fn remote_err(code: i32) -> SysError {
    SysError::remote(code)
}

fn is_aligned(v: u64) -> bool {
    Addr(v).is_page_aligned()
}

// first_overlap returns the lowest entry of `map` overlapping `ar` as (start, end).
fn first_overlap<V, F: Fn(&V) -> u64>(
    map: &BTreeMap<u64, V>,
    ar: AddrRange,
    end_of: F,
) -> Option<(u64, u64)> {
    if let Some((&start, v)) = map.range(..=ar.start).next_back() {
        if end_of(v) > ar.start {
            return Some((start, end_of(v)));
        }
    }
    map.range(ar.start..ar.end)
        .next()
        .map(|(&start, v)| (start, end_of(v)))
}

#[derive(Debug)]
struct RegionMap {
    bounds: AddrRange,
    regions: BTreeMap<u64, Region>,
    areas: BTreeMap<u64, u64>,
}

impl RegionMap {
    // conflict returns the end of the lowest object overlapping `ar`, if any.
    fn conflict(&self, ar: AddrRange, avoid_areas: bool) -> Option<u64> {
        let region = first_overlap(&self.regions, ar, |r| r.end).map(|(_, end)| end);
        let area = if avoid_areas {
            first_overlap(&self.areas, ar, |end| *end).map(|(_, end)| end)
        } else {
            None
        };
        match (region, area) {
            (Some(r), Some(a)) => Some(std::cmp::min(r, a)),
            (r, a) => r.or(a),
        }
    }

    fn find_free(&self, hint: Addr, size: u64, within: AddrRange, avoid_areas: bool) -> Option<u64> {
        let lo = std::cmp::max(hint.round_down().0, within.start);
        let mut starts = vec![lo];
        if lo > within.start {
            starts.push(within.start);
        }
        for start in starts {
            let mut candidate = start;
            loop {
                let end = match candidate.checked_add(size) {
                    Some(end) if end <= within.end => end,
                    _ => break,
                };
                match self.conflict(
                    AddrRange {
                        start: candidate,
                        end,
                    },
                    avoid_areas,
                ) {
                    None => return Some(candidate),
                    Some(next) => candidate = next,
                }
            }
        }
        None
    }

    fn area_containing(&self, addr: u64) -> Option<AddrRange> {
        self.areas
            .range(..=addr)
            .next_back()
            .filter(|(_, end)| **end > addr)
            .map(|(&start, &end)| AddrRange { start, end })
    }

    fn exact_range(&self, addr: Addr, size: u64) -> SysResult<AddrRange> {
        let ar = addr
            .to_range(size)
            .ok_or_else(|| remote_err(libc::EINVAL))?;
        if !addr.is_page_aligned() || !self.bounds.is_superset_of(&ar) {
            return Err(remote_err(libc::EINVAL));
        }
        Ok(ar)
    }
}

// In-process region manager for one address-space window.
#[derive(Debug)]
pub struct LocalRegionManager {
    map: RwLock<RegionMap>,
}

impl Default for LocalRegionManager {
    fn default() -> Self {
        Self::new(AddrRange {
            start: DEFAULT_MIN_ADDR,
            end: DEFAULT_MAX_ADDR,
        })
    }
}

impl LocalRegionManager {
    pub fn new(bounds: AddrRange) -> Self {
        Self {
            map: RwLock::new(RegionMap {
                bounds,
                regions: BTreeMap::new(),
                areas: BTreeMap::new(),
            }),
        }
    }

    pub fn lookup(&self, addr: Addr) -> Option<RegionInfo> {
        let map = self.map.read().expect("failed to acquire read lock");
        map.regions
            .range(..=addr.0)
            .next_back()
            .filter(|(_, r)| r.end > addr.0)
            .map(|(&start, r)| RegionInfo {
                range: AddrRange { start, end: r.end },
                dataspace: r.ds.clone(),
                offset: r.offset,
                flags: r.flags,
            })
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        let map = self.map.read().expect("failed to acquire read lock");
        map.regions
            .iter()
            .map(|(&start, r)| RegionInfo {
                range: AddrRange { start, end: r.end },
                dataspace: r.ds.clone(),
                offset: r.offset,
                flags: r.flags,
            })
            .collect()
    }

    pub fn areas(&self) -> Vec<AddrRange> {
        let map = self.map.read().expect("failed to acquire read lock");
        map.areas
            .iter()
            .map(|(&start, &end)| AddrRange { start, end })
            .collect()
    }

    // read loads bytes through the attached dataspaces the way a faulting access would.
    pub fn read(&self, addr: Addr, dst: &mut [u8]) -> SysResult<usize> {
        let mut done = 0;
        while done < dst.len() {
            let cur = addr.0 + done as u64;
            let region = self.lookup(Addr(cur)).ok_or_else(|| SysError::new(libc::EFAULT))?;
            let n = std::cmp::min((dst.len() - done) as u64, region.range.end - cur) as usize;
            region.dataspace.read(
                region.offset + (cur - region.range.start),
                &mut dst[done..done + n],
            )?;
            done += n;
        }
        Ok(done)
    }

    pub fn write(&self, addr: Addr, src: &[u8]) -> SysResult<usize> {
        let mut done = 0;
        while done < src.len() {
            let cur = addr.0 + done as u64;
            let region = self.lookup(Addr(cur)).ok_or_else(|| SysError::new(libc::EFAULT))?;
            if region.flags.contains(AttachFlags::READ_ONLY) {
                bail_libc!(libc::EFAULT);
            }
            let n = std::cmp::min((src.len() - done) as u64, region.range.end - cur) as usize;
            region
                .dataspace
                .write(region.offset + (cur - region.range.start), &src[done..done + n])?;
            done += n;
        }
        Ok(done)
    }
}

impl RegionManager for LocalRegionManager {
    fn reserve_area(&self, addr: Addr, size: u64, flags: AreaFlags) -> SysResult<Addr> {
        if size == 0 || !is_aligned(size) {
            return Err(remote_err(libc::EINVAL));
        }
        let mut map = self.map.write().expect("failed to acquire write lock");
        let ar = if flags.contains(AreaFlags::SEARCH_ADDR) {
            let start = map
                .find_free(addr, size, map.bounds, true)
                .ok_or_else(|| remote_err(libc::ENOMEM))?;
            AddrRange {
                start,
                end: start + size,
            }
        } else {
            let ar = map.exact_range(addr, size)?;
            if first_overlap(&map.areas, ar, |end| *end).is_some() {
                return Err(remote_err(libc::EADDRINUSE));
            }
            ar
        };
        map.areas.insert(ar.start, ar.end);
        logger::debug!("reserved area {:?}", ar);
        Ok(Addr(ar.start))
    }

    fn free_area(&self, addr: Addr) -> SysResult<()> {
        let mut map = self.map.write().expect("failed to acquire write lock");
        match map.areas.remove(&addr.0) {
            Some(end) => {
                logger::debug!(
                    "freed area {:?}",
                    AddrRange {
                        start: addr.0,
                        end
                    }
                );
                Ok(())
            }
            None => Err(remote_err(libc::ENOENT)),
        }
    }

    fn attach(
        &self,
        addr: Addr,
        size: u64,
        flags: AttachFlags,
        ds: &DataspaceRef,
        offset: u64,
    ) -> SysResult<Addr> {
        if !ds.is_valid() || size == 0 || !is_aligned(size) || !is_aligned(offset) {
            return Err(remote_err(libc::EINVAL));
        }
        let ds_size = ds.size()?;
        if offset.checked_add(size).map_or(true, |end| end > ds_size) {
            return Err(remote_err(libc::ERANGE));
        }

        let mut map = self.map.write().expect("failed to acquire write lock");
        let in_area = flags.contains(AttachFlags::IN_AREA);
        let start = if flags.contains(AttachFlags::SEARCH_ADDR) {
            let (within, avoid_areas) = if in_area {
                let area = map
                    .area_containing(addr.0)
                    .ok_or_else(|| remote_err(libc::ENOENT))?;
                (area, false)
            } else {
                (map.bounds, true)
            };
            map.find_free(addr, size, within, avoid_areas)
                .ok_or_else(|| remote_err(libc::ENOMEM))?
        } else {
            let ar = map.exact_range(addr, size)?;
            if map.conflict(ar, false).is_some() {
                return Err(remote_err(libc::EADDRINUSE));
            }
            if in_area {
                let area = map
                    .area_containing(ar.start)
                    .ok_or_else(|| remote_err(libc::ENOENT))?;
                if !area.is_superset_of(&ar) {
                    return Err(remote_err(libc::ENOENT));
                }
            } else if map.conflict(ar, true).is_some() {
                return Err(remote_err(libc::EADDRINUSE));
            }
            ar.start
        };

        map.regions.insert(
            start,
            Region {
                end: start + size,
                ds: ds.clone(),
                offset,
                flags,
            },
        );
        logger::debug!(
            "attached {:?} at [{:#x}, {:#x}) offset={:#x} flags={:?}",
            ds,
            start,
            start + size,
            offset,
            flags
        );
        Ok(Addr(start))
    }

    fn detach(&self, addr: Addr, size: u64) -> SysResult<DetachResult> {
        let ar = match addr.to_range(size) {
            Some(ar) if size != 0 => ar,
            _ => return Err(remote_err(libc::EINVAL)),
        };
        let mut map = self.map.write().expect("failed to acquire write lock");
        let start = match first_overlap(&map.regions, ar, |r| r.end) {
            Some((start, _)) => start,
            None => return Ok(DetachResult::NothingMapped),
        };
        let region = map
            .regions
            .remove(&start)
            .ok_or_else(|| remote_err(libc::EIO))?;
        let whole = AddrRange {
            start,
            end: region.end,
        };
        let cut = whole.intersect(&ar);

        if region.flags.contains(AttachFlags::FREE_ON_DETACH) {
            if let Err(e) = region
                .ds
                .clear(region.offset + (cut.start - start), cut.len())
            {
                logger::warn!("failed to free backing of {:?} {:?}: {}", region.ds, cut, e);
            }
        }

        let tail = |map: &mut RegionMap| {
            map.regions.insert(
                cut.end,
                Region {
                    end: whole.end,
                    offset: region.offset + (cut.end - start),
                    ..region.clone()
                },
            );
        };
        let head = |map: &mut RegionMap| {
            map.regions.insert(
                start,
                Region {
                    end: cut.start,
                    ..region.clone()
                },
            );
        };
        let kind = if cut == whole {
            DetachKind::Removed
        } else if whole.strictly_contains(&cut) {
            head(&mut *map);
            tail(&mut *map);
            DetachKind::Split
        } else {
            if cut.start == whole.start {
                tail(&mut *map);
            } else {
                head(&mut *map);
            }
            DetachKind::Trimmed
        };

        let detached = DetachedRegion {
            kind,
            dataspace: region.ds.clone(),
            range: cut,
        };
        logger::debug!("detached {:?} from {:?}: {:?}", cut, whole, kind);
        if first_overlap(&map.regions, ar, |r| r.end).is_some() {
            Ok(DetachResult::PartialRetry(detached))
        } else {
            Ok(DetachResult::Done(detached))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataspace::{DataspaceAllocator, MemoryAllocator};

    const PAGE: u64 = PAGE_SIZE as u64;

    fn rm() -> LocalRegionManager {
        LocalRegionManager::new(AddrRange {
            start: PAGE,
            end: 0x1000 * PAGE,
        })
    }

    fn ds(allocator: &MemoryAllocator, pages: u64) -> DataspaceRef {
        allocator.alloc(pages * PAGE).expect("alloc failed")
    }

    #[test]
    fn search_attach_skips_occupied_ranges() {
        let rm = rm();
        let allocator = MemoryAllocator::new();
        let d = ds(&allocator, 8);
        let a = rm
            .attach(Addr(PAGE), 2 * PAGE, AttachFlags::SEARCH_ADDR, &d, 0)
            .expect("attach failed");
        let b = rm
            .attach(Addr(PAGE), 2 * PAGE, AttachFlags::SEARCH_ADDR, &d, 2 * PAGE)
            .expect("attach failed");
        assert_eq!(a, Addr(PAGE));
        assert_eq!(b, Addr(3 * PAGE));
    }

    #[test]
    fn exact_attach_rejects_overlap() {
        let rm = rm();
        let allocator = MemoryAllocator::new();
        let d = ds(&allocator, 4);
        rm.attach(Addr(4 * PAGE), 2 * PAGE, AttachFlags::empty(), &d, 0)
            .expect("attach failed");
        let err = rm
            .attach(Addr(5 * PAGE), 2 * PAGE, AttachFlags::empty(), &d, 0)
            .expect_err("overlapping attach");
        assert_eq!(err.code(), libc::EADDRINUSE);
    }

    #[test]
    fn attach_beyond_dataspace_is_erange() {
        let rm = rm();
        let allocator = MemoryAllocator::new();
        let d = ds(&allocator, 2);
        let err = rm
            .attach(Addr(PAGE), 2 * PAGE, AttachFlags::SEARCH_ADDR, &d, PAGE)
            .expect_err("window beyond dataspace");
        assert_eq!(err.code(), libc::ERANGE);
        let err = rm
            .attach(
                Addr(PAGE),
                PAGE,
                AttachFlags::SEARCH_ADDR,
                &DataspaceRef::invalid(),
                0,
            )
            .expect_err("invalid dataspace");
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn in_area_attach_needs_enclosing_area() {
        let rm = rm();
        let allocator = MemoryAllocator::new();
        let d = ds(&allocator, 4);
        let err = rm
            .attach(Addr(8 * PAGE), PAGE, AttachFlags::IN_AREA, &d, 0)
            .expect_err("no area reserved");
        assert_eq!(err.code(), libc::ENOENT);

        let area = rm
            .reserve_area(Addr(8 * PAGE), 4 * PAGE, AreaFlags::empty())
            .expect("reserve failed");
        assert_eq!(area, Addr(8 * PAGE));
        let err = rm
            .attach(Addr(8 * PAGE), PAGE, AttachFlags::empty(), &d, 0)
            .expect_err("plain region inside an area");
        assert_eq!(err.code(), libc::EADDRINUSE);
        rm.attach(Addr(9 * PAGE), PAGE, AttachFlags::IN_AREA, &d, 0)
            .expect("attach in area failed");

        let found = rm
            .attach(
                Addr(8 * PAGE),
                2 * PAGE,
                AttachFlags::IN_AREA | AttachFlags::SEARCH_ADDR,
                &d,
                0,
            )
            .expect("search in area failed");
        assert_eq!(found, Addr(10 * PAGE));

        rm.free_area(area).expect("free_area failed");
        assert!(rm.areas().is_empty());
        assert!(rm.lookup(Addr(9 * PAGE)).is_some());
        assert_eq!(
            rm.free_area(area).expect_err("double free").code(),
            libc::ENOENT
        );
    }

    #[test]
    fn exact_area_may_cover_attached_regions() {
        let rm = rm();
        let allocator = MemoryAllocator::new();
        let d = ds(&allocator, 4);
        rm.attach(Addr(8 * PAGE), 2 * PAGE, AttachFlags::empty(), &d, 0)
            .expect("attach failed");

        let area = rm
            .reserve_area(Addr(7 * PAGE), 4 * PAGE, AreaFlags::empty())
            .expect("area over a region should be allowed");
        assert_eq!(area, Addr(7 * PAGE));
        assert!(rm.lookup(Addr(8 * PAGE)).is_some());

        let err = rm
            .reserve_area(Addr(10 * PAGE), 2 * PAGE, AreaFlags::empty())
            .expect_err("areas overlap");
        assert_eq!(err.code(), libc::EADDRINUSE);
        assert_eq!(rm.areas().len(), 1);
    }

    #[test]
    fn search_reservation_avoids_regions() {
        let rm = rm();
        let allocator = MemoryAllocator::new();
        let d = ds(&allocator, 2);
        rm.attach(Addr(PAGE), 2 * PAGE, AttachFlags::empty(), &d, 0)
            .expect("attach failed");
        let area = rm
            .reserve_area(Addr::NULL, 4 * PAGE, AreaFlags::SEARCH_ADDR)
            .expect("reserve failed");
        assert_eq!(area, Addr(3 * PAGE));
        let err = rm
            .reserve_area(Addr(4 * PAGE), PAGE, AreaFlags::empty())
            .expect_err("areas must not overlap");
        assert_eq!(err.code(), libc::EADDRINUSE);
    }

    #[test]
    fn detach_middle_splits_region() {
        let rm = rm();
        let allocator = MemoryAllocator::new();
        let d = ds(&allocator, 4);
        rm.attach(Addr(PAGE), 4 * PAGE, AttachFlags::empty(), &d, 0)
            .expect("attach failed");

        let res = rm.detach(Addr(2 * PAGE), PAGE).expect("detach failed");
        match res {
            DetachResult::Done(r) => {
                assert_eq!(r.kind, DetachKind::Split);
                assert_eq!(r.dataspace, d);
            }
            r => panic!("unexpected detach result {:?}", r),
        }
        let regions = rm.regions();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].range, AddrRange {
            start: PAGE,
            end: 2 * PAGE
        });
        assert_eq!(regions[1].range, AddrRange {
            start: 3 * PAGE,
            end: 5 * PAGE
        });
        assert_eq!(regions[1].offset, 2 * PAGE);
    }

    #[test]
    fn detach_across_regions_asks_for_retry() {
        let rm = rm();
        let allocator = MemoryAllocator::new();
        let a = ds(&allocator, 2);
        let b = ds(&allocator, 2);
        rm.attach(Addr(PAGE), 2 * PAGE, AttachFlags::empty(), &a, 0)
            .expect("attach failed");
        rm.attach(Addr(3 * PAGE), 2 * PAGE, AttachFlags::empty(), &b, 0)
            .expect("attach failed");

        let first = rm.detach(Addr(2 * PAGE), 2 * PAGE).expect("detach failed");
        match first {
            DetachResult::PartialRetry(r) => {
                assert_eq!(r.kind, DetachKind::Trimmed);
                assert_eq!(r.dataspace, a);
            }
            r => panic!("unexpected detach result {:?}", r),
        }
        let second = rm.detach(Addr(2 * PAGE), 2 * PAGE).expect("detach failed");
        match second {
            DetachResult::Done(r) => {
                assert_eq!(r.kind, DetachKind::Trimmed);
                assert_eq!(r.dataspace, b);
            }
            r => panic!("unexpected detach result {:?}", r),
        }
        assert_eq!(
            rm.detach(Addr(2 * PAGE), 2 * PAGE),
            Ok(DetachResult::NothingMapped)
        );
        assert_eq!(rm.lookup(Addr(4 * PAGE)).unwrap().offset, PAGE);
    }

    #[test]
    fn free_on_detach_clears_backing() {
        let rm = rm();
        let allocator = MemoryAllocator::new();
        let d = ds(&allocator, 2);
        let addr = rm
            .attach(
                Addr(PAGE),
                2 * PAGE,
                AttachFlags::SEARCH_ADDR | AttachFlags::FREE_ON_DETACH,
                &d,
                0,
            )
            .expect("attach failed");
        rm.write(addr, b"data").expect("write failed");
        rm.detach(addr, 2 * PAGE).expect("detach failed");

        let mut buf = [0xffu8; 4];
        d.read(0, &mut buf).expect("read failed");
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn stores_respect_read_only() {
        let rm = rm();
        let allocator = MemoryAllocator::new();
        let d = ds(&allocator, 1);
        let addr = rm
            .attach(
                Addr(PAGE),
                PAGE,
                AttachFlags::SEARCH_ADDR | AttachFlags::READ_ONLY,
                &d,
                0,
            )
            .expect("attach failed");
        assert_eq!(rm.write(addr, b"x"), Err(SysError::new(libc::EFAULT)));
        let mut buf = [0u8; 1];
        assert_eq!(rm.read(addr, &mut buf), Ok(1));
        assert_eq!(
            rm.read(Addr(addr.0 + PAGE), &mut buf),
            Err(SysError::new(libc::EFAULT))
        );
    }
}
