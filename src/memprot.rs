//! OS page-protection queries and address alignment.
//!
//! The merge rule needs to know what access the kernel actually grants for a
//! range of pages; that is read from `/proc/self/maps`, taking the
//! intersection of the permission bits of every mapping covering the range.

use std::fs;
use std::io;
use std::sync::OnceLock;

use crate::region::Protection;

/// System page size in bytes.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Round `addr` down to a multiple of `align` (power of two).
#[inline]
pub fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Round `addr` up to a multiple of `align` (power of two).
#[inline]
pub fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Protection supported by every page of `[start, end)`.
///
/// Returns the intersection of the permission bits of the mappings covering
/// the range. Any unmapped gap makes the result empty: no access can be
/// assumed for a range the process does not fully own.
pub fn mem_prot(start: usize, end: usize) -> io::Result<Protection> {
    let maps = fs::read_to_string("/proc/self/maps")?;
    Ok(mem_prot_from_maps(&maps, start, end))
}

fn mem_prot_from_maps(maps: &str, start: usize, end: usize) -> Protection {
    let mut prot = Protection::all();
    let mut cursor = start;

    // Mappings are listed in ascending, non-overlapping address order.
    for line in maps.lines() {
        let Some((range, perms)) = parse_maps_line(line) else {
            continue;
        };
        let (map_start, map_end) = range;
        if map_end <= cursor {
            continue;
        }
        if map_start > cursor {
            // Hole at `cursor`.
            return Protection::empty();
        }
        prot &= perms;
        cursor = map_end;
        if cursor >= end {
            return prot;
        }
    }

    // Ran off the end of the table before covering the whole range.
    Protection::empty()
}

fn parse_maps_line(line: &str) -> Option<((usize, usize), Protection)> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;

    let (lo, hi) = range.split_once('-')?;
    let map_start = usize::from_str_radix(lo, 16).ok()?;
    let map_end = usize::from_str_radix(hi, 16).ok()?;

    let mut prot = Protection::empty();
    for (ch, bit) in perms.chars().zip([Protection::READ, Protection::WRITE, Protection::EXEC]) {
        if ch != '-' {
            prot |= bit;
        }
    }
    Some(((map_start, map_end), prot))
}
