//! The per-registration region record and the user-facing handle.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::cache::RegCache;
use crate::kind::MemKind;

bitflags! {
    /// Access modes a registration supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        /// Read access.
        const READ = 1 << 0;
        /// Write access.
        const WRITE = 1 << 1;
        /// Execute access.
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// Region lifecycle state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        /// Visible to page-table lookups.
        const IN_PGTABLE = 1 << 0;
        /// Logically removed; awaiting deregistration.
        const INVALID = 1 << 1;
        /// Register callback in progress.
        const REGISTERING = 1 << 2;
    }
}

/// One cached registration.
///
/// The interval, protection and kind are fixed at construction. Lifecycle
/// state lives in an atomic flag byte because `put` inspects INVALID without
/// taking the page-table lock, and the refcount counts user references only:
/// a resident region with `refcount == 0` is owned by the cache alone and is
/// evictable by the next invalidation event.
pub struct Region {
    start: usize,
    end: usize,
    prot: Protection,
    kind: MemKind,
    flags: AtomicU8,
    refcount: AtomicU32,
    payload: UnsafeCell<Box<[u8]>>,
}

// The payload cell is written only by the register callback while the region
// is in REGISTERING state (single writer, published by the Release that
// clears the flag) and read-only afterwards.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub(crate) fn new(
        start: usize,
        end: usize,
        prot: Protection,
        kind: MemKind,
        payload_size: usize,
    ) -> Self {
        debug_assert!(start < end);
        Self {
            start,
            end,
            prot,
            kind,
            flags: AtomicU8::new(0),
            refcount: AtomicU32::new(0),
            payload: UnsafeCell::new(vec![0u8; payload_size].into_boxed_slice()),
        }
    }

    /// First address covered, aligned to the cache alignment.
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last address covered.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Covered length in bytes; never zero.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Access modes this registration supports.
    pub fn prot(&self) -> Protection {
        self.prot
    }

    /// Memory-kind descriptor the region was classified with.
    pub fn kind(&self) -> MemKind {
        self.kind
    }

    /// User payload, populated by the register callback.
    pub fn payload(&self) -> &[u8] {
        unsafe { &*self.payload.get() }
    }

    /// Raw payload pointer for callers that coordinate their own writes.
    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { (*self.payload.get()).as_mut_ptr() }
    }

    /// Exclusive payload access.
    ///
    /// # Safety
    /// The caller must be the sole accessor: either the register callback
    /// while REGISTERING is set, or the deregistration path after the region
    /// left the page table with `refcount == 0`.
    pub(crate) unsafe fn payload_mut_unchecked(&self) -> &mut [u8] {
        &mut *self.payload.get()
    }

    pub(crate) fn flags(&self) -> RegionFlags {
        RegionFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: RegionFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Release);
    }

    pub(crate) fn clear_flags(&self, flags: RegionFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::Release);
    }

    /// Number of outstanding user references.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn ref_inc(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the previous count.
    pub(crate) fn ref_dec(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("prot", &self.prot)
            .field("kind", &self.kind)
            .field("flags", &self.flags())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Counted reference to a cached region.
///
/// Returned by [`RegCache::get`]; dropping it releases the reference
/// (`put`). The handle keeps the cache alive, so a region can always be
/// released back to the cache that produced it.
pub struct CachedRegion {
    cache: Arc<RegCache>,
    region: Arc<Region>,
}

impl CachedRegion {
    pub(crate) fn new(cache: Arc<RegCache>, region: Arc<Region>) -> Self {
        Self { cache, region }
    }

    pub fn start(&self) -> usize {
        self.region.start()
    }

    pub fn end(&self) -> usize {
        self.region.end()
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    pub fn prot(&self) -> Protection {
        self.region.prot()
    }

    pub fn kind(&self) -> MemKind {
        self.region.kind()
    }

    /// User payload written by the register callback.
    pub fn payload(&self) -> &[u8] {
        self.region.payload()
    }

    /// Raw payload pointer; concurrent writes are the caller's contract.
    pub fn payload_ptr(&self) -> *mut u8 {
        self.region.payload_ptr()
    }

    /// True when both handles refer to the same registration.
    pub fn same_region(&self, other: &CachedRegion) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn put(self) {}
}

impl fmt::Debug for CachedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.region, f)
    }
}

impl Drop for CachedRegion {
    fn drop(&mut self) {
        self.cache.release(&self.region);
    }
}
