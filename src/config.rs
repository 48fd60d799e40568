//! Cache configuration.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::events::EventMask;
use crate::memprot::page_size;

bitflags! {
    /// Cache-wide policy bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// Permissive merge: widen a merged region's protection to the union
        /// of its parts without consulting the OS-reported page protection.
        /// Off by default; the strict path refuses to widen protection past
        /// what every page supports.
        const PROT_WIDENING = 1 << 0;
        /// Never deregister synchronously inside `put`; leave invalidated
        /// regions for the next queue drain.
        const DEFER_DEREG = 1 << 1;
    }
}

/// Cache creation parameters.
///
/// `alignment` is applied outward to every query interval (start rounded
/// down, end rounded up) and must be a power of two of at least one page.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Bytes of opaque user payload carried per region record, populated by
    /// the register callback.
    /// Default: 0
    pub payload_size: usize,
    /// Outward alignment applied to query intervals.
    /// Default: the system page size
    pub alignment: usize,
    /// Upper bound on `alignment`.
    /// Default: the system page size
    pub max_alignment: usize,
    /// VM events to subscribe to.
    /// Default: `VM_UNMAPPED`
    pub event_mask: EventMask,
    /// Soft cap on resident regions; crossing it warns, never evicts.
    /// Default: None
    pub max_regions: Option<usize>,
    /// Policy bits.
    /// Default: empty (strict protection, synchronous dereg in `put`)
    pub flags: CacheFlags,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            payload_size: 0,
            alignment: page_size(),
            max_alignment: page_size(),
            event_mask: EventMask::VM_UNMAPPED,
            max_regions: None,
            flags: CacheFlags::empty(),
        }
    }
}

impl CacheConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-region payload size.
    pub fn with_payload_size(mut self, payload_size: usize) -> Self {
        self.payload_size = payload_size;
        self
    }

    /// Set the query alignment.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the alignment upper bound.
    pub fn with_max_alignment(mut self, max_alignment: usize) -> Self {
        self.max_alignment = max_alignment;
        self
    }

    /// Set the subscribed event mask.
    pub fn with_event_mask(mut self, event_mask: EventMask) -> Self {
        self.event_mask = event_mask;
        self
    }

    /// Set the soft cap on resident regions.
    pub fn with_max_regions(mut self, max_regions: usize) -> Self {
        self.max_regions = Some(max_regions);
        self
    }

    /// Set policy bits.
    pub fn with_flags(mut self, flags: CacheFlags) -> Self {
        self.flags = flags;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.alignment < page_size() {
            return Err(Error::InvalidArgument(format!(
                "alignment {} is below the page size {}",
                self.alignment,
                page_size()
            )));
        }
        if self.alignment > self.max_alignment {
            return Err(Error::InvalidArgument(format!(
                "alignment {} exceeds max_alignment {}",
                self.alignment, self.max_alignment
            )));
        }
        if !EventMask::all().contains(self.event_mask) {
            return Err(Error::InvalidArgument(format!(
                "unknown event mask bits {:#x}",
                self.event_mask.bits()
            )));
        }
        if self.event_mask.is_empty() {
            return Err(Error::InvalidArgument("empty event mask".into()));
        }
        Ok(())
    }
}
