//! Memory-kind classification.
//!
//! The cache does not discover memory kinds itself; it consumes a
//! [`Classifier`] supplied at creation. Host memory is a single shared
//! descriptor, while every device allocation gets a descriptor of its own,
//! so a new device allocation never compares equal to a cached region even
//! at the same virtual address.

use crate::error::Result;

/// Memory-kind descriptor of an address range.
///
/// Comparable for equality. `Host` is a singleton: all host ranges carry the
/// same descriptor. `Device` descriptors are distinct per live allocation
/// (`alloc_id`), which is what forces a cache miss when a device buffer is
/// freed and a new one appears at the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    /// Ordinary host memory.
    Host,
    /// Device memory owned by an accelerator family.
    Device {
        /// Which device family (driver) owns the allocation.
        family: u8,
        /// Identifier unique to this live allocation.
        alloc_id: u64,
    },
}

impl MemKind {
    /// Returns true for the host descriptor.
    pub fn is_host(&self) -> bool {
        matches!(self, MemKind::Host)
    }
}

/// Address-range classification interface.
///
/// Invoked by the cache with the page-table write lock held: implementations
/// must not block unboundedly and must not reenter the cache.
pub trait Classifier: Send + Sync {
    /// Classify `[addr, addr + len)`.
    ///
    /// Addresses not recognized by any device driver are host memory; that
    /// case is not an error. An error return means the classification
    /// machinery itself failed and is propagated to the `get` caller.
    fn classify(&self, addr: usize, len: usize) -> Result<MemKind>;
}

/// Classifier for processes without device memory: everything is host.
#[derive(Debug, Default)]
pub struct HostClassifier;

impl Classifier for HostClassifier {
    fn classify(&self, _addr: usize, _len: usize) -> Result<MemKind> {
        Ok(MemKind::Host)
    }
}
