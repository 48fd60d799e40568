//! External registration interface.

use std::any::Any;

use bitflags::bitflags;

use crate::cache::RegCache;
use crate::error::Result;
use crate::region::Region;

bitflags! {
    /// Flags passed to [`RegistrationOps::register`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegisterFlags: u16 {
        /// The caller will retry on failure; the callback should not report
        /// the error loudly.
        const HIDE_ERRORS = 1 << 0;
    }
}

/// The external-resource side of the cache.
///
/// The cache does not interpret what a registration is; it only invokes this
/// pair of callbacks and stores whatever they put in the region payload.
/// Both may block arbitrarily — they are always invoked without the
/// page-table lock.
pub trait RegistrationOps: Send + Sync {
    /// Register `region` with the external resource.
    ///
    /// `payload` is the region's payload buffer (exclusively owned for the
    /// duration of the call); `arg` is the opaque value passed to the `get`
    /// that created the region. An error fails that `get` with no region
    /// left behind.
    fn register(
        &self,
        cache: &RegCache,
        arg: Option<&dyn Any>,
        region: &Region,
        payload: &mut [u8],
        flags: RegisterFlags,
    ) -> Result<()>;

    /// Release the external registration.
    ///
    /// Called exactly once per successful `register`, after the region left
    /// the page table and its last user reference was dropped.
    fn deregister(&self, cache: &RegCache, region: &Region, payload: &mut [u8]);

    /// Append a one-line diagnostic description of `region` to `out`.
    fn dump_region(&self, cache: &RegCache, region: &Region, payload: &[u8], out: &mut String) {
        let _ = (cache, region, payload, out);
    }
}
