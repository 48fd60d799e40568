//! The registration cache core: lookup, merge, invalidation, lifecycle.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::config::{CacheConfig, CacheFlags};
use crate::error::{Error, Result};
use crate::events::{EventHandler, EventSource, SubscriptionToken, VmEvent};
use crate::kind::{Classifier, MemKind};
use crate::memprot::{self, align_down};
use crate::ops::{RegisterFlags, RegistrationOps};
use crate::pagetable::PageTable;
use crate::region::{CachedRegion, Protection, Region, RegionFlags};
use crate::stats::{CacheStats, StatsSnapshot};

#[derive(Default)]
struct Inner {
    pgtable: PageTable,
    inval_queue: VecDeque<Arc<Region>>,
}

/// Registration cache.
///
/// Memoizes registration of virtual-address ranges with an external resource
/// behind a [`RegistrationOps`] pair. Lookups for a covered range reuse the
/// existing registration; overlapping requests merge into a single wider
/// one; VM events invalidate affected regions, which are deregistered once
/// the last user reference is gone.
///
/// Create with [`RegCache::create`]; the handle is an `Arc` because regions
/// returned by [`RegCache::get`] keep their cache alive. Teardown happens
/// when the last handle (cache or region) drops: every remaining region is
/// deregistered, and the event subscription is released.
pub struct RegCache {
    name: String,
    config: CacheConfig,
    classifier: Arc<dyn Classifier>,
    ops: Arc<dyn RegistrationOps>,
    inner: RwLock<Inner>,
    /// Events that arrived while the page table was contended; applied at
    /// the head of every slow-path `get`.
    pending: Mutex<Vec<VmEvent>>,
    pending_count: AtomicUsize,
    cap_warned: AtomicBool,
    stats: CacheStats,
    event_source: Arc<dyn EventSource>,
    token: Mutex<Option<SubscriptionToken>>,
}

impl RegCache {
    /// Create a cache and subscribe it to `event_source`.
    ///
    /// Fails with [`Error::InvalidArgument`] on a malformed configuration
    /// and with [`Error::NoResource`] when the subscription is refused.
    pub fn create(
        config: CacheConfig,
        name: &str,
        classifier: Arc<dyn Classifier>,
        ops: Arc<dyn RegistrationOps>,
        event_source: Arc<dyn EventSource>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let cache = Arc::new(Self {
            name: name.to_owned(),
            config,
            classifier,
            ops,
            inner: RwLock::new(Inner::default()),
            pending: Mutex::new(Vec::new()),
            pending_count: AtomicUsize::new(0),
            cap_warned: AtomicBool::new(false),
            stats: CacheStats::default(),
            event_source,
            token: Mutex::new(None),
        });
        let handler: Weak<dyn EventHandler> = Arc::downgrade(&(Arc::clone(&cache) as Arc<dyn EventHandler>));
        let token = cache
            .event_source
            .subscribe(cache.config.event_mask, handler)?;
        *cache.token.lock() = Some(token);
        Ok(cache)
    }

    /// Cache name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation parameters.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current counter values.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of resident regions.
    pub fn region_count(&self) -> usize {
        self.inner.read().pgtable.len()
    }

    /// Look up or create a region covering `[addr, addr + length)` with at
    /// least `prot` access.
    ///
    /// The interval is aligned outward to the cache alignment. `arg` is
    /// passed through to the register callback when a new region is created.
    pub fn get(
        self: &Arc<Self>,
        addr: usize,
        length: usize,
        prot: Protection,
        arg: Option<&dyn Any>,
    ) -> Result<CachedRegion> {
        self.stats.inc_gets();
        if length == 0 {
            return Err(Error::InvalidArgument("zero-length request".into()));
        }
        let align = self.config.alignment;
        let start = align_down(addr, align);
        let Some(end) = addr
            .checked_add(length)
            .and_then(|e| e.checked_add(align - 1))
            .map(|e| align_down(e, align))
        else {
            return Err(Error::InvalidArgument(format!(
                "request {:#x}+{:#x} overflows the address space",
                addr, length
            )));
        };

        // Fast path: a resident region already covers the request. Runs only
        // while no invalidation is pending, so a stale region can never be
        // acknowledged. Device-kind regions always go slow: their descriptor
        // must be re-compared against a fresh classification, and the
        // classifier may only run under the write lock.
        if self.pending_count.load(Ordering::Acquire) == 0 {
            let inner = self.inner.read();
            if let Some(region) = inner.pgtable.lookup_containing(start) {
                if region.end() >= end
                    && region.kind().is_host()
                    && region.prot().contains(prot)
                    && !region.flags().contains(RegionFlags::REGISTERING)
                {
                    region.ref_inc();
                    self.stats.inc_hits_fast();
                    let region = Arc::clone(region);
                    drop(inner);
                    return Ok(CachedRegion::new(Arc::clone(self), region));
                }
            }
        }

        self.get_slow(start, end, prot, arg)
    }

    fn get_slow(
        self: &Arc<Self>,
        start: usize,
        end: usize,
        prot: Protection,
        arg: Option<&dyn Any>,
    ) -> Result<CachedRegion> {
        loop {
            let mut inner = self.inner.write();
            self.apply_pending_locked(&mut inner);

            let kind = self.classifier.classify(start, end - start)?;

            let overlaps = inner.pgtable.overlapping(start, end);

            if overlaps
                .iter()
                .any(|r| r.flags().contains(RegionFlags::REGISTERING))
            {
                // Another thread is registering an overlapping region; let
                // it settle, then re-run the lookup against the result.
                drop(inner);
                std::thread::yield_now();
                continue;
            }

            if let [existing] = overlaps.as_slice() {
                if existing.start() <= start
                    && existing.end() >= end
                    && existing.prot().contains(prot)
                    && existing.kind() == kind
                {
                    existing.ref_inc();
                    self.stats.inc_hits_slow();
                    let region = Arc::clone(existing);
                    drop(inner);
                    self.drain_inval_queue();
                    return Ok(CachedRegion::new(Arc::clone(self), region));
                }
            }

            let resolved = self.resolve_merge(start, end, prot, kind, &overlaps);

            // Every overlapping region leaves the table now: each is either
            // absorbed, of a stale kind, or incompatible with the current
            // page protections.
            for region in &overlaps {
                self.invalidate_region_locked(&mut inner, region);
            }

            let (new_start, new_end, new_prot, merged) = match resolved {
                Ok(resolved) => resolved,
                Err(err) => {
                    drop(inner);
                    self.drain_inval_queue();
                    return Err(err);
                }
            };

            let region = Arc::new(Region::new(
                new_start,
                new_end,
                new_prot,
                kind,
                self.config.payload_size,
            ));
            region.set_flags(RegionFlags::IN_PGTABLE | RegionFlags::REGISTERING);
            inner.pgtable.insert(Arc::clone(&region));
            self.stats.inc_misses();
            if merged {
                self.stats.inc_merges();
            }
            let over_cap = self
                .config
                .max_regions
                .is_some_and(|cap| inner.pgtable.len() > cap);
            drop(inner);

            if over_cap && !self.cap_warned.swap(true, Ordering::Relaxed) {
                eprintln!(
                    "rcache {}: resident region count exceeds the soft cap of {}",
                    self.name,
                    self.config.max_regions.unwrap_or(0)
                );
            }

            // The callback owns the payload exclusively while REGISTERING is
            // set.
            let payload = unsafe { region.payload_mut_unchecked() };
            match self
                .ops
                .register(self, arg, &region, payload, RegisterFlags::empty())
            {
                Ok(()) => {
                    self.stats.inc_regs();
                    let invalidated = {
                        let mut inner = self.inner.write();
                        if region.flags().contains(RegionFlags::INVALID) {
                            Self::claim_from_queue(&mut inner, &region);
                            true
                        } else {
                            region.ref_inc();
                            region.clear_flags(RegionFlags::REGISTERING);
                            false
                        }
                    };
                    if invalidated {
                        // The range was unmapped while the callback ran.
                        // Release the fresh registration and start over.
                        region.clear_flags(RegionFlags::REGISTERING);
                        self.deregister_region(&region);
                        continue;
                    }
                    self.drain_inval_queue();
                    return Ok(CachedRegion::new(Arc::clone(self), region));
                }
                Err(err) => {
                    {
                        let mut inner = self.inner.write();
                        if region.flags().contains(RegionFlags::INVALID) {
                            Self::claim_from_queue(&mut inner, &region);
                        } else {
                            inner.pgtable.remove(region.start());
                        }
                        region
                            .clear_flags(RegionFlags::IN_PGTABLE | RegionFlags::REGISTERING);
                    }
                    self.drain_inval_queue();
                    return Err(err);
                }
            }
        }
    }

    /// Compute the merged interval and protection for a miss overlapping
    /// `overlaps`. Returns `(start, end, prot, merged)`.
    ///
    /// Strict policy: an overlapping region is absorbed only when the OS
    /// protection of its pages supports the request and the OS protection of
    /// the request's pages supports the region, and the final union must
    /// support the union of protections; otherwise fall back to the request
    /// alone. The OS check applies to host memory only — device ranges have
    /// no mapping entry to consult.
    fn resolve_merge(
        &self,
        start: usize,
        end: usize,
        prot: Protection,
        kind: MemKind,
        overlaps: &[Arc<Region>],
    ) -> Result<(usize, usize, Protection, bool)> {
        if overlaps.is_empty() {
            return Ok((start, end, prot, false));
        }

        let widen = self.config.flags.contains(CacheFlags::PROT_WIDENING);
        let request_os = if kind.is_host() && !widen {
            Some(memprot::mem_prot(start, end)?)
        } else {
            None
        };

        let mut new_start = start;
        let mut new_end = end;
        let mut new_prot = prot;
        let mut merged = false;

        for region in overlaps {
            if region.kind() != kind {
                // A different kind is never absorbed; the stale region is
                // invalidated by the caller.
                continue;
            }
            let absorb = match request_os {
                None => true,
                Some(request_os) => {
                    let region_os = memprot::mem_prot(region.start(), region.end())?;
                    region_os.contains(prot) && request_os.contains(region.prot())
                }
            };
            if absorb {
                new_start = new_start.min(region.start());
                new_end = new_end.max(region.end());
                new_prot |= region.prot();
                merged = true;
            }
        }

        if let Some(request_os) = request_os {
            if merged {
                // The union can span pages none of the parts covered (gaps
                // between absorbed regions); the whole of it must support
                // the widened protection.
                let union_os = memprot::mem_prot(new_start, new_end)?;
                if !union_os.contains(new_prot) {
                    new_start = start;
                    new_end = end;
                    new_prot = prot;
                    merged = false;
                }
            }
            if !merged && !request_os.contains(prot) {
                return Err(Error::PermissionDenied {
                    wanted: prot,
                    got: request_os,
                });
            }
        }

        Ok((new_start, new_end, new_prot, merged))
    }

    /// Release one user reference. Called from [`CachedRegion::drop`].
    pub(crate) fn release(&self, region: &Arc<Region>) {
        self.stats.inc_puts();
        let prev = region.ref_dec();
        debug_assert!(prev >= 1, "put on a region with no outstanding references");
        if prev != 1 || !region.flags().contains(RegionFlags::INVALID) {
            return;
        }
        if self.config.flags.contains(CacheFlags::DEFER_DEREG) {
            return;
        }
        let claimed = {
            let mut inner = self.inner.write();
            Self::claim_from_queue(&mut inner, region)
        };
        if claimed {
            self.deregister_region(region);
        }
    }

    /// Invalidate every region overlapping `[addr, addr + length)`, exactly
    /// as an unmap event would, then drain the invalidation queue.
    pub fn invalidate_range(&self, addr: usize, length: usize) {
        let end = addr.saturating_add(length);
        {
            let mut inner = self.inner.write();
            self.apply_pending_locked(&mut inner);
            self.invalidate_interval_locked(&mut inner, addr, end);
        }
        self.drain_inval_queue();
    }

    /// Apply deferred events and deregister every unreferenced invalidated
    /// region.
    pub fn flush(&self) {
        {
            let mut inner = self.inner.write();
            self.apply_pending_locked(&mut inner);
        }
        self.drain_inval_queue();
    }

    /// Append a diagnostic listing of all resident regions to `out`, one
    /// line per region, through the optional `dump_region` op.
    pub fn dump(&self, out: &mut String) {
        let regions: Vec<Arc<Region>> =
            self.inner.read().pgtable.iter().map(Arc::clone).collect();
        for region in regions {
            let _ = write!(
                out,
                "{:#x}..{:#x} prot {:?} refcount {} ",
                region.start(),
                region.end(),
                region.prot(),
                region.refcount()
            );
            if !region.flags().contains(RegionFlags::REGISTERING) {
                self.ops.dump_region(self, &region, region.payload(), out);
            }
            out.push('\n');
        }
    }

    fn apply_pending_locked(&self, inner: &mut Inner) {
        if self.pending_count.load(Ordering::Acquire) == 0 {
            return;
        }
        let events: Vec<VmEvent> = {
            let mut pending = self.pending.lock();
            self.pending_count.store(0, Ordering::Release);
            std::mem::take(&mut *pending)
        };
        for event in &events {
            self.invalidate_interval_locked(
                inner,
                event.addr,
                event.addr.saturating_add(event.len),
            );
        }
    }

    fn invalidate_interval_locked(&self, inner: &mut Inner, start: usize, end: usize) {
        for region in inner.pgtable.overlapping(start, end) {
            self.invalidate_region_locked(inner, &region);
            self.stats.inc_unmap_invalidates();
        }
    }

    /// Move a resident region onto the invalidation queue.
    fn invalidate_region_locked(&self, inner: &mut Inner, region: &Arc<Region>) {
        if region.flags().contains(RegionFlags::INVALID) {
            return;
        }
        inner.pgtable.remove(region.start());
        region.clear_flags(RegionFlags::IN_PGTABLE);
        region.set_flags(RegionFlags::INVALID);
        inner.inval_queue.push_back(Arc::clone(region));
    }

    /// Remove `region` from the invalidation queue. Whoever removes it owns
    /// the deregistration; returns false when another thread already did.
    fn claim_from_queue(inner: &mut Inner, region: &Arc<Region>) -> bool {
        let pos = inner
            .inval_queue
            .iter()
            .position(|r| Arc::ptr_eq(r, region));
        match pos {
            Some(pos) => {
                inner.inval_queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Deregister every queued region with no outstanding references.
    /// Regions still referenced (or still registering) stay queued.
    fn drain_inval_queue(&self) {
        let ready: Vec<Arc<Region>> = {
            let mut inner = self.inner.write();
            let mut ready = Vec::new();
            inner.inval_queue.retain(|region| {
                if region.refcount() == 0
                    && !region.flags().contains(RegionFlags::REGISTERING)
                {
                    ready.push(Arc::clone(region));
                    false
                } else {
                    true
                }
            });
            ready
        };
        for region in ready {
            self.deregister_region(&region);
        }
    }

    fn deregister_region(&self, region: &Arc<Region>) {
        // Sole accessor: off the table, zero refcount, claimed from the
        // queue by this thread.
        let payload = unsafe { region.payload_mut_unchecked() };
        self.ops.deregister(self, region, payload);
        self.stats.inc_deregs();
    }
}

impl EventHandler for RegCache {
    fn on_vm_event(&self, event: &VmEvent) {
        self.stats.inc_unmaps();
        let end = event.addr.saturating_add(event.len);
        match self.inner.try_write() {
            Some(mut inner) => self.invalidate_interval_locked(&mut inner, event.addr, end),
            None => {
                // Event delivery must not block on the page table; record
                // the event and let the next slow-path get apply it.
                let mut pending = self.pending.lock();
                pending.push(*event);
                self.pending_count.fetch_add(1, Ordering::Release);
            }
        }
    }
}

impl Drop for RegCache {
    fn drop(&mut self) {
        if let Some(token) = self.token.get_mut().take() {
            self.event_source.unsubscribe(token);
        }

        let inner = self.inner.get_mut();
        for region in inner.pgtable.drain() {
            region.clear_flags(RegionFlags::IN_PGTABLE);
            region.set_flags(RegionFlags::INVALID);
            inner.inval_queue.push_back(region);
        }
        let regions: Vec<Arc<Region>> = inner.inval_queue.drain(..).collect();

        for region in regions {
            assert_eq!(
                region.refcount(),
                0,
                "cache {:?} dropped with a referenced region {:?}",
                self.name,
                region
            );
            let payload = unsafe { region.payload_mut_unchecked() };
            self.ops.deregister(self, &region, payload);
            self.stats.inc_deregs();
        }
    }
}
