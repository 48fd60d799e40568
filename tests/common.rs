//! Common test utilities for rcache integration tests.

#![allow(dead_code)]

use std::any::Any;
use std::io;
use std::num::NonZeroUsize;
use std::os::raw::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use parking_lot::Mutex;

use rcache::cache::RegCache;
use rcache::config::CacheConfig;
use rcache::error::{Error, Result};
use rcache::events::{EventBus, EventMask, EventSource, VmEvent};
use rcache::kind::{Classifier, MemKind};
use rcache::memprot;
use rcache::ops::{RegisterFlags, RegistrationOps};
use rcache::region::{CachedRegion, Protection, Region};

/// Stamp written into every registered payload.
pub const MAGIC: u32 = 0x5ca1_ab1e;

/// Payload bytes the test registrar needs: magic + id.
pub const PAYLOAD_SIZE: usize = 8;

type Hook = Box<dyn FnOnce() + Send>;

/// Registration backend that stamps payloads and counts registrations,
/// with hooks for failure injection and event dispatch mid-callback.
pub struct TestRegistrar {
    next_id: AtomicU32,
    reg_count: AtomicU32,
    fail_reg: AtomicBool,
    on_register: Mutex<Option<Hook>>,
}

impl TestRegistrar {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            reg_count: AtomicU32::new(0),
            fail_reg: AtomicBool::new(false),
            on_register: Mutex::new(None),
        }
    }

    /// Number of currently live external registrations.
    pub fn reg_count(&self) -> u32 {
        self.reg_count.load(Ordering::Acquire)
    }

    /// Make subsequent register callbacks fail (or succeed again).
    pub fn set_fail(&self, fail: bool) {
        self.fail_reg.store(fail, Ordering::Release);
    }

    /// Run `hook` inside the next register callback, before it returns.
    pub fn arm_register_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_register.lock() = Some(Box::new(hook));
    }
}

impl RegistrationOps for TestRegistrar {
    fn register(
        &self,
        _cache: &RegCache,
        _arg: Option<&dyn Any>,
        region: &Region,
        payload: &mut [u8],
        _flags: RegisterFlags,
    ) -> Result<()> {
        if let Some(hook) = self.on_register.lock().take() {
            hook();
        }
        if self.fail_reg.load(Ordering::Acquire) {
            return Err(Error::Io(io::Error::other("injected register failure")));
        }
        if region.kind().is_host() {
            let os = memprot::mem_prot(region.start(), region.end())?;
            if !os.contains(region.prot()) {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "pages do not support the region protection",
                )));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        payload[0..4].copy_from_slice(&MAGIC.to_ne_bytes());
        payload[4..8].copy_from_slice(&id.to_ne_bytes());
        self.reg_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn deregister(&self, _cache: &RegCache, _region: &Region, payload: &mut [u8]) {
        let magic = u32::from_ne_bytes(payload[0..4].try_into().unwrap());
        assert_eq!(magic, MAGIC, "deregistering a region that was never registered");
        payload[0..4].fill(0);
        let prev = self.reg_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0);
    }

    fn dump_region(
        &self,
        _cache: &RegCache,
        _region: &Region,
        payload: &[u8],
        out: &mut String,
    ) {
        use std::fmt::Write;
        let magic = u32::from_ne_bytes(payload[0..4].try_into().unwrap());
        let id = u32::from_ne_bytes(payload[4..8].try_into().unwrap());
        let _ = write!(out, "magic {:#x} id {}", magic, id);
    }
}

struct DeviceAlloc {
    addr: usize,
    len: usize,
    alloc_id: u64,
}

/// Classifier with a registry of live device allocations; everything else
/// is host. A hook can run inside `classify`, which the cache invokes with
/// the page-table write lock held.
pub struct TestClassifier {
    devices: Mutex<Vec<DeviceAlloc>>,
    next_alloc: AtomicU64,
    on_classify: Mutex<Option<Hook>>,
}

impl TestClassifier {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            next_alloc: AtomicU64::new(1),
            on_classify: Mutex::new(None),
        }
    }

    /// Mark `[addr, addr + len)` as a live device allocation.
    pub fn add_device(&self, addr: usize, len: usize) -> u64 {
        let alloc_id = self.next_alloc.fetch_add(1, Ordering::AcqRel);
        self.devices.lock().push(DeviceAlloc { addr, len, alloc_id });
        alloc_id
    }

    /// Forget the device allocation starting at `addr`.
    pub fn remove_device(&self, addr: usize) {
        self.devices.lock().retain(|d| d.addr != addr);
    }

    /// Run `hook` inside the next classify call.
    pub fn arm_classify_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_classify.lock() = Some(Box::new(hook));
    }
}

impl Classifier for TestClassifier {
    fn classify(&self, addr: usize, len: usize) -> Result<MemKind> {
        if let Some(hook) = self.on_classify.lock().take() {
            hook();
        }
        let devices = self.devices.lock();
        for dev in devices.iter() {
            if addr < dev.addr + dev.len && dev.addr < addr + len {
                return Ok(MemKind::Device { family: 1, alloc_id: dev.alloc_id });
            }
        }
        Ok(MemKind::Host)
    }
}

/// Cache plus its collaborators, wired the way the scenarios need them.
pub struct TestHarness {
    pub bus: Arc<EventBus>,
    pub classifier: Arc<TestClassifier>,
    pub registrar: Arc<TestRegistrar>,
    pub cache: Arc<RegCache>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(
            CacheConfig::default()
                .with_payload_size(PAYLOAD_SIZE)
                .with_event_mask(EventMask::VM_UNMAPPED | EventMask::MEM_TYPE_FREE),
        )
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let classifier = Arc::new(TestClassifier::new());
        let registrar = Arc::new(TestRegistrar::new());
        let cache = RegCache::create(
            config,
            "test",
            Arc::clone(&classifier) as Arc<dyn Classifier>,
            Arc::clone(&registrar) as Arc<dyn RegistrationOps>,
            Arc::clone(&bus) as Arc<dyn EventSource>,
        )
        .expect("cache creation failed");
        Self { bus, classifier, registrar, cache }
    }

    /// `get` that asserts the returned region satisfies the request.
    pub fn get(&self, addr: usize, len: usize, prot: Protection) -> CachedRegion {
        let region = self.cache.get(addr, len, prot, None).expect("get failed");
        assert!(region.start() <= addr);
        assert!(region.end() >= addr + len);
        assert!(region.prot().contains(prot));
        assert_eq!(region_magic(&region), MAGIC);
        region
    }

    /// Deliver an unmap event for `[addr, addr + len)`.
    pub fn unmap_event(&self, addr: usize, len: usize) {
        self.bus.dispatch(&VmEvent { mask: EventMask::VM_UNMAPPED, addr, len });
    }

    /// Deliver a device-free event for `[addr, addr + len)`.
    pub fn mem_type_free_event(&self, addr: usize, len: usize) {
        self.bus.dispatch(&VmEvent { mask: EventMask::MEM_TYPE_FREE, addr, len });
    }
}

/// Registration id the test registrar stamped into the payload.
pub fn region_id(region: &CachedRegion) -> u32 {
    u32::from_ne_bytes(region.payload()[4..8].try_into().unwrap())
}

pub fn region_magic(region: &CachedRegion) -> u32 {
    u32::from_ne_bytes(region.payload()[0..4].try_into().unwrap())
}

pub const RW: ProtFlags = ProtFlags::PROT_READ.union(ProtFlags::PROT_WRITE);

/// Anonymous mapping released on drop.
pub struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
}

impl Mapping {
    pub fn new(len: usize, prot: ProtFlags) -> Self {
        let ptr = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(len).unwrap(),
                prot,
                MapFlags::MAP_PRIVATE,
            )
            .expect("mmap failed")
        };
        Self { ptr, len }
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Change the protection of `len` bytes at `offset`.
    pub fn protect(&self, offset: usize, len: usize, prot: ProtFlags) {
        assert!(offset + len <= self.len);
        let addr = unsafe {
            NonNull::new_unchecked(self.ptr.as_ptr().cast::<u8>().add(offset).cast::<c_void>())
        };
        unsafe { mprotect(addr, len, prot).expect("mprotect failed") };
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}
