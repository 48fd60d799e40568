//! rcache - Registration cache for externally-registered memory ranges.
//!
//! Registering a memory range with an external resource (pinning pages and
//! obtaining a key from a network adapter, handing a buffer to a device
//! driver) is expensive. This crate memoizes it: successive operations on
//! overlapping ranges reuse a single registration, while asynchronous
//! virtual-memory events (unmap, device free) invalidate affected entries
//! without ever letting a lookup acknowledge a stale one.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         RegCache                             │
//! │  ┌───────────────┐  ┌──────────────────┐  ┌───────────────┐  │
//! │  │  Page table   │  │ Invalidation     │  │ Pending       │  │
//! │  │  start→region │  │ queue (INVALID,  │  │ events        │  │
//! │  │  (RwLock)     │  │ awaiting dereg)  │  │ (deferred)    │  │
//! │  └───────────────┘  └──────────────────┘  └───────────────┘  │
//! │                                                              │
//! │  get() → fast hit │ slow hit │ merge + register callback     │
//! └──────────────────────────────────────────────────────────────┘
//!          │                    │                    ▲
//!          ▼                    ▼                    │
//!    Classifier           RegistrationOps       EventSource
//!    (memory kind)        (register/dereg)      (unmap, free)
//! ```
//!
//! - **Fast hit**: read-locked lookup of a resident region covering the
//!   request with sufficient protection.
//! - **Merge**: a miss overlapping resident regions absorbs them into one
//!   wider registration, protection widened only as far as the OS-reported
//!   page protection allows.
//! - **Invalidation**: events mark overlapping regions invalid and park them
//!   on a queue; deregistration runs later, at a safe point, once the last
//!   user reference is gone.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use rcache::{CacheConfig, EventBus, HostClassifier, Protection, RegCache};
//!
//! let bus = Arc::new(EventBus::new());
//! let cache = RegCache::create(
//!     CacheConfig::default().with_payload_size(16),
//!     "mlx5_0",
//!     Arc::new(HostClassifier),
//!     Arc::new(NicRegistrar::new(pd)),
//!     bus.clone(),
//! )?;
//!
//! let region = cache.get(buf.as_ptr() as usize, buf.len(),
//!                        Protection::READ | Protection::WRITE, None)?;
//! let lkey = u32::from_ne_bytes(region.payload()[..4].try_into().unwrap());
//! // ... post work referencing lkey ...
//! drop(region); // put
//! ```
//!
//! The crate is organized as follows:
//!
//! - [`cache`]: the registrar core ([`RegCache`])
//! - [`region`]: region records and the [`CachedRegion`] handle
//! - [`config`]: creation parameters ([`CacheConfig`], [`CacheFlags`])
//! - [`kind`]: memory-kind classification ([`MemKind`], [`Classifier`])
//! - [`events`]: VM-event subscription ([`EventSource`], [`EventBus`])
//! - [`ops`]: the external registration interface ([`RegistrationOps`])
//! - [`memprot`]: OS page-protection queries
//! - [`stats`]: cache counters

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod kind;
pub mod memprot;
pub mod ops;
mod pagetable;
pub mod region;
pub mod stats;

pub use cache::RegCache;
pub use config::{CacheConfig, CacheFlags};
pub use error::{Error, Result};
pub use events::{EventBus, EventHandler, EventMask, EventSource, SubscriptionToken, VmEvent};
pub use kind::{Classifier, HostClassifier, MemKind};
pub use ops::{RegisterFlags, RegistrationOps};
pub use region::{CachedRegion, Protection, Region, RegionFlags};
pub use stats::StatsSnapshot;
