//! Virtual-memory event interface.
//!
//! The cache subscribes to an [`EventSource`] for the events named in its
//! configuration and invalidates overlapping regions when one fires. The
//! source is an external collaborator; [`EventBus`] is a concrete in-process
//! implementation used by embedders that bridge munmap interposition (and by
//! the test suite, which dispatches events by hand).

use std::sync::Weak;

use bitflags::bitflags;
use parking_lot::Mutex;
use slab::Slab;

use crate::error::{Error, Result};

bitflags! {
    /// Kinds of virtual-memory events a cache can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u32 {
        /// A range of virtual addresses was unmapped.
        const VM_UNMAPPED = 1 << 0;
        /// A device allocation was freed.
        const MEM_TYPE_FREE = 1 << 1;
    }
}

/// One virtual-memory event.
#[derive(Debug, Clone, Copy)]
pub struct VmEvent {
    /// Which event fired (exactly one bit).
    pub mask: EventMask,
    /// Start of the affected range.
    pub addr: usize,
    /// Length of the affected range in bytes.
    pub len: usize,
}

/// Receiver side of a subscription.
///
/// Delivery may happen on any thread, possibly while the event producer
/// holds locks of its own; handlers must not call back into the source and
/// must not block on locks the producer might hold.
pub trait EventHandler: Send + Sync {
    /// Called once per event matching the subscribed mask.
    fn on_vm_event(&self, event: &VmEvent);
}

/// Opaque subscription identifier returned by [`EventSource::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(usize);

/// Producer side of the event protocol.
pub trait EventSource: Send + Sync {
    /// Register `handler` for all events intersecting `mask`.
    ///
    /// The source holds the handler weakly; a dropped handler is pruned on
    /// the next dispatch. Failure is reported as [`Error::NoResource`].
    fn subscribe(&self, mask: EventMask, handler: Weak<dyn EventHandler>)
        -> Result<SubscriptionToken>;

    /// Drop the subscription identified by `token`.
    fn unsubscribe(&self, token: SubscriptionToken);
}

struct Subscription {
    mask: EventMask,
    handler: Weak<dyn EventHandler>,
}

/// In-process event source.
///
/// `dispatch` runs on the caller's thread and returns after every matching
/// live handler has been invoked.
#[derive(Default)]
pub struct EventBus {
    subs: Mutex<Slab<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every live subscriber whose mask matches.
    ///
    /// Handlers run without the subscription lock held, so a handler may
    /// subscribe or unsubscribe reentrantly. Dead handlers are pruned.
    pub fn dispatch(&self, event: &VmEvent) {
        let handlers: Vec<_> = {
            let mut subs = self.subs.lock();
            subs.retain(|_, sub| sub.handler.strong_count() > 0);
            subs.iter()
                .filter(|(_, sub)| sub.mask.intersects(event.mask))
                .filter_map(|(_, sub)| sub.handler.upgrade())
                .collect()
        };
        for handler in handlers {
            handler.on_vm_event(event);
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().len()
    }
}

impl EventSource for EventBus {
    fn subscribe(&self, mask: EventMask, handler: Weak<dyn EventHandler>)
        -> Result<SubscriptionToken>
    {
        if mask.is_empty() {
            return Err(Error::NoResource("empty event mask".into()));
        }
        let key = self.subs.lock().insert(Subscription { mask, handler });
        Ok(SubscriptionToken(key))
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        let mut subs = self.subs.lock();
        if subs.contains(token.0) {
            subs.remove(token.0);
        }
    }
}
