//! Channel-id map and per-name rendezvous queues.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Grounded on `penguin_mux::inner::MultiplexorInner::flows`
//! (`Arc<RwLock<HashMap<u32, FlowSlot>>>`), generalized with the two
//! name-keyed FIFO queues spec.md §4.4/§9 call for. All mutation goes through
//! a single `parking_lot::Mutex` (spec.md §5's "one synchronization
//! primitive" resource policy) — the registry itself is what serializes the
//! reader task against concurrent public-API callers, so the "races" spec.md
//! describes between e.g. a cancelling accepter and an arriving offer are
//! resolved deterministically by lock ordering, not left as true races.

use crate::channel::Channel;
use crate::error::Error;
use crate::oneshot::Resolver;
use crate::options::ChannelOptions;
use crate::util::remove_by_ptr;
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A pending local `acceptChannelAsync(name)` call, not yet matched to a
/// remote offer. The attached state is the `ChannelOptions` the accepter
/// will use once matched (spec.md §9: "piggyback per-accepter options").
pub(crate) type Accepter = Arc<SyncMutex<Resolver<Channel, Error, ChannelOptions>>>;

/// A registry shared between the public API surface and the reader task.
pub(crate) type SharedRegistry = Arc<SyncMutex<Registry>>;

/// The channel-id map plus the two per-name rendezvous queues.
#[derive(Default)]
pub(crate) struct Registry {
    channels: HashMap<u32, Channel>,
    /// Remote offers not yet claimed by a local accepter, keyed by name.
    unmatched_offers: HashMap<String, VecDeque<Channel>>,
    /// Local accepters not yet matched to a remote offer, keyed by name.
    pending_accepters: HashMap<String, VecDeque<Accepter>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, channel: Channel) {
        self.channels.insert(channel.id(), channel);
    }

    pub fn get(&self, id: u32) -> Option<Channel> {
        self.channels.get(&id).cloned()
    }

    pub fn remove(&mut self, id: u32) -> Option<Channel> {
        let removed = self.channels.remove(&id);
        if let Some(channel) = &removed {
            self.remove_unmatched_offer_by_id(channel.name(), id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Drain every channel out of the registry (used on stream disposal).
    pub fn drain(&mut self) -> Vec<Channel> {
        self.unmatched_offers.clear();
        self.pending_accepters.clear();
        self.channels.drain().map(|(_, c)| c).collect()
    }

    /// If `name` has a live pending accepter, pop and return it (skipping
    /// over any that are no longer pending — e.g. cancelled after being
    /// queued but before we got here). Invariant maintained: after this
    /// call, `pending_accepters[name]` holds only live entries, or is absent.
    pub fn pop_live_accepter(&mut self, name: &str) -> Option<Accepter> {
        let queue = self.pending_accepters.get_mut(name)?;
        while let Some(accepter) = queue.pop_front() {
            if accepter.lock().is_pending() {
                if queue.is_empty() {
                    self.pending_accepters.remove(name);
                }
                return Some(accepter);
            }
        }
        self.pending_accepters.remove(name);
        None
    }

    pub fn push_accepter(&mut self, name: String, accepter: Accepter) {
        self.pending_accepters.entry(name).or_default().push_back(accepter);
    }

    /// Remove `accepter` from `name`'s pending queue by identity. Returns
    /// whether it was still there to remove: `false` means the reader task
    /// already popped it via [`Self::pop_live_accepter`], so the caller must
    /// not treat this as an uncontested cancellation (spec.md §5).
    pub fn remove_accepter(&mut self, name: &str, accepter: &Accepter) -> bool {
        let Some(queue) = self.pending_accepters.get_mut(name) else {
            return false;
        };
        let removed = remove_by_ptr(queue, accepter).is_some();
        if queue.is_empty() {
            self.pending_accepters.remove(name);
        }
        removed
    }

    /// If `name` has an unmatched remote offer, pop and return it (FIFO).
    pub fn pop_unmatched_offer(&mut self, name: &str) -> Option<Channel> {
        let queue = self.unmatched_offers.get_mut(name)?;
        let offer = queue.pop_front();
        if queue.is_empty() {
            self.unmatched_offers.remove(name);
        }
        offer
    }

    pub fn push_unmatched_offer(&mut self, name: String, channel: Channel) {
        self.unmatched_offers.entry(name).or_default().push_back(channel);
    }

    /// Prune `id` out of its name's unmatched-offer queue, if present.
    /// Used by `acceptChannel`/`rejectChannel` to take a channel out of
    /// named-rendezvous contention once it's handled by id instead.
    pub fn remove_from_unmatched_offers(&mut self, name: &str, id: u32) {
        self.remove_unmatched_offer_by_id(name, id);
    }

    fn remove_unmatched_offer_by_id(&mut self, name: &str, id: u32) {
        if name.is_empty() {
            return;
        }
        if let Some(queue) = self.unmatched_offers.get_mut(name) {
            queue.retain(|c| c.id() != id);
            if queue.is_empty() {
                self.unmatched_offers.remove(name);
            }
        }
    }
}
