// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Listener registry used by both coordinators.
//!
//! Fan-out is synchronous: [`ListenerSet::emit`] returns only after every
//! listener has run. The registry lock is released before listeners are
//! called, so a listener may subscribe, unsubscribe or read coordinator state
//! without deadlocking.
//!
//! Coordinators publish through [`ListenerSet::emit_versioned`]. Snapshots are
//! numbered inside the coordinator's critical section and handed to a single
//! delivery loop, so listeners never see an older snapshot after a newer one
//! even when mutations race on different threads. No lock is held while a
//! listener runs: a listener may call back into the coordinator it is
//! subscribed to. The snapshot from that nested change is delivered after
//! the current fan-out finishes.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::sync::{resilient_lock, resilient_read, resilient_write};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slot<T: ?Sized> {
    id: u64,
    key: Option<String>,
    listener: Listener<T>,
}

struct Registry<T: ?Sized> {
    next_id: u64,
    slots: Vec<Slot<T>>,
}

impl<T: ?Sized> Registry<T> {
    fn insert(&mut self, key: Option<String>, listener: Listener<T>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.push(Slot { id, key, listener });
        id
    }

    fn remove(&mut self, id: u64) {
        self.slots.retain(|slot| slot.id != id);
    }
}

struct Delivery<T: ?Sized> {
    /// Highest snapshot version handed to listeners
    delivered: u64,
    /// Newest snapshot waiting for the delivery loop
    pending: Option<(u64, Box<T>)>,
    /// A thread is running the delivery loop
    draining: bool,
}

/// Clears `draining` if a listener unwinds out of the delivery loop.
struct DrainGuard<'a, T: ?Sized> {
    delivery: &'a Mutex<Delivery<T>>,
    finished: bool,
}

impl<T: ?Sized> Drop for DrainGuard<'_, T> {
    fn drop(&mut self) {
        if !self.finished {
            resilient_lock(self.delivery).draining = false;
        }
    }
}

/// A set of listeners notified with `&T` on every emit.
pub struct ListenerSet<T: ?Sized + 'static> {
    registry: Arc<RwLock<Registry<T>>>,
    delivery: Mutex<Delivery<T>>,
}

impl<T: ?Sized + 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry { next_id: 0, slots: Vec::new() })),
            delivery: Mutex::new(Delivery {
                delivered: 0,
                pending: None,
                draining: false,
            }),
        }
    }

    /// Register an anonymous listener.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = resilient_write(&self.registry).insert(None, Arc::new(listener));
        self.subscription(id)
    }

    /// Register a listener under `key`, replacing any listener already
    /// registered under the same key. The replaced listener's
    /// [`Subscription`] becomes inert.
    pub fn subscribe_keyed<F>(&self, key: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let key = key.into();
        let id = {
            let mut registry = resilient_write(&self.registry);
            let before = registry.slots.len();
            registry.slots.retain(|slot| slot.key.as_deref() != Some(key.as_str()));
            if registry.slots.len() != before {
                tracing::debug!(key = %key, "replacing keyed listener");
            }
            registry.insert(Some(key), Arc::new(listener))
        };
        self.subscription(id)
    }

    /// Call every listener with `value`.
    pub fn emit(&self, value: &T) {
        let listeners: Vec<Listener<T>> = resilient_read(&self.registry)
            .slots
            .iter()
            .map(|slot| Arc::clone(&slot.listener))
            .collect();

        for listener in listeners {
            listener(value);
        }
    }

    /// Deliver snapshot number `version`, skipping it if a newer snapshot has
    /// already gone out or is waiting. A newer snapshot always includes the
    /// older change.
    ///
    /// If another call is already delivering (on this thread, from inside a
    /// listener, or on another thread) the snapshot is left for that call and
    /// this returns at once. Only the newest waiting snapshot is kept.
    pub fn emit_versioned(&self, version: u64, value: Box<T>) {
        {
            let mut delivery = resilient_lock(&self.delivery);
            let newest = delivery.pending.as_ref().map_or(delivery.delivered, |(v, _)| *v);
            if version <= newest {
                tracing::trace!(version, newest, "skipping stale snapshot");
                return;
            }
            delivery.pending = Some((version, value));
            if delivery.draining {
                return;
            }
            delivery.draining = true;
        }

        let mut guard = DrainGuard {
            delivery: &self.delivery,
            finished: false,
        };
        loop {
            let next = {
                let mut delivery = resilient_lock(&self.delivery);
                match delivery.pending.take() {
                    Some((version, value)) => {
                        delivery.delivered = version;
                        value
                    }
                    None => {
                        delivery.draining = false;
                        guard.finished = true;
                        return;
                    }
                }
            };
            self.emit(&next);
        }
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.registry).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn subscription(&self, id: u64) -> Subscription {
        let registry: Weak<RwLock<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            dispose: Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    resilient_write(&registry).remove(id);
                }
            })),
        }
    }
}

impl<T: ?Sized + 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + 'static> fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet").field("listeners", &self.len()).finish()
    }
}

/// Disposer returned by `subscribe`.
///
/// Dropping it unsubscribes. Call [`Subscription::detach`] to keep the
/// listener registered for the lifetime of the coordinator.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    /// Keep the listener registered and drop the handle.
    pub fn detach(mut self) {
        self.dispose = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}
