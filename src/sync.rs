// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning.
//!
//! Listener callbacks are user code and may panic. When one panics while a
//! coordinator lock is held, the lock becomes poisoned; every later queue or
//! stream operation would then panic too. The coordinators use these helpers
//! instead so a single bad listener cannot take the whole client down.
//!
//! ```
//! use std::sync::RwLock;
//! use weenus::sync::{resilient_read, resilient_write};
//!
//! let lock = RwLock::new(Vec::<u32>::new());
//! resilient_write(&lock).push(7);
//! assert_eq!(resilient_read(&lock).len(), 1);
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, taking the inner guard if the lock is poisoned.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "weenus::sync",
                event = "LOCK_POISONED_READ",
                "RwLock poisoned during read; recovering. A listener or driver panicked while holding it."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, taking the inner guard if the lock is poisoned.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "weenus::sync",
                event = "LOCK_POISONED_WRITE",
                "RwLock poisoned during write; recovering. A listener or driver panicked while holding it."
            );
            poisoned.into_inner()
        }
    }
}

/// Lock a mutex, taking the inner guard if the mutex is poisoned.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "weenus::sync",
                event = "LOCK_POISONED_MUTEX",
                "Mutex poisoned; recovering. A listener panicked during notification."
            );
            poisoned.into_inner()
        }
    }
}
