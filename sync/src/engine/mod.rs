// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The waiter-queue engine: the FIFO registry of pending async operations that every
//! primitive in this crate is built on, plus the cross-cutting pieces they all share
//! (error kinds, wait options, lifecycle-aware disposal).
//!
//! Nothing here suspends by itself. The engine is pure bookkeeping under each
//! primitive's mutex; suspension and resumption happen in the primitives' acquire
//! futures via [`std::task::Waker`].

// Attach sources.
pub mod error;
pub mod lifecycle;
pub mod wait_options;
pub mod waiter_queue;

// Re-export.
pub use error::*;
pub use lifecycle::Dispose;
pub use wait_options::WaitOptions;
pub(crate) use lifecycle::{DisposeTarget, Lifecycle};
pub(crate) use wait_options::WaitInterrupts;
pub(crate) use waiter_queue::{CancelAttempt, WaiterKey, WaiterPoll, WaiterQueue, WakerBatch};

/// Crate-wide alias: the short-lived mutex that guards each primitive's structural
/// state. Never held across a suspension point.
pub type StdMutex<T> = std::sync::Mutex<T>;

/// Locks a primitive's state mutex, shrugging off poisoning. The engine's critical
/// sections contain no user code, so a poisoned mutex can only mean a panic inside
/// the engine itself - the state word is still structurally sound for cleanup paths.
pub(crate) fn lock_state<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Wakes a batch collected under a primitive's mutex. Call only after unlock: waking
/// under the lock lets a continuation re-enter the primitive and deadlock.
pub(crate) fn wake_all(wakers: WakerBatch) {
    for waker in wakers {
        waker.wake();
    }
}
