// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! # r3bl_sync
//!
//! Asynchronous synchronization primitives for Tokio: cooperative coordination
//! objects that suspend tasks instead of blocking threads, with first-class support
//! for cancellation tokens, deadlines, lifecycle-aware disposal, and fair FIFO
//! ordering.
//!
//! # The shared engine
//!
//! Every primitive in this crate sits on one waiter-queue engine
//! ([`engine`]): a FIFO registry of pending operations that correctly
//! interleaves arrivals, releases, cancellations, timeouts, and disposal under
//! concurrent access.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ composite containers   AsyncCollection, take_from_any           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ serial execution       TaskQueue, ActionFlag, interleave        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ primitives             AsyncSemaphore, AsyncCounter,            │
//! │                        AsyncReadWriteLock, AsyncSwitchLock,     │
//! │                        AsyncKeyedLock, Async{Auto,Manual}Reset- │
//! │                        Event                                    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ waiter-queue engine    WaiterQueue, WaitOptions, Lifecycle,     │
//! │                        SyncError                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine's resolution protocol guarantees, for every acquire-like operation:
//!
//! - **At-most-once resolution**: each awaitable resolves exactly once, with
//!   exactly one outcome.
//! - **No lost wakeups**: a release that finds a pending waiter resolves one.
//! - **Cancellation never races into success**: a wait that reports
//!   [`SyncError::Cancelled`] consumed nothing, and a wait whose grant won the race
//!   succeeds even if its token fired a moment later.
//! - **Stack safety**: grants wake, they never run continuations inline, so a
//!   40,000-deep chain of waiters resolves without recursion.
//!
//! # Shapes shared by the whole surface
//!
//! - An **acquire-like** operation (`take`, `decrement`, `read`, `write`, `left`,
//!   `right`, `acquire`, `wait`, `add`, `take`) has a plain form and a `*_with`
//!   form taking [`WaitOptions`] (cancellation token and/or deadline), and returns
//!   a **handle** whose drop releases the resource where one is held.
//! - A **non-suspending** `try_*` variant acquires only if that needs no wait.
//! - A **`dispose()`** starts draining: pending waiters fail with
//!   [`SyncError::Disposed`], new acquires are rejected, outstanding handles
//!   release normally, and the returned future resolves at full quiescence.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> miette::Result<()> {
//! use r3bl_sync::{AsyncSemaphore, WaitOptions};
//! use std::time::Duration;
//!
//! let semaphore = AsyncSemaphore::new(1);
//! let held = semaphore.take().await.map_err(miette::Report::from)?;
//!
//! // A bounded wait on a busy semaphore times out instead of hanging.
//! let timed_out = semaphore
//!     .take_with(WaitOptions::timeout(Duration::from_millis(10)))
//!     .await;
//! assert!(timed_out.is_err());
//!
//! drop(held);
//! assert_eq!(semaphore.current_count(), 1);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_in_result))]

// Attach sources.
pub mod collection;
pub mod engine;
pub mod executor;
pub mod primitives;

// Re-export.
pub use collection::*;
pub use engine::*;
pub use executor::*;
pub use primitives::*;
