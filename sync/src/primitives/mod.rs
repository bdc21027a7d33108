// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The primitive state machines: each owns one or more waiter queues from
//! [`crate::engine`] plus a small state word behind a short-lived mutex.

// Attach sources.
pub mod auto_reset_event;
pub mod counter;
pub mod keyed_lock;
pub mod manual_reset_event;
pub mod rw_lock;
pub mod semaphore;
pub mod switch_lock;

// Re-export.
pub use auto_reset_event::*;
pub use counter::*;
pub use keyed_lock::*;
pub use manual_reset_event::*;
pub use rw_lock::*;
pub use semaphore::*;
pub use switch_lock::*;
