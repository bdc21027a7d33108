// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Serial execution and trigger coalescing on top of the Tokio runtime.

// Attach sources.
pub mod action_flag;
pub mod interleave;
pub mod task_queue;

// Re-export.
pub use action_flag::*;
pub use interleave::*;
pub use task_queue::*;
