// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Composite producer-consumer containers built from the counter primitive.

// Attach sources.
pub mod async_collection;
pub mod take_from_any;

// Re-export.
pub use async_collection::*;
pub use take_from_any::*;
