// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The error surface of every awaitable operation in this crate. See [`SyncError`] for
//! details.

use miette::Diagnostic;
use thiserror::Error;

/// Result alias used by every acquire-like operation in this crate.
pub type WaitResult<T> = Result<T, SyncError>;

/// Why an awaitable synchronization operation did not produce a resource.
///
/// Every acquire-like operation (`take`, `decrement`, `read`, `write`, `acquire`,
/// `wait`, ...) resolves exactly once, either with its payload or with one of these.
/// The engine never swallows an outcome: a waiter that loses a race still observes
/// which race it lost.
///
/// - [`Cancelled`]: the wait lost to its [`CancellationToken`].
/// - [`Timeout`]: the wait lost to its deadline. Timeouts are cancellations with a
///   different kind, so everything said about cancellation applies to them too.
/// - [`Disposed`]: the primitive was disposed, either before the call or while the
///   waiter was pending. A disposal that wins the race against a token fire delivers
///   this, not [`Cancelled`].
/// - [`InvalidOperation`]: the operation cannot ever succeed in the current state,
///   e.g. adding to a collection after `complete_adding`, or taking from a collection
///   that is completed and drained.
///
/// [`Cancelled`]: SyncError::Cancelled
/// [`Timeout`]: SyncError::Timeout
/// [`Disposed`]: SyncError::Disposed
/// [`InvalidOperation`]: SyncError::InvalidOperation
/// [`CancellationToken`]: tokio_util::sync::CancellationToken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Diagnostic)]
pub enum SyncError {
    /// The wait was abandoned via its cancellation token.
    #[error("the wait was cancelled")]
    #[diagnostic(code(r3bl_sync::cancelled))]
    Cancelled,

    /// The wait outlived its deadline.
    #[error("the wait timed out")]
    #[diagnostic(code(r3bl_sync::timeout))]
    Timeout,

    /// The primitive was disposed before or while waiting.
    #[error("the synchronization primitive has been disposed")]
    #[diagnostic(code(r3bl_sync::disposed))]
    Disposed,

    /// The operation can never succeed in the primitive's current state.
    #[error("the operation is not valid in the current state")]
    #[diagnostic(code(r3bl_sync::invalid_operation))]
    InvalidOperation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(SyncError::Cancelled.to_string(), "the wait was cancelled");
        assert_eq!(SyncError::Timeout.to_string(), "the wait timed out");
        assert_eq!(
            SyncError::Disposed.to_string(),
            "the synchronization primitive has been disposed"
        );
        assert_eq!(
            SyncError::InvalidOperation.to_string(),
            "the operation is not valid in the current state"
        );
    }

    #[test]
    fn error_is_copy_and_eq() {
        let err = SyncError::Timeout;
        let copy = err;
        assert_eq!(err, copy);
    }
}
