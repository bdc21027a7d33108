// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Per-wait cancellation and deadline configuration. See [`WaitOptions`] for the public
//! surface and [`WaitInterrupts`] for the engine-side polling half.

use std::{future::Future, pin::Pin, task::Context, time::Duration};

use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::SyncError;

/// Optional cancellation token and deadline for one acquire-like operation.
///
/// Every `*_with` operation in this crate accepts one of these. The default is "wait
/// forever, cancel only by dropping the future" - dropping an acquire future is always
/// a safe cancellation in its own right.
///
/// ```
/// use std::time::Duration;
/// use r3bl_sync::WaitOptions;
/// use tokio_util::sync::CancellationToken;
///
/// let token = CancellationToken::new();
/// let options = WaitOptions::timeout(Duration::from_millis(250))
///     .with_cancel_token(token.clone());
/// ```
///
/// Resolution order when racing: the waiter's own grant is checked first on every
/// poll, so a wait that is granted and interrupted "simultaneously" reports success.
/// Whichever side resolves the waiter slot first wins; the loser is a no-op.
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Absolute point in time after which the wait fails with [`SyncError::Timeout`].
    pub deadline: Option<Instant>,
    /// Token whose cancellation fails the wait with [`SyncError::Cancelled`].
    pub cancel_token: Option<CancellationToken>,
}

impl WaitOptions {
    /// Fail the wait with [`SyncError::Timeout`] once `duration` has elapsed from now.
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::default().with_timeout(duration)
    }

    /// Fail the wait with [`SyncError::Timeout`] once `deadline` is reached.
    #[must_use]
    pub fn deadline(deadline: Instant) -> Self {
        Self::default().with_deadline(deadline)
    }

    /// Fail the wait with [`SyncError::Cancelled`] once `token` is cancelled.
    #[must_use]
    pub fn cancel_token(token: CancellationToken) -> Self {
        Self::default().with_cancel_token(token)
    }

    /// Builder-style variant of [`Self::timeout`].
    #[must_use]
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.deadline = Some(Instant::now() + duration);
        self
    }

    /// Builder-style variant of [`Self::deadline`].
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Builder-style variant of [`Self::cancel_token`].
    #[must_use]
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// True when the token was already cancelled before the wait even started. Checked
    /// on the first poll, ahead of the fast path, so a pre-cancelled wait never
    /// consumes a resource.
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel_token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// The armed half of [`WaitOptions`]: a deadline [`Sleep`] and a token future, polled
/// by an acquire future after its waiter slot reports `Waiting`.
///
/// Only constructed once a wait actually suspends - the fast path never allocates
/// these. A deadline that is already in the past therefore only matters if the wait
/// would have suspended, which is also what lets `WaitOptions::timeout(ZERO)` express
/// "try, but do not wait".
#[derive(Debug)]
pub(crate) struct WaitInterrupts {
    sleep: Option<Pin<Box<Sleep>>>,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl WaitInterrupts {
    pub fn new(options: &WaitOptions) -> Self {
        Self {
            sleep: options.deadline.map(|d| Box::pin(tokio::time::sleep_until(d))),
            cancelled: options
                .cancel_token
                .clone()
                .map(|token| Box::pin(token.cancelled_owned())),
        }
    }

    /// Polls both interrupt sources. The token is consulted before the deadline so a
    /// simultaneous fire reports [`SyncError::Cancelled`] deterministically.
    pub fn poll_interrupt(&mut self, cx: &mut Context<'_>) -> Option<SyncError> {
        if let Some(cancelled) = &mut self.cancelled {
            if cancelled.as_mut().poll(cx).is_ready() {
                return Some(SyncError::Cancelled);
            }
        }
        if let Some(sleep) = &mut self.sleep {
            if sleep.as_mut().poll(cx).is_ready() {
                return Some(SyncError::Timeout);
            }
        }
        None
    }
}
