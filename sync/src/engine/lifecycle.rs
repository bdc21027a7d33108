// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Lifecycle-aware disposal shared by every primitive. See [`Lifecycle`] and
//! [`Dispose`] for details.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use strum_macros::Display;

use super::waiter_queue::WakerBatch;

/// Where a primitive is in its life.
///
/// ```text
/// Active ──dispose()──▶ Draining ──last holder releases──▶ Disposed
/// ```
///
/// `Draining` rejects new acquires and has already failed its pending waiters, but
/// outstanding handles are still honored: they release normally, and only when the
/// holder count reaches zero does the stage move on and the dispose futures resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub(crate) enum LifecycleStage {
    Active,
    Draining,
    Disposed,
}

/// The disposal half of a primitive's state word. Lives inside the primitive's mutex
/// next to its waiter queues.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    stage: LifecycleStage,
    dispose_wakers: Vec<Waker>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            stage: LifecycleStage::Active,
            dispose_wakers: Vec::new(),
        }
    }

    /// True while acquires are still admitted.
    pub fn is_active(&self) -> bool {
        self.stage == LifecycleStage::Active
    }

    pub fn is_disposed(&self) -> bool {
        self.stage == LifecycleStage::Disposed
    }

    /// Moves `Active` to `Draining`. Idempotent: a second dispose call observes the
    /// same drain and awaits the same quiescence.
    pub fn begin_dispose(&mut self) {
        if self.stage == LifecycleStage::Active {
            self.stage = LifecycleStage::Draining;
        }
    }

    /// Completes the drain once the caller reports quiescence (no outstanding
    /// holders). Dispose wakers are handed to the caller's batch, to be woken after
    /// the primitive's mutex is released.
    pub fn settle(&mut self, quiescent: bool, wakers: &mut WakerBatch) {
        if self.stage == LifecycleStage::Draining && quiescent {
            self.stage = LifecycleStage::Disposed;
            wakers.extend(self.dispose_wakers.drain(..));
        }
    }

    /// Poll half of a dispose future: ready once `Disposed`, otherwise parks the
    /// waker (deduplicated via [`Waker::will_wake`]).
    pub fn poll_disposed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.stage == LifecycleStage::Disposed {
            return Poll::Ready(());
        }
        if !self.dispose_wakers.iter().any(|w| w.will_wake(cx.waker())) {
            self.dispose_wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Crate-internal hook that lets [`Dispose`] poll a primitive's lifecycle without
/// knowing its state layout.
pub(crate) trait DisposeTarget {
    fn poll_dispose(&self, cx: &mut Context<'_>) -> Poll<()>;
}

/// Future returned by every `dispose()` in this crate. Resolves once the primitive is
/// fully quiescent: all pending waiters resolved and all outstanding handles dropped.
/// Disposing a primitive with no holders and no waiters resolves on the first poll.
#[derive(Debug)]
pub struct Dispose<T> {
    target: T,
}

impl<T> Dispose<T> {
    pub(crate) fn new(target: T) -> Self {
        Self { target }
    }
}

impl<T> Future for Dispose<T>
where
    T: DisposeTarget + Unpin,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.get_mut().target.poll_dispose(cx)
    }
}
