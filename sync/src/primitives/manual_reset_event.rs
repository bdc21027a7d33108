// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Level-triggered async signal: set releases everyone and stays set. See
//! [`AsyncManualResetEvent`] for details.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use crate::engine::{
    CancelAttempt, Dispose, DisposeTarget, Lifecycle, StdMutex, SyncError, WaitInterrupts,
    WaitOptions, WaitResult, WaiterKey, WaiterPoll, WaiterQueue, WakerBatch, lock_state,
    wake_all,
};

/// A manual-reset event: [`set`] releases every waiter and the event stays set -
/// subsequent waits complete immediately - until [`reset`] flips it back.
///
/// [`capacity`] exposes the waiter pool's allocation as telemetry: an
/// enqueue-then-cancel churn of any length must keep it bounded by the peak
/// concurrent waiter count, which is how the pool's slot reuse is asserted from the
/// outside.
///
/// [`set`]: Self::set
/// [`reset`]: Self::reset
/// [`capacity`]: Self::capacity
#[derive(Debug, Clone)]
pub struct AsyncManualResetEvent {
    inner: Arc<ManualInner>,
}

#[derive(Debug)]
struct ManualInner {
    state: StdMutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    set: bool,
    next_seq: u64,
    waiters: WaiterQueue<()>,
    lifecycle: Lifecycle,
}

impl AsyncManualResetEvent {
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        Self {
            inner: Arc::new(ManualInner {
                state: StdMutex::new(ManualState {
                    set: initially_set,
                    next_seq: 0,
                    waiters: WaiterQueue::new(),
                    lifecycle: Lifecycle::new(),
                }),
            }),
        }
    }

    /// Waits until the event is set. Completes immediately while it already is.
    pub fn wait(&self) -> ManualWait {
        self.wait_with(WaitOptions::default())
    }

    /// [`Self::wait`] with a cancellation token and/or deadline.
    pub fn wait_with(&self, options: WaitOptions) -> ManualWait {
        ManualWait {
            event: self.clone(),
            options,
            interrupts: None,
            key: None,
            done: false,
        }
    }

    /// Non-suspending check: true while the event is set. Unlike the auto-reset
    /// variant this consumes nothing - the level stays.
    pub fn try_wait(&self) -> bool {
        let st = lock_state(&self.inner.state);
        st.lifecycle.is_active() && st.set
    }

    /// Sets the event: every waiter is released and future waits sail through until
    /// [`Self::reset`]. A no-op on a disposed event.
    pub fn set(&self) {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            if !st.lifecycle.is_active() {
                return;
            }
            st.set = true;
            st.waiters.grant_all(|| Ok(()), &mut wakers);
        }
        wake_all(wakers);
    }

    /// Flips the event back to unset. A no-op on a disposed event.
    pub fn reset(&self) {
        let mut st = lock_state(&self.inner.state);
        if st.lifecycle.is_active() {
            st.set = false;
        }
    }

    pub fn is_set(&self) -> bool {
        lock_state(&self.inner.state).set
    }

    pub fn waiting_count(&self) -> usize {
        lock_state(&self.inner.state).waiters.len()
    }

    /// Allocated waiter-pool capacity. Bounded by the peak concurrent waiter count
    /// (modulo a constant pruning slack) no matter how many waits were created and
    /// cancelled over the event's life.
    pub fn capacity(&self) -> usize {
        lock_state(&self.inner.state).waiters.capacity()
    }

    pub fn is_disposed(&self) -> bool {
        lock_state(&self.inner.state).lifecycle.is_disposed()
    }

    /// Starts disposal: waiters fail with [`SyncError::Disposed`] and new waits are
    /// rejected. The event holds no handles, so the returned future resolves on its
    /// first poll.
    pub fn dispose(&self) -> Dispose<AsyncManualResetEvent> {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            if st.lifecycle.is_active() {
                tracing::debug!(
                    waiting = st.waiters.len(),
                    "AsyncManualResetEvent: dispose initiated"
                );
                st.lifecycle.begin_dispose();
                st.waiters.fail_all(SyncError::Disposed, &mut wakers);
            }
            st.lifecycle.settle(true, &mut wakers);
        }
        wake_all(wakers);
        Dispose::new(self.clone())
    }
}

impl DisposeTarget for AsyncManualResetEvent {
    fn poll_dispose(&self, cx: &mut Context<'_>) -> Poll<()> {
        lock_state(&self.inner.state).lifecycle.poll_disposed(cx)
    }
}

/// Future returned by [`AsyncManualResetEvent::wait`].
#[derive(Debug)]
pub struct ManualWait {
    event: AsyncManualResetEvent,
    options: WaitOptions,
    interrupts: Option<WaitInterrupts>,
    key: Option<WaiterKey>,
    done: bool,
}

impl ManualWait {
    fn poll_first(&mut self, cx: &mut Context<'_>) -> Result<WaiterKey, WaitResult<()>> {
        if self.options.cancel_requested() {
            return Err(Err(SyncError::Cancelled));
        }
        let key = {
            let mut st = lock_state(&self.event.inner.state);
            if !st.lifecycle.is_active() {
                return Err(Err(SyncError::Disposed));
            }
            if st.set {
                return Err(Ok(()));
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            st.waiters.enqueue(seq, cx.waker().clone())
        };
        self.key = Some(key);
        self.interrupts = Some(WaitInterrupts::new(&self.options));
        Ok(key)
    }

    fn resolve_interrupt(&mut self, key: WaiterKey, err: SyncError) -> WaitResult<()> {
        let mut st = lock_state(&self.event.inner.state);
        match st.waiters.try_cancel(key) {
            CancelAttempt::Cancelled => Err(err),
            CancelAttempt::AlreadyResolved(outcome) => outcome,
        }
    }
}

impl Future for ManualWait {
    type Output = WaitResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "ManualWait polled after completion");

        let key = match this.key {
            None => match this.poll_first(cx) {
                Err(result) => {
                    this.done = true;
                    return Poll::Ready(result);
                }
                Ok(key) => key,
            },
            Some(key) => {
                let mut st = lock_state(&this.event.inner.state);
                match st.waiters.poll_waiter(key, cx.waker()) {
                    WaiterPoll::Resolved(outcome) => {
                        drop(st);
                        this.done = true;
                        this.key = None;
                        return Poll::Ready(outcome);
                    }
                    WaiterPoll::Waiting => key,
                }
            }
        };

        match this.interrupts.as_mut().and_then(|i| i.poll_interrupt(cx)) {
            Some(err) => {
                this.done = true;
                this.key = None;
                Poll::Ready(this.resolve_interrupt(key, err))
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for ManualWait {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(key) = self.key else {
            return;
        };
        // A level signal holds no per-waiter resource; abandoning is bookkeeping.
        let mut st = lock_state(&self.event.inner.state);
        let _ = st.waiters.try_cancel(key);
    }
}
