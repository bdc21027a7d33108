// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Edge-triggered async signal: each set releases exactly one waiter. See
//! [`AsyncAutoResetEvent`] for details.

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

/// An auto-reset event: [`set`] releases exactly one waiter and the event snaps back
/// to unset in the same critical section. With nobody waiting, the signal latches
/// until the next [`wait`] (or [`try_wait`]) consumes it - signals do not
/// accumulate beyond one.
///
/// [`set`]: Self::set
/// [`wait`]: Self::wait
/// [`try_wait`]: Self::try_wait
#[derive(Debug, Clone)]
pub struct AsyncAutoResetEvent {
    inner: Arc<AutoInner>,
}

#[derive(Debug)]
struct AutoInner {
    state: StdMutex<AutoState>,
}

#[derive(Debug)]
struct AutoState {
    set: bool,
    next_seq: u64,
    waiters: WaiterQueue<()>,
    lifecycle: Lifecycle,
}

impl AutoState {
    /// One signal arrives: hand it to the head waiter, or latch it.
    fn signal_locked(&mut self, wakers: &mut WakerBatch) {
        match self.waiters.grant_next(Ok(())) {
            Some(waker) => wakers.push(waker),
            None => self.set = true,
        }
    }
}

impl AsyncAutoResetEvent {
    #[must_use]
    pub fn new(initially_set: bool) -> Self {
        Self {
            inner: Arc::new(AutoInner {
                state: StdMutex::new(AutoState {
                    set: initially_set,
                    next_seq: 0,
                    waiters: WaiterQueue::new(),
                    lifecycle: Lifecycle::new(),
                }),
            }),
        }
    }

    /// Waits for the next signal, consuming it. A latched signal completes the wait
    /// immediately.
    pub fn wait(&self) -> AutoWait {
        self.wait_with(WaitOptions::default())
    }

    /// [`Self::wait`] with a cancellation token and/or deadline.
    pub fn wait_with(&self, options: WaitOptions) -> AutoWait {
        AutoWait {
            event: self.clone(),
            options,
            interrupts: None,
            key: None,
            done: false,
        }
    }

    /// Consumes a latched signal if one is present, without suspending.
    pub fn try_wait(&self) -> bool {
        let mut st = lock_state(&self.inner.state);
        if !st.lifecycle.is_active() || !st.set {
            return false;
        }
        st.set = false;
        true
    }

    /// Signals the event: releases exactly one waiter, or latches when nobody
    /// waits. A no-op on a disposed event - release-like operations never fail.
    pub fn set(&self) {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            if !st.lifecycle.is_active() {
                return;
            }
            st.signal_locked(&mut wakers);
        }
        wake_all(wakers);
    }

    pub fn is_set(&self) -> bool {
        lock_state(&self.inner.state).set
    }

    pub fn waiting_count(&self) -> usize {
        lock_state(&self.inner.state).waiters.len()
    }

    pub fn is_disposed(&self) -> bool {
        lock_state(&self.inner.state).lifecycle.is_disposed()
    }

    /// Starts disposal: waiters fail with [`SyncError::Disposed`] and new waits are
    /// rejected. The event holds no handles, so the returned future resolves on its
    /// first poll.
    pub fn dispose(&self) -> Dispose<AsyncAutoResetEvent> {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            if st.lifecycle.is_active() {
                tracing::debug!(
                    waiting = st.waiters.len(),
                    "AsyncAutoResetEvent: dispose initiated"
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

impl DisposeTarget for AsyncAutoResetEvent {
    fn poll_dispose(&self, cx: &mut Context<'_>) -> Poll<()> {
        lock_state(&self.inner.state).lifecycle.poll_disposed(cx)
    }
}

/// Future returned by [`AsyncAutoResetEvent::wait`].
#[derive(Debug)]
pub struct AutoWait {
    event: AsyncAutoResetEvent,
    options: WaitOptions,
    interrupts: Option<WaitInterrupts>,
    key: Option<WaiterKey>,
    done: bool,
}

impl AutoWait {
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
                st.set = false;
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

impl Future for AutoWait {
    type Output = WaitResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "AutoWait polled after completion");

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

impl Drop for AutoWait {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(key) = self.key else {
            return;
        };
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.event.inner.state);
            match st.waiters.try_cancel(key) {
                CancelAttempt::AlreadyResolved(Ok(())) => {
                    // The signal was consumed on our behalf but never observed:
                    // pass it along instead of losing it.
                    st.signal_locked(&mut wakers);
                }
                CancelAttempt::Cancelled | CancelAttempt::AlreadyResolved(Err(_)) => {}
            }
        }
        wake_all(wakers);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::FutureExt;

    use super::*;

    #[tokio::test]
    async fn set_releases_exactly_one_waiter() {
        let event = AsyncAutoResetEvent::new(false);

        let mut first = event.wait();
        let mut second = event.wait();
        assert!((&mut first).now_or_never().is_none());
        assert!((&mut second).now_or_never().is_none());

        event.set();
        assert!(!event.is_set());
        // FIFO: the first waiter got the signal, the second is still parked.
        assert!(first.await.is_ok());
        assert!((&mut second).now_or_never().is_none());

        event.set();
        assert!(second.await.is_ok());
        assert!(!event.is_set());
    }

    #[tokio::test]
    async fn signal_latches_when_nobody_waits() {
        let event = AsyncAutoResetEvent::new(false);
        event.set();
        event.set();
        assert!(event.is_set());

        // Signals never accumulate beyond one.
        assert!(event.wait().await.is_ok());
        assert!(!event.is_set());
        assert!(event.wait().now_or_never().is_none());
    }

    #[tokio::test]
    async fn try_wait_consumes_the_latched_signal() {
        let event = AsyncAutoResetEvent::new(true);
        assert!(event.try_wait());
        assert!(!event.try_wait());
    }

    #[tokio::test]
    async fn dropping_a_granted_wait_passes_the_signal_along() {
        let event = AsyncAutoResetEvent::new(false);

        let mut winner = event.wait();
        let mut runner_up = event.wait();
        assert!((&mut winner).now_or_never().is_none());
        assert!((&mut runner_up).now_or_never().is_none());

        event.set();
        // The head waiter was granted but its future is dropped before observing
        // the signal - the signal must flow to the next waiter, not vanish.
        drop(winner);
        assert!(runner_up.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_with_deadline_times_out() {
        let event = AsyncAutoResetEvent::new(false);
        let result = event
            .wait_with(WaitOptions::timeout(Duration::from_millis(15)))
            .await;
        assert_eq!(result.unwrap_err(), SyncError::Timeout);
        assert_eq!(event.waiting_count(), 0);
    }

    #[tokio::test]
    async fn dispose_fails_waiters_and_mutes_set() {
        let event = AsyncAutoResetEvent::new(false);

        let mut waiting = event.wait();
        assert!((&mut waiting).now_or_never().is_none());

        event.dispose().await;
        assert_eq!(waiting.await.unwrap_err(), SyncError::Disposed);
        assert_eq!(event.wait().await.unwrap_err(), SyncError::Disposed);

        // set on a disposed event is a quiet no-op.
        event.set();
        assert!(!event.is_set());
    }
}
