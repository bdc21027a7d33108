// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Capacity-limited async permit holder. See [`AsyncSemaphore`] for details.

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

/// An async semaphore: up to `max_count` concurrent holders, FIFO-fair beyond that.
///
/// [`take`] suspends when no permit is free and resumes in arrival order. The permit
/// is a [`SemaphorePermit`] whose drop releases it. Releasing while waiters exist
/// transfers the permit directly to the head waiter - the available count never
/// transiently rises, so a burst of releases cannot let a late arrival overtake the
/// queue.
///
/// Cloning is cheap and shares the same semaphore (the handle is an [`Arc`]).
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> miette::Result<()> {
/// use r3bl_sync::AsyncSemaphore;
///
/// let semaphore = AsyncSemaphore::new(2);
/// let first = semaphore.take().await.map_err(miette::Report::from)?;
/// let second = semaphore.take().await.map_err(miette::Report::from)?;
/// assert_eq!(semaphore.current_count(), 0);
/// drop(first);
/// assert_eq!(semaphore.current_count(), 1);
/// drop(second);
/// # Ok(())
/// # }
/// ```
///
/// [`take`]: Self::take
#[derive(Debug, Clone)]
pub struct AsyncSemaphore {
    inner: Arc<SemaphoreInner>,
}

#[derive(Debug)]
struct SemaphoreInner {
    state: StdMutex<SemaphoreState>,
}

#[derive(Debug)]
struct SemaphoreState {
    max: u32,
    available: u32,
    /// Permits currently granted (handle alive, or grant parked awaiting pickup).
    outstanding: u32,
    next_seq: u64,
    waiters: WaiterQueue<()>,
    lifecycle: Lifecycle,
}

impl SemaphoreState {
    /// One permit comes back. Transfer it to the head waiter if one is pending,
    /// otherwise return it to the free pool (clamped at `max`).
    fn release_locked(&mut self, wakers: &mut WakerBatch) {
        if let Some(waker) = self.waiters.grant_next(Ok(())) {
            // Direct transfer: `outstanding` is unchanged, `available` never rises.
            wakers.push(waker);
            return;
        }
        self.outstanding -= 1;
        if self.available < self.max {
            self.available += 1;
        }
        let quiescent = self.outstanding == 0;
        self.lifecycle.settle(quiescent, wakers);
    }
}

impl AsyncSemaphore {
    /// Creates a semaphore with `max_count` permits, all initially free.
    ///
    /// # Panics
    ///
    /// Panics when `max_count` is zero - a semaphore nobody can ever take is a
    /// programming error, not a runtime condition.
    #[must_use]
    pub fn new(max_count: u32) -> Self {
        assert!(max_count > 0, "a semaphore needs at least one permit");
        Self {
            inner: Arc::new(SemaphoreInner {
                state: StdMutex::new(SemaphoreState {
                    max: max_count,
                    available: max_count,
                    outstanding: 0,
                    next_seq: 0,
                    waiters: WaiterQueue::new(),
                    lifecycle: Lifecycle::new(),
                }),
            }),
        }
    }

    /// Acquires one permit, suspending FIFO-fair when none is free. Dropping the
    /// returned future abandons the wait (and hands back a permit that was granted
    /// but never observed).
    pub fn take(&self) -> Take {
        self.take_with(WaitOptions::default())
    }

    /// [`Self::take`] with a cancellation token and/or deadline.
    pub fn take_with(&self, options: WaitOptions) -> Take {
        Take {
            semaphore: self.clone(),
            options,
            interrupts: None,
            key: None,
            done: false,
        }
    }

    /// Synchronous acquire: a permit if one is free right now, without touching the
    /// waiter queue.
    pub fn try_take(&self) -> Option<SemaphorePermit> {
        let mut st = lock_state(&self.inner.state);
        if !st.lifecycle.is_active() || st.available == 0 {
            return None;
        }
        st.available -= 1;
        st.outstanding += 1;
        Some(SemaphorePermit::new(self.inner.clone()))
    }

    /// Permits currently free.
    pub fn current_count(&self) -> u32 {
        lock_state(&self.inner.state).available
    }

    /// The capacity this semaphore was created with.
    pub fn max_count(&self) -> u32 {
        lock_state(&self.inner.state).max
    }

    /// Waiters currently suspended in [`Self::take`].
    pub fn waiting_count(&self) -> usize {
        lock_state(&self.inner.state).waiters.len()
    }

    pub fn is_disposed(&self) -> bool {
        lock_state(&self.inner.state).lifecycle.is_disposed()
    }

    /// Starts disposal: pending waiters fail with [`SyncError::Disposed`], new
    /// [`Self::take`] calls fail immediately, and outstanding permits remain valid
    /// until dropped. The returned future resolves once the last permit comes back.
    pub fn dispose(&self) -> Dispose<AsyncSemaphore> {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            if st.lifecycle.is_active() {
                tracing::debug!(
                    waiting = st.waiters.len(),
                    outstanding = st.outstanding,
                    "AsyncSemaphore: dispose initiated"
                );
                st.lifecycle.begin_dispose();
                st.waiters.fail_all(SyncError::Disposed, &mut wakers);
            }
            let quiescent = st.outstanding == 0;
            st.lifecycle.settle(quiescent, &mut wakers);
        }
        wake_all(wakers);
        Dispose::new(self.clone())
    }
}

impl DisposeTarget for AsyncSemaphore {
    fn poll_dispose(&self, cx: &mut Context<'_>) -> Poll<()> {
        lock_state(&self.inner.state).lifecycle.poll_disposed(cx)
    }
}

/// RAII receipt of one semaphore permit. Dropping it releases the permit, waking the
/// head waiter if one is pending.
#[derive(Debug)]
pub struct SemaphorePermit {
    inner: Arc<SemaphoreInner>,
}

impl SemaphorePermit {
    fn new(inner: Arc<SemaphoreInner>) -> Self {
        Self { inner }
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            st.release_locked(&mut wakers);
        }
        wake_all(wakers);
    }
}

/// Future returned by [`AsyncSemaphore::take`]. Resolves with a [`SemaphorePermit`]
/// or one of the [`SyncError`] kinds.
#[derive(Debug)]
pub struct Take {
    semaphore: AsyncSemaphore,
    options: WaitOptions,
    interrupts: Option<WaitInterrupts>,
    key: Option<WaiterKey>,
    done: bool,
}

impl Take {
    /// First poll: fast path or enqueue. `Err` is the immediate outcome; `Ok` is the
    /// key of the freshly enqueued waiter.
    fn poll_first(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Result<WaiterKey, WaitResult<SemaphorePermit>> {
        if self.options.cancel_requested() {
            return Err(Err(SyncError::Cancelled));
        }
        let key = {
            let mut st = lock_state(&self.semaphore.inner.state);
            if !st.lifecycle.is_active() {
                return Err(Err(SyncError::Disposed));
            }
            if st.available > 0 {
                st.available -= 1;
                st.outstanding += 1;
                return Err(Ok(SemaphorePermit::new(self.semaphore.inner.clone())));
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            st.waiters.enqueue(seq, cx.waker().clone())
        };
        self.key = Some(key);
        self.interrupts = Some(WaitInterrupts::new(&self.options));
        Ok(key)
    }

    /// An interrupt (token or deadline) fired while we were queued. Whoever resolves
    /// the waiter slot first wins; a grant that got there first turns this interrupt
    /// into a no-op and the take succeeds.
    fn resolve_interrupt(&mut self, key: WaiterKey, err: SyncError) -> WaitResult<SemaphorePermit> {
        let mut st = lock_state(&self.semaphore.inner.state);
        match st.waiters.try_cancel(key) {
            CancelAttempt::Cancelled => Err(err),
            CancelAttempt::AlreadyResolved(Ok(())) => {
                Ok(SemaphorePermit::new(self.semaphore.inner.clone()))
            }
            CancelAttempt::AlreadyResolved(Err(parked)) => Err(parked),
        }
    }
}

impl Future for Take {
    type Output = WaitResult<SemaphorePermit>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "Take polled after completion");

        let key = match this.key {
            None => match this.poll_first(cx) {
                Err(result) => {
                    this.done = true;
                    return Poll::Ready(result);
                }
                Ok(key) => key,
            },
            Some(key) => {
                let mut st = lock_state(&this.semaphore.inner.state);
                match st.waiters.poll_waiter(key, cx.waker()) {
                    WaiterPoll::Resolved(outcome) => {
                        drop(st);
                        this.done = true;
                        this.key = None;
                        return Poll::Ready(
                            outcome
                                .map(|()| SemaphorePermit::new(this.semaphore.inner.clone())),
                        );
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

impl Drop for Take {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(key) = self.key else {
            return;
        };
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.semaphore.inner.state);
            match st.waiters.try_cancel(key) {
                CancelAttempt::Cancelled | CancelAttempt::AlreadyResolved(Err(_)) => {}
                CancelAttempt::AlreadyResolved(Ok(())) => {
                    // Granted but never observed: the permit goes back in.
                    st.release_locked(&mut wakers);
                }
            }
        }
        wake_all(wakers);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::FutureExt;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn contended_take_resolves_on_release() -> miette::Result<()> {
        let semaphore = AsyncSemaphore::new(1);
        let first = semaphore.take().await.map_err(miette::Report::from)?;
        assert_eq!(semaphore.current_count(), 0);

        let mut second = semaphore.take();
        assert!((&mut second).now_or_never().is_none());
        assert_eq!(semaphore.waiting_count(), 1);

        drop(first);
        let held = second.await.map_err(miette::Report::from)?;
        assert_eq!(semaphore.waiting_count(), 0);
        // The permit transferred directly: it was never visible as free.
        assert_eq!(semaphore.current_count(), 0);

        drop(held);
        assert_eq!(semaphore.current_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn waiters_resolve_in_arrival_order() -> miette::Result<()> {
        let semaphore = AsyncSemaphore::new(1);
        let held = semaphore.take().await.map_err(miette::Report::from)?;

        let mut first = semaphore.take();
        let mut second = semaphore.take();
        assert!((&mut first).now_or_never().is_none());
        assert!((&mut second).now_or_never().is_none());

        drop(held);
        // The head waiter got the permit; the second is still queued.
        assert!((&mut second).now_or_never().is_none());
        let held = first.await.map_err(miette::Report::from)?;

        drop(held);
        second.await.map_err(miette::Report::from)?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn take_with_deadline_times_out() {
        let semaphore = AsyncSemaphore::new(1);
        let _held = semaphore.take().await.unwrap();

        let result = semaphore
            .take_with(WaitOptions::timeout(Duration::from_millis(50)))
            .await;
        assert_eq!(result.unwrap_err(), SyncError::Timeout);
        assert_eq!(semaphore.waiting_count(), 0);
    }

    #[tokio::test]
    async fn pre_cancelled_token_never_consumes_a_permit() {
        let semaphore = AsyncSemaphore::new(1);
        let token = CancellationToken::new();
        token.cancel();

        let result = semaphore
            .take_with(WaitOptions::cancel_token(token))
            .await;
        assert_eq!(result.unwrap_err(), SyncError::Cancelled);
        // The permit is untouched.
        assert_eq!(semaphore.current_count(), 1);
    }

    #[tokio::test]
    async fn cancelling_a_queued_take_restores_nothing_and_leaves_queue_clean() {
        let semaphore = AsyncSemaphore::new(1);
        let held = semaphore.take().await.unwrap();

        let token = CancellationToken::new();
        let mut waiting = semaphore.take_with(WaitOptions::cancel_token(token.clone()));
        assert!((&mut waiting).now_or_never().is_none());
        assert_eq!(semaphore.waiting_count(), 1);

        token.cancel();
        assert_eq!(waiting.await.unwrap_err(), SyncError::Cancelled);
        assert_eq!(semaphore.waiting_count(), 0);

        // The held permit still releases normally afterwards.
        drop(held);
        assert_eq!(semaphore.current_count(), 1);
    }

    #[tokio::test]
    async fn dropping_a_queued_take_future_abandons_the_wait() {
        let semaphore = AsyncSemaphore::new(1);
        let held = semaphore.take().await.unwrap();

        let mut waiting = semaphore.take();
        assert!((&mut waiting).now_or_never().is_none());
        drop(waiting);
        assert_eq!(semaphore.waiting_count(), 0);

        drop(held);
        assert_eq!(semaphore.current_count(), 1);
    }

    #[tokio::test]
    async fn try_take_is_non_suspending() {
        let semaphore = AsyncSemaphore::new(1);
        let held = semaphore.try_take().expect("permit is free");
        assert!(semaphore.try_take().is_none());
        drop(held);
        assert!(semaphore.try_take().is_some());
    }

    #[tokio::test]
    async fn dispose_fails_waiters_and_awaits_outstanding_permits() {
        let semaphore = AsyncSemaphore::new(1);
        let held = semaphore.take().await.unwrap();

        let mut waiting = semaphore.take();
        assert!((&mut waiting).now_or_never().is_none());

        let mut disposal = semaphore.dispose();
        // The pending waiter fails immediately.
        assert_eq!(waiting.await.unwrap_err(), SyncError::Disposed);
        // New takes are rejected.
        assert_eq!(semaphore.take().await.unwrap_err(), SyncError::Disposed);
        assert!(semaphore.try_take().is_none());
        // But the outstanding permit keeps the drain open.
        assert!((&mut disposal).now_or_never().is_none());

        drop(held);
        disposal.await;
        assert!(semaphore.is_disposed());
    }

    #[tokio::test]
    async fn dispose_with_no_holders_resolves_immediately() {
        let semaphore = AsyncSemaphore::new(2);
        semaphore.dispose().await;
        assert!(semaphore.is_disposed());
    }
}
