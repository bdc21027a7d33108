// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Unbounded async counter whose decrement suspends at zero. See [`AsyncCounter`] for
//! details.

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

/// An async counter: increments never suspend, decrements suspend at zero and resume
/// FIFO-fair as value arrives.
///
/// Two waiter populations hang off the counter:
///
/// - **Decrement waiters** consume one unit of value each when granted.
/// - **Peek waiters** ([`peek_decrement`]) are told *that* the value became positive
///   without consuming any of it. An increment wakes all peekers before it feeds
///   decrement waiters, and a woken peeker may still lose the race for the actual
///   value - which is exactly what lets [`decrement_any`] watch many counters and
///   only commit to one.
///
/// Disposal drains rather than destroys: pending decrement waiters fail with
/// [`SyncError::Disposed`], peekers resolve with `false`, increments are rejected,
/// but value already banked keeps being decrementable until it runs out.
///
/// [`peek_decrement`]: Self::peek_decrement
/// [`decrement_any`]: Self::decrement_any
#[derive(Debug, Clone)]
pub struct AsyncCounter {
    inner: Arc<CounterInner>,
}

#[derive(Debug)]
struct CounterInner {
    state: StdMutex<CounterState>,
}

#[derive(Debug)]
struct CounterState {
    value: u64,
    next_seq: u64,
    waiters: WaiterQueue<()>,
    peekers: WaiterQueue<bool>,
    lifecycle: Lifecycle,
}

impl CounterState {
    /// Value arrived: wake every peeker, then feed decrement waiters until the value
    /// or the queue runs out. Keeps the invariant "waiters pending ⇒ value == 0".
    fn pump_locked(&mut self, wakers: &mut WakerBatch) {
        if self.value == 0 {
            return;
        }
        self.peekers.grant_all(|| Ok(true), wakers);
        while self.value > 0 {
            match self.waiters.grant_next(Ok(())) {
                Some(waker) => {
                    self.value -= 1;
                    wakers.push(waker);
                }
                None => break,
            }
        }
    }
}

impl AsyncCounter {
    /// Creates a counter holding `initial` units of value.
    #[must_use]
    pub fn new(initial: u64) -> Self {
        Self {
            inner: Arc::new(CounterInner {
                state: StdMutex::new(CounterState {
                    value: initial,
                    next_seq: 0,
                    waiters: WaiterQueue::new(),
                    peekers: WaiterQueue::new(),
                    lifecycle: Lifecycle::new(),
                }),
            }),
        }
    }

    /// Adds one unit of value, waking a pending decrement waiter if one exists (the
    /// value then never transiently shows as positive).
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::Disposed`] once the counter is disposed.
    pub fn increment(&self) -> WaitResult<()> {
        self.add(1)
    }

    /// Bulk [`Self::increment`]: adds `amount` units atomically, waking up to
    /// `amount` decrement waiters.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::Disposed`] once the counter is disposed.
    pub fn add(&self, amount: u64) -> WaitResult<()> {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            if !st.lifecycle.is_active() {
                return Err(SyncError::Disposed);
            }
            st.value = st.value.saturating_add(amount);
            st.pump_locked(&mut wakers);
        }
        wake_all(wakers);
        Ok(())
    }

    /// Consumes one unit of value, suspending FIFO-fair while the counter is empty.
    pub fn decrement(&self) -> Decrement {
        self.decrement_with(WaitOptions::default())
    }

    /// [`Self::decrement`] with a cancellation token and/or deadline.
    pub fn decrement_with(&self, options: WaitOptions) -> Decrement {
        Decrement {
            counter: self.clone(),
            options,
            interrupts: None,
            key: None,
            done: false,
        }
    }

    /// Non-suspending decrement: true iff a unit of value was consumed. Keeps working
    /// on a disposed counter until the banked value runs out.
    pub fn try_decrement(&self) -> bool {
        let mut st = lock_state(&self.inner.state);
        if st.value == 0 {
            return false;
        }
        st.value -= 1;
        true
    }

    /// Atomically empties the counter, returning the value it held. Never suspends
    /// and never disturbs waiters: while anyone waits the value is already zero, so
    /// this returns 0 and removes nothing.
    pub fn decrement_to_zero(&self) -> u64 {
        let mut st = lock_state(&self.inner.state);
        std::mem::take(&mut st.value)
    }

    /// Resolves with `true` once the value becomes positive, *without* consuming any
    /// of it, or with `false` once the counter is disposed.
    ///
    /// Peekers share their own queue; they are all woken by the next increment,
    /// before any decrement waiter consumes the value. A woken peeker is a hint, not
    /// a reservation.
    pub fn peek_decrement(&self) -> PeekDecrement {
        self.peek_decrement_with(WaitOptions::default())
    }

    /// [`Self::peek_decrement`] with a cancellation token and/or deadline.
    pub fn peek_decrement_with(&self, options: WaitOptions) -> PeekDecrement {
        PeekDecrement {
            counter: self.clone(),
            options,
            interrupts: None,
            key: None,
            done: false,
        }
    }

    /// Non-suspending peek: true iff the value is positive right now.
    pub fn try_peek_decrement(&self) -> bool {
        lock_state(&self.inner.state).value > 0
    }

    /// Waits on every counter at once and consumes one unit from the first that can
    /// supply it, resolving with that counter's index. Ties break toward the lowest
    /// index. Losing counters are only peeked - they never give up value.
    ///
    /// Fails with [`SyncError::Disposed`] once every counter is disposed (with no
    /// banked value left), and with [`SyncError::InvalidOperation`] for an empty
    /// slice.
    pub fn decrement_any(counters: &[AsyncCounter]) -> DecrementAny {
        Self::decrement_any_with(counters, WaitOptions::default())
    }

    /// [`Self::decrement_any`] with a cancellation token and/or deadline.
    pub fn decrement_any_with(counters: &[AsyncCounter], options: WaitOptions) -> DecrementAny {
        DecrementAny {
            counters: counters.to_vec(),
            peeks: Vec::new(),
            options,
            interrupts: None,
            armed: false,
            done: false,
        }
    }

    /// Non-suspending [`Self::decrement_any`]: the lowest index whose counter had
    /// value to consume, if any.
    pub fn try_decrement_any(counters: &[AsyncCounter]) -> Option<usize> {
        counters.iter().position(AsyncCounter::try_decrement)
    }

    /// Value currently banked.
    pub fn current_count(&self) -> u64 {
        lock_state(&self.inner.state).value
    }

    /// Decrement waiters currently suspended.
    pub fn waiting_count(&self) -> usize {
        lock_state(&self.inner.state).waiters.len()
    }

    pub fn is_disposed(&self) -> bool {
        !lock_state(&self.inner.state).lifecycle.is_active()
    }

    /// Starts disposal: decrement waiters fail with [`SyncError::Disposed`], peekers
    /// resolve with `false`, increments are rejected. Value already banked remains
    /// decrementable until drained. The counter holds no handles, so the returned
    /// future resolves on its first poll.
    pub fn dispose(&self) -> Dispose<AsyncCounter> {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            if st.lifecycle.is_active() {
                tracing::debug!(
                    value = st.value,
                    waiting = st.waiters.len(),
                    "AsyncCounter: dispose initiated"
                );
                st.lifecycle.begin_dispose();
                st.waiters.fail_all(SyncError::Disposed, &mut wakers);
                st.peekers.grant_all(|| Ok(false), &mut wakers);
            }
            st.lifecycle.settle(true, &mut wakers);
        }
        wake_all(wakers);
        Dispose::new(self.clone())
    }
}

impl DisposeTarget for AsyncCounter {
    fn poll_dispose(&self, cx: &mut Context<'_>) -> Poll<()> {
        lock_state(&self.inner.state).lifecycle.poll_disposed(cx)
    }
}

/// Future returned by [`AsyncCounter::decrement`].
#[derive(Debug)]
pub struct Decrement {
    counter: AsyncCounter,
    options: WaitOptions,
    interrupts: Option<WaitInterrupts>,
    key: Option<WaiterKey>,
    done: bool,
}

impl Decrement {
    fn poll_first(&mut self, cx: &mut Context<'_>) -> Result<WaiterKey, WaitResult<()>> {
        if self.options.cancel_requested() {
            return Err(Err(SyncError::Cancelled));
        }
        let key = {
            let mut st = lock_state(&self.counter.inner.state);
            if st.value > 0 {
                // Banked value is consumable even while draining after dispose.
                st.value -= 1;
                return Err(Ok(()));
            }
            if !st.lifecycle.is_active() {
                return Err(Err(SyncError::Disposed));
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
        let mut st = lock_state(&self.counter.inner.state);
        match st.waiters.try_cancel(key) {
            CancelAttempt::Cancelled => Err(err),
            CancelAttempt::AlreadyResolved(outcome) => outcome,
        }
    }
}

impl Future for Decrement {
    type Output = WaitResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "Decrement polled after completion");

        let key = match this.key {
            None => match this.poll_first(cx) {
                Err(result) => {
                    this.done = true;
                    return Poll::Ready(result);
                }
                Ok(key) => key,
            },
            Some(key) => {
                let mut st = lock_state(&this.counter.inner.state);
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

impl Drop for Decrement {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(key) = self.key else {
            return;
        };
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.counter.inner.state);
            match st.waiters.try_cancel(key) {
                CancelAttempt::Cancelled | CancelAttempt::AlreadyResolved(Err(_)) => {}
                CancelAttempt::AlreadyResolved(Ok(())) => {
                    // The grant consumed a unit nobody will observe: put it back.
                    st.value += 1;
                    st.pump_locked(&mut wakers);
                }
            }
        }
        wake_all(wakers);
    }
}

/// Future returned by [`AsyncCounter::peek_decrement`]. Resolves with `true` when
/// value becomes available, `false` when the counter is disposed.
#[derive(Debug)]
pub struct PeekDecrement {
    counter: AsyncCounter,
    options: WaitOptions,
    interrupts: Option<WaitInterrupts>,
    key: Option<WaiterKey>,
    done: bool,
}

impl PeekDecrement {
    fn poll_first(&mut self, cx: &mut Context<'_>) -> Result<WaiterKey, WaitResult<bool>> {
        if self.options.cancel_requested() {
            return Err(Err(SyncError::Cancelled));
        }
        let key = {
            let mut st = lock_state(&self.counter.inner.state);
            if st.value > 0 {
                return Err(Ok(true));
            }
            if !st.lifecycle.is_active() {
                return Err(Ok(false));
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            st.peekers.enqueue(seq, cx.waker().clone())
        };
        self.key = Some(key);
        self.interrupts = Some(WaitInterrupts::new(&self.options));
        Ok(key)
    }

    fn resolve_interrupt(&mut self, key: WaiterKey, err: SyncError) -> WaitResult<bool> {
        let mut st = lock_state(&self.counter.inner.state);
        match st.peekers.try_cancel(key) {
            CancelAttempt::Cancelled => Err(err),
            CancelAttempt::AlreadyResolved(outcome) => outcome,
        }
    }
}

impl Future for PeekDecrement {
    type Output = WaitResult<bool>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "PeekDecrement polled after completion");

        let key = match this.key {
            None => match this.poll_first(cx) {
                Err(result) => {
                    this.done = true;
                    return Poll::Ready(result);
                }
                Ok(key) => key,
            },
            Some(key) => {
                let mut st = lock_state(&this.counter.inner.state);
                match st.peekers.poll_waiter(key, cx.waker()) {
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

impl Drop for PeekDecrement {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(key) = self.key else {
            return;
        };
        // A peek never holds value, so abandoning it is pure bookkeeping.
        let mut st = lock_state(&self.counter.inner.state);
        let _ = st.peekers.try_cancel(key);
    }
}

/// How one source inside [`DecrementAny`] is doing.
#[derive(Debug)]
enum PeekSlot {
    /// Watching the counter via a registered peek.
    Armed(PeekDecrement),
    /// That counter is disposed and drained; nothing more will come from it.
    Finished,
}

/// Future returned by [`AsyncCounter::decrement_any`]. Resolves with the index of the
/// counter that supplied the value.
#[derive(Debug)]
pub struct DecrementAny {
    counters: Vec<AsyncCounter>,
    peeks: Vec<PeekSlot>,
    options: WaitOptions,
    interrupts: Option<WaitInterrupts>,
    armed: bool,
    done: bool,
}

impl Future for DecrementAny {
    type Output = WaitResult<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "DecrementAny polled after completion");

        if !this.armed {
            if this.counters.is_empty() {
                this.done = true;
                return Poll::Ready(Err(SyncError::InvalidOperation));
            }
            if this.options.cancel_requested() {
                this.done = true;
                return Poll::Ready(Err(SyncError::Cancelled));
            }
            // Fast path before registering anything: lowest index wins a tie.
            if let Some(index) = AsyncCounter::try_decrement_any(&this.counters) {
                this.done = true;
                return Poll::Ready(Ok(index));
            }
            this.peeks = this
                .counters
                .iter()
                .map(|counter| PeekSlot::Armed(counter.peek_decrement()))
                .collect();
            this.interrupts = Some(WaitInterrupts::new(&this.options));
            this.armed = true;
        }

        let mut index = 0;
        while index < this.peeks.len() {
            if let PeekSlot::Armed(peek) = &mut this.peeks[index] {
                match Pin::new(peek).poll(cx) {
                    Poll::Ready(Ok(true)) => {
                        if this.counters[index].try_decrement() {
                            this.done = true;
                            // Remaining peeks are dropped with `self`; they never
                            // consumed anything, so the losers cost nothing.
                            return Poll::Ready(Ok(index));
                        }
                        // Lost the value race to a decrement waiter: watch again.
                        this.peeks[index] =
                            PeekSlot::Armed(this.counters[index].peek_decrement());
                        continue;
                    }
                    Poll::Ready(Ok(false) | Err(_)) => {
                        this.peeks[index] = PeekSlot::Finished;
                    }
                    Poll::Pending => {}
                }
            }
            index += 1;
        }

        if this
            .peeks
            .iter()
            .all(|slot| matches!(slot, PeekSlot::Finished))
        {
            this.done = true;
            return Poll::Ready(Err(SyncError::Disposed));
        }

        match this.interrupts.as_mut().and_then(|i| i.poll_interrupt(cx)) {
            Some(err) => {
                this.done = true;
                this.peeks.clear();
                Poll::Ready(Err(err))
            }
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::FutureExt;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn decrement_suspends_until_increment() -> miette::Result<()> {
        let counter = AsyncCounter::new(0);

        let mut pending = counter.decrement();
        assert!((&mut pending).now_or_never().is_none());
        assert_eq!(counter.waiting_count(), 1);

        counter.increment().map_err(miette::Report::from)?;
        pending.await.map_err(miette::Report::from)?;
        assert_eq!(counter.current_count(), 0);
        assert_eq!(counter.waiting_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn add_feeds_waiters_in_fifo_order() {
        let counter = AsyncCounter::new(0);

        let mut first = counter.decrement();
        let mut second = counter.decrement();
        let mut third = counter.decrement();
        assert!((&mut first).now_or_never().is_none());
        assert!((&mut second).now_or_never().is_none());
        assert!((&mut third).now_or_never().is_none());

        counter.add(2).unwrap();
        assert!(first.await.is_ok());
        assert!(second.await.is_ok());
        // Only two units arrived; the third waiter is still suspended.
        assert!((&mut third).now_or_never().is_none());
        assert_eq!(counter.current_count(), 0);
        assert_eq!(counter.waiting_count(), 1);

        counter.increment().unwrap();
        assert!(third.await.is_ok());
    }

    #[tokio::test]
    async fn try_decrement_only_succeeds_on_positive_value() {
        let counter = AsyncCounter::new(1);
        assert!(counter.try_decrement());
        assert!(!counter.try_decrement());
    }

    #[tokio::test]
    async fn decrement_to_zero_returns_prior_value_and_spares_waiters() {
        let counter = AsyncCounter::new(5);
        assert_eq!(counter.decrement_to_zero(), 5);
        assert_eq!(counter.current_count(), 0);

        // With a waiter pending the value is zero by invariant, so the drain is a
        // no-op that reports 0 and leaves the waiter alone.
        let mut pending = counter.decrement();
        assert!((&mut pending).now_or_never().is_none());
        assert_eq!(counter.decrement_to_zero(), 0);
        assert_eq!(counter.waiting_count(), 1);

        counter.increment().unwrap();
        assert!(pending.await.is_ok());
    }

    #[tokio::test]
    async fn peek_observes_value_without_consuming() {
        let counter = AsyncCounter::new(0);

        let mut peek = counter.peek_decrement();
        assert!((&mut peek).now_or_never().is_none());

        counter.increment().unwrap();
        assert!(peek.await.unwrap());
        // The peek left the value in place.
        assert_eq!(counter.current_count(), 1);
    }

    #[tokio::test]
    async fn peekers_wake_before_decrement_waiters_but_may_lose_the_value() {
        let counter = AsyncCounter::new(0);

        let mut peek = counter.peek_decrement();
        let mut decrement = counter.decrement();
        assert!((&mut peek).now_or_never().is_none());
        assert!((&mut decrement).now_or_never().is_none());

        counter.increment().unwrap();
        // Both resolved from the one increment: the peeker saw the value become
        // positive, the decrement waiter consumed it.
        assert!(peek.await.unwrap());
        assert!(decrement.await.is_ok());
        assert_eq!(counter.current_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn decrement_with_deadline_times_out() {
        let counter = AsyncCounter::new(0);
        let result = counter
            .decrement_with(WaitOptions::timeout(Duration::from_millis(20)))
            .await;
        assert_eq!(result.unwrap_err(), SyncError::Timeout);
        assert_eq!(counter.waiting_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_decrement_does_not_cost_value() {
        let counter = AsyncCounter::new(0);
        let token = CancellationToken::new();

        let mut pending = counter.decrement_with(WaitOptions::cancel_token(token.clone()));
        assert!((&mut pending).now_or_never().is_none());

        token.cancel();
        assert_eq!(pending.await.unwrap_err(), SyncError::Cancelled);

        counter.increment().unwrap();
        assert_eq!(counter.current_count(), 1);
    }

    #[tokio::test]
    async fn dispose_fails_waiters_and_peekers() {
        let counter = AsyncCounter::new(0);

        let mut peek = counter.peek_decrement();
        let mut waiting = counter.decrement();
        assert!((&mut waiting).now_or_never().is_none());
        assert!((&mut peek).now_or_never().is_none());

        counter.dispose().await;
        assert_eq!(waiting.await.unwrap_err(), SyncError::Disposed);
        assert!(!peek.await.unwrap());
        assert_eq!(counter.increment().unwrap_err(), SyncError::Disposed);
    }

    #[tokio::test]
    async fn banked_value_drains_out_after_dispose() {
        let counter = AsyncCounter::new(3);
        counter.dispose().await;

        // Value banked before disposal is still consumable...
        assert!(counter.try_decrement());
        assert!(counter.decrement().await.is_ok());
        assert!(counter.try_decrement());
        // ...until it runs out.
        assert_eq!(counter.decrement().await.unwrap_err(), SyncError::Disposed);
    }

    #[tokio::test]
    async fn decrement_any_prefers_the_lowest_index_on_ties() {
        let counters = [AsyncCounter::new(1), AsyncCounter::new(1)];
        let index = AsyncCounter::decrement_any(&counters).await.unwrap();
        assert_eq!(index, 0);
        assert_eq!(counters[0].current_count(), 0);
        // The loser was only peeked.
        assert_eq!(counters[1].current_count(), 1);
    }

    #[tokio::test]
    async fn decrement_any_waits_for_the_first_signal() {
        let counters = [AsyncCounter::new(0), AsyncCounter::new(0)];

        let mut any = AsyncCounter::decrement_any(&counters);
        assert!((&mut any).now_or_never().is_none());

        counters[1].increment().unwrap();
        assert_eq!(any.await.unwrap(), 1);
        assert_eq!(counters[1].current_count(), 0);
    }

    #[tokio::test]
    async fn decrement_any_fails_once_every_counter_is_disposed() {
        let counters = [AsyncCounter::new(0), AsyncCounter::new(0)];

        let mut any = AsyncCounter::decrement_any(&counters);
        assert!((&mut any).now_or_never().is_none());

        counters[0].dispose().await;
        counters[1].dispose().await;
        assert_eq!(any.await.unwrap_err(), SyncError::Disposed);
    }

    #[tokio::test]
    async fn decrement_any_rejects_empty_input() {
        let result = AsyncCounter::decrement_any(&[]).await;
        assert_eq!(result.unwrap_err(), SyncError::InvalidOperation);
    }

    #[tokio::test]
    async fn try_decrement_any_scans_in_index_order() {
        let counters = [
            AsyncCounter::new(0),
            AsyncCounter::new(2),
            AsyncCounter::new(1),
        ];
        assert_eq!(AsyncCounter::try_decrement_any(&counters), Some(1));
        assert_eq!(counters[1].current_count(), 1);
        assert_eq!(counters[2].current_count(), 1);
    }
}
