// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Async switch lock: two mutually exclusive modes, each shared. See
//! [`AsyncSwitchLock`] for details.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use strum_macros::Display;

use crate::engine::{
    CancelAttempt, Dispose, DisposeTarget, Lifecycle, StdMutex, SyncError, WaitInterrupts,
    WaitOptions, WaitResult, WaiterKey, WaiterPoll, WaiterQueue, WakerBatch, lock_state,
    wake_all,
};

/// The two modes of an [`AsyncSwitchLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    #[must_use]
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// A switch lock: like a read/write lock where *both* sides are shared. Any number
/// of holders may share the current mode; the opposite mode waits.
///
/// When the active count drops to zero and the opposite side has waiters, the mode
/// swaps and the *entire* opposite cohort is admitted at once. In unfair mode a
/// matching-side arrival is admitted while its mode is active even if the opposite
/// side waits; in fair mode it queues behind them.
///
/// Dropping the returned [`SwitchGuard`] releases.
#[derive(Debug, Clone)]
pub struct AsyncSwitchLock {
    inner: Arc<SwitchInner>,
}

#[derive(Debug)]
struct SwitchInner {
    state: StdMutex<SwitchState>,
}

#[derive(Debug)]
struct SwitchState {
    mode: Option<Side>,
    active: u32,
    unfair: bool,
    next_seq: u64,
    left_waiters: WaiterQueue<()>,
    right_waiters: WaiterQueue<()>,
    lifecycle: Lifecycle,
}

impl SwitchState {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn queue_mut(&mut self, side: Side) -> &mut WaiterQueue<()> {
        match side {
            Side::Left => &mut self.left_waiters,
            Side::Right => &mut self.right_waiters,
        }
    }

    /// Admission check for an arrival, before it queues.
    fn can_enter_now(&mut self, side: Side) -> bool {
        match self.mode {
            None => {
                debug_assert!(self.active == 0);
                true
            }
            Some(current) if current == side => {
                if self.unfair {
                    return true;
                }
                self.left_waiters.is_empty() && self.right_waiters.is_empty()
            }
            Some(_) => false,
        }
    }

    /// Runs when the active count reaches zero: swap to the opposite cohort if it
    /// waits, else drain same-side stragglers, else go idle.
    fn pump_locked(&mut self, wakers: &mut WakerBatch) {
        if self.active == 0 {
            let pick = match self.mode {
                Some(current) => {
                    let opposite = current.opposite();
                    if !self.queue_mut(opposite).is_empty() {
                        Some(opposite)
                    } else if !self.queue_mut(current).is_empty() {
                        Some(current)
                    } else {
                        None
                    }
                }
                None => {
                    // Idle lock: whichever side has the oldest waiter goes first.
                    match (self.left_waiters.front_seq(), self.right_waiters.front_seq()) {
                        (None, None) => None,
                        (Some(_), None) => Some(Side::Left),
                        (None, Some(_)) => Some(Side::Right),
                        (Some(left), Some(right)) => {
                            Some(if left < right { Side::Left } else { Side::Right })
                        }
                    }
                }
            };
            match pick {
                Some(side) => {
                    let before = wakers.len();
                    self.queue_mut(side).grant_all(|| Ok(()), wakers);
                    let granted = u32::try_from(wakers.len() - before).unwrap_or(u32::MAX);
                    self.active += granted;
                    self.mode = if granted > 0 { Some(side) } else { None };
                }
                None => self.mode = None,
            }
        }
        let quiescent = self.active == 0;
        self.lifecycle.settle(quiescent, wakers);
    }

    fn release_locked(&mut self, wakers: &mut WakerBatch) {
        self.active -= 1;
        if self.active == 0 {
            self.pump_locked(wakers);
        }
    }
}

impl AsyncSwitchLock {
    /// Creates a fair switch lock: while the opposite side waits, same-side
    /// arrivals queue behind it.
    #[must_use]
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Creates an unfair switch lock: same-side arrivals join the active cohort
    /// even while the opposite side waits. Fairness is fixed for the lock's
    /// lifetime.
    #[must_use]
    pub fn new_unfair() -> Self {
        Self::build(true)
    }

    fn build(unfair: bool) -> Self {
        Self {
            inner: Arc::new(SwitchInner {
                state: StdMutex::new(SwitchState {
                    mode: None,
                    active: 0,
                    unfair,
                    next_seq: 0,
                    left_waiters: WaiterQueue::new(),
                    right_waiters: WaiterQueue::new(),
                    lifecycle: Lifecycle::new(),
                }),
            }),
        }
    }

    /// Acquires the lock in [`Side::Left`] mode.
    pub fn left(&self) -> Switch {
        self.enter_with(Side::Left, WaitOptions::default())
    }

    /// Acquires the lock in [`Side::Right`] mode.
    pub fn right(&self) -> Switch {
        self.enter_with(Side::Right, WaitOptions::default())
    }

    /// [`Self::left`] with a cancellation token and/or deadline.
    pub fn left_with(&self, options: WaitOptions) -> Switch {
        self.enter_with(Side::Left, options)
    }

    /// [`Self::right`] with a cancellation token and/or deadline.
    pub fn right_with(&self, options: WaitOptions) -> Switch {
        self.enter_with(Side::Right, options)
    }

    fn enter_with(&self, side: Side, options: WaitOptions) -> Switch {
        Switch {
            lock: self.clone(),
            side,
            options,
            interrupts: None,
            key: None,
            done: false,
        }
    }

    /// Non-suspending [`Self::left`].
    pub fn try_left(&self) -> Option<SwitchGuard> {
        self.try_enter(Side::Left)
    }

    /// Non-suspending [`Self::right`].
    pub fn try_right(&self) -> Option<SwitchGuard> {
        self.try_enter(Side::Right)
    }

    fn try_enter(&self, side: Side) -> Option<SwitchGuard> {
        let mut st = lock_state(&self.inner.state);
        if !st.lifecycle.is_active() || !st.can_enter_now(side) {
            return None;
        }
        st.mode = Some(side);
        st.active += 1;
        Some(SwitchGuard {
            inner: self.inner.clone(),
            side,
        })
    }

    pub fn is_left(&self) -> bool {
        lock_state(&self.inner.state).mode == Some(Side::Left)
    }

    pub fn is_right(&self) -> bool {
        lock_state(&self.inner.state).mode == Some(Side::Right)
    }

    pub fn waiting_left(&self) -> usize {
        lock_state(&self.inner.state).left_waiters.len()
    }

    pub fn waiting_right(&self) -> usize {
        lock_state(&self.inner.state).right_waiters.len()
    }

    pub fn is_disposed(&self) -> bool {
        lock_state(&self.inner.state).lifecycle.is_disposed()
    }

    /// Starts disposal: waiters on both sides fail with [`SyncError::Disposed`],
    /// new acquires are rejected, and the returned future resolves once every
    /// outstanding guard has been dropped.
    pub fn dispose(&self) -> Dispose<AsyncSwitchLock> {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            if st.lifecycle.is_active() {
                tracing::debug!(
                    waiting_left = st.left_waiters.len(),
                    waiting_right = st.right_waiters.len(),
                    "AsyncSwitchLock: dispose initiated"
                );
                st.lifecycle.begin_dispose();
                st.left_waiters.fail_all(SyncError::Disposed, &mut wakers);
                st.right_waiters.fail_all(SyncError::Disposed, &mut wakers);
            }
            let quiescent = st.active == 0;
            st.lifecycle.settle(quiescent, &mut wakers);
        }
        wake_all(wakers);
        Dispose::new(self.clone())
    }
}

impl Default for AsyncSwitchLock {
    fn default() -> Self {
        Self::new()
    }
}

impl DisposeTarget for AsyncSwitchLock {
    fn poll_dispose(&self, cx: &mut Context<'_>) -> Poll<()> {
        lock_state(&self.inner.state).lifecycle.poll_disposed(cx)
    }
}

/// RAII receipt of one slot in the current mode. Dropping it releases; the last
/// holder out may swap the mode to the waiting cohort.
#[derive(Debug)]
pub struct SwitchGuard {
    inner: Arc<SwitchInner>,
    side: Side,
}

impl SwitchGuard {
    /// The mode this guard holds.
    pub fn side(&self) -> Side {
        self.side
    }
}

impl Drop for SwitchGuard {
    fn drop(&mut self) {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            st.release_locked(&mut wakers);
        }
        wake_all(wakers);
    }
}

/// Future returned by [`AsyncSwitchLock::left`] / [`AsyncSwitchLock::right`].
#[derive(Debug)]
pub struct Switch {
    lock: AsyncSwitchLock,
    side: Side,
    options: WaitOptions,
    interrupts: Option<WaitInterrupts>,
    key: Option<WaiterKey>,
    done: bool,
}

impl Switch {
    fn guard(&self) -> SwitchGuard {
        SwitchGuard {
            inner: self.lock.inner.clone(),
            side: self.side,
        }
    }

    fn poll_first(&mut self, cx: &mut Context<'_>) -> Result<WaiterKey, WaitResult<SwitchGuard>> {
        if self.options.cancel_requested() {
            return Err(Err(SyncError::Cancelled));
        }
        let key = {
            let mut st = lock_state(&self.lock.inner.state);
            if !st.lifecycle.is_active() {
                return Err(Err(SyncError::Disposed));
            }
            if st.can_enter_now(self.side) {
                st.mode = Some(self.side);
                st.active += 1;
                return Err(Ok(self.guard()));
            }
            let seq = st.take_seq();
            st.queue_mut(self.side).enqueue(seq, cx.waker().clone())
        };
        self.key = Some(key);
        self.interrupts = Some(WaitInterrupts::new(&self.options));
        Ok(key)
    }

    fn resolve_interrupt(&mut self, key: WaiterKey, err: SyncError) -> WaitResult<SwitchGuard> {
        let mut wakers = WakerBatch::new();
        let result = {
            let mut st = lock_state(&self.lock.inner.state);
            let result = match st.queue_mut(self.side).try_cancel(key) {
                CancelAttempt::Cancelled => Err(err),
                CancelAttempt::AlreadyResolved(Ok(())) => Ok(self.guard()),
                CancelAttempt::AlreadyResolved(Err(parked)) => Err(parked),
            };
            st.pump_locked(&mut wakers);
            result
        };
        wake_all(wakers);
        result
    }
}

impl Future for Switch {
    type Output = WaitResult<SwitchGuard>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "Switch polled after completion");

        let key = match this.key {
            None => match this.poll_first(cx) {
                Err(result) => {
                    this.done = true;
                    return Poll::Ready(result);
                }
                Ok(key) => key,
            },
            Some(key) => {
                let mut st = lock_state(&this.lock.inner.state);
                let side = this.side;
                match st.queue_mut(side).poll_waiter(key, cx.waker()) {
                    WaiterPoll::Resolved(outcome) => {
                        drop(st);
                        this.done = true;
                        this.key = None;
                        return Poll::Ready(outcome.map(|()| this.guard()));
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

impl Drop for Switch {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(key) = self.key else {
            return;
        };
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.lock.inner.state);
            let side = self.side;
            match st.queue_mut(side).try_cancel(key) {
                CancelAttempt::AlreadyResolved(Ok(())) => {
                    st.release_locked(&mut wakers);
                }
                CancelAttempt::Cancelled | CancelAttempt::AlreadyResolved(Err(_)) => {
                    st.pump_locked(&mut wakers);
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

    use super::*;

    #[tokio::test]
    async fn same_side_shares_opposite_side_waits() {
        let lock = AsyncSwitchLock::new();

        let first = lock.left().await.unwrap();
        let second = lock.left().await.unwrap();
        assert!(lock.is_left());

        let mut right = lock.right();
        assert!((&mut right).now_or_never().is_none());
        assert_eq!(lock.waiting_right(), 1);

        drop(first);
        assert!((&mut right).now_or_never().is_none());
        drop(second);

        let guard = right.await.unwrap();
        assert!(lock.is_right());
        assert_eq!(guard.side(), Side::Right);
        drop(guard);
    }

    #[tokio::test]
    async fn mode_swaps_to_opposite_cohort_before_same_side_stragglers() {
        let lock = AsyncSwitchLock::new();
        let holder = lock.left().await.unwrap();

        let mut right = lock.right();
        let mut late_left = lock.left();
        assert!((&mut right).now_or_never().is_none());
        assert!((&mut late_left).now_or_never().is_none());
        assert_eq!(lock.waiting_right(), 1);
        assert_eq!(lock.waiting_left(), 1);

        drop(holder);
        // The opposite cohort wins the swap even though the left waiter existed too.
        let right_guard = right.await.unwrap();
        assert!(lock.is_right());
        assert!((&mut late_left).now_or_never().is_none());

        drop(right_guard);
        let left_guard = late_left.await.unwrap();
        assert!(lock.is_left());
        drop(left_guard);
    }

    #[tokio::test]
    async fn swap_admits_the_entire_waiting_cohort() {
        let lock = AsyncSwitchLock::new();
        let holder = lock.left().await.unwrap();

        let mut right_a = lock.right();
        let mut right_b = lock.right();
        assert!((&mut right_a).now_or_never().is_none());
        assert!((&mut right_b).now_or_never().is_none());
        assert_eq!(lock.waiting_right(), 2);

        drop(holder);
        let guard_a = right_a.await.unwrap();
        let guard_b = right_b.await.unwrap();
        assert!(lock.is_right());
        drop(guard_a);
        drop(guard_b);
    }

    #[tokio::test]
    async fn unfair_mode_admits_same_side_arrivals_while_opposite_waits() {
        let lock = AsyncSwitchLock::new_unfair();
        let holder = lock.left().await.unwrap();

        let mut right = lock.right();
        assert!((&mut right).now_or_never().is_none());

        // Unfair: the late left arrival barges into the active mode.
        let late_left = lock.left().await.unwrap();
        assert_eq!(lock.waiting_left(), 0);

        drop(holder);
        drop(late_left);
        assert!(right.await.is_ok());
    }

    #[tokio::test]
    async fn fair_mode_queues_same_side_arrivals_while_opposite_waits() {
        let lock = AsyncSwitchLock::new();
        let holder = lock.left().await.unwrap();

        let mut right = lock.right();
        assert!((&mut right).now_or_never().is_none());

        let mut late_left = lock.left();
        assert!((&mut late_left).now_or_never().is_none());
        assert_eq!(lock.waiting_left(), 1);

        drop(holder);
        assert!(right.await.is_ok());
        drop(late_left);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_with_deadline_times_out() {
        let lock = AsyncSwitchLock::new();
        let _holder = lock.left().await.unwrap();

        let result = lock
            .right_with(WaitOptions::timeout(Duration::from_millis(30)))
            .await;
        assert_eq!(result.unwrap_err(), SyncError::Timeout);
        assert_eq!(lock.waiting_right(), 0);
    }

    #[tokio::test]
    async fn try_variants_do_not_suspend() {
        let lock = AsyncSwitchLock::new();

        let left = lock.try_left().expect("lock is idle");
        assert!(lock.try_right().is_none());
        assert!(lock.try_left().is_some());
        drop(left);
    }

    #[tokio::test]
    async fn dispose_fails_waiters_and_awaits_guards() {
        let lock = AsyncSwitchLock::new();
        let holder = lock.left().await.unwrap();

        let mut right = lock.right();
        assert!((&mut right).now_or_never().is_none());

        let mut disposal = lock.dispose();
        assert_eq!(right.await.unwrap_err(), SyncError::Disposed);
        assert_eq!(lock.right().await.unwrap_err(), SyncError::Disposed);
        assert!((&mut disposal).now_or_never().is_none());

        drop(holder);
        disposal.await;
        assert!(lock.is_disposed());
    }
}
