// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Async read/write lock: many readers XOR one writer. See [`AsyncReadWriteLock`] for
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

/// An async read/write lock. Readers share, writers are exclusive.
///
/// **Fair mode** (the default): readers and writers draw their queue positions from
/// one sequence counter, so the merged arrival order is total. On every release the
/// head-most cohort is admitted - either all readers that arrived before the first
/// waiting writer, or that writer once current readers have left. A reader arriving
/// while a writer waits queues behind it; that is what makes writer progress a
/// guarantee.
///
/// **Unfair mode** ([`new_unfair`]): an arriving reader joins the current reader
/// cohort even while a writer waits, and a release point prefers waiting writers.
/// Writers cannot be starved by queued readers, but a steady stream of *arriving*
/// readers can keep the reader cohort alive indefinitely - the classic unfair
/// trade-off, chosen here because arrival barging is the whole point of the mode.
///
/// Guards are RAII: dropping a [`ReadGuard`] / [`WriteGuard`] releases.
///
/// [`new_unfair`]: Self::new_unfair
#[derive(Debug, Clone)]
pub struct AsyncReadWriteLock {
    inner: Arc<RwInner>,
}

#[derive(Debug)]
struct RwInner {
    state: StdMutex<RwState>,
}

#[derive(Debug)]
struct RwState {
    readers_active: u32,
    writer_active: bool,
    unfair: bool,
    next_seq: u64,
    read_waiters: WaiterQueue<()>,
    write_waiters: WaiterQueue<()>,
    lifecycle: Lifecycle,
}

impl RwState {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Re-evaluates admission after any state change (release, cancellation,
    /// disposal). Grants are collected into `wakers` and fired after unlock.
    fn pump_locked(&mut self, wakers: &mut WakerBatch) {
        if self.unfair {
            self.pump_unfair(wakers);
        } else {
            self.pump_fair(wakers);
        }
        let quiescent = self.readers_active == 0 && !self.writer_active;
        self.lifecycle.settle(quiescent, wakers);
    }

    /// Fair policy: strictly follow the merged seq order. Contiguous readers at the
    /// head are admitted together; a writer is admitted alone once readers are gone.
    fn pump_fair(&mut self, wakers: &mut WakerBatch) {
        while !self.writer_active {
            let next_reader = self.read_waiters.front_seq();
            let next_writer = self.write_waiters.front_seq();
            let reader_first = match (next_reader, next_writer) {
                (None, None) => return,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(reader), Some(writer)) => reader < writer,
            };
            if reader_first {
                if let Some(waker) = self.read_waiters.grant_next(Ok(())) {
                    self.readers_active += 1;
                    wakers.push(waker);
                }
            } else {
                if self.readers_active == 0 {
                    if let Some(waker) = self.write_waiters.grant_next(Ok(())) {
                        self.writer_active = true;
                        wakers.push(waker);
                    }
                }
                return;
            }
        }
    }

    /// Unfair policy: waiting writers are preferred at release points; queued
    /// readers only flow once no writer waits.
    fn pump_unfair(&mut self, wakers: &mut WakerBatch) {
        if self.writer_active {
            return;
        }
        if self.readers_active == 0 {
            if let Some(waker) = self.write_waiters.grant_next(Ok(())) {
                self.writer_active = true;
                wakers.push(waker);
                return;
            }
        }
        if self.write_waiters.is_empty() {
            let before = wakers.len();
            self.read_waiters.grant_all(|| Ok(()), wakers);
            self.readers_active += u32::try_from(wakers.len() - before).unwrap_or(u32::MAX);
        }
    }

    fn release_read_locked(&mut self, wakers: &mut WakerBatch) {
        self.readers_active -= 1;
        if self.readers_active == 0 {
            self.pump_locked(wakers);
        }
    }

    fn release_write_locked(&mut self, wakers: &mut WakerBatch) {
        self.writer_active = false;
        self.pump_locked(wakers);
    }
}

impl AsyncReadWriteLock {
    /// Creates a fair lock: FIFO across readers and writers in merged arrival order.
    #[must_use]
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Creates an unfair lock: arriving readers may join the current reader cohort
    /// even while a writer waits. Fairness is fixed for the lock's lifetime.
    #[must_use]
    pub fn new_unfair() -> Self {
        Self::build(true)
    }

    fn build(unfair: bool) -> Self {
        Self {
            inner: Arc::new(RwInner {
                state: StdMutex::new(RwState {
                    readers_active: 0,
                    writer_active: false,
                    unfair,
                    next_seq: 0,
                    read_waiters: WaiterQueue::new(),
                    write_waiters: WaiterQueue::new(),
                    lifecycle: Lifecycle::new(),
                }),
            }),
        }
    }

    /// Acquires shared read access.
    pub fn read(&self) -> LockRead {
        self.read_with(WaitOptions::default())
    }

    /// [`Self::read`] with a cancellation token and/or deadline.
    pub fn read_with(&self, options: WaitOptions) -> LockRead {
        LockRead {
            lock: self.clone(),
            options,
            interrupts: None,
            key: None,
            done: false,
        }
    }

    /// Acquires exclusive write access.
    pub fn write(&self) -> LockWrite {
        self.write_with(WaitOptions::default())
    }

    /// [`Self::write`] with a cancellation token and/or deadline.
    pub fn write_with(&self, options: WaitOptions) -> LockWrite {
        LockWrite {
            lock: self.clone(),
            options,
            interrupts: None,
            key: None,
            done: false,
        }
    }

    /// Non-suspending read acquire.
    pub fn try_read(&self) -> Option<ReadGuard> {
        let mut st = lock_state(&self.inner.state);
        if !st.lifecycle.is_active() || !st.can_read_now() {
            return None;
        }
        st.readers_active += 1;
        Some(ReadGuard {
            inner: self.inner.clone(),
        })
    }

    /// Non-suspending write acquire.
    pub fn try_write(&self) -> Option<WriteGuard> {
        let mut st = lock_state(&self.inner.state);
        if !st.lifecycle.is_active() || !st.can_write_now() {
            return None;
        }
        st.writer_active = true;
        Some(WriteGuard {
            inner: self.inner.clone(),
        })
    }

    /// True while at least one reader holds the lock.
    pub fn is_reading(&self) -> bool {
        lock_state(&self.inner.state).readers_active > 0
    }

    /// True while a writer holds the lock.
    pub fn is_writing(&self) -> bool {
        lock_state(&self.inner.state).writer_active
    }

    pub fn waiting_readers(&self) -> usize {
        lock_state(&self.inner.state).read_waiters.len()
    }

    pub fn waiting_writers(&self) -> usize {
        lock_state(&self.inner.state).write_waiters.len()
    }

    pub fn is_disposed(&self) -> bool {
        lock_state(&self.inner.state).lifecycle.is_disposed()
    }

    /// Starts disposal: pending readers and writers fail with
    /// [`SyncError::Disposed`], new acquires are rejected, and the returned future
    /// resolves once every outstanding guard has been dropped.
    pub fn dispose(&self) -> Dispose<AsyncReadWriteLock> {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            if st.lifecycle.is_active() {
                tracing::debug!(
                    waiting_readers = st.read_waiters.len(),
                    waiting_writers = st.write_waiters.len(),
                    "AsyncReadWriteLock: dispose initiated"
                );
                st.lifecycle.begin_dispose();
                st.read_waiters.fail_all(SyncError::Disposed, &mut wakers);
                st.write_waiters.fail_all(SyncError::Disposed, &mut wakers);
            }
            let quiescent = st.readers_active == 0 && !st.writer_active;
            st.lifecycle.settle(quiescent, &mut wakers);
        }
        wake_all(wakers);
        Dispose::new(self.clone())
    }
}

impl Default for AsyncReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}

impl DisposeTarget for AsyncReadWriteLock {
    fn poll_dispose(&self, cx: &mut Context<'_>) -> Poll<()> {
        lock_state(&self.inner.state).lifecycle.poll_disposed(cx)
    }
}

impl RwState {
    /// Admission check for an arriving reader, before it queues.
    fn can_read_now(&mut self) -> bool {
        if self.writer_active {
            return false;
        }
        if self.unfair {
            // Arrival barging: join the cohort even while a writer waits.
            return true;
        }
        self.write_waiters.is_empty() && self.read_waiters.is_empty()
    }

    /// Admission check for an arriving writer, before it queues.
    fn can_write_now(&mut self) -> bool {
        if self.writer_active || self.readers_active > 0 {
            return false;
        }
        self.unfair || (self.write_waiters.is_empty() && self.read_waiters.is_empty())
    }
}

/// RAII receipt of shared read access. Dropping it releases; the last reader out
/// re-runs admission.
#[derive(Debug)]
pub struct ReadGuard {
    inner: Arc<RwInner>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            st.release_read_locked(&mut wakers);
        }
        wake_all(wakers);
    }
}

/// RAII receipt of exclusive write access. Dropping it releases and re-runs
/// admission.
#[derive(Debug)]
pub struct WriteGuard {
    inner: Arc<RwInner>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            st.release_write_locked(&mut wakers);
        }
        wake_all(wakers);
    }
}

/// Future returned by [`AsyncReadWriteLock::read`].
#[derive(Debug)]
pub struct LockRead {
    lock: AsyncReadWriteLock,
    options: WaitOptions,
    interrupts: Option<WaitInterrupts>,
    key: Option<WaiterKey>,
    done: bool,
}

impl LockRead {
    fn poll_first(&mut self, cx: &mut Context<'_>) -> Result<WaiterKey, WaitResult<ReadGuard>> {
        if self.options.cancel_requested() {
            return Err(Err(SyncError::Cancelled));
        }
        let key = {
            let mut st = lock_state(&self.lock.inner.state);
            if !st.lifecycle.is_active() {
                return Err(Err(SyncError::Disposed));
            }
            if st.can_read_now() {
                st.readers_active += 1;
                return Err(Ok(ReadGuard {
                    inner: self.lock.inner.clone(),
                }));
            }
            let seq = st.take_seq();
            st.read_waiters.enqueue(seq, cx.waker().clone())
        };
        self.key = Some(key);
        self.interrupts = Some(WaitInterrupts::new(&self.options));
        Ok(key)
    }

    fn resolve_interrupt(&mut self, key: WaiterKey, err: SyncError) -> WaitResult<ReadGuard> {
        let mut wakers = WakerBatch::new();
        let result = {
            let mut st = lock_state(&self.lock.inner.state);
            let result = match st.read_waiters.try_cancel(key) {
                CancelAttempt::Cancelled => Err(err),
                CancelAttempt::AlreadyResolved(Ok(())) => Ok(ReadGuard {
                    inner: self.lock.inner.clone(),
                }),
                CancelAttempt::AlreadyResolved(Err(parked)) => Err(parked),
            };
            // A vanished reader can change what the head cohort looks like.
            st.pump_locked(&mut wakers);
            result
        };
        wake_all(wakers);
        result
    }
}

impl Future for LockRead {
    type Output = WaitResult<ReadGuard>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "LockRead polled after completion");

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
                match st.read_waiters.poll_waiter(key, cx.waker()) {
                    WaiterPoll::Resolved(outcome) => {
                        drop(st);
                        this.done = true;
                        this.key = None;
                        return Poll::Ready(outcome.map(|()| ReadGuard {
                            inner: this.lock.inner.clone(),
                        }));
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

impl Drop for LockRead {
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
            match st.read_waiters.try_cancel(key) {
                CancelAttempt::AlreadyResolved(Ok(())) => {
                    // Granted but never observed: release the read slot.
                    st.release_read_locked(&mut wakers);
                }
                CancelAttempt::Cancelled | CancelAttempt::AlreadyResolved(Err(_)) => {
                    st.pump_locked(&mut wakers);
                }
            }
        }
        wake_all(wakers);
    }
}

/// Future returned by [`AsyncReadWriteLock::write`].
#[derive(Debug)]
pub struct LockWrite {
    lock: AsyncReadWriteLock,
    options: WaitOptions,
    interrupts: Option<WaitInterrupts>,
    key: Option<WaiterKey>,
    done: bool,
}

impl LockWrite {
    fn poll_first(&mut self, cx: &mut Context<'_>) -> Result<WaiterKey, WaitResult<WriteGuard>> {
        if self.options.cancel_requested() {
            return Err(Err(SyncError::Cancelled));
        }
        let key = {
            let mut st = lock_state(&self.lock.inner.state);
            if !st.lifecycle.is_active() {
                return Err(Err(SyncError::Disposed));
            }
            if st.can_write_now() {
                st.writer_active = true;
                return Err(Ok(WriteGuard {
                    inner: self.lock.inner.clone(),
                }));
            }
            let seq = st.take_seq();
            st.write_waiters.enqueue(seq, cx.waker().clone())
        };
        self.key = Some(key);
        self.interrupts = Some(WaitInterrupts::new(&self.options));
        Ok(key)
    }

    fn resolve_interrupt(&mut self, key: WaiterKey, err: SyncError) -> WaitResult<WriteGuard> {
        let mut wakers = WakerBatch::new();
        let result = {
            let mut st = lock_state(&self.lock.inner.state);
            let result = match st.write_waiters.try_cancel(key) {
                CancelAttempt::Cancelled => Err(err),
                CancelAttempt::AlreadyResolved(Ok(())) => Ok(WriteGuard {
                    inner: self.lock.inner.clone(),
                }),
                CancelAttempt::AlreadyResolved(Err(parked)) => Err(parked),
            };
            // Readers queued behind a cancelled writer become the head cohort.
            st.pump_locked(&mut wakers);
            result
        };
        wake_all(wakers);
        result
    }
}

impl Future for LockWrite {
    type Output = WaitResult<WriteGuard>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "LockWrite polled after completion");

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
                match st.write_waiters.poll_waiter(key, cx.waker()) {
                    WaiterPoll::Resolved(outcome) => {
                        drop(st);
                        this.done = true;
                        this.key = None;
                        return Poll::Ready(outcome.map(|()| WriteGuard {
                            inner: this.lock.inner.clone(),
                        }));
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

impl Drop for LockWrite {
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
            match st.write_waiters.try_cancel(key) {
                CancelAttempt::AlreadyResolved(Ok(())) => {
                    st.release_write_locked(&mut wakers);
                }
                CancelAttempt::Cancelled | CancelAttempt::AlreadyResolved(Err(_)) => {
                    st.pump_locked(&mut wakers);
                }
            }
        }
        wake_all(wakers);
    }
}
