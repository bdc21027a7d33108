// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Per-key async mutual exclusion with lazily allocated keys. See [`AsyncKeyedLock`]
//! for details.

use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use crate::engine::{
    CancelAttempt, Dispose, DisposeTarget, Lifecycle, StdMutex, SyncError, WaitInterrupts,
    WaitOptions, WaitResult, WaiterKey, WaiterPoll, WaiterQueue, WakerBatch, lock_state,
    wake_all,
};

/// A keyed lock: mutual exclusion per key, where keys compare by their natural
/// equality and entries are allocated on first contact and torn down when the last
/// holder and waiter for that key are gone.
///
/// The teardown/re-create race between a release and the next acquire on the same
/// key is resolved by doing both under the one map mutex: a waiter can never enqueue
/// on an entry that is being removed.
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use r3bl_sync::AsyncKeyedLock;
///
/// let lock: AsyncKeyedLock<String> = AsyncKeyedLock::new();
/// let guard = lock.acquire("alpha".to_string()).await.unwrap();
/// assert!(lock.try_acquire("alpha".to_string()).is_none());
/// assert!(lock.try_acquire("beta".to_string()).is_some());
/// drop(guard);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AsyncKeyedLock<K: Eq + Hash + Clone> {
    inner: Arc<KeyedInner<K>>,
}

#[derive(Debug)]
struct KeyedInner<K: Eq + Hash + Clone> {
    state: StdMutex<KeyedState<K>>,
}

#[derive(Debug)]
struct KeyedState<K: Eq + Hash + Clone> {
    entries: HashMap<K, KeyEntry>,
    next_seq: u64,
    /// Keys currently held (guards alive, or grants parked awaiting pickup).
    outstanding: u32,
    lifecycle: Lifecycle,
}

#[derive(Debug)]
struct KeyEntry {
    held: bool,
    waiters: WaiterQueue<()>,
}

impl KeyEntry {
    fn new() -> Self {
        Self {
            held: false,
            waiters: WaiterQueue::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedState<K> {
    /// The key comes back. Transfer it to the head waiter of that key if one is
    /// pending, else clear `held` and tear the entry down when nothing refers to it.
    fn release_locked(&mut self, key: &K, wakers: &mut WakerBatch) {
        let Some(entry) = self.entries.get_mut(key) else {
            debug_assert!(false, "release of a key that holds no entry");
            return;
        };
        if let Some(waker) = entry.waiters.grant_next(Ok(())) {
            // Transfer: `held` stays true, `outstanding` is unchanged.
            wakers.push(waker);
            return;
        }
        entry.held = false;
        if entry.waiters.is_idle() {
            self.entries.remove(key);
        }
        self.outstanding -= 1;
        let quiescent = self.outstanding == 0;
        self.lifecycle.settle(quiescent, wakers);
    }

    /// Entry cleanup after a cancelled wait: a queue that went empty on a key nobody
    /// holds means the entry is garbage.
    fn collect_if_idle(&mut self, key: &K) {
        if let Some(entry) = self.entries.get(key) {
            if !entry.held && entry.waiters.is_idle() {
                self.entries.remove(key);
            }
        }
    }
}

impl<K: Eq + Hash + Clone> AsyncKeyedLock<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(KeyedInner {
                state: StdMutex::new(KeyedState {
                    entries: HashMap::new(),
                    next_seq: 0,
                    outstanding: 0,
                    lifecycle: Lifecycle::new(),
                }),
            }),
        }
    }

    /// Acquires the lock for `key`, suspending FIFO-fair while another holder has
    /// it. Distinct keys never contend.
    pub fn acquire(&self, key: K) -> Acquire<K> {
        self.acquire_with(key, WaitOptions::default())
    }

    /// [`Self::acquire`] with a cancellation token and/or deadline.
    pub fn acquire_with(&self, key: K, options: WaitOptions) -> Acquire<K> {
        Acquire {
            lock: self.clone(),
            key,
            options,
            interrupts: None,
            waiter: None,
            done: false,
        }
    }

    /// Non-suspending acquire.
    pub fn try_acquire(&self, key: K) -> Option<KeyGuard<K>> {
        let mut st = lock_state(&self.inner.state);
        if !st.lifecycle.is_active() {
            return None;
        }
        let entry = st.entries.entry(key.clone()).or_insert_with(KeyEntry::new);
        if entry.held {
            return None;
        }
        entry.held = true;
        st.outstanding += 1;
        Some(KeyGuard {
            inner: self.inner.clone(),
            key,
        })
    }

    /// Snapshot of the keys currently held. Order is unspecified.
    pub fn keys_held(&self) -> Vec<K> {
        let st = lock_state(&self.inner.state);
        st.entries
            .iter()
            .filter(|(_, entry)| entry.held)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn is_disposed(&self) -> bool {
        lock_state(&self.inner.state).lifecycle.is_disposed()
    }

    /// Starts disposal: pending waiters on every key fail with
    /// [`SyncError::Disposed`], new acquires are rejected, and guards already
    /// outstanding remain valid until dropped. The returned future resolves once the
    /// last guard comes back.
    pub fn dispose(&self) -> Dispose<AsyncKeyedLock<K>> {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            if st.lifecycle.is_active() {
                tracing::debug!(
                    keys = st.entries.len(),
                    outstanding = st.outstanding,
                    "AsyncKeyedLock: dispose initiated"
                );
                st.lifecycle.begin_dispose();
                for entry in st.entries.values_mut() {
                    entry.waiters.fail_all(SyncError::Disposed, &mut wakers);
                }
                st.entries.retain(|_, entry| entry.held);
            }
            let quiescent = st.outstanding == 0;
            st.lifecycle.settle(quiescent, &mut wakers);
        }
        wake_all(wakers);
        Dispose::new(self.clone())
    }
}

impl<K: Eq + Hash + Clone> Default for AsyncKeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> DisposeTarget for AsyncKeyedLock<K> {
    fn poll_dispose(&self, cx: &mut Context<'_>) -> Poll<()> {
        lock_state(&self.inner.state).lifecycle.poll_disposed(cx)
    }
}

/// RAII receipt of one key. Dropping it releases the key, transferring it to the
/// head waiter if one is pending.
#[derive(Debug)]
pub struct KeyGuard<K: Eq + Hash + Clone> {
    inner: Arc<KeyedInner<K>>,
    key: K,
}

impl<K: Eq + Hash + Clone> KeyGuard<K> {
    /// The key this guard holds.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            st.release_locked(&self.key, &mut wakers);
        }
        wake_all(wakers);
    }
}

/// Future returned by [`AsyncKeyedLock::acquire`].
#[derive(Debug)]
pub struct Acquire<K: Eq + Hash + Clone> {
    lock: AsyncKeyedLock<K>,
    key: K,
    options: WaitOptions,
    interrupts: Option<WaitInterrupts>,
    waiter: Option<WaiterKey>,
    done: bool,
}

impl<K: Eq + Hash + Clone> Acquire<K> {
    fn guard(&self) -> KeyGuard<K> {
        KeyGuard {
            inner: self.lock.inner.clone(),
            key: self.key.clone(),
        }
    }

    fn poll_first(&mut self, cx: &mut Context<'_>) -> Result<WaiterKey, WaitResult<KeyGuard<K>>> {
        if self.options.cancel_requested() {
            return Err(Err(SyncError::Cancelled));
        }
        let waiter = {
            let mut st = lock_state(&self.lock.inner.state);
            if !st.lifecycle.is_active() {
                return Err(Err(SyncError::Disposed));
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            let entry = st
                .entries
                .entry(self.key.clone())
                .or_insert_with(KeyEntry::new);
            if !entry.held {
                entry.held = true;
                st.outstanding += 1;
                return Err(Ok(self.guard()));
            }
            entry.waiters.enqueue(seq, cx.waker().clone())
        };
        self.waiter = Some(waiter);
        self.interrupts = Some(WaitInterrupts::new(&self.options));
        Ok(waiter)
    }

    fn resolve_interrupt(&mut self, waiter: WaiterKey, err: SyncError) -> WaitResult<KeyGuard<K>> {
        let mut st = lock_state(&self.lock.inner.state);
        let attempt = match st.entries.get_mut(&self.key) {
            Some(entry) => entry.waiters.try_cancel(waiter),
            None => CancelAttempt::Cancelled,
        };
        match attempt {
            CancelAttempt::Cancelled => {
                st.collect_if_idle(&self.key);
                Err(err)
            }
            CancelAttempt::AlreadyResolved(Ok(())) => Ok(self.guard()),
            CancelAttempt::AlreadyResolved(Err(parked)) => {
                st.collect_if_idle(&self.key);
                Err(parked)
            }
        }
    }
}

impl<K: Eq + Hash + Clone> Future for Acquire<K>
where
    K: Unpin,
{
    type Output = WaitResult<KeyGuard<K>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "Acquire polled after completion");

        let waiter = match this.waiter {
            None => match this.poll_first(cx) {
                Err(result) => {
                    this.done = true;
                    return Poll::Ready(result);
                }
                Ok(waiter) => waiter,
            },
            Some(waiter) => {
                let mut st = lock_state(&this.lock.inner.state);
                let polled = st
                    .entries
                    .get_mut(&this.key)
                    .map(|entry| entry.waiters.poll_waiter(waiter, cx.waker()));
                match polled {
                    Some(WaiterPoll::Resolved(outcome)) => {
                        if outcome.is_err() {
                            // Last slot gone: the entry may now be garbage.
                            st.collect_if_idle(&this.key);
                        }
                        drop(st);
                        this.done = true;
                        this.waiter = None;
                        return Poll::Ready(outcome.map(|()| this.guard()));
                    }
                    Some(WaiterPoll::Waiting) => waiter,
                    None => {
                        drop(st);
                        debug_assert!(false, "waiter outlived its key entry");
                        this.done = true;
                        this.waiter = None;
                        return Poll::Ready(Err(SyncError::Disposed));
                    }
                }
            }
        };

        match this.interrupts.as_mut().and_then(|i| i.poll_interrupt(cx)) {
            Some(err) => {
                this.done = true;
                this.waiter = None;
                Poll::Ready(this.resolve_interrupt(waiter, err))
            }
            None => Poll::Pending,
        }
    }
}

impl<K: Eq + Hash + Clone> Drop for Acquire<K> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(waiter) = self.waiter else {
            return;
        };
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.lock.inner.state);
            let attempt = match st.entries.get_mut(&self.key) {
                Some(entry) => entry.waiters.try_cancel(waiter),
                None => CancelAttempt::Cancelled,
            };
            match attempt {
                CancelAttempt::AlreadyResolved(Ok(())) => {
                    // Granted but never observed: the key goes back in.
                    st.release_locked(&self.key, &mut wakers);
                }
                CancelAttempt::Cancelled | CancelAttempt::AlreadyResolved(Err(_)) => {
                    st.collect_if_idle(&self.key);
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
    async fn same_key_excludes_distinct_keys_do_not() {
        let lock: AsyncKeyedLock<u32> = AsyncKeyedLock::new();

        let alpha = lock.acquire(1).await.unwrap();
        let mut contended = lock.acquire(1);
        assert!((&mut contended).now_or_never().is_none());

        // A different key is free.
        let beta = lock.acquire(2).await.unwrap();
        assert_eq!(beta.key(), &2);
        drop(beta);

        drop(alpha);
        let guard = contended.await.unwrap();
        assert_eq!(guard.key(), &1);
    }

    #[tokio::test]
    async fn release_transfers_to_the_head_waiter() {
        let lock: AsyncKeyedLock<&str> = AsyncKeyedLock::new();

        let holder = lock.acquire("key").await.unwrap();
        let mut first = lock.acquire("key");
        let mut second = lock.acquire("key");
        assert!((&mut first).now_or_never().is_none());
        assert!((&mut second).now_or_never().is_none());

        drop(holder);
        assert!((&mut second).now_or_never().is_none());
        let guard = first.await.unwrap();

        drop(guard);
        assert!(second.await.is_ok());
    }

    #[tokio::test]
    async fn keys_held_reflects_live_guards_only() {
        let lock: AsyncKeyedLock<String> = AsyncKeyedLock::new();
        assert!(lock.keys_held().is_empty());

        let alpha = lock.acquire("alpha".to_string()).await.unwrap();
        let beta = lock.acquire("beta".to_string()).await.unwrap();
        let mut held = lock.keys_held();
        held.sort();
        assert_eq!(held, ["alpha", "beta"]);

        drop(alpha);
        assert_eq!(lock.keys_held(), ["beta"]);
        drop(beta);
        assert!(lock.keys_held().is_empty());
    }

    #[tokio::test]
    async fn entry_is_torn_down_and_recreated_across_acquires() {
        let lock: AsyncKeyedLock<u64> = AsyncKeyedLock::new();

        let guard = lock.acquire(9).await.unwrap();
        drop(guard);
        // The entry is gone; the next acquire recreates it from scratch.
        assert!(lock.keys_held().is_empty());
        let guard = lock.acquire(9).await.unwrap();
        assert_eq!(lock.keys_held(), [9]);
        drop(guard);
    }

    #[tokio::test]
    async fn cancelled_waiter_never_seizes_the_key() {
        let lock: AsyncKeyedLock<u32> = AsyncKeyedLock::new();
        let holder = lock.acquire(5).await.unwrap();

        let token = CancellationToken::new();
        let mut waiting = lock.acquire_with(5, WaitOptions::cancel_token(token.clone()));
        assert!((&mut waiting).now_or_never().is_none());

        token.cancel();
        assert_eq!(waiting.await.unwrap_err(), SyncError::Cancelled);

        drop(holder);
        // The key is free and its entry cleaned up.
        assert!(lock.keys_held().is_empty());
        assert!(lock.try_acquire(5).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_with_deadline_times_out() {
        let lock: AsyncKeyedLock<u32> = AsyncKeyedLock::new();
        let _holder = lock.acquire(1).await.unwrap();

        let result = lock
            .acquire_with(1, WaitOptions::timeout(Duration::from_millis(40)))
            .await;
        assert_eq!(result.unwrap_err(), SyncError::Timeout);
    }

    #[tokio::test]
    async fn dispose_fails_waiters_but_honors_outstanding_guards() {
        let lock: AsyncKeyedLock<u32> = AsyncKeyedLock::new();
        let holder = lock.acquire(1).await.unwrap();

        let mut waiting = lock.acquire(1);
        assert!((&mut waiting).now_or_never().is_none());

        let mut disposal = lock.dispose();
        assert_eq!(waiting.await.unwrap_err(), SyncError::Disposed);
        assert_eq!(lock.acquire(2).await.unwrap_err(), SyncError::Disposed);
        assert!(lock.try_acquire(3).is_none());
        assert!((&mut disposal).now_or_never().is_none());

        drop(holder);
        disposal.await;
        assert!(lock.is_disposed());
    }
}
