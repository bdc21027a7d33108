// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The FIFO waiter registry shared by every primitive in this crate. See
//! [`WaiterQueue`] for the protocol.

use std::{collections::VecDeque, task::Waker};

use slab::Slab;
use smallvec::SmallVec;

use super::{SyncError, WaitResult};

/// Wakers collected under a primitive's mutex, to be woken only after unlock. Waking
/// while holding the lock would let a continuation re-enter the primitive and
/// deadlock, and waking one-by-one inline would recurse on deep grant chains.
pub(crate) type WakerBatch = SmallVec<[Waker; 8]>;

/// Stable handle to one waiter slot. The `seq` half guards against slab slot reuse: a
/// key is only honored while the slot it points at still stores the same sequence
/// number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterKey {
    index: usize,
    seq: u64,
}

/// One outstanding wait, owned by its queue.
#[derive(Debug)]
enum Slot<P> {
    /// Pending. The waker is refreshed on every poll of the awaiting future.
    Waiting { seq: u64, waker: Waker },
    /// Resolution won; the outcome is parked here until the awaiting future's next
    /// poll picks it up (or its teardown hands the resource back).
    Granted { seq: u64, outcome: WaitResult<P> },
}

impl<P> Slot<P> {
    fn seq(&self) -> u64 {
        match self {
            Slot::Waiting { seq, .. } | Slot::Granted { seq, .. } => *seq,
        }
    }
}

/// What a cancel attempt found. Whoever transitions the slot owns the waiter, so a
/// canceller that arrives second gets the already-parked outcome instead.
#[derive(Debug)]
pub(crate) enum CancelAttempt<P> {
    /// The waiter was still pending; it is now removed and resolves with the
    /// canceller's error.
    Cancelled,
    /// A grant (or a disposal) got there first. The caller decides what to do with
    /// the outcome: an awaiting future surfaces it, a teardown path releases the
    /// resource it carries.
    AlreadyResolved(WaitResult<P>),
}

/// What a poll of the waiter slot found.
#[derive(Debug)]
pub(crate) enum WaiterPoll<P> {
    /// Still pending; the waker has been refreshed.
    Waiting,
    /// Resolved. The slot is gone; this is the exactly-once delivery of the outcome.
    Resolved(WaitResult<P>),
}

/// FIFO of pending waiters with O(1) enqueue, O(k) grant of k waiters, and lazy
/// unlinking of cancelled entries.
///
/// Structure: a [`Slab`] owns the slots (so cancelled slots are reclaimed and reused
/// immediately, which is what bounds pool growth under enqueue-then-cancel churn) and
/// a [`VecDeque`] of `(index, seq)` pairs carries the FIFO order. Cancellation
/// removes the slot but leaves the FIFO pair behind as a stale entry; grant and
/// peek operations skip stale entries, and a pruning scan compacts the deque when
/// stale entries outnumber live ones.
///
/// Resolution protocol (two steps, mirroring the state machine of the awaiting
/// future):
///
/// ```text
///   grant_next / fail_all            poll_waiter
///  Waiting ───────────────▶ Granted ────────────▶ (slot removed, outcome delivered)
///     │                                                 ▲
///     │ try_cancel ──▶ (slot removed,                   │
///     │                canceller picks the error)       │
///     └── try_cancel finding Granted ───────────────────┘  (AlreadyResolved)
/// ```
///
/// All of this happens under the owning primitive's mutex; the returned wakers are
/// fired by the caller after unlock.
#[derive(Debug)]
pub(crate) struct WaiterQueue<P> {
    slots: Slab<Slot<P>>,
    fifo: VecDeque<(usize, u64)>,
    /// FIFO entries whose slot is gone (cancelled) or reused. Pruned lazily.
    stale: usize,
    /// Live `Waiting` slots. `Granted` slots are no longer "waiting" for telemetry
    /// purposes.
    waiting: usize,
}

/// Stale FIFO entries tolerated beyond the live count before a pruning scan runs.
/// Keeps pruning amortized O(1) while bounding deque growth to a constant factor of
/// the peak concurrent waiter count.
const PRUNE_SLACK: usize = 32;

impl<P> WaiterQueue<P> {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            fifo: VecDeque::new(),
            stale: 0,
            waiting: 0,
        }
    }

    /// Number of pending waiters.
    pub fn len(&self) -> usize {
        self.waiting
    }

    pub fn is_empty(&self) -> bool {
        self.waiting == 0
    }

    /// True when no slot exists at all: no pending waiters *and* no granted
    /// outcomes still awaiting pickup by their futures. This is the safe condition
    /// for tearing down a structure that owns the queue.
    pub fn is_idle(&self) -> bool {
        self.slots.is_empty()
    }

    /// Allocated slot capacity. Exposed as telemetry (e.g.
    /// `AsyncManualResetEvent::capacity`) so tests can assert that churn does not
    /// grow the pool beyond the peak concurrent waiter count.
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Appends a waiter. `seq` comes from the owning primitive's monotonic counter.
    pub fn enqueue(&mut self, seq: u64, waker: Waker) -> WaiterKey {
        let index = self.slots.insert(Slot::Waiting { seq, waker });
        self.fifo.push_back((index, seq));
        self.waiting += 1;
        WaiterKey { index, seq }
    }

    /// Sequence number of the head-most pending waiter, skipping stale entries.
    pub fn front_seq(&mut self) -> Option<u64> {
        loop {
            let (index, seq) = *self.fifo.front()?;
            match self.slots.get(index) {
                Some(Slot::Waiting { seq: slot_seq, .. }) if *slot_seq == seq => {
                    return Some(seq);
                }
                _ => {
                    // Stale: cancelled, or the slot was reused by a later waiter.
                    self.fifo.pop_front();
                    self.stale = self.stale.saturating_sub(1);
                }
            }
        }
    }

    /// Resolves the head-most pending waiter with `outcome` and returns its waker.
    /// Returns [`None`] when no pending waiter exists.
    pub fn grant_next(&mut self, outcome: WaitResult<P>) -> Option<Waker> {
        self.front_seq()?;
        let (index, seq) = self.fifo.pop_front()?;
        let slot = self.slots.get_mut(index)?;
        let Slot::Waiting { waker, .. } = slot else {
            return None;
        };
        let waker = waker.clone();
        *slot = Slot::Granted { seq, outcome };
        self.waiting -= 1;
        Some(waker)
    }

    /// Resolves every pending waiter, in FIFO order, with an outcome produced per
    /// waiter. Wakers are appended to `wakers`.
    pub fn grant_all(
        &mut self,
        mut outcome_fn: impl FnMut() -> WaitResult<P>,
        wakers: &mut WakerBatch,
    ) {
        while let Some(waker) = self.grant_next(outcome_fn()) {
            wakers.push(waker);
        }
    }

    /// Resolves every pending waiter with `err`. Used by disposal.
    pub fn fail_all(&mut self, err: SyncError, wakers: &mut WakerBatch) {
        self.grant_all(|| Err(err), wakers);
    }

    /// Attempts to cancel the waiter at `key`. See [`CancelAttempt`] for the two
    /// races this can lose.
    pub fn try_cancel(&mut self, key: WaiterKey) -> CancelAttempt<P> {
        match self.slots.get(key.index) {
            Some(slot) if slot.seq() == key.seq => {}
            _ => {
                // Nothing to do: by protocol the awaiting future only cancels while
                // its slot exists, so this arm is unreachable in practice.
                debug_assert!(false, "cancel attempt on an unknown waiter");
                return CancelAttempt::Cancelled;
            }
        }
        match self.slots.remove(key.index) {
            Slot::Waiting { .. } => {
                // The FIFO entry stays behind as a stale pair.
                self.stale += 1;
                self.waiting -= 1;
                self.prune_if_needed();
                CancelAttempt::Cancelled
            }
            Slot::Granted { outcome, .. } => CancelAttempt::AlreadyResolved(outcome),
        }
    }

    /// Polls the waiter at `key` on behalf of its future. Refreshes the waker while
    /// pending; removes the slot and delivers the outcome once resolved.
    pub fn poll_waiter(&mut self, key: WaiterKey, current: &Waker) -> WaiterPoll<P> {
        match self.slots.get_mut(key.index) {
            Some(Slot::Waiting { seq, waker }) if *seq == key.seq => {
                waker.clone_from(current);
                WaiterPoll::Waiting
            }
            Some(Slot::Granted { seq, .. }) if *seq == key.seq => {
                let Slot::Granted { outcome, .. } = self.slots.remove(key.index) else {
                    unreachable!("slot variant changed between get_mut and remove");
                };
                WaiterPoll::Resolved(outcome)
            }
            _ => {
                debug_assert!(false, "poll of an unknown waiter");
                WaiterPoll::Resolved(Err(SyncError::Cancelled))
            }
        }
    }

    /// Compacts the FIFO once stale entries outnumber live slots by [`PRUNE_SLACK`].
    fn prune_if_needed(&mut self) {
        if self.stale <= self.slots.len() + PRUNE_SLACK {
            return;
        }
        let slots = &self.slots;
        self.fifo.retain(|(index, seq)| {
            slots.get(*index).is_some_and(|slot| slot.seq() == *seq)
        });
        self.fifo.shrink_to(self.slots.len().max(PRUNE_SLACK));
        self.stale = 0;
        tracing::trace!(
            live = self.slots.len(),
            capacity = self.slots.capacity(),
            "waiter queue pruned stale entries"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::task::{Wake, Waker};

    use super::*;

    struct CountingWake(std::sync::atomic::AtomicUsize);

    impl Wake for CountingWake {
        fn wake(self: std::sync::Arc<Self>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn test_waker() -> Waker {
        Waker::from(std::sync::Arc::new(CountingWake(
            std::sync::atomic::AtomicUsize::new(0),
        )))
    }

    #[test]
    fn grants_resolve_in_fifo_order() {
        let mut queue: WaiterQueue<u32> = WaiterQueue::new();
        let first = queue.enqueue(0, test_waker());
        let second = queue.enqueue(1, test_waker());
        assert_eq!(queue.len(), 2);

        assert!(queue.grant_next(Ok(10)).is_some());
        assert!(queue.grant_next(Ok(20)).is_some());
        assert!(queue.grant_next(Ok(30)).is_none());

        let waker = test_waker();
        match queue.poll_waiter(first, &waker) {
            WaiterPoll::Resolved(Ok(value)) => assert_eq!(value, 10),
            other => panic!("first waiter should hold the first grant: {other:?}"),
        }
        match queue.poll_waiter(second, &waker) {
            WaiterPoll::Resolved(Ok(value)) => assert_eq!(value, 20),
            other => panic!("second waiter should hold the second grant: {other:?}"),
        }
    }

    #[test]
    fn cancelled_waiters_are_skipped_by_grants() {
        let mut queue: WaiterQueue<()> = WaiterQueue::new();
        let first = queue.enqueue(0, test_waker());
        let second = queue.enqueue(1, test_waker());

        assert!(matches!(queue.try_cancel(first), CancelAttempt::Cancelled));
        assert_eq!(queue.len(), 1);

        // The grant must skip the stale head entry and land on the second waiter.
        assert!(queue.grant_next(Ok(())).is_some());
        let waker = test_waker();
        assert!(matches!(
            queue.poll_waiter(second, &waker),
            WaiterPoll::Resolved(Ok(()))
        ));
    }

    #[test]
    fn cancel_after_grant_reports_already_resolved() {
        let mut queue: WaiterQueue<u32> = WaiterQueue::new();
        let key = queue.enqueue(0, test_waker());
        assert!(queue.grant_next(Ok(7)).is_some());

        match queue.try_cancel(key) {
            CancelAttempt::AlreadyResolved(Ok(value)) => assert_eq!(value, 7),
            other => panic!("grant won the race, cancel must observe it: {other:?}"),
        }
    }

    #[test]
    fn fail_all_delivers_the_error_to_every_waiter() {
        let mut queue: WaiterQueue<()> = WaiterQueue::new();
        let keys: Vec<_> = (0..5).map(|seq| queue.enqueue(seq, test_waker())).collect();

        let mut wakers = WakerBatch::new();
        queue.fail_all(SyncError::Disposed, &mut wakers);
        assert_eq!(wakers.len(), 5);
        assert!(queue.is_empty());

        let waker = test_waker();
        for key in keys {
            assert!(matches!(
                queue.poll_waiter(key, &waker),
                WaiterPoll::Resolved(Err(SyncError::Disposed))
            ));
        }
    }

    #[test]
    fn slot_reuse_does_not_alias_old_keys() {
        let mut queue: WaiterQueue<()> = WaiterQueue::new();
        let old = queue.enqueue(0, test_waker());
        assert!(matches!(queue.try_cancel(old), CancelAttempt::Cancelled));

        // The slab reuses index 0 for the next waiter; the stale FIFO pair for `old`
        // must not let a grant land on the wrong generation.
        let fresh = queue.enqueue(1, test_waker());
        assert!(queue.grant_next(Ok(())).is_some());
        let waker = test_waker();
        assert!(matches!(
            queue.poll_waiter(fresh, &waker),
            WaiterPoll::Resolved(Ok(()))
        ));
    }

    #[test]
    fn enqueue_cancel_churn_keeps_capacity_bounded() {
        let mut queue: WaiterQueue<()> = WaiterQueue::new();
        for cycle in 0..10_000_u64 {
            let key = queue.enqueue(cycle, test_waker());
            assert!(matches!(queue.try_cancel(key), CancelAttempt::Cancelled));
        }
        // Peak concurrency was 1, so the pool must stay within the pruning slack, not
        // grow linearly with the 10k cycles.
        assert!(queue.capacity() <= 1 + PRUNE_SLACK);
        assert!(queue.fifo.len() <= 1 + PRUNE_SLACK);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn front_seq_skips_stale_entries() {
        let mut queue: WaiterQueue<()> = WaiterQueue::new();
        assert_eq!(queue.front_seq(), None);
        let first = queue.enqueue(41, test_waker());
        queue.enqueue(42, test_waker());
        assert_eq!(queue.front_seq(), Some(41));

        assert!(matches!(queue.try_cancel(first), CancelAttempt::Cancelled));
        assert_eq!(queue.front_seq(), Some(42));
    }

    #[test]
    fn poll_refreshes_the_stored_waker() {
        let mut queue: WaiterQueue<()> = WaiterQueue::new();
        let key = queue.enqueue(0, test_waker());

        let replacement = test_waker();
        assert!(matches!(
            queue.poll_waiter(key, &replacement),
            WaiterPoll::Waiting
        ));
        assert!(queue.grant_next(Ok(())).is_some());
    }
}
