// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Stack-safety and pool-stability stress: deep grant chains must resolve
//! iteratively, and waiter pools must not grow with churn.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use futures_util::FutureExt;
use r3bl_sync::{AsyncCounter, AsyncManualResetEvent, AsyncReadWriteLock, AsyncSemaphore};
use rand::Rng;

const CHAIN_DEPTH: usize = 40_000;

/// Each release grants exactly the next waiter, so this drives a 40k-deep transfer
/// chain through the engine. Inline (recursive) resolution would blow the stack
/// long before the chain ends.
#[tokio::test]
async fn semaphore_resolves_a_40k_transfer_chain() {
    let semaphore = AsyncSemaphore::new(1);
    let held = semaphore.take().await.unwrap();

    let mut chain: Vec<_> = (0..CHAIN_DEPTH).map(|_| semaphore.take()).collect();
    for take in &mut chain {
        assert!(take.now_or_never().is_none());
    }
    assert_eq!(semaphore.waiting_count(), CHAIN_DEPTH);

    drop(held);
    for take in chain {
        let permit = take.await.unwrap();
        drop(permit);
    }
    assert_eq!(semaphore.waiting_count(), 0);
    assert_eq!(semaphore.current_count(), 1);
}

/// A single bulk add drains 40k waiters in one pumping pass; the engine must wake
/// them in a loop, not by recursing from one resolution into the next.
#[tokio::test]
async fn counter_drains_40k_waiters_from_one_bulk_add() {
    let counter = AsyncCounter::new(0);

    let mut waiters: Vec<_> = (0..CHAIN_DEPTH).map(|_| counter.decrement()).collect();
    for waiter in &mut waiters {
        assert!(waiter.now_or_never().is_none());
    }
    assert_eq!(counter.waiting_count(), CHAIN_DEPTH);

    counter.add(CHAIN_DEPTH as u64).unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(counter.current_count(), 0);
    assert_eq!(counter.waiting_count(), 0);
}

/// Alternating read/write waiters force a mode flip per release, the worst case for
/// the admission pump.
#[tokio::test]
async fn rw_lock_survives_a_deep_alternating_chain() {
    let lock = AsyncReadWriteLock::new();
    let holder = lock.write().await.unwrap();

    let mut readers = Vec::new();
    let mut writers = Vec::new();
    for _ in 0..5_000 {
        let mut read = lock.read();
        assert!((&mut read).now_or_never().is_none());
        readers.push(read);
        let mut write = lock.write();
        assert!((&mut write).now_or_never().is_none());
        writers.push(write);
    }

    drop(holder);
    for (read, write) in readers.into_iter().zip(writers) {
        let read_guard = read.await.unwrap();
        drop(read_guard);
        let write_guard = write.await.unwrap();
        drop(write_guard);
    }
    assert!(!lock.is_reading());
    assert!(!lock.is_writing());
}

/// 10,000 register-then-abandon cycles: the waiter pool must reuse its slots, so
/// the observable capacity stays bounded by the peak concurrent waiter count plus
/// a constant pruning slack - not by the cycle count.
#[tokio::test]
async fn manual_reset_event_pool_stays_bounded_under_churn() {
    let event = AsyncManualResetEvent::new(false);

    // Establish a peak of 8 concurrent waiters, then abandon them.
    let mut peak: Vec<_> = (0..8).map(|_| event.wait()).collect();
    for wait in &mut peak {
        assert!(wait.now_or_never().is_none());
    }
    drop(peak);

    for _ in 0..10_000 {
        let mut wait = event.wait();
        assert!((&mut wait).now_or_never().is_none());
        drop(wait);
    }

    assert_eq!(event.waiting_count(), 0);
    assert!(
        event.capacity() <= 8 + 64,
        "pool capacity {} grew past the peak-plus-slack bound",
        event.capacity()
    );
}

/// Mutual exclusion under real concurrency: with 64 tasks hammering a 4-permit
/// semaphore, the holder count must never exceed 4.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn semaphore_never_over_admits_under_contention() {
    let semaphore = AsyncSemaphore::new(4);
    let holders = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let semaphore = semaphore.clone();
        let holders = holders.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                let permit = semaphore.take().await.unwrap();
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                // Hold for a randomized number of scheduler turns to vary the
                // interleavings from run to run.
                let turns = rand::rng().random_range(0..3);
                for _ in 0..=turns {
                    tokio::task::yield_now().await;
                }
                holders.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert_eq!(semaphore.current_count(), 4);
    assert_eq!(semaphore.waiting_count(), 0);
}
