// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Cancellation and deadlines on a contended lock: one task holds the write side,
//! another bounds its wait with a timeout, a third ties its wait to a
//! `CancellationToken`.
//!
//! Run with: `cargo run --example cancellation`

use std::time::Duration;

use r3bl_sync::{AsyncReadWriteLock, SyncError, WaitOptions};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let lock = AsyncReadWriteLock::new();
    let writer = lock.write().await.unwrap();

    // A bounded wait fails with Timeout instead of hanging.
    let timed_out = lock
        .read_with(WaitOptions::timeout(Duration::from_millis(50)))
        .await;
    assert_eq!(timed_out.unwrap_err(), SyncError::Timeout);
    println!("bounded read wait timed out as expected");

    // A token-driven wait fails with Cancelled the moment the token fires.
    let token = CancellationToken::new();
    let waiting = tokio::spawn({
        let lock = lock.clone();
        let token = token.clone();
        async move {
            lock.read_with(WaitOptions::cancel_token(token))
                .await
                .unwrap_err()
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();
    assert_eq!(waiting.await.unwrap(), SyncError::Cancelled);
    println!("token-driven read wait reported Cancelled");

    // Neither failed wait consumed anything: releasing the writer leaves a clean
    // lock behind.
    drop(writer);
    assert!(!lock.is_writing());
    assert_eq!(lock.waiting_readers(), 0);
    let disposal = lock.dispose();
    disposal.await;
    println!("lock drained and disposed");
}
