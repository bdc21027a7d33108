// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Bounded producer-consumer pipeline: three producers feed a bounded
//! [`AsyncCollection`], consumers pull under an [`AsyncSemaphore`] concurrency
//! limit, and a [`TaskQueue`] serializes the "commit" step so output order is
//! deterministic per consumer batch.
//!
//! Run with: `cargo run --example bounded_pipeline`

use r3bl_sync::{AsyncCollection, AsyncSemaphore, SyncError, TaskQueue};

#[tokio::main]
async fn main() {
    let jobs: AsyncCollection<u32> = AsyncCollection::bounded(4);
    let limiter = AsyncSemaphore::new(2);
    let committer = TaskQueue::new();

    // Three producers, five items each. The bounded collection pushes back once
    // four items are buffered.
    let mut producers = Vec::new();
    for worker in 0..3_u32 {
        let jobs = jobs.clone();
        producers.push(tokio::spawn(async move {
            for step in 0..5 {
                jobs.add(worker * 100 + step).await.unwrap();
            }
        }));
    }

    // Two consumers drain until the collection reports completion. At most two
    // items are "processed" concurrently thanks to the semaphore; commits run
    // strictly serially on the task queue.
    let mut consumers = Vec::new();
    for consumer in 0..2_u32 {
        let jobs = jobs.clone();
        let limiter = limiter.clone();
        let committer = committer.clone();
        consumers.push(tokio::spawn(async move {
            loop {
                let item = match jobs.take().await {
                    Ok(item) => item,
                    // Completed and drained: this consumer is done.
                    Err(SyncError::InvalidOperation) => break,
                    Err(err) => panic!("unexpected take failure: {err}"),
                };
                let permit = limiter.take().await.unwrap();
                let processed = item * 2;
                drop(permit);

                committer
                    .queue(move || async move {
                        println!("consumer {consumer}: committed {processed}");
                    })
                    .await
                    .unwrap();
            }
        }));
    }

    for producer in producers {
        producer.await.unwrap();
    }
    jobs.complete_adding();

    for consumer in consumers {
        consumer.await.unwrap();
    }
    committer.complete().await.unwrap();
    committer.dispose().await;
    println!("pipeline drained: {} items left", jobs.count());
}
