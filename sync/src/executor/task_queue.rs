// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Serial async executor: submissions run strictly in order, one at a time. See
//! [`TaskQueue`] for details.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use futures_util::{FutureExt, future::BoxFuture};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::engine::{
    Dispose, DisposeTarget, Lifecycle, StdMutex, SyncError, WaitOptions, WaitResult,
    WakerBatch, lock_state, wake_all,
};

/// Whether the dispatcher actually runs a job or resolves it unrun.
enum JobMode {
    Run,
    Abandon,
}

type BoxedJob = Box<dyn FnOnce(JobMode) -> BoxFuture<'static, ()> + Send>;

enum QueueItem {
    Run(BoxedJob),
    Shutdown,
}

/// A serial executor: callbacks submitted via [`queue`] / [`queue_task`] run
/// strictly in submission order, and the k+1-th callback starts only after the k-th's
/// future has finished - by success, failure, cancellation, or panic (a panicking
/// callback is caught, logged, and surfaced to its submitter; the queue keeps
/// going).
///
/// A cancellation token passed via [`queue_task_with`] cancels the *wait to start*
/// only: once the callback begins it observes the same token itself and decides what
/// to do with it.
///
/// [`complete`] returns an awaitable for the current tail; later submissions form a
/// new tail behind it.
///
/// Must be created inside a Tokio runtime - the dispatcher is a spawned task.
///
/// [`queue`]: Self::queue
/// [`queue_task`]: Self::queue_task
/// [`queue_task_with`]: Self::queue_task_with
/// [`complete`]: Self::complete
#[derive(Debug, Clone)]
pub struct TaskQueue {
    inner: Arc<TaskQueueInner>,
}

struct TaskQueueInner {
    tx: mpsc::UnboundedSender<QueueItem>,
    state: StdMutex<QueueState>,
}

impl std::fmt::Debug for TaskQueueInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock_state(&self.state);
        f.debug_struct("TaskQueueInner")
            .field("pending", &st.pending)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct QueueState {
    /// Jobs submitted and not yet finished (running or queued behind the runner).
    pending: usize,
    lifecycle: Lifecycle,
}

impl TaskQueue {
    /// Creates the queue and spawns its dispatcher task.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(TaskQueueInner {
            tx,
            state: StdMutex::new(QueueState {
                pending: 0,
                lifecycle: Lifecycle::new(),
            }),
        });
        tokio::spawn(Self::dispatch(rx, Arc::downgrade(&inner)));
        Self { inner }
    }

    /// One job at a time, strictly in arrival order. Holds only a weak handle so a
    /// queue dropped without dispose lets the dispatcher wind down once the channel
    /// closes.
    async fn dispatch(mut rx: mpsc::UnboundedReceiver<QueueItem>, inner: Weak<TaskQueueInner>) {
        while let Some(item) = rx.recv().await {
            match item {
                QueueItem::Run(job) => {
                    let abandoned = match inner.upgrade() {
                        Some(strong) => !lock_state(&strong.state).lifecycle.is_active(),
                        None => true,
                    };
                    let mode = if abandoned { JobMode::Abandon } else { JobMode::Run };
                    job(mode).await;
                    if let Some(strong) = inner.upgrade() {
                        lock_state(&strong.state).pending -= 1;
                    }
                }
                QueueItem::Shutdown => break,
            }
        }
        // Disposal (or queue drop): resolve whatever is still queued without
        // running it.
        rx.close();
        while let Ok(item) = rx.try_recv() {
            if let QueueItem::Run(job) = item {
                job(JobMode::Abandon).await;
            }
        }
        if let Some(strong) = inner.upgrade() {
            let mut wakers = WakerBatch::new();
            {
                let mut st = lock_state(&strong.state);
                st.pending = 0;
                st.lifecycle.settle(true, &mut wakers);
            }
            wake_all(wakers);
            tracing::debug!("TaskQueue: dispatcher wound down");
        }
    }

    /// Submits a unit action. The returned [`QueuedTask`] resolves once the action
    /// has run (or reports why it never will). Dropping it does not cancel the
    /// action - the queue owns it from here.
    pub fn queue<F, Fut>(&self, action: F) -> QueuedTask<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.queue_task(action)
    }

    /// Submits a value-returning callback; the returned [`QueuedTask`] resolves
    /// with its output.
    pub fn queue_task<F, Fut, T>(&self, callback: F) -> QueuedTask<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.queue_task_with(WaitOptions::default(), move |_token| callback())
    }

    /// [`Self::queue_task`] with wait options. The token cancels the wait-to-start
    /// only; a callback that has begun receives the token as its argument and
    /// observes cancellation through it. A deadline likewise only bounds the wait
    /// for the queue to reach this submission.
    pub fn queue_task_with<F, Fut, T>(&self, options: WaitOptions, callback: F) -> QueuedTask<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel::<WaitResult<T>>();
        {
            let mut st = lock_state(&self.inner.state);
            if !st.lifecycle.is_active() {
                let _ = result_tx.send(Err(SyncError::Disposed));
                return QueuedTask { rx: result_rx };
            }
            st.pending += 1;
        }

        let token = options.cancel_token.clone().unwrap_or_default();
        let deadline = options.deadline;
        let job: BoxedJob = Box::new(move |mode| {
            Box::pin(async move {
                match mode {
                    JobMode::Abandon => {
                        let _ = result_tx.send(Err(SyncError::Disposed));
                    }
                    JobMode::Run => {
                        if token.is_cancelled() {
                            let _ = result_tx.send(Err(SyncError::Cancelled));
                            return;
                        }
                        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                            let _ = result_tx.send(Err(SyncError::Timeout));
                            return;
                        }
                        let outcome =
                            AssertUnwindSafe(async move { callback(token).await })
                                .catch_unwind()
                                .await;
                        match outcome {
                            Ok(value) => {
                                let _ = result_tx.send(Ok(value));
                            }
                            Err(_) => {
                                tracing::warn!("TaskQueue: queued callback panicked");
                                // Dropping the sender surfaces Cancelled to the
                                // submitter; the queue itself keeps going.
                            }
                        }
                    }
                }
            })
        });

        if self.inner.tx.send(QueueItem::Run(job)).is_err() {
            // The dispatcher is gone; the job closure (and its sender) was dropped
            // by the failed send, so the receiver already reads as terminated.
            lock_state(&self.inner.state).pending -= 1;
        }
        QueuedTask { rx: result_rx }
    }

    /// An awaitable for the queue's current tail: resolves once everything
    /// submitted so far has finished. Submissions made afterwards form a new tail
    /// behind this point.
    pub fn complete(&self) -> QueuedTask<()> {
        self.queue_task(|| async {})
    }

    /// Jobs submitted and not yet finished.
    pub fn pending_count(&self) -> usize {
        lock_state(&self.inner.state).pending
    }

    pub fn is_disposed(&self) -> bool {
        lock_state(&self.inner.state).lifecycle.is_disposed()
    }

    /// Starts disposal: the currently running callback finishes, every job queued
    /// behind it resolves with [`SyncError::Disposed`] without running, and new
    /// submissions are rejected. The returned future resolves once the dispatcher
    /// has wound down.
    pub fn dispose(&self) -> Dispose<TaskQueue> {
        let initiate = {
            let mut st = lock_state(&self.inner.state);
            if st.lifecycle.is_active() {
                tracing::debug!(pending = st.pending, "TaskQueue: dispose initiated");
                st.lifecycle.begin_dispose();
                true
            } else {
                false
            }
        };
        if initiate {
            let _ = self.inner.tx.send(QueueItem::Shutdown);
        }
        Dispose::new(self.clone())
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DisposeTarget for TaskQueue {
    fn poll_dispose(&self, cx: &mut Context<'_>) -> Poll<()> {
        lock_state(&self.inner.state).lifecycle.poll_disposed(cx)
    }
}

/// Future returned by every submission to a [`TaskQueue`]. Resolves with the
/// callback's output, or with [`SyncError::Disposed`] (never started),
/// [`SyncError::Cancelled`] (token fired before start, or the callback panicked),
/// or [`SyncError::Timeout`] (deadline passed before start).
#[derive(Debug)]
pub struct QueuedTask<T> {
    rx: oneshot::Receiver<WaitResult<T>>,
}

impl<T> Future for QueuedTask<T> {
    type Output = WaitResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|received| {
            match received {
                Ok(outcome) => outcome,
                // Sender dropped without sending: the callback panicked.
                Err(_) => Err(SyncError::Cancelled),
            }
        })
    }
}
