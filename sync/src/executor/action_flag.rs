// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Coalescing trigger with optional debounce. See [`ActionFlag`] for details.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::{FutureExt, future::BoxFuture};
use tokio::sync::oneshot;

use crate::engine::{
    Dispose, DisposeTarget, Lifecycle, StdMutex, SyncError, WaitResult, WakerBatch,
    lock_state, wake_all,
};

type FlagCallback = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Where the flag is in its trigger cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagPhase {
    Idle,
    /// A run is scheduled (debounce pending or about to start).
    Scheduled,
    /// The callback is executing right now.
    Running,
}

/// A coalescing trigger around a user-supplied async callback: arbitrarily many
/// [`set`] calls collapse into at most one pending run.
///
/// - At most one invocation of the callback is in flight at a time.
/// - [`set`] while idle schedules a run after the debounce `delay` (zero means
///   "soon"); [`set`] while a run executes marks the flag dirty so one more run
///   starts immediately afterwards - with no second debounce.
/// - The dirty bit clears at the moment the callback is invoked, so a `set` during
///   execution is never lost.
/// - [`set_and_wait`] resolves after the run that observed that particular set;
///   concurrent `set_and_wait` calls before a run share it.
///
/// Must be used inside a Tokio runtime - runs are spawned tasks.
///
/// [`set`]: Self::set
/// [`set_and_wait`]: Self::set_and_wait
#[derive(Clone)]
pub struct ActionFlag {
    inner: Arc<ActionFlagInner>,
}

impl std::fmt::Debug for ActionFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock_state(&self.inner.state);
        f.debug_struct("ActionFlag")
            .field("phase", &st.phase)
            .field("dirty", &st.dirty)
            .field("delay", &self.inner.delay)
            .finish_non_exhaustive()
    }
}

struct ActionFlagInner {
    callback: FlagCallback,
    delay: Duration,
    state: StdMutex<FlagState>,
}

struct FlagState {
    phase: FlagPhase,
    dirty: bool,
    /// Waiters for the next run to finish. Taken at the moment a run begins.
    pending: Vec<oneshot::Sender<()>>,
    lifecycle: Lifecycle,
}

impl ActionFlag {
    /// Wraps `callback` with no debounce: a set while idle runs it "soon".
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_delay(callback, Duration::ZERO)
    }

    /// Wraps `callback` with a debounce `delay`: a set while idle runs it once
    /// `delay` has elapsed. Re-runs triggered by a dirty flag skip the debounce.
    pub fn with_delay<F, Fut>(callback: F, delay: Duration) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(ActionFlagInner {
                callback: Box::new(move || callback().boxed()),
                delay,
                state: StdMutex::new(FlagState {
                    phase: FlagPhase::Idle,
                    dirty: false,
                    pending: Vec::new(),
                    lifecycle: Lifecycle::new(),
                }),
            }),
        }
    }

    /// Triggers a run. Coalesces with an already-scheduled run; marks the flag
    /// dirty when a run is mid-flight. A no-op on a disposed flag.
    pub fn set(&self) {
        let spawn_run = {
            let mut st = lock_state(&self.inner.state);
            if !st.lifecycle.is_active() {
                return;
            }
            st.mark_locked()
        };
        if spawn_run {
            tokio::spawn(run_loop(self.inner.clone()));
        }
    }

    /// [`Self::set`], plus an awaitable that resolves once the run observing this
    /// set has finished. Two concurrent calls before a run share one run and
    /// resolve together.
    pub fn set_and_wait(&self) -> SetAndWait {
        let (tx, rx) = oneshot::channel();
        let spawn_run = {
            let mut st = lock_state(&self.inner.state);
            if !st.lifecycle.is_active() {
                // Dropping the sender surfaces Disposed to the awaitable.
                false
            } else {
                st.pending.push(tx);
                st.mark_locked()
            }
        };
        if spawn_run {
            tokio::spawn(run_loop(self.inner.clone()));
        }
        SetAndWait { rx }
    }

    /// True while the callback is executing.
    pub fn is_running(&self) -> bool {
        lock_state(&self.inner.state).phase == FlagPhase::Running
    }

    pub fn is_disposed(&self) -> bool {
        lock_state(&self.inner.state).lifecycle.is_disposed()
    }

    /// Starts disposal: pending [`Self::set_and_wait`] awaitables fail with
    /// [`SyncError::Disposed`], further sets are ignored, and the returned future
    /// resolves once no run is scheduled or in flight (a scheduled run is skipped;
    /// a running one finishes first).
    pub fn dispose(&self) -> Dispose<ActionFlag> {
        let mut wakers = WakerBatch::new();
        {
            let mut st = lock_state(&self.inner.state);
            if st.lifecycle.is_active() {
                tracing::debug!(phase = ?st.phase, "ActionFlag: dispose initiated");
                st.lifecycle.begin_dispose();
                st.pending.clear();
            }
            if st.phase == FlagPhase::Idle {
                st.lifecycle.settle(true, &mut wakers);
            }
            // Scheduled / Running: the run loop settles on its way out.
        }
        wake_all(wakers);
        Dispose::new(self.clone())
    }
}

impl FlagState {
    /// Records a trigger. Returns true when the caller must spawn the run loop.
    fn mark_locked(&mut self) -> bool {
        match self.phase {
            FlagPhase::Idle => {
                self.phase = FlagPhase::Scheduled;
                true
            }
            FlagPhase::Scheduled => false,
            FlagPhase::Running => {
                self.dirty = true;
                false
            }
        }
    }
}

impl DisposeTarget for ActionFlag {
    fn poll_dispose(&self, cx: &mut Context<'_>) -> Poll<()> {
        lock_state(&self.inner.state).lifecycle.poll_disposed(cx)
    }
}

/// One scheduled trigger: debounce, then run the callback, repeating immediately
/// while the dirty bit keeps getting set.
async fn run_loop(inner: Arc<ActionFlagInner>) {
    if !inner.delay.is_zero() {
        tokio::time::sleep(inner.delay).await;
    }
    loop {
        let waiters = {
            let mut st = lock_state(&inner.state);
            if !st.lifecycle.is_active() {
                st.phase = FlagPhase::Idle;
                st.pending.clear();
                let mut wakers = WakerBatch::new();
                st.lifecycle.settle(true, &mut wakers);
                drop(st);
                wake_all(wakers);
                return;
            }
            st.phase = FlagPhase::Running;
            // The dirty bit clears at the moment the callback is invoked: a set
            // arriving during execution re-arms it and earns another run.
            st.dirty = false;
            std::mem::take(&mut st.pending)
        };

        if AssertUnwindSafe((inner.callback)()).catch_unwind().await.is_err() {
            tracing::warn!("ActionFlag: callback panicked");
        }
        for waiter in waiters {
            let _ = waiter.send(());
        }

        {
            let mut st = lock_state(&inner.state);
            if st.dirty && st.lifecycle.is_active() {
                // Re-run immediately; no second debounce.
                st.phase = FlagPhase::Scheduled;
                continue;
            }
            st.phase = FlagPhase::Idle;
            if !st.lifecycle.is_active() {
                let mut wakers = WakerBatch::new();
                st.pending.clear();
                st.lifecycle.settle(true, &mut wakers);
                drop(st);
                wake_all(wakers);
            }
            return;
        }
    }
}

/// Future returned by [`ActionFlag::set_and_wait`].
#[derive(Debug)]
pub struct SetAndWait {
    rx: oneshot::Receiver<()>,
}

impl Future for SetAndWait {
    type Output = WaitResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|received| {
            match received {
                Ok(()) => Ok(()),
                // Sender dropped without firing: the flag was disposed first.
                Err(_) => Err(SyncError::Disposed),
            }
        })
    }
}
