// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Completion-order iteration over a set of futures. See [`interleave`] for details.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::{Stream, stream::FuturesUnordered};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::engine::{SyncError, WaitResult};

/// Yields the outputs of `futures` in *completion* order, not submission order. The
/// empty input yields the empty stream.
///
/// ```
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() {
/// use std::time::Duration;
/// use futures_util::StreamExt;
/// use r3bl_sync::interleave;
///
/// let delayed = |ms, value: u32| async move {
///     tokio::time::sleep(Duration::from_millis(ms)).await;
///     value
/// };
/// let order: Vec<u32> =
///     interleave([delayed(30, 1), delayed(10, 2), delayed(20, 3)]).collect().await;
/// assert_eq!(order, [2, 3, 1]);
/// # }
/// ```
pub fn interleave<I>(futures: I) -> Interleave<I::Item>
where
    I: IntoIterator,
    I::Item: Future,
{
    Interleave {
        inner: futures.into_iter().collect(),
    }
}

/// [`interleave`], but each yielded element carries the index the future had in the
/// input, so callers can tell who finished.
pub fn interleave_indexed<I>(futures: I) -> InterleaveIndexed<I::Item>
where
    I: IntoIterator,
    I::Item: Future,
{
    InterleaveIndexed {
        inner: futures
            .into_iter()
            .enumerate()
            .map(|(index, future)| IndexedFuture {
                index,
                future: Box::pin(future),
            })
            .collect(),
    }
}

/// [`interleave`] with a cancellation token: when `token` fires, the remaining
/// futures are detached (dropped, not driven to completion - for spawned work pass
/// [`tokio::task::JoinHandle`]s, which keep running detached) and the stream yields
/// one final `Err(`[`SyncError::Cancelled`]`)` before ending.
pub fn interleave_with_cancel<I>(token: CancellationToken, futures: I) -> InterleaveCancel<I::Item>
where
    I: IntoIterator,
    I::Item: Future,
{
    InterleaveCancel {
        inner: futures.into_iter().collect(),
        cancelled: Box::pin(token.cancelled_owned()),
        fired: false,
    }
}

/// Stream returned by [`interleave`].
pub struct Interleave<F: Future> {
    inner: FuturesUnordered<F>,
}

impl<F: Future> Interleave<F> {
    /// Futures not yet completed.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<F: Future> std::fmt::Debug for Interleave<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interleave")
            .field("remaining", &self.inner.len())
            .finish_non_exhaustive()
    }
}

impl<F: Future> Stream for Interleave<F> {
    type Item = F::Output;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// One input future tagged with its original position.
struct IndexedFuture<F> {
    index: usize,
    future: Pin<Box<F>>,
}

impl<F: Future> Future for IndexedFuture<F> {
    type Output = (usize, F::Output);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.future
            .as_mut()
            .poll(cx)
            .map(|output| (this.index, output))
    }
}

/// Stream returned by [`interleave_indexed`].
pub struct InterleaveIndexed<F: Future> {
    inner: FuturesUnordered<IndexedFuture<F>>,
}

impl<F: Future> std::fmt::Debug for InterleaveIndexed<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterleaveIndexed")
            .field("remaining", &self.inner.len())
            .finish_non_exhaustive()
    }
}

impl<F: Future> Stream for InterleaveIndexed<F> {
    type Item = (usize, F::Output);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Stream returned by [`interleave_with_cancel`].
pub struct InterleaveCancel<F: Future> {
    inner: FuturesUnordered<F>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    fired: bool,
}

impl<F: Future> std::fmt::Debug for InterleaveCancel<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterleaveCancel")
            .field("remaining", &self.inner.len())
            .field("fired", &self.fired)
            .finish_non_exhaustive()
    }
}

impl<F: Future> Stream for InterleaveCancel<F> {
    type Item = WaitResult<F::Output>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.fired {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.fired = true;
            this.inner.clear();
            return Poll::Ready(Some(Err(SyncError::Cancelled)));
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(output)) => Poll::Ready(Some(Ok(output))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
