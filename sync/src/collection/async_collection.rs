// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Bounded/unbounded async producer-consumer collection. See [`AsyncCollection`] for
//! details.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::{Stream, future::BoxFuture};

use crate::{
    engine::{Dispose, DisposeTarget, StdMutex, SyncError, WaitOptions, WaitResult, lock_state},
    primitives::AsyncCounter,
};

/// An async producer-consumer collection layered on two counters and an item buffer:
///
/// - **items-available**: incremented by each [`add`], decremented by each [`take`];
///   consumers suspend on it while the collection is empty.
/// - **free-slots** (bounded only): starts at the capacity; [`add`] decrements it
///   before buffering, [`take`] increments it after removal; producers suspend on
///   it while the collection is full.
///
/// [`complete_adding`] makes the collection finite: pending and future adds fail
/// with [`SyncError::InvalidOperation`], buffered items remain takeable, and takers
/// beyond the remaining items fail with [`SyncError::InvalidOperation`] too. That
/// is also how [`get_consuming_stream`] knows where to end.
///
/// Cloning is cheap and shares the same collection.
///
/// [`add`]: Self::add
/// [`take`]: Self::take
/// [`complete_adding`]: Self::complete_adding
/// [`get_consuming_stream`]: Self::get_consuming_stream
pub struct AsyncCollection<T> {
    inner: Arc<CollectionInner<T>>,
}

impl<T> Clone for AsyncCollection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for AsyncCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buf = lock_state(&self.inner.buffer);
        f.debug_struct("AsyncCollection")
            .field("count", &buf.queue.len())
            .field("capacity", &self.inner.capacity)
            .field("adding_complete", &buf.adding_complete)
            .field("disposed", &buf.disposed)
            .finish_non_exhaustive()
    }
}

struct CollectionInner<T> {
    buffer: StdMutex<Buffered<T>>,
    /// Counts buffered items; takers suspend on it.
    items: AsyncCounter,
    /// Counts free capacity; adders suspend on it. `None` for unbounded.
    slots: Option<AsyncCounter>,
    capacity: Option<u32>,
}

struct Buffered<T> {
    queue: VecDeque<T>,
    adding_complete: bool,
    disposed: bool,
}

impl<T> AsyncCollection<T> {
    /// Creates a collection with no capacity limit: [`Self::add`] never suspends.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::build(None)
    }

    /// Creates a collection that buffers at most `capacity` items; adds beyond that
    /// suspend until a take frees a slot.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero - a collection that can never hold an item is
    /// a programming error, not a runtime condition.
    #[must_use]
    pub fn bounded(capacity: u32) -> Self {
        assert!(capacity > 0, "a bounded collection needs capacity for at least one item");
        Self::build(Some(capacity))
    }

    fn build(capacity: Option<u32>) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                buffer: StdMutex::new(Buffered {
                    queue: VecDeque::new(),
                    adding_complete: false,
                    disposed: false,
                }),
                items: AsyncCounter::new(0),
                slots: capacity.map(|c| AsyncCounter::new(u64::from(c))),
                capacity,
            }),
        }
    }

    pub(crate) fn items_counter(&self) -> &AsyncCounter {
        &self.inner.items
    }

    /// Adds an item, suspending while a bounded collection is full.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidOperation`] after [`Self::complete_adding`] (including a
    /// pending add overtaken by it), [`SyncError::Disposed`] after [`Self::dispose`],
    /// [`SyncError::Cancelled`] / [`SyncError::Timeout`] from the options of
    /// [`Self::add_with`]. The item is dropped on failure.
    pub async fn add(&self, item: T) -> WaitResult<()> {
        self.add_with(item, WaitOptions::default()).await
    }

    /// [`Self::add`] with a cancellation token and/or deadline (bounded only - an
    /// unbounded add never waits).
    pub async fn add_with(&self, item: T, options: WaitOptions) -> WaitResult<()> {
        if let Some(slots) = &self.inner.slots {
            if let Err(err) = slots.decrement_with(options).await {
                return Err(self.map_intake_err(err));
            }
        } else if options.cancel_requested() {
            return Err(SyncError::Cancelled);
        }
        self.finish_add(item).map_err(|(_, err)| err)
    }

    /// Non-suspending add. On failure (full, completed, or disposed) the item is
    /// handed back instead of dropped.
    pub fn try_add(&self, item: T) -> Result<(), T> {
        if let Some(slots) = &self.inner.slots {
            if !slots.try_decrement() {
                return Err(item);
            }
        }
        match self.finish_add(item) {
            Ok(()) => Ok(()),
            Err((item, _)) => {
                if let Some(slots) = &self.inner.slots {
                    let _ = slots.increment();
                }
                Err(item)
            }
        }
    }

    /// Adds a final item and then completes adding, atomically with respect to
    /// concurrent adds.
    ///
    /// # Errors
    ///
    /// Same as [`Self::add`]; on failure the collection is *not* completed.
    pub async fn add_complete(&self, item: T) -> WaitResult<()> {
        if let Some(slots) = &self.inner.slots {
            if let Err(err) = slots.decrement_with(WaitOptions::default()).await {
                return Err(self.map_intake_err(err));
            }
        }
        let mut buf = lock_state(&self.inner.buffer);
        if buf.disposed {
            return Err(SyncError::Disposed);
        }
        if buf.adding_complete {
            return Err(SyncError::InvalidOperation);
        }
        buf.queue.push_back(item);
        let _ = self.inner.items.increment();
        self.complete_locked(&mut buf);
        Ok(())
    }

    /// Buffers the item and accounts for it, atomically with respect to
    /// [`Self::complete_adding`]. On failure the item comes back with the error.
    fn finish_add(&self, item: T) -> Result<(), (T, SyncError)> {
        let mut buf = lock_state(&self.inner.buffer);
        if buf.disposed {
            return Err((item, SyncError::Disposed));
        }
        if buf.adding_complete {
            return Err((item, SyncError::InvalidOperation));
        }
        buf.queue.push_back(item);
        // Still under the buffer lock, so complete_adding cannot slip between the
        // push and the counter update.
        let _ = self.inner.items.increment();
        Ok(())
    }

    /// Takes the oldest item, suspending while the collection is empty.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidOperation`] once the collection is completed and drained,
    /// [`SyncError::Disposed`] after [`Self::dispose`], [`SyncError::Cancelled`] /
    /// [`SyncError::Timeout`] from the options of [`Self::take_with`].
    pub async fn take(&self) -> WaitResult<T> {
        self.take_with(WaitOptions::default()).await
    }

    /// [`Self::take`] with a cancellation token and/or deadline.
    pub async fn take_with(&self, options: WaitOptions) -> WaitResult<T> {
        match self.inner.items.decrement_with(options).await {
            Ok(()) => self.finish_take(),
            Err(SyncError::Disposed) => Err(self.exhausted_err()),
            Err(err) => Err(err),
        }
    }

    /// Non-suspending take.
    pub fn try_take(&self) -> Option<T> {
        if self.inner.items.try_decrement() {
            self.finish_take().ok()
        } else {
            None
        }
    }

    /// Removes the item a successful items-counter decrement reserved for us.
    fn finish_take(&self) -> WaitResult<T> {
        let mut buf = lock_state(&self.inner.buffer);
        let Some(item) = buf.queue.pop_front() else {
            // A dispose can land between our counter decrement and this pop: it
            // clears the buffer and zeroes the banked count in one critical
            // section, so the reserved unit no longer has an item behind it.
            if buf.disposed {
                return Err(SyncError::Disposed);
            }
            // Otherwise the counter says a unit was reserved; an empty buffer
            // here would mean the two fell out of sync.
            debug_assert!(false, "items counter and buffer disagree");
            return Err(SyncError::InvalidOperation);
        };
        if !buf.adding_complete {
            if let Some(slots) = &self.inner.slots {
                let _ = slots.increment();
            }
        }
        Ok(item)
    }

    /// Resolves once an item is available, without consuming it. A woken peeker may
    /// still lose the item to a concurrent take.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidOperation`] once completed and drained,
    /// [`SyncError::Disposed`] after disposal, plus the options' own kinds.
    pub async fn peek(&self) -> WaitResult<()> {
        self.peek_with(WaitOptions::default()).await
    }

    /// [`Self::peek`] with a cancellation token and/or deadline.
    pub async fn peek_with(&self, options: WaitOptions) -> WaitResult<()> {
        match self.inner.items.peek_decrement_with(options).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(self.exhausted_err()),
            Err(err) => Err(err),
        }
    }

    /// Non-suspending peek: true iff an item is available right now.
    pub fn try_peek(&self) -> bool {
        self.inner.items.try_peek_decrement()
    }

    /// Stops intake: pending and future adds fail, buffered items stay takeable,
    /// and takers beyond the remaining items fail with
    /// [`SyncError::InvalidOperation`]. Idempotent.
    pub fn complete_adding(&self) {
        let mut buf = lock_state(&self.inner.buffer);
        self.complete_locked(&mut buf);
    }

    fn complete_locked(&self, buf: &mut Buffered<T>) {
        if buf.adding_complete {
            return;
        }
        buf.adding_complete = true;
        tracing::debug!(remaining = buf.queue.len(), "AsyncCollection: adding completed");
        // Disposing the counters fails their pending waiters (excess adders and
        // takers); banked value keeps draining, which is what keeps the remaining
        // items takeable. Both calls happen under the buffer lock so no add can
        // interleave.
        drop(self.inner.items.dispose());
        if let Some(slots) = &self.inner.slots {
            drop(slots.dispose());
        }
    }

    /// Lazily consumes the collection as a [`Stream`]. The stream yields each taken
    /// item and ends once the collection is completed and drained (or disposed).
    pub fn get_consuming_stream(&self) -> ConsumingStream<T>
    where
        T: Send + 'static,
    {
        ConsumingStream {
            collection: self.clone(),
            pending: None,
        }
    }

    /// Items currently buffered.
    pub fn count(&self) -> usize {
        lock_state(&self.inner.buffer).queue.len()
    }

    /// The capacity of a bounded collection; `None` when unbounded.
    pub fn capacity(&self) -> Option<u32> {
        self.inner.capacity
    }

    /// Producers currently suspended in [`Self::add`].
    pub fn waiting_to_add(&self) -> usize {
        self.inner
            .slots
            .as_ref()
            .map_or(0, AsyncCounter::waiting_count)
    }

    /// Consumers currently suspended in [`Self::take`].
    pub fn waiting_to_take(&self) -> usize {
        self.inner.items.waiting_count()
    }

    pub fn is_adding_completed(&self) -> bool {
        lock_state(&self.inner.buffer).adding_complete
    }

    /// True once adding is completed *and* every item has been taken.
    pub fn is_completed(&self) -> bool {
        let buf = lock_state(&self.inner.buffer);
        buf.adding_complete && buf.queue.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        lock_state(&self.inner.buffer).disposed
    }

    /// Starts disposal: buffered items are dropped, pending adders and takers fail
    /// with [`SyncError::Disposed`], and new operations are rejected. The returned
    /// future resolves once the underlying counters are quiescent, which for a
    /// collection is on its first poll.
    pub fn dispose(&self) -> Dispose<AsyncCollection<T>> {
        {
            let mut buf = lock_state(&self.inner.buffer);
            if !buf.disposed {
                buf.disposed = true;
                tracing::debug!(
                    dropped = buf.queue.len(),
                    "AsyncCollection: dispose initiated"
                );
                buf.queue.clear();
                // Counter disposal is drain-out: banked units stay decrementable.
                // The buffer is gone, so the banked count must go with it, or a
                // post-dispose take would decrement against an empty queue.
                self.inner.items.decrement_to_zero();
            }
        }
        drop(self.inner.items.dispose());
        if let Some(slots) = &self.inner.slots {
            drop(slots.dispose());
        }
        Dispose::new(self.clone())
    }

    /// Maps a failed wait on the items counter to the collection-level error:
    /// completion reads as [`SyncError::InvalidOperation`], disposal as
    /// [`SyncError::Disposed`].
    fn exhausted_err(&self) -> SyncError {
        if lock_state(&self.inner.buffer).disposed {
            SyncError::Disposed
        } else {
            SyncError::InvalidOperation
        }
    }

    /// Same mapping for the slots counter (producer side).
    fn map_intake_err(&self, err: SyncError) -> SyncError {
        match err {
            SyncError::Disposed => self.exhausted_err(),
            other => other,
        }
    }
}

impl<T> DisposeTarget for AsyncCollection<T> {
    fn poll_dispose(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.inner.items.poll_dispose(cx).is_pending() {
            return Poll::Pending;
        }
        if let Some(slots) = &self.inner.slots {
            if slots.poll_dispose(cx).is_pending() {
                return Poll::Pending;
            }
        }
        Poll::Ready(())
    }
}

/// Stream returned by [`AsyncCollection::get_consuming_stream`].
pub struct ConsumingStream<T> {
    collection: AsyncCollection<T>,
    pending: Option<BoxFuture<'static, WaitResult<T>>>,
}

impl<T> std::fmt::Debug for ConsumingStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumingStream")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl<T> Stream for ConsumingStream<T>
where
    T: Send + 'static,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let pending = this.pending.get_or_insert_with(|| {
            let collection = this.collection.clone();
            Box::pin(async move { collection.take().await })
        });
        match pending.as_mut().poll(cx) {
            Poll::Ready(result) => {
                this.pending = None;
                // Any error (completed and drained, disposed) ends the stream.
                Poll::Ready(result.ok())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{FutureExt, StreamExt};
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn unbounded_add_take_round_trip() {
        let collection: AsyncCollection<u32> = AsyncCollection::unbounded();
        collection.add(1).await.unwrap();
        collection.add(2).await.unwrap();
        assert_eq!(collection.count(), 2);

        assert_eq!(collection.take().await.unwrap(), 1);
        assert_eq!(collection.take().await.unwrap(), 2);
        assert_eq!(collection.count(), 0);
    }

    #[tokio::test]
    async fn take_suspends_until_an_item_arrives() {
        let collection: AsyncCollection<&str> = AsyncCollection::unbounded();

        let mut pending = Box::pin(collection.take());
        assert!(pending.as_mut().now_or_never().is_none());
        assert_eq!(collection.waiting_to_take(), 1);

        collection.add("item").await.unwrap();
        assert_eq!(pending.await.unwrap(), "item");
        assert_eq!(collection.waiting_to_take(), 0);
    }

    #[tokio::test]
    async fn bounded_add_suspends_until_a_slot_frees() {
        let collection: AsyncCollection<u32> = AsyncCollection::bounded(1);
        collection.add(42).await.unwrap();

        let mut blocked = Box::pin(collection.add(84));
        assert!(blocked.as_mut().now_or_never().is_none());
        assert_eq!(collection.waiting_to_add(), 1);

        assert_eq!(collection.take().await.unwrap(), 42);
        blocked.await.unwrap();
        assert_eq!(collection.take().await.unwrap(), 84);
    }

    #[tokio::test]
    async fn try_add_hands_the_item_back_when_full() {
        let collection: AsyncCollection<u32> = AsyncCollection::bounded(1);
        assert!(collection.try_add(1).is_ok());
        assert_eq!(collection.try_add(2), Err(2));

        assert_eq!(collection.try_take(), Some(1));
        assert!(collection.try_add(2).is_ok());
    }

    #[tokio::test]
    async fn complete_adding_fails_adders_but_drains_takers() {
        let collection: AsyncCollection<u32> = AsyncCollection::unbounded();
        collection.add(7).await.unwrap();
        collection.complete_adding();
        assert!(collection.is_adding_completed());
        assert!(!collection.is_completed());

        // Adds are over.
        assert_eq!(
            collection.add(8).await.unwrap_err(),
            SyncError::InvalidOperation
        );
        // The buffered item still comes out, then takes fail.
        assert_eq!(collection.take().await.unwrap(), 7);
        assert!(collection.is_completed());
        assert_eq!(
            collection.take().await.unwrap_err(),
            SyncError::InvalidOperation
        );
    }

    #[tokio::test]
    async fn complete_adding_fails_pending_takers_beyond_remaining_items() {
        let collection: AsyncCollection<u32> = AsyncCollection::unbounded();

        let mut pending = Box::pin(collection.take());
        assert!(pending.as_mut().now_or_never().is_none());

        collection.complete_adding();
        assert_eq!(pending.await.unwrap_err(), SyncError::InvalidOperation);
    }

    #[tokio::test]
    async fn complete_adding_fails_pending_adders_beyond_capacity() {
        let collection: AsyncCollection<u32> = AsyncCollection::bounded(1);
        collection.add(1).await.unwrap();

        let mut blocked = Box::pin(collection.add(2));
        assert!(blocked.as_mut().now_or_never().is_none());

        collection.complete_adding();
        assert_eq!(blocked.await.unwrap_err(), SyncError::InvalidOperation);
    }

    #[tokio::test]
    async fn add_complete_is_atomic_with_completion() {
        let collection: AsyncCollection<u32> = AsyncCollection::unbounded();
        collection.add(1).await.unwrap();
        collection.add_complete(2).await.unwrap();

        assert!(collection.is_adding_completed());
        assert_eq!(collection.take().await.unwrap(), 1);
        assert_eq!(collection.take().await.unwrap(), 2);
        assert_eq!(
            collection.take().await.unwrap_err(),
            SyncError::InvalidOperation
        );
    }

    #[tokio::test]
    async fn peek_signals_availability_without_consuming() {
        let collection: AsyncCollection<u32> = AsyncCollection::unbounded();
        assert!(!collection.try_peek());

        let mut pending = Box::pin(collection.peek());
        assert!(pending.as_mut().now_or_never().is_none());

        collection.add(5).await.unwrap();
        pending.await.unwrap();
        assert_eq!(collection.count(), 1);
        assert!(collection.try_peek());
    }

    #[tokio::test(start_paused = true)]
    async fn take_with_deadline_times_out() {
        let collection: AsyncCollection<u32> = AsyncCollection::unbounded();
        let result = collection
            .take_with(WaitOptions::timeout(Duration::from_millis(10)))
            .await;
        assert_eq!(result.unwrap_err(), SyncError::Timeout);
    }

    #[tokio::test]
    async fn consuming_stream_ends_at_completion() {
        let collection: AsyncCollection<u32> = AsyncCollection::unbounded();
        for item in [1, 2, 3] {
            collection.add(item).await.unwrap();
        }
        collection.complete_adding();

        let collected: Vec<u32> = collection.get_consuming_stream().collect().await;
        assert_eq!(collected, [1, 2, 3]);
        assert!(collection.is_completed());
    }

    #[tokio::test]
    async fn dispose_drops_items_and_fails_everything() {
        let collection: AsyncCollection<u32> = AsyncCollection::unbounded();
        collection.add(1).await.unwrap();

        let mut disposal = collection.dispose();
        assert!((&mut disposal).now_or_never().is_some());
        assert!(collection.is_disposed());
        assert_eq!(collection.count(), 0);

        assert_eq!(collection.add(2).await.unwrap_err(), SyncError::Disposed);
        assert_eq!(collection.take().await.unwrap_err(), SyncError::Disposed);
        assert!(collection.try_take().is_none());
    }
}
