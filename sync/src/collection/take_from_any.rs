// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Multi-collection take: race several collections, consume from whichever signals
//! first. See [`AsyncCollection::take_from_any`] for details.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    engine::{SyncError, WaitInterrupts, WaitOptions, WaitResult},
    primitives::PeekDecrement,
};

use super::AsyncCollection;

/// What [`AsyncCollection::take_from_any`] resolved with: the item and where it came
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakenItem<T> {
    /// Index into the slice the operation was started with.
    pub source_index: usize,
    pub item: T,
}

impl<T> AsyncCollection<T> {
    /// Takes one item from whichever of `collections` can supply it first. Ties
    /// break toward the lowest index. Losing collections are only peeked - a
    /// competing waiter that does not win never costs its collection an item.
    ///
    /// The wait only fails once *every* source is completed and drained (with
    /// [`SyncError::InvalidOperation`]); a mid-flight completion of one source
    /// leaves the wait watching the others.
    pub fn take_from_any(collections: &[AsyncCollection<T>]) -> TakeFromAny<T> {
        Self::take_from_any_with(collections, WaitOptions::default())
    }

    /// [`Self::take_from_any`] with a cancellation token and/or deadline.
    pub fn take_from_any_with(
        collections: &[AsyncCollection<T>],
        options: WaitOptions,
    ) -> TakeFromAny<T> {
        TakeFromAny {
            sources: collections.to_vec(),
            peeks: Vec::new(),
            options,
            interrupts: None,
            armed: false,
            done: false,
        }
    }

    /// Non-suspending [`Self::take_from_any`]: scans in index order.
    pub fn try_take_from_any(collections: &[AsyncCollection<T>]) -> Option<TakenItem<T>> {
        collections.iter().enumerate().find_map(|(source_index, collection)| {
            collection
                .try_take()
                .map(|item| TakenItem { source_index, item })
        })
    }
}

/// How one source inside [`TakeFromAny`] is doing.
#[derive(Debug)]
enum SourceSlot {
    /// Watching the source via a non-consuming peek on its items counter.
    Armed(PeekDecrement),
    /// That source is completed and drained (or disposed); nothing more will come.
    Finished,
}

/// Future returned by [`AsyncCollection::take_from_any`].
#[derive(Debug)]
pub struct TakeFromAny<T> {
    sources: Vec<AsyncCollection<T>>,
    peeks: Vec<SourceSlot>,
    options: WaitOptions,
    interrupts: Option<WaitInterrupts>,
    armed: bool,
    done: bool,
}

impl<T> Future for TakeFromAny<T> {
    type Output = WaitResult<TakenItem<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "TakeFromAny polled after completion");

        if !this.armed {
            if this.sources.is_empty() {
                this.done = true;
                return Poll::Ready(Err(SyncError::InvalidOperation));
            }
            if this.options.cancel_requested() {
                this.done = true;
                return Poll::Ready(Err(SyncError::Cancelled));
            }
            if let Some(taken) = AsyncCollection::try_take_from_any(&this.sources) {
                this.done = true;
                return Poll::Ready(Ok(taken));
            }
            this.peeks = this
                .sources
                .iter()
                .map(|source| SourceSlot::Armed(source.items_counter().peek_decrement()))
                .collect();
            this.interrupts = Some(WaitInterrupts::new(&this.options));
            this.armed = true;
        }

        let mut index = 0;
        while index < this.peeks.len() {
            if let SourceSlot::Armed(peek) = &mut this.peeks[index] {
                match Pin::new(peek).poll(cx) {
                    Poll::Ready(Ok(true)) => {
                        if let Some(item) = this.sources[index].try_take() {
                            this.done = true;
                            // Remaining peeks drop with `self`; the losers never
                            // consumed an item.
                            return Poll::Ready(Ok(TakenItem {
                                source_index: index,
                                item,
                            }));
                        }
                        // Lost the item to a competing taker: watch again.
                        this.peeks[index] = SourceSlot::Armed(
                            this.sources[index].items_counter().peek_decrement(),
                        );
                        continue;
                    }
                    Poll::Ready(Ok(false) | Err(_)) => {
                        this.peeks[index] = SourceSlot::Finished;
                    }
                    Poll::Pending => {}
                }
            }
            index += 1;
        }

        if this
            .peeks
            .iter()
            .all(|slot| matches!(slot, SourceSlot::Finished))
        {
            this.done = true;
            return Poll::Ready(Err(SyncError::InvalidOperation));
        }

        match this.interrupts.as_mut().and_then(|i| i.poll_interrupt(cx)) {
            Some(err) => {
                this.done = true;
                this.peeks.clear();
                Poll::Ready(Err(err))
            }
            None => Poll::Pending,
        }
    }
}
