// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::wait_list::{WaitEntry, WaitList};
use core::cell::{Cell, RefCell};
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use pin_project::{pin_project, pinned_drop};
use static_assertions::assert_not_impl_any;
use std::collections::VecDeque;
use std::rc::Rc;

/// A typed point-to-point channel with Go semantics.
///
/// A channel of capacity `0` is a *rendezvous* channel: every send completes
/// in lock-step with a receive. A channel of capacity `n > 0` buffers up to
/// `n` values; senders complete immediately while there is room and suspend
/// once the buffer is full.
///
/// Handles are cheaply cloneable and all refer to the same channel. Values
/// are delivered in send order; blocked senders and blocked receivers are
/// each served in the order they suspended.
///
/// # Closing
///
/// [`close`](Self::close) is the one terminal transition. After it, sends
/// resolve `false` and receives drain whatever was already buffered before
/// resolving `None`. Closing wakes every blocked sender and receiver, which
/// makes it the runtime's cooperative shutdown signal: see the crate docs.
pub struct Channel<T> {
    core: Rc<RefCell<Core<T>>>,
}

assert_not_impl_any!(Channel<()>: core::marker::Send, Sync);

struct Core<T> {
    capacity: usize,

    /// The main buffer; never holds more than `capacity` items.
    buffer: VecDeque<T>,

    /// Values left behind by senders that could not complete immediately.
    ///
    /// Keeping these outside `buffer` preserves the capacity bound while a
    /// sender is parked. The last `senders.len()` items belong, in order, to
    /// the parked senders; on a rendezvous channel the items before those
    /// were fast-path handoffs whose senders already completed.
    handoff: VecDeque<T>,

    /// Blocked receivers, in suspension order.
    receivers: WaitList,

    /// Blocked senders, in suspension order, parallel to the tail of
    /// `handoff`.
    senders: VecDeque<Rc<SendWaiter>>,

    closed: bool,
}

struct SendWaiter {
    waker: RefCell<Waker>,
    state: Cell<SendState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    /// Still suspended; the value sits in the handoff queue.
    Parked,
    /// A receiver adopted the value; the send resolves `true`.
    Sent,
    /// The channel closed before the value was adopted; the value was
    /// dropped and the send resolves `false`.
    Closed,
}

/// Future returned by [`Channel::send`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Send<'a, T> {
    channel: &'a Channel<T>,
    value: Option<T>,
    waiter: Option<Rc<SendWaiter>>,
}

/// Future returned by [`Channel::recv`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Recv<'a, T> {
    channel: &'a Channel<T>,
    waiter: Option<Rc<WaitEntry>>,
}

// === impl Channel ===

impl<T> Channel<T> {
    /// Create a channel. `capacity == 0` makes it a rendezvous channel.
    pub fn new(capacity: usize) -> Self {
        Self {
            core: Rc::new(RefCell::new(Core {
                capacity,
                buffer: VecDeque::new(),
                handoff: VecDeque::new(),
                receivers: WaitList::new(),
                senders: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Send `value`, suspending until it is accepted.
    ///
    /// Resolves `true` once the value is in the buffer or was adopted by a
    /// receiver, and `false` if the channel was closed first (the value is
    /// dropped in that case). Sending never fails in any other way.
    pub fn send(&self, value: T) -> Send<'_, T> {
        Send {
            channel: self,
            value: Some(value),
            waiter: None,
        }
    }

    /// Receive the next value, suspending until one is available.
    ///
    /// Resolves `Some(value)` in send order, and `None` once the channel is
    /// closed *and* drained. Blocked receivers are served first-come,
    /// first-served.
    pub fn recv(&self) -> Recv<'_, T> {
        Recv {
            channel: self,
            waiter: None,
        }
    }

    /// Close the channel. Idempotent.
    ///
    /// Every blocked receiver and sender is woken, in the order it
    /// suspended. Values already in the buffer (and rendezvous values whose
    /// sender already completed) are still delivered; values parked by
    /// still-suspended senders are dropped and those senders resolve
    /// `false`.
    pub fn close(&self) {
        let mut core = self.core.borrow_mut();
        if core.closed {
            tracing::trace!("close on already-closed channel");
            return;
        }
        core.closed = true;

        // values parked for suspended senders are not delivered after close
        let keep = core.handoff.len() - core.senders.len();
        let dropped = core.handoff.split_off(keep);
        let senders: Vec<_> = core.senders.drain(..).collect();

        tracing::trace!(
            senders = senders.len(),
            receivers = core.receivers.len(),
            undelivered = dropped.len(),
            "channel closed"
        );

        // release the borrow before waking or dropping user values
        drop(core);

        for waiter in senders {
            waiter.state.set(SendState::Closed);
            waiter.waker.borrow().wake_by_ref();
        }
        self.core.borrow().receivers.wake_all();
        drop(dropped);
    }

    /// The number of values in the buffer.
    ///
    /// Values parked by suspended senders are in flight, not stored, and are
    /// not counted.
    pub fn len(&self) -> usize {
        self.core.borrow().buffer.len()
    }

    /// `true` if the buffer holds no values.
    pub fn is_empty(&self) -> bool {
        self.core.borrow().buffer.is_empty()
    }

    /// The buffer capacity this channel was created with.
    pub fn capacity(&self) -> usize {
        self.core.borrow().capacity
    }

    /// `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.core.borrow().closed
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("Channel")
            .field("len", &core.buffer.len())
            .field("capacity", &core.capacity)
            .field("closed", &core.closed)
            .finish_non_exhaustive()
    }
}

// === impl Core ===

impl<T> Core<T> {
    /// The receive path shared by fresh and woken receivers.
    fn try_recv(&mut self) -> Option<T> {
        if let Some(value) = self.buffer.pop_front() {
            // direct handoff: promote a parked sender's value into the slot
            // we just freed, keeping the buffer as full as it can be
            if let Some(parked) = self.handoff.pop_front() {
                self.buffer.push_back(parked);
                self.release_next_sender(SendState::Sent);
            }
            return Some(value);
        }

        if self.capacity == 0 && !self.handoff.is_empty() {
            // values ahead of the parked tail were fast-path handoffs; their
            // senders completed long ago and nobody is woken for them
            let parked = self.handoff.len() <= self.senders.len();
            let value = self.handoff.pop_front();
            if parked {
                self.release_next_sender(SendState::Sent);
            }
            return value;
        }

        None
    }

    fn release_next_sender(&mut self, state: SendState) {
        let waiter = self
            .senders
            .pop_front()
            .expect("handoff value without a parked sender");
        waiter.state.set(state);
        waiter.waker.borrow().wake_by_ref();
    }
}

// === impl Send ===

impl<T> Future for Send<'_, T> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        // already parked: the channel resolved us when it woke us
        if let Some(waiter) = this.waiter {
            return match waiter.state.get() {
                SendState::Parked => {
                    waiter.register(cx);
                    Poll::Pending
                }
                SendState::Sent => Poll::Ready(true),
                SendState::Closed => Poll::Ready(false),
            };
        }

        let mut core = this.channel.core.borrow_mut();
        let value = this.value.take().expect("Send polled after completion");

        if core.closed {
            drop(core);
            drop(value);
            return Poll::Ready(false);
        }

        if core.capacity > 0 {
            // bounded: room in the buffer completes the send immediately
            if core.buffer.len() < core.capacity {
                core.buffer.push_back(value);
                core.receivers.wake_one();
                return Poll::Ready(true);
            }
        } else if !core.receivers.is_empty() {
            // rendezvous fast path: a receiver is already waiting, leave the
            // value for it and complete without suspending
            core.handoff.push_back(value);
            core.receivers.wake_one();
            return Poll::Ready(true);
        }

        // park until a receiver adopts the value or the channel closes
        let waiter = Rc::new(SendWaiter {
            waker: RefCell::new(cx.waker().clone()),
            state: Cell::new(SendState::Parked),
        });
        core.handoff.push_back(value);
        core.senders.push_back(waiter.clone());
        *this.waiter = Some(waiter);
        tracing::trace!(
            parked = core.senders.len(),
            "channel full, sender suspended"
        );
        Poll::Pending
    }
}

#[pinned_drop]
impl<'a, T> PinnedDrop for Send<'a, T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        let Some(waiter) = this.waiter.take() else {
            return;
        };
        if waiter.state.get() != SendState::Parked {
            return;
        }

        // dropped mid-wait: withdraw both the queue entry and the value
        let mut core = this.channel.core.borrow_mut();
        if let Some(idx) = core
            .senders
            .iter()
            .position(|other| Rc::ptr_eq(other, &waiter))
        {
            let first_parked = core.handoff.len() - core.senders.len();
            core.senders.remove(idx);
            let value = core.handoff.remove(first_parked + idx);
            drop(core);
            drop(value);
        }
    }
}

// === impl Recv ===

impl<T> Future for Recv<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Some(entry) = this.waiter {
            if !entry.is_woken() {
                entry.register(cx);
                return Poll::Pending;
            }
            // woken: leave the queue and retry the receive path
            *this.waiter = None;
        }

        let mut core = this.channel.core.borrow_mut();

        if let Some(value) = core.try_recv() {
            return Poll::Ready(Some(value));
        }
        if core.closed {
            return Poll::Ready(None);
        }

        *this.waiter = Some(core.receivers.enrol(cx.waker().clone()));
        tracing::trace!(parked = core.receivers.len(), "channel empty, receiver suspended");
        Poll::Pending
    }
}

#[pinned_drop]
impl<'a, T> PinnedDrop for Recv<'a, T> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(entry) = this.waiter.take() {
            if !entry.is_woken() {
                this.channel.core.borrow().receivers.cancel(&entry);
            }
        }
    }
}

// === impl SendWaiter ===

impl SendWaiter {
    fn register(&self, cx: &Context<'_>) {
        let mut waker = self.waker.borrow_mut();
        if !waker.will_wake(cx.waker()) {
            *waker = cx.waker().clone();
        }
    }
}
