// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::wait_list::{WaitEntry, WaitList};
use core::cell::Cell;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use pin_project::{pin_project, pinned_drop};
use static_assertions::assert_not_impl_any;
use std::rc::Rc;

/// A fan-in barrier: tasks block on [`wait`] until a counter driven by
/// [`add`] and [`done`] reaches zero.
///
/// The coordinating task calls `add(k)` for a batch of `k` activities, each
/// activity calls `done()` exactly once when it finishes (usually through a
/// [`Guard`]), and any number of tasks `wait().await` for the whole batch.
/// All waiters of the same zero transition are woken together, in the order
/// they suspended.
///
/// Handles are cheaply cloneable and all refer to the same counter.
///
/// [`add`]: Self::add
/// [`done`]: Self::done
/// [`wait`]: Self::wait
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Rc<Inner>,
}

assert_not_impl_any!(WaitGroup: Send, Sync);

#[derive(Default)]
struct Inner {
    count: Cell<usize>,
    waiters: WaitList,
}

/// Future returned by [`WaitGroup::wait`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Wait<'a> {
    wait_group: &'a WaitGroup,
    waiter: Option<Rc<WaitEntry>>,
}

/// Calls [`WaitGroup::done`] when dropped.
///
/// The guard only ever decrements: the coordinating code still calls
/// [`WaitGroup::add`] once for the batch. Holding a guard inside a task
/// guarantees the `done()` runs on every exit path, including a panic.
#[must_use = "the guard calls `done` when dropped; dropping it immediately defeats its purpose"]
pub struct Guard {
    wait_group: WaitGroup,
}

// === impl WaitGroup ===

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increase the counter by `n`.
    ///
    /// Must happen before the matching [`wait`](Self::wait) resolves;
    /// re-arming a `WaitGroup` whose previous batch already completed is
    /// fine.
    pub fn add(&self, n: usize) {
        // waiters can only be enrolled while the counter is positive, so a
        // zero counter here implies nobody is waiting
        debug_assert!(
            self.inner.count.get() > 0 || self.inner.waiters.is_empty(),
            "add() on a WaitGroup whose waiters have already been released"
        );
        self.inner.count.set(self.inner.count.get() + n);
    }

    /// Decrease the counter by one, waking every waiter if it reaches zero.
    ///
    /// Calling `done` more times than [`add`](Self::add) accounted for is a
    /// no-op: the counter saturates at zero rather than underflowing. (This
    /// is deliberately laxer than Go's `sync.WaitGroup`, so that a [`Guard`]
    /// can be held conservatively.)
    pub fn done(&self) {
        let count = self.inner.count.get();
        if count == 0 {
            tracing::trace!("done() without matching add(), saturating at zero");
            return;
        }
        self.inner.count.set(count - 1);
        if count == 1 {
            let woken = self.inner.waiters.wake_all();
            tracing::trace!(woken, "wait group reached zero");
        }
    }

    /// The current counter value.
    pub fn count(&self) -> usize {
        self.inner.count.get()
    }

    /// Wait for the counter to reach zero.
    ///
    /// Resolves immediately if the counter is already zero. Otherwise the
    /// task suspends until the [`done`](Self::done) that lands on zero; all
    /// tasks waiting on that transition resolve in the same scheduler run.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            wait_group: self,
            waiter: None,
        }
    }

    /// Create a [`Guard`] that calls [`done`](Self::done) when dropped.
    pub fn guard(&self) -> Guard {
        Guard {
            wait_group: self.clone(),
        }
    }
}

impl fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitGroup")
            .field("count", &self.inner.count.get())
            .field("waiters", &self.inner.waiters.len())
            .finish_non_exhaustive()
    }
}

// === impl Wait ===

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Some(entry) = this.waiter {
            if entry.is_woken() {
                return Poll::Ready(());
            }
            entry.register(cx);
            return Poll::Pending;
        }

        if this.wait_group.inner.count.get() == 0 {
            return Poll::Ready(());
        }

        *this.waiter = Some(
            this.wait_group
                .inner
                .waiters
                .enrol(cx.waker().clone()),
        );
        Poll::Pending
    }
}

#[pinned_drop]
impl<'a> PinnedDrop for Wait<'a> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(entry) = this.waiter.take() {
            if !entry.is_woken() {
                this.wait_group.inner.waiters.cancel(&entry);
            }
        }
    }
}

// === impl Guard ===

impl Drop for Guard {
    fn drop(&mut self) {
        self.wait_group.done();
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("wait_group", &self.wait_group)
            .finish()
    }
}
