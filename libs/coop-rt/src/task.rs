// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod builder;
mod id;
mod join_handle;
mod yield_now;

use crate::scheduler::Scheduler;
use crate::sync::wait_list::WaitList;
use bitflags::bitflags;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::mem;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::rc::Rc;

pub use builder::Builder;
pub use id::Id;
pub use join_handle::{Join, JoinError, JoinHandle};
pub use yield_now::{YieldNow, yield_now};

/// Spawn a task.
///
/// The task is created suspended and immediately enqueued for its first poll;
/// it runs once the current thread's scheduler is driven (via [`run`] or
/// [`block_on`]). The future does not need to be `Send`, tasks never leave
/// the thread they were spawned on.
///
/// The returned [`JoinHandle`] can be awaited for the task's output, or used
/// to create any number of [`join`](JoinHandle::join) awaitables. Dropping
/// the handle detaches the task; it keeps running to completion.
///
/// [`run`]: crate::run
/// [`block_on`]: crate::block_on
#[track_caller]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Builder::new().spawn(future)
}

bitflags! {
    /// A task's lifecycle bits.
    ///
    /// No bits set means the task is suspended and nothing has woken it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct State: u8 {
        /// The task is in the ready queue.
        const QUEUED = 1 << 0;
        /// The task is currently being polled.
        const POLLING = 1 << 1;
        /// The task was woken while it was being polled.
        const NOTIFIED = 1 << 2;
        /// The task has reached its terminal suspension.
        const COMPLETE = 1 << 3;
    }
}

/// Outcome of calling [`TaskRef::poll`].
///
/// This type describes how the scheduler should proceed with a given task,
/// whether it needs to be rescheduled or can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollResult {
    /// The task has completed with no join waiters to wake.
    Ready,

    /// The task has completed and its join waiters have been woken.
    ReadyJoined,

    /// The task is pending, but not woken.
    ///
    /// The scheduler can drop its reference; whoever intends to wake the
    /// task later holds a clone of its [`Waker`].
    Pending,

    /// The task has woken itself during the poll.
    ///
    /// The scheduler should re-enqueue the task rather than dropping its
    /// reference.
    PendingSchedule,
}

/// The shared header of every task allocation.
#[derive(Debug)]
pub(crate) struct Header {
    id: Id,
    state: Cell<State>,
    /// The tracing span associated with this task, for debugging purposes.
    span: tracing::Span,
}

/// The current lifecycle stage of the future: the future itself, its output,
/// or neither.
enum Stage<F: Future> {
    /// The future is still pending.
    Pending(F),

    /// The future has completed, and its output is ready to be taken by the
    /// [`JoinHandle`], if one still exists.
    Ready(F::Output),

    /// The future has completed, and the task's output has been taken or is
    /// not needed.
    Consumed,
}

/// A type-erased, reference-counted pointer to a spawned task.
///
/// The scheduler queue, wakers and join awaitables all address tasks through
/// `TaskRef`s rather than the concrete [`Task<F>`]: futures created through
/// `async` blocks are unique, disjoint types, and treating them uniformly
/// here keeps the scheduler non-generic. The task allocation is freed when
/// the last `TaskRef` (and the last waker derived from it) is dropped, so a
/// reference enrolled in a wait queue can never dangle.
#[derive(Clone)]
pub(crate) struct TaskRef(Rc<dyn RawTask>);

/// The type-erased task interface backing [`TaskRef`].
pub(crate) trait RawTask {
    fn header(&self) -> &Header;

    /// Poll the task's future once. Only the scheduler calls this.
    fn poll_task(&self) -> PollResult;

    /// Tasks blocked on this task's completion.
    fn join_waiters(&self) -> &WaitList;

    /// The captured failure, if the task panicked.
    fn failure(&self) -> Option<JoinError>;
}

/// The typed half of the task interface, used by [`JoinHandle`] to take the
/// output without knowing the future's type.
pub(crate) trait Joinable<T>: RawTask {
    /// Take the task's output. Returns `None` if the task failed or the
    /// output was already taken.
    fn take_output(&self) -> Option<T>;
}

/// A spawned task: one cooperative activity and the frame it runs in.
pub(crate) struct Task<F: Future> {
    header: Header,

    /// The future that the task is running, or its output.
    ///
    /// Only the scheduler polls the future (through [`RawTask::poll_task`]),
    /// and only a [`JoinHandle`] takes the output (after `COMPLETE` is set),
    /// so the `RefCell` is never contended.
    stage: RefCell<Stage<F>>,

    /// The failure captured at terminal suspension, if the future panicked.
    failure: RefCell<Option<JoinError>>,

    /// Tasks blocked on this task's completion, in enrolment order.
    join_waiters: WaitList,
}

// === impl TaskRef ===

impl TaskRef {
    pub(crate) fn new(raw: Rc<dyn RawTask>) -> Self {
        Self(raw)
    }

    pub(crate) fn id(&self) -> Id {
        self.0.header().id
    }

    /// Returns `true` once the task has reached its terminal suspension.
    pub(crate) fn is_complete(&self) -> bool {
        self.0.header().is_complete()
    }

    pub(crate) fn failure(&self) -> Option<JoinError> {
        self.0.failure()
    }

    pub(crate) fn join_waiters(&self) -> &WaitList {
        self.0.join_waiters()
    }

    /// Move the task towards the ready queue, if it isn't already on its way.
    pub(crate) fn wake(&self) {
        if self.0.header().transition_to_queued() {
            Scheduler::with(|scheduler| scheduler.enqueue(self.clone()));
        }
    }

    pub(crate) fn poll(&self) -> PollResult {
        self.0.poll_task()
    }

    /// Clear the queued bit after the scheduler discarded this reference, so
    /// that a later wake-up can enqueue the task again.
    pub(crate) fn forget_queued(&self) {
        let header = self.0.header();
        header.state.set(header.state.get() - State::QUEUED);
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("state", &self.0.header().state.get())
            .finish()
    }
}

// === impl Header ===

impl Header {
    fn new(id: Id, span: tracing::Span) -> Self {
        Self {
            id,
            state: Cell::new(State::empty()),
            span,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state.get().contains(State::COMPLETE)
    }

    /// Attempt the wake transition. Returns `true` if the caller must now
    /// enqueue the task.
    ///
    /// Waking a completed or already-queued task is a no-op; waking a task
    /// that is currently being polled defers the enqueue to the end of that
    /// poll ([`PollResult::PendingSchedule`]).
    fn transition_to_queued(&self) -> bool {
        let state = self.state.get();
        if state.intersects(State::COMPLETE | State::QUEUED) {
            return false;
        }
        if state.contains(State::POLLING) {
            self.state.set(state | State::NOTIFIED);
            return false;
        }
        self.state.set(state | State::QUEUED);
        true
    }

    fn start_poll(&self) -> bool {
        let state = self.state.get();
        if state.contains(State::COMPLETE) {
            return false;
        }
        self.state
            .set((state - (State::QUEUED | State::NOTIFIED)) | State::POLLING);
        true
    }

    fn end_poll_pending(&self) -> PollResult {
        let mut state = self.state.get();
        state.remove(State::POLLING);
        if state.contains(State::NOTIFIED) {
            state.remove(State::NOTIFIED);
            state.insert(State::QUEUED);
            self.state.set(state);
            PollResult::PendingSchedule
        } else {
            self.state.set(state);
            PollResult::Pending
        }
    }

    fn complete(&self) {
        let state = self.state.get();
        self.state
            .set((state - (State::POLLING | State::QUEUED | State::NOTIFIED)) | State::COMPLETE);
    }
}

// === impl Task ===

impl<F> Task<F>
where
    F: Future + 'static,
    F::Output: 'static,
{
    pub(crate) fn new(future: F, id: Id, span: tracing::Span) -> Rc<Self> {
        Rc::new(Self {
            header: Header::new(id, span),
            stage: RefCell::new(Stage::Pending(future)),
            failure: RefCell::new(None),
            join_waiters: WaitList::new(),
        })
    }

    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::clone_waker,
        Self::wake_by_val,
        Self::wake_by_ref,
        Self::drop_waker,
    );

    // `Waker::will_wake` compares data and vtable pointers. Keeping this out
    // of line keeps the vtable address stable across clones, so wakers for
    // the same task keep comparing equal.
    #[inline(never)]
    fn raw_waker(this: *const Self) -> RawWaker {
        RawWaker::new(this.cast::<()>(), &Self::WAKER_VTABLE)
    }

    // === Waker vtable methods ===
    //
    // A waker is one reference to the task allocation, carried as a raw
    // pointer. `clone` increments the count, `drop` decrements it, `wake`
    // consumes it. The wake path only flips state bits and appends to the
    // thread-local ready queue; it never polls.

    unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
        // Safety: `ptr` is a task reference held by the waker being cloned,
        // so the allocation is live; the clone gets its own reference.
        unsafe { Rc::increment_strong_count(ptr.cast::<Self>()) };
        Self::raw_waker(ptr.cast::<Self>())
    }

    unsafe fn wake_by_val(ptr: *const ()) {
        // Safety: forwarded to `wake_by_ref`/`drop_waker`, which uphold the
        // reference accounting; the waker's own reference is consumed here.
        unsafe {
            Self::wake_by_ref(ptr);
            Self::drop_waker(ptr);
        }
    }

    unsafe fn wake_by_ref(ptr: *const ()) {
        // Safety: the waker holds a reference, so the allocation is live.
        let this = unsafe { &*ptr.cast::<Self>() };
        tracing::trace!(task.id = %this.header.id, "Task::wake_by_ref");

        if this.header.transition_to_queued() {
            // Safety: incrementing on behalf of the queue's new reference,
            // immediately materialized with `from_raw` below.
            unsafe { Rc::increment_strong_count(ptr.cast::<Self>()) };
            // Safety: balances the increment above.
            let task = unsafe { Rc::from_raw(ptr.cast::<Self>()) };
            Scheduler::with(|scheduler| scheduler.enqueue(TaskRef(task)));
        }
    }

    unsafe fn drop_waker(ptr: *const ()) {
        // Safety: consumes the reference owned by the waker.
        drop(unsafe { Rc::from_raw(ptr.cast::<Self>()) });
    }
}

impl<F> RawTask for Task<F>
where
    F: Future + 'static,
    F::Output: 'static,
{
    fn header(&self) -> &Header {
        &self.header
    }

    fn poll_task(&self) -> PollResult {
        let _span = self.header.span.enter();

        if !self.header.start_poll() {
            tracing::warn!(task.id = %self.header.id, "refusing to poll completed task");
            return PollResult::Ready;
        }

        // Wrap the self-waker in `ManuallyDrop`: it is converted from the
        // reference the scheduler is currently holding rather than from a
        // fresh one, so dropping it must not decrement the count. Clones
        // handed out during the poll get their own reference.
        let ptr: *const Self = self;
        // Safety: the vtable above upholds the single-threaded reference
        // accounting; `ptr` stays valid for the duration of the poll.
        let waker = mem::ManuallyDrop::new(unsafe { Waker::from_raw(Self::raw_waker(ptr)) });
        let mut cx = Context::from_waker(&waker);

        let poll = {
            let mut stage = self.stage.borrow_mut();
            stage.poll(&mut cx, self.header.id)
        };

        match poll {
            Poll::Pending => self.header.end_poll_pending(),
            Poll::Ready(maybe_failure) => {
                if let Some(error) = maybe_failure {
                    tracing::trace!(task.id = %self.header.id, %error, "task failed");
                    *self.failure.borrow_mut() = Some(error);
                }
                self.header.complete();

                // terminal suspension: drain every join waiter onto the
                // ready queue, in enrolment order
                let woken = self.join_waiters.wake_all();
                if woken > 0 {
                    PollResult::ReadyJoined
                } else {
                    PollResult::Ready
                }
            }
        }
    }

    fn join_waiters(&self) -> &WaitList {
        &self.join_waiters
    }

    fn failure(&self) -> Option<JoinError> {
        self.failure.borrow().clone()
    }
}

impl<F> Joinable<F::Output> for Task<F>
where
    F: Future + 'static,
    F::Output: 'static,
{
    fn take_output(&self) -> Option<F::Output> {
        let mut stage = self.stage.borrow_mut();
        if matches!(*stage, Stage::Ready(_)) {
            match mem::replace(&mut *stage, Stage::Consumed) {
                Stage::Ready(output) => Some(output),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }
}

// === impl Stage ===

impl<F: Future> Stage<F> {
    /// Polls the future. On completion the output is written back into the
    /// stage; a panic is turned into a [`JoinError`].
    fn poll(&mut self, cx: &mut Context<'_>, id: Id) -> Poll<Option<JoinError>> {
        struct Guard<'a, T: Future> {
            stage: &'a mut Stage<T>,
        }
        impl<T: Future> Drop for Guard<'_, T> {
            fn drop(&mut self) {
                // If the future panics on poll, it is dropped inside the
                // panic guard.
                *self.stage = Stage::Consumed;
            }
        }

        let poll = AssertUnwindSafe(|| -> Poll<F::Output> {
            let guard = Guard { stage: self };

            let Stage::Pending(future) = guard.stage else {
                unreachable!("task polled after completion");
            };

            // Safety: the task allocation is never moved out of its `Rc`, so
            // the future is pinned for its entire lifetime.
            let future = unsafe { Pin::new_unchecked(future) };
            let res = future.poll(cx);
            mem::forget(guard);
            res
        });

        match std::panic::catch_unwind(poll) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => {
                *self = Stage::Ready(output);
                Poll::Ready(None)
            }
            Err(payload) => Poll::Ready(Some(JoinError::panicked(id, payload))),
        }
    }
}
