// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::task::{PollResult, TaskRef};
use core::cell::{Cell, RefCell};
use core::marker::PhantomData;
use core::pin::pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::collections::VecDeque;
use std::rc::Rc;
use static_assertions::assert_not_impl_any;

std::thread_local! {
    static SCHEDULER: Scheduler = Scheduler::new();
}

/// The per-thread FIFO scheduler.
///
/// There is exactly one `Scheduler` per OS thread, reached through
/// [`Scheduler::with`]. It is the single point of dispatch for every wake-up
/// in the runtime: channels, wait groups, join handles and user awaitables
/// all wake tasks by appending them to this queue, never by polling them
/// directly. Two threads each have their own scheduler and share nothing.
#[derive(Debug)]
pub struct Scheduler {
    run_queue: RefCell<VecDeque<TaskRef>>,
    /// Set while `run` is dispatching, to catch re-entrant drive calls.
    running: Cell<bool>,
    _m: PhantomData<*mut u8>,
}

assert_not_impl_any!(Scheduler: Send, Sync);

/// Counters describing one [`Scheduler::run`] invocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// The total number of tasks polled during this run.
    pub polled: usize,

    /// The number of polled tasks that *completed* during this run.
    ///
    /// This is always <= `self.polled`.
    pub completed: usize,
}

/// Drain the current thread's ready queue. See [`Scheduler::run`].
pub fn run() -> Tick {
    Scheduler::with(Scheduler::run)
}

/// Discard every queued task reference without resuming any of them. See
/// [`Scheduler::clear`].
pub fn clear() {
    Scheduler::with(Scheduler::clear);
}

/// Drive `future` to completion on the current thread. See
/// [`Scheduler::block_on`].
pub fn block_on<F: Future>(future: F) -> F::Output {
    Scheduler::with(|scheduler| scheduler.block_on(future))
}

// === impl Scheduler ===

impl Scheduler {
    fn new() -> Self {
        Self {
            run_queue: RefCell::new(VecDeque::new()),
            running: Cell::new(false),
            _m: PhantomData,
        }
    }

    /// Run `f` with the current thread's scheduler.
    pub fn with<R>(f: impl FnOnce(&Scheduler) -> R) -> R {
        SCHEDULER.with(f)
    }

    /// Append `task` to the ready queue.
    ///
    /// Never polls. Wakers funnel through here after winning the
    /// queued-transition on their task, so a task appears at most once in the
    /// queue; waking an already-queued task is a no-op.
    pub(crate) fn enqueue(&self, task: TaskRef) {
        if task.is_complete() {
            tracing::trace!(task.id = %task.id(), "discarding enqueue of completed task");
            return;
        }
        tracing::trace!(task.id = %task.id(), "enqueue");
        self.run_queue.borrow_mut().push_back(task);
    }

    /// Drain the ready queue.
    ///
    /// Pops the head of the queue and polls it, repeating until the queue is
    /// empty. A poll may enqueue further tasks (including the polled task
    /// itself); those are dispatched within the same call, in the order they
    /// were enqueued. Task references whose task has completed in the
    /// meantime are skipped.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a task; tasks yield to the scheduler by
    /// `.await`ing, not by re-entering it.
    pub fn run(&self) -> Tick {
        assert!(
            !self.running.replace(true),
            "Scheduler::run called re-entrantly from inside a task"
        );

        let mut tick = Tick::default();

        loop {
            let task = self.run_queue.borrow_mut().pop_front();
            let Some(task) = task else { break };

            // the queued reference may have outlived its task's completion
            if task.is_complete() {
                tracing::trace!(task.id = %task.id(), "skipping dispatch of completed task");
                continue;
            }

            tick.polled += 1;
            match task.poll() {
                PollResult::Ready | PollResult::ReadyJoined => tick.completed += 1,
                PollResult::Pending => {}
                // the task woke itself while it was being polled
                PollResult::PendingSchedule => self.run_queue.borrow_mut().push_back(task),
            }
        }

        self.running.set(false);
        tracing::trace!(?tick, "scheduler run finished");
        tick
    }

    /// Discard all queued task references without resuming them.
    ///
    /// The discarded tasks remain suspended; a later wake-up re-enqueues
    /// them as usual.
    pub fn clear(&self) {
        let queue = core::mem::take(&mut *self.run_queue.borrow_mut());
        tracing::trace!(discarded = queue.len(), "scheduler cleared");
        for task in queue {
            // allow future wake-ups to re-enqueue
            task.forget_queued();
        }
    }

    fn is_empty(&self) -> bool {
        self.run_queue.borrow().is_empty()
    }

    /// Drive `future` to completion on the current thread, interleaving the
    /// ready queue.
    ///
    /// The root future is polled whenever it has been woken; between polls
    /// the ready queue is drained with [`run`](Self::run). Returns the root
    /// future's output.
    ///
    /// # Panics
    ///
    /// Panics if the root future is pending while the ready queue is empty
    /// and no wake-up is in flight: with neither timers nor preemption, no
    /// event could ever unblock such a program (cooperative deadlock).
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _span = tracing::debug_span!("block_on").entered();

        let woken = Rc::new(Cell::new(true));
        let waker = root_waker(woken.clone());
        let mut cx = Context::from_waker(&waker);

        let mut future = pin!(future);

        loop {
            if woken.replace(false) {
                if let Poll::Ready(v) = future.as_mut().poll(&mut cx) {
                    return v;
                }
            }

            self.run();

            if !woken.get() && self.is_empty() {
                panic!(
                    "deadlock: the root future is pending, the ready queue is empty, \
                     and no task has been woken"
                );
            }
        }
    }
}

/// A waker that records wake-ups of the `block_on` root future in a shared
/// flag. The root future is not a task; it is re-polled by the drive loop
/// instead of going through the ready queue.
fn root_waker(woken: Rc<Cell<bool>>) -> Waker {
    const VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_flag);

    unsafe fn clone(ptr: *const ()) -> RawWaker {
        // Safety: `ptr` came out of `Rc::into_raw` below and the refcount is
        // owned by the waker being cloned.
        unsafe { Rc::increment_strong_count(ptr.cast::<Cell<bool>>()) };
        RawWaker::new(ptr, &VTABLE)
    }
    unsafe fn wake(ptr: *const ()) {
        // Safety: consumes the refcount owned by the waker.
        let flag = unsafe { Rc::from_raw(ptr.cast::<Cell<bool>>()) };
        flag.set(true);
    }
    unsafe fn wake_by_ref(ptr: *const ()) {
        // Safety: the waker owns a refcount, so the allocation is live.
        unsafe { (*ptr.cast::<Cell<bool>>()).set(true) };
    }
    unsafe fn drop_flag(ptr: *const ()) {
        // Safety: consumes the refcount owned by the waker.
        drop(unsafe { Rc::from_raw(ptr.cast::<Cell<bool>>()) });
    }

    let raw = RawWaker::new(Rc::into_raw(woken).cast::<()>(), &VTABLE);
    // Safety: the vtable above upholds the `RawWaker` contract for a
    // single-threaded waker; see the crate docs on thread affinity.
    unsafe { Waker::from_raw(raw) }
}
