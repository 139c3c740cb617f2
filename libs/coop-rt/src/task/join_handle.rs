// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Id, Joinable, TaskRef};
use crate::sync::wait_list::WaitEntry;
use core::any::Any;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use pin_project::{pin_project, pinned_drop};
use static_assertions::assert_not_impl_any;
use std::rc::Rc;

/// An owned handle to a spawned task.
///
/// Awaiting the handle resolves to the task's output once the task completes
/// (or to the captured [`JoinError`] if it panicked); the output can be taken
/// exactly once. To observe completion without consuming the output, or from
/// more than one place, use [`join`](Self::join).
///
/// Dropping the handle *detaches* the task: it keeps running to completion
/// on its scheduler, and its eventual output is dropped. A task that was
/// built but never [`start`](Self::start)ed is dropped together with its
/// last handle.
pub struct JoinHandle<T> {
    raw: Rc<dyn Joinable<T>>,
    task: TaskRef,
    waiter: Option<Rc<WaitEntry>>,
}

assert_not_impl_any!(JoinHandle<()>: Send, Sync);

/// Awaitable for a task's completion. Returned by [`JoinHandle::join`].
///
/// Resolves to `Ok(())` when the task completes, or re-raises the task's
/// captured failure as `Err(`[`JoinError`]`)`. Any number of `Join`s may
/// exist for the same task; on completion they are woken in the order they
/// first suspended. A `Join` does not borrow the handle, so it can be moved
/// into another task.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Join {
    task: TaskRef,
    waiter: Option<Rc<WaitEntry>>,
}

/// A task failed.
///
/// Carries the panic payload captured at the task's terminal suspension. The
/// payload is shared: every clone observes the same failure, so a task's
/// failure can be re-raised to any number of joiners as well as inspected
/// through [`JoinHandle::failure`].
#[derive(Clone)]
pub struct JoinError {
    task: Id,
    payload: Rc<Box<dyn Any + Send + 'static>>,
}

// === impl JoinHandle ===

impl<T> JoinHandle<T> {
    pub(crate) fn new(raw: Rc<dyn Joinable<T>>, task: TaskRef) -> Self {
        Self {
            raw,
            task,
            waiter: None,
        }
    }

    /// Returns the task's ID.
    pub fn id(&self) -> Id {
        self.task.id()
    }

    /// Enqueue the task for its first poll.
    ///
    /// Tasks created through [`Builder::build`](super::Builder::build) sit at
    /// their initial suspension point until started; [`spawn`](super::spawn)
    /// starts the task for you. Starting an already-started or completed
    /// task is a no-op.
    pub fn start(&self) {
        self.task.wake();
    }

    /// Returns `true` once the task has run to completion.
    pub fn is_complete(&self) -> bool {
        self.task.is_complete()
    }

    /// Returns the task's captured failure, without re-raising it.
    ///
    /// `None` while the task has not yet completed, and for tasks that
    /// completed successfully.
    pub fn failure(&self) -> Option<JoinError> {
        self.task.failure()
    }

    /// Returns an awaitable for this task's completion.
    ///
    /// See [`Join`].
    pub fn join(&self) -> Join {
        Join {
            task: self.task.clone(),
            waiter: None,
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.task.is_complete() {
            this.waiter = None;
            if let Some(error) = this.task.failure() {
                return Poll::Ready(Err(error));
            }
            let output = this
                .raw
                .take_output()
                .expect("JoinHandle polled after completion");
            return Poll::Ready(Ok(output));
        }

        match &this.waiter {
            Some(entry) => entry.register(cx),
            None => this.waiter = Some(this.task.join_waiters().enrol(cx.waker().clone())),
        }
        Poll::Pending
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if let Some(entry) = self.waiter.take() {
            if !entry.is_woken() {
                self.task.join_waiters().cancel(&entry);
            }
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

// === impl Join ===

impl Future for Join {
    type Output = Result<(), JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if this.task.is_complete() {
            *this.waiter = None;
            return Poll::Ready(match this.task.failure() {
                Some(error) => Err(error),
                None => Ok(()),
            });
        }

        match this.waiter {
            Some(entry) => entry.register(cx),
            None => *this.waiter = Some(this.task.join_waiters().enrol(cx.waker().clone())),
        }
        Poll::Pending
    }
}

#[pinned_drop]
impl PinnedDrop for Join {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if let Some(entry) = this.waiter.take() {
            if !entry.is_woken() {
                this.task.join_waiters().cancel(&entry);
            }
        }
    }
}

impl fmt::Debug for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Join").field("task", &self.task).finish_non_exhaustive()
    }
}

// === impl JoinError ===

impl JoinError {
    pub(crate) fn panicked(task: Id, payload: Box<dyn Any + Send + 'static>) -> Self {
        Self {
            task,
            payload: Rc::new(payload),
        }
    }

    /// The ID of the task that failed.
    pub fn task_id(&self) -> Id {
        self.task
    }

    /// The captured panic payload.
    pub fn payload(&self) -> &(dyn Any + Send + 'static) {
        &**self.payload
    }

    /// Consume the error, returning the panic payload if this is the last
    /// reference to it. The payload can be handed to
    /// [`std::panic::resume_unwind`] to re-raise it.
    ///
    /// # Errors
    ///
    /// Returns the error unchanged when other clones (other joiners, the
    /// task's own failure slot) still share the payload.
    pub fn try_into_panic(self) -> Result<Box<dyn Any + Send + 'static>, Self> {
        Rc::try_unwrap(self.payload).map_err(|payload| Self {
            task: self.task,
            payload,
        })
    }

    /// The panic message, if the payload was a string.
    fn panic_message(&self) -> Option<&str> {
        let payload = self.payload();
        if let Some(msg) = payload.downcast_ref::<&'static str>() {
            Some(*msg)
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            Some(msg.as_str())
        } else {
            None
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.panic_message() {
            Some(msg) => write!(f, "task {} panicked: {msg}", self.task),
            None => write!(f, "task {} panicked", self.task),
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinError")
            .field("task", &self.task)
            .field("message", &self.panic_message())
            .finish_non_exhaustive()
    }
}

impl core::error::Error for JoinError {}
