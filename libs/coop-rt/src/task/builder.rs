// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use super::{Id, JoinHandle, Joinable, Task, TaskRef};
use core::any::type_name;
use core::panic::Location;
use std::rc::Rc;

/// Configures a task before it is spawned.
#[derive(Debug, Default)]
pub struct Builder<'a> {
    name: Option<&'a str>,
}

impl<'a> Builder<'a> {
    pub const fn new() -> Self {
        Self { name: None }
    }

    /// Override the name of tasks spawned by this builder.
    ///
    /// By default, tasks are unnamed. The name only shows up in debug
    /// messages and spans.
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Create the task without enqueuing it.
    ///
    /// The task sits at its initial suspension point until
    /// [`JoinHandle::start`] moves it into the ready queue. Dropping the
    /// handle of a never-started task drops the future unpolled.
    #[track_caller]
    pub fn build<F>(self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let id = Id::next();

        let loc = Location::caller();
        let span = tracing::trace_span!(
            "task",
            task.id = id.as_u64(),
            task.name = ?self.name,
            task.output = %type_name::<F::Output>(),
            loc.file = loc.file(),
            loc.line = loc.line(),
        );

        let task = Task::new(future, id, span);
        let raw: Rc<dyn Joinable<F::Output>> = task.clone();
        JoinHandle::new(raw, TaskRef::new(task))
    }

    /// Create the task and enqueue it for its first poll.
    #[track_caller]
    pub fn spawn<F>(self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let handle = self.build(future);
        handle.start();
        handle
    }
}
