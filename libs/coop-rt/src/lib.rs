// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-threaded cooperative runtime.
//!
//! `coop-rt` schedules many lightweight tasks on one OS thread through a
//! single FIFO ready queue. Tasks are plain [`Future`]s; they give up control
//! only at `.await` points, so exactly one task runs at any instant and no
//! locking is required anywhere in the runtime. On top of the scheduler the
//! crate provides Go-style message passing ([`sync::Channel`]) and a fan-in
//! barrier ([`sync::WaitGroup`]).
//!
//! ```
//! use coop_rt::sync::Channel;
//!
//! coop_rt::block_on(async {
//!     let ch = Channel::new(2);
//!
//!     let tx = ch.clone();
//!     let producer = coop_rt::spawn(async move {
//!         for i in 0..3 {
//!             tx.send(i).await;
//!         }
//!         tx.close();
//!     });
//!
//!     let mut received = Vec::new();
//!     while let Some(v) = ch.recv().await {
//!         received.push(v);
//!     }
//!
//!     producer.await.unwrap();
//!     assert_eq!(received, [0, 1, 2]);
//! });
//! ```
//!
//! # Wake-ups
//!
//! Every wake-up in the runtime goes through the thread-local scheduler:
//! waking a task appends it to the ready queue and nothing else. Tasks are
//! only ever polled by [`run`] (or the [`block_on`] drive loop), which drains
//! the queue in strict FIFO order. If two events wake tasks, the task woken
//! first is resumed first.
//!
//! # Bridging external events
//!
//! There is no reactor and no timer. To await an external event source,
//! implement a [`Future`] whose `poll` returns the result if it is already
//! available, and otherwise stores `cx.waker()` with the event source. When
//! the event fires, `wake()` enqueues the task; a subsequent call to [`run`]
//! resumes it. Resuming a task by any other means than the scheduler is not
//! supported. The waker must stay on the thread it was created on; this
//! runtime is per-thread and sharing its handles across threads is not
//! possible (they are `!Send`).
//!
//! # Shutdown
//!
//! There is no way to cancel a running task from the outside. The supported
//! shutdown path is cooperative: [`sync::Channel::close`] wakes every blocked
//! sender and receiver, which then observe `false`/`None` and wind down on
//! their own.

mod scheduler;
pub mod sync;
pub mod task;

pub use scheduler::{Scheduler, Tick, block_on, clear, run};
pub use task::{Builder, JoinError, JoinHandle, spawn, yield_now};

#[cfg(test)]
mod test_util;
#[cfg(test)]
mod tests;
