// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;
use core::fmt;

/// An opaque ID that uniquely identifies a task relative to all other tasks
/// spawned on the same thread.
///
/// # Notes
///
/// - Task IDs are allocated per thread; two tasks on different threads may
///   share an ID.
/// - Task IDs are *not* reused, but they carry no meaning beyond identity.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Id(u64);

std::thread_local! {
    static NEXT_ID: Cell<u64> = const { Cell::new(1) };
}

impl Id {
    pub(crate) fn next() -> Self {
        NEXT_ID.with(|next| {
            let id = next.get();
            next.set(id + 1);
            Self(id)
        })
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
