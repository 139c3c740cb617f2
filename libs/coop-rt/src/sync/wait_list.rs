// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::{Cell, RefCell};
use core::task::{Context, Waker};
use std::collections::VecDeque;
use std::rc::Rc;

/// A queue of waiting tasks which can be woken in first-in, first-out order,
/// or all at once.
///
/// This is the building block behind join waiters, blocked channel receivers
/// and `WaitGroup` waiters: a task that cannot make progress enrols its waker
/// and suspends; the owning primitive later wakes the front of the queue (or
/// the whole queue) to re-enqueue the blocked tasks on the scheduler, in
/// exactly the order they enrolled.
///
/// Entries are handed back to the enrolling future as `Rc<WaitEntry>` so a
/// future that is dropped mid-wait can remove itself ([`cancel`]), and a
/// future that is polled spuriously can refresh its waker in place without
/// losing its position ([`WaitEntry::register`]).
///
/// [`cancel`]: Self::cancel
#[derive(Debug, Default)]
pub(crate) struct WaitList {
    entries: RefCell<VecDeque<Rc<WaitEntry>>>,
}

/// A single waiter in a [`WaitList`].
#[derive(Debug)]
pub(crate) struct WaitEntry {
    waker: RefCell<Waker>,
    woken: Cell<bool>,
}

// === impl WaitList ===

impl WaitList {
    pub(crate) const fn new() -> Self {
        Self {
            entries: RefCell::new(VecDeque::new()),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Enrol a new waiter at the back of the queue.
    pub(crate) fn enrol(&self, waker: Waker) -> Rc<WaitEntry> {
        let entry = Rc::new(WaitEntry {
            waker: RefCell::new(waker),
            woken: Cell::new(false),
        });
        self.entries.borrow_mut().push_back(entry.clone());
        entry
    }

    /// Wake the front of the queue. Returns `false` if the queue was empty.
    pub(crate) fn wake_one(&self) -> bool {
        let entry = self.entries.borrow_mut().pop_front();
        if let Some(entry) = entry {
            entry.woken.set(true);
            entry.waker.borrow().wake_by_ref();
            true
        } else {
            false
        }
    }

    /// Wake every enrolled waiter, in enrolment order. Returns how many were
    /// woken.
    pub(crate) fn wake_all(&self) -> usize {
        // drain first, wake after: waking enqueues tasks on the scheduler and
        // must not observe this list mid-mutation
        let entries: Vec<_> = self.entries.borrow_mut().drain(..).collect();
        let woken = entries.len();
        for entry in entries {
            entry.woken.set(true);
            entry.waker.borrow().wake_by_ref();
        }
        woken
    }

    /// Remove `entry` without waking it. Used by wait futures dropped
    /// mid-wait.
    pub(crate) fn cancel(&self, entry: &Rc<WaitEntry>) {
        self.entries
            .borrow_mut()
            .retain(|other| !Rc::ptr_eq(other, entry));
    }
}

// === impl WaitEntry ===

impl WaitEntry {
    /// Refresh the stored waker from `cx` if it would wake a different task.
    pub(crate) fn register(&self, cx: &Context<'_>) {
        let mut waker = self.waker.borrow_mut();
        if !waker.will_wake(cx.waker()) {
            *waker = cx.waker().clone();
        }
    }

    /// `true` once this entry has been woken (and thus left the queue).
    pub(crate) fn is_woken(&self) -> bool {
        self.woken.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    fn counting_waker(log: Rc<StdRefCell<Vec<usize>>>, id: usize) -> Waker {
        use core::task::{RawWaker, RawWakerVTable};

        struct Data {
            log: Rc<StdRefCell<Vec<usize>>>,
            id: usize,
        }

        const VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_data);

        unsafe fn clone(ptr: *const ()) -> RawWaker {
            // Safety: `ptr` is an `Rc<Data>` owned by the waker being cloned.
            unsafe { Rc::increment_strong_count(ptr.cast::<Data>()) };
            RawWaker::new(ptr, &VTABLE)
        }
        unsafe fn wake(ptr: *const ()) {
            // Safety: consumes the waker's reference.
            let data = unsafe { Rc::from_raw(ptr.cast::<Data>()) };
            data.log.borrow_mut().push(data.id);
        }
        unsafe fn wake_by_ref(ptr: *const ()) {
            // Safety: the waker owns a reference, the allocation is live.
            let data = unsafe { &*ptr.cast::<Data>() };
            data.log.borrow_mut().push(data.id);
        }
        unsafe fn drop_data(ptr: *const ()) {
            // Safety: consumes the waker's reference.
            drop(unsafe { Rc::from_raw(ptr.cast::<Data>()) });
        }

        let raw = RawWaker::new(Rc::into_raw(Rc::new(Data { log, id })).cast::<()>(), &VTABLE);
        // Safety: the vtable above upholds the reference-counting contract.
        unsafe { Waker::from_raw(raw) }
    }

    #[test]
    fn wake_one_is_fifo() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let list = WaitList::new();

        let entries: Vec<_> = (0..3)
            .map(|i| list.enrol(counting_waker(log.clone(), i)))
            .collect();

        assert!(list.wake_one());
        assert!(list.wake_one());
        assert!(list.wake_one());
        assert!(!list.wake_one());

        assert_eq!(*log.borrow(), [0, 1, 2]);
        assert!(entries.iter().all(|e| e.is_woken()));
    }

    #[test]
    fn wake_all_preserves_enrolment_order() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let list = WaitList::new();

        for i in 0..4 {
            let _entry = list.enrol(counting_waker(log.clone(), i));
        }

        assert_eq!(list.wake_all(), 4);
        assert_eq!(*log.borrow(), [0, 1, 2, 3]);
        assert!(list.is_empty());
    }

    #[test]
    fn cancel_removes_without_waking() {
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let list = WaitList::new();

        let first = list.enrol(counting_waker(log.clone(), 0));
        let _second = list.enrol(counting_waker(log.clone(), 1));

        list.cancel(&first);
        assert_eq!(list.len(), 1);

        list.wake_all();
        assert_eq!(*log.borrow(), [1]);
        assert!(!first.is_woken());
    }
}
