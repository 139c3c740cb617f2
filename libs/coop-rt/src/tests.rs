// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios driving the whole runtime: scheduler, tasks,
//! channels and wait groups together.

use crate::sync::{Channel, WaitGroup};
use crate::task::yield_now;
use crate::test_util::trace_init;
use crate::{block_on, run, spawn};
use core::cell::{Cell, RefCell};
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::rc::Rc;

#[test]
fn producer_consumer_buffered() {
    let _trace = trace_init();

    let received = Rc::new(RefCell::new(Vec::new()));

    let rec = received.clone();
    block_on(async move {
        let ch = Channel::new(2);

        let tx = ch.clone();
        let producer = spawn(async move {
            for i in 1..=3 {
                assert!(tx.send(i).await);
            }
            tx.close();
        });

        let rx = ch.clone();
        let consumer = spawn(async move {
            while let Some(v) = rx.recv().await {
                // the parked third value must never overflow the buffer
                assert!(rx.len() <= rx.capacity());
                rec.borrow_mut().push(v);
            }
        });

        producer.await.unwrap();
        consumer.await.unwrap();
    });

    assert_eq!(*received.borrow(), [1, 2, 3]);
}

#[test]
fn producer_consumer_rendezvous() {
    let _trace = trace_init();

    block_on(async {
        let ch = Channel::new(0);

        let tx = ch.clone();
        let producer = spawn(async move {
            assert!(tx.send(10).await);
        });

        assert_eq!(ch.recv().await, Some(10));
        producer.await.unwrap();
    });
}

#[test]
fn one_producer_two_consumers_rendezvous() {
    let _trace = trace_init();

    let received = Rc::new(RefCell::new(Vec::new()));
    let drained = Rc::new(Cell::new(0_usize));

    let rec = received.clone();
    let dra = drained.clone();
    block_on(async move {
        let ch = Channel::new(0);

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let rx = ch.clone();
                let received = rec.clone();
                let drained = dra.clone();
                spawn(async move {
                    while let Some(v) = rx.recv().await {
                        received.borrow_mut().push(v);
                    }
                    drained.set(drained.get() + 1);
                })
            })
            .collect();

        let tx = ch.clone();
        let producer = spawn(async move {
            for i in 1..=3 {
                assert!(tx.send(i).await);
            }
            tx.close();
        });

        producer.await.unwrap();
        for consumer in consumers {
            consumer.await.unwrap();
        }
    });

    // exactly three values, no duplicates, no loss; both consumers see the
    // closed channel
    let mut values = received.borrow().clone();
    values.sort_unstable();
    assert_eq!(values, [1, 2, 3]);
    assert_eq!(drained.get(), 2);
}

#[test]
fn wait_group_fan_in() {
    let _trace = trace_init();

    let completed = Rc::new(Cell::new(0_usize));

    let comp = completed.clone();
    block_on(async move {
        let wg = WaitGroup::new();
        wg.add(3);

        for _ in 0..3 {
            let wg = wg.clone();
            let completed = comp.clone();
            spawn(async move {
                let _guard = wg.guard();
                yield_now().await;
                completed.set(completed.get() + 1);
            });
        }

        wg.wait().await;

        // the barrier must not release before every worker finished
        assert_eq!(comp.get(), 3);
        assert_eq!(wg.count(), 0);
    });
}

#[test]
fn wait_group_broadcast_happens_in_one_run() {
    let _trace = trace_init();

    let wg = WaitGroup::new();
    wg.add(1);

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let wg = wg.clone();
            spawn(async move {
                wg.wait().await;
            })
        })
        .collect();

    let finisher = {
        let wg = wg.clone();
        spawn(async move {
            wg.done();
        })
    };

    // one drain: the waiters park, the finisher drives the counter to zero,
    // and the woken waiters resolve before the queue empties
    run();

    assert!(finisher.is_complete());
    assert!(waiters.iter().all(|w| w.is_complete()));
}

#[test]
fn failure_propagates_to_joiner_but_not_to_siblings() {
    let _trace = trace_init();

    let observed = Rc::new(RefCell::new(None));
    let sibling_ran = Rc::new(Cell::new(false));

    let obs = observed.clone();
    let sib = sibling_ran.clone();
    block_on(async move {
        let failing = spawn(async {
            yield_now().await;
            panic!("E");
        });

        let join = failing.join();
        let joiner = spawn(async move {
            *obs.borrow_mut() = Some(join.await);
        });

        let sibling = spawn(async move {
            yield_now().await;
            sib.set(true);
        });

        joiner.await.unwrap();
        sibling.await.unwrap();

        // the failure stays inspectable after being re-raised
        let captured = failing.failure().expect("failure must be captured");
        assert_eq!(captured.payload().downcast_ref::<&str>().copied(), Some("E"));
    });

    let raised = observed.borrow_mut().take().expect("joiner must have run");
    let error = raised.unwrap_err();
    assert_eq!(error.payload().downcast_ref::<&str>().copied(), Some("E"));
    assert!(sibling_ran.get());
}

#[test]
fn blocked_receivers_are_served_in_fifo_order() {
    let _trace = trace_init();

    let results = Rc::new(RefCell::new(Vec::new()));

    let res = results.clone();
    block_on(async move {
        let ch = Channel::new(0);

        let receivers: Vec<_> = (0..3)
            .map(|i| {
                let rx = ch.clone();
                let results = res.clone();
                spawn(async move {
                    let v = rx.recv().await.unwrap();
                    results.borrow_mut().push((i, v));
                })
            })
            .collect();

        // let all three receivers park, in spawn order
        yield_now().await;

        let tx = ch.clone();
        let sender = spawn(async move {
            for v in [100, 200, 300] {
                assert!(tx.send(v).await);
            }
        });

        sender.await.unwrap();
        for receiver in receivers {
            receiver.await.unwrap();
        }
    });

    assert_eq!(*results.borrow(), [(0, 100), (1, 200), (2, 300)]);
}

#[test]
fn close_wakes_everybody() {
    let _trace = trace_init();

    block_on(async {
        let ch = Channel::new(1);
        assert!(ch.send('A').await);

        let tx = ch.clone();
        let blocked = spawn(async move { tx.send('B').await });

        // let the second sender park on the full buffer
        yield_now().await;

        let closer = ch.clone();
        let observer = spawn(async move {
            closer.close();
        });

        observer.await.unwrap();
        assert!(!blocked.await.unwrap(), "the parked send must resolve false");

        assert_eq!(ch.recv().await, Some('A'));
        assert_eq!(ch.recv().await, None);
    });
}

#[test]
fn shutdown_by_closing_a_shared_channel() {
    let _trace = trace_init();

    let finished = Rc::new(Cell::new(0_usize));

    let fin = finished.clone();
    block_on(async move {
        let ch = Channel::<u32>::new(0);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let rx = ch.clone();
                let finished = fin.clone();
                spawn(async move {
                    while let Some(_work) = rx.recv().await {}
                    finished.set(finished.get() + 1);
                })
            })
            .collect();

        // everybody parks, then the close broadcast winds them all down
        yield_now().await;
        ch.close();

        for worker in workers {
            worker.await.unwrap();
        }
    });

    assert_eq!(finished.get(), 4);
}

/// An external event source, bridged into the runtime the only supported
/// way: the awaitable stores the task's waker, the event source wakes it
/// (which enqueues the task), and the event loop then drives the scheduler.
#[derive(Default)]
struct Event {
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

struct EventWait {
    event: Rc<Event>,
}

impl Event {
    fn fire(&self) {
        self.fired.set(true);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

impl Future for EventWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.event.fired.get() {
            Poll::Ready(())
        } else {
            *self.event.waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[test]
fn external_awaiter_round_trip() {
    let _trace = trace_init();

    let event = Rc::new(Event::default());
    let resumed = Rc::new(Cell::new(false));

    let handle = {
        let event = event.clone();
        let resumed = resumed.clone();
        spawn(async move {
            EventWait { event }.await;
            resumed.set(true);
        })
    };

    // first drive: the task suspends on the event
    run();
    assert!(!resumed.get());
    assert!(!handle.is_complete());

    // the event fires "from outside", enqueuing the stored task; the next
    // drive resumes it
    event.fire();
    run();
    assert!(resumed.get());
    assert!(handle.is_complete());
}

#[test]
fn pipeline_of_channels() {
    let _trace = trace_init();

    let out = Rc::new(RefCell::new(Vec::new()));

    let sink = out.clone();
    block_on(async move {
        let first = Channel::new(1);
        let second = Channel::new(1);

        let (rx, tx) = (first.clone(), second.clone());
        let doubler = spawn(async move {
            while let Some(v) = rx.recv().await {
                assert!(tx.send(v * 2).await);
            }
            tx.close();
        });

        let tx = first.clone();
        let feeder = spawn(async move {
            for i in 1..=4 {
                assert!(tx.send(i).await);
            }
            tx.close();
        });

        while let Some(v) = second.recv().await {
            sink.borrow_mut().push(v);
        }

        feeder.await.unwrap();
        doubler.await.unwrap();
    });

    assert_eq!(*out.borrow(), [2, 4, 6, 8]);
}
