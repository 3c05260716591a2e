// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::VecDeque;
use std::thread;

use log::debug;

use crate::interrupt;
use crate::threads::ThreadId;
use crate::tls::Environment;

/// A counting semaphore.
///
/// `up` hands its unit straight to the longest waiting thread: a thread
/// that is woken can't lose the unit to another thread that calls `down`
/// before the woken one gets to run.
#[derive(Debug)]
pub struct Semaphore {
    name: String,
    inner: spin::Mutex<SemaphoreInner>,
}

#[derive(Debug)]
struct SemaphoreInner {
    value: usize,
    /// Threads blocked in `down`, oldest first.
    waiters: VecDeque<ThreadId>,
    /// Woken threads that own one unit of `value` but haven't run yet.
    granted: Vec<ThreadId>,
}

impl Semaphore {
    pub fn new(name: &str, value: usize) -> Semaphore {
        Semaphore {
            name: name.into(),
            inner: spin::Mutex::new(SemaphoreInner {
                value,
                waiters: VecDeque::new(),
                granted: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value, including units already handed to woken threads.
    pub fn value(&self) -> usize {
        self.inner.lock().value
    }

    /// Number of threads blocked in `down`.
    pub fn waiters(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// P: waits until the value is positive, then decrements it.
    pub fn down(&self) {
        let _intr = interrupt::disable();
        let tcb = Environment::thread();
        let tid = tcb.tid();

        loop {
            {
                let mut sem = self.inner.lock();
                if let Some(pos) = sem.granted.iter().position(|t| *t == tid) {
                    sem.granted.swap_remove(pos);
                    sem.value -= 1;
                    return;
                }
                if sem.value > sem.granted.len() {
                    sem.value -= 1;
                    return;
                }
                debug!("{}: {} waits", self.name, tid);
                sem.waiters.push_back(tid);
            }
            tcb.block();
        }
    }

    /// V: increments the value and wakes the longest waiting thread.
    pub fn up(&self) {
        let _intr = interrupt::disable();
        let wake = {
            let mut sem = self.inner.lock();
            sem.value += 1;
            let next = sem.waiters.pop_front();
            if let Some(tid) = next {
                sem.granted.push(tid);
            }
            next
        };

        if let Some(tid) = wake {
            debug!("{}: wakes {}", self.name, tid);
            Environment::thread().make_runnable(tid);
        }
    }

    /// Drops any units nobody is waiting for.
    ///
    /// After this the value equals the number of woken threads that haven't
    /// consumed their unit yet. Used by conditions, which must not remember
    /// a signal that nobody received.
    pub fn discard_surplus(&self) {
        let _intr = interrupt::disable();
        let mut sem = self.inner.lock();
        sem.value = sem.granted.len();
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if !thread::panicking() {
            let sem = self.inner.get_mut();
            assert!(
                sem.waiters.is_empty(),
                "Semaphore {} dropped with waiting threads",
                self.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use proptest::prelude::*;

    use super::*;
    use crate::Scheduler;

    #[test]
    fn test_semaphore() {
        let _r = env_logger::try_init();
        let s: Scheduler = Default::default();

        let sem = Arc::new(Semaphore::new("sem", 0));
        let sem1 = sem.clone();
        let sem2 = sem.clone();
        let consumed = Arc::new(AtomicUsize::new(0));
        let consumed1 = consumed.clone();

        s.spawn("down", move || {
            for _i in 0..5 {
                sem2.down();
                consumed1.fetch_add(1, Ordering::SeqCst);
            }
        });

        s.spawn("up", move || {
            for _i in 0..5 {
                sem1.up();
            }
        });

        let report = s.run();
        assert!(report.blocked.is_empty());
        assert_eq!(consumed.load(Ordering::SeqCst), 5);
        assert_eq!(sem.value(), 0);
    }

    /// A woken waiter keeps its unit even if another thread calls `down`
    /// first.
    #[test]
    fn up_hands_off_to_waiter() {
        let s: Scheduler = Default::default();
        let sem = Arc::new(Semaphore::new("sem", 0));
        let order = Arc::new(StdMutex::new(Vec::new()));

        let (sem1, order1) = (sem.clone(), order.clone());
        s.spawn("waiter", move || {
            sem1.down();
            order1.lock().unwrap().push("waiter");
        });

        let (sem2, order2) = (sem.clone(), order.clone());
        s.spawn("upper", move || {
            let sem3 = sem2.clone();
            let order3 = order2.clone();
            // Queued ahead of "waiter", so it calls `down` first.
            Environment::thread().spawn("barger", move || {
                sem3.down();
                order3.lock().unwrap().push("barger");
            });
            sem2.up();
            Environment::thread().relinquish();
            sem2.up();
        });

        let report = s.run();
        assert!(report.blocked.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["waiter", "barger"]);
    }

    #[test]
    fn discard_surplus_forgets_unclaimed_units() {
        let s: Scheduler = Default::default();
        let sem = Arc::new(Semaphore::new("sem", 0));
        let sem1 = sem.clone();
        s.spawn("t", move || {
            sem1.up();
            sem1.up();
            assert_eq!(sem1.value(), 2);
            sem1.discard_surplus();
            assert_eq!(sem1.value(), 0);
        });
        s.run();
        assert_eq!(sem.value(), 0);
    }

    proptest! {
        /// For any sequence of P/V operations the value never goes
        /// negative and ends up at `initial + ups - completed downs`.
        #[test]
        fn value_accounting(initial in 0usize..4, ops in proptest::collection::vec(any::<bool>(), 0..24)) {
            let s: Scheduler = Default::default();
            let sem = Arc::new(Semaphore::new("sem", initial));
            let completed = Arc::new(AtomicUsize::new(0));
            let ups = ops.iter().filter(|up| **up).count();

            for up in ops {
                let sem = sem.clone();
                let completed = completed.clone();
                s.spawn("op", move || {
                    if up {
                        sem.up();
                    } else {
                        sem.down();
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }

            let report = s.run();
            let downs = completed.load(Ordering::SeqCst);
            prop_assert_eq!(sem.value(), initial + ups - downs);
            prop_assert_eq!(sem.waiters(), report.blocked.len());
            // Blocked threads only remain if no unit was left for them.
            if !report.blocked.is_empty() {
                prop_assert_eq!(sem.value(), 0);
            }
            // Tear down the blocked threads before the semaphore goes.
            drop(s);
            std::mem::forget(sem);
        }
    }
}
