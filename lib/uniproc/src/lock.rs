// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Blocking mutual exclusion locks.

use crossbeam_queue::ArrayQueue;
use log::debug;

use crate::interrupt;
use crate::scheduler::Scheduler;
use crate::semaphore::Semaphore;
use crate::threads::ThreadId;
use crate::tls::Environment;

/// A lock that puts contending threads to sleep.
///
/// Only the thread that acquired a lock may release it, and a thread must
/// not acquire a lock it already holds. Both are programming errors and
/// panic.
pub trait Lock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
    fn is_held_by_current_thread(&self) -> bool;
    fn name(&self) -> &str;
}

/// A lock with an explicit FIFO wait queue.
///
/// `release` passes ownership directly to the oldest waiter, so a newly
/// arriving thread can't overtake threads that are already waiting.
#[derive(Debug)]
pub struct QueueLock {
    name: String,
    owner: spin::Mutex<Option<ThreadId>>,
    waitlist: ArrayQueue<ThreadId>,
}

impl QueueLock {
    pub fn new(name: &str) -> Self {
        QueueLock {
            name: name.into(),
            owner: spin::Mutex::new(None),
            waitlist: ArrayQueue::new(Scheduler::MAX_THREADS),
        }
    }
}

impl Lock for QueueLock {
    fn acquire(&self) {
        let _intr = interrupt::disable();
        let tcb = Environment::thread();
        let tid = tcb.tid();

        {
            let mut owner = self.owner.lock();
            match *owner {
                Some(holder) if holder == tid => {
                    panic!("{} tries to acquire lock {} it already holds", tid, self.name)
                }
                None => {
                    *owner = Some(tid);
                    return;
                }
                Some(_) => {
                    debug!("{} waits for lock {}", tid, self.name);
                    let r = self.waitlist.push(tid);
                    assert!(r.is_ok(), "Lock waitlist full?");
                }
            }
        }

        // We only get woken up once `release` made us the owner.
        while *self.owner.lock() != Some(tid) {
            tcb.block();
        }
    }

    fn release(&self) {
        let _intr = interrupt::disable();
        let tid = Environment::tid();

        let next = {
            let mut owner = self.owner.lock();
            assert_eq!(
                *owner,
                Some(tid),
                "{} releases lock {} it doesn't hold",
                tid,
                self.name
            );
            *owner = self.waitlist.pop();
            *owner
        };

        if let Some(next) = next {
            debug!("lock {} handed to {}", self.name, next);
            Environment::thread().make_runnable(next);
        }
    }

    fn is_held_by_current_thread(&self) -> bool {
        let tid = Environment::tid();
        *self.owner.lock() == Some(tid)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A lock built on a binary semaphore.
#[derive(Debug)]
pub struct SemaphoreLock {
    name: String,
    sem: Semaphore,
    owner: spin::Mutex<Option<ThreadId>>,
}

impl SemaphoreLock {
    pub fn new(name: &str) -> Self {
        SemaphoreLock {
            name: name.into(),
            sem: Semaphore::new(name, 1),
            owner: spin::Mutex::new(None),
        }
    }
}

impl Lock for SemaphoreLock {
    fn acquire(&self) {
        let tid = Environment::tid();
        assert_ne!(
            *self.owner.lock(),
            Some(tid),
            "{} tries to acquire lock {} it already holds",
            tid,
            self.name
        );

        self.sem.down();
        *self.owner.lock() = Some(tid);
    }

    fn release(&self) {
        let _intr = interrupt::disable();
        let tid = Environment::tid();
        {
            let mut owner = self.owner.lock();
            assert_eq!(
                *owner,
                Some(tid),
                "{} releases lock {} it doesn't hold",
                tid,
                self.name
            );
            *owner = None;
        }
        // Never let the semaphore count past one.
        if self.sem.value() == 0 {
            self.sem.up();
        }
    }

    fn is_held_by_current_thread(&self) -> bool {
        let tid = Environment::tid();
        *self.owner.lock() == Some(tid)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;
    use crate::{Flavor, Preemption, SchedulerConfig};

    fn mutual_exclusion(flavor: Flavor, preempt: Option<Preemption>) {
        let _r = env_logger::try_init();
        let s = Scheduler::new(SchedulerConfig { preempt });
        let lock: Arc<dyn Lock> = Arc::from(flavor.lock("counter"));
        let inside = Arc::new(AtomicBool::new(false));
        let total = Arc::new(AtomicUsize::new(0));

        for _i in 0..4 {
            let (lock, inside, total) = (lock.clone(), inside.clone(), total.clone());
            s.spawn("worker", move || {
                for _j in 0..10 {
                    lock.acquire();
                    assert!(lock.is_held_by_current_thread());
                    assert!(!inside.swap(true, Ordering::SeqCst), "two threads inside");
                    Environment::thread().relinquish();
                    total.fetch_add(1, Ordering::SeqCst);
                    inside.store(false, Ordering::SeqCst);
                    lock.release();
                    assert!(!lock.is_held_by_current_thread());
                }
            });
        }

        let report = s.run();
        assert!(report.blocked.is_empty());
        assert_eq!(total.load(Ordering::SeqCst), 40);
    }

    #[test]
    fn queue_lock_excludes() {
        mutual_exclusion(Flavor::Queue, None);
        mutual_exclusion(Flavor::Queue, Some(Preemption { seed: 3, one_in: 2 }));
    }

    #[test]
    fn semaphore_lock_excludes() {
        mutual_exclusion(Flavor::Semaphore, None);
        mutual_exclusion(Flavor::Semaphore, Some(Preemption { seed: 3, one_in: 2 }));
    }

    /// Waiters get the lock in arrival order.
    #[test]
    fn queue_lock_is_fifo() {
        let s: Scheduler = Default::default();
        let lock = Arc::new(QueueLock::new("fifo"));
        let order = Arc::new(StdMutex::new(Vec::new()));

        for id in 0..4 {
            let (lock, order) = (lock.clone(), order.clone());
            s.spawn("worker", move || {
                lock.acquire();
                order.lock().unwrap().push(id);
                Environment::thread().relinquish();
                lock.release();
                // Try to barge back in right away.
                lock.acquire();
                order.lock().unwrap().push(id + 10);
                lock.release();
            });
        }

        s.run();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 10, 11, 12, 13]);
    }

    #[test]
    #[should_panic(expected = "already holds")]
    fn queue_lock_double_acquire() {
        let s: Scheduler = Default::default();
        s.spawn("t", || {
            let lock = QueueLock::new("l");
            lock.acquire();
            lock.acquire();
        });
        s.run();
    }

    #[test]
    #[should_panic(expected = "already holds")]
    fn semaphore_lock_double_acquire() {
        let s: Scheduler = Default::default();
        s.spawn("t", || {
            let lock = SemaphoreLock::new("l");
            lock.acquire();
            lock.acquire();
        });
        s.run();
    }

    #[test]
    #[should_panic(expected = "doesn't hold")]
    fn release_by_other_thread() {
        let s: Scheduler = Default::default();
        let lock = Arc::new(QueueLock::new("l"));
        let lock1 = lock.clone();
        s.spawn("owner", move || {
            lock1.acquire();
            Environment::thread().relinquish();
        });
        s.spawn("thief", move || lock.release());
        s.run();
    }

    #[test]
    #[should_panic(expected = "doesn't hold")]
    fn semaphore_lock_release_unheld() {
        let s: Scheduler = Default::default();
        s.spawn("t", || SemaphoreLock::new("l").release());
        s.run();
    }
}
