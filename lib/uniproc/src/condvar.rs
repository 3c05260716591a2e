// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Mesa-style condition variables.
//!
//! A signalled waiter only becomes runnable; it has to re-acquire the lock
//! before `wait` returns, so callers re-check their predicate in a loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use log::debug;

use crate::interrupt;
use crate::lock::Lock;
use crate::semaphore::Semaphore;
use crate::threads::ThreadId;
use crate::tls::Environment;

/// A condition variable that is always used together with one [`Lock`].
///
/// The first lock passed to any operation is bound to the condition; using
/// a different lock afterwards, or calling an operation without holding the
/// lock, panics. Signals that find no waiter are lost.
pub trait Condition: Send + Sync {
    /// Atomically releases `lock` and blocks; re-acquires `lock` before
    /// returning.
    fn wait(&self, lock: &dyn Lock);
    /// Wakes the longest waiting thread, if any.
    fn signal(&self, lock: &dyn Lock);
    /// Wakes all waiting threads.
    fn broadcast(&self, lock: &dyn Lock);
    /// Number of threads blocked in `wait`.
    fn waiters(&self) -> usize;
    fn name(&self) -> &str;
}

/// Remembers which lock a condition belongs to.
#[derive(Debug, Default)]
struct Binding(AtomicUsize);

impl Binding {
    fn check(&self, cond: &str, lock: &dyn Lock) {
        assert!(
            lock.is_held_by_current_thread(),
            "condition {} used without holding lock {}",
            cond,
            lock.name()
        );

        let addr = lock as *const _ as *const () as usize;
        if let Err(bound) = self
            .0
            .compare_exchange(0, addr, Ordering::SeqCst, Ordering::SeqCst)
        {
            assert_eq!(
                bound,
                addr,
                "condition {} used with lock {} but is bound to another lock",
                cond,
                lock.name()
            );
        }
    }
}

/// A condition with an explicit FIFO queue of waiting threads.
#[derive(Debug)]
pub struct QueueCondition {
    name: String,
    bound: Binding,
    waiters: spin::Mutex<VecDeque<ThreadId>>,
}

impl QueueCondition {
    pub fn new(name: &str) -> Self {
        QueueCondition {
            name: name.into(),
            bound: Default::default(),
            waiters: spin::Mutex::new(VecDeque::new()),
        }
    }
}

impl Condition for QueueCondition {
    fn wait(&self, lock: &dyn Lock) {
        self.bound.check(&self.name, lock);
        {
            let _intr = interrupt::disable();
            let tcb = Environment::thread();
            let tid = tcb.tid();

            self.waiters.lock().push_back(tid);
            lock.release();
            debug!("{} waits on {}", tid, self.name);
            // signal/broadcast remove us from the queue before waking us
            while self.waiters.lock().contains(&tid) {
                tcb.block();
            }
        }
        lock.acquire();
    }

    fn signal(&self, lock: &dyn Lock) {
        self.bound.check(&self.name, lock);
        let _intr = interrupt::disable();
        let next = self.waiters.lock().pop_front();
        if let Some(tid) = next {
            debug!("{} signals {}", self.name, tid);
            Environment::thread().make_runnable(tid);
        }
    }

    fn broadcast(&self, lock: &dyn Lock) {
        self.bound.check(&self.name, lock);
        let _intr = interrupt::disable();
        let waiters: Vec<ThreadId> = self.waiters.lock().drain(..).collect();
        debug!("{} broadcast to {:?}", self.name, waiters);
        if !waiters.is_empty() {
            Environment::thread().make_all_runnable(waiters);
        }
    }

    fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for QueueCondition {
    fn drop(&mut self) {
        if !thread::panicking() {
            assert!(
                self.waiters.get_mut().is_empty(),
                "Can't have outstanding waiters on CV"
            );
        }
    }
}

/// A condition built on a semaphore that starts at zero.
#[derive(Debug)]
pub struct SemaphoreCondition {
    name: String,
    bound: Binding,
    sem: Semaphore,
}

impl SemaphoreCondition {
    pub fn new(name: &str) -> Self {
        SemaphoreCondition {
            name: name.into(),
            bound: Default::default(),
            sem: Semaphore::new(name, 0),
        }
    }
}

impl Condition for SemaphoreCondition {
    fn wait(&self, lock: &dyn Lock) {
        self.bound.check(&self.name, lock);
        {
            // Nobody can signal between the release and the down.
            let _intr = interrupt::disable();
            lock.release();
            self.sem.down();
        }
        lock.acquire();
    }

    fn signal(&self, lock: &dyn Lock) {
        self.bound.check(&self.name, lock);
        let _intr = interrupt::disable();
        if self.sem.waiters() > 0 {
            self.sem.up();
        }
        self.sem.discard_surplus();
    }

    fn broadcast(&self, lock: &dyn Lock) {
        self.bound.check(&self.name, lock);
        let _intr = interrupt::disable();
        for _i in 0..self.sem.waiters() {
            self.sem.up();
        }
        self.sem.discard_surplus();
    }

    fn waiters(&self) -> usize {
        self.sem.waiters()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
