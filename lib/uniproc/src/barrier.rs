// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A two-sided rendezvous between one signaller and one waiter at a time.

use log::debug;

use crate::interrupt;
use crate::lock::{Lock, QueueLock};
use crate::semaphore::Semaphore;

/// Lets a signaller hand a token to exactly one waiting thread and then
/// wait until that thread reports it is done with it.
///
/// Signallers are serialized: while one rendezvous is in flight other
/// signallers block.
#[derive(Debug)]
pub struct EventBarrier<T> {
    gate: QueueLock,
    arrivals: Semaphore,
    done: Semaphore,
    state: spin::Mutex<BarrierState<T>>,
}

#[derive(Debug)]
struct BarrierState<T> {
    waiting: usize,
    slot: Option<T>,
    in_flight: bool,
}

impl<T: Send> EventBarrier<T> {
    pub fn new(name: &str) -> Self {
        EventBarrier {
            gate: QueueLock::new(name),
            arrivals: Semaphore::new(name, 0),
            done: Semaphore::new(name, 0),
            state: spin::Mutex::new(BarrierState {
                waiting: 0,
                slot: None,
                in_flight: false,
            }),
        }
    }

    /// Blocks until a signaller picks this thread, returns its token.
    ///
    /// The caller must call [`EventBarrier::complete`] once it is done.
    pub fn wait(&self) -> T {
        let _intr = interrupt::disable();
        self.state.lock().waiting += 1;
        self.arrivals.down();

        let token = self.state.lock().slot.take();
        match token {
            Some(token) => token,
            None => unreachable!("woken by {} without a token", self.gate.name()),
        }
    }

    /// Hands `token` to one waiting thread and blocks until it called
    /// `complete`.
    ///
    /// Returns `false` without blocking if nobody is waiting.
    pub fn signal(&self, token: T) -> bool {
        self.gate.acquire();
        {
            let _intr = interrupt::disable();
            let mut state = self.state.lock();
            if state.waiting == 0 {
                drop(state);
                self.gate.release();
                return false;
            }
            state.waiting -= 1;
            state.slot = Some(token);
            state.in_flight = true;
        }
        debug!("{}: rendezvous", self.gate.name());
        self.arrivals.up();
        self.done.down();
        self.gate.release();
        true
    }

    /// Ends the rendezvous of the calling waiter and releases its signaller.
    pub fn complete(&self) {
        let _intr = interrupt::disable();
        {
            let mut state = self.state.lock();
            assert!(
                state.in_flight,
                "{}: complete without a rendezvous",
                self.gate.name()
            );
            state.in_flight = false;
        }
        self.done.up();
    }

    /// Number of threads blocked in `wait`.
    pub fn waiters(&self) -> usize {
        self.state.lock().waiting
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;
    use crate::{Environment, Scheduler};

    #[test]
    fn signal_without_waiters() {
        let s: Scheduler = Default::default();
        let bar = Arc::new(EventBarrier::new("bar"));
        let bar1 = bar.clone();
        s.spawn("signaller", move || assert!(!bar1.signal(1usize)));
        let report = s.run();
        assert!(report.blocked.is_empty());
    }

    /// The signaller resumes only after the waiter completed, each waiter
    /// gets its own token.
    #[test]
    fn rendezvous() {
        let _r = env_logger::try_init();
        let s: Scheduler = Default::default();
        let bar = Arc::new(EventBarrier::new("bar"));
        let log = Arc::new(StdMutex::new(Vec::new()));

        for id in 0..3 {
            let (bar, log) = (bar.clone(), log.clone());
            s.spawn("waiter", move || {
                let token: usize = bar.wait();
                log.lock().unwrap().push(format!("w{} got {}", id, token));
                Environment::thread().relinquish();
                log.lock().unwrap().push(format!("w{} done", id));
                bar.complete();
            });
        }

        let (bar1, log1) = (bar.clone(), log.clone());
        s.spawn("signaller", move || {
            assert_eq!(bar1.waiters(), 3);
            let mut token = 100;
            while bar1.waiters() > 0 {
                assert!(bar1.signal(token));
                log1.lock().unwrap().push(format!("s{} back", token));
                token += 1;
            }
        });

        let report = s.run();
        assert!(report.blocked.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "w0 got 100",
                "w0 done",
                "s100 back",
                "w1 got 101",
                "w1 done",
                "s101 back",
                "w2 got 102",
                "w2 done",
                "s102 back",
            ]
        );
    }

    #[test]
    #[should_panic(expected = "complete without a rendezvous")]
    fn complete_needs_rendezvous() {
        let s: Scheduler = Default::default();
        s.spawn("t", || EventBarrier::<()>::new("bar").complete());
        s.run();
    }
}
