// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The core logic of the scheduler.
//!
//! Has the following properties:
//! * Single logical CPU: exactly one thread runs at any time
//! * Cooperative scheduling (threads yield voluntarily or by blocking)
//! * FIFO ready queue
//! * Waitlist is sorted according to thread wake-up times
//! * Virtual clock that jumps to the next wake-up when the CPU would idle
//! * Optional seeded random preemption at atomic section exits

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_utils::atomic::AtomicCell;
use crossbeam_utils::sync::{Parker, Unparker};
use log::{error, trace};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::interrupt::IntLevel;
use crate::threads::{Mailbox, Thread, ThreadId, ThreadState, YieldRequest, YieldResume};
use crate::tls::{self, Terminated, ThreadControlBlock};
use crate::Ticks;

/// Random preemption settings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Preemption {
    /// Seed for the preemption decisions, same seed same interleaving.
    pub seed: u64,
    /// A preemption point yields with probability `1/one_in`.
    pub one_in: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SchedulerConfig {
    pub preempt: Option<Preemption>,
}

/// What `Scheduler::run` observed until the CPU ran out of work.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunReport {
    /// Virtual clock when the run ended.
    pub ticks: Ticks,
    /// Total number of dispatches so far.
    pub switches: u64,
    /// Threads that are still blocked (idle servers, or a deadlock).
    pub blocked: Vec<ThreadId>,
}

/// Scheduler state shared between the dispatcher and all threads.
///
/// # Lock order
/// `threads` before `runnable`. `waiting` is never held together with
/// any of the other two.
pub(crate) struct Shared {
    /// All live threads.
    threads: spin::Mutex<hashbrown::HashMap<ThreadId, Thread>>,
    /// Threads that are ready to run, in dispatch order.
    runnable: spin::Mutex<VecDeque<ThreadId>>,
    /// Sleeping threads, the earliest wake-up is last.
    waiting: spin::Mutex<Vec<(Ticks, ThreadId)>>,
    clock: AtomicU64,
    switches: AtomicU64,
    /// Interrupt level of the (one) CPU.
    level: AtomicCell<IntLevel>,
    tid_counter: AtomicUsize,
    /// Where threads drop their yield requests.
    pub(crate) dispatcher: Mailbox<(ThreadId, YieldRequest)>,
    preempt: Option<(u32, spin::Mutex<SmallRng>)>,
}

impl Shared {
    fn new(config: SchedulerConfig, dispatcher: Unparker) -> Self {
        Shared {
            threads: spin::Mutex::new(hashbrown::HashMap::with_capacity(64)),
            runnable: spin::Mutex::new(VecDeque::with_capacity(64)),
            waiting: spin::Mutex::new(Vec::with_capacity(64)),
            clock: AtomicU64::new(0),
            switches: AtomicU64::new(0),
            level: AtomicCell::new(IntLevel::On),
            tid_counter: AtomicUsize::new(1),
            dispatcher: Mailbox::new(dispatcher),
            preempt: config
                .preempt
                .map(|p| (p.one_in.max(1), spin::Mutex::new(SmallRng::seed_from_u64(p.seed)))),
        }
    }

    pub(crate) fn spawn<F>(shared: &Arc<Shared>, name: &str, f: F) -> Option<ThreadId>
    where
        F: 'static + FnOnce() + Send,
    {
        if shared.threads.lock().len() >= Scheduler::MAX_THREADS {
            error!("too many threads, can't spawn {}", name);
            return None;
        }

        let tid = ThreadId(shared.tid_counter.fetch_add(1, Ordering::Relaxed));
        let parker = Parker::new();
        let mailbox = Arc::new(Mailbox::new(parker.unparker().clone()));

        let thread_shared = shared.clone();
        let thread_mailbox = mailbox.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}#{}", name, tid.0))
            .spawn(move || {
                let tcb = Rc::new(ThreadControlBlock {
                    tid,
                    shared: thread_shared,
                    parker,
                    mailbox: thread_mailbox,
                });

                // Wait for our first dispatch:
                if tcb.mailbox.recv(&tcb.parker) == YieldResume::DoNotResume {
                    return;
                }
                // A new thread always starts with interrupts on.
                tcb.shared.swap_level(IntLevel::On);
                tls::set_tcb(Some(tcb.clone()));
                let result = panic::catch_unwind(AssertUnwindSafe(f));
                tls::set_tcb(None);

                let payload = match result {
                    Ok(()) => None,
                    Err(payload) if payload.is::<Terminated>() => return,
                    Err(payload) => Some(payload),
                };
                tcb.shared.dispatcher.post((tid, YieldRequest::Exit(payload)));
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                error!("can't create host thread for {}: {}", name, e);
                return None;
            }
        };

        let mut threads = shared.threads.lock();
        threads.insert(
            tid,
            Thread {
                id: tid,
                name: name.into(),
                state: ThreadState::Ready,
                mailbox,
                handle: Some(handle),
            },
        );
        shared.runnable.lock().push_back(tid);
        trace!("spawned {} as {}", name, tid);
        Some(tid)
    }

    pub(crate) fn now(&self) -> Ticks {
        self.clock.load(Ordering::SeqCst)
    }

    pub(crate) fn level(&self) -> IntLevel {
        self.level.load()
    }

    pub(crate) fn swap_level(&self, level: IntLevel) -> IntLevel {
        self.level.swap(level)
    }

    /// Decides whether leaving an atomic section should switch threads.
    pub(crate) fn preemption_point(&self) -> bool {
        match &self.preempt {
            Some((one_in, rng)) if !thread::panicking() => rng.lock().gen_ratio(1, *one_in),
            _ => false,
        }
    }

    /// Marks a blocked thread as runnable by inserting it into `runnable`.
    pub(crate) fn make_runnable(&self, tid: ThreadId) {
        let mut threads = self.threads.lock();
        match threads.get_mut(&tid) {
            Some(thread) if thread.state == ThreadState::Blocked => {
                thread.state = ThreadState::Ready;
                self.runnable.lock().push_back(tid);
            }
            Some(thread) => trace!("make_runnable: {:?} is not blocked", thread),
            None => error!("make_runnable: no such thread {}", tid),
        }
    }

    /// Insert thread in a sorted waitlist.
    fn waitlist_insert(&self, tid: ThreadId, until: Ticks) {
        let mut waiting = self.waiting.lock();
        let to_insert = (until, tid);
        match waiting.binary_search_by(|entry| entry.cmp(&to_insert).reverse()) {
            Err(pos) => waiting.insert(pos, to_insert),
            Ok(_pos) => panic!("Thread already in waitlist?"),
        }
        trace!("Waitlist is {:?}", waiting);
    }

    /// Moves threads whose wake-up time has come from `waiting` to `runnable`.
    fn check_wakeups(&self) {
        let now = self.now();
        let mut due = Vec::new();
        {
            let mut waiting = self.waiting.lock();
            while waiting.last().map_or(false, |(until, _)| *until <= now) {
                if let Some((_until, tid)) = waiting.pop() {
                    due.push(tid);
                }
            }
        }

        let mut threads = self.threads.lock();
        for tid in due {
            if let Some(thread) = threads.get_mut(&tid) {
                thread.state = ThreadState::Ready;
                self.runnable.lock().push_back(tid);
            }
        }
    }

    /// Idle step: jump the clock to the earliest pending wake-up.
    ///
    /// Returns false if nobody is sleeping.
    fn advance_clock(&self) -> bool {
        let next = self.waiting.lock().last().map(|(until, _)| *until);
        match next {
            Some(until) => {
                let prev = self.clock.fetch_max(until, Ordering::SeqCst);
                trace!("idle: clock {} -> {}", prev, until.max(prev));
                true
            }
            None => false,
        }
    }
}

/// A single CPU and the threads multiplexed onto it.
pub struct Scheduler {
    shared: Arc<Shared>,
    /// The dispatcher parks here while a thread owns the CPU.
    parker: Parker,
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new(Default::default())
    }
}

impl Scheduler {
    pub const MAX_THREADS: usize = 512;

    pub fn new(config: SchedulerConfig) -> Self {
        let parker = Parker::new();
        let shared = Arc::new(Shared::new(config, parker.unparker().clone()));
        Scheduler { shared, parker }
    }

    /// Creates a new runnable thread that will execute `f`.
    ///
    /// Returns `None` if the scheduler is out of thread slots.
    pub fn spawn<F>(&self, name: &str, f: F) -> Option<ThreadId>
    where
        F: 'static + FnOnce() + Send,
    {
        Shared::spawn(&self.shared, name, f)
    }

    /// Current value of the virtual clock.
    pub fn now(&self) -> Ticks {
        self.shared.now()
    }

    /// State of a live thread, `None` once it has finished.
    pub fn thread_state(&self, tid: ThreadId) -> Option<ThreadState> {
        self.shared.threads.lock().get(&tid).map(|t| t.state)
    }

    /// Dispatches threads until none is runnable and none is sleeping.
    ///
    /// A panic inside a thread is re-raised from here with its original
    /// payload.
    pub fn run(&self) -> RunReport {
        loop {
            self.shared.check_wakeups();

            // The next thread ID we want to run
            let next_tid = self.shared.runnable.lock().pop_front();
            let tid = match next_tid {
                Some(tid) => tid,
                None => {
                    if self.shared.advance_clock() {
                        continue;
                    }
                    // Nothing to dispatch
                    break;
                }
            };

            let mailbox = {
                let mut threads = self.shared.threads.lock();
                let thread = threads.get_mut(&tid).expect("Can't find thread state?");
                trace!("dispatch {:?} at {}", thread, self.shared.now());
                thread.state = ThreadState::Running;
                thread.mailbox.clone()
            };

            self.shared.switches.fetch_add(1, Ordering::Relaxed);
            mailbox.post(YieldResume::Dispatched);
            let (from, request) = self.shared.dispatcher.recv(&self.parker);
            debug_assert_eq!(from, tid, "Got a request from a thread we didn't dispatch?");
            self.handle_yield_request(from, request);
        }

        let mut blocked: Vec<ThreadId> = self
            .shared
            .threads
            .lock()
            .values()
            .filter(|t| t.state == ThreadState::Blocked)
            .map(|t| t.id)
            .collect();
        blocked.sort();

        RunReport {
            ticks: self.shared.now(),
            switches: self.shared.switches.load(Ordering::Relaxed),
            blocked,
        }
    }

    /// Handles a yield request of the thread given by `tid`.
    ///
    /// Updates run and waitlists accordingly.
    fn handle_yield_request(&self, tid: ThreadId, request: YieldRequest) {
        match request {
            YieldRequest::None => {
                trace!("Thread {} has voluntarily yielded its time.", tid);
                let mut threads = self.shared.threads.lock();
                if let Some(thread) = threads.get_mut(&tid) {
                    thread.state = ThreadState::Ready;
                }
                self.shared.runnable.lock().push_back(tid);
            }
            YieldRequest::Unrunnable => {
                trace!("Thread {} blocks.", tid);
                if let Some(thread) = self.shared.threads.lock().get_mut(&tid) {
                    thread.state = ThreadState::Blocked;
                }
            }
            YieldRequest::Timeout(until) => {
                trace!("Thread {} has suspended itself until {}.", tid, until);
                if let Some(thread) = self.shared.threads.lock().get_mut(&tid) {
                    thread.state = ThreadState::Sleeping(until);
                }
                self.shared.waitlist_insert(tid, until);
            }
            YieldRequest::Exit(payload) => {
                trace!("Thread {} has terminated.", tid);
                let thread = self.shared.threads.lock().remove(&tid);
                if let Some(handle) = thread.and_then(|mut t| t.handle.take()) {
                    let _r = handle.join();
                }
                if let Some(payload) = payload {
                    error!("Thread {} panicked, stopping the scheduler.", tid);
                    panic::resume_unwind(payload);
                }
            }
        }
    }
}

impl Drop for Scheduler {
    /// Tears down all threads that never finished: they unwind silently
    /// on their host threads.
    fn drop(&mut self) {
        let leftover: Vec<Thread> = self
            .shared
            .threads
            .lock()
            .drain()
            .map(|(_tid, thread)| thread)
            .collect();

        for mut thread in leftover {
            trace!("tearing down {:?}", thread);
            thread.mailbox.post(YieldResume::DoNotResume);
            if let Some(handle) = thread.handle.take() {
                let _r = handle.join();
            }
        }
        self.shared.runnable.lock().clear();
        self.shared.waiting.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::tls::Environment;

    /// Test that waitlist inserts are inserted with correct order.
    #[test]
    fn waitlist_inserts_are_sorted() {
        let (t0, t1, t2) = (ThreadId(1), ThreadId(2), ThreadId(3));

        // Make two schedulers
        let s1: Scheduler = Default::default();
        let s2: Scheduler = Default::default();

        // Insert in both different order:
        s1.shared.waitlist_insert(t0, 10);
        s1.shared.waitlist_insert(t1, 20);
        s1.shared.waitlist_insert(t2, 30);

        s2.shared.waitlist_insert(t2, 30);
        s2.shared.waitlist_insert(t1, 20);
        s2.shared.waitlist_insert(t0, 10);

        // Order should not depend on insertion order
        assert_eq!(
            *s1.shared.waiting.lock(),
            *s2.shared.waiting.lock(),
            "List order depends on insert order?"
        );

        // Event with shortest wakeup time is last:
        let waitlist = s1.shared.waiting.lock();
        assert_eq!(waitlist[0].1, ThreadId(3));
        assert_eq!(waitlist[1].1, ThreadId(2));
        assert_eq!(waitlist[2].1, ThreadId(1));
    }

    /// Relinquishing threads alternate in FIFO order.
    #[test]
    fn relinquish_is_round_robin() {
        let _r = env_logger::try_init();
        let s: Scheduler = Default::default();
        let trace = Arc::new(StdMutex::new(Vec::new()));

        for name in ["a", "b"] {
            let trace = trace.clone();
            s.spawn(name, move || {
                for i in 0..3 {
                    trace.lock().unwrap().push(format!("{}{}", name, i));
                    Environment::thread().relinquish();
                }
            });
        }

        let report = s.run();
        assert!(report.blocked.is_empty());
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["a0", "b0", "a1", "b1", "a2", "b2"]
        );
    }

    /// Sleepers wake up in order, and the clock jumps instead of spinning.
    #[test]
    fn waitlist_wakeup() {
        let _r = env_logger::try_init();
        let s: Scheduler = Default::default();
        let timelog = Arc::new(StdMutex::new(Vec::new()));

        for (name, ticks) in [("slow", 70), ("fast", 50)] {
            let timelog = timelog.clone();
            s.spawn(name, move || {
                let t = Environment::thread();
                t.sleep(ticks);
                timelog.lock().unwrap().push((name, t.now()));
            });
        }

        let report = s.run();
        assert_eq!(report.ticks, 70);
        assert_eq!(*timelog.lock().unwrap(), vec![("fast", 50), ("slow", 70)]);
    }

    #[test]
    fn sleep_saturates_at_the_end_of_time() {
        let s: Scheduler = Default::default();
        s.spawn("sleeper", || {
            let t = Environment::thread();
            t.sleep(5);
            t.sleep(Ticks::MAX);
            assert_eq!(t.now(), Ticks::MAX);
        });
        let report = s.run();
        assert_eq!(report.ticks, Ticks::MAX);
        assert!(report.blocked.is_empty());
    }

    #[test]
    fn blocked_threads_are_reported() {
        let s: Scheduler = Default::default();
        let tid = s
            .spawn("sleeper", || Environment::thread().block())
            .expect("Can't spawn");
        let report = s.run();
        assert_eq!(report.blocked, vec![tid]);
        assert_eq!(s.thread_state(tid), Some(ThreadState::Blocked));
    }

    #[test]
    fn threads_can_spawn_threads() {
        let s: Scheduler = Default::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen1 = seen.clone();
        s.spawn("parent", move || {
            let seen2 = seen1.clone();
            Environment::thread().spawn("child", move || {
                seen2.fetch_add(1, Ordering::SeqCst);
            });
            seen1.fetch_add(1, Ordering::SeqCst);
        });
        let report = s.run();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(report.blocked.is_empty());
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn thread_panics_reach_run() {
        let s: Scheduler = Default::default();
        s.spawn("doomed", || panic!("boom"));
        s.run();
    }

    #[test]
    fn same_seed_same_interleaving() {
        fn interleaving(seed: u64) -> Vec<usize> {
            let s = Scheduler::new(SchedulerConfig {
                preempt: Some(Preemption { seed, one_in: 2 }),
            });
            let trace = Arc::new(StdMutex::new(Vec::new()));
            for id in 0..3 {
                let trace = trace.clone();
                s.spawn("worker", move || {
                    for _i in 0..5 {
                        let _intr = crate::interrupt::disable();
                        trace.lock().unwrap().push(id);
                    }
                });
            }
            s.run();
            let order = trace.lock().unwrap().clone();
            order
        }

        assert_eq!(interleaving(7), interleaving(7));
        assert_eq!(interleaving(7).len(), 15);
    }
}
