// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per thread state of the scheduler and convenient access to it.
//!
//! Every simulated thread is backed by its own host thread, so the thread
//! control block simply lives in host thread-local storage.

use std::cell::RefCell;
use std::panic;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use crossbeam_utils::sync::Parker;
use log::trace;

use crate::interrupt::IntLevel;
use crate::scheduler::Shared;
use crate::threads::{Mailbox, ThreadId, YieldRequest, YieldResume};
use crate::Ticks;

thread_local! {
    static TCB: RefCell<Option<Rc<ThreadControlBlock>>> = RefCell::new(None);
}

pub(crate) fn set_tcb(tcb: Option<Rc<ThreadControlBlock>>) {
    TCB.with(|slot| *slot.borrow_mut() = tcb);
}

/// Unwind payload of threads that are torn down together with their scheduler.
pub(crate) struct Terminated;

/// Per thread state of the scheduler.
pub struct ThreadControlBlock {
    pub(crate) tid: ThreadId,
    pub(crate) shared: Arc<Shared>,
    pub(crate) parker: Parker,
    pub(crate) mailbox: Arc<Mailbox<YieldResume>>,
}

impl ThreadControlBlock {
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// Current value of the virtual clock.
    pub fn now(&self) -> Ticks {
        self.shared.now()
    }

    /// Spawns a new thread on the same scheduler; it becomes runnable
    /// but the caller keeps the CPU.
    pub fn spawn<F>(&self, name: &str, f: F) -> Option<ThreadId>
    where
        F: 'static + FnOnce() + Send,
    {
        Shared::spawn(&self.shared, name, f)
    }

    /// Gives up the CPU, the thread goes to the back of the ready queue.
    pub fn relinquish(&self) {
        self.suspend(YieldRequest::None);
    }

    /// Suspends the current thread until someone calls `make_runnable` on it.
    ///
    /// The caller is responsible for having recorded its `tid` somewhere a
    /// waker will find it, inside the same atomic section.
    pub fn block(&self) {
        self.suspend(YieldRequest::Unrunnable);
    }

    /// Suspends the current thread for `ticks` of virtual time.
    pub fn sleep(&self, ticks: Ticks) {
        if ticks == 0 {
            self.relinquish();
        } else {
            let until = self.now().saturating_add(ticks);
            self.suspend(YieldRequest::Timeout(until));
        }
    }

    /// Puts a blocked thread back into the ready queue. Does not switch.
    pub fn make_runnable(&self, tid: ThreadId) {
        self.shared.make_runnable(tid);
    }

    pub fn make_all_runnable<I: IntoIterator<Item = ThreadId>>(&self, tids: I) {
        for tid in tids {
            self.shared.make_runnable(tid);
        }
    }

    pub(crate) fn suspend(&self, request: YieldRequest) {
        // Destructors running during teardown must never switch.
        if thread::panicking() {
            return;
        }

        let level = self.shared.swap_level(IntLevel::Off);
        trace!("{} suspends with {:?}", self.tid, request);
        self.shared.dispatcher.post((self.tid, request));
        match self.mailbox.recv(&self.parker) {
            YieldResume::Dispatched => {
                self.shared.swap_level(level);
            }
            YieldResume::DoNotResume => panic::resume_unwind(Box::new(Terminated)),
        }
    }
}

/// Convenience function to access the TCB.
pub struct Environment {}

impl Environment {
    pub fn tid() -> ThreadId {
        Environment::thread().tid
    }

    pub fn thread() -> Rc<ThreadControlBlock> {
        match Environment::try_thread() {
            Some(tcb) => tcb,
            None => panic!("Don't have TCB available? Not running on a scheduler thread."),
        }
    }

    /// Like `thread` but returns `None` outside of a scheduler thread.
    pub fn try_thread() -> Option<Rc<ThreadControlBlock>> {
        TCB.try_with(|slot| slot.borrow().clone()).ok().flatten()
    }
}
