// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_utils::sync::{Parker, Unparker};

use crate::Ticks;

/// The id of a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ThreadId(pub usize);

impl Hash for ThreadId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ThreadId {{ id={} }}", self.0)
    }
}

/// Scheduling state of a live thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// In the ready queue.
    Ready,
    /// Currently owns the CPU.
    Running,
    /// Suspended until someone makes it runnable again.
    Blocked,
    /// Suspended until the virtual clock reaches the given tick.
    Sleeping(Ticks),
}

pub(crate) struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) name: String,
    pub(crate) state: ThreadState,
    /// Where the dispatcher drops the answer that resumes this thread.
    pub(crate) mailbox: Arc<Mailbox<YieldResume>>,
    pub(crate) handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Thread#{} ({}, {:?})", self.id.0, self.name, self.state)
    }
}

/// Requests that go from the thread-context to the scheduler.
pub(crate) enum YieldRequest {
    /// Voluntarily give up the CPU, stay runnable.
    None,
    /// Block the thread until someone makes it runnable.
    Unrunnable,
    /// Block thread until the clock reaches the tick.
    Timeout(Ticks),
    /// Thread has finished, with the panic payload if it died.
    Exit(Option<Box<dyn Any + Send>>),
}

impl fmt::Debug for YieldRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            YieldRequest::None => write!(f, "None"),
            YieldRequest::Unrunnable => write!(f, "Unrunnable"),
            YieldRequest::Timeout(until) => write!(f, "Timeout({})", until),
            YieldRequest::Exit(None) => write!(f, "Exit"),
            YieldRequest::Exit(Some(_)) => write!(f, "Exit(panicked)"),
        }
    }
}

/// Corresponding response to a thread after it yielded back to
/// the scheduler with a request (see `YieldRequest`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum YieldResume {
    /// The thread got the CPU again.
    Dispatched,
    /// The scheduler is going away, the thread must unwind.
    DoNotResume,
}

/// A one-slot handoff between two host threads.
///
/// The sender drops a message and unparks the receiver; the receiver parks
/// until a message is there. Every context switch is a pair of these.
pub(crate) struct Mailbox<T> {
    slot: spin::Mutex<Option<T>>,
    unparker: Unparker,
}

impl<T> Mailbox<T> {
    pub(crate) fn new(unparker: Unparker) -> Self {
        Mailbox {
            slot: spin::Mutex::new(None),
            unparker,
        }
    }

    pub(crate) fn post(&self, msg: T) {
        let prev = self.slot.lock().replace(msg);
        debug_assert!(prev.is_none(), "Mailbox overrun");
        self.unparker.unpark();
    }

    pub(crate) fn recv(&self, parker: &Parker) -> T {
        loop {
            if let Some(msg) = self.slot.lock().take() {
                return msg;
            }
            parker.park();
        }
    }
}
