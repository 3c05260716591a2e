// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A cooperative, single-CPU thread scheduler with support for blocking
//! synchronization primitives.
//!
//! Exactly one thread runs at a time. Interleaving only happens at explicit
//! suspension points (blocking, sleeping, relinquishing) or, if enabled, at
//! randomly chosen preemption points whenever a thread leaves an atomic
//! section (see [`interrupt`]).

pub mod barrier;
pub mod condvar;
pub mod interrupt;
pub mod lock;
pub mod scheduler;
pub mod semaphore;
pub mod threads;
pub mod tls;

pub use barrier::EventBarrier;
pub use condvar::{Condition, QueueCondition, SemaphoreCondition};
pub use lock::{Lock, QueueLock, SemaphoreLock};
pub use scheduler::{Preemption, RunReport, Scheduler, SchedulerConfig};
pub use semaphore::Semaphore;
pub use threads::{ThreadId, ThreadState};
pub use tls::Environment;

/// Unit of the virtual clock.
pub type Ticks = u64;

/// Selects which internal strategy backs [`Lock`]s and [`Condition`]s.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Flavor {
    /// Built directly on the atomic section and explicit wait queues.
    #[default]
    Queue,
    /// Built on a private [`Semaphore`].
    Semaphore,
}

impl Flavor {
    pub fn lock(self, name: &str) -> Box<dyn Lock> {
        match self {
            Flavor::Queue => Box::new(QueueLock::new(name)),
            Flavor::Semaphore => Box::new(SemaphoreLock::new(name)),
        }
    }

    pub fn condition(self, name: &str) -> Box<dyn Condition> {
        match self {
            Flavor::Queue => Box::new(QueueCondition::new(name)),
            Flavor::Semaphore => Box::new(SemaphoreCondition::new(name)),
        }
    }
}

impl core::str::FromStr for Flavor {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queue" => Ok(Flavor::Queue),
            "semaphore" | "sem" => Ok(Flavor::Semaphore),
            _ => Err(()),
        }
    }
}
