// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The atomic section of the CPU.
//!
//! With interrupts off the running thread can't be preempted; it only
//! loses the CPU if it suspends itself. Every blocking primitive does its
//! bookkeeping with interrupts off.

use log::trace;

use crate::tls::{Environment, ThreadControlBlock};

/// Interrupt level of the CPU.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IntLevel {
    Off,
    On,
}

/// Current interrupt level.
///
/// # Panics
/// If not called from a scheduler thread.
pub fn level() -> IntLevel {
    Environment::thread().shared.level()
}

/// Sets the interrupt level, returns the previous one.
///
/// Turning interrupts back on is a preemption point: if the scheduler was
/// configured with random preemption the thread may relinquish here.
pub fn set_level(level: IntLevel) -> IntLevel {
    switch_level(&Environment::thread(), level)
}

fn switch_level(tcb: &ThreadControlBlock, level: IntLevel) -> IntLevel {
    let old = tcb.shared.swap_level(level);
    if old == IntLevel::Off && level == IntLevel::On && tcb.shared.preemption_point() {
        trace!("{} preempted", tcb.tid);
        tcb.relinquish();
    }
    old
}

/// Turns interrupts off until the returned guard is dropped.
///
/// Guards nest: the inner one restores `Off`, the outermost one turns
/// interrupts back on.
pub fn disable() -> InterruptGuard {
    InterruptGuard {
        restore: set_level(IntLevel::Off),
    }
}

/// Restores the previous interrupt level on drop.
#[must_use = "interrupts are re-enabled when the guard is dropped"]
pub struct InterruptGuard {
    restore: IntLevel,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        // The scheduler may already be gone if we're unwinding a teardown.
        if let Some(tcb) = Environment::try_thread() {
            switch_level(&tcb, self.restore);
        }
    }
}
