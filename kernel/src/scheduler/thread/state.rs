//! State - Thread state flags and priorities

use core::fmt;

use bitflags::bitflags;

use crate::config::PRIORITY_MAX;

/// Thread priority. Larger value means higher priority.
pub type Priority = i32;

/// Priority of "nothing": empty queues, a thread that is not running
pub const PRIORITY_INVALID: Priority = -1;

/// Lowest valid priority
pub const PRIORITY_MIN: Priority = 0;

/// True for priorities a thread may be given
pub fn priority_is_valid(prio: Priority) -> bool {
    (PRIORITY_MIN..=PRIORITY_MAX).contains(&prio)
}

bitflags! {
    /// Thread state. Several flags can be set at once, e.g. a timed wait is
    /// `BLOCKING | SLEEPING`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ThreadState: u32 {
        /// Created, not yet activated (or exited)
        const STANDBY = 1 << 0;
        /// Current thread of its CPU
        const RUNNING = 1 << 1;
        /// Linked in the run queue
        const READY = 1 << 2;
        /// Armed in the time tree
        const SLEEPING = 1 << 3;
        /// Linked in a wait queue
        const BLOCKING = 1 << 4;
        /// Parked by the power management freeze
        const FROZEN = 1 << 5;
        /// Waiting without accepting interrupts
        const UNINTERRUPTED = 1 << 6;
        /// Asked to quit
        const EXITING = 1 << 7;
        /// Nobody joins this thread
        const DETACHED = 1 << 8;
        /// Entry returned
        const EXITED = 1 << 9;
    }
}

impl ThreadState {
    /// Flags that keep a thread off the run queue and the CPU
    pub const WAITING: ThreadState = ThreadState::SLEEPING
        .union(ThreadState::BLOCKING)
        .union(ThreadState::FROZEN);

    /// READY or RUNNING
    pub fn is_runnable(self) -> bool {
        self.intersects(ThreadState::READY | ThreadState::RUNNING)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// Dynamic priority of a thread as seen by the structure it is linked in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynPrio {
    /// Effective priority: static priority raised by inheritance
    pub v: Priority,
    /// Priority it is queued with in the run queue
    pub rq: Priority,
    /// Priority it is queued with in a wait queue
    pub wq: Priority,
    /// Priority it runs with
    pub r: Priority,
}

impl DynPrio {
    pub const fn new(prio: Priority) -> Self {
        Self {
            v: prio,
            rq: PRIORITY_INVALID,
            wq: PRIORITY_INVALID,
            r: PRIORITY_INVALID,
        }
    }
}
