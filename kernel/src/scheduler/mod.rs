//! Scheduler subsystem
//!
//! Preemptive fixed-priority scheduling, one scheduler per CPU. Threads are
//! bound to the CPU they are created on.

pub mod core;
pub mod kernel;
pub mod thread;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use self::core::{
    BhFunc, Context, PmState, RtRunQueue, Scheduler, SchedulerStats, Stack, WakeLock, WKLKCNT_ALLFRZ,
    WKLKCNT_FREEZING, WKLKCNT_RUNNING, WKLKCNT_SUSPENDED, WKLKCNT_THAWING, WKLKCNT_UNLOCKED,
};
pub use kernel::Kernel;
pub use thread::{
    priority_is_valid, thread_trampoline, DynPrio, Priority, Thread, ThreadAttr, ThreadEntry,
    ThreadId, ThreadOptions, ThreadState, PRIORITY_INVALID, PRIORITY_MIN,
};
