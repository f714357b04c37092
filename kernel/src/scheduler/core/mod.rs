//! Scheduler core module
//!
//! - `scheduler`: per-CPU scheduler, context switch protocol, preemption
//! - `runqueue`: priority bitmap run queue
//! - `bh`: bottom half stack
//! - `pm`: wake locks, freeze and resume

pub mod bh;
pub mod pm;
pub mod runqueue;
pub mod scheduler;

pub use bh::BhFunc;
pub use pm::{
    PmState, WakeLock, WKLKCNT_ALLFRZ, WKLKCNT_FREEZING, WKLKCNT_RUNNING, WKLKCNT_SUSPENDED,
    WKLKCNT_THAWING, WKLKCNT_UNLOCKED,
};
pub use runqueue::RtRunQueue;
pub use scheduler::{Context, Scheduler, SchedulerStats, Stack};
