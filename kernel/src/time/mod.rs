//! Time management subsystem
//!
//! Per-CPU time tree driven by the tick interrupt, plus software timers
//! layered on it.

pub mod swt;
pub mod tree;

pub use swt::{Swt, SwtCallback, SwtFlags};
pub use tree::{TimeTree, TtEntry, TtNode, TtnReason};

/// Kernel time in ticks since the scheduler started
pub type Tick = u64;

/// Deadline that never expires
pub const TICK_FOREVER: Tick = Tick::MAX;

/// `base + inc`, saturating at [`TICK_FOREVER`]
#[inline]
pub fn add_safely(base: Tick, inc: Tick) -> Tick {
    base.saturating_add(inc)
}
