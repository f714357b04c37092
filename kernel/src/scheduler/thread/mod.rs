//! Thread module

pub mod lifecycle;
pub mod state;
pub mod thread;

pub use state::{priority_is_valid, DynPrio, Priority, ThreadState, PRIORITY_INVALID, PRIORITY_MIN};
pub use thread::{
    alloc_thread_id, thread_trampoline, Thread, ThreadAttr, ThreadEntry, ThreadId, ThreadOptions,
};
pub(crate) use thread::wqn_wakeup;
