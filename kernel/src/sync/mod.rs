//! Synchronization objects
//!
//! Every object keeps its waiters in a wait queue ([`crate::wq`]) and
//! blocks them through the protocol of [`wait`]. Posting from an interrupt
//! handler is allowed everywhere; waiting needs a thread.

pub mod br;
pub mod cond;
pub mod evt;
pub mod mtx;
pub mod sel;
pub mod sem;
pub(crate) mod wait;

pub use cond::Cond;
pub use evt::{Evt, EvtType, FlgAction, FlgTrigger};
pub use mtx::Mtx;
pub use sel::SelSlot;
pub use sem::{PlSem, RtSem, Sem};
