//! Wait queues
//!
//! Every thread embeds one [`WaitQueueNode`]. A blocking call links the node
//! into the wait queue of the object it waits on; whoever removes the node
//! first (the poster, an interrupt, or the thread itself after a timeout)
//! decides the outcome. The node's own lock plus the `link` check make that
//! removal happen exactly once.
//!
//! Lock order: owner object lock → node lock.

pub mod plwq;
pub mod rtwq;

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::KernelResult;
use crate::irq::IrqSpinLock;
use crate::scheduler::{Priority, Thread, PRIORITY_INVALID};

pub use plwq::PlWaitQueue;
pub use rtwq::RtWaitQueue;

/// Kind of synchronization object a node waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqType {
    Unknown,
    Null,
    PlSem,
    RtSem,
    Cond,
    Event,
    Mtx,
}

/// Why a node left its wait queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqnReason {
    Unknown,
    /// Resource became available
    Up,
    /// Interrupted
    Intr,
}

/// Queue discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Priority order, FIFO among equal priorities
    Rt,
    /// Arrival order
    Pl,
}

/// Called once the node has been taken off its queue by someone else
pub type WqnCallback = fn(&Arc<Thread>);

/// Identity of a wait queue, recorded in the nodes linked into it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WqId(u64);

impl WqId {
    pub(crate) fn alloc() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Position of a node inside its queue, one variant per queue discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqSlot {
    Rt { prio: Priority, seq: u64 },
    Pl { seq: u64 },
}

/// Synchronization object owning a wait queue
pub trait WqOwner: Send + Sync {
    /// Take `thd` off the queue and wake it with [`WqnReason::Intr`]
    fn intr(&self, thd: &Arc<Thread>) -> KernelResult<()>;

    /// The dynamic priority of the waiter `thd` changed to `prio`.
    /// Returns the thread whose priority must be re-evaluated next.
    fn waiter_prio_changed(&self, _thd: &Arc<Thread>, _prio: Priority) -> Option<Arc<Thread>> {
        None
    }
}

pub(crate) struct WqLink {
    pub wq: WqId,
    pub slot: WqSlot,
    pub owner: Weak<dyn WqOwner>,
}

pub(crate) struct WqnState {
    /// `Some` iff the node is linked in a queue
    pub link: Option<WqLink>,
    pub ty: WqType,
    pub reason: WqnReason,
    pub prio: Priority,
    pub cb: Option<WqnCallback>,
}

/// Wait queue node embedded in every thread
pub struct WaitQueueNode {
    pub(crate) inner: IrqSpinLock<WqnState>,
}

impl WaitQueueNode {
    pub(crate) const fn new() -> Self {
        Self {
            inner: IrqSpinLock::new(WqnState {
                link: None,
                ty: WqType::Unknown,
                reason: WqnReason::Unknown,
                prio: PRIORITY_INVALID,
                cb: None,
            }),
        }
    }

    pub fn reason(&self) -> WqnReason {
        self.inner.lock().reason
    }

    pub fn wq_type(&self) -> WqType {
        self.inner.lock().ty
    }

    /// True while the node is linked in a wait queue
    pub fn is_queued(&self) -> bool {
        self.inner.lock().link.is_some()
    }

    pub(crate) fn owner(&self) -> Option<Arc<dyn WqOwner>> {
        self.inner.lock().link.as_ref().and_then(|l| l.owner.upgrade())
    }

    pub(crate) fn link_into(
        &self,
        wq: WqId,
        slot: WqSlot,
        ty: WqType,
        prio: Priority,
        owner: Weak<dyn WqOwner>,
        cb: WqnCallback,
    ) {
        let mut n = self.inner.lock();
        crate::kernel_bug_on!(n.link.is_some(), "wait queue node linked twice");
        n.link = Some(WqLink { wq, slot, owner });
        n.ty = ty;
        n.reason = WqnReason::Unknown;
        n.prio = prio;
        n.cb = Some(cb);
    }

    /// Slot of the node if it is linked in queue `wq`
    pub(crate) fn slot_in(&self, wq: WqId) -> Option<WqSlot> {
        match &self.inner.lock().link {
            Some(l) if l.wq == wq => Some(l.slot),
            _ => None,
        }
    }

    /// Unlink from queue `wq`, record `reason` and hand back the callback.
    /// Fails when the node is not (or no longer) linked in `wq`.
    pub(crate) fn unlink_from(
        &self,
        wq: WqId,
        reason: WqnReason,
    ) -> Option<(WqSlot, Option<WqnCallback>)> {
        let mut n = self.inner.lock();
        let slot = match &n.link {
            Some(l) if l.wq == wq => l.slot,
            _ => return None,
        };
        n.link = None;
        n.reason = reason;
        n.ty = WqType::Unknown;
        Some((slot, n.cb.take()))
    }

    pub(crate) fn relink_slot(&self, wq: WqId, slot: WqSlot, prio: Priority) {
        let mut n = self.inner.lock();
        if let Some(l) = n.link.as_mut() {
            if l.wq == wq {
                l.slot = slot;
                n.prio = prio;
            }
        }
    }
}

/// Thread woken off a queue, with the callback still to run
pub struct Woken {
    pub thd: Arc<Thread>,
    pub cb: Option<WqnCallback>,
}

impl Woken {
    /// Run the wake-up callback. Call with the queue owner's lock released.
    pub fn fire(self) {
        if let Some(cb) = self.cb {
            cb(&self.thd);
        }
    }
}

/// Common interface of [`RtWaitQueue`] and [`PlWaitQueue`].
/// Callers hold the owning object's lock.
pub trait WaitQueue: Send + 'static {
    const KIND: QueueKind;

    fn new() -> Self
    where
        Self: Sized;

    fn id(&self) -> WqId;

    /// Link `thd` with priority `prio` (ignored by FIFO queues)
    fn add(
        &mut self,
        thd: &Arc<Thread>,
        prio: Priority,
        ty: WqType,
        owner: Weak<dyn WqOwner>,
        cb: WqnCallback,
    );

    /// Remove `thd` and record `reason`. `NotFound` if someone else
    /// already removed it.
    fn remove(&mut self, thd: &Arc<Thread>, reason: WqnReason) -> KernelResult<Option<WqnCallback>>;

    /// Pop the head and record `reason`
    fn choose_with(&mut self, reason: WqnReason) -> Option<Woken>;

    /// Pop the head as woken by resource availability
    fn choose(&mut self) -> Option<Woken> {
        self.choose_with(WqnReason::Up)
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, thd: &Arc<Thread>) -> bool;
}
