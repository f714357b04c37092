//! Counting semaphores
//!
//! [`Sem`] is generic over its wait queue: [`PlSem`] wakes waiters in
//! arrival order, [`RtSem`] highest priority first. A post with waiters
//! hands the count straight to the head waiter instead of incrementing.
//!
//! A negative count means frozen: posts are refused until `thaw`.
//! Semaphores bind exclusively to a selector; their bit is set while the
//! count is positive.

use alloc::sync::{Arc, Weak};

use log::trace;

use super::evt::Evt;
use super::sel::SelSlot;
use super::wait::{Blocker, Deadline, WaitMode};
use crate::error::{KernelError, KernelResult};
use crate::irq::IrqSpinLock;
use crate::scheduler::{Scheduler, Thread};
use crate::time::Tick;
use crate::wq::{PlWaitQueue, QueueKind, RtWaitQueue, WaitQueue, WqOwner, WqType, WqnReason};

struct SemInner<Q> {
    wq: Q,
    count: i32,
    max: i32,
}

pub struct Sem<Q: WaitQueue> {
    inner: IrqSpinLock<SemInner<Q>>,
    sel: SelSlot,
}

/// FIFO semaphore
pub type PlSem = Sem<PlWaitQueue>;
/// Priority semaphore
pub type RtSem = Sem<RtWaitQueue>;

fn check_values(val: i32, max: i32) -> KernelResult<()> {
    if val < 0 || max <= 0 || val > max {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
}

impl<Q: WaitQueue> Sem<Q> {
    const WQ_TYPE: WqType = match Q::KIND {
        QueueKind::Rt => WqType::RtSem,
        QueueKind::Pl => WqType::PlSem,
    };

    /// `InvalidArgument` unless `0 <= val <= max` and `max > 0`
    pub fn new(val: i32, max: i32) -> KernelResult<Arc<Self>> {
        check_values(val, max)?;
        Ok(Arc::new(Self {
            inner: IrqSpinLock::new(SemInner {
                wq: Q::new(),
                count: val,
                max,
            }),
            sel: SelSlot::new(),
        }))
    }

    /// Current count, negative when frozen
    pub fn value(&self) -> i32 {
        self.inner.lock().count
    }

    pub fn max(&self) -> i32 {
        self.inner.lock().max
    }

    pub fn waiters(&self) -> usize {
        self.inner.lock().wq.len()
    }

    /// Give one unit. `Negative` when frozen, `Range` when already at max.
    pub fn post(&self) -> KernelResult<()> {
        let mut sel = None;
        let woken = {
            let mut s = self.inner.lock();
            if s.count < 0 {
                return Err(KernelError::Negative);
            }
            match s.wq.choose() {
                Some(w) => Some(w),
                None => {
                    if s.count >= s.max {
                        return Err(KernelError::Range);
                    }
                    s.count += 1;
                    sel = self.sel.mark();
                    None
                }
            }
        };
        if let Some(w) = woken {
            trace!("sem: handing over to thread {}", w.thd.id());
            w.fire();
        }
        if let Some(sel) = sel {
            let _ = sel.cond.broadcast();
        }
        Ok(())
    }

    /// Take one unit if available, else `NoData`
    pub fn trywait(&self) -> KernelResult<()> {
        let mut s = self.inner.lock();
        if s.count <= 0 {
            return Err(KernelError::NoData);
        }
        s.count -= 1;
        if s.count == 0 {
            self.sel.clear();
        }
        Ok(())
    }

    fn dequeue(&self, thd: &Arc<Thread>) -> KernelResult<()> {
        self.inner.lock().wq.remove(thd, WqnReason::Intr).map(|_| ())
    }

    fn wait_until(self: &Arc<Self>, skd: &Scheduler, mode: WaitMode, deadline: Option<Deadline>) -> KernelResult<()> {
        let ct = skd.current_thread_checked()?;
        let blk = {
            let mut s = self.inner.lock();
            if s.count > 0 {
                s.count -= 1;
                if s.count == 0 {
                    self.sel.clear();
                }
                return Ok(());
            }
            let owner: Weak<Self> = Arc::downgrade(self);
            Blocker::enqueue(skd, &ct, &mut s.wq, Self::WQ_TYPE, owner, mode, deadline)?
        };
        blk.block(|t| self.dequeue(t))
    }

    /// Take one unit, blocking until one is posted
    pub fn wait(self: &Arc<Self>, skd: &Scheduler) -> KernelResult<()> {
        self.wait_until(skd, WaitMode::Interruptible, None)
    }

    /// Block at most `*to` ticks; the time left is written back.
    /// A zero timeout only tries.
    pub fn timed_wait(self: &Arc<Self>, skd: &Scheduler, to: &mut Tick) -> KernelResult<()> {
        if *to == 0 {
            return match self.trywait() {
                Err(KernelError::NoData) => Err(KernelError::TimedOut),
                rc => rc,
            };
        }
        let dl = Deadline::after(skd, *to);
        let rc = self.wait_until(skd, WaitMode::Interruptible, Some(dl));
        dl.store_remaining(skd, to);
        rc
    }

    /// [`Sem::wait`] that [`Thread::intr`] cannot break
    pub fn wait_unintr(self: &Arc<Self>, skd: &Scheduler) -> KernelResult<()> {
        self.wait_until(skd, WaitMode::Uninterruptible, None)
    }

    /// Refuse posts until [`Sem::thaw`]. `Already` if frozen.
    pub fn freeze(&self) -> KernelResult<()> {
        let mut s = self.inner.lock();
        if s.count < 0 {
            return Err(KernelError::Already);
        }
        s.count = -1;
        self.sel.clear();
        Ok(())
    }

    /// Reopen a frozen semaphore with a new count and maximum
    pub fn thaw(&self, val: i32, max: i32) -> KernelResult<()> {
        check_values(val, max)?;
        let sel = {
            let mut s = self.inner.lock();
            if s.count >= 0 {
                return Err(KernelError::Already);
            }
            s.count = val;
            s.max = max;
            if val > 0 {
                self.sel.mark()
            } else {
                None
            }
        };
        if let Some(sel) = sel {
            let _ = sel.cond.broadcast();
        }
        Ok(())
    }

    /// Bind exclusively to selector `sel` at bit `pos`
    pub fn bind(&self, sel: &Arc<Evt>, pos: usize) -> KernelResult<()> {
        let marked = {
            let s = self.inner.lock();
            sel.sel_obj_bind(&self.sel, pos, true)?;
            if s.count > 0 {
                self.sel.mark()
            } else {
                None
            }
        };
        if let Some(sel) = marked {
            let _ = sel.cond.broadcast();
        }
        Ok(())
    }

    pub fn unbind(&self, sel: &Arc<Evt>) -> KernelResult<()> {
        let _s = self.inner.lock();
        let _ = sel.sel_obj_c0i(&self.sel);
        sel.sel_obj_unbind(&self.sel, true)
    }
}

impl<Q: WaitQueue> WqOwner for Sem<Q> {
    fn intr(&self, thd: &Arc<Thread>) -> KernelResult<()> {
        let cb = self.inner.lock().wq.remove(thd, WqnReason::Intr)?;
        if let Some(cb) = cb {
            cb(thd);
        }
        Ok(())
    }
}
