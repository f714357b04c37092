//! Condition variable
//!
//! Waiters sit in a priority wait queue. `broadcast` and `unicast` hand the
//! wake-up to the waiters without transferring any resource: a woken thread
//! re-acquires the caller-side lock and re-checks its own predicate.
//!
//! A condition can be bound to a selector (non-exclusively); every signal
//! then also sets its bit there.

use alloc::sync::{Arc, Weak};

use log::trace;

use super::mtx::Mtx;
use super::sel::SelSlot;
use super::wait::{Blocker, Deadline, WaitMode};
use super::Evt;
use crate::error::{KernelError, KernelResult};
use crate::irq::{IrqSpinLock, IrqSpinLockGuard};
use crate::scheduler::{Scheduler, Thread};
use crate::time::Tick;
use crate::wq::{RtWaitQueue, WaitQueue, WqOwner, WqType, WqnReason, Woken};

struct CondInner {
    wq: RtWaitQueue,
    frozen: bool,
}

pub struct Cond {
    inner: IrqSpinLock<CondInner>,
    sel: SelSlot,
}

impl Cond {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: IrqSpinLock::new(CondInner {
                wq: RtWaitQueue::new(),
                frozen: false,
            }),
            sel: SelSlot::new(),
        })
    }

    /// Number of waiting threads
    pub fn waiters(&self) -> usize {
        self.inner.lock().wq.len()
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().frozen
    }

    /// Refuse signals until [`Cond::thaw`]. `Already` if frozen.
    pub fn freeze(&self) -> KernelResult<()> {
        let mut c = self.inner.lock();
        if c.frozen {
            return Err(KernelError::Already);
        }
        c.frozen = true;
        Ok(())
    }

    /// `Already` if not frozen
    pub fn thaw(&self) -> KernelResult<()> {
        let mut c = self.inner.lock();
        if !c.frozen {
            return Err(KernelError::Already);
        }
        c.frozen = false;
        Ok(())
    }

    /// Pop one waiter with `reason`. `Negative` when frozen and the wake-up
    /// is a signal.
    fn pop(&self, reason: WqnReason) -> KernelResult<Option<Woken>> {
        let mut c = self.inner.lock();
        if c.frozen && reason == WqnReason::Up {
            return Err(KernelError::Negative);
        }
        Ok(c.wq.choose_with(reason))
    }

    /// Wake every waiter. `Negative` when frozen.
    pub fn broadcast(&self) -> KernelResult<()> {
        while let Some(w) = self.pop(WqnReason::Up)? {
            w.fire();
        }
        self.sel.signal();
        Ok(())
    }

    /// Wake the highest priority waiter. `Negative` when frozen.
    pub fn unicast(&self) -> KernelResult<()> {
        if let Some(w) = self.pop(WqnReason::Up)? {
            w.fire();
        }
        Ok(())
    }

    /// Interrupt every waiter
    pub fn intr_all(&self) -> KernelResult<()> {
        let mut n = 0usize;
        while let Some(w) = self.pop(WqnReason::Intr)? {
            w.fire();
            n += 1;
        }
        trace!("cond: {} waiter(s) interrupted", n);
        Ok(())
    }

    /// Bind to selector `sel` at bit `pos`
    pub fn bind(&self, sel: &Arc<Evt>, pos: usize) -> KernelResult<()> {
        sel.sel_obj_bind(&self.sel, pos, false)
    }

    pub fn unbind(&self, sel: &Arc<Evt>) -> KernelResult<()> {
        sel.sel_obj_unbind(&self.sel, false)
    }

    fn dequeue(&self, thd: &Arc<Thread>) -> KernelResult<()> {
        self.inner.lock().wq.remove(thd, WqnReason::Intr).map(|_| ())
    }

    /// Release `guard`, wait, then lock `lock` again. The guard comes back
    /// whatever the outcome.
    pub(crate) fn wait_locked<'a, T>(
        self: &Arc<Self>,
        skd: &Scheduler,
        lock: &'a IrqSpinLock<T>,
        guard: IrqSpinLockGuard<'a, T>,
        mode: WaitMode,
        deadline: Option<Deadline>,
    ) -> (IrqSpinLockGuard<'a, T>, KernelResult<()>) {
        let ct = match skd.current_thread_checked() {
            Ok(ct) => ct,
            Err(e) => return (guard, Err(e)),
        };
        let blk = {
            let mut c = self.inner.lock();
            let owner: Weak<Self> = Arc::downgrade(self);
            match Blocker::enqueue(skd, &ct, &mut c.wq, WqType::Cond, owner, mode, deadline) {
                Ok(blk) => blk,
                Err(e) => return (guard, Err(e)),
            }
        };
        drop(guard);
        let rc = blk.block(|t| self.dequeue(t));
        (lock.lock(), rc)
    }

    /// Wait for a signal with `guard` released
    pub fn wait<'a, T>(
        self: &Arc<Self>,
        skd: &Scheduler,
        lock: &'a IrqSpinLock<T>,
        guard: IrqSpinLockGuard<'a, T>,
    ) -> (IrqSpinLockGuard<'a, T>, KernelResult<()>) {
        self.wait_locked(skd, lock, guard, WaitMode::Interruptible, None)
    }

    /// Wait at most `*to` ticks; the time left is written back.
    /// `TimedOut` at once when `*to` is zero.
    pub fn timed_wait<'a, T>(
        self: &Arc<Self>,
        skd: &Scheduler,
        lock: &'a IrqSpinLock<T>,
        guard: IrqSpinLockGuard<'a, T>,
        to: &mut Tick,
    ) -> (IrqSpinLockGuard<'a, T>, KernelResult<()>) {
        if *to == 0 {
            return (guard, Err(KernelError::TimedOut));
        }
        let dl = Deadline::after(skd, *to);
        let (guard, rc) = self.wait_locked(skd, lock, guard, WaitMode::Interruptible, Some(dl));
        dl.store_remaining(skd, to);
        (guard, rc)
    }

    /// Wait with `mtx` unlocked. The caller owns `mtx`, and owns it again
    /// on return whatever the outcome.
    pub fn wait_mtx(self: &Arc<Self>, skd: &Scheduler, mtx: &Arc<Mtx>) -> KernelResult<()> {
        self.wait_mtx_until(skd, mtx, None)
    }

    /// Timed [`Cond::wait_mtx`]
    pub fn timed_wait_mtx(self: &Arc<Self>, skd: &Scheduler, mtx: &Arc<Mtx>, to: &mut Tick) -> KernelResult<()> {
        if *to == 0 {
            return Err(KernelError::TimedOut);
        }
        let dl = Deadline::after(skd, *to);
        let rc = self.wait_mtx_until(skd, mtx, Some(dl));
        dl.store_remaining(skd, to);
        rc
    }

    fn wait_mtx_until(self: &Arc<Self>, skd: &Scheduler, mtx: &Arc<Mtx>, deadline: Option<Deadline>) -> KernelResult<()> {
        let ct = skd.current_thread_checked()?;
        if !mtx.is_owned_by(&ct) {
            return Err(KernelError::NotOwner);
        }
        let blk = {
            let mut c = self.inner.lock();
            let owner: Weak<Self> = Arc::downgrade(self);
            Blocker::enqueue(skd, &ct, &mut c.wq, WqType::Cond, owner, WaitMode::Interruptible, deadline)?
        };
        // Queued before the mutex goes: a signal sent by its next owner
        // cannot be missed
        let (holds, rc) = blk.block_after(|| mtx.release(&ct), |t| self.dequeue(t));
        mtx.reacquire(skd, holds)?;
        rc
    }
}

impl WqOwner for Cond {
    fn intr(&self, thd: &Arc<Thread>) -> KernelResult<()> {
        let cb = self.inner.lock().wq.remove(thd, WqnReason::Intr)?;
        if let Some(cb) = cb {
            cb(thd);
        }
        Ok(())
    }
}
