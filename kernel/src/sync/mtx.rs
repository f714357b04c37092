//! Mutex with priority inheritance
//!
//! Recursive: the owner may lock again and must unlock as many times.
//! Unlocking hands the mutex straight to the highest priority waiter.
//!
//! The mutex carries a dynamic priority, the higher of its own static
//! priority (a ceiling, `PRIORITY_MIN` for plain mutexes) and the priority
//! of its first waiter. The owner runs at least at the dynamic priority of
//! every mutex it owns; a change anywhere propagates down the chain of
//! owners through [`Thread::refresh_priority`].
//!
//! Lock order: mutex lock → thread mutex tracker.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicI32, Ordering};

use log::{trace, warn};

use super::wait::{Blocker, Deadline, WaitMode};
use crate::config::MTX_CHAIN_MAX;
use crate::error::{KernelError, KernelResult};
use crate::irq::IrqSpinLock;
use crate::scheduler::{priority_is_valid, Priority, Scheduler, Thread, PRIORITY_MIN};
use crate::time::Tick;
use crate::wq::{RtWaitQueue, WaitQueue, WqOwner, WqType, WqnReason};

struct MtxInner {
    wq: RtWaitQueue,
    owner: Option<Arc<Thread>>,
    holds: usize,
}

pub struct Mtx {
    sprio: Priority,
    dprio: AtomicI32,
    inner: IrqSpinLock<MtxInner>,
}

impl Mtx {
    pub fn new() -> Arc<Self> {
        Self::build(PRIORITY_MIN)
    }

    /// Mutex whose owner runs at least at `sprio`
    pub fn with_priority(sprio: Priority) -> KernelResult<Arc<Self>> {
        if !priority_is_valid(sprio) {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self::build(sprio))
    }

    fn build(sprio: Priority) -> Arc<Self> {
        Arc::new(Self {
            sprio,
            dprio: AtomicI32::new(sprio),
            inner: IrqSpinLock::new(MtxInner {
                wq: RtWaitQueue::new(),
                owner: None,
                holds: 0,
            }),
        })
    }

    pub fn priority(&self) -> Priority {
        self.sprio
    }

    /// Priority lent to the owner
    pub fn dprio(&self) -> Priority {
        self.dprio.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> Option<Arc<Thread>> {
        self.inner.lock().owner.clone()
    }

    pub fn is_owned_by(&self, thd: &Arc<Thread>) -> bool {
        matches!(&self.inner.lock().owner, Some(o) if Arc::ptr_eq(o, thd))
    }

    pub fn waiters(&self) -> usize {
        self.inner.lock().wq.len()
    }

    fn update_dprio(&self, m: &MtxInner) {
        self.dprio
            .store(self.sprio.max(m.wq.top_prio()), Ordering::Release);
    }

    /// Take a free mutex. The caller refreshes `ct`'s priority once the
    /// lock is released.
    fn grant(self: &Arc<Self>, m: &mut MtxInner, thd: &Arc<Thread>) {
        m.owner = Some(thd.clone());
        m.holds = 1;
        let mut tr = thd.mtx.lock();
        tr.owned.push(self.clone());
        tr.waiting = None;
    }

    /// Owner of the mutex the current owner waits for, and so on. True if
    /// the chain comes back to `ct`.
    fn would_deadlock(ct: &Arc<Thread>, owner: &Arc<Thread>) -> bool {
        let mut cur = owner.clone();
        for _ in 0..MTX_CHAIN_MAX {
            if Arc::ptr_eq(&cur, ct) {
                return true;
            }
            let waiting = cur.mtx.lock().waiting.as_ref().and_then(Weak::upgrade);
            let Some(next) = waiting else {
                return false;
            };
            let next_owner = match next.inner.try_lock() {
                Some(m) => m.owner.clone(),
                // Busy, or the mutex being locked right now
                None => return false,
            };
            match next_owner {
                Some(o) => cur = o,
                None => return false,
            }
        }
        false
    }

    /// Lock without blocking. `Again` if another thread owns it.
    pub fn trylock(self: &Arc<Self>, skd: &Scheduler) -> KernelResult<()> {
        let ct = skd.current_thread_checked()?;
        {
            let mut m = self.inner.lock();
            match m.owner.clone() {
                None => self.grant(&mut m, &ct),
                Some(o) if Arc::ptr_eq(&o, &ct) => {
                    m.holds += 1;
                    return Ok(());
                }
                Some(_) => return Err(KernelError::Again),
            }
        }
        ct.refresh_priority();
        Ok(())
    }

    fn dequeue(&self, thd: &Arc<Thread>) -> KernelResult<()> {
        let owner = {
            let mut m = self.inner.lock();
            m.wq.remove(thd, WqnReason::Intr)?;
            self.update_dprio(&m);
            m.owner.clone()
        };
        if let Some(o) = owner {
            o.refresh_priority();
        }
        Ok(())
    }

    fn lock_until(self: &Arc<Self>, skd: &Scheduler, mode: WaitMode, deadline: Option<Deadline>) -> KernelResult<()> {
        let ct = skd.current_thread_checked()?;
        let (blk, owner) = {
            let mut m = self.inner.lock();
            let owner = match m.owner.clone() {
                None => {
                    self.grant(&mut m, &ct);
                    drop(m);
                    ct.refresh_priority();
                    return Ok(());
                }
                Some(o) if Arc::ptr_eq(&o, &ct) => {
                    m.holds += 1;
                    return Ok(());
                }
                Some(o) => o,
            };
            if Self::would_deadlock(&ct, &owner) {
                warn!("mtx: thread {} would deadlock on thread {}", ct.id(), owner.id());
                return Err(KernelError::Deadlock);
            }
            let wo: Weak<Self> = Arc::downgrade(self);
            let blk = Blocker::enqueue(skd, &ct, &mut m.wq, WqType::Mtx, wo, mode, deadline)?;
            ct.mtx.lock().waiting = Some(Arc::downgrade(self));
            self.update_dprio(&m);
            (blk, owner)
        };
        owner.refresh_priority();
        let rc = blk.block(|t| self.dequeue(t));
        ct.mtx.lock().waiting = None;
        rc
    }

    /// Lock, blocking while another thread owns the mutex.
    /// `Deadlock` if the owner (transitively) waits for the caller.
    pub fn lock(self: &Arc<Self>, skd: &Scheduler) -> KernelResult<()> {
        self.lock_until(skd, WaitMode::Interruptible, None)
    }

    /// [`Mtx::lock`] for at most `*to` ticks; the time left is written back
    pub fn timed_lock(self: &Arc<Self>, skd: &Scheduler, to: &mut Tick) -> KernelResult<()> {
        if *to == 0 {
            return match self.trylock(skd) {
                Err(KernelError::Again) => Err(KernelError::TimedOut),
                rc => rc,
            };
        }
        let dl = Deadline::after(skd, *to);
        let rc = self.lock_until(skd, WaitMode::Interruptible, Some(dl));
        dl.store_remaining(skd, to);
        rc
    }

    /// [`Mtx::lock`] that [`Thread::intr`] cannot break
    pub fn lock_unintr(self: &Arc<Self>, skd: &Scheduler) -> KernelResult<()> {
        self.lock_until(skd, WaitMode::Uninterruptible, None)
    }

    /// Unlock once. `NotOwner` unless the caller owns the mutex.
    pub fn unlock(self: &Arc<Self>, skd: &Scheduler) -> KernelResult<()> {
        let ct = skd.current_thread_checked()?;
        self.unlock_by(&ct)
    }

    /// Drop every hold of `ct` at once, for a condition wait. The caller
    /// checked ownership. Returns the number of holds to restore.
    pub(crate) fn release(self: &Arc<Self>, ct: &Arc<Thread>) -> usize {
        let holds = {
            let mut m = self.inner.lock();
            crate::kernel_bug_on!(
                !matches!(&m.owner, Some(o) if Arc::ptr_eq(o, ct)),
                "mtx: released by thread {} which does not own it",
                ct.id()
            );
            core::mem::replace(&mut m.holds, 1)
        };
        if let Err(e) = self.unlock_by(ct) {
            crate::kernel_bug!("mtx: release by thread {}: {}", ct.id(), e);
        }
        holds
    }

    /// Lock again after [`Mtx::release`], uninterruptibly
    pub(crate) fn reacquire(self: &Arc<Self>, skd: &Scheduler, holds: usize) -> KernelResult<()> {
        self.lock_unintr(skd)?;
        self.inner.lock().holds = holds;
        Ok(())
    }

    fn unlock_by(self: &Arc<Self>, ct: &Arc<Thread>) -> KernelResult<()> {
        let woken = {
            let mut m = self.inner.lock();
            match &m.owner {
                Some(o) if Arc::ptr_eq(o, ct) => {}
                _ => return Err(KernelError::NotOwner),
            }
            m.holds -= 1;
            if m.holds > 0 {
                return Ok(());
            }
            ct.mtx.lock().owned.retain(|x| !Arc::ptr_eq(x, self));
            match m.wq.choose() {
                Some(w) => {
                    self.grant(&mut m, &w.thd);
                    self.update_dprio(&m);
                    trace!("mtx: thread {} -> thread {}", ct.id(), w.thd.id());
                    Some(w)
                }
                None => {
                    m.owner = None;
                    m.holds = 0;
                    self.update_dprio(&m);
                    None
                }
            }
        };
        if let Some(w) = woken {
            let next = w.thd.clone();
            w.fire();
            next.refresh_priority();
        }
        ct.refresh_priority();
        Ok(())
    }
}

impl WqOwner for Mtx {
    fn intr(&self, thd: &Arc<Thread>) -> KernelResult<()> {
        let (cb, owner) = {
            let mut m = self.inner.lock();
            let cb = m.wq.remove(thd, WqnReason::Intr)?;
            self.update_dprio(&m);
            (cb, m.owner.clone())
        };
        if let Some(o) = owner {
            o.refresh_priority();
        }
        if let Some(cb) = cb {
            cb(thd);
        }
        Ok(())
    }

    fn waiter_prio_changed(&self, thd: &Arc<Thread>, prio: Priority) -> Option<Arc<Thread>> {
        let mut m = self.inner.lock();
        m.wq.reorder(thd, prio).ok()?;
        self.update_dprio(&m);
        m.owner.clone()
    }
}
