//! Blocking wait protocol shared by every synchronization object
//!
//! A wait runs in three steps:
//!
//! 1. With the object lock held, [`Blocker::enqueue`] takes a wake lock,
//!    marks the calling thread BLOCKING (plus SLEEPING for a timed wait),
//!    links its node into the object's queue and arms the deadline.
//! 2. The caller drops every lock it holds, then [`Blocker::block`] gives
//!    the CPU away.
//! 3. Back on the CPU, the thread finds out why it woke. A poster or an
//!    interrupt took the node off the queue and left a reason; otherwise the
//!    deadline passed and the thread removes itself. Whichever side removes
//!    the node first decides the outcome.

use alloc::sync::{Arc, Weak};

use crate::error::{KernelError, KernelResult};
use crate::scheduler::thread::wqn_wakeup;
use crate::scheduler::{Scheduler, Thread, ThreadState, WakeLock, PRIORITY_INVALID};
use crate::time::{add_safely, Tick, TtEntry, TtnReason};
use crate::wq::{WaitQueue, WqOwner, WqType, WqnReason};

/// Absolute deadline of a timed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deadline(Tick);

impl Deadline {
    /// `to` ticks from now
    pub fn after(skd: &Scheduler, to: Tick) -> Self {
        Self(add_safely(skd.now(), to))
    }

    pub fn tick(self) -> Tick {
        self.0
    }

    /// Write the time left back into the caller's timeout
    pub fn store_remaining(self, skd: &Scheduler, to: &mut Tick) {
        *to = self.0.saturating_sub(skd.now());
    }
}

/// Whether the wait can be interrupted by [`Thread::intr`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitMode {
    Interruptible,
    Uninterruptible,
}

/// A thread between enqueue and wake-up
pub(crate) struct Blocker<'a> {
    skd: &'a Scheduler,
    ct: Arc<Thread>,
    deadline: Option<Deadline>,
    wklk: Option<WakeLock<'a>>,
}

impl<'a> Blocker<'a> {
    /// Step 1. The caller holds the lock that protects `q`.
    /// `Interrupted` when the CPU is freezing: nothing was queued.
    pub fn enqueue<Q: WaitQueue>(
        skd: &'a Scheduler,
        ct: &Arc<Thread>,
        q: &mut Q,
        ty: WqType,
        owner: Weak<dyn WqOwner>,
        mode: WaitMode,
        deadline: Option<Deadline>,
    ) -> KernelResult<Self> {
        let wklk = skd.wakelock().map_err(|_| KernelError::Interrupted)?;
        let prio = {
            let mut st = ct.st.lock();
            crate::kernel_bug_on!(
                !st.state.contains(ThreadState::RUNNING),
                "thread {} blocks in state {}",
                ct.id(),
                st.state
            );
            st.state.remove(ThreadState::RUNNING);
            st.state.insert(ThreadState::BLOCKING);
            if mode == WaitMode::Uninterruptible {
                st.state.insert(ThreadState::UNINTERRUPTED);
            }
            if deadline.is_some() {
                st.state.insert(ThreadState::SLEEPING);
            }
            let prio = st.dprio.v;
            st.dprio.wq = prio;
            st.dprio.r = PRIORITY_INVALID;
            prio
        };
        q.add(ct, prio, ty, owner, wqn_wakeup);
        if let Some(dl) = deadline {
            if let Err(e) = skd.time_tree().add(TtEntry::Thread(ct.clone()), dl.tick()) {
                crate::kernel_bug!("thread {}: timeout node busy: {}", ct.id(), e);
            }
        }
        Ok(Self {
            skd,
            ct: ct.clone(),
            deadline,
            wklk: Some(wklk),
        })
    }

    /// Steps 2 and 3. Every lock of the caller must be released.
    /// `dequeue` takes the thread off the object's queue with
    /// [`WqnReason::Intr`] under the object lock, `NotFound` if it is gone.
    pub fn block(self, dequeue: impl FnOnce(&Arc<Thread>) -> KernelResult<()>) -> KernelResult<()> {
        self.block_after(|| (), dequeue).1
    }

    /// [`Blocker::block`] running `release` between dropping the wake lock
    /// and giving the CPU away. `release` runs with preemption disabled,
    /// so a thread it readies cannot switch in before this one is parked.
    pub fn block_after<R>(
        mut self,
        release: impl FnOnce() -> R,
        dequeue: impl FnOnce(&Arc<Thread>) -> KernelResult<()>,
    ) -> (R, KernelResult<()>) {
        drop(self.wklk.take());
        self.skd.dspmpt();
        let r = release();
        self.skd.enpmpt();
        let _ = self.skd.req_swcx();
        self.wklk = self.skd.wakelock().ok();
        (r, self.resolve(dequeue))
    }

    fn resolve(&self, dequeue: impl FnOnce(&Arc<Thread>) -> KernelResult<()>) -> KernelResult<()> {
        let ct = &self.ct;
        match ct.wqn.reason() {
            reason @ (WqnReason::Up | WqnReason::Intr) => {
                self.disarm();
                if reason == WqnReason::Up {
                    Ok(())
                } else {
                    Err(KernelError::Interrupted)
                }
            }
            WqnReason::Unknown => {
                let timeout = match ct.ttn.reason() {
                    TtnReason::TimedOut => KernelError::TimedOut,
                    TtnReason::Intr => KernelError::Interrupted,
                    TtnReason::Unknown => {
                        crate::kernel_bug!("thread {}: woke without reason", ct.id())
                    }
                };
                match dequeue(ct) {
                    Ok(()) => {
                        ct.st
                            .lock()
                            .state
                            .remove(ThreadState::BLOCKING | ThreadState::UNINTERRUPTED);
                        Err(timeout)
                    }
                    // Lost the race: the poster or an interrupt got there first
                    Err(KernelError::NotFound) => match ct.wqn.reason() {
                        WqnReason::Up => Ok(()),
                        WqnReason::Intr => Err(KernelError::Interrupted),
                        WqnReason::Unknown => {
                            crate::kernel_bug!("thread {}: node gone without reason", ct.id())
                        }
                    },
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Drop the deadline of a thread woken through its wait queue
    fn disarm(&self) {
        if self.deadline.is_none() {
            return;
        }
        let ct = &self.ct;
        if self.skd.time_tree().remove(&ct.ttn).is_err() {
            // Expired meanwhile; its handler must not wake us again
            ct.ttn.disarm_fired();
        }
        ct.st.lock().state.remove(ThreadState::SLEEPING);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testing::{noop_owner, TestBed};
    use crate::wq::RtWaitQueue;

    #[test]
    fn test_deadline_remaining() {
        let bed = TestBed::started(1);
        let skd = bed.skd(0);
        let dl = Deadline::after(skd, 5);
        skd.tick_isr();
        skd.tick_isr();
        let mut to = 0;
        dl.store_remaining(skd, &mut to);
        assert_eq!(to, 3);
        for _ in 0..10 {
            skd.tick_isr();
        }
        dl.store_remaining(skd, &mut to);
        assert_eq!(to, 0);
    }

    #[test]
    fn test_enqueue_marks_thread_blocking() {
        let bed = TestBed::started(1);
        let skd = bed.skd(0);
        let t = bed.thread(4);
        let mut q = RtWaitQueue::new();
        let blk = Blocker::enqueue(
            skd,
            &t,
            &mut q,
            WqType::Cond,
            noop_owner(),
            WaitMode::Uninterruptible,
            Some(Deadline::after(skd, 10)),
        )
        .unwrap();
        let st = t.state();
        assert!(st.contains(ThreadState::BLOCKING | ThreadState::SLEEPING | ThreadState::UNINTERRUPTED));
        assert!(!st.contains(ThreadState::RUNNING));
        assert!(q.contains(&t));
        assert_eq!(t.ttn.deadline(), Some(10));
        // the wake lock is held until the thread gives the CPU away
        assert_eq!(skd.wakelock_count(), crate::scheduler::WKLKCNT_RUNNING + 1);
        drop(blk);
        assert_eq!(skd.wakelock_count(), crate::scheduler::WKLKCNT_RUNNING);
        let _ = q.remove(&t, WqnReason::Intr);
    }

    #[test]
    fn test_enqueue_refused_while_freezing() {
        let bed = TestBed::started(1);
        let skd = bed.skd(0);
        let t = bed.thread(4);
        skd.dec_wklkcnt().unwrap();
        assert!(skd.should_freeze());
        let mut q = RtWaitQueue::new();
        let rc = Blocker::enqueue(
            skd,
            &t,
            &mut q,
            WqType::Cond,
            noop_owner(),
            WaitMode::Interruptible,
            None,
        );
        assert!(matches!(rc, Err(KernelError::Interrupted)));
        assert!(q.is_empty());
    }
}
