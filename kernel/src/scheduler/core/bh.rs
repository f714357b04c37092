//! Bottom half
//!
//! Deferred interrupt work runs on a dedicated per-CPU stack, above every
//! thread and below interrupts. Entering it is a context switch of its own
//! (`sw_bh`); leaving it (`bh_yield`) resumes whatever it interrupted.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

use super::scheduler::{Scheduler, Stack};
use crate::error::{KernelError, KernelResult};
use crate::irq::IrqSpinLock;

/// Deferred work function
pub type BhFunc = fn(usize);

struct BhNode {
    func: BhFunc,
    arg: usize,
}

pub(crate) struct BottomHalf {
    req_cnt: AtomicUsize,
    dis_cnt: AtomicUsize,
    list: IrqSpinLock<VecDeque<BhNode>>,
}

impl BottomHalf {
    pub(crate) fn new() -> Self {
        Self {
            req_cnt: AtomicUsize::new(0),
            dis_cnt: AtomicUsize::new(0),
            list: IrqSpinLock::new(VecDeque::new()),
        }
    }

    /// Outstanding requests
    pub(crate) fn pending(&self) -> usize {
        self.req_cnt.load(Ordering::Acquire)
    }
}

impl Scheduler {
    /// Disable the bottom half (nests)
    pub fn dsbh(&self) {
        self.bh.dis_cnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Re-enable the bottom half; enters it if work was requested meanwhile
    pub fn enbh(&self) {
        let prev = self.bh.dis_cnt.fetch_sub(1, Ordering::AcqRel);
        crate::kernel_bug_on!(prev == 0, "cpu{}: unbalanced enbh", self.id());
        if prev == 1 && self.bh.pending() > 0 {
            let _ = self.sw_bh();
        }
    }

    pub fn bh_disabled(&self) -> bool {
        self.bh.dis_cnt.load(Ordering::Acquire) != 0
    }

    /// Ask for one pass of the bottom half
    pub fn req_bh(&self) -> KernelResult<()> {
        if !self.bh_enabled() {
            return Err(KernelError::Permission);
        }
        self.bh.req_cnt.fetch_add(1, Ordering::AcqRel);
        if self.bh_disabled() {
            return Ok(());
        }
        match self.sw_bh() {
            Err(KernelError::Permission) => Err(KernelError::Permission),
            // Counted; replayed when the switch in flight finishes
            _ => Ok(()),
        }
    }

    /// Queue `func(arg)` on the bottom half and request it
    pub fn req_bh_work(&self, func: BhFunc, arg: usize) -> KernelResult<()> {
        if !self.bh_enabled() {
            return Err(KernelError::Permission);
        }
        self.bh.list.lock().push_back(BhNode { func, arg });
        self.req_bh()
    }

    /// Switch to the bottom half stack
    pub fn sw_bh(&self) -> KernelResult<()> {
        if !self.bh_enabled() || self.bh_disabled() {
            return Err(KernelError::Permission);
        }
        {
            let mut cx = self.cx.lock();
            if cx.pstk.is_some() {
                return Err(KernelError::InProgress);
            }
            if cx.cstk.is_bh() {
                return Err(KernelError::Already);
            }
            let prev = core::mem::replace(&mut cx.cstk, Stack::Bh);
            trace!("cpu{}: {:?} -> bh", self.id(), prev);
            cx.pstk = Some(prev);
        }
        self.port().request_switch(self);
        Ok(())
    }

    /// Leave the bottom half for the stack it interrupted
    pub fn bh_yield(&self) {
        {
            let mut cx = self.cx.lock();
            let Some(prev) = cx.pstk.take() else {
                crate::kernel_bug!("cpu{}: bh yield without interrupted stack", self.id());
            };
            trace!("cpu{}: bh -> {:?}", self.id(), prev);
            cx.cstk = prev;
            cx.pstk = Some(Stack::Bh);
        }
        self.port().request_switch(self);
    }

    /// Body of the bottom half stack: run queued work until every request
    /// is served, then yield. Architectures loop on it.
    pub fn bh_main(&self) {
        loop {
            let node = self.bh.list.lock().pop_front();
            if let Some(node) = node {
                (node.func)(node.arg);
            }
            let prev = self
                .bh
                .req_cnt
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)))
                .unwrap_or(0);
            if prev <= 1 {
                self.bh_yield();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testing::TestBed;
    use core::sync::atomic::AtomicUsize;

    static WORK_DONE: AtomicUsize = AtomicUsize::new(0);

    fn work(arg: usize) {
        WORK_DONE.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn test_bh_runs_queued_work_and_returns() {
        let bed = TestBed::started(1);
        let skd = bed.skd(0);
        let before = skd.current_stack();
        skd.req_bh_work(work, 4).unwrap();
        skd.req_bh_work(work, 1).unwrap();
        assert_eq!(WORK_DONE.load(Ordering::SeqCst), 5);
        assert_eq!(skd.bh.pending(), 0);
        assert!(skd.prev_stack().is_none());
        assert_eq!(skd.current_stack().is_idle(), before.is_idle());
    }

    #[test]
    fn test_disabled_bh_defers_until_enabled() {
        let bed = TestBed::started(1);
        let skd = bed.skd(0);
        static DEFERRED: AtomicUsize = AtomicUsize::new(0);
        fn mark(_: usize) {
            DEFERRED.fetch_add(1, Ordering::SeqCst);
        }
        skd.dsbh();
        skd.dsbh();
        skd.req_bh_work(mark, 0).unwrap();
        assert_eq!(DEFERRED.load(Ordering::SeqCst), 0);
        skd.enbh();
        assert_eq!(DEFERRED.load(Ordering::SeqCst), 0);
        skd.enbh();
        assert_eq!(DEFERRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bh_off_in_config() {
        let bed = TestBed::with_config(crate::KernelConfig::with_cpus(1).bh(false));
        let skd = bed.skd(0);
        assert_eq!(skd.req_bh(), Err(KernelError::Permission));
        assert_eq!(skd.sw_bh(), Err(KernelError::Permission));
    }

    #[test]
    fn test_requests_while_in_bh_are_deferred() {
        let bed = TestBed::started(1);
        bed.port.set_auto_finish(false);
        let skd = bed.skd(0);
        skd.sw_bh().unwrap();
        assert!(skd.current_stack().is_bh());
        // switch still in flight
        assert_eq!(skd.sw_bh(), Err(KernelError::InProgress));
        skd.finish_context_switch();
        // the interrupted stack stays parked in pstk while the bh runs
        assert!(matches!(skd.prev_stack(), Some(Stack::Idle)));
        assert_eq!(skd.sw_bh(), Err(KernelError::InProgress));
        assert_eq!(skd.req_swcx(), Err(KernelError::InProgress));
        skd.bh_yield();
        skd.finish_context_switch();
        assert!(skd.current_stack().is_idle());
    }
}
