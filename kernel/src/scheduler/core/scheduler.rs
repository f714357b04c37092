//! Per-CPU scheduler
//!
//! Owns the run queue, the time tree, the thread table and the context
//! switch bookkeeping of one CPU. The switch itself is a two-step protocol:
//! [`Scheduler::req_swcx`] picks the next stack and asks the port to swap,
//! the port calls [`Scheduler::finish_context_switch`] when done. While a
//! switch is in flight `pstk` is set and further requests are only counted,
//! to be replayed by the finish.
//!
//! Lock order: cx → rq → thread state.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{info, trace, warn};

use super::bh::BottomHalf;
use super::pm::PmControl;
use super::runqueue::RtRunQueue;
use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::irq::IrqSpinLock;
use crate::port::{CpuId, Port};
use crate::scheduler::thread::state::{Priority, ThreadState, PRIORITY_INVALID};
use crate::scheduler::thread::{Thread, ThreadId};
use crate::time::{Tick, TimeTree};

/// A stack the CPU can execute on
#[derive(Clone)]
pub enum Stack {
    /// Idle loop
    Idle,
    /// Bottom half
    Bh,
    Thread(Arc<Thread>),
    /// Placeholder stored in `pstk` while a switch is being decided
    Reserved,
}

impl Stack {
    pub fn is_idle(&self) -> bool {
        matches!(self, Stack::Idle)
    }

    pub fn is_bh(&self) -> bool {
        matches!(self, Stack::Bh)
    }

    pub fn thread(&self) -> Option<&Arc<Thread>> {
        match self {
            Stack::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_thread(&self, thd: &Arc<Thread>) -> bool {
        matches!(self, Stack::Thread(t) if Arc::ptr_eq(t, thd))
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Stack::Idle => write!(f, "idle"),
            Stack::Bh => write!(f, "bh"),
            Stack::Thread(t) => write!(f, "thread {}", t.id()),
            Stack::Reserved => write!(f, "reserved"),
        }
    }
}

/// Execution context of the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Isr,
    Bh,
    Thread,
    Idle,
    /// Before the scheduler starts
    InitExit,
}

pub(crate) struct SwitchState {
    pub cstk: Stack,
    pub pstk: Option<Stack>,
    pub req_schedule_cnt: usize,
}

pub struct Scheduler {
    id: CpuId,
    port: Arc<dyn Port>,
    bh_enabled: bool,
    started: AtomicBool,
    pub(crate) cx: IrqSpinLock<SwitchState>,
    pub(crate) rq: IrqSpinLock<RtRunQueue<Arc<Thread>>>,
    pub(crate) tt: TimeTree,
    req_chkpmpt_cnt: AtomicUsize,
    dis_pmpt_cnt: AtomicUsize,
    pub(crate) bh: BottomHalf,
    pub(crate) threads: IrqSpinLock<BTreeMap<ThreadId, Arc<Thread>>>,
    pub(crate) pm: PmControl,
}

/// Work left to do once the switch bookkeeping is unlocked
enum Followup {
    None,
    SwitchToBh,
    Reschedule,
}

impl Scheduler {
    pub(crate) fn new(id: CpuId, port: Arc<dyn Port>, cfg: &KernelConfig) -> Self {
        Self {
            id,
            port,
            bh_enabled: cfg.bh_enabled,
            started: AtomicBool::new(false),
            cx: IrqSpinLock::new(SwitchState {
                cstk: Stack::Idle,
                pstk: None,
                req_schedule_cnt: 0,
            }),
            rq: IrqSpinLock::new(RtRunQueue::new()),
            tt: TimeTree::new(),
            req_chkpmpt_cnt: AtomicUsize::new(0),
            dis_pmpt_cnt: AtomicUsize::new(0),
            bh: BottomHalf::new(),
            threads: IrqSpinLock::new(BTreeMap::new()),
            pm: PmControl::new(),
        }
    }

    /// CPU served by this scheduler
    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn port(&self) -> &Arc<dyn Port> {
        &self.port
    }

    pub fn bh_enabled(&self) -> bool {
        self.bh_enabled
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn time_tree(&self) -> &TimeTree {
        &self.tt
    }

    /// Current tick count of this CPU
    pub fn now(&self) -> Tick {
        self.tt.now()
    }

    /// Number of live threads
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Live threads, ordered by id
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().values().cloned().collect()
    }

    /// Number of threads in the run queue
    pub fn ready_count(&self) -> usize {
        self.rq.lock().len()
    }

    /// Highest ready priority
    pub fn ready_top(&self) -> Priority {
        self.rq.lock().top()
    }

    pub fn current_stack(&self) -> Stack {
        self.cx.lock().cstk.clone()
    }

    pub fn prev_stack(&self) -> Option<Stack> {
        self.cx.lock().pstk.clone()
    }

    /// `thd` owns the CPU and no switch is in flight
    pub fn is_current(&self, thd: &Arc<Thread>) -> bool {
        let cx = self.cx.lock();
        cx.pstk.is_none() && cx.cstk.is_thread(thd)
    }

    /// Nothing but the idle loop runs and no switch is in flight
    pub fn is_idle(&self) -> bool {
        let cx = self.cx.lock();
        cx.pstk.is_none() && cx.cstk.is_idle()
    }

    pub fn context(&self) -> Context {
        if self.port.in_isr() {
            return Context::Isr;
        }
        if !self.is_started() {
            return Context::InitExit;
        }
        match self.cx.lock().cstk {
            Stack::Idle => Context::Idle,
            Stack::Bh => Context::Bh,
            Stack::Thread(_) => Context::Thread,
            Stack::Reserved => crate::kernel_bug!("cpu{}: reserved stack is current", self.id),
        }
    }

    /// Thread owning the CPU, if any
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.cx.lock().cstk.thread().cloned()
    }

    /// Calling thread; `NotInThread` from any other context
    pub(crate) fn current_thread_checked(&self) -> KernelResult<Arc<Thread>> {
        self.port.preempt_point(self);
        if self.port.in_isr() || !self.is_started() {
            return Err(KernelError::NotInThread);
        }
        if self.port.cpu_id() != self.id {
            return Err(KernelError::InvalidArgument);
        }
        self.current_thread().ok_or(KernelError::NotInThread)
    }

    /// Start scheduling: arm the tick timer and leave the idle stack
    pub fn start(&self) -> KernelResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(KernelError::Already);
        }
        self.tt.set_running(true);
        self.port.hwtimer_start(self.id);
        info!("cpu{}: scheduler started, {} thread(s)", self.id, self.thread_count());
        let _ = self.req_swcx();
        Ok(())
    }

    /// Tick interrupt: advance the time tree, then check for preemption
    pub fn tick_isr(&self) {
        self.tt.tick();
        self.chkpmpt();
    }

    /// Pop the best ready thread and mark it RUNNING
    fn choose_locked(rq: &mut RtRunQueue<Arc<Thread>>) -> Option<Arc<Thread>> {
        let (prio, thd) = rq.pop_top()?;
        {
            let mut st = thd.st.lock();
            crate::kernel_bug_on!(!st.state.contains(ThreadState::READY), "chosen thread not ready");
            st.state.remove(ThreadState::READY);
            st.state.insert(ThreadState::RUNNING);
            st.dprio.rq = PRIORITY_INVALID;
            st.dprio.r = prio;
        }
        Some(thd)
    }

    /// Put a running thread back at the head of its band and choose again.
    /// `Permission` when `thd` should keep the CPU.
    fn check_swcx(&self, thd: &Arc<Thread>) -> KernelResult<Option<Arc<Thread>>> {
        let mut rq = self.rq.lock();
        {
            let mut st = thd.st.lock();
            if st.state.contains(ThreadState::RUNNING) {
                if st.dprio.r >= rq.top() {
                    return Err(KernelError::Permission);
                }
                let prio = st.dprio.r;
                st.state.remove(ThreadState::RUNNING);
                st.state.insert(ThreadState::READY);
                st.dprio.r = PRIORITY_INVALID;
                st.dprio.rq = prio;
                rq.add_head(prio, thd.clone());
            }
        }
        Ok(Self::choose_locked(&mut rq))
    }

    fn do_swcx(&self, cx: &mut SwitchState) -> KernelResult<()> {
        let next = match &cx.cstk {
            Stack::Idle => match Self::choose_locked(&mut self.rq.lock()) {
                Some(t) => Stack::Thread(t),
                None => return Err(KernelError::Again),
            },
            Stack::Thread(ct) => {
                let ct = ct.clone();
                match self.check_swcx(&ct) {
                    Ok(Some(t)) if Arc::ptr_eq(&t, &ct) => return Err(KernelError::Again),
                    Ok(Some(t)) => Stack::Thread(t),
                    Ok(None) => Stack::Idle,
                    // Still the best ready thread
                    Err(KernelError::Permission) => return Err(KernelError::Again),
                    Err(e) => return Err(e),
                }
            }
            Stack::Bh | Stack::Reserved => {
                crate::kernel_bug!("cpu{}: switch requested from {:?}", self.id, cx.cstk)
            }
        };
        trace!("cpu{}: switch {:?} -> {:?}", self.id, cx.cstk, next);
        let prev = core::mem::replace(&mut cx.cstk, next);
        cx.pstk = Some(prev);
        Ok(())
    }

    /// Request a context switch to the best ready thread.
    ///
    /// `InProgress` when a switch is already in flight and `Busy` while the
    /// bottom half runs: the request is counted and replayed when the
    /// current switch finishes. `Again` when nothing better is ready, the
    /// running thread included.
    pub fn req_swcx(&self) -> KernelResult<()> {
        if !self.is_started() {
            return Err(KernelError::Again);
        }
        let rc = {
            let mut cx = self.cx.lock();
            cx.req_schedule_cnt += 1;
            if cx.pstk.is_some() {
                return Err(KernelError::InProgress);
            }
            if cx.cstk.is_bh() {
                return Err(KernelError::Busy);
            }
            cx.pstk = Some(Stack::Reserved);
            self.do_swcx(&mut cx)
        };
        match rc {
            Ok(()) => self.port.request_switch(self),
            Err(_) => self.finish_context_switch(),
        }
        self.port.preempt_point(self);
        rc
    }

    /// Complete a switch: called by the port once the new stack runs, or
    /// directly when no switch was needed. Replays pending requests.
    pub fn finish_context_switch(&self) {
        let next = {
            let mut cx = self.cx.lock();
            if cx.cstk.is_bh() {
                Followup::None
            } else {
                if !matches!(cx.pstk, Some(Stack::Bh)) {
                    cx.req_schedule_cnt = cx.req_schedule_cnt.saturating_sub(1);
                }
                cx.pstk = None;
                if self.bh_enabled && self.bh.pending() > 0 {
                    Followup::SwitchToBh
                } else if cx.req_schedule_cnt > 0 {
                    cx.req_schedule_cnt = 0;
                    Followup::Reschedule
                } else {
                    Followup::None
                }
            }
        };
        match next {
            Followup::None => {}
            Followup::SwitchToBh => {
                let _ = self.sw_bh();
            }
            Followup::Reschedule => {
                let _ = self.req_swcx();
            }
        }
    }

    /// Check whether the current thread must give the CPU to a higher
    /// priority ready thread. Deferred while preemption is disabled.
    pub fn chkpmpt(&self) {
        if !self.is_started() {
            return;
        }
        if self.dis_pmpt_cnt.load(Ordering::Acquire) != 0 {
            self.req_chkpmpt_cnt.fetch_add(1, Ordering::AcqRel);
            return;
        }
        let sched = {
            let cx = self.cx.lock();
            let stk = if cx.cstk.is_bh() {
                cx.pstk.clone()
            } else {
                Some(cx.cstk.clone())
            };
            match stk {
                Some(Stack::Idle) => true,
                Some(Stack::Thread(t)) => {
                    let rq = self.rq.lock();
                    let st = t.st.lock();
                    st.state.contains(ThreadState::RUNNING) && st.dprio.r < rq.top()
                }
                _ => false,
            }
        };
        self.req_chkpmpt_cnt.store(0, Ordering::Release);
        if sched {
            let _ = self.req_swcx();
        }
    }

    /// Disable preemption (nests)
    pub fn dspmpt(&self) {
        self.dis_pmpt_cnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Re-enable preemption; runs a check deferred meanwhile
    pub fn enpmpt(&self) {
        let prev = self.dis_pmpt_cnt.fetch_sub(1, Ordering::AcqRel);
        crate::kernel_bug_on!(prev == 0, "cpu{}: unbalanced enpmpt", self.id);
        if prev == 1 && self.req_chkpmpt_cnt.load(Ordering::Acquire) > 0 {
            self.chkpmpt();
        }
    }

    pub fn preemption_enabled(&self) -> bool {
        self.dis_pmpt_cnt.load(Ordering::Acquire) == 0
    }

    /// Register a new thread
    pub(crate) fn attach(&self, thd: &Arc<Thread>) {
        let _pm = self.pm.frz.lock();
        self.threads.lock().insert(thd.id(), thd.clone());
    }

    /// Unregister an exiting thread. True when every remaining thread is
    /// frozen and a freeze is in progress.
    pub(crate) fn detach_exiting(&self, thd: &Arc<Thread>) -> bool {
        let frz = self.pm.frz.lock();
        let mut tbl = self.threads.lock();
        if tbl.remove(&thd.id()).is_none() {
            warn!("cpu{}: thread {} not in table", self.id, thd.id());
        }
        self.should_freeze() && frz.list.len() == tbl.len()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("cpu", &self.id)
            .field("started", &self.is_started())
            .field("threads", &self.thread_count())
            .field("ready", &self.ready_count())
            .finish()
    }
}

/// Snapshot of a scheduler for diagnostics
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub cpu: CpuId,
    pub threads: usize,
    pub ready: usize,
    pub frozen: usize,
    pub timers: usize,
    pub pending_bh: usize,
    pub now: Tick,
}

impl Scheduler {
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            cpu: self.id,
            threads: self.thread_count(),
            ready: self.ready_count(),
            frozen: self.frozen_count(),
            timers: self.tt.len(),
            pending_bh: self.bh.pending(),
            now: self.now(),
        }
    }
}
