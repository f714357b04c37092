//! Thread Structure and Management
//!
//! A thread control block: scheduling state, the wait queue and time tree
//! nodes it parks on, the mutexes it owns and its exit status.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::state::{priority_is_valid, DynPrio, Priority, ThreadState, PRIORITY_INVALID};
use crate::config::{THREAD_STACK_SIZE_DEFAULT, THREAD_STACK_SIZE_MIN};
use crate::error::{KernelError, KernelResult};
use crate::irq::IrqSpinLock;
use crate::scheduler::Scheduler;
use crate::sync::{Cond, Mtx};
use crate::time::tree::TtKey;
use crate::time::TtNode;
use crate::wq::{WaitQueueNode, WqOwner};

/// Thread ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

pub fn alloc_thread_id() -> ThreadId {
    ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadOptions: u32 {
        /// Resources are reclaimed on exit; the thread cannot be joined
        const DETACHED = 1 << 0;
        /// Runs with the architecture's privileged mode
        const PRIVILEGED = 1 << 1;
    }
}

/// Creation attributes
#[derive(Debug, Clone)]
pub struct ThreadAttr {
    pub name: &'static str,
    pub priority: Priority,
    pub stack_size: usize,
    pub options: ThreadOptions,
}

impl Default for ThreadAttr {
    fn default() -> Self {
        Self {
            name: "thread",
            priority: 0,
            stack_size: THREAD_STACK_SIZE_DEFAULT,
            options: ThreadOptions::empty(),
        }
    }
}

impl ThreadAttr {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn priority(mut self, prio: Priority) -> Self {
        self.priority = prio;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn options(mut self, options: ThreadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> KernelResult<()> {
        if !priority_is_valid(self.priority) || self.stack_size < THREAD_STACK_SIZE_MIN {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }
}

/// Thread body; its return value is the exit code
pub type ThreadEntry = Box<dyn FnOnce() -> i32 + Send + 'static>;

pub(crate) struct ThreadSched {
    pub state: ThreadState,
    pub sprio: Priority,
    pub dprio: DynPrio,
}

/// Mutexes a thread owns (they lend it their priority) and the one it
/// waits for
pub(crate) struct MtxTracker {
    pub owned: Vec<Arc<Mtx>>,
    pub waiting: Option<Weak<Mtx>>,
}

pub(crate) struct ExitState {
    pub exited: bool,
    pub code: i32,
    pub detached: bool,
}

pub struct Thread {
    id: ThreadId,
    name: &'static str,
    stack_size: usize,
    options: ThreadOptions,
    skd: Arc<Scheduler>,
    pub(crate) st: IrqSpinLock<ThreadSched>,
    pub(crate) wqn: WaitQueueNode,
    pub(crate) ttn: TtNode,
    pub(crate) mtx: IrqSpinLock<MtxTracker>,
    entry: IrqSpinLock<Option<ThreadEntry>>,
    pub(crate) exit: IrqSpinLock<ExitState>,
    pub(crate) completion: Arc<Cond>,
}

impl Thread {
    pub(crate) fn new(attr: &ThreadAttr, skd: Arc<Scheduler>, entry: ThreadEntry) -> Arc<Self> {
        Arc::new(Self {
            id: alloc_thread_id(),
            name: attr.name,
            stack_size: attr.stack_size,
            options: attr.options,
            skd,
            st: IrqSpinLock::new(ThreadSched {
                state: ThreadState::STANDBY,
                sprio: attr.priority,
                dprio: DynPrio::new(attr.priority),
            }),
            wqn: WaitQueueNode::new(),
            ttn: TtNode::new(),
            mtx: IrqSpinLock::new(MtxTracker {
                owned: Vec::new(),
                waiting: None,
            }),
            entry: IrqSpinLock::new(Some(entry)),
            exit: IrqSpinLock::new(ExitState {
                exited: false,
                code: 0,
                detached: attr.options.contains(ThreadOptions::DETACHED),
            }),
            completion: Cond::new(),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn options(&self) -> ThreadOptions {
        self.options
    }

    /// Scheduler the thread is bound to
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.skd
    }

    pub fn state(&self) -> ThreadState {
        self.st.lock().state
    }

    /// Static priority
    pub fn priority(&self) -> Priority {
        self.st.lock().sprio
    }

    /// Effective priority, including inheritance
    pub fn dynamic_priority(&self) -> Priority {
        self.st.lock().dprio.v
    }

    pub fn is_detached(&self) -> bool {
        self.exit.lock().detached
    }

    /// Exit code once the entry returned
    pub fn exit_code(&self) -> Option<i32> {
        let ex = self.exit.lock();
        ex.exited.then_some(ex.code)
    }

    pub(crate) fn take_entry(&self) -> Option<ThreadEntry> {
        self.entry.lock().take()
    }

    /// Apply `f` to the state, then queue the thread on its run queue if
    /// nothing keeps it off. Returns whether it was queued.
    pub(crate) fn make_ready_with(self: &Arc<Self>, f: impl FnOnce(&mut ThreadState)) -> bool {
        let mut rq = self.skd.rq.lock();
        let mut st = self.st.lock();
        f(&mut st.state);
        if st.state.intersects(
            ThreadState::STANDBY
                | ThreadState::READY
                | ThreadState::RUNNING
                | ThreadState::FROZEN
                | ThreadState::EXITED,
        ) {
            return false;
        }
        st.state.insert(ThreadState::READY);
        let prio = st.dprio.v;
        st.dprio.rq = prio;
        rq.add_tail(prio, self.clone());
        true
    }

    /// Move a new thread out of STANDBY
    pub(crate) fn activate(self: &Arc<Self>) {
        if self.make_ready_with(|s| s.remove(ThreadState::STANDBY)) {
            self.skd.chkpmpt();
        }
    }

    /// Time tree handler: the deadline `key` passed
    pub(crate) fn on_tt_expired(self: Arc<Self>, key: TtKey) {
        let woke = self.ttn.run_if_fired(key, || {
            self.make_ready_with(|s| s.remove(ThreadState::SLEEPING))
        });
        if woke == Some(true) {
            log::trace!("thread {}: timed out", self.id);
        }
    }

    /// Interrupt a blocking or sleeping thread. `Permission` if it waits
    /// uninterruptibly.
    pub fn intr(self: &Arc<Self>) -> KernelResult<()> {
        let state = self.state();
        if state.contains(ThreadState::UNINTERRUPTED) {
            return Err(KernelError::Permission);
        }
        if state.contains(ThreadState::BLOCKING) {
            match self.wqn.owner() {
                Some(owner) => owner.intr(self),
                // Woken already
                None => Ok(()),
            }
        } else if state.contains(ThreadState::SLEEPING) {
            match self.skd.tt.remove(&self.ttn) {
                Ok(()) => {}
                // The tick fired first and readies the thread itself
                Err(KernelError::NotFound) => return Ok(()),
                Err(e) => return Err(e),
            }
            self.ttn.set_reason(crate::time::TtnReason::Intr);
            if self.make_ready_with(|s| s.remove(ThreadState::SLEEPING)) {
                self.skd.chkpmpt();
            }
            Ok(())
        } else {
            Ok(())
        }
    }

    /// Ask the thread to quit: flag it and interrupt its wait
    pub fn quit(self: &Arc<Self>) -> KernelResult<()> {
        self.st.lock().state.insert(ThreadState::EXITING);
        match self.intr() {
            Err(KernelError::Permission) => Ok(()),
            rc => rc,
        }
    }

    /// Wait for the thread to exit and return its exit code
    pub fn join(self: &Arc<Self>, skd: &Scheduler) -> KernelResult<i32> {
        let ct = skd.current_thread_checked()?;
        if Arc::ptr_eq(&ct, self) {
            return Err(KernelError::Deadlock);
        }
        let mut ex = self.exit.lock();
        if ex.detached {
            return Err(KernelError::InvalidArgument);
        }
        while !ex.exited {
            let (guard, rc) = self.completion.wait(skd, &self.exit, ex);
            ex = guard;
            rc?;
        }
        Ok(ex.code)
    }

    /// Nobody will join the thread
    pub fn detach(&self) -> KernelResult<()> {
        let mut ex = self.exit.lock();
        if ex.detached {
            return Err(KernelError::Already);
        }
        ex.detached = true;
        Ok(())
    }

    /// Change the static priority
    pub fn chprio(self: &Arc<Self>, prio: Priority) -> KernelResult<()> {
        if !priority_is_valid(prio) {
            return Err(KernelError::InvalidArgument);
        }
        self.st.lock().sprio = prio;
        self.refresh_priority();
        Ok(())
    }

    /// Static priority raised by the priority of every owned mutex
    pub(crate) fn compute_dprio(&self) -> Priority {
        let sprio = self.st.lock().sprio;
        let inherited = self
            .mtx
            .lock()
            .owned
            .iter()
            .map(|m| m.dprio())
            .max()
            .unwrap_or(PRIORITY_INVALID);
        sprio.max(inherited)
    }

    /// Re-evaluate the effective priority and follow the chain of mutex
    /// owners it propagates to
    pub(crate) fn refresh_priority(self: &Arc<Self>) {
        let mut cur = self.clone();
        loop {
            let dprio = cur.compute_dprio();
            let Some(next) = cur.apply_dprio(dprio) else {
                break;
            };
            cur.skd.chkpmpt();
            match next {
                Some(n) => cur = n,
                None => break,
            }
        }
    }

    /// Set the effective priority and requeue wherever the thread is.
    /// `None` if unchanged, else the next thread of the inheritance chain.
    fn apply_dprio(self: &Arc<Self>, prio: Priority) -> Option<Option<Arc<Thread>>> {
        let blocking = {
            let mut rq = self.skd.rq.lock();
            let mut st = self.st.lock();
            if st.dprio.v == prio {
                return None;
            }
            st.dprio.v = prio;
            if st.state.contains(ThreadState::READY) {
                let old = st.dprio.rq;
                if rq.remove_by(old, |t| Arc::ptr_eq(t, self)).is_none() {
                    crate::kernel_bug!("thread {}: ready but not queued", self.id);
                }
                st.dprio.rq = prio;
                rq.add_tail(prio, self.clone());
            } else if st.state.contains(ThreadState::RUNNING) {
                st.dprio.r = prio;
            }
            let blocking = st.state.contains(ThreadState::BLOCKING);
            if blocking {
                st.dprio.wq = prio;
            }
            blocking
        };
        if blocking {
            if let Some(owner) = self.wqn.owner() {
                return Some(owner.waiter_prio_changed(self, prio));
            }
        }
        Some(None)
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let st = self.st.lock();
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &st.state)
            .field("sprio", &st.sprio)
            .field("dprio", &st.dprio.v)
            .finish()
    }
}

/// Wait queue wake-up callback shared by every synchronization object
pub(crate) fn wqn_wakeup(thd: &Arc<Thread>) {
    if thd.make_ready_with(|s| s.remove(ThreadState::BLOCKING | ThreadState::UNINTERRUPTED)) {
        thd.skd.chkpmpt();
    }
}

/// First code a new thread runs: its entry, then exit with its result
pub fn thread_trampoline(thd: &Arc<Thread>) {
    let Some(entry) = thd.take_entry() else {
        crate::kernel_bug!("thread {}: started twice", thd.id());
    };
    let rc = entry();
    if let Err(e) = thd.skd.exit_current(rc) {
        log::error!("thread {}: exit failed: {}", thd.id(), e);
    }
}
