//! Thread lifecycle: creation, exit, yield and sleep of the calling thread

use alloc::boxed::Box;
use alloc::sync::Arc;

use log::debug;

use super::state::{ThreadState, PRIORITY_INVALID};
use super::thread::{Thread, ThreadAttr};
use crate::error::{KernelError, KernelResult};
use crate::scheduler::Scheduler;
use crate::time::{add_safely, Tick, TtEntry, TtnReason};

impl Scheduler {
    /// Create a thread bound to this scheduler and make it ready
    pub fn spawn<F>(self: &Arc<Self>, attr: ThreadAttr, entry: F) -> KernelResult<Arc<Thread>>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        attr.validate()?;
        let thd = Thread::new(&attr, self.clone(), Box::new(entry));
        self.port().init_thread_stack(&thd)?;
        self.attach(&thd);
        debug!(
            "cpu{}: thread {} '{}' created, prio {}",
            self.id(),
            thd.id(),
            thd.name(),
            attr.priority
        );
        thd.activate();
        Ok(thd)
    }

    /// Terminate the calling thread with exit code `rc`
    pub fn exit_current(&self, rc: i32) -> KernelResult<()> {
        let ct = self.current_thread_checked()?;
        {
            let mut ex = ct.exit.lock();
            ex.exited = true;
            ex.code = rc;
        }
        let _ = ct.completion.broadcast();
        let allfrz = self.detach_exiting(&ct);
        {
            let mut st = ct.st.lock();
            st.state.remove(ThreadState::RUNNING | ThreadState::EXITING);
            st.state.insert(ThreadState::STANDBY | ThreadState::EXITED);
            st.dprio.r = PRIORITY_INVALID;
        }
        debug!("cpu{}: thread {} exited ({})", self.id(), ct.id(), rc);
        if allfrz {
            let _ = self.notify_allfrz_lic();
        } else {
            let _ = self.req_swcx();
        }
        Ok(())
    }

    /// Give the CPU to the next ready thread of the same priority
    pub fn yield_current(&self) -> KernelResult<()> {
        let ct = self.current_thread_checked()?;
        {
            let mut rq = self.rq.lock();
            let mut st = ct.st.lock();
            crate::kernel_bug_on!(!st.state.contains(ThreadState::RUNNING), "yield from {}", st.state);
            st.state.remove(ThreadState::RUNNING);
            st.state.insert(ThreadState::READY);
            let prio = st.dprio.v;
            st.dprio.r = PRIORITY_INVALID;
            st.dprio.rq = prio;
            rq.add_tail(prio, ct.clone());
        }
        let _ = self.req_swcx();
        Ok(())
    }

    /// Sleep until tick `deadline`. `Interrupted` if woken early.
    pub fn sleep_to(&self, deadline: Tick) -> KernelResult<()> {
        let ct = self.current_thread_checked()?;
        let wklk = self.wakelock().map_err(|_| KernelError::Interrupted)?;
        {
            let mut st = ct.st.lock();
            crate::kernel_bug_on!(!st.state.contains(ThreadState::RUNNING), "sleep from {}", st.state);
            st.state.remove(ThreadState::RUNNING);
            st.state.insert(ThreadState::SLEEPING);
            st.dprio.r = PRIORITY_INVALID;
        }
        if let Err(e) = self.tt.add(TtEntry::Thread(ct.clone()), deadline) {
            crate::kernel_bug!("thread {}: sleep node busy: {}", ct.id(), e);
        }
        drop(wklk);
        let _ = self.req_swcx();
        match ct.ttn.reason() {
            TtnReason::TimedOut => Ok(()),
            TtnReason::Intr => Err(KernelError::Interrupted),
            TtnReason::Unknown => crate::kernel_bug!("thread {}: woke from sleep without reason", ct.id()),
        }
    }

    /// Sleep for `dur` ticks
    pub fn sleep(&self, dur: Tick) -> KernelResult<()> {
        self.sleep_to(add_safely(self.now(), dur))
    }

    /// Sleep until `*origin + inc`, then advance `*origin` to it. Keeps a
    /// fixed period whatever the time spent between calls.
    pub fn sleep_from(&self, origin: &mut Tick, inc: Tick) -> KernelResult<()> {
        let deadline = add_safely(*origin, inc);
        self.sleep_to(deadline)?;
        *origin = deadline;
        Ok(())
    }

    /// The calling thread was asked to quit
    pub fn should_stop(&self) -> KernelResult<bool> {
        let ct = self.current_thread_checked()?;
        let stop = ct.state().contains(ThreadState::EXITING);
        Ok(stop)
    }
}
