//! Power management
//!
//! The wake lock count doubles as the power state of a CPU:
//!
//! ```text
//!  >= UNLOCKED  running; every value above UNLOCKED is one wake lock held
//!     FREEZING  last lock dropped after a suspend request; threads freeze
//!     ALLFRZ    every thread frozen, tick timer stopped
//!     SUSPENDED idle loop acknowledged the suspension
//! ```
//!
//! Resuming walks the same ladder upwards (THAWING shares FREEZING's value).
//!
//! Lock order: freeze lock → (thread table | thread state).

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicIsize, Ordering};

use log::{debug, info};

use super::scheduler::Scheduler;
use crate::error::{KernelError, KernelResult};
use crate::irq::IrqSpinLock;
use crate::scheduler::thread::state::{ThreadState, PRIORITY_INVALID};
use crate::scheduler::thread::Thread;

pub const WKLKCNT_SUSPENDED: isize = 0;
pub const WKLKCNT_ALLFRZ: isize = 1;
pub const WKLKCNT_FREEZING: isize = 2;
pub const WKLKCNT_THAWING: isize = WKLKCNT_FREEZING;
pub const WKLKCNT_UNLOCKED: isize = 3;
pub const WKLKCNT_RUNNING: isize = WKLKCNT_UNLOCKED;

/// Power state decoded from the wake lock count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmState {
    /// Running with this many wake locks held
    Running(usize),
    /// Threads are freezing, or thawing on the way back up
    Freezing,
    AllFrozen,
    Suspended,
}

pub(crate) struct FrozenSet {
    pub list: Vec<Arc<Thread>>,
}

pub(crate) struct PmControl {
    wklkcnt: AtomicIsize,
    pub frz: IrqSpinLock<FrozenSet>,
}

impl PmControl {
    pub(crate) fn new() -> Self {
        Self {
            wklkcnt: AtomicIsize::new(WKLKCNT_RUNNING),
            frz: IrqSpinLock::new(FrozenSet { list: Vec::new() }),
        }
    }
}

/// Held wake lock; released on drop
pub struct WakeLock<'a> {
    skd: &'a Scheduler,
}

impl Drop for WakeLock<'_> {
    fn drop(&mut self) {
        let _ = self.skd.dec_wklkcnt();
    }
}

impl Scheduler {
    /// Raw wake lock count
    pub fn wakelock_count(&self) -> isize {
        self.pm.wklkcnt.load(Ordering::Acquire)
    }

    pub fn pm_state(&self) -> PmState {
        match self.wakelock_count() {
            WKLKCNT_SUSPENDED => PmState::Suspended,
            WKLKCNT_ALLFRZ => PmState::AllFrozen,
            WKLKCNT_FREEZING => PmState::Freezing,
            c => PmState::Running(c.saturating_sub(WKLKCNT_UNLOCKED).unsigned_abs()),
        }
    }

    /// Threads must freeze: a suspension is in progress or done
    pub fn should_freeze(&self) -> bool {
        self.wakelock_count() < WKLKCNT_UNLOCKED
    }

    pub fn is_suspended(&self) -> bool {
        self.wakelock_count() == WKLKCNT_SUSPENDED
    }

    pub fn frozen_count(&self) -> usize {
        self.pm.frz.lock().list.len()
    }

    /// Take a wake lock. `Permission` once a suspension started.
    pub fn inc_wklkcnt(&self) -> KernelResult<()> {
        self.pm
            .wklkcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c >= WKLKCNT_UNLOCKED).then_some(c + 1)
            })
            .map(|_| ())
            .map_err(|_| KernelError::Permission)
    }

    /// Drop a wake lock. Dropping the last one after a suspend request
    /// starts freezing.
    pub fn dec_wklkcnt(&self) -> KernelResult<()> {
        let prev = self
            .pm
            .wklkcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c >= WKLKCNT_UNLOCKED).then_some(c - 1)
            })
            .map_err(|_| KernelError::Permission)?;
        if prev - 1 == WKLKCNT_FREEZING {
            info!("cpu{}: suspending", self.id());
            self.port().request_suspend(self);
        }
        Ok(())
    }

    /// RAII wake lock
    pub fn wakelock(&self) -> KernelResult<WakeLock<'_>> {
        self.inc_wklkcnt()?;
        Ok(WakeLock { skd: self })
    }

    /// Interrupt every thread so it reaches a freeze point, then check
    /// whether all are frozen already. Runs in the scheduler service
    /// interrupt.
    pub fn suspend_lic(&self) {
        for thd in self.threads() {
            let _ = thd.intr();
        }
        let allfrz = {
            let frz = self.pm.frz.lock();
            frz.list.len() == self.threads.lock().len()
        };
        if allfrz {
            let _ = self.notify_allfrz_lic();
        }
    }

    /// Every thread is frozen: stop the tick and leave for idle.
    /// `Interrupted` when the freeze was cancelled by a resume.
    pub fn notify_allfrz_lic(&self) -> KernelResult<()> {
        let rc = match self.pm.wklkcnt.compare_exchange(
            WKLKCNT_FREEZING,
            WKLKCNT_ALLFRZ,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.tt.set_running(false);
                self.port().hwtimer_stop(self.id());
                debug!("cpu{}: all threads frozen", self.id());
                Ok(())
            }
            Err(_) => Err(KernelError::Interrupted),
        };
        let _ = self.req_swcx();
        rc
    }

    /// One pass of the idle loop: acknowledge a completed freeze
    pub fn idle_step(&self) {
        if self
            .pm
            .wklkcnt
            .compare_exchange(
                WKLKCNT_ALLFRZ,
                WKLKCNT_SUSPENDED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!("cpu{}: suspended", self.id());
            self.port().report_suspended(self.id());
        }
    }

    fn pm_step(&self, from: isize, to: isize) -> bool {
        self.pm
            .wklkcnt
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Climb back to RUNNING and thaw every frozen thread.
    /// `Already` when not suspended.
    pub fn resume_lic(&self) -> KernelResult<()> {
        loop {
            match self.wakelock_count() {
                WKLKCNT_SUSPENDED => {
                    if self.pm_step(WKLKCNT_SUSPENDED, WKLKCNT_ALLFRZ) {
                        info!("cpu{}: resuming", self.id());
                        self.port().report_resuming(self.id());
                    }
                }
                WKLKCNT_ALLFRZ => {
                    if self.pm_step(WKLKCNT_ALLFRZ, WKLKCNT_THAWING) {
                        self.tt.set_running(true);
                        self.port().hwtimer_start(self.id());
                    }
                }
                WKLKCNT_THAWING => {
                    if self.pm_step(WKLKCNT_THAWING, WKLKCNT_UNLOCKED) {
                        self.thaw_allfrz_lic();
                        return Ok(());
                    }
                }
                _ => return Err(KernelError::Already),
            }
        }
    }

    fn thaw_allfrz_lic(&self) {
        {
            let mut frz = self.pm.frz.lock();
            for thd in frz.list.drain(..) {
                thd.make_ready_with(|st| st.remove(ThreadState::FROZEN));
            }
        }
        debug!("cpu{}: threads thawed", self.id());
        let _ = self.req_swcx();
    }

    /// Freeze the calling thread until the CPU resumes
    pub fn freeze_current(&self) -> KernelResult<()> {
        let ct = self.current_thread_checked()?;
        if !self.should_freeze() {
            return Err(KernelError::Permission);
        }
        let allfrz = {
            let mut frz = self.pm.frz.lock();
            {
                let mut st = ct.st.lock();
                crate::kernel_bug_on!(
                    !st.state.contains(ThreadState::RUNNING),
                    "freezing thread {} in state {}",
                    ct.id(),
                    st.state
                );
                st.state.remove(ThreadState::RUNNING);
                st.state.insert(ThreadState::FROZEN);
                st.dprio.r = PRIORITY_INVALID;
            }
            frz.list.push(ct.clone());
            frz.list.len() == self.threads.lock().len()
        };
        debug!("cpu{}: thread {} frozen", self.id(), ct.id());
        if allfrz {
            let _ = self.notify_allfrz_lic();
        } else {
            let _ = self.req_swcx();
        }
        Ok(())
    }

    /// Freeze if a suspension is pending, then report whether the calling
    /// thread was asked to quit
    pub fn freeze_then_should_stop(&self) -> KernelResult<bool> {
        if self.should_freeze() {
            self.freeze_current()?;
        }
        self.should_stop()
    }
}
