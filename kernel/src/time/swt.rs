//! Software timers
//!
//! One-shot or periodic callbacks driven by a scheduler's time tree. The
//! callback runs in the tick interrupt with no kernel lock held.

use alloc::sync::Arc;

use bitflags::bitflags;
use log::debug;

use super::tree::{TimeTree, TtEntry, TtKey, TtNode};
use super::{add_safely, Tick};
use crate::error::{KernelError, KernelResult};
use crate::irq::IrqSpinLock;
use crate::scheduler::Scheduler;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SwtFlags: u32 {
        /// Re-arm after each expiry
        const RESTART = 1 << 0;
    }
}

/// Timer callback: the timer and the argument given to [`Swt::start`]
pub type SwtCallback = fn(&Arc<Swt>, usize);

struct SwtCfg {
    cb: Option<SwtCallback>,
    arg: usize,
    period: Tick,
    skd: Option<Arc<Scheduler>>,
}

pub struct Swt {
    flags: SwtFlags,
    ttn: TtNode,
    cfg: IrqSpinLock<SwtCfg>,
}

impl Swt {
    pub fn new(flags: SwtFlags) -> Arc<Self> {
        Arc::new(Self {
            flags,
            ttn: TtNode::new(),
            cfg: IrqSpinLock::new(SwtCfg {
                cb: None,
                arg: 0,
                period: 0,
                skd: None,
            }),
        })
    }

    pub fn flags(&self) -> SwtFlags {
        self.flags
    }

    pub(crate) fn node(&self) -> &TtNode {
        &self.ttn
    }

    pub fn is_running(&self) -> bool {
        self.cfg.lock().skd.is_some()
    }

    /// Arm the timer on `skd`: first expiry at `origin + period`, then every
    /// `period` ticks when [`SwtFlags::RESTART`] is set.
    pub fn start(
        self: &Arc<Self>,
        skd: &Arc<Scheduler>,
        origin: Tick,
        period: Tick,
        cb: SwtCallback,
        arg: usize,
    ) -> KernelResult<()> {
        if period == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut cfg = self.cfg.lock();
        if cfg.skd.is_some() {
            return Err(KernelError::Already);
        }
        skd.time_tree()
            .add(TtEntry::Swt(self.clone()), add_safely(origin, period))?;
        cfg.cb = Some(cb);
        cfg.arg = arg;
        cfg.period = period;
        cfg.skd = Some(skd.clone());
        debug!("swt: started on cpu {} period {}", skd.id(), period);
        Ok(())
    }

    /// Disarm the timer. `NotFound` if it is not running.
    pub fn stop(&self) -> KernelResult<()> {
        let mut cfg = self.cfg.lock();
        let skd = cfg.skd.take().ok_or(KernelError::NotFound)?;
        // A one-shot that already expired is no longer in the tree.
        let _ = skd.time_tree().remove(&self.ttn);
        self.ttn.disarm_fired();
        Ok(())
    }

    pub(crate) fn on_expired(self: Arc<Self>, tt: &TimeTree, key: TtKey) {
        if !self.ttn.take_fired(key) {
            return;
        }
        let (cb, arg) = {
            let mut cfg = self.cfg.lock();
            if !self.flags.contains(SwtFlags::RESTART) {
                cfg.skd = None;
            }
            (cfg.cb, cfg.arg)
        };
        if let Some(cb) = cb {
            cb(&self, arg);
        }
        if self.flags.contains(SwtFlags::RESTART) {
            let cfg = self.cfg.lock();
            if cfg.skd.is_some() {
                let next = add_safely(key.0, cfg.period);
                let _ = tt.add(TtEntry::Swt(self.clone()), next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testing::TestBed;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static ONESHOT_HITS: AtomicUsize = AtomicUsize::new(0);
    static PERIODIC_HITS: AtomicUsize = AtomicUsize::new(0);

    fn count_oneshot(_t: &Arc<Swt>, arg: usize) {
        ONESHOT_HITS.fetch_add(arg, Ordering::SeqCst);
    }

    fn count_periodic(_t: &Arc<Swt>, _arg: usize) {
        PERIODIC_HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_oneshot_fires_once() {
        let bed = TestBed::started(1);
        let skd = bed.skd(0);
        let swt = Swt::new(SwtFlags::empty());
        swt.start(skd, skd.now(), 3, count_oneshot, 7).unwrap();
        assert_eq!(swt.start(skd, 0, 3, count_oneshot, 7), Err(KernelError::Already));
        for _ in 0..10 {
            skd.tick_isr();
        }
        assert_eq!(ONESHOT_HITS.load(Ordering::SeqCst), 7);
        assert!(!swt.is_running());
        assert_eq!(swt.stop(), Err(KernelError::NotFound));
    }

    #[test]
    fn test_periodic_until_stopped() {
        let bed = TestBed::started(1);
        let skd = bed.skd(0);
        let swt = Swt::new(SwtFlags::RESTART);
        swt.start(skd, skd.now(), 2, count_periodic, 0).unwrap();
        for _ in 0..6 {
            skd.tick_isr();
        }
        assert_eq!(PERIODIC_HITS.load(Ordering::SeqCst), 3);
        swt.stop().unwrap();
        for _ in 0..6 {
            skd.tick_isr();
        }
        assert_eq!(PERIODIC_HITS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_zero_period_rejected() {
        let bed = TestBed::started(1);
        let swt = Swt::new(SwtFlags::empty());
        assert_eq!(
            swt.start(bed.skd(0), 0, 0, count_periodic, 0),
            Err(KernelError::InvalidArgument)
        );
    }
}
