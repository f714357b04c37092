//! Event object
//!
//! One bitmap, one mask, one condition variable and one lock, used in one
//! of three modes chosen at creation:
//!
//! - `Flg`: event flags. Bits are set, cleared and toggled by anybody;
//!   waiters block until a level or edge trigger holds on their mask.
//! - `Sel`: selector. Other objects bind one bit each and set it when they
//!   become ready (see [`super::sel`]).
//! - `Br`: barrier. Threads each own one bit and block until every bit of
//!   their mask is set (see [`super::br`]).
//!
//! Every mutation broadcasts the condition: waiters re-evaluate their own
//! trigger, there is no targeted wake-up.

use alloc::sync::Arc;

use super::cond::Cond;
use super::wait::{Deadline, WaitMode};
use crate::config::EVT_MAX_BITS;
use crate::error::{KernelError, KernelResult};
use crate::irq::{IrqSpinLock, IrqSpinLockGuard};
use crate::libutils::Bitmap;
use crate::scheduler::Scheduler;
use crate::time::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvtType {
    /// Event flags
    Flg,
    /// Selector
    Sel,
    /// Barrier
    Br,
}

/// Condition a flag waiter blocks on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlgTrigger {
    /// Every masked bit set
    SetAll,
    /// At least one masked bit set
    SetAny,
    /// Every masked bit clear
    ClrAll,
    /// At least one masked bit clear
    ClrAny,
    /// Every masked bit changed since `origin`
    TglAll,
    /// At least one masked bit changed since `origin`
    TglAny,
}

impl FlgTrigger {
    /// Evaluated against the current bitmap rather than a snapshot
    pub fn is_level(self) -> bool {
        !matches!(self, FlgTrigger::TglAll | FlgTrigger::TglAny)
    }
}

/// What a level-triggered wait does to the bits that triggered it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlgAction {
    None,
    /// Clear the masked bits (`Set*`) or set them (`Clr*`)
    Consumption,
}

pub(crate) struct EvtState {
    pub bmp: Bitmap,
    pub msk: Bitmap,
}

pub struct Evt {
    ty: EvtType,
    num: usize,
    /// Bits `0..num`
    valid: Bitmap,
    pub(crate) state: IrqSpinLock<EvtState>,
    pub(crate) cond: Arc<Cond>,
}

impl Evt {
    /// New event object with `num` bits. `InvalidArgument` unless
    /// `0 < num <= EVT_MAX_BITS`.
    pub fn new(ty: EvtType, num: usize) -> KernelResult<Arc<Self>> {
        if num == 0 || num > EVT_MAX_BITS {
            return Err(KernelError::InvalidArgument);
        }
        let valid = Bitmap::first(num);
        let msk = match ty {
            EvtType::Flg => valid,
            EvtType::Sel | EvtType::Br => Bitmap::new(),
        };
        Ok(Arc::new(Self {
            ty,
            num,
            valid,
            state: IrqSpinLock::new(EvtState {
                bmp: Bitmap::new(),
                msk,
            }),
            cond: Cond::new(),
        }))
    }

    pub fn ty(&self) -> EvtType {
        self.ty
    }

    /// Number of bits
    pub fn num(&self) -> usize {
        self.num
    }

    pub(crate) fn expect(&self, ty: EvtType) -> KernelResult<()> {
        if self.ty == ty {
            Ok(())
        } else {
            Err(KernelError::TypeMismatch)
        }
    }

    pub(crate) fn check_pos(&self, pos: usize) -> KernelResult<()> {
        if pos < self.num {
            Ok(())
        } else {
            Err(KernelError::OutOfRange)
        }
    }

    /// `msk` restricted to the bits of this object
    pub(crate) fn clip(&self, msk: &Bitmap) -> Bitmap {
        msk.masked(&self.valid)
    }

    /// Bind this object to selector `sel` at bit `pos` (non-exclusive)
    pub fn bind(&self, sel: &Arc<Evt>, pos: usize) -> KernelResult<()> {
        self.cond.bind(sel, pos)
    }

    pub fn unbind(&self, sel: &Arc<Evt>) -> KernelResult<()> {
        self.cond.unbind(sel)
    }

    /// Interrupt every waiter
    pub fn intr_all(&self) -> KernelResult<()> {
        self.cond.intr_all()
    }

    /// Block on the condition with the state lock released
    pub(crate) fn wait_state<'a>(
        &'a self,
        skd: &Scheduler,
        guard: IrqSpinLockGuard<'a, EvtState>,
        deadline: Option<Deadline>,
    ) -> (IrqSpinLockGuard<'a, EvtState>, KernelResult<()>) {
        self.cond
            .wait_locked(skd, &self.state, guard, WaitMode::Interruptible, deadline)
    }

    fn flg_update(&self, f: impl FnOnce(&mut Bitmap)) -> KernelResult<()> {
        self.expect(EvtType::Flg)?;
        f(&mut self.state.lock().bmp);
        let _ = self.cond.broadcast();
        Ok(())
    }

    /// Set every bit of `msk`
    pub fn s1m(&self, msk: &Bitmap) -> KernelResult<()> {
        let msk = self.clip(msk);
        self.flg_update(|bmp| bmp.s1m(&msk))
    }

    pub fn s1i(&self, pos: usize) -> KernelResult<()> {
        self.expect(EvtType::Flg)?;
        self.check_pos(pos)?;
        self.flg_update(|bmp| bmp.s1i(pos))
    }

    /// Clear every bit of `msk`
    pub fn c0m(&self, msk: &Bitmap) -> KernelResult<()> {
        let msk = self.clip(msk);
        self.flg_update(|bmp| bmp.c0m(&msk))
    }

    pub fn c0i(&self, pos: usize) -> KernelResult<()> {
        self.expect(EvtType::Flg)?;
        self.check_pos(pos)?;
        self.flg_update(|bmp| bmp.c0i(pos))
    }

    /// Toggle every bit of `msk`
    pub fn x1m(&self, msk: &Bitmap) -> KernelResult<()> {
        let msk = self.clip(msk);
        self.flg_update(|bmp| bmp.x1m(&msk))
    }

    pub fn x1i(&self, pos: usize) -> KernelResult<()> {
        self.expect(EvtType::Flg)?;
        self.check_pos(pos)?;
        self.flg_update(|bmp| bmp.x1i(pos))
    }

    /// Snapshot of the flags
    pub fn read(&self) -> KernelResult<Bitmap> {
        self.expect(EvtType::Flg)?;
        Ok(self.state.lock().bmp)
    }

    /// Test a level trigger and apply `action` in the same critical section
    fn level_triggered(bmp: &mut Bitmap, trigger: FlgTrigger, action: FlgAction, msk: &Bitmap) -> bool {
        let hit = match trigger {
            FlgTrigger::SetAll => bmp.t1ma(msk),
            FlgTrigger::SetAny => bmp.t1mo(msk),
            FlgTrigger::ClrAll => bmp.t0ma(msk),
            FlgTrigger::ClrAny => bmp.t0mo(msk),
            FlgTrigger::TglAll | FlgTrigger::TglAny => {
                crate::kernel_bug!("edge trigger {:?} tested as level", trigger)
            }
        };
        if hit && action == FlgAction::Consumption {
            match trigger {
                FlgTrigger::SetAll | FlgTrigger::SetAny => bmp.c0m(msk),
                _ => bmp.s1m(msk),
            }
        }
        hit
    }

    /// Test an edge trigger against `origin` (already masked)
    fn edge_triggered(bmp: &Bitmap, trigger: FlgTrigger, origin: &Bitmap, msk: &Bitmap) -> Option<Bitmap> {
        let cur = bmp.masked(msk);
        let hit = match trigger {
            FlgTrigger::TglAll => cur.xor(origin) == *msk,
            FlgTrigger::TglAny => cur != *origin,
            _ => crate::kernel_bug!("level trigger {:?} tested as edge", trigger),
        };
        hit.then_some(cur)
    }

    /// Check the trigger once without blocking. `NoData` if it does not hold.
    ///
    /// Level triggers report the flags seen (before `action`) in `origin`.
    /// Edge triggers compare against `origin` and store the new masked
    /// flags there on success, ready for the next call.
    pub fn trywait(
        &self,
        trigger: FlgTrigger,
        action: FlgAction,
        origin: &mut Bitmap,
        msk: &Bitmap,
    ) -> KernelResult<()> {
        self.expect(EvtType::Flg)?;
        let msk = self.clip(msk);
        let mut st = self.state.lock();
        if trigger.is_level() {
            *origin = st.bmp;
            if Self::level_triggered(&mut st.bmp, trigger, action, &msk) {
                return Ok(());
            }
        } else {
            origin.and(&msk);
            if let Some(cur) = Self::edge_triggered(&st.bmp, trigger, origin, &msk) {
                *origin = cur;
                return Ok(());
            }
        }
        Err(KernelError::NoData)
    }

    fn flg_wait_until(
        &self,
        skd: &Scheduler,
        trigger: FlgTrigger,
        action: FlgAction,
        origin: &mut Bitmap,
        msk: &Bitmap,
        deadline: Option<Deadline>,
    ) -> KernelResult<()> {
        self.expect(EvtType::Flg)?;
        skd.current_thread_checked()?;
        let msk = self.clip(msk);
        if !trigger.is_level() {
            origin.and(&msk);
        }
        let mut st = self.state.lock();
        loop {
            if trigger.is_level() {
                *origin = st.bmp;
                if Self::level_triggered(&mut st.bmp, trigger, action, &msk) {
                    return Ok(());
                }
            } else if let Some(cur) = Self::edge_triggered(&st.bmp, trigger, origin, &msk) {
                *origin = cur;
                return Ok(());
            }
            let (guard, rc) = self.wait_state(skd, st, deadline);
            st = guard;
            rc?;
        }
    }

    /// Block until the trigger holds. See [`Evt::trywait`] for `origin`.
    pub fn wait(
        &self,
        skd: &Scheduler,
        trigger: FlgTrigger,
        action: FlgAction,
        origin: &mut Bitmap,
        msk: &Bitmap,
    ) -> KernelResult<()> {
        self.flg_wait_until(skd, trigger, action, origin, msk, None)
    }

    /// Block at most `*to` ticks; the time left is written back
    pub fn timed_wait(
        &self,
        skd: &Scheduler,
        trigger: FlgTrigger,
        action: FlgAction,
        origin: &mut Bitmap,
        msk: &Bitmap,
        to: &mut Tick,
    ) -> KernelResult<()> {
        if *to == 0 {
            return match self.trywait(trigger, action, origin, msk) {
                Err(KernelError::NoData) => Err(KernelError::TimedOut),
                rc => rc,
            };
        }
        let dl = Deadline::after(skd, *to);
        let rc = self.flg_wait_until(skd, trigger, action, origin, msk, Some(dl));
        dl.store_remaining(skd, to);
        rc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testing::TestBed;

    fn bits(b: &[usize]) -> Bitmap {
        Bitmap::from_bits(b)
    }

    #[test]
    fn test_new_bounds() {
        assert!(matches!(Evt::new(EvtType::Flg, 0), Err(KernelError::InvalidArgument)));
        assert!(matches!(
            Evt::new(EvtType::Flg, EVT_MAX_BITS + 1),
            Err(KernelError::InvalidArgument)
        ));
        let e = Evt::new(EvtType::Br, EVT_MAX_BITS).unwrap();
        assert_eq!(e.num(), EVT_MAX_BITS);
        assert_eq!(e.ty(), EvtType::Br);
    }

    #[test]
    fn test_flag_ops_stay_in_range() {
        let e = Evt::new(EvtType::Flg, 8).unwrap();
        e.s1m(&bits(&[1, 3, 9, 100])).unwrap();
        assert_eq!(e.read().unwrap(), bits(&[1, 3]));
        e.x1i(1).unwrap();
        e.x1m(&bits(&[0, 3])).unwrap();
        assert_eq!(e.read().unwrap(), bits(&[0]));
        assert_eq!(e.s1i(8), Err(KernelError::OutOfRange));
        assert_eq!(e.c0i(8), Err(KernelError::OutOfRange));
        e.c0m(&bits(&[0])).unwrap();
        assert!(e.read().unwrap().is_empty());
    }

    #[test]
    fn test_type_checked() {
        let sel = Evt::new(EvtType::Sel, 8).unwrap();
        assert_eq!(sel.s1i(0), Err(KernelError::TypeMismatch));
        assert_eq!(sel.read(), Err(KernelError::TypeMismatch));
        let mut o = Bitmap::new();
        assert_eq!(
            sel.trywait(FlgTrigger::SetAny, FlgAction::None, &mut o, &bits(&[0])),
            Err(KernelError::TypeMismatch)
        );
    }

    #[test]
    fn test_set_all_with_consumption() {
        let e = Evt::new(EvtType::Flg, 8).unwrap();
        e.s1m(&bits(&[0, 1, 2, 5])).unwrap();
        let mut origin = Bitmap::new();
        e.trywait(FlgTrigger::SetAll, FlgAction::Consumption, &mut origin, &bits(&[0, 1, 2]))
            .unwrap();
        assert_eq!(origin, bits(&[0, 1, 2, 5]));
        assert_eq!(e.read().unwrap(), bits(&[5]));
        assert_eq!(
            e.trywait(FlgTrigger::SetAll, FlgAction::None, &mut origin, &bits(&[0, 1, 2])),
            Err(KernelError::NoData)
        );
    }

    #[test]
    fn test_clear_triggers() {
        let e = Evt::new(EvtType::Flg, 8).unwrap();
        e.s1m(&bits(&[0, 1])).unwrap();
        let mut o = Bitmap::new();
        assert_eq!(
            e.trywait(FlgTrigger::ClrAll, FlgAction::None, &mut o, &bits(&[1, 2])),
            Err(KernelError::NoData)
        );
        e.trywait(FlgTrigger::ClrAny, FlgAction::Consumption, &mut o, &bits(&[1, 2]))
            .unwrap();
        // consumption of a clear trigger sets the masked bits
        assert_eq!(e.read().unwrap(), bits(&[0, 1, 2]));
    }

    #[test]
    fn test_edge_triggers_chain() {
        let e = Evt::new(EvtType::Flg, 8).unwrap();
        let msk = bits(&[0, 1]);
        let mut origin = Bitmap::new();
        assert_eq!(
            e.trywait(FlgTrigger::TglAny, FlgAction::None, &mut origin, &msk),
            Err(KernelError::NoData)
        );
        e.s1i(0).unwrap();
        e.trywait(FlgTrigger::TglAny, FlgAction::None, &mut origin, &msk).unwrap();
        assert_eq!(origin, bits(&[0]));
        // only bit 0 toggled so far
        e.x1i(0).unwrap();
        assert_eq!(
            e.trywait(FlgTrigger::TglAll, FlgAction::None, &mut origin, &msk),
            Err(KernelError::NoData)
        );
        e.x1i(1).unwrap();
        // both masked bits now differ from {0}: 0 cleared, 1 set
        e.trywait(FlgTrigger::TglAll, FlgAction::None, &mut origin, &msk).unwrap();
        assert_eq!(origin, bits(&[1]));
    }

    #[test]
    fn test_zero_timeout_is_trywait() {
        let bed = TestBed::started(1);
        let skd = bed.skd(0);
        let e = Evt::new(EvtType::Flg, 4).unwrap();
        let mut o = Bitmap::new();
        let mut to = 0;
        assert_eq!(
            e.timed_wait(skd, FlgTrigger::SetAny, FlgAction::None, &mut o, &bits(&[0]), &mut to),
            Err(KernelError::TimedOut)
        );
        e.s1i(0).unwrap();
        assert_eq!(
            e.timed_wait(skd, FlgTrigger::SetAny, FlgAction::None, &mut o, &bits(&[0]), &mut to),
            Ok(())
        );
    }

    #[test]
    fn test_blocking_wait_needs_thread() {
        let bed = TestBed::started(1);
        let e = Evt::new(EvtType::Flg, 4).unwrap();
        let mut o = Bitmap::new();
        assert_eq!(
            e.wait(bed.skd(0), FlgTrigger::SetAny, FlgAction::None, &mut o, &bits(&[0])),
            Err(KernelError::NotInThread)
        );
    }
}
