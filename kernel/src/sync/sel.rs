//! Selector
//!
//! An [`Evt`] of type `Sel` collects readiness from other objects. Each
//! bindable object embeds a [`SelSlot`]; binding records the selector and a
//! bit position in it. Semaphores bind exclusively: their bit stays set
//! while they have a count and is cleared by the semaphore itself.
//! Conditions and events bind non-exclusively: their bit is a one-shot
//! notification consumed by the next select.
//!
//! Lock order: object lock → selector state lock → slot lock.

use alloc::sync::Arc;

use super::evt::{Evt, EvtType};
use super::wait::Deadline;
use crate::error::{KernelError, KernelResult};
use crate::irq::IrqSpinLock;
use crate::libutils::Bitmap;
use crate::scheduler::Scheduler;
use crate::time::Tick;

struct SelBinding {
    sel: Arc<Evt>,
    pos: usize,
}

/// Binding point of an object that can be watched by a selector
pub struct SelSlot {
    binding: IrqSpinLock<Option<SelBinding>>,
}

impl SelSlot {
    pub const fn new() -> Self {
        Self {
            binding: IrqSpinLock::new(None),
        }
    }

    fn selector(&self) -> Option<Arc<Evt>> {
        self.binding.lock().as_ref().map(|b| b.sel.clone())
    }

    pub fn is_bound(&self) -> bool {
        self.binding.lock().is_some()
    }

    /// Set our bit and wake the selector's waiters. No-op when unbound.
    pub fn signal(&self) {
        if let Some(sel) = self.selector() {
            let _ = sel.sel_obj_s1i(self);
        }
    }

    /// Set our bit without waking anybody. Returns the selector to
    /// broadcast once the caller's own lock is released.
    pub(crate) fn mark(&self) -> Option<Arc<Evt>> {
        let sel = self.selector()?;
        let mut st = sel.state.lock();
        let pos = self.position_in(&sel)?;
        st.bmp.s1i(pos);
        drop(st);
        Some(sel)
    }

    /// Clear our bit. No-op when unbound.
    pub(crate) fn clear(&self) {
        if let Some(sel) = self.selector() {
            let _ = sel.sel_obj_c0i(self);
        }
    }

    fn position_in(&self, sel: &Arc<Evt>) -> Option<usize> {
        match self.binding.lock().as_ref() {
            Some(b) if Arc::ptr_eq(&b.sel, sel) => Some(b.pos),
            _ => None,
        }
    }
}

impl Default for SelSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Evt {
    /// Attach `slot` at bit `pos`.
    ///
    /// `Already` if the slot is bound anywhere, `Busy` if `pos` is held
    /// exclusively by another object.
    pub fn sel_obj_bind(self: &Arc<Self>, slot: &SelSlot, pos: usize, exclusive: bool) -> KernelResult<()> {
        self.expect(EvtType::Sel)?;
        self.check_pos(pos)?;
        let mut st = self.state.lock();
        let mut b = slot.binding.lock();
        if b.is_some() {
            return Err(KernelError::Already);
        }
        if st.msk.t1i(pos) {
            return Err(KernelError::Busy);
        }
        if exclusive {
            st.msk.s1i(pos);
        }
        *b = Some(SelBinding { sel: self.clone(), pos });
        Ok(())
    }

    /// Detach `slot`. `NotConnected` unless it is bound here.
    pub fn sel_obj_unbind(self: &Arc<Self>, slot: &SelSlot, exclusive: bool) -> KernelResult<()> {
        self.expect(EvtType::Sel)?;
        let mut st = self.state.lock();
        let mut b = slot.binding.lock();
        let pos = match b.as_ref() {
            Some(sb) if Arc::ptr_eq(&sb.sel, self) => sb.pos,
            _ => return Err(KernelError::NotConnected),
        };
        if exclusive {
            st.msk.c0i(pos);
        }
        *b = None;
        Ok(())
    }

    /// Set the bit of `slot` and wake the selecting threads
    pub fn sel_obj_s1i(self: &Arc<Self>, slot: &SelSlot) -> KernelResult<()> {
        {
            let mut st = self.state.lock();
            let pos = slot.position_in(self).ok_or(KernelError::NotConnected)?;
            st.bmp.s1i(pos);
        }
        let _ = self.cond.broadcast();
        Ok(())
    }

    pub fn sel_obj_c0i(self: &Arc<Self>, slot: &SelSlot) -> KernelResult<()> {
        let mut st = self.state.lock();
        let pos = slot.position_in(self).ok_or(KernelError::NotConnected)?;
        st.bmp.c0i(pos);
        Ok(())
    }

    /// Test once. On success returns the ready bits of `msk` and clears
    /// every non-exclusive bit. `NoData` if none of `msk` is ready.
    pub fn tryselect(&self, msk: &Bitmap) -> KernelResult<Bitmap> {
        self.expect(EvtType::Sel)?;
        let msk = self.clip(msk);
        let mut st = self.state.lock();
        if !st.bmp.t1mo(&msk) {
            return Err(KernelError::NoData);
        }
        let trg = st.bmp.masked(&msk);
        let excl = st.msk;
        st.bmp.and(&excl);
        Ok(trg)
    }

    fn select_until(&self, skd: &Scheduler, msk: &Bitmap, deadline: Option<Deadline>) -> KernelResult<Bitmap> {
        self.expect(EvtType::Sel)?;
        skd.current_thread_checked()?;
        let msk = self.clip(msk);
        let mut st = self.state.lock();
        loop {
            let excl = st.msk;
            if st.bmp.t1mo(&msk) {
                let trg = st.bmp.masked(&msk);
                st.bmp.and(&excl);
                return Ok(trg);
            }
            st.bmp.and(&excl);
            let (guard, rc) = self.wait_state(skd, st, deadline);
            st = guard;
            rc?;
        }
    }

    /// Block until at least one bit of `msk` is ready
    pub fn select(&self, skd: &Scheduler, msk: &Bitmap) -> KernelResult<Bitmap> {
        self.select_until(skd, msk, None)
    }

    /// [`Evt::select`] for at most `*to` ticks; the time left is written back
    pub fn timed_select(&self, skd: &Scheduler, msk: &Bitmap, to: &mut Tick) -> KernelResult<Bitmap> {
        if *to == 0 {
            return match self.tryselect(msk) {
                Err(KernelError::NoData) => Err(KernelError::TimedOut),
                rc => rc,
            };
        }
        let dl = Deadline::after(skd, *to);
        let rc = self.select_until(skd, msk, Some(dl));
        dl.store_remaining(skd, to);
        rc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testing::TestBed;

    #[test]
    fn test_bind_rules() {
        let sel = Evt::new(EvtType::Sel, 4).unwrap();
        let a = SelSlot::new();
        let b = SelSlot::new();
        assert_eq!(sel.sel_obj_bind(&a, 4, false), Err(KernelError::OutOfRange));
        sel.sel_obj_bind(&a, 1, true).unwrap();
        assert!(a.is_bound());
        assert_eq!(sel.sel_obj_bind(&a, 2, false), Err(KernelError::Already));
        assert_eq!(sel.sel_obj_bind(&b, 1, false), Err(KernelError::Busy));
        sel.sel_obj_unbind(&a, true).unwrap();
        assert_eq!(sel.sel_obj_unbind(&a, true), Err(KernelError::NotConnected));
        sel.sel_obj_bind(&b, 1, false).unwrap();
    }

    #[test]
    fn test_only_selectors_bind() {
        let flg = Evt::new(EvtType::Flg, 4).unwrap();
        let slot = SelSlot::new();
        assert_eq!(flg.sel_obj_bind(&slot, 0, false), Err(KernelError::TypeMismatch));
    }

    #[test]
    fn test_unbound_slot_is_silent() {
        let slot = SelSlot::new();
        slot.signal();
        slot.clear();
        assert!(slot.mark().is_none());
    }

    #[test]
    fn test_exclusive_bit_survives_select() {
        let sel = Evt::new(EvtType::Sel, 8).unwrap();
        let excl = SelSlot::new();
        let once = SelSlot::new();
        sel.sel_obj_bind(&excl, 0, true).unwrap();
        sel.sel_obj_bind(&once, 5, false).unwrap();
        excl.signal();
        once.signal();
        let all = Bitmap::from_bits(&[0, 5]);
        assert_eq!(sel.tryselect(&all).unwrap(), all);
        assert_eq!(sel.tryselect(&all).unwrap(), Bitmap::from_bits(&[0]));
        excl.clear();
        assert_eq!(sel.tryselect(&all), Err(KernelError::NoData));
    }

    #[test]
    fn test_mark_defers_wakeup() {
        let sel = Evt::new(EvtType::Sel, 8).unwrap();
        let slot = SelSlot::new();
        sel.sel_obj_bind(&slot, 3, false).unwrap();
        let s = slot.mark().unwrap();
        assert!(Arc::ptr_eq(&s, &sel));
        assert!(sel.tryselect(&Bitmap::from_bits(&[3])).unwrap().t1i(3));
    }

    #[test]
    fn test_select_outside_thread() {
        let bed = TestBed::started(1);
        let sel = Evt::new(EvtType::Sel, 8).unwrap();
        assert_eq!(
            sel.select(bed.skd(0), &Bitmap::from_bits(&[0])),
            Err(KernelError::NotInThread)
        );
        let mut to = 0;
        assert_eq!(
            sel.timed_select(bed.skd(0), &Bitmap::from_bits(&[0]), &mut to),
            Err(KernelError::TimedOut)
        );
    }
}
