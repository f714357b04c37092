//! Thread barrier
//!
//! Each participant owns bit `pos` of an [`Evt`] of type `Br`. Arriving
//! sets the bit. The thread whose arrival completes `msk` clears the whole
//! mask, wakes the others and gives up the CPU; everybody else waits once.

use super::evt::{Evt, EvtType};
use super::wait::Deadline;
use crate::error::{KernelError, KernelResult};
use crate::libutils::Bitmap;
use crate::scheduler::Scheduler;
use crate::time::Tick;

impl Evt {
    fn sync_until(&self, skd: &Scheduler, pos: usize, msk: &Bitmap, deadline: Option<Deadline>) -> KernelResult<()> {
        self.expect(EvtType::Br)?;
        skd.current_thread_checked()?;
        self.check_pos(pos)?;
        let msk = self.clip(msk);
        let mut st = self.state.lock();
        st.bmp.s1i(pos);
        if st.bmp.t1ma(&msk) {
            // The round is over for every waiter before any of them runs
            st.bmp.c0m(&msk);
            drop(st);
            let _ = self.cond.broadcast();
            return skd.yield_current();
        }
        let (mut st, rc) = self.wait_state(skd, st, deadline);
        st.bmp.c0i(pos);
        rc
    }

    /// Arrive at bit `pos` and wait for every thread of `msk`
    pub fn sync(&self, skd: &Scheduler, pos: usize, msk: &Bitmap) -> KernelResult<()> {
        self.sync_until(skd, pos, msk, None)
    }

    /// [`Evt::sync`] for at most `*to` ticks; the time left is written back
    pub fn timed_sync(&self, skd: &Scheduler, pos: usize, msk: &Bitmap, to: &mut Tick) -> KernelResult<()> {
        if *to == 0 {
            return Err(KernelError::TimedOut);
        }
        let dl = Deadline::after(skd, *to);
        let rc = self.sync_until(skd, pos, msk, Some(dl));
        dl.store_remaining(skd, to);
        rc
    }

    /// Threads currently parked at the barrier
    pub fn arrived(&self) -> KernelResult<Bitmap> {
        self.expect(EvtType::Br)?;
        Ok(self.state.lock().bmp)
    }
}
