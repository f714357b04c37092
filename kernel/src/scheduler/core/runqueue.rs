//! Real-time run queue
//!
//! One FIFO band per priority level plus a bitmap of the non-empty bands, so
//! the highest ready priority is a single `leading_zeros`.

use alloc::collections::VecDeque;

use crate::config::PRIORITY_NUM;
use crate::scheduler::thread::state::{priority_is_valid, Priority, PRIORITY_INVALID};

pub struct RtRunQueue<T> {
    bands: [VecDeque<T>; PRIORITY_NUM],
    bmp: u64,
    len: usize,
}

impl<T> RtRunQueue<T> {
    pub fn new() -> Self {
        Self {
            bands: core::array::from_fn(|_| VecDeque::new()),
            bmp: 0,
            len: 0,
        }
    }

    /// Highest priority with a ready entry, [`PRIORITY_INVALID`] if empty
    pub fn top(&self) -> Priority {
        if self.bmp == 0 {
            PRIORITY_INVALID
        } else {
            63 - self.bmp.leading_zeros() as Priority
        }
    }

    fn band(&mut self, prio: Priority) -> &mut VecDeque<T> {
        crate::kernel_bug_on!(!priority_is_valid(prio), "run queue: bad priority {}", prio);
        &mut self.bands[prio as usize]
    }

    /// Queue at the head of its band (a preempted thread keeps its turn)
    pub fn add_head(&mut self, prio: Priority, item: T) {
        self.band(prio).push_front(item);
        self.bmp |= 1u64 << prio;
        self.len += 1;
    }

    /// Queue at the tail of its band
    pub fn add_tail(&mut self, prio: Priority, item: T) {
        self.band(prio).push_back(item);
        self.bmp |= 1u64 << prio;
        self.len += 1;
    }

    /// Remove the first entry of band `prio` matching `pred`
    pub fn remove_by(&mut self, prio: Priority, pred: impl Fn(&T) -> bool) -> Option<T> {
        let band = self.band(prio);
        let idx = band.iter().position(pred)?;
        let item = band.remove(idx);
        if band.is_empty() {
            self.bmp &= !(1u64 << prio);
        }
        self.len -= 1;
        item
    }

    /// Pop the head of the highest non-empty band
    pub fn pop_top(&mut self) -> Option<(Priority, T)> {
        let prio = self.top();
        if prio == PRIORITY_INVALID {
            return None;
        }
        let band = self.band(prio);
        let item = band.pop_front()?;
        if band.is_empty() {
            self.bmp &= !(1u64 << prio);
        }
        self.len -= 1;
        Some((prio, item))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for RtRunQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
