//! Real-time wait queue
//!
//! Highest priority first, FIFO among equal priorities. Keys are
//! `(Reverse(prio), seq)` so the first entry of the tree is the next waiter.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::cmp::Reverse;

use super::{QueueKind, WaitQueue, WqId, WqOwner, WqSlot, WqType, WqnCallback, WqnReason, Woken};
use crate::error::{KernelError, KernelResult};
use crate::scheduler::{Priority, Thread, PRIORITY_INVALID};

pub struct RtWaitQueue {
    id: WqId,
    seq: u64,
    tree: BTreeMap<(Reverse<Priority>, u64), Arc<Thread>>,
}

impl RtWaitQueue {
    fn next_seq(&mut self) -> u64 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Priority of the head waiter, [`PRIORITY_INVALID`] if empty
    pub fn top_prio(&self) -> Priority {
        self.tree
            .first_key_value()
            .map(|((Reverse(p), _), _)| *p)
            .unwrap_or(PRIORITY_INVALID)
    }

    /// Move `thd` to priority `prio`, behind the waiters already there
    pub fn reorder(&mut self, thd: &Arc<Thread>, prio: Priority) -> KernelResult<()> {
        let old = match thd.wqn.slot_in(self.id) {
            Some(WqSlot::Rt { prio, seq }) => (Reverse(prio), seq),
            _ => return Err(KernelError::NotFound),
        };
        let Some(t) = self.tree.remove(&old) else {
            crate::kernel_bug!("rtwq: node linked but not in tree");
        };
        let seq = self.next_seq();
        self.tree.insert((Reverse(prio), seq), t);
        thd.wqn.relink_slot(self.id, WqSlot::Rt { prio, seq }, prio);
        Ok(())
    }

    /// Waiters in wake-up order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Thread>> {
        self.tree.values()
    }
}

impl WaitQueue for RtWaitQueue {
    const KIND: QueueKind = QueueKind::Rt;

    fn new() -> Self {
        Self {
            id: WqId::alloc(),
            seq: 0,
            tree: BTreeMap::new(),
        }
    }

    fn id(&self) -> WqId {
        self.id
    }

    fn add(
        &mut self,
        thd: &Arc<Thread>,
        prio: Priority,
        ty: WqType,
        owner: Weak<dyn WqOwner>,
        cb: WqnCallback,
    ) {
        let seq = self.next_seq();
        thd.wqn
            .link_into(self.id, WqSlot::Rt { prio, seq }, ty, prio, owner, cb);
        self.tree.insert((Reverse(prio), seq), thd.clone());
    }

    fn remove(&mut self, thd: &Arc<Thread>, reason: WqnReason) -> KernelResult<Option<WqnCallback>> {
        let (slot, cb) = thd
            .wqn
            .unlink_from(self.id, reason)
            .ok_or(KernelError::NotFound)?;
        let WqSlot::Rt { prio, seq } = slot else {
            crate::kernel_bug!("rtwq: foreign slot kind");
        };
        if self.tree.remove(&(Reverse(prio), seq)).is_none() {
            crate::kernel_bug!("rtwq: node linked but not in tree");
        }
        Ok(cb)
    }

    fn choose_with(&mut self, reason: WqnReason) -> Option<Woken> {
        let (_, thd) = self.tree.pop_first()?;
        let Some((_, cb)) = thd.wqn.unlink_from(self.id, reason) else {
            crate::kernel_bug!("rtwq: queued node not linked");
        };
        Some(Woken { thd, cb })
    }

    fn len(&self) -> usize {
        self.tree.len()
    }

    fn contains(&self, thd: &Arc<Thread>) -> bool {
        self.tree.values().any(|t| Arc::ptr_eq(t, thd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testing::{noop_owner, noop_wqn_cb, TestBed};
    use proptest::prelude::*;

    #[test]
    fn test_priority_then_fifo() {
        let bed = TestBed::new(1);
        let a = bed.thread(5);
        let b = bed.thread(9);
        let c = bed.thread(5);
        let mut q = RtWaitQueue::new();
        for t in [&a, &b, &c] {
            q.add(t, t.priority(), WqType::RtSem, noop_owner(), noop_wqn_cb);
        }
        assert_eq!(q.top_prio(), 9);
        let order: std::vec::Vec<_> = core::iter::from_fn(|| q.choose().map(|w| w.thd.id())).collect();
        assert_eq!(order, std::vec![b.id(), a.id(), c.id()]);
        assert_eq!(a.wqn.reason(), WqnReason::Up);
        assert!(q.is_empty());
        assert_eq!(q.top_prio(), PRIORITY_INVALID);
    }

    #[test]
    fn test_remove_twice_fails() {
        let bed = TestBed::new(1);
        let a = bed.thread(3);
        let mut q = RtWaitQueue::new();
        q.add(&a, 3, WqType::Cond, noop_owner(), noop_wqn_cb);
        assert!(a.wqn.is_queued());
        assert!(q.remove(&a, WqnReason::Intr).is_ok());
        assert!(!a.wqn.is_queued());
        assert_eq!(a.wqn.reason(), WqnReason::Intr);
        assert!(matches!(q.remove(&a, WqnReason::Intr), Err(KernelError::NotFound)));
    }

    #[test]
    fn test_remove_from_other_queue_fails() {
        let bed = TestBed::new(1);
        let a = bed.thread(3);
        let mut q1 = RtWaitQueue::new();
        let mut q2 = RtWaitQueue::new();
        q1.add(&a, 3, WqType::Cond, noop_owner(), noop_wqn_cb);
        assert!(matches!(q2.remove(&a, WqnReason::Intr), Err(KernelError::NotFound)));
        assert!(q1.contains(&a));
    }

    #[test]
    fn test_reorder_goes_behind_equals() {
        let bed = TestBed::new(1);
        let a = bed.thread(2);
        let b = bed.thread(7);
        let mut q = RtWaitQueue::new();
        q.add(&a, 2, WqType::Mtx, noop_owner(), noop_wqn_cb);
        q.add(&b, 7, WqType::Mtx, noop_owner(), noop_wqn_cb);
        q.reorder(&a, 7).unwrap();
        let first = q.choose().unwrap();
        assert_eq!(first.thd.id(), b.id());
        let second = q.choose().unwrap();
        assert_eq!(second.thd.id(), a.id());
    }

    proptest! {
        #[test]
        fn prop_choose_is_sorted(prios in proptest::collection::vec(0i32..64, 1..12)) {
            let bed = TestBed::new(1);
            let mut q = RtWaitQueue::new();
            let thds: std::vec::Vec<_> = prios.iter().map(|p| bed.thread(*p)).collect();
            for (t, p) in thds.iter().zip(prios.iter()) {
                q.add(t, *p, WqType::RtSem, noop_owner(), noop_wqn_cb);
            }
            let mut last: Option<(Priority, u64)> = None;
            while let Some(w) = q.choose() {
                let p = w.thd.priority();
                let idx = thds.iter().position(|t| Arc::ptr_eq(t, &w.thd)).unwrap() as u64;
                if let Some((lp, li)) = last {
                    prop_assert!(lp > p || (lp == p && li < idx));
                }
                prop_assert!(!w.thd.wqn.is_queued());
                last = Some((p, idx));
            }
        }
    }
}
