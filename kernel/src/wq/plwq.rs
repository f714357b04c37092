//! Pipeline (FIFO) wait queue

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};

use super::{QueueKind, WaitQueue, WqId, WqOwner, WqSlot, WqType, WqnCallback, WqnReason, Woken};
use crate::error::{KernelError, KernelResult};
use crate::scheduler::{Priority, Thread};

pub struct PlWaitQueue {
    id: WqId,
    seq: u64,
    fifo: BTreeMap<u64, Arc<Thread>>,
}

impl WaitQueue for PlWaitQueue {
    const KIND: QueueKind = QueueKind::Pl;

    fn new() -> Self {
        Self {
            id: WqId::alloc(),
            seq: 0,
            fifo: BTreeMap::new(),
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
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        thd.wqn.link_into(self.id, WqSlot::Pl { seq }, ty, prio, owner, cb);
        self.fifo.insert(seq, thd.clone());
    }

    fn remove(&mut self, thd: &Arc<Thread>, reason: WqnReason) -> KernelResult<Option<WqnCallback>> {
        let (slot, cb) = thd
            .wqn
            .unlink_from(self.id, reason)
            .ok_or(KernelError::NotFound)?;
        let WqSlot::Pl { seq } = slot else {
            crate::kernel_bug!("plwq: foreign slot kind");
        };
        if self.fifo.remove(&seq).is_none() {
            crate::kernel_bug!("plwq: node linked but not in fifo");
        }
        Ok(cb)
    }

    fn choose_with(&mut self, reason: WqnReason) -> Option<Woken> {
        let (_, thd) = self.fifo.pop_first()?;
        let Some((_, cb)) = thd.wqn.unlink_from(self.id, reason) else {
            crate::kernel_bug!("plwq: queued node not linked");
        };
        Some(Woken { thd, cb })
    }

    fn len(&self) -> usize {
        self.fifo.len()
    }

    fn contains(&self, thd: &Arc<Thread>) -> bool {
        self.fifo.values().any(|t| Arc::ptr_eq(t, thd))
    }
}
