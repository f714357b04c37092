//! Time tree
//!
//! Ordered set of pending deadlines of one CPU: sleeping or timed-waiting
//! threads and software timers. Keys are `(deadline, seq)` so equal deadlines
//! expire in insertion order.
//!
//! The tick interrupt pops expired nodes one at a time and runs their
//! handler with the tree unlocked. A popped node remembers its key in
//! `fired`; the handler only acts when the key still matches, so a node that
//! was re-armed or disarmed in between is left alone.
//!
//! Lock order: tree lock → node lock.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use log::trace;

use super::{Swt, Tick};
use crate::config::TICK_PERIOD;
use crate::error::{KernelError, KernelResult};
use crate::irq::IrqSpinLock;
use crate::scheduler::Thread;

/// Why a node left the time tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtnReason {
    Unknown,
    TimedOut,
    Intr,
}

pub(crate) type TtKey = (Tick, u64);

pub(crate) struct TtnState {
    /// Key while linked in the tree
    pub key: Option<TtKey>,
    /// Key of the last expiry whose handler has not run yet
    pub fired: Option<TtKey>,
    pub reason: TtnReason,
}

/// Time tree node embedded in threads and software timers
pub struct TtNode {
    pub(crate) inner: IrqSpinLock<TtnState>,
}

impl TtNode {
    pub(crate) const fn new() -> Self {
        Self {
            inner: IrqSpinLock::new(TtnState {
                key: None,
                fired: None,
                reason: TtnReason::Unknown,
            }),
        }
    }

    pub fn reason(&self) -> TtnReason {
        self.inner.lock().reason
    }

    pub(crate) fn set_reason(&self, reason: TtnReason) {
        self.inner.lock().reason = reason;
    }

    /// True while the node waits in a time tree
    pub fn is_armed(&self) -> bool {
        self.inner.lock().key.is_some()
    }

    /// Deadline of the armed node
    pub fn deadline(&self) -> Option<Tick> {
        self.inner.lock().key.map(|(t, _)| t)
    }

    /// Forget a pending expiry so its handler becomes a no-op
    pub(crate) fn disarm_fired(&self) {
        self.inner.lock().fired = None;
    }

    /// Run `f` with the node locked if the expiry `key` is still pending,
    /// consuming it
    pub(crate) fn run_if_fired<R>(&self, key: TtKey, f: impl FnOnce() -> R) -> Option<R> {
        let mut n = self.inner.lock();
        if n.fired != Some(key) {
            return None;
        }
        n.fired = None;
        Some(f())
    }

    /// Consume the pending expiry `key`. False when it went stale.
    pub(crate) fn take_fired(&self, key: TtKey) -> bool {
        let mut n = self.inner.lock();
        if n.fired == Some(key) {
            n.fired = None;
            true
        } else {
            false
        }
    }
}

/// Owner of a time tree node
#[derive(Clone)]
pub enum TtEntry {
    Thread(Arc<Thread>),
    Swt(Arc<Swt>),
}

impl TtEntry {
    fn node(&self) -> &TtNode {
        match self {
            TtEntry::Thread(t) => &t.ttn,
            TtEntry::Swt(s) => s.node(),
        }
    }

    fn expire(self, tt: &TimeTree, key: TtKey) {
        match self {
            TtEntry::Thread(t) => t.on_tt_expired(key),
            TtEntry::Swt(s) => s.on_expired(tt, key),
        }
    }
}

struct TtInner {
    tree: BTreeMap<TtKey, TtEntry>,
    seq: u64,
    timetick: Tick,
    running: bool,
}

pub struct TimeTree {
    inner: IrqSpinLock<TtInner>,
}

impl TimeTree {
    pub fn new() -> Self {
        Self {
            inner: IrqSpinLock::new(TtInner {
                tree: BTreeMap::new(),
                seq: 0,
                timetick: 0,
                running: false,
            }),
        }
    }

    /// Current tick count
    pub fn now(&self) -> Tick {
        self.inner.lock().timetick
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Tick> {
        self.inner.lock().tree.first_key_value().map(|((t, _), _)| *t)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.inner.lock().running = running;
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Arm `entry` to expire at `deadline`. `Already` if its node is armed.
    pub fn add(&self, entry: TtEntry, deadline: Tick) -> KernelResult<()> {
        let mut tt = self.inner.lock();
        let key = {
            let mut n = entry.node().inner.lock();
            if n.key.is_some() {
                return Err(KernelError::Already);
            }
            tt.seq = tt.seq.wrapping_add(1);
            let key = (deadline, tt.seq);
            n.key = Some(key);
            n.fired = None;
            n.reason = TtnReason::Unknown;
            key
        };
        tt.tree.insert(key, entry);
        Ok(())
    }

    /// Disarm `node`. `NotFound` if it already expired or was never armed.
    pub fn remove(&self, node: &TtNode) -> KernelResult<()> {
        let mut tt = self.inner.lock();
        let key = node.inner.lock().key.take().ok_or(KernelError::NotFound)?;
        if tt.tree.remove(&key).is_none() {
            crate::kernel_bug!("time tree: armed node missing from tree");
        }
        Ok(())
    }

    /// Advance the clock by one tick period and expire due nodes.
    /// Ignored while the hardware timer is stopped.
    pub(crate) fn tick(&self) {
        {
            let mut tt = self.inner.lock();
            if !tt.running {
                return;
            }
            tt.timetick = tt.timetick.wrapping_add(TICK_PERIOD);
        }
        while let Some((key, entry)) = self.pop_expired() {
            trace!("time tree: expired @{}#{}", key.0, key.1);
            entry.expire(self, key);
        }
    }

    fn pop_expired(&self) -> Option<(TtKey, TtEntry)> {
        let mut tt = self.inner.lock();
        let now = tt.timetick;
        let due = matches!(tt.tree.first_key_value(), Some(((deadline, _), _)) if *deadline <= now);
        if !due {
            return None;
        }
        let (key, entry) = tt.tree.pop_first()?;
        {
            let mut n = entry.node().inner.lock();
            n.key = None;
            n.fired = Some(key);
            n.reason = TtnReason::TimedOut;
        }
        Some((key, entry))
    }
}

impl Default for TimeTree {
    fn default() -> Self {
        Self::new()
    }
}
