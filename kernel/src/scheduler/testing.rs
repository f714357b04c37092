//! Test helpers: a port that records what the scheduler asks of it and
//! completes switches on the spot

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{Kernel, Scheduler, Thread, ThreadAttr};
use crate::config::{KernelConfig, CPU_NUM_MAX};
use crate::error::KernelResult;
use crate::port::{CpuId, Port};
use crate::scheduler::Priority;
use crate::wq::WqOwner;

pub(crate) struct RecordingPort {
    switches: AtomicUsize,
    isr: AtomicBool,
    cpu: AtomicUsize,
    auto_finish: AtomicBool,
    timers: [AtomicBool; CPU_NUM_MAX],
    suspended: AtomicUsize,
    resuming: AtomicUsize,
}

impl RecordingPort {
    pub fn new() -> Self {
        Self {
            switches: AtomicUsize::new(0),
            isr: AtomicBool::new(false),
            cpu: AtomicUsize::new(0),
            auto_finish: AtomicBool::new(true),
            timers: core::array::from_fn(|_| AtomicBool::new(false)),
            suspended: AtomicUsize::new(0),
            resuming: AtomicUsize::new(0),
        }
    }

    /// Leave switches in flight until the test calls `finish_context_switch`
    pub fn set_auto_finish(&self, on: bool) {
        self.auto_finish.store(on, Ordering::SeqCst);
    }

    pub fn set_isr(&self, on: bool) {
        self.isr.store(on, Ordering::SeqCst);
    }

    pub fn set_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu, Ordering::SeqCst);
    }

    pub fn switches(&self) -> usize {
        self.switches.load(Ordering::SeqCst)
    }

    pub fn timer_running(&self, cpu: CpuId) -> bool {
        self.timers[cpu].load(Ordering::SeqCst)
    }

    pub fn suspended_reports(&self) -> usize {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn resuming_reports(&self) -> usize {
        self.resuming.load(Ordering::SeqCst)
    }
}

impl Port for RecordingPort {
    fn cpu_id(&self) -> CpuId {
        self.cpu.load(Ordering::SeqCst)
    }

    fn in_isr(&self) -> bool {
        self.isr.load(Ordering::SeqCst)
    }

    fn init_thread_stack(&self, _thd: &Arc<Thread>) -> KernelResult<()> {
        Ok(())
    }

    fn request_switch(&self, skd: &Scheduler) {
        self.switches.fetch_add(1, Ordering::SeqCst);
        if !self.auto_finish.load(Ordering::SeqCst) {
            return;
        }
        let to_bh = skd.current_stack().is_bh();
        skd.finish_context_switch();
        if to_bh {
            skd.bh_main();
        }
    }

    fn hwtimer_start(&self, cpu: CpuId) {
        self.timers[cpu].store(true, Ordering::SeqCst);
    }

    fn hwtimer_stop(&self, cpu: CpuId) {
        self.timers[cpu].store(false, Ordering::SeqCst);
    }

    fn report_suspended(&self, _cpu: CpuId) {
        self.suspended.fetch_add(1, Ordering::SeqCst);
    }

    fn report_resuming(&self, _cpu: CpuId) {
        self.resuming.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct TestBed {
    pub port: Arc<RecordingPort>,
    pub kernel: Arc<Kernel>,
}

impl TestBed {
    pub fn with_config(cfg: KernelConfig) -> Self {
        let port = Arc::new(RecordingPort::new());
        let kernel = Kernel::new(port.clone(), cfg).unwrap();
        Self { port, kernel }
    }

    pub fn new(cpus: usize) -> Self {
        Self::with_config(KernelConfig::with_cpus(cpus))
    }

    /// Every scheduler already started
    pub fn started(cpus: usize) -> Self {
        let bed = Self::new(cpus);
        bed.kernel.start_all().unwrap();
        bed
    }

    pub fn skd(&self, cpu: CpuId) -> &Arc<Scheduler> {
        self.kernel.scheduler(cpu).unwrap()
    }

    /// Thread on CPU 0 whose entry is never run
    pub fn thread(&self, prio: Priority) -> Arc<Thread> {
        self.kernel
            .spawn(0, ThreadAttr::new("test").priority(prio), || 0)
            .unwrap()
    }
}

struct NoopOwner;

impl WqOwner for NoopOwner {
    fn intr(&self, _thd: &Arc<Thread>) -> KernelResult<()> {
        Ok(())
    }
}

/// Owner that is already gone
pub(crate) fn noop_owner() -> Weak<dyn WqOwner> {
    Weak::<NoopOwner>::new()
}

pub(crate) fn noop_wqn_cb(_thd: &Arc<Thread>) {}
