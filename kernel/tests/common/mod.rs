//! Host simulation of the architecture port
//!
//! Every kernel thread is backed by a host thread that only makes progress
//! while it is the current stack of its scheduler: a switch away takes
//! effect at the next preemption point, where the host thread parks until
//! the scheduler picks it again. Whatever runs on a host thread that is not
//! a kernel thread (the test body) counts as interrupt context; the tests
//! use it as the tick interrupt and as the poster of events.

#![allow(dead_code)]

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use rtk_kernel::scheduler::thread_trampoline;
use rtk_kernel::{
    CpuId, Kernel, KernelConfig, KernelError, KernelResult, Port, Scheduler, Thread, ThreadAttr,
    ThreadState,
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = RefCell::new(None);
}

fn current() -> Option<Arc<Thread>> {
    CURRENT.with(|c| c.borrow().clone())
}

pub struct SimPort {
    me: Weak<SimPort>,
    baton: Mutex<()>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl SimPort {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            baton: Mutex::new(()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    fn wake_all(&self) {
        let _g = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        self.cv.notify_all();
    }

    fn park_until_current(&self, skd: &Scheduler, me: &Arc<Thread>) {
        let mut g = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                // The test is over; this thread is never scheduled again
                drop(g);
                loop {
                    std::thread::park();
                }
            }
            if skd.is_current(me) {
                return;
            }
            g = self
                .cv
                .wait_timeout(g, Duration::from_millis(5))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Port for SimPort {
    fn cpu_id(&self) -> CpuId {
        current().map(|t| t.scheduler().id()).unwrap_or(0)
    }

    fn in_isr(&self) -> bool {
        current().is_none()
    }

    fn init_thread_stack(&self, thd: &Arc<Thread>) -> KernelResult<()> {
        let port = self.me.upgrade().ok_or(KernelError::Shutdown)?;
        let thd = thd.clone();
        std::thread::Builder::new()
            .name(format!("kthd-{}", thd.name()))
            .spawn(move || {
                CURRENT.with(|c| *c.borrow_mut() = Some(thd.clone()));
                port.park_until_current(thd.scheduler(), &thd);
                thread_trampoline(&thd);
            })
            .map_err(|_| KernelError::NoMemory)?;
        Ok(())
    }

    fn request_switch(&self, skd: &Scheduler) {
        let to_bh = skd.current_stack().is_bh();
        skd.finish_context_switch();
        if to_bh {
            skd.bh_main();
        }
        self.wake_all();
    }

    fn preempt_point(&self, skd: &Scheduler) {
        let Some(me) = current() else {
            return;
        };
        if !std::ptr::eq(Arc::as_ptr(me.scheduler()), skd) {
            return;
        }
        if me.state().contains(ThreadState::EXITED) {
            return;
        }
        self.park_until_current(skd, &me);
    }

    fn hwtimer_start(&self, _cpu: CpuId) {}

    fn hwtimer_stop(&self, _cpu: CpuId) {}
}

/// A simulated machine. The test body plays the interrupt controller: it
/// only acts on a CPU once that CPU went idle.
pub struct Sim {
    pub port: Arc<SimPort>,
    pub kernel: Arc<Kernel>,
}

impl Sim {
    pub fn new(cpus: usize) -> Self {
        let port = SimPort::new();
        let kernel = Kernel::new(port.clone(), KernelConfig::with_cpus(cpus)).expect("kernel");
        Self { port, kernel }
    }

    pub fn skd(&self, cpu: CpuId) -> Arc<Scheduler> {
        self.kernel.scheduler(cpu).expect("cpu").clone()
    }

    /// Spawn a thread whose body gets its scheduler
    pub fn spawn<F>(&self, cpu: CpuId, name: &'static str, prio: i32, f: F) -> Arc<Thread>
    where
        F: FnOnce(Arc<Scheduler>) -> i32 + Send + 'static,
    {
        let skd = self.skd(cpu);
        self.kernel
            .spawn(cpu, ThreadAttr::new(name).priority(prio), move || f(skd))
            .expect("spawn")
    }

    pub fn start(&self) {
        self.kernel.start_all().expect("start");
    }

    /// Wait until nothing but the idle loop runs on `cpu`
    pub fn wait_idle(&self, cpu: CpuId) {
        let skd = self.skd(cpu);
        let t0 = Instant::now();
        while !skd.is_idle() {
            assert!(t0.elapsed() < IDLE_TIMEOUT, "cpu{} never went idle", cpu);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn wait_all_idle(&self) {
        for cpu in 0..self.kernel.cpu_num() {
            self.wait_idle(cpu);
        }
    }

    /// `n` tick interrupts on `cpu`, each delivered once the CPU is idle
    pub fn tick(&self, cpu: CpuId, n: usize) {
        let skd = self.skd(cpu);
        for _ in 0..n {
            self.wait_idle(cpu);
            skd.tick_isr();
        }
        self.wait_idle(cpu);
    }
}

impl Drop for Sim {
    fn drop(&mut self) {
        self.port.shutdown.store(true, Ordering::Release);
        self.port.wake_all();
    }
}

/// Ordered log shared by the threads of a test
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn push(&self, s: impl Into<String>) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(s.into());
    }

    pub fn get(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Slot a thread stores its result in
pub struct Slot<T>(Arc<Mutex<Option<T>>>);

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Clone> Slot<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    pub fn set(&self, v: T) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(v);
    }

    pub fn get(&self) -> Option<T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
