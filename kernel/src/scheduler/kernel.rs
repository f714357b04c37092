//! Kernel: the set of per-CPU schedulers sharing one architecture port

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::info;

use super::core::Scheduler;
use super::thread::{Thread, ThreadAttr};
use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::port::{CpuId, Port};

pub struct Kernel {
    port: Arc<dyn Port>,
    cfg: KernelConfig,
    skds: Vec<Arc<Scheduler>>,
}

impl Kernel {
    pub fn new(port: Arc<dyn Port>, cfg: KernelConfig) -> KernelResult<Arc<Self>> {
        cfg.validate()?;
        let skds = (0..cfg.cpu_num)
            .map(|cpu| Arc::new(Scheduler::new(cpu, port.clone(), &cfg)))
            .collect();
        info!("kernel: {} cpu(s), bh {}", cfg.cpu_num, if cfg.bh_enabled { "on" } else { "off" });
        Ok(Arc::new(Self { port, cfg, skds }))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.cfg
    }

    pub fn port(&self) -> &Arc<dyn Port> {
        &self.port
    }

    pub fn cpu_num(&self) -> usize {
        self.skds.len()
    }

    /// Scheduler of `cpu`, `NoDevice` if there is no such CPU
    pub fn scheduler(&self, cpu: CpuId) -> KernelResult<&Arc<Scheduler>> {
        self.skds.get(cpu).ok_or(KernelError::NoDevice)
    }

    /// Scheduler of the calling CPU
    pub fn local(&self) -> KernelResult<&Arc<Scheduler>> {
        self.scheduler(self.port.cpu_id())
    }

    pub fn schedulers(&self) -> impl Iterator<Item = &Arc<Scheduler>> {
        self.skds.iter()
    }

    /// Create a thread bound to `cpu`
    pub fn spawn<F>(&self, cpu: CpuId, attr: ThreadAttr, entry: F) -> KernelResult<Arc<Thread>>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        self.scheduler(cpu)?.spawn(attr, entry)
    }

    /// Start the scheduler of `cpu`
    pub fn start(&self, cpu: CpuId) -> KernelResult<()> {
        self.scheduler(cpu)?.start()
    }

    /// Start every scheduler (single-threaded boot)
    pub fn start_all(&self) -> KernelResult<()> {
        for skd in &self.skds {
            skd.start()?;
        }
        Ok(())
    }

    /// Preemption check on every CPU
    pub fn chkpmpt_all(&self) {
        for skd in &self.skds {
            skd.chkpmpt();
        }
    }

    /// Drop the boot wake lock of `cpu`: once no other lock is held its
    /// threads freeze and the CPU suspends
    pub fn suspend(&self, cpu: CpuId) -> KernelResult<()> {
        self.scheduler(cpu)?.dec_wklkcnt()
    }

    /// Resume `cpu`. Runs locally from its own interrupt context, otherwise
    /// through the port.
    pub fn resume(&self, cpu: CpuId) -> KernelResult<()> {
        let skd = self.scheduler(cpu)?;
        if self.port.in_isr() && self.port.cpu_id() == cpu {
            skd.resume_lic()
        } else {
            self.port.request_resume(skd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testing::{RecordingPort, TestBed};

    #[test]
    fn test_bad_cpu_is_no_device() {
        let bed = TestBed::new(2);
        assert_eq!(bed.kernel.cpu_num(), 2);
        assert!(bed.kernel.scheduler(1).is_ok());
        assert!(matches!(bed.kernel.scheduler(2), Err(KernelError::NoDevice)));
        assert!(matches!(
            bed.kernel.spawn(5, ThreadAttr::new("x"), || 0),
            Err(KernelError::NoDevice)
        ));
    }

    #[test]
    fn test_invalid_config() {
        let port = Arc::new(RecordingPort::new());
        assert!(matches!(
            Kernel::new(port, KernelConfig::with_cpus(0)),
            Err(KernelError::InvalidArgument)
        ));
    }

    #[test]
    fn test_local_follows_port() {
        let bed = TestBed::new(2);
        bed.port.set_cpu(1);
        assert_eq!(bed.kernel.local().map(|s| s.id()), Ok(1));
    }

    #[test]
    fn test_start_twice() {
        let bed = TestBed::new(1);
        bed.kernel.start(0).unwrap();
        assert_eq!(bed.kernel.start(0), Err(KernelError::Already));
        assert!(bed.port.timer_running(0));
    }

    #[test]
    fn test_threads_stay_on_their_cpu() {
        let bed = TestBed::new(2);
        let t0 = bed.kernel.spawn(0, ThreadAttr::new("a").priority(4), || 0).unwrap();
        let t1 = bed.kernel.spawn(1, ThreadAttr::new("b").priority(4), || 0).unwrap();
        assert_eq!(t0.scheduler().id(), 0);
        assert_eq!(t1.scheduler().id(), 1);
        assert_eq!(bed.skd(0).thread_count(), 1);
        assert_eq!(bed.skd(1).thread_count(), 1);
    }
}
