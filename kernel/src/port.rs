//! Architecture port
//!
//! Everything the scheduler core needs from the CPU architecture and the
//! board: CPU identification, interrupt context detection, thread stack
//! preparation, the context-switch request hook, the tick timer and the power
//! management domain. One `Port` object serves every CPU.

use alloc::sync::Arc;

use crate::error::KernelResult;
use crate::scheduler::{Scheduler, Thread};

/// CPU index, also the index of the CPU's scheduler
pub type CpuId = usize;

pub trait Port: Send + Sync {
    /// Index of the CPU executing the caller
    fn cpu_id(&self) -> CpuId;

    /// True when the caller runs in an interrupt handler
    fn in_isr(&self) -> bool;

    /// Prepare the initial stack of a new thread. The thread starts executing
    /// [`crate::scheduler::thread_trampoline`] the first time it is switched in.
    fn init_thread_stack(&self, thd: &Arc<Thread>) -> KernelResult<()>;

    /// Ask the architecture to swap from `skd.prev_stack()` to
    /// `skd.current_stack()`. The architecture must call
    /// [`Scheduler::finish_context_switch`] once the swap is done. When the
    /// new stack is the bottom half, it runs [`Scheduler::bh_main`] there.
    fn request_switch(&self, skd: &Scheduler);

    /// Point at which a switch away from the calling thread takes effect.
    /// Hardware ports switch on interrupt return and need nothing here; a
    /// hosted port parks the caller until it is the current thread again.
    fn preempt_point(&self, _skd: &Scheduler) {}

    /// Start the tick timer of `cpu`
    fn hwtimer_start(&self, cpu: CpuId);

    /// Stop the tick timer of `cpu`
    fn hwtimer_stop(&self, cpu: CpuId);

    /// Run [`Scheduler::suspend_lic`] in the scheduler service interrupt of
    /// `skd`'s CPU. The default runs it on the caller.
    fn request_suspend(&self, skd: &Scheduler) {
        skd.suspend_lic();
    }

    /// Run [`Scheduler::resume_lic`] in the scheduler service interrupt of
    /// `skd`'s CPU. The default runs it on the caller.
    fn request_resume(&self, skd: &Scheduler) -> KernelResult<()> {
        skd.resume_lic()
    }

    /// Power management domain: the scheduler of `cpu` is suspended
    fn report_suspended(&self, _cpu: CpuId) {}

    /// Power management domain: the scheduler of `cpu` is resuming
    fn report_resuming(&self, _cpu: CpuId) {}
}
