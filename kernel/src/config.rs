//! Kernel configuration
//!
//! Compile-time limits shared by every scheduler instance, plus the runtime
//! [`KernelConfig`] handed to [`crate::Kernel::new`].

use log::LevelFilter;

use crate::error::{KernelError, KernelResult};

/// Maximum number of CPUs (one scheduler per CPU)
pub const CPU_NUM_MAX: usize = 8;

/// Number of real-time priority levels. Larger value means higher priority.
pub const PRIORITY_NUM: usize = 64;

/// Highest valid priority
pub const PRIORITY_MAX: i32 = PRIORITY_NUM as i32 - 1;

/// Maximum number of bits of an event object (FLG/SEL/BR)
pub const EVT_MAX_BITS: usize = 256;

/// Longest chain of mutex owners walked by the deadlock check
pub const MTX_CHAIN_MAX: usize = 32;

/// Default thread stack size in bytes
pub const THREAD_STACK_SIZE_DEFAULT: usize = 4096;

/// Minimum accepted thread stack size in bytes
pub const THREAD_STACK_SIZE_MIN: usize = 512;

/// Ticks added to the time tree clock by every hardware timer interrupt
pub const TICK_PERIOD: u64 = 1;

/// Size of the stack buffer used to format one log record
pub const LOG_LINE_MAX: usize = 256;

/// Runtime kernel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of CPUs that get a scheduler instance
    pub cpu_num: usize,
    /// Whether interrupt bottom halves are serviced on a dedicated stack
    pub bh_enabled: bool,
    /// Maximum level forwarded by the kernel logger
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpu_num: 1,
            bh_enabled: true,
            log_level: LevelFilter::Info,
        }
    }
}

impl KernelConfig {
    /// Configuration for `cpu_num` CPUs with default options
    pub fn with_cpus(cpu_num: usize) -> Self {
        Self {
            cpu_num,
            ..Self::default()
        }
    }

    pub fn bh(mut self, enabled: bool) -> Self {
        self.bh_enabled = enabled;
        self
    }

    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Check the configuration against the compile-time limits
    pub fn validate(&self) -> KernelResult<()> {
        if self.cpu_num == 0 || self.cpu_num > CPU_NUM_MAX {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The run queue keeps one bit per priority level in a single word.
    static_assertions::const_assert!(PRIORITY_NUM <= 64);
    static_assertions::const_assert!(EVT_MAX_BITS % 64 == 0);
    static_assertions::const_assert!(CPU_NUM_MAX > 0);

    #[test]
    fn test_default_config_is_valid() {
        assert!(KernelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_cpu_count_bounds() {
        assert_eq!(KernelConfig::with_cpus(0).validate(), Err(KernelError::InvalidArgument));
        assert_eq!(
            KernelConfig::with_cpus(CPU_NUM_MAX + 1).validate(),
            Err(KernelError::InvalidArgument)
        );
        assert!(KernelConfig::with_cpus(CPU_NUM_MAX).validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let cfg = KernelConfig::with_cpus(2).bh(false).log_level(LevelFilter::Trace);
        assert_eq!(cfg.cpu_num, 2);
        assert!(!cfg.bh_enabled);
        assert_eq!(cfg.log_level, LevelFilter::Trace);
    }
}
