//! Kernel Error Handling
//!
//! One typed error for every scheduler, wait-queue and synchronization
//! operation. Each variant maps onto the classic negative result code so the
//! architecture layer and C callers see the usual numbers.

use core::fmt;

/// Kernel error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    // ═══════════════════════════════════════════════════════════════
    // Invalid-argument class
    // ═══════════════════════════════════════════════════════════════

    /// Invalid argument (value, trigger/action combination, priority)
    InvalidArgument,

    /// Bit position outside of the object's bitmap
    OutOfRange,

    /// Counter would exceed its maximum
    Range,

    /// Null or unusable memory reference
    Fault,

    // ═══════════════════════════════════════════════════════════════
    // Context and type class
    // ═══════════════════════════════════════════════════════════════

    /// Blocking call made outside of thread context
    NotInThread,

    /// Operation does not match the object's type tag
    TypeMismatch,

    /// Operation not permitted in the current state
    Permission,

    /// Caller does not own the lock
    NotOwner,

    // ═══════════════════════════════════════════════════════════════
    // Timing class
    // ═══════════════════════════════════════════════════════════════

    /// Timeout elapsed before the resource became available
    TimedOut,

    /// Wait was interrupted
    Interrupted,

    /// Non-blocking attempt found nothing
    NoData,

    // ═══════════════════════════════════════════════════════════════
    // Lifetime class
    // ═══════════════════════════════════════════════════════════════

    /// Already bound, frozen, started or connected
    Already,

    /// Object is not bound to the given selector
    NotConnected,

    /// Exclusive slot already taken, or scheduler is in bottom half
    Busy,

    /// Object is frozen (negative semaphore value)
    Negative,

    /// Object has been shut down
    Shutdown,

    /// Node is not on the queue or tree
    NotFound,

    // ═══════════════════════════════════════════════════════════════
    // Concurrency-race class
    // ═══════════════════════════════════════════════════════════════

    /// No context switch is needed
    Again,

    /// A context switch is already in flight
    InProgress,

    /// Lock owner chain leads back to the caller
    Deadlock,

    // ═══════════════════════════════════════════════════════════════
    // Resource class
    // ═══════════════════════════════════════════════════════════════

    /// Out of memory
    NoMemory,

    /// No scheduler for this CPU
    NoDevice,
}

/// Error severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Expected outcome, caller retries or moves on
    Info,
    /// Caller misuse
    Warning,
    /// Resource exhaustion
    Error,
}

impl KernelError {
    /// Classic negative result code
    pub const fn errno(self) -> i32 {
        match self {
            Self::Permission => -1,
            Self::Interrupted => -4,
            Self::Again => -11,
            Self::NoMemory => -12,
            Self::Fault => -14,
            Self::Busy => -16,
            Self::NoDevice => -19,
            Self::InvalidArgument => -22,
            Self::Range => -34,
            Self::Deadlock => -35,
            Self::OutOfRange => -44,
            Self::NoData => -61,
            Self::NotConnected => -107,
            Self::Shutdown => -108,
            Self::TimedOut => -110,
            Self::Already => -114,
            Self::InProgress => -115,
            Self::NotFound => -3,
            Self::NotInThread => -1001,
            Self::TypeMismatch => -1002,
            Self::Negative => -1003,
            Self::NotOwner => -1004,
        }
    }

    /// Expected, non-fatal outcomes the caller is supposed to handle
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::Again
                | Self::InProgress
                | Self::TimedOut
                | Self::Interrupted
                | Self::NoData
                | Self::Busy
                | Self::NotFound
        )
    }

    pub const fn severity(self) -> ErrorSeverity {
        match self {
            Self::NoMemory | Self::NoDevice | Self::Deadlock => ErrorSeverity::Error,
            _ if self.is_recoverable() => ErrorSeverity::Info,
            _ => ErrorSeverity::Warning,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidArgument => "invalid argument",
            Self::OutOfRange => "position out of range",
            Self::Range => "value out of range",
            Self::Fault => "bad reference",
            Self::NotInThread => "not in thread context",
            Self::TypeMismatch => "object type mismatch",
            Self::Permission => "operation not permitted",
            Self::NotOwner => "not the owner",
            Self::TimedOut => "timed out",
            Self::Interrupted => "interrupted",
            Self::NoData => "no data",
            Self::Already => "already done",
            Self::NotConnected => "not connected",
            Self::Busy => "busy",
            Self::Negative => "object frozen",
            Self::Shutdown => "shut down",
            Self::NotFound => "not found",
            Self::Again => "try again",
            Self::InProgress => "in progress",
            Self::Deadlock => "deadlock",
            Self::NoMemory => "out of memory",
            Self::NoDevice => "no such cpu",
        };
        write!(f, "{} ({})", msg, self.errno())
    }
}

/// Result type for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Invariant violation: log and stop the kernel
#[macro_export]
macro_rules! kernel_bug {
    ($($arg:tt)*) => {{
        $crate::__log::error!("[BUG] {}", format_args!($($arg)*));
        panic!("kernel bug: {}", format_args!($($arg)*))
    }};
}

/// Panic when `cond` holds
#[macro_export]
macro_rules! kernel_bug_on {
    ($cond:expr) => {
        if $cond {
            $crate::kernel_bug!("{}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if $cond {
            $crate::kernel_bug!($($arg)*);
        }
    };
}
