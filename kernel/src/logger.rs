//! Kernel logger
//!
//! `log` backend for the scheduler core. A record becomes one console line
//! `[LEVEL cpuN] target: message`, built in a fixed buffer on the stack so
//! it can be emitted from interrupt context. Lines longer than
//! [`LOG_LINE_MAX`] are cut on a character boundary.

use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};
use spin::Once;

use crate::config::LOG_LINE_MAX;
use crate::port::CpuId;

/// Console the formatted records are written to
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);

    /// CPU the record is emitted on, when the board can tell
    fn cpu_id(&self) -> Option<CpuId> {
        None
    }
}

/// One console line under construction
struct LineBuf {
    buf: [u8; LOG_LINE_MAX],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self { buf: [0; LOG_LINE_MAX], len: 0 }
    }

    fn format(&mut self, cpu: Option<CpuId>, record: &Record) {
        let _ = write!(self, "[{:<5}", record.level());
        if let Some(cpu) = cpu {
            let _ = write!(self, " cpu{}", cpu);
        }
        let _ = match record.target() {
            "" => write!(self, "] {}", record.args()),
            target => write!(self, "] {}: {}", short_target(target), record.args()),
        };
    }

    fn as_str(&self) -> &str {
        match core::str::from_utf8(&self.buf[..self.len]) {
            Ok(s) => s,
            Err(e) => core::str::from_utf8(&self.buf[..e.valid_up_to()]).unwrap_or(""),
        }
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// `rtk_kernel::sync::mtx` is shown as `sync::mtx`
fn short_target(target: &str) -> &str {
    match target.split_once("::") {
        Some((krate, rest)) if krate == env!("CARGO_CRATE_NAME") => rest,
        _ => target,
    }
}

struct KernelLogger {
    sink: &'static dyn LogSink,
}

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = LineBuf::new();
        line.format(self.sink.cpu_id(), record);
        self.sink.write_line(line.as_str());
    }

    fn flush(&self) {}
}

static LOGGER: Once<KernelLogger> = Once::new();

/// Initialize the logger at `Info` level
pub fn init(sink: &'static dyn LogSink) {
    init_with_level(sink, LevelFilter::Info);
}

/// Initialize the logger with a specific level.
///
/// Only the first call installs the sink; later calls just change the level.
pub fn init_with_level(sink: &'static dyn LogSink, level: LevelFilter) {
    let logger = LOGGER.call_once(|| KernelLogger { sink });
    // Another logger may already be registered by the host (tests)
    let _ = log::set_logger(logger);
    log::set_max_level(level);
}
