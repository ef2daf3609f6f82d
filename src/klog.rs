// Wires the `log` crate (declared in Cargo.toml but, in the teacher's
// retrieved sources, never actually hooked up to anything) onto the
// existing `Printer`/console sink, so the rest of the kernel can use
// `log::info!`/`log::warn!`/`log::error!` the ordinary ecosystem way
// instead of hand-rolled `printf!`/`debug_log!` call sites everywhere.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        crate::printf!("[{}] {}\n", level, record.args());
    }

    fn flush(&self) {}
}

fn max_level() -> LevelFilter {
    if cfg!(feature = "proc_trace") {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    }
}

/// Install the kernel logger as the `log` crate's global sink. Must be
/// called once, early in boot, before any `log::` macro is used.
pub fn init() {
    log::set_logger(&LOGGER).expect("klog::init called twice");
    log::set_max_level(max_level());
}
