use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::env;

/// Adapted from SimpleLogger in crate `log`. Writes to stderr so heap
/// diagnostics never interleave with an embedder's stdout.
struct HeapLogger;

impl Log for HeapLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "[{}:{}:{}] {}",
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: HeapLogger = HeapLogger;

/// Install the logger, honoring `RUST_LOG` the way the reference tools do.
/// Safe to call more than once; later calls are ignored.
pub fn init() -> Result<(), SetLoggerError> {
    match env::var("RUST_LOG") {
        Ok(level) => match level.to_uppercase().as_ref() {
            "OFF" => log::set_max_level(LevelFilter::Off),
            "ERROR" => log::set_max_level(LevelFilter::Error),
            "WARN" => log::set_max_level(LevelFilter::Warn),
            "INFO" => log::set_max_level(LevelFilter::Info),
            "DEBUG" => log::set_max_level(LevelFilter::Debug),
            "TRACE" => log::set_max_level(LevelFilter::Trace),
            _ => log::set_max_level(LevelFilter::Info),
        },
        Err(_) => log::set_max_level(LevelFilter::Warn),
    }
    log::set_logger(&LOGGER)
}
