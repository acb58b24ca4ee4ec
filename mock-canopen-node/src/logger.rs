//! Console backend for the `log` facade.

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

pub struct ConsoleLogger {
    level: LevelFilter,
}

impl ConsoleLogger {
    pub fn new(level: LevelFilter) -> Self {
        Self { level }
    }

    fn icon(level: Level) -> &'static str {
        match level {
            Level::Error => "✗",
            Level::Warn => "⚠",
            Level::Info => "✓",
            Level::Debug => "🔧",
            Level::Trace => "📨",
        }
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let icon = Self::icon(record.level());
        if record.level() <= Level::Warn {
            eprintln!("{} {}", icon, record.args());
        } else {
            println!("{} {}", icon, record.args());
        }
    }

    fn flush(&self) {
        std::io::stdout().flush().ok();
    }
}

/// Install the console logger. Fails if a logger is already set.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(ConsoleLogger::new(level)))?;
    log::set_max_level(level);
    Ok(())
}
