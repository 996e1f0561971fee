//! # Logger Service
//!
//! This crate implements the kernel's diagnostic console as a `log` sink.
//!
//! ## Philosophy
//!
//! Logging is explicit and structured, not text-based or printf-style.
//! Each record is kept as a [`LogEntry`] with its level and target, so
//! tests can ask "did the relay warn about backpressure?" instead of
//! scraping text. Only the most recent entries are kept.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

/// Entries kept by the installed logger
pub const DEFAULT_CAPACITY: usize = 1024;

/// A structured log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: Level,
    /// Module path of the emitting code
    pub target: String,
    pub message: String,
}

impl LogEntry {
    /// Creates a new log entry
    pub fn new(level: Level, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Bounded in-memory log sink
///
/// When full, the oldest entry is dropped.
#[derive(Debug)]
pub struct RingLogger {
    capacity: usize,
    level: LevelFilter,
    entries: Mutex<VecDeque<LogEntry>>,
}

static INSTALLED: OnceLock<RingLogger> = OnceLock::new();

impl RingLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            level: LevelFilter::Debug,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Sets the most verbose level that is kept
    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    /// Installs a process-wide logger and returns it
    ///
    /// The first call registers it with the `log` facade; later calls return
    /// the same instance.
    pub fn install() -> &'static RingLogger {
        let mut first = false;
        let logger = INSTALLED.get_or_init(|| {
            first = true;
            RingLogger::new(DEFAULT_CAPACITY)
        });
        // Another logger may already own the facade
        if first && log::set_logger(logger).is_ok() {
            log::set_max_level(logger.level);
        }
        logger
    }

    /// Appends an entry, evicting the oldest when full
    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Returns a copy of the retained entries, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Returns true if any retained entry matches
    pub fn contains<F>(&self, predicate: F) -> bool
    where
        F: Fn(&LogEntry) -> bool,
    {
        self.lock().iter().any(predicate)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LogEntry>> {
        // A panicking test must not take the console down with it
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.push(LogEntry::new(
                record.level(),
                record.target(),
                record.args().to_string(),
            ));
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(logger: &RingLogger, level: Level, target: &str, message: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target(target)
                .args(format_args!("{}", message))
                .build(),
        );
    }

    #[test]
    fn test_log_entry_creation() {
        let entry = LogEntry::new(Level::Info, "sim_kernel::relay", "test message");
        assert_eq!(entry.level, Level::Info);
        assert_eq!(entry.target, "sim_kernel::relay");
        assert_eq!(entry.message, "test message");
    }

    #[test]
    fn test_ring_drops_oldest() {
        let logger = RingLogger::new(2);
        emit(&logger, Level::Warn, "a", "one");
        emit(&logger, Level::Warn, "a", "two");
        emit(&logger, Level::Warn, "a", "three");
        let messages: Vec<_> = logger.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["two", "three"]);
    }

    #[test]
    fn test_level_filter() {
        let logger = RingLogger::new(8).with_level(LevelFilter::Warn);
        emit(&logger, Level::Debug, "a", "noise");
        emit(&logger, Level::Error, "a", "bad");
        assert_eq!(logger.len(), 1);
        assert!(logger.contains(|e| e.level == Level::Error));
        logger.clear();
        assert!(logger.is_empty());
    }

    #[test]
    fn test_install_is_idempotent() {
        let first = RingLogger::install() as *const RingLogger;
        let second = RingLogger::install() as *const RingLogger;
        assert_eq!(first, second);

        log::warn!(target: "services_logger::test", "through the facade");
        assert!(RingLogger::install().contains(|e| e.target == "services_logger::test"));
    }
}
