//! Leveled logging for the buffer-sharing core and its exporters.
//!
//! Records are formatted with a colored level tag and handed to the
//! [`LogSink`] installed with [`set_sink`]. Until a sink is installed, every
//! record is discarded, so library code can log unconditionally.

use core::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use spin::Once;

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log!($crate::log::LogLevel::Trace, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log!($crate::log::LogLevel::Debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log!($crate::log::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log!($crate::log::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log!($crate::log::LogLevel::Error, $($arg)*)
    };
}

/// Destination for formatted log records.
pub trait LogSink: Sync {
    /// Writes one complete record.
    ///
    /// `record` already carries the level tag; it is never terminated with a
    /// newline.
    fn write_record(&self, level: LogLevel, record: fmt::Arguments<'_>);
}

static SINK: Once<&'static dyn LogSink> = Once::new();
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Installs the global log sink.
///
/// Only the first call has an effect; returns `false` if a sink was already
/// installed.
pub fn set_sink(sink: &'static dyn LogSink) -> bool {
    let mut installed = false;
    SINK.call_once(|| {
        installed = true;
        sink
    });
    installed
}

pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[must_use]
pub fn max_level() -> LogLevel {
    LogLevel::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level >= max_level() && SINK.is_completed()
}

#[track_caller]
pub fn log(level: LogLevel, message: fmt::Arguments) {
    if !enabled(level) {
        return;
    }
    if let Some(sink) = SINK.get() {
        sink.write_record(level, format_args!("{} {}", LevelFormat(level), message));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Trace,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            _ => Self::Error,
        }
    }
}

struct LevelFormat(LogLevel);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            LogLevel::Trace => 35,
            LogLevel::Debug => 34,
            LogLevel::Info => 32,
            LogLevel::Warn => 33,
            LogLevel::Error => 31,
        };
        let msg = match self.0 {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => " INFO",
            LogLevel::Warn => " WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "\x1B[{color};1m{msg}\x1B[0m")
    }
}

#[cfg(test)]
mod tests {
    use alloc::{
        format,
        string::{String, ToString as _},
        vec::Vec,
    };

    use spin::Mutex;

    use super::*;

    struct CaptureSink {
        records: Mutex<Vec<(LogLevel, String)>>,
    }

    impl LogSink for CaptureSink {
        fn write_record(&self, level: LogLevel, record: fmt::Arguments<'_>) {
            self.records.lock().push((level, record.to_string()));
        }
    }

    static CAPTURE: CaptureSink = CaptureSink {
        records: Mutex::new(Vec::new()),
    };

    #[test]
    fn test_level_format() {
        assert_eq!(
            format!("{}", LevelFormat(LogLevel::Info)),
            "\x1B[32;1m INFO\x1B[0m"
        );
        assert_eq!(
            format!("{}", LevelFormat(LogLevel::Error)),
            "\x1B[31;1mERROR\x1B[0m"
        );
    }

    #[test]
    fn test_level_round_trip() {
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(LogLevel::from_u8(level as u8), level);
        }
    }

    #[test]
    fn test_sink_receives_enabled_records() {
        set_sink(&CAPTURE);
        assert!(!set_sink(&CAPTURE));

        // other tests in this binary may log concurrently, so only look for
        // the records written here.
        set_max_level(LogLevel::Trace);
        crate::warn!("capture-marker {}", 42);
        let records = CAPTURE.records.lock();
        let (level, record) = records
            .iter()
            .find(|(_, record)| record.contains("capture-marker"))
            .unwrap();
        assert_eq!(*level, LogLevel::Warn);
        assert!(record.ends_with("capture-marker 42"));
        assert!(record.contains(" WARN"));
    }
}
