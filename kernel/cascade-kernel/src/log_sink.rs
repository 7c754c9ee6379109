//! Log sinks: where [`cascade_core::log`]'s global print/log functions
//! actually send their bytes.
//!
//! [`cascade_core::log`] already provides the level, the macros, and the
//! atomic function-pointer swap; this module supplies the two-phase boot
//! sequence the teacher's kernel uses it for — an early serial sink
//! registered before anything else exists, later joined (or replaced) by a
//! richer logger — and the [`LogSink`] trait a richer logger would
//! implement.

use core::fmt;

use cascade_core::log::LogLevel;

/// A destination for kernel log output.
///
/// Unlike [`cascade_core::log::set_print_fn`]'s raw function pointer, a
/// `LogSink` can carry state (a framebuffer cursor, a ring buffer) and be
/// one of several sinks a richer logger multiplexes across. Levels below
/// [`LogSink::min_level`] are dropped before formatting.
pub trait LogSink {
    /// This sink's name, for diagnostics.
    fn name(&self) -> &str;
    /// The least severe level this sink accepts (severity decreases with
    /// the enum's declared order, so this is an upper bound on
    /// `LogLevel`'s integer value).
    fn min_level(&self) -> LogLevel;
    /// Writes one already-formatted, newline-terminated log line.
    fn write_line(&self, level: LogLevel, args: fmt::Arguments<'_>);
}

/// Filters a `(level, sink)` pair the way a logger fan-out would, without
/// committing to any particular multi-sink registry (there's exactly one
/// sink — serial — until a richer logger is layered on top).
pub fn should_emit(sink: &dyn LogSink, level: LogLevel) -> bool {
    level <= sink.min_level()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use std::string::String;

    struct RecordingSink {
        min: LogLevel,
        lines: RefCell<std::vec::Vec<String>>,
    }

    impl LogSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }
        fn min_level(&self) -> LogLevel {
            self.min
        }
        fn write_line(&self, level: LogLevel, args: fmt::Arguments<'_>) {
            self.lines.borrow_mut().push(std::format!("{}: {}", level.name(), args));
        }
    }

    #[test]
    fn should_emit_respects_min_level() {
        let sink = RecordingSink { min: LogLevel::Info, lines: RefCell::new(std::vec::Vec::new()) };
        assert!(should_emit(&sink, LogLevel::Error));
        assert!(should_emit(&sink, LogLevel::Info));
        assert!(!should_emit(&sink, LogLevel::Debug));
    }

    #[test]
    fn write_line_records_formatted_text() {
        let sink = RecordingSink { min: LogLevel::Trace, lines: RefCell::new(std::vec::Vec::new()) };
        sink.write_line(LogLevel::Warn, format_args!("heap at {:#x}", 0x1000));
        assert_eq!(sink.lines.borrow()[0], "WARN : heap at 0x1000");
    }
}
