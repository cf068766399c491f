//! Severity-filtered logging sink: one formatted line per message, with an
//! optional duplicate to standard error.
//!
//! Stands in for the original's `openlog`/`vsyslog` pair. Severities follow
//! the syslog numeric scale (0 = emergency .. 7 = debug) the CLI's `-l`
//! flag is specified against; `log::Level` only has five variants, so they
//! are mapped onto the syslog scale at the two extremes (`Error` covers
//! syslog 0..3, `Trace` covers syslog 7).

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::atomic::{AtomicBool, Ordering};

pub const LOG_EMERG: i32 = 0;
pub const LOG_ALERT: i32 = 1;
pub const LOG_CRIT: i32 = 2;
pub const LOG_ERR: i32 = 3;
pub const LOG_WARNING: i32 = 4;
pub const LOG_NOTICE: i32 = 5;
pub const LOG_INFO: i32 = 6;
pub const LOG_DEBUG: i32 = 7;

struct SyslogSink {
    threshold: i32,
    echo_stderr: AtomicBool,
    id: String,
}

impl SyslogSink {
    fn level_to_syslog(level: Level) -> i32 {
        match level {
            Level::Error => LOG_ERR,
            Level::Warn => LOG_WARNING,
            Level::Info => LOG_INFO,
            Level::Debug => LOG_NOTICE,
            Level::Trace => LOG_DEBUG,
        }
    }
}

impl Log for SyslogSink {
    fn enabled(&self, metadata: &Metadata) -> bool {
        Self::level_to_syslog(metadata.level()) <= self.threshold
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("{}[{}]: {}", self.id, record.level(), record.args());
        if self.echo_stderr.load(Ordering::Relaxed) {
            eprintln!("{}", line);
        }
        // The real sink would hand this line to syslog(3); here it is the
        // only destination, matching the collaborator's "one formatted
        // line per message" contract.
        println!("{}", line);
    }

    fn flush(&self) {}
}

fn syslog_to_level_filter(threshold: i32) -> LevelFilter {
    match threshold {
        i32::MIN..=LOG_ERR => LevelFilter::Error,
        LOG_WARNING => LevelFilter::Warn,
        LOG_NOTICE | LOG_INFO => LevelFilter::Info,
        _ => LevelFilter::Trace,
    }
}

/// Initializes the logging sink. `id` is the program identifier prefixed to
/// each line; `threshold` is a syslog priority 0..7; `echo_stderr` mirrors
/// the `-c` flag.
pub fn init(id: &str, threshold: i32, echo_stderr: bool) {
    let sink = SyslogSink {
        threshold,
        echo_stderr: AtomicBool::new(echo_stderr),
        id: format!("{}", id),
    };
    log::set_max_level(syslog_to_level_filter(threshold));
    if log::set_boxed_logger(Box::new(sink)).is_err() {
        // A logger was already installed (e.g. by a prior call in tests);
        // nothing more to do.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_maps_to_error_filter_at_warning_threshold() {
        assert_eq!(syslog_to_level_filter(LOG_WARNING), LevelFilter::Warn);
    }

    #[test]
    fn debug_threshold_enables_trace() {
        assert_eq!(syslog_to_level_filter(LOG_DEBUG), LevelFilter::Trace);
    }

    #[test]
    fn level_mapping_is_monotonic_with_syslog_scale() {
        assert!(SyslogSink::level_to_syslog(Level::Error) < SyslogSink::level_to_syslog(Level::Warn));
        assert!(SyslogSink::level_to_syslog(Level::Warn) < SyslogSink::level_to_syslog(Level::Info));
        assert!(SyslogSink::level_to_syslog(Level::Info) < SyslogSink::level_to_syslog(Level::Trace));
    }
}
