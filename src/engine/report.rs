use std::fmt;

use log::Level;

use crate::engine::policy::AggregateResults;

/// Prefix on every line the engine emits.
pub const TAG: &str = "[vmcheck]";

/// Where human-readable result lines go.
pub trait LogSink {
    fn emit(&self, level: Level, args: fmt::Arguments<'_>);
}

/// Forwards to the `log` facade.
#[derive(Debug, Default)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn emit(&self, level: Level, args: fmt::Arguments<'_>) {
        log::log!(level, "{}", args);
    }
}

pub fn print_loaded<S: LogSink + ?Sized>(sink: &S, build_id: &str) {
    sink.emit(Level::Info, format_args!("{} Loaded. Build {}.", TAG, build_id));
}

/// One `<name> with CPUID: <ratio> (<outcome>)` line per probe, in run order.
pub fn print_results<S: LogSink + ?Sized>(results: &AggregateResults, sink: &S) {
    for (kind, result) in results.iter() {
        sink.emit(
            Level::Info,
            format_args!(
                "{} {} with CPUID: {} ({})",
                TAG,
                kind.name(),
                result.calculated_ratio,
                result.outcome
            ),
        );
    }
}

pub fn print_failure<S: LogSink + ?Sized>(sink: &S, error: &dyn fmt::Display) {
    sink.emit(Level::Error, format_args!("{} {}", TAG, error));
}
