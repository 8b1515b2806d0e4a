//! One detection run: isolate, probe, report.

use log::debug;

use crate::detectors::clock::{Platform, ProbeKind};
use crate::detectors::timing::run_probe;
use crate::engine::config::ProbeConfig;
use crate::engine::environment::{AffinityGuard, Isolator, QuietGuard};
use crate::engine::error::Result;
use crate::engine::policy::AggregateResults;
use crate::engine::report::{print_failure, print_loaded, print_results, LogSink};

pub const BUILD_ID: &str = concat!(env!("CARGO_PKG_VERSION"), " for ", env!("VMCHECK_BUILD_TARGET"));

/// Runs all three probes inside the isolation window.
///
/// Results are only returned once every probe has finished. Any error
/// leaves the caller with nothing, and the guards restore affinity,
/// priority and the signal mask on the way out.
pub fn perform_tests<P, I>(platform: &mut P, isolator: &I, config: &ProbeConfig) -> Result<AggregateResults>
where
    P: Platform,
    I: Isolator,
{
    let cpu = isolator.resolve(config.processor)?;
    platform.attach(cpu)?;

    let pinned = AffinityGuard::pin(isolator, cpu)?;
    let quiet = QuietGuard::enter(isolator)?;
    debug!("[ISOLATE] Pinned to CPU {} (real-time: {})", pinned.cpu, quiet.elevated());

    let mut results = AggregateResults::new();
    for kind in ProbeKind::ALL {
        let result = run_probe(platform, kind, config)?;
        results.record(kind, result);
    }
    Ok(results)
}

/// Entry point for the host: load line, the run, then result or failure lines.
pub fn run<P, I, S>(platform: &mut P, isolator: &I, sink: &S, config: &ProbeConfig) -> Result<AggregateResults>
where
    P: Platform,
    I: Isolator,
    S: LogSink + ?Sized,
{
    print_loaded(sink, BUILD_ID);

    match perform_tests(platform, isolator, config) {
        Ok(results) => {
            print_results(&results, sink);
            Ok(results)
        }
        Err(e) => {
            print_failure(sink, &e);
            Err(e)
        }
    }
}
