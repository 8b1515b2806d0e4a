mod detectors;
mod engine;
mod ffi;

use std::process::ExitCode;

use log::debug;

use detectors::clock::HostPlatform;
use engine::config::ProbeConfig;
use engine::environment::{EnvironmentState, LinuxIsolator};
use engine::report::{print_failure, LogCrateSink};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let sink = LogCrateSink;

    let config = match ProbeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            print_failure(&sink, &e);
            return ExitCode::FAILURE;
        }
    };

    // Timing noise sources; informational only.
    EnvironmentState::detect().log_warnings();

    let mut platform = HostPlatform::new();
    let isolator = LinuxIsolator::new();

    match engine::runner::run(&mut platform, &isolator, &sink, &config) {
        Ok(results) if results.is_complete() => {
            debug!("[vmcheck] Virtualization suspected: {}", results.any_failed());
            ExitCode::SUCCESS
        }
        _ => ExitCode::FAILURE,
    }
}
