//! CPUID exit-timing probes.
//!
//! CPUID causes an unconditional VM-exit under VT-x and SVM. On bare metal a
//! CPUID costs tens to a few hundred cycles; under a hypervisor each one is a
//! full exit/resume round trip, typically well over a thousand.
//!
//! The two TSC probes compare 25,000 bracketed CPUIDs against one second of
//! uninterrupted ticks, so the figure is independent of clock frequency:
//!
//! ```text
//! ratio = 100000 * Σ(t1 - t0) / ticks_per_second
//! ```
//!
//! The APERF probe brackets a single CPUID. APERF only ticks while the core
//! executes, and most hypervisors (KVM among them) don't emulate it, so it
//! reads as zero or a frozen value.
//!
//! Expects the caller to hold the isolation window (pinned, raised, masked).

use log::debug;

use crate::detectors::clock::{Platform, ProbeKind};
use crate::engine::config::ProbeConfig;
use crate::engine::error::Result;
use crate::engine::policy::{activity_delta, classify, tick_ratio, ProbeResult};

/// CPUID leaf issued inside the ratio loops (vendor string).
pub const RATIO_PROBE_LEAF: u32 = 0;
/// CPUID leaf issued by the activity probe (feature flags).
pub const ACTIVITY_PROBE_LEAF: u32 = 1;

/// Ticks of `kind`'s clock across one calibration sleep, with no exits.
///
/// The sleep is coarse; it only has to be long relative to the probe loop.
pub fn calibrate<P: Platform>(
    platform: &mut P,
    kind: ProbeKind,
    interval: std::time::Duration,
) -> Result<u64> {
    let start = kind.read(platform)?;
    platform.sleep(interval);
    let end = kind.read(platform)?;
    Ok(end.saturating_sub(start))
}

/// Sum of `iterations` CPUID round trips measured on `kind`'s clock.
pub fn accumulate_exit_overhead<P: Platform>(
    platform: &mut P,
    kind: ProbeKind,
    iterations: u32,
) -> Result<u64> {
    let mut total: u64 = 0;
    for _ in 0..iterations {
        let t0 = kind.read(platform)?;
        platform.identify(RATIO_PROBE_LEAF);
        let t1 = kind.read(platform)?;
        total = total.saturating_add(t1.saturating_sub(t0));
    }
    Ok(total)
}

fn ratio_probe<P: Platform>(platform: &mut P, kind: ProbeKind, config: &ProbeConfig) -> Result<ProbeResult> {
    let calibration = calibrate(platform, kind, config.calibration_interval)?;
    let total = accumulate_exit_overhead(platform, kind, config.iterations)?;
    let ratio = tick_ratio(total, calibration);

    debug!(
        "[PROBE] {}: calibration={} total={} iterations={} ratio={:?}",
        kind.name(),
        calibration,
        total,
        config.iterations,
        ratio
    );

    Ok(classify(kind, ratio, &config.thresholds))
}

fn activity_probe<P: Platform>(platform: &mut P, config: &ProbeConfig) -> Result<ProbeResult> {
    let kind = ProbeKind::ActualPerformanceCounter;
    let start = kind.read(platform)?;
    platform.identify(ACTIVITY_PROBE_LEAF);
    let end = kind.read(platform)?;
    let delta = activity_delta(start, end);

    debug!("[PROBE] {}: start={:#x} end={:#x} delta={}", kind.name(), start, end, delta);

    Ok(classify(kind, Some(delta), &config.thresholds))
}

/// Runs one probe to completion. Measurements are taken exactly once.
pub fn run_probe<P: Platform>(platform: &mut P, kind: ProbeKind, config: &ProbeConfig) -> Result<ProbeResult> {
    match kind {
        ProbeKind::CycleCounter | ProbeKind::TimestampCounterViaModelRegister => {
            ratio_probe(platform, kind, config)
        }
        ProbeKind::ActualPerformanceCounter => activity_probe(platform, config),
    }
}
