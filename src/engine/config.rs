//! Probe configuration.
//!
//! The defaults are the empirically chosen constants the detector was tuned
//! with. Each one can be overridden from the environment:
//!
//! | Variable                 | Meaning                                   | Default |
//! |--------------------------|-------------------------------------------|---------|
//! | `VMCHECK_ITERATIONS`     | CPUID round trips per ratio probe         | 25000   |
//! | `VMCHECK_CALIBRATION_MS` | Calibration sleep in milliseconds         | 1000    |
//! | `VMCHECK_CPU`            | `last` or a processor index               | `last`  |
//! | `VMCHECK_RDTSC_MAX`      | RDTSC ratio above which the probe fails   | 200     |
//! | `VMCHECK_MSR_TSC_MAX`    | MSR TSC ratio above which the probe fails | 300     |
//! | `VMCHECK_APERF_MIN`      | APERF delta below which the probe fails   | 10000   |

use std::str::FromStr;
use std::time::Duration;

use crate::engine::error::{EngineError, Result};

pub const DEFAULT_ITERATIONS: u32 = 25_000;
pub const DEFAULT_CALIBRATION_INTERVAL: Duration = Duration::from_secs(1);
pub const RDTSC_FAIL_ABOVE: u64 = 200;
pub const MSR_TIMESTAMP_FAIL_ABOVE: u64 = 300;
pub const APERF_FAIL_BELOW: u64 = 10_000;

/// Which logical processor the isolator pins to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorSelection {
    /// Last processor in the enumerated set.
    Last,
    /// Zero-based position in the enumerated set.
    Index(usize),
}

impl ProcessorSelection {
    /// Position in a set of `available` processors. `Last` on an empty set
    /// is `None`; `Index` is returned as-is and bounds-checked by the caller.
    pub fn position(self, available: usize) -> Option<usize> {
        match self {
            ProcessorSelection::Last => available.checked_sub(1),
            ProcessorSelection::Index(index) => Some(index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub rdtsc_fail_above: u64,
    pub msr_timestamp_fail_above: u64,
    pub aperf_fail_below: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            rdtsc_fail_above: RDTSC_FAIL_ABOVE,
            msr_timestamp_fail_above: MSR_TIMESTAMP_FAIL_ABOVE,
            aperf_fail_below: APERF_FAIL_BELOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub iterations: u32,
    pub calibration_interval: Duration,
    pub processor: ProcessorSelection,
    pub thresholds: Thresholds,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            calibration_interval: DEFAULT_CALIBRATION_INTERVAL,
            processor: ProcessorSelection::Last,
            thresholds: Thresholds::default(),
        }
    }
}

impl ProbeConfig {
    /// Defaults overridden by any `VMCHECK_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(iterations) = parse_var::<u32, _>(&lookup, "VMCHECK_ITERATIONS")? {
            if iterations == 0 {
                return Err(EngineError::Config {
                    key: "VMCHECK_ITERATIONS",
                    value: iterations.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            config.iterations = iterations;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "VMCHECK_CALIBRATION_MS")? {
            config.calibration_interval = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("VMCHECK_CPU") {
            config.processor = parse_processor(&raw)?;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "VMCHECK_RDTSC_MAX")? {
            config.thresholds.rdtsc_fail_above = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "VMCHECK_MSR_TSC_MAX")? {
            config.thresholds.msr_timestamp_fail_above = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "VMCHECK_APERF_MIN")? {
            config.thresholds.aperf_fail_below = v;
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| EngineError::Config {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn parse_processor(raw: &str) -> Result<ProcessorSelection> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("last") {
        return Ok(ProcessorSelection::Last);
    }
    trimmed
        .parse()
        .map(ProcessorSelection::Index)
        .map_err(|e: std::num::ParseIntError| EngineError::Config {
            key: "VMCHECK_CPU",
            value: raw.to_string(),
            reason: e.to_string(),
        })
}
