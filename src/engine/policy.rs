use std::fmt;

use crate::detectors::clock::ProbeKind;
use crate::engine::config::Thresholds;

/// Scale applied to accumulated overhead before dividing by the baseline.
pub const RATIO_SCALE: u128 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Fail,
    /// The calibration baseline was zero, so no ratio exists.
    Inconclusive,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Ok => "ok",
            Outcome::Fail => "fail",
            Outcome::Inconclusive => "inconclusive",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub calculated_ratio: u64,
    pub outcome: Outcome,
}

impl ProbeResult {
    pub fn failed(&self) -> bool {
        self.outcome != Outcome::Ok
    }
}

/// `100000 * total / calibration`, or `None` for a zero baseline.
///
/// Computed in 128 bits; quotients past `u64::MAX` saturate.
pub fn tick_ratio(total: u64, calibration: u64) -> Option<u64> {
    if calibration == 0 {
        return None;
    }
    let ratio = RATIO_SCALE * u128::from(total) / u128::from(calibration);
    Some(u64::try_from(ratio).unwrap_or(u64::MAX))
}

/// Raw activity delta between two (already shifted) APERF reads.
pub fn activity_delta(start: u64, end: u64) -> u64 {
    end.wrapping_sub(start)
}

/// Turns a probe's figure into a verdict.
///
/// The two TSC probes fail strictly above their limit. APERF fails strictly
/// below its limit: too little activity means the counter is not emulated.
pub fn classify(kind: ProbeKind, ratio: Option<u64>, thresholds: &Thresholds) -> ProbeResult {
    let Some(calculated_ratio) = ratio else {
        return ProbeResult {
            calculated_ratio: 0,
            outcome: Outcome::Inconclusive,
        };
    };

    let failed = match kind {
        ProbeKind::CycleCounter => calculated_ratio > thresholds.rdtsc_fail_above,
        ProbeKind::TimestampCounterViaModelRegister => {
            calculated_ratio > thresholds.msr_timestamp_fail_above
        }
        ProbeKind::ActualPerformanceCounter => calculated_ratio < thresholds.aperf_fail_below,
    };

    ProbeResult {
        calculated_ratio,
        outcome: if failed { Outcome::Fail } else { Outcome::Ok },
    }
}

/// Results of one run, in probe order. Each kind is recorded at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateResults {
    entries: Vec<(ProbeKind, ProbeResult)>,
}

impl AggregateResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` and leaves the set unchanged if `kind` is already present.
    pub(crate) fn record(&mut self, kind: ProbeKind, result: ProbeResult) -> bool {
        if self.get(kind).is_some() {
            return false;
        }
        self.entries.push((kind, result));
        true
    }

    pub fn get(&self, kind: ProbeKind) -> Option<&ProbeResult> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, result)| result)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProbeKind, &ProbeResult)> {
        self.entries.iter().map(|(k, r)| (*k, r))
    }

    #[allow(dead_code)] // Public API for callers inspecting results
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All three probes have a result.
    pub fn is_complete(&self) -> bool {
        ProbeKind::ALL.iter().all(|kind| self.get(*kind).is_some())
    }

    /// Any probe failed or was inconclusive.
    pub fn any_failed(&self) -> bool {
        self.entries.iter().any(|(_, r)| r.failed())
    }
}
