//! Calibration clock sources.
//!
//! All three probes time the same thing, a CPUID round trip, but read the
//! clock through different paths. A hypervisor that offsets or scales the
//! TSC for the RDTSC instruction may still forget the MSR path, and most do
//! not implement APERF at all.
//!
//! Privileged access goes through [`Platform`] so the probes can be driven
//! by a deterministic fake in tests.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::time::Duration;

use crate::engine::error::{EngineError, Result};
use crate::ffi::{get_rdtsc, issue_cpuid};

pub const IA32_TIME_STAMP_COUNTER: u32 = 0x0000_0010;
pub const IA32_APERF: u32 = 0x0000_00E8;

/// Capability interface over the instructions and registers the probes use.
pub trait Platform {
    /// Bind model-register reads to `cpu`. Called once, before isolation.
    fn attach(&mut self, cpu: usize) -> Result<()>;

    fn read_cycle_counter(&mut self) -> u64;

    fn read_model_register(&mut self, msr: u32) -> Result<u64>;

    /// Issue the exit-inducing identification instruction.
    fn identify(&mut self, leaf: u32);

    fn sleep(&mut self, interval: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProbeKind {
    CycleCounter,
    TimestampCounterViaModelRegister,
    ActualPerformanceCounter,
}

impl ProbeKind {
    /// Run order.
    pub const ALL: [ProbeKind; 3] = [
        ProbeKind::CycleCounter,
        ProbeKind::TimestampCounterViaModelRegister,
        ProbeKind::ActualPerformanceCounter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProbeKind::CycleCounter => "RDTSC",
            ProbeKind::TimestampCounterViaModelRegister => "MSR TIMESTAMP",
            ProbeKind::ActualPerformanceCounter => "MSR APERF",
        }
    }

    /// Reads this probe's clock.
    ///
    /// APERF is shifted left by 32 so that only its low half participates in
    /// the (wrapping) difference, matching the fixed-point form the
    /// threshold was tuned against.
    pub fn read<P: Platform + ?Sized>(self, platform: &mut P) -> Result<u64> {
        match self {
            ProbeKind::CycleCounter => Ok(platform.read_cycle_counter()),
            ProbeKind::TimestampCounterViaModelRegister => {
                platform.read_model_register(IA32_TIME_STAMP_COUNTER)
            }
            ProbeKind::ActualPerformanceCounter => {
                Ok(platform.read_model_register(IA32_APERF)? << 32)
            }
        }
    }
}

/// Real backend: RDTSC/CPUID through the assembly stubs, MSRs through the
/// kernel's `/dev/cpu/<n>/msr` interface.
#[derive(Debug, Default)]
pub struct HostPlatform {
    msr: Option<File>,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Platform for HostPlatform {
    fn attach(&mut self, cpu: usize) -> Result<()> {
        let path = format!("/dev/cpu/{}/msr", cpu);
        let file = File::open(&path).map_err(|source| EngineError::MsrDevice { cpu, source })?;
        self.msr = Some(file);
        Ok(())
    }

    fn read_cycle_counter(&mut self) -> u64 {
        unsafe { get_rdtsc() }
    }

    fn read_model_register(&mut self, msr: u32) -> Result<u64> {
        let file = self.msr.as_ref().ok_or_else(|| EngineError::CounterRead {
            msr,
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, "MSR device not attached"),
        })?;
        // The msr driver maps the file offset to the register index.
        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, u64::from(msr))
            .map_err(|source| EngineError::CounterRead { msr, source })?;
        Ok(u64::from_le_bytes(buf))
    }

    fn identify(&mut self, leaf: u32) {
        std::hint::black_box(unsafe { issue_cpuid(leaf) });
    }

    fn sleep(&mut self, interval: Duration) {
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakePlatform;

    #[test]
    fn test_probe_order_and_names() {
        let names: Vec<_> = ProbeKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names, ["RDTSC", "MSR TIMESTAMP", "MSR APERF"]);
    }

    #[test]
    fn test_read_paths() {
        let mut fake = FakePlatform::new();
        fake.tsc = 1234;
        fake.aperf = 3;

        assert_eq!(ProbeKind::CycleCounter.read(&mut fake).unwrap(), 1234);
        assert_eq!(
            ProbeKind::TimestampCounterViaModelRegister.read(&mut fake).unwrap(),
            1234
        );
        assert_eq!(
            ProbeKind::ActualPerformanceCounter.read(&mut fake).unwrap(),
            3u64 << 32
        );
        assert_eq!(fake.msr_reads, vec![IA32_TIME_STAMP_COUNTER, IA32_APERF]);
    }

    #[test]
    fn test_host_rdtsc_advances() {
        let mut host = HostPlatform::new();
        let t1 = host.read_cycle_counter();
        host.identify(0);
        let t2 = host.read_cycle_counter();
        assert!(t2 >= t1);
    }

    #[test]
    fn test_host_msr_read_without_attach_fails() {
        let mut host = HostPlatform::new();
        let err = host.read_model_register(IA32_APERF);
        assert!(matches!(err, Err(EngineError::CounterRead { msr: IA32_APERF, .. })));
    }
}
