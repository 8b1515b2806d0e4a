//! Environment Isolation
//!
//! Removes scheduler and interrupt noise from the measurement window:
//!
//! - **Affinity**: the thread is pinned to a single logical processor so the
//!   TSC and MSR reads all come from one core.
//! - **Quiet window**: the thread is raised to `SCHED_FIFO` at maximum
//!   priority so nothing else is scheduled on the core, and every maskable
//!   signal is blocked so no handler runs mid-measurement. SIGKILL and
//!   SIGSTOP cannot be blocked.
//!
//! Both changes are held by guards that restore the previous state on drop.
//!
//! The module also reads a few sysfs knobs that are known to add timing
//! noise. They are only logged and never change a verdict.

use std::fs::File;
use std::io::{self, BufRead, BufReader};

use log::warn;

use crate::engine::config::ProcessorSelection;
use crate::engine::error::{EngineError, Result};

/// Scheduling state saved by [`Isolator::raise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingState {
    pub policy: i32,
    pub priority: i32,
}

/// Privileged facilities the isolation window is built from.
pub trait Isolator {
    type Affinity;
    type SignalMask;

    /// Logical processors the caller may run on, in enumeration order.
    fn processors(&self) -> Result<Vec<usize>>;

    fn pin(&self, cpu: usize) -> Result<Self::Affinity>;
    fn restore_affinity(&self, previous: &Self::Affinity);

    /// Raise to the highest priority. `None` if it was refused.
    fn raise(&self) -> Option<SchedulingState>;
    fn restore_scheduling(&self, previous: &SchedulingState);

    fn mask_signals(&self) -> Result<Self::SignalMask>;
    fn restore_signals(&self, previous: &Self::SignalMask);

    /// Resolves `selection` to a processor number.
    fn resolve(&self, selection: ProcessorSelection) -> Result<usize> {
        let processors = self.processors()?;
        let available = processors.len();
        selection
            .position(available)
            .and_then(|index| processors.get(index).copied())
            .ok_or(EngineError::ProcessorLookup {
                index: selection.position(available).unwrap_or(0),
                available,
            })
    }
}

/// Holds the thread on one processor until dropped.
pub struct AffinityGuard<'a, I: Isolator> {
    isolator: &'a I,
    previous: I::Affinity,
    pub cpu: usize,
}

impl<'a, I: Isolator> AffinityGuard<'a, I> {
    pub fn pin(isolator: &'a I, cpu: usize) -> Result<Self> {
        let previous = isolator.pin(cpu)?;
        Ok(Self { isolator, previous, cpu })
    }
}

impl<I: Isolator> Drop for AffinityGuard<'_, I> {
    fn drop(&mut self) {
        self.isolator.restore_affinity(&self.previous);
    }
}

/// Raised priority plus masked signals until dropped.
pub struct QuietGuard<'a, I: Isolator> {
    isolator: &'a I,
    scheduling: Option<SchedulingState>,
    signals: I::SignalMask,
}

impl<'a, I: Isolator> QuietGuard<'a, I> {
    pub fn enter(isolator: &'a I) -> Result<Self> {
        let scheduling = isolator.raise();
        if scheduling.is_none() {
            warn!("[ISOLATE] Could not raise to real-time priority, measurements may be noisy");
        }
        let signals = match isolator.mask_signals() {
            Ok(mask) => mask,
            Err(e) => {
                if let Some(previous) = &scheduling {
                    isolator.restore_scheduling(previous);
                }
                return Err(e);
            }
        };
        Ok(Self { isolator, scheduling, signals })
    }

    pub fn elevated(&self) -> bool {
        self.scheduling.is_some()
    }
}

impl<I: Isolator> Drop for QuietGuard<'_, I> {
    fn drop(&mut self) {
        // Reverse order of `enter`.
        self.isolator.restore_signals(&self.signals);
        if let Some(previous) = &self.scheduling {
            self.isolator.restore_scheduling(previous);
        }
    }
}

/// Linux backend built on `sched_*affinity`, `sched_setscheduler` and
/// `pthread_sigmask`. Every call targets the calling thread.
#[derive(Debug, Default)]
pub struct LinuxIsolator;

impl LinuxIsolator {
    pub fn new() -> Self {
        Self
    }

    fn current_affinity() -> Result<libc::cpu_set_t> {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            let rc = libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set);
            if rc != 0 {
                return Err(EngineError::Affinity(io::Error::last_os_error()));
            }
            Ok(set)
        }
    }

    fn set_affinity(set: &libc::cpu_set_t) -> io::Result<()> {
        let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl Isolator for LinuxIsolator {
    type Affinity = libc::cpu_set_t;
    type SignalMask = libc::sigset_t;

    fn processors(&self) -> Result<Vec<usize>> {
        let set = Self::current_affinity()?;
        let max = libc::CPU_SETSIZE as usize;
        Ok((0..max).filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) }).collect())
    }

    fn pin(&self, cpu: usize) -> Result<Self::Affinity> {
        let previous = Self::current_affinity()?;
        let mut target: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::CPU_ZERO(&mut target);
            libc::CPU_SET(cpu, &mut target);
        }
        Self::set_affinity(&target).map_err(EngineError::Affinity)?;
        Ok(previous)
    }

    fn restore_affinity(&self, previous: &Self::Affinity) {
        if let Err(e) = Self::set_affinity(previous) {
            warn!("[ISOLATE] Failed to restore affinity: {}", e);
        }
    }

    fn raise(&self) -> Option<SchedulingState> {
        unsafe {
            let policy = libc::sched_getscheduler(0);
            let mut param: libc::sched_param = std::mem::zeroed();
            if policy < 0 || libc::sched_getparam(0, &mut param) != 0 {
                return None;
            }
            let previous = SchedulingState { policy, priority: param.sched_priority };

            let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
            let mut raised: libc::sched_param = std::mem::zeroed();
            raised.sched_priority = max;
            if max < 0 || libc::sched_setscheduler(0, libc::SCHED_FIFO, &raised) != 0 {
                return None;
            }
            Some(previous)
        }
    }

    fn restore_scheduling(&self, previous: &SchedulingState) {
        let rc = unsafe {
            let mut param: libc::sched_param = std::mem::zeroed();
            param.sched_priority = previous.priority;
            libc::sched_setscheduler(0, previous.policy, &param)
        };
        if rc != 0 {
            warn!("[ISOLATE] Failed to restore scheduling policy: {}", io::Error::last_os_error());
        }
    }

    fn mask_signals(&self) -> Result<Self::SignalMask> {
        unsafe {
            let mut all: libc::sigset_t = std::mem::zeroed();
            let mut previous: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut all);
            // pthread_sigmask returns the error number instead of setting errno.
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &all, &mut previous);
            if rc != 0 {
                return Err(EngineError::SignalMask(io::Error::from_raw_os_error(rc)));
            }
            Ok(previous)
        }
    }

    fn restore_signals(&self, previous: &Self::SignalMask) {
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, previous, std::ptr::null_mut()) };
        if rc != 0 {
            warn!("[ISOLATE] Failed to restore signal mask: {}", io::Error::from_raw_os_error(rc));
        }
    }
}

/// Host settings that affect timing reliability.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentState {
    /// CPU frequency governor (e.g., "performance", "schedutil", "ondemand")
    pub cpu_governor: Option<String>,
    pub smt_active: Option<bool>,
}

impl EnvironmentState {
    pub fn detect() -> Self {
        Self {
            cpu_governor: read_first_line("/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor"),
            smt_active: read_first_line("/sys/devices/system/cpu/smt/active").map(|v| v == "1"),
        }
    }

    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(ref gov) = self.cpu_governor {
            if gov != "performance" {
                warnings.push(format!(
                    "CPU governor '{}' causes timing variance (consider: cpupower frequency-set -g performance)",
                    gov
                ));
            }
        }

        if let Some(true) = self.smt_active {
            warnings.push(
                "SMT (Hyper-Threading) active - timing may have noise from sibling threads".to_string(),
            );
        }

        warnings
    }

    pub fn log_warnings(&self) {
        for warning in self.warnings() {
            warn!("[ENV] {}", warning);
        }
    }
}

fn read_first_line(path: &str) -> Option<String> {
    let file = File::open(path).ok()?;
    let line = BufReader::new(file).lines().next()?.ok()?;
    Some(line.trim().to_string())
}
