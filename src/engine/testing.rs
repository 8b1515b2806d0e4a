//! Deterministic stand-ins for the privileged backends.

use std::cell::RefCell;
use std::io;
use std::time::Duration;

use log::Level;

use crate::detectors::clock::{Platform, IA32_APERF, IA32_TIME_STAMP_COUNTER};
use crate::engine::environment::{Isolator, SchedulingState};
use crate::engine::error::{EngineError, Result};
use crate::engine::report::LogSink;

/// Counters that only move when the probe does something.
///
/// Clock reads are free, so each bracketed CPUID measures exactly
/// `identify_cost` ticks and a calibration sleep measures `sleep_ticks`.
#[derive(Debug, Default)]
pub struct FakePlatform {
    pub tsc: u64,
    pub aperf: u64,
    pub identify_cost: u64,
    pub aperf_per_identify: u64,
    pub sleep_ticks: u64,
    pub fail_msr: Option<u32>,
    pub fail_attach: bool,

    pub attached: Option<usize>,
    pub msr_reads: Vec<u32>,
    pub leaves: Vec<u32>,
    pub sleeps: Vec<Duration>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bare-metal-like trace with the given per-exit cost and baseline.
    pub fn with_costs(identify_cost: u64, sleep_ticks: u64, aperf_per_identify: u64) -> Self {
        Self {
            identify_cost,
            sleep_ticks,
            aperf_per_identify,
            ..Self::default()
        }
    }
}

impl Platform for FakePlatform {
    fn attach(&mut self, cpu: usize) -> Result<()> {
        if self.fail_attach {
            return Err(EngineError::MsrDevice {
                cpu,
                source: io::Error::new(io::ErrorKind::NotFound, "no msr device"),
            });
        }
        self.attached = Some(cpu);
        Ok(())
    }

    fn read_cycle_counter(&mut self) -> u64 {
        self.tsc
    }

    fn read_model_register(&mut self, msr: u32) -> Result<u64> {
        self.msr_reads.push(msr);
        if self.fail_msr == Some(msr) {
            return Err(EngineError::CounterRead {
                msr,
                source: io::Error::new(io::ErrorKind::Other, "injected"),
            });
        }
        match msr {
            IA32_TIME_STAMP_COUNTER => Ok(self.tsc),
            IA32_APERF => Ok(self.aperf),
            _ => Ok(0),
        }
    }

    fn identify(&mut self, leaf: u32) {
        self.leaves.push(leaf);
        self.tsc += self.identify_cost;
        self.aperf += self.aperf_per_identify;
    }

    fn sleep(&mut self, interval: Duration) {
        self.sleeps.push(interval);
        self.tsc += self.sleep_ticks;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Pin(usize),
    RestoreAffinity,
    Raise,
    RestoreScheduling,
    MaskSignals,
    RestoreSignals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IsolationState {
    affinity: u64,
    scheduling: SchedulingState,
    signals: u64,
}

const FIFO_MAX: SchedulingState = SchedulingState { policy: 1, priority: 99 };

/// Isolator that models affinity, priority and signal mask as plain values.
pub struct RecordingIsolator {
    processors: Vec<usize>,
    pub refuse_raise: bool,
    pub fail_mask: bool,
    initial: IsolationState,
    state: RefCell<IsolationState>,
    events: RefCell<Vec<Event>>,
}

impl RecordingIsolator {
    pub fn with_processors(processors: Vec<usize>) -> Self {
        let affinity = processors.iter().fold(0u64, |mask, cpu| mask | 1 << cpu);
        let initial = IsolationState {
            affinity,
            scheduling: SchedulingState { policy: 0, priority: 0 },
            signals: 0,
        };
        Self {
            processors,
            refuse_raise: false,
            fail_mask: false,
            initial,
            state: RefCell::new(initial),
            events: RefCell::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn current_affinity(&self) -> u64 {
        self.state.borrow().affinity
    }

    pub fn signals_masked(&self) -> bool {
        self.state.borrow().signals != 0
    }

    pub fn acquires(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| matches!(e, Event::Pin(_) | Event::Raise | Event::MaskSignals))
            .count()
    }

    pub fn releases(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::RestoreAffinity | Event::RestoreScheduling | Event::RestoreSignals
                )
            })
            .count()
    }

    /// Every acquisition was released and the state is back where it started.
    pub fn is_restored(&self) -> bool {
        self.acquires() == self.releases() && *self.state.borrow() == self.initial
    }

    fn push(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

impl Isolator for RecordingIsolator {
    type Affinity = u64;
    type SignalMask = u64;

    fn processors(&self) -> Result<Vec<usize>> {
        Ok(self.processors.clone())
    }

    fn pin(&self, cpu: usize) -> Result<u64> {
        self.push(Event::Pin(cpu));
        let mut state = self.state.borrow_mut();
        let previous = state.affinity;
        state.affinity = 1 << cpu;
        Ok(previous)
    }

    fn restore_affinity(&self, previous: &u64) {
        self.push(Event::RestoreAffinity);
        self.state.borrow_mut().affinity = *previous;
    }

    fn raise(&self) -> Option<SchedulingState> {
        if self.refuse_raise {
            return None;
        }
        self.push(Event::Raise);
        let mut state = self.state.borrow_mut();
        let previous = state.scheduling;
        state.scheduling = FIFO_MAX;
        Some(previous)
    }

    fn restore_scheduling(&self, previous: &SchedulingState) {
        self.push(Event::RestoreScheduling);
        self.state.borrow_mut().scheduling = *previous;
    }

    fn mask_signals(&self) -> Result<u64> {
        if self.fail_mask {
            return Err(EngineError::SignalMask(io::Error::from_raw_os_error(libc::EINVAL)));
        }
        self.push(Event::MaskSignals);
        let mut state = self.state.borrow_mut();
        let previous = state.signals;
        state.signals = u64::MAX;
        Ok(previous)
    }

    fn restore_signals(&self, previous: &u64) {
        self.push(Event::RestoreSignals);
        self.state.borrow_mut().signals = *previous;
    }
}

/// Captures every line the engine emits.
#[derive(Default)]
pub struct RecordingSink {
    lines: RefCell<Vec<(Level, String)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines.borrow().clone()
    }
}

impl LogSink for RecordingSink {
    fn emit(&self, level: Level, args: std::fmt::Arguments<'_>) {
        self.lines.borrow_mut().push((level, args.to_string()));
    }
}
