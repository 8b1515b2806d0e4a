use std::io;
use thiserror::Error;

/// Everything that can stop a run before all three results exist.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to get processor number! (index {index} of {available} available)")]
    ProcessorLookup { index: usize, available: usize },

    #[error("Failed to read or set thread affinity: {0}")]
    Affinity(#[source] io::Error),

    #[error("Failed to mask signals: {0}")]
    SignalMask(#[source] io::Error),

    #[error("Failed to open MSR device for CPU {cpu} (is the msr module loaded and are we root?): {source}")]
    MsrDevice {
        cpu: usize,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read MSR {msr:#x}: {source}")]
    CounterRead {
        msr: u32,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration value {key}={value:?}: {reason}")]
    Config {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;
