//! Error types for topology discovery and thread pinning.

use {std::io, thiserror::Error};

/// Errors that can occur while discovering topology or pinning threads.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PinningError {
    /// I/O or system call error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation not supported on this platform
    #[error("Thread pinning is not supported on this platform")]
    NotSupported,

    /// Processor index the OS call cannot address
    #[error("CPU {cpu} is invalid (max CPU is {max})")]
    InvalidCpu { cpu: usize, max: usize },

    /// Thread list is empty
    #[error("Thread list cannot be empty")]
    EmptyThreadList,

    /// Processor list is empty
    #[error("CPU list cannot be empty")]
    EmptyCpuList,

    /// Thread and processor lists differ in length
    #[error("Thread list has {threads} entries but CPU list has {cpus}")]
    LengthMismatch { threads: usize, cpus: usize },

    /// Unknown pinning strategy
    #[error("Invalid pin strategy: {0}")]
    InvalidStrategy(String),

    /// Failed to parse a CPU mask, range list or strategy name
    #[error("Failed to parse CPU specification: {0}")]
    ParseError(String),
}

impl PinningError {
    /// Returns true for errors caused by the shape of the caller's input
    /// rather than by the operating system.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::EmptyThreadList
                | Self::EmptyCpuList
                | Self::LengthMismatch { .. }
                | Self::InvalidStrategy(_)
        )
    }
}
