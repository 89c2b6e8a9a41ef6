// Activate some of the Rust 2024 lints to make the future migration easier.
#![warn(if_let_rescope)]
#![warn(keyword_idents_2024)]
#![warn(missing_unsafe_on_extern)]
#![warn(rust_2024_guarded_string_incompatible_syntax)]
#![warn(rust_2024_incompatible_pat)]
#![warn(tail_expr_drop_order)]
#![warn(unsafe_attr_outside_unsafe)]
#![warn(unsafe_op_in_unsafe_fn)]

//! CPU topology discovery and thread-to-processor pinning.
//!
//! The crate reads which logical processors share a physical core and which
//! share the last-level cache, turns an ordered list of threads into an
//! affinity vector under a placement strategy, and applies that vector with
//! one single-processor affinity call per thread.
//!
//! # Platform Support
//!
//! Linux (sysfs and `pthread_setaffinity_np`) and Windows
//! (`GetLogicalProcessorInformationEx` and `SetThreadGroupAffinity`). On other
//! platforms the topology is empty, affinity vectors fall back to logical
//! round-robin and every pin attempt reports [`PinningError::NotSupported`].
//!
//! # Examples
//!
//! ```no_run
//! use agave_thread_pinning::*;
//!
//! # fn main() -> Result<(), PinningError> {
//! let workers: Vec<_> = (0..8)
//!     .map(|_| std::thread::spawn(std::thread::park))
//!     .collect();
//! let handles: Vec<ThreadHandle> = workers.iter().map(ThreadHandle::from).collect();
//!
//! let pinning = ThreadPinning::new();
//!
//! // One thread per cache group first, then spread within each cache
//! let report = pinning.pin_threads(&handles, PinStrategy::Spread)?;
//! for failure in report.failures() {
//!     eprintln!("thread {} not pinned: {}", failure.thread_index, failure.error);
//! }
//!
//! // Explicit placement
//! pinning.pin_threads_custom(&handles[..2], &[0, 1])?;
//! # Ok(())
//! # }
//! ```

mod affinity;
mod apply;
mod config;
mod env;
mod error;
mod mask;
mod pinning;
mod topology;

pub use {
    affinity::{bisect, AffinityBuilder, PinStrategy},
    apply::{apply_affinity, thread_affinity, PinFailure, ThreadHandle},
    config::{PinningConfig, PINNING_ENABLED_VAR, PINNING_STRATEGY_VAR},
    env::{is_enabled_value, Environ},
    error::PinningError,
    mask::{flat_index, split_index, CoreMask, ProcessorGroup, PROCESSOR_GROUP_SIZE},
    pinning::{PinReport, ThreadPinning},
    topology::{CpuTopology, TopologyProvider, UnsupportedTopology},
};

#[cfg(target_os = "linux")]
pub use topology::linux::{parse_cpu_mask, parse_cpu_range_list, SysfsTopology};
#[cfg(windows)]
pub use topology::windows::WindowsTopology;
