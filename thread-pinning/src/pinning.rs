//! Entry points that validate input, build an affinity vector and apply it.

use {
    crate::{
        affinity::{AffinityBuilder, PinStrategy},
        apply::{apply_affinity, PinFailure, ThreadHandle},
        config::PinningConfig,
        error::PinningError,
        topology::CpuTopology,
    },
    log::debug,
};

/// Outcome of a pinning request.
#[derive(Debug, Default)]
pub struct PinReport {
    /// Processor assigned to each thread, in thread order.
    pub assignment: Vec<usize>,
    /// Threads the OS refused to pin.
    pub failures: Vec<PinFailure>,
}

impl PinReport {
    /// True when every thread was pinned.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[PinFailure] {
        &self.failures
    }

    pub fn pinned_count(&self) -> usize {
        self.assignment.len() - self.failures.len()
    }
}

/// Pins threads to processors of a topology snapshot.
///
/// # Examples
///
/// ```no_run
/// use agave_thread_pinning::{PinStrategy, ThreadHandle, ThreadPinning};
///
/// # fn main() -> Result<(), agave_thread_pinning::PinningError> {
/// let workers: Vec<_> = (0..4)
///     .map(|_| std::thread::spawn(std::thread::park))
///     .collect();
/// let handles: Vec<ThreadHandle> = workers.iter().map(ThreadHandle::from).collect();
///
/// let report = ThreadPinning::new().pin_threads(&handles, PinStrategy::Spread)?;
/// println!("pinned to {:?}", report.assignment);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Copy, Debug)]
pub struct ThreadPinning<'a> {
    topology: &'a CpuTopology,
}

impl Default for ThreadPinning<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPinning<'static> {
    /// Uses the topology of the running machine.
    pub fn new() -> Self {
        Self::with_topology(CpuTopology::get())
    }
}

impl<'a> ThreadPinning<'a> {
    pub fn with_topology(topology: &'a CpuTopology) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> &'a CpuTopology {
        self.topology
    }

    /// Pins `threads` according to `strategy`.
    ///
    /// # Errors
    ///
    /// Returns [`PinningError::EmptyThreadList`] if `threads` is empty.
    /// OS failures do not abort the batch; they are listed in the report.
    pub fn pin_threads(
        &self,
        threads: &[ThreadHandle],
        strategy: PinStrategy,
    ) -> Result<PinReport, PinningError> {
        let assignment = self.affinity_vector(threads.len(), strategy)?;
        debug!(
            "Pinning {} threads with {strategy} strategy: {assignment:?}",
            threads.len()
        );
        Ok(apply(threads, assignment))
    }

    /// Pins `threads` using a numeric strategy index: 0 spread, 1 core,
    /// 2 logical.
    ///
    /// # Errors
    ///
    /// Returns [`PinningError::InvalidStrategy`] for any other index and
    /// [`PinningError::EmptyThreadList`] if `threads` is empty.
    pub fn pin_threads_by_index(
        &self,
        threads: &[ThreadHandle],
        strategy_index: usize,
    ) -> Result<PinReport, PinningError> {
        self.pin_threads(threads, PinStrategy::try_from(strategy_index)?)
    }

    /// Pins `threads[i]` to `cpus[i]`.
    ///
    /// # Errors
    ///
    /// Returns [`PinningError::EmptyThreadList`] or [`PinningError::EmptyCpuList`]
    /// if either list is empty, and [`PinningError::LengthMismatch`] if their
    /// lengths differ.
    pub fn pin_threads_custom(
        &self,
        threads: &[ThreadHandle],
        cpus: &[usize],
    ) -> Result<PinReport, PinningError> {
        if threads.is_empty() {
            return Err(PinningError::EmptyThreadList);
        }
        if cpus.is_empty() {
            return Err(PinningError::EmptyCpuList);
        }
        if threads.len() != cpus.len() {
            return Err(PinningError::LengthMismatch {
                threads: threads.len(),
                cpus: cpus.len(),
            });
        }
        debug!("Pinning {} threads to {cpus:?}", threads.len());
        Ok(apply(threads, cpus.to_vec()))
    }

    /// Pins `threads` as `config` requests. A disabled config pins nothing and
    /// returns an empty report.
    ///
    /// # Errors
    ///
    /// Returns [`PinningError::EmptyThreadList`] if `threads` is empty, whether
    /// or not pinning is enabled.
    pub fn pin_threads_with_config(
        &self,
        threads: &[ThreadHandle],
        config: &PinningConfig,
    ) -> Result<PinReport, PinningError> {
        if threads.is_empty() {
            return Err(PinningError::EmptyThreadList);
        }
        if !config.enabled {
            debug!("Thread pinning disabled, leaving {} threads unpinned", threads.len());
            return Ok(PinReport::default());
        }
        self.pin_threads(threads, config.strategy)
    }

    /// Computes the processor each of `thread_count` threads would be pinned
    /// to, without touching any thread.
    ///
    /// # Errors
    ///
    /// Returns [`PinningError::EmptyThreadList`] if `thread_count` is zero.
    pub fn affinity_vector(
        &self,
        thread_count: usize,
        strategy: PinStrategy,
    ) -> Result<Vec<usize>, PinningError> {
        if thread_count == 0 {
            return Err(PinningError::EmptyThreadList);
        }
        Ok(AffinityBuilder::new(self.topology).affinity_vector(thread_count, strategy))
    }
}

fn apply(threads: &[ThreadHandle], assignment: Vec<usize>) -> PinReport {
    let failures = apply_affinity(threads, &assignment);
    PinReport {
        assignment,
        failures,
    }
}
