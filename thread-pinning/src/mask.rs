//! Processor masks and flat processor indices.
//!
//! Topology data is expressed as `(bitmask, group)` pairs. Each group holds
//! [`PROCESSOR_GROUP_SIZE`] logical processors, so a bit position inside a
//! group translates to the flat index `group * PROCESSOR_GROUP_SIZE + bit`.

use serde::{Deserialize, Serialize};

/// Number of logical processors addressed by a single mask word.
pub const PROCESSOR_GROUP_SIZE: usize = 64;

/// Converts a bit position inside a processor group into a flat processor index.
#[inline]
pub const fn flat_index(bit: u32, group: u16) -> usize {
    group as usize * PROCESSOR_GROUP_SIZE + bit as usize
}

/// Splits a flat processor index into its `(group, bit)` pair.
#[inline]
pub const fn split_index(cpu: usize) -> (u16, u32) {
    (
        (cpu / PROCESSOR_GROUP_SIZE) as u16,
        (cpu % PROCESSOR_GROUP_SIZE) as u32,
    )
}

/// Position of the lowest set bit of a non-zero mask.
#[inline]
fn lowest_set_bit(mask: u64) -> u32 {
    (mask & mask.wrapping_neg()).trailing_zeros()
}

/// Logical processors of one entity (a physical core or a cache sharing set)
/// within a single processor group.
///
/// Ordering is `(group, mask)` ascending, which is the iteration order of
/// every map in [`CpuTopology`](crate::CpuTopology).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CoreMask {
    pub group: u16,
    pub mask: u64,
}

impl CoreMask {
    pub const fn new(mask: u64, group: u16) -> Self {
        Self { group, mask }
    }

    /// Mask holding the single processor `cpu`.
    pub const fn from_cpu(cpu: usize) -> Self {
        let (group, bit) = split_index(cpu);
        Self::new(1 << bit, group)
    }

    pub const fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Number of logical processors in the mask.
    pub const fn count(&self) -> u32 {
        self.mask.count_ones()
    }

    pub const fn contains(&self, cpu: usize) -> bool {
        let (group, bit) = split_index(cpu);
        group == self.group && self.mask & (1 << bit) != 0
    }

    /// Removes the lowest processor from the mask and returns its flat index.
    pub fn pop_lowest(&mut self) -> Option<usize> {
        if self.mask == 0 {
            return None;
        }
        let bit = lowest_set_bit(self.mask);
        self.mask &= !(1u64 << bit);
        Some(flat_index(bit, self.group))
    }

    /// Flat indices of every processor in the mask, ascending.
    pub fn cpus(&self) -> impl Iterator<Item = usize> {
        let mut mask = *self;
        std::iter::from_fn(move || mask.pop_lowest())
    }
}

/// Active processors of one processor group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessorGroup {
    pub mask: u64,
    pub active_processors: u32,
}

impl ProcessorGroup {
    pub const fn new(mask: u64, active_processors: u32) -> Self {
        Self {
            mask,
            active_processors,
        }
    }
}
