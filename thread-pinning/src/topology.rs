//! CPU topology detection.
//!
//! A [`CpuTopology`] describes which logical processors share a physical core,
//! which share the last-level cache and how processors are partitioned into
//! processor groups. The snapshot is produced by a [`TopologyProvider`] and is
//! immutable afterwards.

use {
    crate::{
        error::PinningError,
        mask::{CoreMask, ProcessorGroup},
    },
    log::{debug, warn},
    std::sync::OnceLock,
};

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(windows)]
pub mod windows;

/// Source of raw topology data for a platform.
///
/// Implementations report what the OS exposes; duplicated or unordered entries
/// are fine, [`CpuTopology::discover`] normalizes them.
pub trait TopologyProvider {
    /// Number of logical processors visible to the OS.
    fn active_processor_count(&self) -> Result<usize, PinningError>;

    /// One entry per logical processor (or per physical core), holding the
    /// masks of the physical core it belongs to.
    fn core_masks(&self) -> Vec<Vec<CoreMask>>;

    /// One entry per logical processor (or per cache), holding the masks of the
    /// processors sharing its last-level cache.
    fn cache_masks(&self) -> Vec<Vec<CoreMask>>;

    /// Populated processor groups. Derived from the physical cores unless the
    /// platform reports groups directly.
    fn processor_groups(&self, processor_map: &[Vec<CoreMask>]) -> Vec<ProcessorGroup> {
        derive_group_map(processor_map)
    }
}

/// Provider for targets without topology support. Reports no cores and no
/// caches, which makes every strategy degrade to logical round-robin.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedTopology;

impl TopologyProvider for UnsupportedTopology {
    fn active_processor_count(&self) -> Result<usize, PinningError> {
        Ok(std::thread::available_parallelism()?.get())
    }

    fn core_masks(&self) -> Vec<Vec<CoreMask>> {
        Vec::new()
    }

    fn cache_masks(&self) -> Vec<Vec<CoreMask>> {
        Vec::new()
    }
}

#[cfg(target_os = "linux")]
fn platform_provider() -> linux::SysfsTopology {
    linux::SysfsTopology::new()
}

#[cfg(windows)]
fn platform_provider() -> windows::WindowsTopology {
    windows::WindowsTopology
}

#[cfg(not(any(target_os = "linux", windows)))]
fn platform_provider() -> UnsupportedTopology {
    UnsupportedTopology
}

/// Normalized CPU topology of a machine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuTopology {
    active_processors: usize,
    processor_map: Vec<Vec<CoreMask>>,
    cache_map: Vec<Vec<CoreMask>>,
    group_map: Vec<ProcessorGroup>,
}

impl CpuTopology {
    /// Topology of the running machine.
    ///
    /// Discovered on first use and cached for the lifetime of the process.
    /// Concurrent first callers block until discovery has finished.
    pub fn get() -> &'static CpuTopology {
        static TOPOLOGY: OnceLock<CpuTopology> = OnceLock::new();
        TOPOLOGY.get_or_init(|| Self::discover(&platform_provider()))
    }

    /// Builds a topology from explicit maps. The group map is derived from the
    /// physical cores.
    pub fn new(
        active_processors: usize,
        processor_map: Vec<Vec<CoreMask>>,
        cache_map: Vec<Vec<CoreMask>>,
    ) -> Self {
        let processor_map = normalize(processor_map);
        let cache_map = normalize(cache_map);
        let group_map = derive_group_map(&processor_map);
        Self {
            active_processors: active_processors.max(1),
            processor_map,
            cache_map,
            group_map,
        }
    }

    /// Replaces the derived group map with one reported by the OS.
    pub fn with_group_map(mut self, group_map: Vec<ProcessorGroup>) -> Self {
        self.group_map = trim_groups(group_map);
        self
    }

    /// Queries `provider` once and normalizes the result.
    ///
    /// Missing data is tolerated: if the processor count cannot be determined,
    /// the number of processors found in the core map is used instead.
    pub fn discover(provider: &impl TopologyProvider) -> Self {
        let processor_map = normalize(provider.core_masks());
        let cache_map = normalize(provider.cache_masks());
        let group_map = trim_groups(provider.processor_groups(&processor_map));

        let active_processors = match provider.active_processor_count() {
            Ok(count) => count,
            Err(err) => {
                let mapped = processor_map
                    .iter()
                    .flatten()
                    .map(|mask| mask.count() as usize)
                    .sum::<usize>();
                warn!("Failed to query processor count ({err}), using {mapped} mapped CPUs");
                mapped
            }
        };

        let topology = Self {
            active_processors: active_processors.max(1),
            processor_map,
            cache_map,
            group_map,
        };
        debug!(
            "CPU topology: {} logical CPUs, {} physical cores, {} LLC groups, {} processor groups",
            topology.active_processors,
            topology.processor_map.len(),
            topology.cache_map.len(),
            topology.group_map.len()
        );
        topology
    }

    pub fn active_processors(&self) -> usize {
        self.active_processors
    }

    /// Physical cores, each described by the masks of its SMT siblings.
    pub fn processor_map(&self) -> &[Vec<CoreMask>] {
        &self.processor_map
    }

    /// Last-level cache groups, each described by the masks of the processors
    /// sharing it.
    pub fn cache_map(&self) -> &[Vec<CoreMask>] {
        &self.cache_map
    }

    pub fn group_map(&self) -> &[ProcessorGroup] {
        &self.group_map
    }

    /// Flat indices of every processor in [`group_map`](Self::group_map),
    /// ascending.
    ///
    /// Differs from `0..active_processors` when a group is only partially
    /// populated, e.g. 96 processors split into two groups of 48.
    pub fn processors(&self) -> impl Iterator<Item = usize> + '_ {
        self.group_map
            .iter()
            .zip(0u16..)
            .flat_map(|(group, index)| CoreMask::new(group.mask, index).cpus())
    }

    pub fn physical_core_count(&self) -> usize {
        self.processor_map.len()
    }

    pub fn cache_group_count(&self) -> usize {
        self.cache_map.len()
    }

    /// Index into [`processor_map`](Self::processor_map) of the core that owns `cpu`.
    pub fn core_index_of(&self, cpu: usize) -> Option<usize> {
        position_of(&self.processor_map, cpu)
    }

    /// Index into [`cache_map`](Self::cache_map) of the cache group that owns `cpu`.
    pub fn cache_index_of(&self, cpu: usize) -> Option<usize> {
        position_of(&self.cache_map, cpu)
    }
}

fn position_of(map: &[Vec<CoreMask>], cpu: usize) -> Option<usize> {
    map.iter()
        .position(|masks| masks.iter().any(|mask| mask.contains(cpu)))
}

/// Drops empty masks and entries, then sorts and deduplicates so that every
/// distinct core or cache appears once, ordered by `(group, mask)`.
fn normalize(map: Vec<Vec<CoreMask>>) -> Vec<Vec<CoreMask>> {
    let mut map: Vec<Vec<CoreMask>> = map
        .into_iter()
        .map(|mut masks| {
            masks.retain(|mask| !mask.is_empty());
            masks.sort_unstable();
            masks.dedup();
            masks
        })
        .filter(|masks| !masks.is_empty())
        .collect();
    map.sort_unstable();
    map.dedup();
    map
}

/// ORs every core mask into its group and counts the active processors.
fn derive_group_map(processor_map: &[Vec<CoreMask>]) -> Vec<ProcessorGroup> {
    let mut groups: Vec<ProcessorGroup> = Vec::new();
    for mask in processor_map.iter().flatten() {
        let group = mask.group as usize;
        if groups.len() <= group {
            groups.resize(group + 1, ProcessorGroup::default());
        }
        groups[group].mask |= mask.mask;
        groups[group].active_processors = groups[group].mask.count_ones();
    }
    trim_groups(groups)
}

fn trim_groups(mut groups: Vec<ProcessorGroup>) -> Vec<ProcessorGroup> {
    while groups.last().is_some_and(|group| group.mask == 0) {
        groups.pop();
    }
    groups
}
