//! Thread-to-processor assignment policies.

use {
    crate::{error::PinningError, mask::CoreMask, topology::CpuTopology},
    serde::{Deserialize, Serialize},
    std::{fmt, str::FromStr},
};

/// Placement policy used to build an affinity vector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinStrategy {
    /// Spread threads evenly over last-level caches, then over the processors
    /// sharing each cache.
    #[default]
    Spread = 0,
    /// Round-robin over physical cores before reusing SMT siblings.
    Core = 1,
    /// Thread `i` runs on logical processor `i % active_processors`.
    Logical = 2,
}

impl PinStrategy {
    pub const ALL: [PinStrategy; 3] = [Self::Spread, Self::Core, Self::Logical];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Spread => "spread",
            Self::Core => "core",
            Self::Logical => "logical",
        }
    }
}

impl fmt::Display for PinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PinStrategy {
    type Err = PinningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| PinningError::ParseError(format!("Unknown pin strategy: {name}")))
    }
}

impl TryFrom<usize> for PinStrategy {
    type Error = PinningError;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or_else(|| PinningError::InvalidStrategy(index.to_string()))
    }
}

/// Distributes `thread_count` threads over `resource_count` resources by
/// recursive bisection.
///
/// Entry `i` of the result is the resource index of thread `i`. With fewer
/// threads than resources the threads are spaced as far apart as possible;
/// with more threads, neighbouring threads share a resource. No resource gets
/// more than one thread above any other. Either count being zero yields an
/// empty vector.
pub fn bisect(thread_count: usize, resource_count: usize) -> Vec<usize> {
    if thread_count == 0 || resource_count == 0 {
        return Vec::new();
    }
    let mut out = vec![0; thread_count];
    bisect_into(&mut out, 0..thread_count, 0..resource_count);
    out
}

fn bisect_into(
    out: &mut [usize],
    threads: std::ops::Range<usize>,
    resources: std::ops::Range<usize>,
) {
    if threads.is_empty() || resources.is_empty() {
        return;
    }
    if threads.len() == 1 {
        out[threads.start] = resources.start;
        return;
    }
    if resources.len() == 1 {
        out[threads].fill(resources.start);
        return;
    }
    // The left half takes the middle element of an odd-length range. The
    // thread split is clamped so every resource ends up with `quota` or
    // `quota + 1` threads.
    let quota = threads.len() / resources.len();
    let left_resources = resources.len().div_ceil(2);
    let right_resources = resources.len() - left_resources;
    let min_left = (left_resources * quota)
        .max(threads.len().saturating_sub(right_resources * (quota + 1)));
    let max_left = (left_resources * (quota + 1)).min(threads.len() - right_resources * quota);
    let left_threads = threads.len().div_ceil(2).clamp(min_left, max_left);

    let thread_mid = threads.start + left_threads;
    let resource_mid = resources.start + left_resources;
    bisect_into(out, threads.start..thread_mid, resources.start..resource_mid);
    bisect_into(out, thread_mid..threads.end, resource_mid..resources.end);
}

/// Computes affinity vectors from a topology snapshot.
#[derive(Clone, Copy, Debug)]
pub struct AffinityBuilder<'a> {
    topology: &'a CpuTopology,
}

impl<'a> AffinityBuilder<'a> {
    pub fn new(topology: &'a CpuTopology) -> Self {
        Self { topology }
    }

    /// Returns one flat processor index per thread.
    ///
    /// The result only depends on the topology, `thread_count` and `strategy`.
    pub fn affinity_vector(&self, thread_count: usize, strategy: PinStrategy) -> Vec<usize> {
        match strategy {
            PinStrategy::Spread => self.spread(thread_count),
            PinStrategy::Core => self.core(thread_count),
            PinStrategy::Logical => self.logical(thread_count),
        }
    }

    fn spread(&self, thread_count: usize) -> Vec<usize> {
        let cache_map = self.topology.cache_map();
        if cache_map.is_empty() {
            return self.logical(thread_count);
        }

        // Threads assigned to each cache, in ascending thread order.
        let mut threads_per_cache = vec![Vec::new(); cache_map.len()];
        for (thread, cache) in bisect(thread_count, cache_map.len())
            .into_iter()
            .enumerate()
        {
            threads_per_cache[cache].push(thread);
        }

        let mut out = vec![0; thread_count];
        for (masks, threads) in cache_map.iter().zip(threads_per_cache) {
            let cpus = expand(masks);
            for (thread, slot) in threads.iter().zip(bisect(threads.len(), cpus.len())) {
                out[*thread] = cpus[slot];
            }
        }
        out
    }

    fn core(&self, thread_count: usize) -> Vec<usize> {
        let processor_map = self.topology.processor_map();
        if processor_map.is_empty() {
            return self.logical(thread_count);
        }

        let mut remaining = processor_map.to_vec();
        let mut out = Vec::with_capacity(thread_count);
        while out.len() < thread_count {
            if remaining.iter().flatten().all(CoreMask::is_empty) {
                remaining = processor_map.to_vec();
            }
            for core in remaining.iter_mut() {
                if out.len() == thread_count {
                    break;
                }
                if let Some(cpu) = core.iter_mut().find_map(CoreMask::pop_lowest) {
                    out.push(cpu);
                }
            }
        }
        out
    }

    /// Thread `i` goes to the `(i % active)`-th populated processor. Ranks the
    /// group map does not cover are used as flat indices directly.
    fn logical(&self, thread_count: usize) -> Vec<usize> {
        let active = self.topology.active_processors().max(1);
        let processors: Vec<usize> = self.topology.processors().take(active).collect();
        (0..thread_count)
            .map(|thread| {
                let rank = thread % active;
                processors.get(rank).copied().unwrap_or(rank)
            })
            .collect()
    }
}

/// Flat processor indices of a set of masks, mask by mask, ascending bits.
fn expand(masks: &[CoreMask]) -> Vec<usize> {
    masks.iter().flat_map(CoreMask::cpus).collect()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::mask::PROCESSOR_GROUP_SIZE,
        assert_matches::assert_matches,
        std::collections::{HashMap, HashSet},
        test_case::test_case,
    };

    fn single(mask: u64) -> Vec<CoreMask> {
        vec![CoreMask::new(mask, 0)]
    }

    /// `count` cores without SMT, one bit each.
    fn single_cores(count: usize) -> Vec<Vec<CoreMask>> {
        (0..count).map(|cpu| vec![CoreMask::from_cpu(cpu)]).collect()
    }

    /// `count` cores with two adjacent SMT siblings each.
    fn smt_cores(count: usize) -> Vec<Vec<CoreMask>> {
        (0..count).map(|core| single(0b11 << (2 * core))).collect()
    }

    fn topology(
        active: usize,
        cores: Vec<Vec<CoreMask>>,
        caches: &[u64],
    ) -> CpuTopology {
        CpuTopology::new(
            active,
            cores,
            caches.iter().map(|&mask| single(mask)).collect(),
        )
    }

    fn seq(range: std::ops::Range<usize>) -> Vec<usize> {
        range.collect()
    }

    fn concat(parts: &[Vec<usize>]) -> Vec<usize> {
        parts.concat()
    }

    #[test_case(0, 4, vec![]; "no threads")]
    #[test_case(4, 0, vec![]; "no resources")]
    #[test_case(2, 8, vec![0, 4]; "fewer threads")]
    #[test_case(3, 3, vec![0, 1, 2]; "equal")]
    #[test_case(5, 2, vec![0, 0, 0, 1, 1]; "more threads")]
    #[test_case(15, 2, vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1]; "odd split")]
    #[test_case(6, 3, vec![0, 0, 1, 1, 2, 2]; "odd resources")]
    #[test_case(4, 3, vec![0, 1, 2, 2]; "odd resources remainder")]
    fn test_bisect(threads: usize, resources: usize, expected: Vec<usize>) {
        assert_eq!(bisect(threads, resources), expected);
    }

    #[test]
    fn test_bisect_balances_threads() {
        for resources in 1..=8 {
            for per_resource in 1..=4 {
                let out = bisect(resources * per_resource, resources);
                let mut counts = HashMap::new();
                for resource in out {
                    *counts.entry(resource).or_insert(0) += 1;
                }
                assert_eq!(counts.len(), resources);
                assert!(counts.values().all(|&count| count == per_resource));
            }
        }
    }

    // Single cache of eight cores without SMT.
    #[test_case(2, vec![0, 1], vec![0, 1], vec![0, 4]; "8 cpus 2 threads")]
    #[test_case(
        16,
        concat(&[seq(0..8), seq(0..8)]),
        concat(&[seq(0..8), seq(0..8)]),
        vec![0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7];
        "8 cpus 16 threads"
    )]
    fn test_one_cache_no_smt(
        threads: usize,
        core: Vec<usize>,
        logical: Vec<usize>,
        spread: Vec<usize>,
    ) {
        let topology = topology(8, single_cores(8), &[0xff]);
        let builder = AffinityBuilder::new(&topology);
        assert_eq!(builder.affinity_vector(threads, PinStrategy::Core), core);
        assert_eq!(builder.affinity_vector(threads, PinStrategy::Logical), logical);
        assert_eq!(builder.affinity_vector(threads, PinStrategy::Spread), spread);
    }

    #[test]
    fn test_two_caches_fewer_threads() {
        let topology = topology(32, single_cores(32), &[0xffff, 0xffff_0000]);
        let builder = AffinityBuilder::new(&topology);
        assert_eq!(builder.affinity_vector(15, PinStrategy::Core), seq(0..15));
        assert_eq!(builder.affinity_vector(15, PinStrategy::Logical), seq(0..15));
        assert_eq!(
            builder.affinity_vector(15, PinStrategy::Spread),
            (0..15).map(|i| 2 * i).collect::<Vec<_>>()
        );
    }

    const SPREAD_16_OVER_2_CACHES_35_THREADS: [usize; 35] = [
        0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12,
        13, 13, 14, 14, 15, 15,
    ];

    #[test]
    fn test_two_caches_more_threads() {
        let topology = topology(16, single_cores(16), &[0xff, 0xff00]);
        let builder = AffinityBuilder::new(&topology);
        let wrapped = concat(&[seq(0..16), seq(0..16), seq(0..3)]);
        assert_eq!(builder.affinity_vector(35, PinStrategy::Core), wrapped);
        assert_eq!(builder.affinity_vector(35, PinStrategy::Logical), wrapped);
        assert_eq!(
            builder.affinity_vector(35, PinStrategy::Spread),
            SPREAD_16_OVER_2_CACHES_35_THREADS
        );
    }

    #[test_case(
        9,
        vec![0, 2, 4, 6, 8, 10, 12, 14, 1],
        seq(0..9),
        vec![0, 1, 2, 4, 6, 8, 10, 12, 14];
        "9 threads"
    )]
    #[test_case(
        18,
        vec![0, 2, 4, 6, 8, 10, 12, 14, 1, 3, 5, 7, 9, 11, 13, 15, 0, 2],
        concat(&[seq(0..16), seq(0..2)]),
        vec![0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 8, 9, 10, 11, 12, 13, 14, 15];
        "18 threads"
    )]
    fn test_one_cache_smt(
        threads: usize,
        core: Vec<usize>,
        logical: Vec<usize>,
        spread: Vec<usize>,
    ) {
        let topology = topology(16, smt_cores(8), &[0xffff]);
        let builder = AffinityBuilder::new(&topology);
        assert_eq!(builder.affinity_vector(threads, PinStrategy::Core), core);
        assert_eq!(builder.affinity_vector(threads, PinStrategy::Logical), logical);
        assert_eq!(builder.affinity_vector(threads, PinStrategy::Spread), spread);
    }

    #[test]
    fn test_two_caches_smt_more_threads() {
        let topology = topology(16, smt_cores(8), &[0xff, 0xff00]);
        let builder = AffinityBuilder::new(&topology);
        let evens = seq(0..8).into_iter().map(|i| 2 * i).collect::<Vec<_>>();
        let odds = seq(0..8).into_iter().map(|i| 2 * i + 1).collect::<Vec<_>>();
        assert_eq!(
            builder.affinity_vector(35, PinStrategy::Core),
            concat(&[evens.clone(), odds.clone(), evens, odds, vec![0, 2, 4]])
        );
        assert_eq!(
            builder.affinity_vector(35, PinStrategy::Spread),
            SPREAD_16_OVER_2_CACHES_35_THREADS
        );
    }

    #[test]
    fn test_uneven_caches_smt() {
        let topology = topology(
            30,
            smt_cores(15),
            &[0b11_1111_1111, 0b11_1111_1111_1111_1111_1100_0000_0000],
        );
        let builder = AffinityBuilder::new(&topology);
        assert_eq!(builder.affinity_vector(2, PinStrategy::Core), vec![0, 2]);
        assert_eq!(builder.affinity_vector(2, PinStrategy::Logical), vec![0, 1]);
        assert_eq!(builder.affinity_vector(2, PinStrategy::Spread), vec![0, 10]);
    }

    #[test_case(10, seq(0..10), vec![0, 1, 2, 3, 5, 6, 7, 8, 9, 11]; "10 threads")]
    #[test_case(
        15,
        concat(&[seq(0..12), seq(0..3)]),
        vec![0, 1, 2, 2, 3, 4, 5, 5, 6, 7, 8, 8, 9, 10, 11];
        "15 threads"
    )]
    fn test_non_neighbouring_siblings(
        threads: usize,
        core_and_logical: Vec<usize>,
        spread: Vec<usize>,
    ) {
        // Siblings are (k, k + 6).
        let cores = (0..6).map(|core| single(0b100_0001 << core)).collect();
        let topology = topology(12, cores, &[0xfff]);
        let builder = AffinityBuilder::new(&topology);
        assert_eq!(
            builder.affinity_vector(threads, PinStrategy::Core),
            core_and_logical
        );
        assert_eq!(
            builder.affinity_vector(threads, PinStrategy::Logical),
            core_and_logical
        );
        assert_eq!(builder.affinity_vector(threads, PinStrategy::Spread), spread);
    }

    #[test]
    fn test_logical_is_modulo_active() {
        let topology = topology(6, smt_cores(3), &[0x3f]);
        let builder = AffinityBuilder::new(&topology);
        for threads in [1, 6, 7, 20] {
            let out = builder.affinity_vector(threads, PinStrategy::Logical);
            assert_eq!(out.len(), threads);
            for (i, cpu) in out.iter().enumerate() {
                assert_eq!(*cpu, i % 6);
            }
        }
    }

    #[test]
    fn test_core_visits_every_core_first() {
        let topology = topology(16, smt_cores(8), &[0xff, 0xff00]);
        let builder = AffinityBuilder::new(&topology);
        let out = builder.affinity_vector(topology.physical_core_count(), PinStrategy::Core);
        let cores: HashSet<_> = out
            .iter()
            .map(|&cpu| topology.core_index_of(cpu).unwrap())
            .collect();
        assert_eq!(cores.len(), topology.physical_core_count());
    }

    #[test]
    fn test_spread_balances_caches() {
        let topology = topology(16, single_cores(16), &[0xf, 0xf0, 0xf00, 0xf000]);
        let builder = AffinityBuilder::new(&topology);
        for threads in [4, 8, 12, 16, 20] {
            let mut per_cache = vec![0; topology.cache_group_count()];
            for cpu in builder.affinity_vector(threads, PinStrategy::Spread) {
                per_cache[topology.cache_index_of(cpu).unwrap()] += 1;
            }
            assert!(per_cache.iter().all(|&count| count == threads / 4));
        }
    }

    #[test]
    fn test_spread_one_thread_per_core() {
        let topology = topology(8, smt_cores(4), &[0xff]);
        let builder = AffinityBuilder::new(&topology);
        let out = builder.affinity_vector(4, PinStrategy::Spread);
        let cores: HashSet<_> = out
            .iter()
            .map(|&cpu| topology.core_index_of(cpu).unwrap())
            .collect();
        assert_eq!(cores.len(), 4);
    }

    #[test]
    fn test_affinity_vector_is_idempotent() {
        let topology = topology(16, smt_cores(8), &[0xff, 0xff00]);
        let builder = AffinityBuilder::new(&topology);
        for strategy in PinStrategy::ALL {
            for threads in [1, 5, 16, 33] {
                assert_eq!(
                    builder.affinity_vector(threads, strategy),
                    builder.affinity_vector(threads, strategy)
                );
            }
        }
    }

    #[test]
    fn test_multiple_processor_groups() {
        let cores = vec![
            vec![CoreMask::new(0b1, 0)],
            vec![CoreMask::new(0b10, 0)],
            vec![CoreMask::new(0b1, 1)],
            vec![CoreMask::new(0b10, 1)],
        ];
        let caches = vec![
            vec![CoreMask::new(0b11, 0)],
            vec![CoreMask::new(0b11, 1)],
        ];
        let topology = CpuTopology::new(4, cores, caches);
        let builder = AffinityBuilder::new(&topology);
        let g1 = PROCESSOR_GROUP_SIZE;
        assert_eq!(
            builder.affinity_vector(4, PinStrategy::Core),
            vec![0, 1, g1, g1 + 1]
        );
        assert_eq!(builder.affinity_vector(2, PinStrategy::Spread), vec![0, g1]);
        assert_eq!(
            builder.affinity_vector(4, PinStrategy::Logical),
            vec![0, 1, g1, g1 + 1]
        );
    }

    #[test]
    fn test_partially_populated_groups() {
        // 96 processors in two groups of 48, no cache information.
        let cores = (0..2u16)
            .flat_map(|group| (0..48).map(move |bit| vec![CoreMask::new(1 << bit, group)]))
            .collect();
        let topology = CpuTopology::new(96, cores, Vec::new());
        let builder = AffinityBuilder::new(&topology);
        let g1 = PROCESSOR_GROUP_SIZE;
        let expected = concat(&[seq(0..48), seq(g1..g1 + 48)]);

        for strategy in PinStrategy::ALL {
            let out = builder.affinity_vector(96, strategy);
            assert_eq!(out, expected, "{strategy}");
            assert!(out.iter().all(|&cpu| topology.core_index_of(cpu).is_some()));
        }
        assert_eq!(
            builder.affinity_vector(100, PinStrategy::Logical)[96..],
            [0, 1, 2, 3]
        );
    }

    /// `groups` processor groups of 32 processors. Every core or cache entry
    /// is `width` bits wide and, with `sibling_stride`, is mirrored into group
    /// `group + sibling_stride`.
    fn multi_group(groups: u16, sibling_stride: Option<u16>, width: u32) -> Vec<Vec<CoreMask>> {
        let base = (1u64 << width) - 1;
        (0..groups)
            .flat_map(|group| {
                (0..32 / width).map(move |slot| {
                    let mask = base << (slot * width);
                    let mut entry = vec![CoreMask::new(mask, group)];
                    entry.extend(sibling_stride.map(|stride| CoreMask::new(mask, group + stride)));
                    entry
                })
            })
            .collect()
    }

    /// Two sockets of 96 cores in six groups of 32, 24 LLCs of 8 cores.
    fn genoa() -> CpuTopology {
        CpuTopology::new(192, multi_group(6, None, 1), multi_group(6, None, 8))
    }

    /// Same cores, but each LLC spans groups `g` and `g + 3`.
    fn genoa_paired_caches() -> CpuTopology {
        CpuTopology::new(192, multi_group(6, None, 1), multi_group(3, Some(3), 8))
    }

    /// Sixteen groups; each core has its SMT sibling eight groups up.
    fn genoa_smt() -> CpuTopology {
        CpuTopology::new(192, multi_group(8, Some(8), 1), multi_group(8, Some(8), 8))
    }

    #[test_case(
        genoa(),
        vec![0, 16, 24, 72, 80, 128, 136, 152, 192, 208, 216, 264, 272, 320, 328, 344];
        "six groups"
    )]
    #[test_case(
        genoa_paired_caches(),
        vec![0, 8, 16, 208, 24, 64, 72, 264, 80, 88, 128, 320, 136, 144, 152, 344];
        "caches across groups"
    )]
    #[test_case(
        genoa_smt(),
        vec![0, 16, 64, 80, 128, 144, 192, 208, 256, 272, 320, 336, 384, 400, 448, 464];
        "sixteen groups"
    )]
    fn test_multi_group_servers(topology: CpuTopology, spread: Vec<usize>) {
        let builder = AffinityBuilder::new(&topology);
        assert_eq!(builder.affinity_vector(16, PinStrategy::Core), seq(0..16));
        assert_eq!(builder.affinity_vector(16, PinStrategy::Logical), seq(0..16));
        assert_eq!(builder.affinity_vector(16, PinStrategy::Spread), spread);
    }

    #[test]
    fn test_uneven_caches_more_threads() {
        // 15 cores; caches of 12 and 3. Each cache gets 9 threads, the small
        // one three per core.
        let topology = topology(15, single_cores(15), &[0xfff, 0b111 << 12]);
        let builder = AffinityBuilder::new(&topology);
        let wrapped = concat(&[seq(0..15), seq(0..3)]);
        assert_eq!(builder.affinity_vector(18, PinStrategy::Core), wrapped);
        assert_eq!(builder.affinity_vector(18, PinStrategy::Logical), wrapped);
        assert_eq!(
            builder.affinity_vector(18, PinStrategy::Spread),
            vec![0, 1, 2, 3, 5, 6, 8, 9, 11, 12, 12, 12, 13, 13, 13, 14, 14, 14]
        );
    }

    #[test]
    fn test_empty_maps_degrade_to_logical() {
        let topology = CpuTopology::new(3, Vec::new(), Vec::new());
        let builder = AffinityBuilder::new(&topology);
        for strategy in PinStrategy::ALL {
            assert_eq!(builder.affinity_vector(5, strategy), vec![0, 1, 2, 0, 1]);
        }
        assert!(builder.affinity_vector(0, PinStrategy::Spread).is_empty());
    }

    #[test]
    fn test_strategy_conversions() {
        assert_eq!(PinStrategy::default(), PinStrategy::Spread);
        assert_eq!(PinStrategy::try_from(1).unwrap(), PinStrategy::Core);
        assert_matches!(
            PinStrategy::try_from(3),
            Err(PinningError::InvalidStrategy(index)) if index == "3"
        );
        assert_eq!(" Logical ".parse::<PinStrategy>().unwrap(), PinStrategy::Logical);
        assert_eq!("SPREAD".parse::<PinStrategy>().unwrap(), PinStrategy::Spread);
        assert_matches!("numa".parse::<PinStrategy>(), Err(PinningError::ParseError(_)));
        assert_eq!(PinStrategy::Core.to_string(), "core");
        assert_eq!(PinStrategy::Logical as usize, 2);
    }
}
