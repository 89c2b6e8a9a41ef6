//! Topology discovery from Linux sysfs.

use {
    super::TopologyProvider,
    crate::{error::PinningError, mask::CoreMask},
    log::{debug, warn},
    std::{
        collections::BTreeSet,
        fs, io,
        path::PathBuf,
    },
};

/// Root of the per-CPU sysfs hierarchy.
pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Sibling mask of the physical core, relative to `cpu<N>`.
const THREAD_SIBLINGS: &str = "topology/thread_siblings";

/// Processors sharing the level 3 cache, relative to `cpu<N>`.
const LLC_SHARED_CPU_MAP: &str = "cache/index3/shared_cpu_map";

/// Reads processor, core and cache layout from a sysfs CPU directory.
///
/// The root defaults to [`SYSFS_CPU_ROOT`]. Any other directory laid out the
/// same way (for instance a captured copy of another machine) works too.
#[derive(Clone, Debug)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsTopology {
    pub fn new() -> Self {
        Self::with_root(SYSFS_CPU_ROOT)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `cpu<N>` directories under the root, ordered by `N`.
    fn cpu_dirs(&self) -> Vec<(usize, PathBuf)> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Cannot read {}: {err}", self.root.display());
                return Vec::new();
            }
        };

        let mut dirs: Vec<(usize, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let id = name.to_str()?.strip_prefix("cpu")?.parse::<usize>().ok()?;
                Some((id, entry.path()))
            })
            .collect();
        dirs.sort_unstable_by_key(|(id, _)| *id);
        dirs
    }

    /// Parses `relative` under every CPU directory. CPUs whose file is missing
    /// (offline CPUs, kernels without cache info) are skipped.
    fn read_masks(&self, relative: &str) -> Vec<Vec<CoreMask>> {
        let mut masks = Vec::new();
        for (cpu, dir) in self.cpu_dirs() {
            let path = dir.join(relative);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    debug!("Skipping CPU {cpu}: {}: {err}", path.display());
                    continue;
                }
            };
            match parse_cpu_mask(&content) {
                Ok(parsed) => masks.push(parsed),
                Err(err) => warn!("Skipping CPU {cpu}: {}: {err}", path.display()),
            }
        }
        masks
    }
}

impl TopologyProvider for SysfsTopology {
    /// Counts the CPUs listed in `<root>/online`, falling back to
    /// `sysconf(_SC_NPROCESSORS_ONLN)`.
    fn active_processor_count(&self) -> Result<usize, PinningError> {
        if let Ok(content) = fs::read_to_string(self.root.join("online")) {
            match parse_cpu_range_list(content.trim()) {
                Ok(cpus) if !cpus.is_empty() => return Ok(cpus.len()),
                Ok(_) => {}
                Err(err) => warn!("Malformed online CPU list: {err}"),
            }
        }

        // safety: sysconf is safe to call
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count <= 0 {
            return Err(PinningError::Io(io::Error::last_os_error()));
        }
        Ok(count as usize)
    }

    fn core_masks(&self) -> Vec<Vec<CoreMask>> {
        self.read_masks(THREAD_SIBLINGS)
    }

    fn cache_masks(&self) -> Vec<Vec<CoreMask>> {
        self.read_masks(LLC_SHARED_CPU_MAP)
    }
}

/// Parse a sysfs CPU bitmap (e.g. "00000000,0000ff00") into core masks.
///
/// The bitmap is a comma separated list of 32-bit hexadecimal words, most
/// significant word first. Pairs of words are packed into 64-bit masks so that
/// mask `g` covers processors `64 * g ..= 64 * g + 63`. Only non-zero masks are
/// returned, ordered by group.
pub fn parse_cpu_mask(s: &str) -> Result<Vec<CoreMask>, PinningError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(PinningError::ParseError("Empty CPU mask".to_string()));
    }

    let mut words: Vec<u64> = Vec::new();
    for (position, chunk) in s.rsplit(',').enumerate() {
        let chunk = chunk.trim();
        if chunk.is_empty() || chunk.len() > 8 {
            return Err(PinningError::ParseError(format!(
                "Invalid CPU mask word: {chunk:?}"
            )));
        }
        let value = u32::from_str_radix(chunk, 16)
            .map_err(|_| PinningError::ParseError(format!("Invalid CPU mask word: {chunk:?}")))?;

        let group = position / 2;
        if words.len() <= group {
            words.resize(group + 1, 0);
        }
        words[group] |= u64::from(value) << (32 * (position % 2));
    }

    words
        .into_iter()
        .enumerate()
        .filter(|(_, word)| *word != 0)
        .map(|(group, word)| {
            u16::try_from(group)
                .map(|group| CoreMask::new(word, group))
                .map_err(|_| PinningError::ParseError(format!("CPU mask too wide: {s}")))
        })
        .collect()
}

/// Parse a CPU range list string (e.g., "0-3,5,7-9") into a vector of CPU IDs.
pub fn parse_cpu_range_list(s: &str) -> Result<Vec<usize>, PinningError> {
    let mut cpus = BTreeSet::new();

    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start_str, end_str)) = part.split_once('-') {
            let start = start_str
                .trim()
                .parse::<usize>()
                .map_err(|_| PinningError::ParseError(format!("Invalid CPU range: {part}")))?;
            let end = end_str
                .trim()
                .parse::<usize>()
                .map_err(|_| PinningError::ParseError(format!("Invalid CPU range: {part}")))?;

            cpus.extend(start..=end);
        } else {
            let cpu = part
                .parse::<usize>()
                .map_err(|_| PinningError::ParseError(format!("Invalid CPU ID: {part}")))?;
            cpus.insert(cpu);
        }
    }

    Ok(cpus.into_iter().collect())
}
