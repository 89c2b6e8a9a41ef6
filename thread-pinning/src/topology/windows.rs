//! Topology discovery through `GetLogicalProcessorInformationEx`.

use {
    super::TopologyProvider,
    crate::{
        error::PinningError,
        mask::{CoreMask, ProcessorGroup},
    },
    log::warn,
    std::{io, mem::offset_of, ptr, slice},
    windows::Win32::{
        Foundation::ERROR_INSUFFICIENT_BUFFER,
        System::{
            SystemInformation::{
                CacheData, CacheUnified, GetLogicalProcessorInformationEx, RelationCache,
                RelationGroup, RelationProcessorCore, GROUP_AFFINITY,
                LOGICAL_PROCESSOR_RELATIONSHIP, PROCESSOR_GROUP_INFO,
                SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX,
            },
            Threading::GetActiveProcessorCount,
        },
    },
};

/// Group number that makes `GetActiveProcessorCount` count every group.
const ALL_PROCESSOR_GROUPS: u16 = 0xffff;

/// Only the outermost cache level is used for spreading.
const LAST_LEVEL_CACHE: u8 = 3;

/// Reads processor, core, cache and group layout from the Windows API.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowsTopology;

impl TopologyProvider for WindowsTopology {
    fn active_processor_count(&self) -> Result<usize, PinningError> {
        // safety: GetActiveProcessorCount has no preconditions
        let count = unsafe { GetActiveProcessorCount(ALL_PROCESSOR_GROUPS) };
        if count == 0 {
            return Err(PinningError::Io(io::Error::last_os_error()));
        }
        Ok(count as usize)
    }

    fn core_masks(&self) -> Vec<Vec<CoreMask>> {
        let buffer = match ProcessorInformation::query(RelationProcessorCore) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!("Failed to query processor cores: {err}");
                return Vec::new();
            }
        };
        buffer
            .entries()
            // safety: RelationProcessorCore entries hold the Processor member,
            // followed by GroupCount GROUP_AFFINITY values
            .map(|entry| unsafe {
                let count = (*entry).Anonymous.Processor.GroupCount as usize;
                let masks = entry
                    .byte_add(offset_of!(
                        SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX,
                        Anonymous.Processor.GroupMask
                    ))
                    .cast::<GROUP_AFFINITY>();
                group_affinities(masks, count)
            })
            .collect()
    }

    fn cache_masks(&self) -> Vec<Vec<CoreMask>> {
        let buffer = match ProcessorInformation::query(RelationCache) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!("Failed to query caches: {err}");
                return Vec::new();
            }
        };
        buffer
            .entries()
            // safety: RelationCache entries hold the Cache member, followed by
            // GroupCount GROUP_AFFINITY values
            .filter_map(|entry| unsafe {
                let cache = &(*entry).Anonymous.Cache;
                let is_llc = cache.Level == LAST_LEVEL_CACHE
                    && (cache.Type == CacheData || cache.Type == CacheUnified);
                if !is_llc {
                    return None;
                }
                // Older systems report GroupCount 0 with a single GroupMask.
                let count = (cache.GroupCount as usize).max(1);
                let masks = entry
                    .byte_add(offset_of!(
                        SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX,
                        Anonymous.Cache.Anonymous.GroupMasks
                    ))
                    .cast::<GROUP_AFFINITY>();
                Some(group_affinities(masks, count))
            })
            .collect()
    }

    fn processor_groups(&self, processor_map: &[Vec<CoreMask>]) -> Vec<ProcessorGroup> {
        let buffer = match ProcessorInformation::query(RelationGroup) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!("Failed to query processor groups, deriving them from cores: {err}");
                return super::derive_group_map(processor_map);
            }
        };
        buffer
            .entries()
            // safety: RelationGroup entries hold the Group member, followed by
            // ActiveGroupCount PROCESSOR_GROUP_INFO values
            .flat_map(|entry| unsafe {
                let count = (*entry).Anonymous.Group.ActiveGroupCount as usize;
                let infos = entry
                    .byte_add(offset_of!(
                        SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX,
                        Anonymous.Group.GroupInfo
                    ))
                    .cast::<PROCESSOR_GROUP_INFO>();
                slice::from_raw_parts(infos, count)
                    .iter()
                    .map(|info| {
                        ProcessorGroup::new(
                            info.ActiveProcessorMask as u64,
                            u32::from(info.ActiveProcessorCount),
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

/// # Safety
///
/// `masks` must point to `count` initialized `GROUP_AFFINITY` values.
unsafe fn group_affinities(masks: *const GROUP_AFFINITY, count: usize) -> Vec<CoreMask> {
    // safety: guaranteed by the caller
    unsafe { slice::from_raw_parts(masks, count) }
        .iter()
        .map(|affinity| CoreMask::new(affinity.Mask as u64, affinity.Group))
        .collect()
}

/// Buffer filled by `GetLogicalProcessorInformationEx` for one relationship.
struct ProcessorInformation {
    // u64 storage keeps the entries 8-byte aligned.
    buffer: Vec<u64>,
    len: usize,
}

impl ProcessorInformation {
    fn query(relationship: LOGICAL_PROCESSOR_RELATIONSHIP) -> Result<Self, PinningError> {
        loop {
            let mut required: u32 = 0;
            // safety: a null buffer only asks for the required length
            let probe = unsafe {
                GetLogicalProcessorInformationEx(relationship, None, &mut required)
            };
            match probe {
                Ok(()) => {
                    return Ok(Self {
                        buffer: Vec::new(),
                        len: 0,
                    })
                }
                Err(err) if err.code() == ERROR_INSUFFICIENT_BUFFER.to_hresult() => {}
                Err(err) => return Err(io::Error::from(err).into()),
            }

            let words = (required as usize).div_ceil(size_of::<u64>());
            let mut buffer = vec![0u64; words];
            let mut len = required;
            // safety: buffer holds at least `len` writable bytes
            let result = unsafe {
                GetLogicalProcessorInformationEx(
                    relationship,
                    Some(buffer.as_mut_ptr().cast()),
                    &mut len,
                )
            };
            match result {
                Ok(()) => {
                    return Ok(Self {
                        buffer,
                        len: len as usize,
                    })
                }
                // Processors were added between the two calls.
                Err(err) if err.code() == ERROR_INSUFFICIENT_BUFFER.to_hresult() => continue,
                Err(err) => return Err(io::Error::from(err).into()),
            }
        }
    }

    /// Pointers to the variable-sized entries in the buffer.
    fn entries(
        &self,
    ) -> impl Iterator<Item = *const SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX> + '_ {
        let base = self.buffer.as_ptr().cast::<u8>();
        let mut offset = 0usize;
        std::iter::from_fn(move || {
            if offset >= self.len {
                return None;
            }
            // safety: offset stays within the `len` bytes written by the OS
            let entry = unsafe { base.add(offset) }
                .cast::<SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX>();
            // safety: every entry starts with a valid Size field
            let size = unsafe { ptr::addr_of!((*entry).Size).read() } as usize;
            if size == 0 {
                return None;
            }
            offset += size;
            Some(entry)
        })
    }
}
