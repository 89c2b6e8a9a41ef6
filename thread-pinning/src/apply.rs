//! Applying affinity vectors to threads through the OS.

use {
    crate::error::PinningError,
    log::{debug, warn},
    std::thread::JoinHandle,
};
#[cfg(target_os = "linux")]
use std::io;

/// Highest processor count a `cpu_set_t` can address.
///
/// glibc fixes the size of `cpu_set_t` at 1024 bits even though the kernel
/// supports more processors.
#[cfg(target_os = "linux")]
const CPU_SETSIZE: usize = 1024;

#[cfg(target_os = "linux")]
type RawThread = libc::pthread_t;
#[cfg(windows)]
type RawThread = std::os::windows::io::RawHandle;
#[cfg(not(any(target_os = "linux", windows)))]
type RawThread = ();

/// Native handle of a thread to pin.
///
/// The handle is borrowed: it is never joined, detached or closed here, and
/// the caller must keep the thread alive while it is being pinned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadHandle(RawThread);

// safety: a thread handle is an identifier the OS accepts from any thread
#[cfg(windows)]
unsafe impl Send for ThreadHandle {}
#[cfg(windows)]
unsafe impl Sync for ThreadHandle {}

impl ThreadHandle {
    /// Handle of the calling thread.
    #[cfg(target_os = "linux")]
    pub fn current() -> Self {
        // safety: pthread_self has no preconditions
        Self(unsafe { libc::pthread_self() })
    }

    /// Pseudo-handle of the calling thread, only meaningful on that thread.
    #[cfg(windows)]
    pub fn current() -> Self {
        // safety: GetCurrentThread has no preconditions
        Self(unsafe { windows::Win32::System::Threading::GetCurrentThread() }.0)
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    pub fn current() -> Self {
        Self(())
    }

    /// Wraps a native handle obtained elsewhere.
    ///
    /// # Safety
    ///
    /// `raw` must identify a live thread for as long as this handle is used.
    pub unsafe fn from_raw(raw: RawThread) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> RawThread {
        self.0
    }
}

#[cfg(target_os = "linux")]
impl<T> From<&JoinHandle<T>> for ThreadHandle {
    fn from(handle: &JoinHandle<T>) -> Self {
        use std::os::unix::thread::JoinHandleExt;
        Self(handle.as_pthread_t())
    }
}

#[cfg(windows)]
impl<T> From<&JoinHandle<T>> for ThreadHandle {
    fn from(handle: &JoinHandle<T>) -> Self {
        use std::os::windows::io::AsRawHandle;
        Self(handle.as_raw_handle())
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
impl<T> From<&JoinHandle<T>> for ThreadHandle {
    fn from(_handle: &JoinHandle<T>) -> Self {
        Self(())
    }
}

/// A thread that could not be pinned.
#[derive(Debug)]
pub struct PinFailure {
    /// Position of the thread in the list passed in.
    pub thread_index: usize,
    pub cpu: usize,
    pub error: PinningError,
}

/// Pins `threads[i]` to the single processor `cpus[i]`.
///
/// Every pair is attempted; the returned list holds the pairs the OS rejected.
/// Both slices must have the same length, extra entries of the longer slice
/// are ignored.
pub fn apply_affinity(threads: &[ThreadHandle], cpus: &[usize]) -> Vec<PinFailure> {
    threads
        .iter()
        .zip(cpus)
        .enumerate()
        .filter_map(|(thread_index, (&thread, &cpu))| {
            match set_thread_affinity(thread, cpu) {
                Ok(()) => {
                    debug!("Pinned thread {thread_index} to CPU {cpu}");
                    None
                }
                Err(error) => {
                    warn!("Failed to pin thread {thread_index} to CPU {cpu}: {error}");
                    Some(PinFailure {
                        thread_index,
                        cpu,
                        error,
                    })
                }
            }
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn set_thread_affinity(thread: ThreadHandle, cpu: usize) -> Result<(), PinningError> {
    if cpu >= CPU_SETSIZE {
        return Err(PinningError::InvalidCpu {
            cpu,
            max: CPU_SETSIZE - 1,
        });
    }

    // safety: cpu_set_t is a POD type, zero-initialization is standard
    let mut cpu_set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    // safety: cpu is below CPU_SETSIZE
    unsafe { libc::CPU_SET(cpu, &mut cpu_set) };

    // safety: the handle refers to a live thread and cpu_set is fully initialized
    let result = unsafe {
        libc::pthread_setaffinity_np(
            thread.0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &cpu_set,
        )
    };

    // pthread functions return the error number instead of setting errno.
    if result != 0 {
        return Err(PinningError::Io(io::Error::from_raw_os_error(result)));
    }
    Ok(())
}

#[cfg(windows)]
fn set_thread_affinity(thread: ThreadHandle, cpu: usize) -> Result<(), PinningError> {
    use windows::Win32::{
        Foundation::HANDLE, System::SystemInformation::GROUP_AFFINITY,
        System::Threading::SetThreadGroupAffinity,
    };

    let (group, bit) = crate::mask::split_index(cpu);
    let affinity = GROUP_AFFINITY {
        Mask: 1 << bit,
        Group: group,
        ..Default::default()
    };
    // safety: the handle refers to a live thread and affinity outlives the call
    let result = unsafe { SetThreadGroupAffinity(HANDLE(thread.0), &affinity, None) };
    if !result.as_bool() {
        return Err(PinningError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", windows)))]
fn set_thread_affinity(_thread: ThreadHandle, _cpu: usize) -> Result<(), PinningError> {
    Err(PinningError::NotSupported)
}

/// Processors `thread` is currently allowed to run on, ascending.
///
/// # Errors
///
/// Returns [`PinningError::Io`] if the OS query fails.
/// Returns [`PinningError::NotSupported`] on platforms other than Linux and Windows.
#[cfg(target_os = "linux")]
pub fn thread_affinity(thread: ThreadHandle) -> Result<Vec<usize>, PinningError> {
    // safety: cpu_set_t is a POD type, zero-initialization is standard
    let mut cpu_set: libc::cpu_set_t = unsafe { std::mem::zeroed() };

    // safety: the handle refers to a live thread and cpu_set is writable
    let result = unsafe {
        libc::pthread_getaffinity_np(
            thread.0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &mut cpu_set,
        )
    };
    if result != 0 {
        return Err(PinningError::Io(io::Error::from_raw_os_error(result)));
    }

    // safety: CPU_ISSET is safe with a valid cpu_set_t and cpu < CPU_SETSIZE
    Ok((0..CPU_SETSIZE)
        .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &cpu_set) })
        .collect())
}

#[cfg(windows)]
pub fn thread_affinity(thread: ThreadHandle) -> Result<Vec<usize>, PinningError> {
    use windows::Win32::{
        Foundation::HANDLE, System::SystemInformation::GROUP_AFFINITY,
        System::Threading::GetThreadGroupAffinity,
    };

    let mut affinity = GROUP_AFFINITY::default();
    // safety: the handle refers to a live thread and affinity is writable
    let result = unsafe { GetThreadGroupAffinity(HANDLE(thread.0), &mut affinity) };
    if !result.as_bool() {
        return Err(PinningError::Io(std::io::Error::last_os_error()));
    }
    Ok(crate::mask::CoreMask::new(affinity.Mask as u64, affinity.Group)
        .cpus()
        .collect())
}

#[cfg(not(any(target_os = "linux", windows)))]
pub fn thread_affinity(_thread: ThreadHandle) -> Result<Vec<usize>, PinningError> {
    Err(PinningError::NotSupported)
}
