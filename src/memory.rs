//! Memory accounting: a counting global allocator and the process resident set size

use std::{
    alloc::{GlobalAlloc, Layout, System},
    fmt::{self, Display},
    sync::atomic::{AtomicUsize, Ordering},
};

use thiserror::Error;

/// Errors when reading process memory statistics
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Failed to read process status")]
    Io(#[from] std::io::Error),
    #[error("Missing or malformed field {field} in process status")]
    Parse { field: &'static str },
    #[error("Process memory statistics are not available on this platform")]
    Unsupported,
}

/// Wraps the system allocator and counts live heap bytes
///
/// Register it in a binary with `#[global_allocator]`; all counters are relaxed atomics,
/// so readings taken while other threads allocate are approximate.
pub struct TrackingAllocator {
    current: AtomicUsize,
    peak: AtomicUsize,
    n_allocations: AtomicUsize,
}

impl TrackingAllocator {
    pub const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            n_allocations: AtomicUsize::new(0),
        }
    }

    /// Live heap bytes
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Highest live heap bytes since the last [`TrackingAllocator::reset_peak`]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Total number of allocations served
    pub fn n_allocations(&self) -> usize {
        self.n_allocations.load(Ordering::Relaxed)
    }

    /// Restarts peak tracking from the current usage, which is returned
    pub fn reset_peak(&self) -> usize {
        let current = self.current();
        self.peak.store(current, Ordering::Relaxed);
        current
    }

    fn record_alloc(&self, size: usize) {
        let now = self.current.fetch_add(size, Ordering::Relaxed) + size;
        self.peak.fetch_max(now, Ordering::Relaxed);
        self.n_allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dealloc(&self, size: usize) {
        self.current.fetch_sub(size, Ordering::Relaxed);
    }
}

impl Default for TrackingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: every call is forwarded to `System` unchanged, only the bookkeeping is added
unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            self.record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            self.record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
        self.record_dealloc(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            self.record_dealloc(layout.size());
            self.record_alloc(new_size);
        }
        new_ptr
    }
}

/// Resident set size of the process, as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessMemory {
    /// current resident set size in bytes (`VmRSS`)
    pub rss: u64,
    /// high-water mark of the resident set size in bytes (`VmHWM`)
    pub peak_rss: u64,
}

impl ProcessMemory {
    /// Reads `/proc/self/status`
    #[cfg(target_os = "linux")]
    pub fn read() -> Result<Self, MemoryError> {
        let status = std::fs::read_to_string("/proc/self/status")?;
        Self::parse_status(&status)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn read() -> Result<Self, MemoryError> {
        Err(MemoryError::Unsupported)
    }

    /// Like [`ProcessMemory::read`] but logs and discards failures
    pub fn sample() -> Option<Self> {
        match Self::read() {
            Ok(memory) => Some(memory),
            Err(e) => {
                log::debug!("process memory unavailable: {}", e);
                None
            }
        }
    }

    fn parse_status(status: &str) -> Result<Self, MemoryError> {
        Ok(Self {
            rss: status_field_bytes(status, "VmRSS")?,
            peak_rss: status_field_bytes(status, "VmHWM")?,
        })
    }
}

/// Parses a line such as `VmRSS:	  123456 kB`
fn status_field_bytes(status: &str, field: &'static str) -> Result<u64, MemoryError> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(field)?.strip_prefix(':'))
        .and_then(|rest| rest.trim().strip_suffix("kB"))
        .and_then(|kb| kb.trim().parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .ok_or(MemoryError::Parse { field })
}

/// Byte count rendered in MiB, the unit memory profilers usually report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiB(pub u64);

impl Display for MiB {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} MiB", self.0 as f64 / (1024.0 * 1024.0))
    }
}

/// Signed byte difference rendered in MiB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiBDelta(pub i64);

impl Display for MiBDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+.1} MiB", self.0 as f64 / (1024.0 * 1024.0))
    }
}
