//! Native code cache
//!
//! Machine code lives in anonymous mappings that are writable while the
//! code is copied in and executable afterwards, never both. The cache owns
//! the installed entry of every region; a retired entry waits in a pending
//! queue until no frame holds it any more.

use std::collections::HashMap;
use std::io;
use std::ptr::NonNull;
use std::rc::Rc;

use core_types::RegionId;
use thiserror::Error;
use tracing::debug;

use crate::compiled_code::CompiledEntry;

/// Executable memory failures
#[derive(Debug, Error)]
pub enum CacheError {
    /// Nothing to map
    #[error("empty code buffer")]
    Empty,
    /// `mmap` failed
    #[error("mmap of {len} bytes failed: {source}")]
    Map {
        /// Requested length
        len: usize,
        /// OS error
        source: io::Error,
    },
    /// `mprotect` to read+execute failed
    #[error("mprotect to read+execute failed: {0}")]
    Protect(io::Error),
}

/// A read+execute mapping holding one region's machine code
#[derive(Debug)]
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    mapped: usize,
    len: usize,
}

impl ExecutableMemory {
    /// Map pages, copy `code` in and flip them to read+execute.
    ///
    /// # Errors
    ///
    /// Fails for empty code or when the kernel refuses the mapping or the
    /// protection change.
    pub fn new(code: &[u8]) -> Result<Self, CacheError> {
        if code.is_empty() {
            return Err(CacheError::Empty);
        }
        let page = page_size();
        let mapped = code.len().div_ceil(page) * page;

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(CacheError::Map {
                len: mapped,
                source: io::Error::last_os_error(),
            });
        }
        let Some(ptr) = NonNull::new(raw.cast::<u8>()) else {
            return Err(CacheError::Map {
                len: mapped,
                source: io::Error::from(io::ErrorKind::OutOfMemory),
            });
        };
        let memory = Self {
            ptr,
            mapped,
            len: code.len(),
        };

        // SAFETY: the mapping is at least `code.len()` bytes, writable, and
        // cannot overlap the source slice.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), memory.ptr.as_ptr(), code.len());
        }
        // SAFETY: protects exactly the mapping created above.
        let rc = unsafe {
            libc::mprotect(
                memory.ptr.as_ptr().cast(),
                memory.mapped,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            // `memory` unmaps on drop
            return Err(CacheError::Protect(io::Error::last_os_error()));
        }
        Ok(memory)
    }

    /// Entry address
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Code length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; empty code is rejected at construction
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes mapped, a whole number of pages
    pub fn mapped_len(&self) -> usize {
        self.mapped
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        // SAFETY: unmaps the mapping owned by this value exactly once.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.mapped);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|&s| s > 0).unwrap_or(4096)
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries ever inserted
    pub inserted: u64,
    /// Entries retired (replaced or deoptimized)
    pub retired: u64,
    /// Retired entries whose memory was released
    pub reclaimed: u64,
}

/// Installed entries by region, plus retired entries still referenced
#[derive(Debug, Default)]
pub struct CodeCache {
    live: HashMap<RegionId, Rc<CompiledEntry>>,
    pending: Vec<Rc<CompiledEntry>>,
    stats: CacheStats,
}

impl CodeCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an entry; the region's previous entry is retired.
    pub fn insert(&mut self, entry: Rc<CompiledEntry>) {
        self.stats.inserted += 1;
        if let Some(old) = self.live.insert(entry.region(), entry) {
            self.stats.retired += 1;
            self.pending.push(old);
        }
        self.reclaim();
    }

    /// Stop tracking a region's entry as live.
    pub fn retire(&mut self, region: RegionId) {
        if let Some(old) = self.live.remove(&region) {
            self.stats.retired += 1;
            self.pending.push(old);
        }
        self.reclaim();
    }

    /// Release retired entries nobody references; returns how many.
    pub fn reclaim(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|entry| Rc::strong_count(entry) > 1);
        let released = before - self.pending.len();
        if released > 0 {
            self.stats.reclaimed += released as u64;
            debug!(released, pending = self.pending.len(), "reclaimed native code");
        }
        released
    }

    /// Installed entry of a region
    pub fn get(&self, region: RegionId) -> Option<&Rc<CompiledEntry>> {
        self.live.get(&region)
    }

    /// Number of installed entries
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether nothing is installed
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Retired entries still referenced by a frame
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Counters
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
