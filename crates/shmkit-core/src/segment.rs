//! Backing storage for an allocator segment
//!
//! A segment is one contiguous, writable block of bytes. [`ShmSegment`] maps
//! POSIX shared memory identified by a small integer key; [`HeapSegment`] is
//! a private heap block honouring the same contract, used for single-process
//! allocators and for relocating snapshots of a shared segment.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use shared_memory::{Shmem, ShmemConf};

use crate::{Error, Result};

/// Alignment of every segment base address
pub const SEGMENT_ALIGN: usize = 64;

/// Contiguous memory an allocator can manage.
///
/// # Safety
///
/// `as_ptr()` must return a pointer valid for reads and writes of `len()`
/// bytes, aligned to at least `align_of::<usize>()`, and stable for the
/// lifetime of the value.
pub unsafe trait Segment {
    fn as_ptr(&self) -> *mut u8;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// OS shared memory id for a segment key.
pub fn os_id(key: u32) -> String {
    format!("/shmkit_{:08x}", key)
}

/// Shared memory region wrapper
pub struct ShmSegment {
    inner: Shmem,
    key: u32,
    size: usize,
    created: bool,
}

impl ShmSegment {
    /// Create a new zero-filled shared memory region. Fails if the key is taken.
    pub fn create(key: u32, size: usize) -> Result<Self> {
        let mut shmem = ShmemConf::new()
            .size(size)
            .os_id(os_id(key))
            .create()
            .map_err(|e| Error::SharedMemory(e.to_string()))?;

        // Dropping a handle only unmaps; the name outlives this process.
        shmem.set_owner(false);

        Ok(Self {
            inner: shmem,
            key,
            size,
            created: true,
        })
    }

    /// Open an existing shared memory region
    pub fn open(key: u32) -> Result<Self> {
        let mut shmem = ShmemConf::new()
            .os_id(os_id(key))
            .open()
            .map_err(|e| Error::SharedMemory(e.to_string()))?;
        shmem.set_owner(false);

        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            key,
            size,
            created: false,
        })
    }

    /// Unlink the OS name for `key`. Existing mappings stay valid.
    pub fn remove(key: u32) -> Result<()> {
        let mut shmem = ShmemConf::new()
            .os_id(os_id(key))
            .open()
            .map_err(|e| Error::SharedMemory(e.to_string()))?;
        shmem.set_owner(true);
        drop(shmem);
        Ok(())
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    /// Whether this handle created the region (as opposed to opening it)
    pub fn created(&self) -> bool {
        self.created
    }
}

// Safety: the mapping is plain memory; concurrent access is serialized by the
// locks stored inside it.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

unsafe impl Segment for ShmSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.inner.as_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }
}

/// Zeroed, aligned heap block.
pub struct HeapSegment {
    base: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl HeapSegment {
    pub fn new_zeroed(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), SEGMENT_ALIGN)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr)
            .ok_or_else(|| Error::SharedMemory(format!("heap allocation of {} bytes failed", size)))?;
        Ok(Self {
            base,
            len: size,
            layout,
        })
    }

    /// Copy `bytes` into a fresh heap block at a new address.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let seg = Self::new_zeroed(bytes.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), seg.base.as_ptr(), bytes.len());
        }
        Ok(seg)
    }
}

unsafe impl Segment for HeapSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}
