//! Segment allocator
//!
//! Carves one [`Segment`] into header-prefixed blocks. Free blocks form a
//! doubly linked list kept in address order; allocation is first-fit and
//! takes the chunk from the high-address end of the free block it splits, so
//! the low remainder stays linked in place. Freeing reinserts the block at its
//! address position and merges it with byte-contiguous neighbours.
//!
//! All links are [`RelPtr`]s and "null" is the address of a reserved byte in
//! the segment header, so every process mapping the segment, at whatever base
//! address, sees the same structure.
//!
//! Layout:
//!
//! ```text
//! +----------------+--------------+-----------------------------+
//! | SegmentHeader  | BlockHeader  |          remainder          |
//! +----------------+--------------+-----------------------------+
//!                  <------------ initial free block ------------>
//! ```

use std::io;
use std::mem::{align_of, offset_of, size_of};
use std::ptr::{self, NonNull};

use tracing::{debug, trace, warn};

use crate::relptr::RelPtr;
use crate::segment::{HeapSegment, Segment, ShmSegment};
use crate::sync::RawSharedMutex;
use crate::{Error, Result};

/// Every allocation is rounded up to the platform pointer width.
pub const ALIGN: usize = size_of::<usize>();

/// Longest name accepted by the registry
pub const MAX_NAME_LEN: usize = 255;

const MAGIC: u32 = 0x5348_4B54; // "SHKT"
const VERSION: u32 = 1;

/// Header at offset 0 of every segment
#[repr(C)]
struct SegmentHeader {
    magic: u32,
    version: u32,
    lock: RawSharedMutex,
    free_head: RelPtr<BlockHeader>,
    free_tail: RelPtr<BlockHeader>,
    registry_head: RelPtr<RegistryEntry>,
    registry_tail: RelPtr<RegistryEntry>,
    /// Usable bytes following the header
    size: usize,
    bytes_allocated: usize,
    blocks_allocated: usize,
    /// Target of every "null" relative pointer
    null: u8,
}

/// Precedes every block, allocated or free.
#[repr(C)]
struct BlockHeader {
    prev: RelPtr<BlockHeader>,
    next: RelPtr<BlockHeader>,
    /// Total bytes including this header
    size: usize,
}

/// Registry directory entry. Allocated from the segment like any user block.
#[repr(C)]
struct RegistryEntry {
    prev: RelPtr<RegistryEntry>,
    next: RelPtr<RegistryEntry>,
    item: RelPtr<u8>,
    name: RelPtr<u8>,
    name_len: usize,
}

pub const HEADER_SIZE: usize = size_of::<SegmentHeader>();
pub const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE % ALIGN == 0);
const _: () = assert!(BLOCK_HEADER_SIZE % ALIGN == 0);

/// Round `size` up to [`ALIGN`].
pub const fn align_up(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

/// Byte range of a block, as offsets from the segment base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// How a freed block joins its address-order neighbours on the free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Merge {
    /// Linked as a separate block
    None,
    /// Absorbed into the preceding free block
    Prev,
    /// Absorbs the following free block
    Next,
    /// Preceding block absorbs both the freed and the following block
    Both,
}

/// Decide how `freed` coalesces with the free blocks around it.
pub(crate) fn coalesce(prev: Option<Span>, freed: Span, next: Option<Span>) -> Merge {
    let with_prev = prev.is_some_and(|p| p.end() == freed.start);
    let with_next = next.is_some_and(|n| freed.end() == n.start);
    match (with_prev, with_next) {
        (false, false) => Merge::None,
        (true, false) => Merge::Prev,
        (false, true) => Merge::Next,
        (true, true) => Merge::Both,
    }
}

/// Allocator counters at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorStats {
    /// Usable segment size
    pub size: usize,
    pub bytes_allocated: usize,
    pub blocks_allocated: usize,
    /// Blocks on the free list
    pub free_blocks: usize,
    /// `size - bytes_allocated - blocks_allocated * BLOCK_HEADER_SIZE`
    pub bytes_remaining: usize,
    pub registered_objects: usize,
}

/// Capabilities shared by every allocator backend.
///
/// Lists and queues hold a `&dyn SharedAllocator`, so they work the same on a
/// shared memory segment and on a heap segment.
pub trait SharedAllocator {
    /// Allocate `size` bytes, rounded up to [`ALIGN`].
    fn allocate(&self, size: usize) -> Result<NonNull<u8>>;

    /// Return a block to the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`SharedAllocator::allocate`] on this
    /// segment and must not have been freed since.
    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()>;

    /// Publish an allocated block under a well-known name.
    fn register_object(&self, name: &str, item: NonNull<u8>) -> Result<()>;

    /// Remove a registration and hand the item back. The item is not freed.
    fn deregister_object(&self, name: &str) -> Result<NonNull<u8>>;

    fn find_registered_object(&self, name: &str) -> Option<NonNull<u8>>;

    /// Whether `ptr` points into the usable part of the segment.
    fn contains(&self, ptr: *const u8) -> bool;

    fn stats(&self) -> AllocatorStats;

    /// Human-readable listing of counters, free blocks and registered names.
    fn dump(&self, out: &mut dyn io::Write) -> io::Result<()>;

    fn blocks_allocated(&self) -> usize {
        self.stats().blocks_allocated
    }

    fn bytes_allocated(&self) -> usize {
        self.stats().bytes_allocated
    }

    fn segment_size(&self) -> usize {
        self.stats().size
    }

    fn free_blocks(&self) -> usize {
        self.stats().free_blocks
    }

    fn bytes_remaining(&self) -> usize {
        self.stats().bytes_remaining
    }
}

/// Typed helpers over any [`SharedAllocator`].
pub trait SharedAllocatorExt: SharedAllocator {
    /// Allocate room for a `T` and move `value` into it.
    fn allocate_value<T>(&self, value: T) -> Result<NonNull<T>> {
        if align_of::<T>() > ALIGN {
            return Err(Error::InvalidArgument(format!(
                "alignment {} exceeds segment alignment {}",
                align_of::<T>(),
                ALIGN
            )));
        }
        let ptr = self.allocate(size_of::<T>())?.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Ok(ptr)
    }
}

impl<A: SharedAllocator + ?Sized> SharedAllocatorExt for A {}

/// Mapping length for `size` usable bytes.
fn total_len(size: usize) -> Result<usize> {
    HEADER_SIZE.checked_add(size).ok_or_else(|| {
        Error::InvalidArgument(format!("segment size {} is too large", size))
    })
}

/// Validate a registry name.
pub(crate) fn check_name(name: &str, max: usize) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("empty name".to_string()));
    }
    if name.len() > max {
        return Err(Error::InvalidArgument(format!(
            "name longer than {} bytes: {}",
            max, name
        )));
    }
    Ok(())
}

/// Allocator over a segment
pub struct Allocator<S: Segment> {
    segment: S,
    header: NonNull<SegmentHeader>,
}

/// Allocator on POSIX shared memory
pub type ShmAllocator = Allocator<ShmSegment>;

/// Allocator on a private heap block
pub type HeapAllocator = Allocator<HeapSegment>;

// Safety: all shared state lives in the segment and is guarded by its lock.
unsafe impl<S: Segment + Send> Send for Allocator<S> {}
unsafe impl<S: Segment + Sync> Sync for Allocator<S> {}

impl Allocator<ShmSegment> {
    /// Map a fresh segment of `size` usable bytes under `key`.
    pub fn create(size: usize, key: u32) -> Result<Self> {
        let segment = ShmSegment::create(key, total_len(size)?)?;
        let alloc = Self::format(segment)?;
        debug!(key, size = alloc.segment_size(), "created shared segment");
        Ok(alloc)
    }

    /// Map the segment previously created under `key`.
    pub fn attach(key: u32) -> Result<Self> {
        let segment = ShmSegment::open(key)?;
        let alloc = Self::attach_segment(segment)?;
        debug!(key, size = alloc.segment_size(), "attached shared segment");
        Ok(alloc)
    }
}

impl Allocator<HeapSegment> {
    /// Allocator with `size` usable bytes on the process heap.
    pub fn new(size: usize) -> Result<Self> {
        Self::format(HeapSegment::new_zeroed(total_len(size)?)?)
    }
}

impl<S: Segment> Allocator<S> {
    /// Initialise a segment: header, one free block spanning the usable
    /// bytes, empty registry.
    pub fn format(segment: S) -> Result<Self> {
        let len = segment.len();
        if len < HEADER_SIZE + BLOCK_HEADER_SIZE {
            return Err(Error::InvalidArgument(format!(
                "segment of {} bytes is too small",
                len
            )));
        }
        let size = (len - HEADER_SIZE) & !(ALIGN - 1);
        let header = NonNull::new(segment.as_ptr() as *mut SegmentHeader)
            .ok_or_else(|| Error::SharedMemory("null segment base".to_string()))?;

        unsafe {
            let hdr = header.as_ptr();
            ptr::write_bytes(hdr as *mut u8, 0, HEADER_SIZE);
            (*hdr).version = VERSION;
            (*hdr).lock.init();
            (*hdr).size = size;

            let null = ptr::addr_of_mut!((*hdr).null);
            let first = (hdr as *mut u8).add(HEADER_SIZE) as *mut BlockHeader;
            (*first).prev.set(null);
            (*first).next.set(null);
            (*first).size = size;
            (*hdr).free_head.set(first);
            (*hdr).free_tail.set(first);
            (*hdr).registry_head.set(null);
            (*hdr).registry_tail.set(null);

            // Attachers treat the segment as initialised once the magic shows.
            std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
            ptr::write_volatile(ptr::addr_of_mut!((*hdr).magic), MAGIC);
        }

        Ok(Self { segment, header })
    }

    /// View an already initialised segment without touching its state.
    pub fn attach_segment(segment: S) -> Result<Self> {
        let len = segment.len();
        if len < HEADER_SIZE {
            return Err(Error::SharedMemory(format!(
                "segment of {} bytes has no header",
                len
            )));
        }
        let header = NonNull::new(segment.as_ptr() as *mut SegmentHeader)
            .ok_or_else(|| Error::SharedMemory("null segment base".to_string()))?;

        let (magic, version, size) = unsafe {
            let hdr = header.as_ptr();
            ((*hdr).magic, (*hdr).version, (*hdr).size)
        };
        if magic != MAGIC {
            return Err(Error::SharedMemory("invalid magic number".to_string()));
        }
        if version != VERSION {
            return Err(Error::SharedMemory(format!(
                "version mismatch: expected {}, got {}",
                VERSION, version
            )));
        }
        if HEADER_SIZE.checked_add(size).map_or(true, |total| total > len) {
            return Err(Error::SharedMemory(format!(
                "segment header claims {} bytes, mapping has {}",
                size,
                len - HEADER_SIZE
            )));
        }

        Ok(Self { segment, header })
    }

    /// Unmap the segment for this process. Other attached processes and the
    /// OS name are unaffected.
    pub fn destroy(self) {
        debug!(size = self.segment_size(), "detaching segment");
        drop(self);
    }

    pub fn segment(&self) -> &S {
        &self.segment
    }

    /// Copy of the header and usable bytes, taken under the segment lock.
    /// The copy's lock word is cleared so it can be attached elsewhere.
    pub fn snapshot(&self) -> Vec<u8> {
        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        let len = HEADER_SIZE + unsafe { (*hdr).size };
        let mut bytes = vec![0u8; len];
        unsafe { ptr::copy_nonoverlapping(self.base(), bytes.as_mut_ptr(), len) };
        let lock = offset_of!(SegmentHeader, lock);
        bytes[lock..lock + size_of::<RawSharedMutex>()].fill(0);
        bytes
    }

    #[inline]
    fn hdr(&self) -> *mut SegmentHeader {
        self.header.as_ptr()
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.header.as_ptr() as *mut u8
    }

    #[inline]
    fn null(&self) -> *mut u8 {
        unsafe { ptr::addr_of_mut!((*self.hdr()).null) }
    }

    #[inline]
    fn offset_of(&self, p: *const u8) -> usize {
        p as usize - self.base() as usize
    }

    /// `None` for the null sentinel.
    #[inline]
    fn non_null<T>(&self, p: *mut T) -> Option<*mut T> {
        if p as *mut u8 == self.null() {
            None
        } else {
            Some(p)
        }
    }

    #[inline]
    fn or_null<T>(&self, p: Option<*mut T>) -> *mut u8 {
        p.map_or(self.null(), |p| p as *mut u8)
    }

    unsafe fn span(&self, block: *mut BlockHeader) -> Span {
        Span {
            start: self.offset_of(block as *const u8),
            len: (*block).size,
        }
    }

    /// Unlink a free block. Caller holds the lock.
    unsafe fn unlink_free(&self, block: *mut BlockHeader) {
        let hdr = self.hdr();
        let prev = self.non_null((*block).prev.get());
        let next = self.non_null((*block).next.get());
        match prev {
            Some(p) => (*p).next.set(self.or_null(next)),
            None => (*hdr).free_head.set(self.or_null(next)),
        }
        match next {
            Some(n) => (*n).prev.set(self.or_null(prev)),
            None => (*hdr).free_tail.set(self.or_null(prev)),
        }
    }

    /// Link a block between two adjacent free-list positions. Either side may
    /// be absent (head, tail or empty list). Caller holds the lock.
    unsafe fn link_free(
        &self,
        prev: Option<*mut BlockHeader>,
        block: *mut BlockHeader,
        next: Option<*mut BlockHeader>,
    ) {
        let hdr = self.hdr();
        (*block).prev.set(self.or_null(prev));
        (*block).next.set(self.or_null(next));
        match prev {
            Some(p) => (*p).next.set(block),
            None => (*hdr).free_head.set(block),
        }
        match next {
            Some(n) => (*n).prev.set(block),
            None => (*hdr).free_tail.set(block),
        }
    }

    /// First-fit allocation. Caller holds the lock.
    unsafe fn allocate_locked(&self, size: usize) -> Option<NonNull<u8>> {
        let hdr = self.hdr();
        let need = size
            .checked_add(ALIGN - 1)?
            .checked_add(BLOCK_HEADER_SIZE)?
            & !(ALIGN - 1);

        let mut cur = self.non_null((*hdr).free_head.get());
        while let Some(block) = cur {
            let have = (*block).size;
            if have < need {
                cur = self.non_null((*block).next.get());
                continue;
            }
            let taken = if have - need < BLOCK_HEADER_SIZE {
                // Too little left over to stand alone: hand out the whole block.
                self.unlink_free(block);
                block
            } else {
                // Carve from the top; the remainder keeps its place in the list.
                (*block).size = have - need;
                let taken = (block as *mut u8).add(have - need) as *mut BlockHeader;
                (*taken).size = need;
                taken
            };

            let null = self.null();
            (*taken).prev.set(null);
            (*taken).next.set(null);
            (*hdr).bytes_allocated += (*taken).size - BLOCK_HEADER_SIZE;
            (*hdr).blocks_allocated += 1;
            return NonNull::new((taken as *mut u8).add(BLOCK_HEADER_SIZE));
        }
        None
    }

    /// Check that `ptr` is the payload of a plausible block.
    fn block_of(&self, ptr: NonNull<u8>) -> Result<*mut BlockHeader> {
        let addr = ptr.as_ptr() as usize;
        let first = self.base() as usize + HEADER_SIZE + BLOCK_HEADER_SIZE;
        let end = self.base() as usize + HEADER_SIZE + unsafe { (*self.hdr()).size };
        if addr < first || addr > end || addr % ALIGN != 0 {
            return Err(Error::InvalidArgument(format!(
                "pointer {:p} is not a block of this segment",
                ptr
            )));
        }
        let block = (addr - BLOCK_HEADER_SIZE) as *mut BlockHeader;
        let size = unsafe { (*block).size };
        if size < BLOCK_HEADER_SIZE || size > end - (addr - BLOCK_HEADER_SIZE) {
            return Err(Error::InvalidArgument(format!(
                "block at {:p} has corrupt size {}",
                ptr, size
            )));
        }
        Ok(block)
    }

    /// Address-ordered reinsertion with coalescing. Caller holds the lock.
    unsafe fn free_locked(&self, ptr: NonNull<u8>) -> Result<()> {
        let hdr = self.hdr();
        let block = self.block_of(ptr)?;
        let freed = self.span(block);

        // First free block above the freed one; its predecessor is below.
        let mut next = self.non_null((*hdr).free_head.get());
        while let Some(n) = next {
            if n as usize > block as usize {
                break;
            }
            next = self.non_null((*n).next.get());
        }
        let prev = match next {
            Some(n) => self.non_null((*n).prev.get()),
            None => self.non_null((*hdr).free_tail.get()),
        };

        let prev_span = prev.map(|p| self.span(p));
        let next_span = next.map(|n| self.span(n));
        if prev_span.is_some_and(|p| p.end() > freed.start)
            || next_span.is_some_and(|n| freed.end() > n.start)
        {
            return Err(Error::InvalidArgument(format!(
                "block at {:p} overlaps the free list (double free?)",
                ptr
            )));
        }

        match coalesce(prev_span, freed, next_span) {
            Merge::None => self.link_free(prev, block, next),
            Merge::Prev => {
                if let Some(p) = prev {
                    (*p).size += freed.len;
                }
            }
            Merge::Next => {
                if let Some(n) = next {
                    let after = self.non_null((*n).next.get());
                    self.unlink_free(n);
                    (*block).size += (*n).size;
                    self.link_free(prev, block, after);
                }
            }
            Merge::Both => {
                if let (Some(p), Some(n)) = (prev, next) {
                    (*p).size += freed.len + (*n).size;
                    self.unlink_free(n);
                }
            }
        }

        (*hdr).bytes_allocated -= freed.len - BLOCK_HEADER_SIZE;
        (*hdr).blocks_allocated -= 1;
        Ok(())
    }

    /// Registry lookup. Caller holds the lock.
    unsafe fn find_locked(&self, name: &str) -> Option<*mut RegistryEntry> {
        let mut cur = self.non_null((*self.hdr()).registry_head.get());
        while let Some(entry) = cur {
            let stored =
                std::slice::from_raw_parts((*entry).name.get() as *const u8, (*entry).name_len);
            if stored == name.as_bytes() {
                return Some(entry);
            }
            cur = self.non_null((*entry).next.get());
        }
        None
    }

    unsafe fn walk_free<F: FnMut(*mut BlockHeader)>(&self, mut f: F) {
        let mut cur = self.non_null((*self.hdr()).free_head.get());
        while let Some(block) = cur {
            f(block);
            cur = self.non_null((*block).next.get());
        }
    }

    unsafe fn walk_registry<F: FnMut(*mut RegistryEntry)>(&self, mut f: F) {
        let mut cur = self.non_null((*self.hdr()).registry_head.get());
        while let Some(entry) = cur {
            f(entry);
            cur = self.non_null((*entry).next.get());
        }
    }

    unsafe fn stats_locked(&self) -> AllocatorStats {
        let hdr = self.hdr();
        let mut free_blocks = 0;
        self.walk_free(|_| free_blocks += 1);
        let mut registered_objects = 0;
        self.walk_registry(|_| registered_objects += 1);

        let size = (*hdr).size;
        let bytes_allocated = (*hdr).bytes_allocated;
        let blocks_allocated = (*hdr).blocks_allocated;
        AllocatorStats {
            size,
            bytes_allocated,
            blocks_allocated,
            free_blocks,
            bytes_remaining: size
                .saturating_sub(bytes_allocated)
                .saturating_sub(blocks_allocated * BLOCK_HEADER_SIZE),
            registered_objects,
        }
    }
}

impl<S: Segment> SharedAllocator for Allocator<S> {
    fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized allocation".to_string()));
        }
        let ptr = {
            let _guard = unsafe { (*self.hdr()).lock.lock() };
            unsafe { self.allocate_locked(size) }
        };
        match ptr {
            Some(ptr) => {
                trace!(size, aligned = align_up(size), "allocated block");
                Ok(ptr)
            }
            None => {
                warn!(size, "segment exhausted");
                Err(Error::NoSpace { requested: size })
            }
        }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        let _guard = (*self.hdr()).lock.lock();
        self.free_locked(ptr)?;
        trace!(ptr = ?ptr, "freed block");
        Ok(())
    }

    fn register_object(&self, name: &str, item: NonNull<u8>) -> Result<()> {
        check_name(name, MAX_NAME_LEN)?;
        if !self.contains(item.as_ptr()) {
            return Err(Error::InvalidArgument(format!(
                "{:p} is outside the segment",
                item
            )));
        }

        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        unsafe {
            if self.find_locked(name).is_some() {
                return Err(Error::AlreadyRegistered(name.to_string()));
            }
            let entry = self
                .allocate_locked(size_of::<RegistryEntry>())
                .ok_or(Error::NoSpace {
                    requested: size_of::<RegistryEntry>(),
                })?;
            let stored = match self.allocate_locked(name.len()) {
                Some(stored) => stored,
                None => {
                    self.free_locked(entry)?;
                    return Err(Error::NoSpace {
                        requested: name.len(),
                    });
                }
            };
            ptr::copy_nonoverlapping(name.as_ptr(), stored.as_ptr(), name.len());

            let entry = entry.as_ptr() as *mut RegistryEntry;
            let tail = self.non_null((*hdr).registry_tail.get());
            (*entry).item.set(item.as_ptr());
            (*entry).name.set(stored.as_ptr());
            (*entry).name_len = name.len();
            (*entry).prev.set(self.or_null(tail));
            (*entry).next.set(self.null());
            match tail {
                Some(t) => (*t).next.set(entry),
                None => (*hdr).registry_head.set(entry),
            }
            (*hdr).registry_tail.set(entry);
        }
        debug!(name, "registered object");
        Ok(())
    }

    fn deregister_object(&self, name: &str) -> Result<NonNull<u8>> {
        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        unsafe {
            let entry = self
                .find_locked(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;

            let prev = self.non_null((*entry).prev.get());
            let next = self.non_null((*entry).next.get());
            match prev {
                Some(p) => (*p).next.set(self.or_null(next)),
                None => (*hdr).registry_head.set(self.or_null(next)),
            }
            match next {
                Some(n) => (*n).prev.set(self.or_null(prev)),
                None => (*hdr).registry_tail.set(self.or_null(prev)),
            }

            let item = (*entry).item.get();
            let stored = (*entry).name.get();
            if let Some(stored) = NonNull::new(stored) {
                self.free_locked(stored)?;
            }
            if let Some(entry) = NonNull::new(entry as *mut u8) {
                self.free_locked(entry)?;
            }
            debug!(name, "deregistered object");
            NonNull::new(item).ok_or_else(|| Error::NotFound(name.to_string()))
        }
    }

    fn find_registered_object(&self, name: &str) -> Option<NonNull<u8>> {
        let _guard = unsafe { (*self.hdr()).lock.lock() };
        unsafe {
            self.find_locked(name)
                .and_then(|entry| NonNull::new((*entry).item.get()))
        }
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base() as usize + HEADER_SIZE;
        let end = start + unsafe { (*self.hdr()).size };
        (start..end).contains(&(ptr as usize))
    }

    fn stats(&self) -> AllocatorStats {
        let _guard = unsafe { (*self.hdr()).lock.lock() };
        unsafe { self.stats_locked() }
    }

    fn dump(&self, out: &mut dyn io::Write) -> io::Result<()> {
        // Collect under the lock, write after releasing it.
        let (stats, blocks, names) = {
            let _guard = unsafe { (*self.hdr()).lock.lock() };
            unsafe {
                let stats = self.stats_locked();
                let mut blocks = Vec::new();
                self.walk_free(|b| blocks.push(self.span(b)));
                let mut names = Vec::new();
                self.walk_registry(|e| {
                    let bytes =
                        std::slice::from_raw_parts((*e).name.get() as *const u8, (*e).name_len);
                    names.push(String::from_utf8_lossy(bytes).into_owned());
                });
                (stats, blocks, names)
            }
        };

        let overhead = stats.blocks_allocated * BLOCK_HEADER_SIZE;
        writeln!(out, "Allocator[")?;
        writeln!(out, "\tsize = {}", stats.size)?;
        writeln!(out, "\tbytes allocated = {}", stats.bytes_allocated)?;
        writeln!(out, "\tblocks allocated = {}", stats.blocks_allocated)?;
        writeln!(out, "\tbytes remaining = {}", stats.bytes_remaining)?;
        writeln!(out, "\toverhead/block = {} bytes", BLOCK_HEADER_SIZE)?;
        if stats.size > 0 {
            writeln!(
                out,
                "\tefficiency = {:.2}",
                (1.0 - overhead as f64 / stats.size as f64) * 100.0
            )?;
        }
        writeln!(out, "]")?;
        writeln!(out, "Blocks on free list ({}):", blocks.len())?;
        for span in &blocks {
            writeln!(
                out,
                "\tBlock[begin: {:#x}, end: {:#x}, size: {}]",
                span.start,
                span.end(),
                span.len
            )?;
        }
        writeln!(out, "Registered objects ({}):", names.len())?;
        for name in &names {
            writeln!(out, "\tRegistered Object[name: {}]", name)?;
        }
        Ok(())
    }
}
