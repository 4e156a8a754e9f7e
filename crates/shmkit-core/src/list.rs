//! Intrusive shared list
//!
//! The list owns no node storage. Each record that takes part embeds a
//! [`ListNode`] as its first field and is allocated by the caller from the
//! same segment allocator. Only the small [`SharedList`] header is owned by
//! the list; it is registered under a name so other processes can attach.
//!
//! ```ignore
//! #[repr(C)]
//! struct Job {
//!     node: ListNode,
//!     id: u32,
//! }
//! unsafe impl Linked for Job {}
//! ```

use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::{self, NonNull};

use tracing::debug;

use crate::allocator::{check_name, SharedAllocator, MAX_NAME_LEN};
use crate::relptr::RelPtr;
use crate::sync::RawSharedMutex;
use crate::{Error, Result};

/// Link fields embedded at the start of every listed record.
#[repr(C)]
pub struct ListNode {
    prev: RelPtr<ListNode>,
    next: RelPtr<ListNode>,
}

impl ListNode {
    pub const fn new() -> Self {
        Self {
            prev: RelPtr::dangling(),
            next: RelPtr::dangling(),
        }
    }
}

impl Default for ListNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Records that can be linked into a [`SharedList`].
///
/// # Safety
///
/// The implementing type must be `#[repr(C)]` with a [`ListNode`] as its
/// first field, so a pointer to the record is also a pointer to its node.
pub unsafe trait Linked: Sized {}

unsafe impl Linked for ListNode {}

/// List header stored in the segment
#[repr(C)]
struct ListHeader {
    lock: RawSharedMutex,
    head: RelPtr<ListNode>,
    tail: RelPtr<ListNode>,
    count: usize,
    null: u8,
}

/// Process-local handle on a list living in a segment.
pub struct SharedList<'a, T: Linked> {
    alloc: &'a dyn SharedAllocator,
    header: NonNull<ListHeader>,
    name: String,
    _marker: PhantomData<*mut T>,
}

impl<'a, T: Linked> SharedList<'a, T> {
    /// Allocate an empty list and register it under `name`.
    pub fn create(name: &str, alloc: &'a dyn SharedAllocator) -> Result<Self> {
        check_name(name, MAX_NAME_LEN)?;
        if alloc.find_registered_object(name).is_some() {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }

        let raw = alloc.allocate(size_of::<ListHeader>())?;
        let header = raw.cast::<ListHeader>();
        unsafe {
            let hdr = header.as_ptr();
            ptr::write_bytes(hdr as *mut u8, 0, size_of::<ListHeader>());
            (*hdr).lock.init();
            let null = ptr::addr_of_mut!((*hdr).null);
            (*hdr).head.set(null);
            (*hdr).tail.set(null);
            (*hdr).count = 0;
        }

        if let Err(e) = alloc.register_object(name, raw) {
            unsafe { alloc.free(raw)? };
            return Err(e);
        }

        debug!(name, "created shared list");
        Ok(Self::from_header(name, alloc, header))
    }

    /// Look up a list created by any process on the same segment.
    pub fn attach(name: &str, alloc: &'a dyn SharedAllocator) -> Result<Self> {
        check_name(name, MAX_NAME_LEN)?;
        let raw = alloc
            .find_registered_object(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        debug!(name, "attached shared list");
        Ok(Self::from_header(name, alloc, raw.cast()))
    }

    fn from_header(name: &str, alloc: &'a dyn SharedAllocator, header: NonNull<ListHeader>) -> Self {
        Self {
            alloc,
            header,
            name: name.to_string(),
            _marker: PhantomData,
        }
    }

    /// Unlink every node, deregister the name and free the header. Node
    /// records are left to the caller.
    pub fn destroy(self) -> Result<()> {
        {
            let hdr = self.hdr();
            let _guard = unsafe { (*hdr).lock.lock() };
            unsafe {
                while let Some(node) = self.non_null((*hdr).head.get()) {
                    self.unlink(node);
                }
            }
        }
        let raw = self.alloc.deregister_object(&self.name)?;
        unsafe { self.alloc.free(raw)? };
        debug!(name = %self.name, "destroyed shared list");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allocator(&self) -> &'a dyn SharedAllocator {
        self.alloc
    }

    #[inline]
    fn hdr(&self) -> *mut ListHeader {
        self.header.as_ptr()
    }

    #[inline]
    fn null(&self) -> *mut u8 {
        unsafe { ptr::addr_of_mut!((*self.hdr()).null) }
    }

    #[inline]
    fn non_null(&self, p: *mut ListNode) -> Option<*mut ListNode> {
        if p as *mut u8 == self.null() {
            None
        } else {
            Some(p)
        }
    }

    #[inline]
    fn or_null(&self, p: Option<*mut ListNode>) -> *mut u8 {
        p.map_or(self.null(), |p| p as *mut u8)
    }

    #[inline]
    fn record(p: *mut ListNode) -> NonNull<T> {
        // Linked nodes are never the null sentinel, which is inside the header.
        unsafe { NonNull::new_unchecked(p as *mut T) }
    }

    fn check_node(&self, node: NonNull<T>) -> Result<*mut ListNode> {
        if !self.alloc.contains(node.as_ptr() as *const u8) {
            return Err(Error::InvalidArgument(format!(
                "node {:p} is outside the segment",
                node
            )));
        }
        Ok(node.as_ptr() as *mut ListNode)
    }

    /// Caller holds the lock.
    unsafe fn unlink(&self, n: *mut ListNode) {
        let hdr = self.hdr();
        let prev = self.non_null((*n).prev.get());
        let next = self.non_null((*n).next.get());
        match prev {
            Some(p) => (*p).next.set(self.or_null(next)),
            None => (*hdr).head.set(self.or_null(next)),
        }
        match next {
            Some(x) => (*x).prev.set(self.or_null(prev)),
            None => (*hdr).tail.set(self.or_null(prev)),
        }
        (*hdr).count -= 1;
    }

    /// Insert at the front.
    ///
    /// # Safety
    ///
    /// `node` must be a live record allocated from this list's allocator and
    /// must not currently be linked into any list.
    pub unsafe fn add_head(&self, node: NonNull<T>) -> Result<()> {
        let n = self.check_node(node)?;
        let hdr = self.hdr();
        let _guard = (*hdr).lock.lock();
        let head = self.non_null((*hdr).head.get());
        (*n).prev.set(self.null());
        (*n).next.set(self.or_null(head));
        match head {
            Some(h) => (*h).prev.set(n),
            None => (*hdr).tail.set(n),
        }
        (*hdr).head.set(n);
        (*hdr).count += 1;
        Ok(())
    }

    /// Insert at the back.
    ///
    /// # Safety
    ///
    /// Same contract as [`SharedList::add_head`].
    pub unsafe fn add_tail(&self, node: NonNull<T>) -> Result<()> {
        let n = self.check_node(node)?;
        let hdr = self.hdr();
        let _guard = (*hdr).lock.lock();
        let tail = self.non_null((*hdr).tail.get());
        (*n).next.set(self.null());
        (*n).prev.set(self.or_null(tail));
        match tail {
            Some(t) => (*t).next.set(n),
            None => (*hdr).head.set(n),
        }
        (*hdr).tail.set(n);
        (*hdr).count += 1;
        Ok(())
    }

    /// Unlink `node`. Its memory stays with the caller.
    ///
    /// # Safety
    ///
    /// `node` must currently be linked into this list.
    pub unsafe fn remove(&self, node: NonNull<T>) -> Result<()> {
        let n = self.check_node(node)?;
        let _guard = (*self.hdr()).lock.lock();
        self.unlink(n);
        Ok(())
    }

    pub fn head(&self) -> Option<NonNull<T>> {
        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        self.non_null(unsafe { (*hdr).head.get() }).map(Self::record)
    }

    pub fn tail(&self) -> Option<NonNull<T>> {
        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        self.non_null(unsafe { (*hdr).tail.get() }).map(Self::record)
    }

    /// Successor of `node`, `None` at the end.
    ///
    /// # Safety
    ///
    /// `node` must currently be linked into this list.
    pub unsafe fn next(&self, node: NonNull<T>) -> Option<NonNull<T>> {
        let _guard = (*self.hdr()).lock.lock();
        let n = node.as_ptr() as *mut ListNode;
        self.non_null((*n).next.get()).map(Self::record)
    }

    /// Remove and return the first node.
    pub fn pop_head(&self) -> Option<NonNull<T>> {
        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        unsafe {
            let head = self.non_null((*hdr).head.get())?;
            self.unlink(head);
            Some(Self::record(head))
        }
    }

    pub fn count(&self) -> usize {
        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        unsafe { (*hdr).count }
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// First record, from the head, for which `pred` returns true.
    pub fn find<F>(&self, mut pred: F) -> Option<NonNull<T>>
    where
        F: FnMut(&T) -> bool,
    {
        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        let mut cur = self.non_null(unsafe { (*hdr).head.get() });
        while let Some(n) = cur {
            if pred(unsafe { &*(n as *const T) }) {
                return Some(Self::record(n));
            }
            cur = self.non_null(unsafe { (*n).next.get() });
        }
        None
    }

    /// Visit every record from head to tail.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&T),
    {
        let hdr = self.hdr();
        let _guard = unsafe { (*hdr).lock.lock() };
        let mut cur = self.non_null(unsafe { (*hdr).head.get() });
        while let Some(n) = cur {
            visit(unsafe { &*(n as *const T) });
            cur = self.non_null(unsafe { (*n).next.get() });
        }
    }
}
