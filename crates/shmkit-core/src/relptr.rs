//! Self-relative pointers
//!
//! A [`RelPtr`] stores the byte displacement between its own location and
//! the address it denotes, so a structure built inside one mapping of a
//! segment still resolves when the same bytes are mapped at another base
//! address.
//!
//! Setting and resolving are plain address arithmetic and therefore safe.
//! Dereferencing the resolved pointer is not: the caller must know that the
//! `RelPtr` is being read through the mapping that holds its target.

use std::fmt;
use std::marker::PhantomData;

/// Offset-encoded pointer to a `T` living in the same segment as the pointer.
#[repr(C)]
pub struct RelPtr<T> {
    /// `address_of(self) - address_of(target)`
    offset: isize,
    _marker: PhantomData<*mut T>,
}

impl<T> RelPtr<T> {
    /// A pointer that resolves to its own location.
    ///
    /// Only useful as an initial value before [`RelPtr::set`] is called.
    pub const fn dangling() -> Self {
        Self {
            offset: 0,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn addr(&self) -> isize {
        self as *const Self as isize
    }

    /// Point at `target`.
    #[inline]
    pub fn set<U>(&mut self, target: *const U) {
        self.offset = self.addr().wrapping_sub(target as isize);
    }

    /// Resolve to an absolute address in the current mapping.
    #[inline]
    pub fn get(&self) -> *mut T {
        (self as *const Self as *mut u8).wrapping_offset(-self.offset) as *mut T
    }

    /// Raw displacement, mostly for diagnostics.
    #[inline]
    pub fn offset(&self) -> isize {
        self.offset
    }
}

impl<T> fmt::Debug for RelPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelPtr")
            .field("offset", &self.offset)
            .field("target", &self.get())
            .finish()
    }
}
