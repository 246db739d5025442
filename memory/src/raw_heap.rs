// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    ffi::c_void,
    fmt::{Debug, Write},
    panic::Location,
    ptr::NonNull,
};

use arrayvec::ArrayString;
use platform_abstraction_layer::{Pal, MIN_HEAP_ALIGNMENT};

/// Reports a fatal condition with the caller's file, line and column, and then
/// terminates via [`Pal::exit`].
///
/// This is how every unrecoverable condition in this crate ends: precondition
/// violations, the heap refusing an allocation, and freeing memory that an
/// allocator doesn't own. The public functions that can end up here are
/// `#[track_caller]`, so the reported location is the offending call site.
#[cold]
#[track_caller]
pub fn fatal(platform: &dyn Pal, message: &str) -> ! {
    let location = Location::caller();
    tracing::error!(
        file = location.file(),
        line = location.line(),
        "fatal memory error: {message}"
    );
    let mut report = ArrayString::<256>::new();
    // A report cut short by the capacity is still better than no report.
    let _ = write!(
        report,
        "{}:{}:{}: fatal memory error: {}",
        location.file(),
        location.line(),
        location.column(),
        message,
    );
    platform.println(&report);
    platform.exit(false)
}

#[track_caller]
pub(crate) fn precondition(platform: &dyn Pal, condition: bool, message: &str) {
    if !condition {
        fatal(platform, message);
    }
}

/// Thin wrapper over the platform's heap. Holds no state except the platform
/// borrow, each call is an independent heap operation.
///
/// Pointers returned from here are never null: if the heap can't satisfy a
/// request, the process is terminated via [`fatal`].
#[derive(Clone, Copy)]
pub struct RawHeap<'platform> {
    platform: &'platform dyn Pal,
}

impl Debug for RawHeap<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawHeap").finish_non_exhaustive()
    }
}

impl<'platform> RawHeap<'platform> {
    pub fn new(platform: &'platform dyn Pal) -> RawHeap<'platform> {
        RawHeap { platform }
    }

    /// The platform this heap allocates from and reports errors to.
    pub fn platform(&self) -> &'platform dyn Pal {
        self.platform
    }

    /// Allocates `size` bytes with the platform's minimum heap alignment.
    #[track_caller]
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        self.allocate_aligned(size, MIN_HEAP_ALIGNMENT)
    }

    /// Allocates `size` bytes aligned to `alignment`, which must be a power of
    /// two.
    #[track_caller]
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> NonNull<u8> {
        precondition(
            self.platform,
            alignment.is_power_of_two(),
            "heap alignment must be a power of two",
        );
        precondition(
            self.platform,
            size <= isize::MAX as usize,
            "heap allocation size overflows isize",
        );

        // Zero-sized requests still get a unique, freeable pointer.
        let ptr = self
            .platform
            .malloc(size.max(1), alignment.max(MIN_HEAP_ALIGNMENT));
        match NonNull::new(ptr as *mut u8) {
            Some(ptr) => ptr,
            None => fatal(self.platform, "the heap could not satisfy an allocation"),
        }
    }

    /// Like [`RawHeap::allocate_aligned`], but the memory is zeroed.
    #[track_caller]
    pub fn allocate_zeroed(&self, size: usize, alignment: usize) -> NonNull<u8> {
        let ptr = self.allocate_aligned(size, alignment);
        // Safety: `ptr` points to a fresh allocation of at least `size` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        ptr
    }

    /// Grows or shrinks an allocation, preserving the contents up to the
    /// smaller of the old and new sizes, and the alignment it was allocated
    /// with. The returned pointer replaces `ptr`.
    ///
    /// ### Safety
    ///
    /// `ptr` must have been returned by this heap (or another [`RawHeap`] of
    /// the same platform) and not freed since. `ptr` must not be used after
    /// this call.
    #[track_caller]
    pub unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> NonNull<u8> {
        precondition(
            self.platform,
            new_size <= isize::MAX as usize,
            "heap allocation size overflows isize",
        );
        // Safety: forwarded to the caller.
        let new_ptr = unsafe {
            self.platform
                .realloc(ptr.as_ptr() as *mut c_void, new_size.max(1))
        };
        match NonNull::new(new_ptr as *mut u8) {
            Some(new_ptr) => new_ptr,
            None => fatal(self.platform, "the heap could not satisfy a reallocation"),
        }
    }

    /// Releases an allocation. Freeing "null" is ruled out by the type.
    ///
    /// ### Safety
    ///
    /// `ptr` must have been returned by this heap (or another [`RawHeap`] of
    /// the same platform) and not freed since. The memory must not be accessed
    /// after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        // Safety: forwarded to the caller.
        unsafe { self.platform.free(ptr.as_ptr() as *mut c_void) };
    }
}
