// SPDX-FileCopyrightText: 2024 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]

use core::ffi::c_void;

/// The alignment [`Pal::malloc`] implementations must at least provide when
/// asked for less. Matches what C's `malloc` gives on the common 64-bit
/// targets.
pub const MIN_HEAP_ALIGNMENT: usize = 16;

/// "Platform abstraction layer": a trait for using platform-dependent features
/// from the memory subsystem without depending on any platform directly.
///
/// This is the context object every allocator is constructed with. It's the
/// only way the allocators reach the process heap, and the only way they
/// report fatal conditions, so there's no global state involved: tests can
/// pass in a platform that counts allocations and panics instead of exiting.
///
/// All the functions have a `&self` parameter, so that the methods can access
/// some (possibly internally mutable) state, but still keeping the platform
/// object as widely usable as possible. None of these functions are
/// (supposed to be) hot, memory is allocated in big chunks, and this trait is
/// object safe, so using &dyn [`Pal`] should be fine performance-wise.
pub trait Pal {
    /// Allocate `size` bytes aligned to `align`, which is a power of two.
    /// Returns a null pointer on error. The contents of the memory are
    /// unspecified.
    fn malloc(&self, size: usize, align: usize) -> *mut c_void;

    /// Resize an allocation made with [`Pal::malloc`], preserving the
    /// alignment it was made with and the contents up to the smaller of the
    /// old and new sizes. Returns a null pointer on error, in which case the
    /// original allocation is left untouched.
    ///
    /// ## Safety
    ///
    /// - `ptr` must have been returned by [`Pal::malloc`] or [`Pal::realloc`]
    ///   of this same platform, and not freed since.
    /// - On success, the memory behind `ptr` must not be accessed anymore.
    unsafe fn realloc(&self, ptr: *mut c_void, new_size: usize) -> *mut c_void;

    /// Free the memory allocated by [`Pal::malloc`].
    ///
    /// ## Safety
    ///
    /// - `ptr` must have been returned by [`Pal::malloc`] or [`Pal::realloc`]
    ///   of this same platform, and not freed since.
    /// - Since the implementation is free to free the memory, the memory
    ///   pointed at by the given pointer shouldn't be accessed after calling
    ///   this.
    unsafe fn free(&self, ptr: *mut c_void);

    /// Print out a string. Used for reporting fatal conditions before
    /// [`Pal::exit`], so it should work even when everything else is on fire.
    fn println(&self, message: &str);

    /// Terminate the process, with `clean: false` if intending to signal
    /// failure. Never returns.
    fn exit(&self, clean: bool) -> !;
}
