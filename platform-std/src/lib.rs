// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    alloc::{self, Layout},
    ffi::c_void,
    io::{self, Write},
    process::exit,
    ptr,
};

use platform_abstraction_layer::{Pal, MIN_HEAP_ALIGNMENT};

/// Stored right before every pointer returned from [`StdPal::malloc`], since
/// the std allocator needs the layout back when freeing.
#[derive(Clone, Copy)]
#[repr(C)]
struct AllocationHeader {
    size: usize,
    align: usize,
}

const HEADER_SIZE: usize = size_of::<AllocationHeader>();

/// [`Pal`] implementation on top of the Rust standard library: memory comes
/// from the global allocator, printing goes to stderr, and exiting ends the
/// process.
///
/// Printing does not go through `tracing`, since the only thing printed is
/// fatal error reports, and those have already been logged as errors by the
/// time they're printed.
#[derive(Debug, Default)]
pub struct StdPal;

impl StdPal {
    pub fn new() -> StdPal {
        StdPal
    }
}

/// The layout of the whole allocation (header padding included) backing a
/// user-visible allocation of `size` bytes aligned to `align`. The header is
/// padded to `align` so that the user pointer stays aligned.
fn backing_layout(size: usize, align: usize) -> Option<(Layout, usize)> {
    let align = align.max(MIN_HEAP_ALIGNMENT).max(align_of::<AllocationHeader>());
    let header_padding = HEADER_SIZE.next_multiple_of(align);
    let layout = Layout::from_size_align(header_padding.checked_add(size)?, align).ok()?;
    Some((layout, header_padding))
}

/// ### Safety
///
/// `ptr` must be a live pointer returned by [`StdPal::malloc`] or
/// [`StdPal::realloc`].
unsafe fn read_header(ptr: *mut c_void) -> (AllocationHeader, *mut u8, Layout, usize) {
    // Safety: the header is written right before every pointer handed out.
    let header = unsafe { (ptr as *mut AllocationHeader).sub(1).read() };
    let Some((layout, header_padding)) = backing_layout(header.size, header.align) else {
        unreachable!("the layout was valid when the allocation was made");
    };
    // Safety: the user pointer is `header_padding` bytes into the allocation.
    let base = unsafe { (ptr as *mut u8).sub(header_padding) };
    (header, base, layout, header_padding)
}

fn write_line(out: &mut impl Write, message: &str) -> io::Result<()> {
    writeln!(out, "{message}")?;
    out.flush()
}

impl Pal for StdPal {
    fn malloc(&self, size: usize, align: usize) -> *mut c_void {
        if !align.is_power_of_two() {
            return ptr::null_mut();
        }
        let Some((layout, header_padding)) = backing_layout(size, align) else {
            return ptr::null_mut();
        };
        // Safety: the layout is never zero-sized, it always has the header.
        let base = unsafe { alloc::alloc(layout) };
        if base.is_null() {
            tracing::error!(size, align, "the global allocator is out of memory");
            return ptr::null_mut();
        }
        // Safety: the allocation is `header_padding + size` bytes, and
        // `header_padding` is at least the header's size and a multiple of its
        // alignment.
        unsafe {
            let user_ptr = base.add(header_padding);
            (user_ptr as *mut AllocationHeader)
                .sub(1)
                .write(AllocationHeader { size, align });
            user_ptr as *mut c_void
        }
    }

    unsafe fn realloc(&self, ptr: *mut c_void, new_size: usize) -> *mut c_void {
        // Safety: forwarded to the caller.
        let (header, base, layout, header_padding) = unsafe { read_header(ptr) };
        let Some((new_layout, _)) = backing_layout(new_size, header.align) else {
            return ptr::null_mut();
        };
        // Safety: `base` was allocated with `layout`, and the new size is
        // non-zero and checked to not overflow isize by Layout.
        let new_base = unsafe { alloc::realloc(base, layout, new_layout.size()) };
        if new_base.is_null() {
            tracing::error!(new_size, "the global allocator is out of memory");
            return ptr::null_mut();
        }
        // Safety: same as in malloc, the header padding didn't change since
        // the alignment didn't.
        unsafe {
            let user_ptr = new_base.add(header_padding);
            (user_ptr as *mut AllocationHeader)
                .sub(1)
                .write(AllocationHeader {
                    size: new_size,
                    align: header.align,
                });
            user_ptr as *mut c_void
        }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        // Safety: forwarded to the caller.
        let (_, base, layout, _) = unsafe { read_header(ptr) };
        // Safety: `base` was allocated with `layout`.
        unsafe { alloc::dealloc(base, layout) };
    }

    fn println(&self, message: &str) {
        // Nothing sensible to do if stderr is gone.
        let _ = write_line(&mut io::stderr().lock(), message);
    }

    fn exit(&self, clean: bool) -> ! {
        exit(if clean { 0 } else { 1 });
    }
}
