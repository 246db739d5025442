// SPDX-FileCopyrightText: 2024 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{cell::Cell, fmt::Debug, mem::MaybeUninit, ptr::NonNull, slice};

use bytemuck::{Pod, Zeroable};
use platform_abstraction_layer::Pal;

use crate::{
    raw_heap::{precondition, RawHeap},
    AllocError, AllocatorConfig,
};

/// A stack allocator with a constant capacity. Can allocate memory regions
/// with any size or alignment (within the capacity) very fast, but individual
/// allocations can't be freed. Instead, the allocator can be rewound to a
/// previously set marker with [`StackAllocator::free_to_marker`], or emptied
/// completely with [`StackAllocator::free`].
///
/// Allocation sizes are rounded up to the alignment they're made with, so
/// e.g. with the default 8 byte alignment, two 20 byte allocations take up 48
/// bytes.
///
/// NOTE: The allocation functions return mutable borrows to the allocated
/// values, and rewinding does not drop those values. Anything with teardown
/// logic allocated from here must be torn down by the caller before rewinding.
pub struct StackAllocator<'platform> {
    heap: RawHeap<'platform>,
    alignment: usize,
    /// None after [`StackAllocator::reset`].
    buffer: Option<NonNull<u8>>,
    capacity: usize,
    /// The offset of the first free byte in `buffer`. Never larger than
    /// `capacity`.
    top: Cell<usize>,
    /// Never larger than `top`.
    marker: Cell<usize>,
}

impl Debug for StackAllocator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StackAllocator")
            .field("buffer", &self.buffer)
            .field("capacity", &self.capacity)
            .field("top", &self.top)
            .field("marker", &self.marker)
            .finish_non_exhaustive()
    }
}

impl Drop for StackAllocator<'_> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<'platform> StackAllocator<'platform> {
    /// Creates a new [`StackAllocator`] with `capacity` bytes of backing memory,
    /// rounded up to the configured alignment.
    ///
    /// `capacity` must be at least [`AllocatorConfig::min_stack_capacity`].
    #[track_caller]
    pub fn new(
        platform: &'platform dyn Pal,
        config: AllocatorConfig,
        capacity: usize,
    ) -> StackAllocator<'platform> {
        config.validate(platform);
        let capacity = checked_stack_capacity(platform, &config, capacity);
        let heap = RawHeap::new(platform);
        StackAllocator {
            heap,
            alignment: config.alignment,
            buffer: Some(heap.allocate_aligned(capacity, config.alignment)),
            capacity,
            top: Cell::new(0),
            marker: Cell::new(0),
        }
    }

    /// The total (free and allocated) amount of memory owned by this allocator,
    /// in bytes. Zero after [`StackAllocator::reset`].
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The amount of bytes allocated, including alignment padding.
    pub fn top(&self) -> usize {
        self.top.get()
    }

    /// The amount of bytes that can still be allocated, if no alignment
    /// padding is needed.
    pub fn remaining(&self) -> usize {
        self.capacity - self.top.get()
    }

    pub fn marker(&self) -> usize {
        self.marker.get()
    }

    /// The default alignment allocations are made with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Returns false after [`StackAllocator::reset`] has released the backing
    /// memory.
    pub fn is_initialized(&self) -> bool {
        self.buffer.is_some()
    }

    /// Allocates `size` bytes with the default alignment.
    pub fn try_alloc_bytes<'a>(
        &'a self,
        size: usize,
    ) -> Result<&'a mut [MaybeUninit<u8>], AllocError> {
        self.bump(size, self.alignment)
    }

    /// Allocates `size` bytes aligned to `alignment`, which must be a power of
    /// two. The size is rounded up to a multiple of `alignment`.
    #[track_caller]
    pub fn try_alloc_bytes_aligned<'a>(
        &'a self,
        size: usize,
        alignment: usize,
    ) -> Result<&'a mut [MaybeUninit<u8>], AllocError> {
        precondition(
            self.heap.platform(),
            alignment.is_power_of_two(),
            "allocation alignment must be a power of two",
        );
        self.bump(size, alignment)
    }

    /// Allocates room for `count` contiguous elements of `element_size` bytes.
    pub fn try_alloc_array<'a>(
        &'a self,
        count: usize,
        element_size: usize,
    ) -> Result<&'a mut [MaybeUninit<u8>], AllocError> {
        self.bump(array_size(count, element_size)?, self.alignment)
    }

    /// Allocates room for `count` contiguous elements of `element_size` bytes,
    /// aligned to `alignment`.
    #[track_caller]
    pub fn try_alloc_array_aligned<'a>(
        &'a self,
        count: usize,
        element_size: usize,
        alignment: usize,
    ) -> Result<&'a mut [MaybeUninit<u8>], AllocError> {
        self.try_alloc_bytes_aligned(array_size(count, element_size)?, alignment)
    }

    /// Allocates `size` zeroed bytes with the default alignment.
    pub fn try_alloc_zeroed_bytes<'a>(&'a self, size: usize) -> Result<&'a mut [u8], AllocError> {
        let bytes = self.bump(size, self.alignment)?;
        bytes.fill(MaybeUninit::new(0));
        // Safety: every byte was just initialized.
        Ok(unsafe { slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut u8, bytes.len()) })
    }

    /// Allocates memory for a slice of `MaybeUninit<T>`, leaving the contents
    /// of the slice uninitialized. Aligned to the larger of `T`'s and the
    /// default alignment.
    pub fn try_alloc_uninit_slice<'a, T>(
        &'a self,
        len: usize,
    ) -> Result<&'a mut [MaybeUninit<T>], AllocError> {
        let size = array_size(len, size_of::<T>())?;
        let bytes = self.bump(size, align_of::<T>().max(self.alignment))?;
        // Safety: the bytes are aligned for T, there's room for `len` Ts, and
        // uninitialized values are valid for MaybeUninit<T>.
        Ok(unsafe { slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut MaybeUninit<T>, len) })
    }

    /// Allocates one `T` and moves `value` there.
    pub fn alloc<T>(&self, value: T) -> Result<&mut T, AllocError> {
        let [slot] = self.try_alloc_uninit_slice::<T>(1)? else {
            unreachable!("a slice of length 1 was allocated");
        };
        Ok(slot.write(value))
    }

    /// Allocates one `T` zeroed out.
    pub fn alloc_zeroed<T: Zeroable>(&self) -> Result<&mut T, AllocError> {
        self.alloc(T::zeroed())
    }

    /// Allocates a copy of `src`.
    pub fn alloc_slice_copy<'a, T: Pod>(&'a self, src: &[T]) -> Result<&'a mut [T], AllocError> {
        let uninit = self.try_alloc_uninit_slice::<T>(src.len())?;
        for (dst, src) in uninit.iter_mut().zip(src) {
            dst.write(*src);
        }
        // Safety: every element was just initialized.
        Ok(unsafe { slice::from_raw_parts_mut(uninit.as_mut_ptr() as *mut T, uninit.len()) })
    }

    /// Records the current top of the stack, to be rewound to with
    /// [`StackAllocator::free_to_marker`].
    pub fn set_marker(&self) {
        self.marker.set(self.top.get());
    }

    /// Rewinds the stack to the last marker, reclaiming everything allocated
    /// since. The reclaimed values are not dropped.
    pub fn free_to_marker(&mut self) {
        // Safety: though this is not an unsafe operation, all the unsafety in
        // this file relies on `buffer + top` not pointing into memory which is
        // already being borrowed. We have a mutable borrow of self, so all the
        // borrows dealt out by the allocation functions (which can't outlive
        // the immutable borrow of self) are gone.
        self.top.set(self.marker.get());
    }

    /// Empties the stack, reclaiming all of the backing memory for future
    /// allocations. The reclaimed values are not dropped.
    pub fn free(&mut self) {
        // Safety: see free_to_marker.
        self.top.set(0);
        self.marker.set(0);
    }

    /// Releases the backing memory. Any allocations made after this fail with
    /// [`AllocError::OutOfMemory`].
    pub fn reset(&mut self) {
        self.free();
        if let Some(buffer) = self.buffer.take() {
            tracing::debug!(capacity = self.capacity, "releasing stack buffer");
            // Safety: the buffer is from this heap, and since we have an
            // exclusive borrow of self, there are no borrows into it anymore.
            unsafe { self.heap.free(buffer) };
        }
        self.capacity = 0;
    }

    /// The offset of `ptr` from the start of the backing memory.
    pub(crate) fn offset_of<T>(&self, ptr: *const T) -> Option<usize> {
        let buffer = self.buffer?;
        (ptr as usize).checked_sub(buffer.as_ptr() as usize)
    }

    /// Returns a shared borrow of `len` `T`s at `offset`.
    ///
    /// ### Safety
    ///
    /// The range must have been allocated and fully initialized as `T`s, with
    /// no mutable borrow to it alive, and the stack must not have been rewound
    /// past it since.
    pub(crate) unsafe fn slice_at<T>(&self, offset: usize, len: usize) -> Option<&[T]> {
        let buffer = self.buffer?;
        let end = offset.checked_add(len.checked_mul(size_of::<T>())?)?;
        if end > self.top.get() {
            return None;
        }
        // Safety: the range is within the allocated part of the buffer (checked
        // above), the rest is up to the caller.
        Some(unsafe { slice::from_raw_parts(buffer.as_ptr().add(offset) as *const T, len) })
    }

    fn bump<'a>(
        &'a self,
        size: usize,
        alignment: usize,
    ) -> Result<&'a mut [MaybeUninit<u8>], AllocError> {
        let top = self.top.get();
        let out_of_memory = |requested| {
            tracing::warn!(requested, remaining = self.capacity - top, "stack allocator is full");
            AllocError::OutOfMemory {
                requested,
                remaining: self.capacity - top,
            }
        };
        let Some(buffer) = self.buffer else {
            return Err(out_of_memory(size));
        };
        let Some((start, end)) = bump_up(buffer, top, self.capacity, size, alignment) else {
            let requested = size.checked_next_multiple_of(alignment).unwrap_or(usize::MAX);
            return Err(out_of_memory(requested));
        };

        // Note that `top` is in a Cell, which guarantees that nobody else is
        // reading it in between the `get()` above and the `set()` here. Also
        // note that this value only goes up between rewinds, which ensures that
        // allocations don't overlap.
        self.top.set(end);

        // Safety: `start..start + size` is within the buffer and not part of
        // any other live allocation, see the invariants of `bump_up`.
        Ok(unsafe { uninit_bytes(buffer, start, size) })
    }
}

#[track_caller]
pub(crate) fn checked_stack_capacity(
    platform: &dyn Pal,
    config: &AllocatorConfig,
    capacity: usize,
) -> usize {
    precondition(
        platform,
        capacity >= config.min_stack_capacity,
        "stack capacity is below the configured minimum",
    );
    match capacity.checked_next_multiple_of(config.alignment) {
        Some(capacity) if capacity <= isize::MAX as usize => capacity,
        _ => crate::fatal(platform, "stack capacity overflows isize"),
    }
}

pub(crate) fn array_size(count: usize, element_size: usize) -> Result<usize, AllocError> {
    count
        .checked_mul(element_size)
        .ok_or(AllocError::OutOfMemory {
            requested: usize::MAX,
            remaining: 0,
        })
}

/// Finds the aligned `start..end` range for an upward-growing allocation of
/// `size` bytes (rounded up to `alignment`) at or after `top`, ending at or
/// before `limit`.
///
/// The alignment is applied to the address rather than the offset, since
/// `alignment` may be larger than the buffer's own alignment.
pub(crate) fn bump_up(
    buffer: NonNull<u8>,
    top: usize,
    limit: usize,
    size: usize,
    alignment: usize,
) -> Option<(usize, usize)> {
    let base = buffer.as_ptr() as usize;
    let start = (base + top).checked_next_multiple_of(alignment)? - base;
    let end = start.checked_add(size.checked_next_multiple_of(alignment)?)?;
    (end <= limit).then_some((start, end))
}

/// Finds the aligned start offset for a downward-growing allocation of `size`
/// bytes (rounded up to `alignment`) ending at or before `tail`, starting at or
/// after `limit`.
pub(crate) fn bump_down(
    buffer: NonNull<u8>,
    tail: usize,
    limit: usize,
    size: usize,
    alignment: usize,
) -> Option<usize> {
    let base = buffer.as_ptr() as usize;
    let unaligned_start = (base + tail).checked_sub(size.checked_next_multiple_of(alignment)?)?;
    let start = (unaligned_start & !(alignment - 1)).checked_sub(base)?;
    (start >= limit).then_some(start)
}

/// ### Safety
///
/// `offset..offset + len` must be within the allocation behind `buffer`, and
/// not accessed through any other pointer for the lifetime `'a`.
pub(crate) unsafe fn uninit_bytes<'a>(
    buffer: NonNull<u8>,
    offset: usize,
    len: usize,
) -> &'a mut [MaybeUninit<u8>] {
    // Safety: forwarded to the caller. The offset fits in isize since the
    // buffer size does, checked when the buffer was allocated.
    unsafe { slice::from_raw_parts_mut(buffer.as_ptr().add(offset) as *mut MaybeUninit<u8>, len) }
}
