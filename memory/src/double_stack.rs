// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{cell::Cell, fmt::Debug, mem::MaybeUninit, ptr::NonNull, slice};

use platform_abstraction_layer::Pal;

use crate::{
    raw_heap::{precondition, RawHeap},
    stack::{bump_down, bump_up, checked_stack_capacity, uninit_bytes},
    AllocError, AllocatorConfig,
};

/// Which end of a [`DoubleStackAllocator`] an allocation is made from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Head,
    Tail,
}

/// Two stack allocators sharing one buffer: the head grows upwards from the
/// start of the buffer, the tail downwards from the end. Each end has its own
/// marker, and can be rewound independently of the other.
///
/// The intended use is packing long-lived allocations at one end and
/// short-lived, frequently rewound ones at the other, within one memory
/// budget. The two regions never overlap: an allocation that would make the
/// head pass the tail (or vice versa) fails instead.
pub struct DoubleStackAllocator<'platform> {
    heap: RawHeap<'platform>,
    alignment: usize,
    buffer: Option<NonNull<u8>>,
    capacity: usize,
    /// Offset of the first free byte after the head region. Never larger than
    /// `tail`.
    head: Cell<usize>,
    /// Offset of the first byte of the tail region. Never larger than
    /// `capacity`.
    tail: Cell<usize>,
    head_marker: Cell<usize>,
    tail_marker: Cell<usize>,
}

impl Debug for DoubleStackAllocator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DoubleStackAllocator")
            .field("buffer", &self.buffer)
            .field("capacity", &self.capacity)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish_non_exhaustive()
    }
}

impl Drop for DoubleStackAllocator<'_> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<'platform> DoubleStackAllocator<'platform> {
    /// Creates a new [`DoubleStackAllocator`] with `capacity` bytes of backing
    /// memory, rounded up to the configured alignment.
    #[track_caller]
    pub fn new(
        platform: &'platform dyn Pal,
        config: AllocatorConfig,
        capacity: usize,
    ) -> DoubleStackAllocator<'platform> {
        config.validate(platform);
        let capacity = checked_stack_capacity(platform, &config, capacity);
        let heap = RawHeap::new(platform);
        DoubleStackAllocator {
            heap,
            alignment: config.alignment,
            buffer: Some(heap.allocate_aligned(capacity, config.alignment)),
            capacity,
            head: Cell::new(0),
            tail: Cell::new(capacity),
            head_marker: Cell::new(0),
            tail_marker: Cell::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The amount of bytes allocated from the head end.
    pub fn head(&self) -> usize {
        self.head.get()
    }

    /// The offset where the tail region starts. Equal to
    /// [`DoubleStackAllocator::capacity`] when nothing is allocated from the
    /// tail end.
    pub fn tail(&self) -> usize {
        self.tail.get()
    }

    /// The amount of unallocated bytes between the two ends.
    pub fn free_space(&self) -> usize {
        self.tail.get() - self.head.get()
    }

    /// Allocates `size` bytes from the head end with the default alignment.
    pub fn alloc_head<'a>(&'a self, size: usize) -> Result<&'a mut [MaybeUninit<u8>], AllocError> {
        self.bump(End::Head, size, self.alignment)
    }

    /// Allocates `size` bytes from the head end aligned to `alignment`, which
    /// must be a power of two.
    #[track_caller]
    pub fn alloc_head_aligned<'a>(
        &'a self,
        size: usize,
        alignment: usize,
    ) -> Result<&'a mut [MaybeUninit<u8>], AllocError> {
        self.check_alignment(alignment);
        self.bump(End::Head, size, alignment)
    }

    /// Allocates `size` zeroed bytes from the head end.
    pub fn calloc_head<'a>(&'a self, size: usize) -> Result<&'a mut [u8], AllocError> {
        self.bump(End::Head, size, self.alignment).map(zero)
    }

    /// Allocates `size` bytes from the tail end with the default alignment.
    pub fn alloc_tail<'a>(&'a self, size: usize) -> Result<&'a mut [MaybeUninit<u8>], AllocError> {
        self.bump(End::Tail, size, self.alignment)
    }

    /// Allocates `size` bytes from the tail end aligned to `alignment`, which
    /// must be a power of two.
    #[track_caller]
    pub fn alloc_tail_aligned<'a>(
        &'a self,
        size: usize,
        alignment: usize,
    ) -> Result<&'a mut [MaybeUninit<u8>], AllocError> {
        self.check_alignment(alignment);
        self.bump(End::Tail, size, alignment)
    }

    /// Allocates `size` zeroed bytes from the tail end.
    pub fn calloc_tail<'a>(&'a self, size: usize) -> Result<&'a mut [u8], AllocError> {
        self.bump(End::Tail, size, self.alignment).map(zero)
    }

    pub fn set_marker_head(&self) {
        self.head_marker.set(self.head.get());
    }

    pub fn set_marker_tail(&self) {
        self.tail_marker.set(self.tail.get());
    }

    /// Rewinds the head end to its marker. The reclaimed values are not
    /// dropped.
    pub fn free_to_head_marker(&mut self) {
        // Safety: the exclusive borrow of self means none of the allocations,
        // which borrow self immutably, are alive anymore.
        self.head.set(self.head_marker.get());
    }

    /// Rewinds the tail end to its marker. The reclaimed values are not
    /// dropped.
    pub fn free_to_tail_marker(&mut self) {
        // Safety: see free_to_head_marker.
        self.tail.set(self.tail_marker.get());
    }

    /// Empties the head end, keeping the tail's allocations.
    pub fn reset_head(&mut self) {
        self.head.set(0);
        self.head_marker.set(0);
    }

    /// Empties the tail end, keeping the head's allocations.
    pub fn reset_tail(&mut self) {
        self.tail.set(self.capacity);
        self.tail_marker.set(self.capacity);
    }

    /// Empties both ends.
    pub fn free(&mut self) {
        self.reset_head();
        self.reset_tail();
    }

    /// Splits the allocator into its two ends, which can then be allocated from
    /// and rewound independently of each other. For example, the tail can be
    /// rewound every frame while allocations from the head are still borrowed,
    /// which isn't possible through [`DoubleStackAllocator::free_to_tail_marker`]
    /// since it needs an exclusive borrow of the whole allocator.
    pub fn split(&mut self) -> (HeadStack<'_, 'platform>, TailStack<'_, 'platform>) {
        (HeadStack { stack: &*self }, TailStack { stack: &*self })
    }

    /// Releases the backing memory. Any allocations made after this fail with
    /// [`AllocError::OutOfMemory`].
    pub fn reset(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            tracing::debug!(capacity = self.capacity, "releasing double stack buffer");
            // Safety: the buffer is from this heap, and since we have an
            // exclusive borrow of self, there are no borrows into it anymore.
            unsafe { self.heap.free(buffer) };
        }
        self.capacity = 0;
        self.free();
    }

    #[track_caller]
    fn check_alignment(&self, alignment: usize) {
        precondition(
            self.heap.platform(),
            alignment.is_power_of_two(),
            "allocation alignment must be a power of two",
        );
    }

    fn bump<'a>(
        &'a self,
        end: End,
        size: usize,
        alignment: usize,
    ) -> Result<&'a mut [MaybeUninit<u8>], AllocError> {
        let (head, tail) = (self.head.get(), self.tail.get());
        let range = self.buffer.and_then(|buffer| {
            let start = match end {
                End::Head => {
                    let (start, new_head) = bump_up(buffer, head, tail, size, alignment)?;
                    self.head.set(new_head);
                    start
                }
                End::Tail => {
                    let start = bump_down(buffer, tail, head, size, alignment)?;
                    self.tail.set(start);
                    start
                }
            };
            Some((buffer, start))
        });

        let Some((buffer, start)) = range else {
            let requested = size.checked_next_multiple_of(alignment).unwrap_or(usize::MAX);
            tracing::warn!(?end, requested, free = tail - head, "double stack allocator is full");
            return Err(AllocError::OutOfMemory {
                requested,
                remaining: tail - head,
            });
        };

        // Safety: bump_up and bump_down only return ranges between the current
        // head and tail, and the head and tail were moved past the range
        // above, so nobody else can get a borrow to it until the relevant end
        // is rewound, which requires an exclusive borrow of self.
        Ok(unsafe { uninit_bytes(buffer, start, size) })
    }
}

/// The head end of a [`DoubleStackAllocator`], from
/// [`DoubleStackAllocator::split`].
#[derive(Debug)]
pub struct HeadStack<'a, 'platform> {
    stack: &'a DoubleStackAllocator<'platform>,
}

impl HeadStack<'_, '_> {
    /// See [`DoubleStackAllocator::alloc_head`].
    pub fn alloc<'b>(&'b self, size: usize) -> Result<&'b mut [MaybeUninit<u8>], AllocError> {
        self.stack.bump(End::Head, size, self.stack.alignment)
    }

    /// See [`DoubleStackAllocator::alloc_head_aligned`].
    #[track_caller]
    pub fn alloc_aligned<'b>(
        &'b self,
        size: usize,
        alignment: usize,
    ) -> Result<&'b mut [MaybeUninit<u8>], AllocError> {
        self.stack.check_alignment(alignment);
        self.stack.bump(End::Head, size, alignment)
    }

    /// See [`DoubleStackAllocator::calloc_head`].
    pub fn calloc<'b>(&'b self, size: usize) -> Result<&'b mut [u8], AllocError> {
        self.alloc(size).map(zero)
    }

    pub fn set_marker(&self) {
        self.stack.set_marker_head();
    }

    /// Rewinds the head end to its marker.
    pub fn free_to_marker(&mut self) {
        // Safety: allocations made through this half borrow it, so the
        // exclusive borrow here means none of them are alive. Allocations
        // from the tail half are not in the rewound range, since the head
        // never passes the tail.
        self.stack.head.set(self.stack.head_marker.get());
    }

    /// Empties the head end.
    pub fn reset(&mut self) {
        // Safety: see free_to_marker.
        self.stack.head.set(0);
        self.stack.head_marker.set(0);
    }
}

/// The tail end of a [`DoubleStackAllocator`], from
/// [`DoubleStackAllocator::split`].
#[derive(Debug)]
pub struct TailStack<'a, 'platform> {
    stack: &'a DoubleStackAllocator<'platform>,
}

impl TailStack<'_, '_> {
    /// See [`DoubleStackAllocator::alloc_tail`].
    pub fn alloc<'b>(&'b self, size: usize) -> Result<&'b mut [MaybeUninit<u8>], AllocError> {
        self.stack.bump(End::Tail, size, self.stack.alignment)
    }

    /// See [`DoubleStackAllocator::alloc_tail_aligned`].
    #[track_caller]
    pub fn alloc_aligned<'b>(
        &'b self,
        size: usize,
        alignment: usize,
    ) -> Result<&'b mut [MaybeUninit<u8>], AllocError> {
        self.stack.check_alignment(alignment);
        self.stack.bump(End::Tail, size, alignment)
    }

    /// See [`DoubleStackAllocator::calloc_tail`].
    pub fn calloc<'b>(&'b self, size: usize) -> Result<&'b mut [u8], AllocError> {
        self.alloc(size).map(zero)
    }

    pub fn set_marker(&self) {
        self.stack.set_marker_tail();
    }

    /// Rewinds the tail end to its marker.
    pub fn free_to_marker(&mut self) {
        // Safety: see HeadStack::free_to_marker.
        self.stack.tail.set(self.stack.tail_marker.get());
    }

    /// Empties the tail end.
    pub fn reset(&mut self) {
        // Safety: see HeadStack::free_to_marker.
        self.stack.tail.set(self.stack.capacity);
        self.stack.tail_marker.set(self.stack.capacity);
    }
}

fn zero(bytes: &mut [MaybeUninit<u8>]) -> &mut [u8] {
    bytes.fill(MaybeUninit::new(0));
    // Safety: every byte was just initialized.
    unsafe { slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut u8, bytes.len()) }
}

#[cfg(test)]
mod tests {
    use core::mem::MaybeUninit;

    use crate::{test_platform::TestPlatform, AllocError, AllocatorConfig};

    use super::DoubleStackAllocator;

    fn range(stack: &DoubleStackAllocator, bytes: &[MaybeUninit<u8>]) -> (usize, usize) {
        let base = stack.buffer.unwrap().as_ptr() as usize;
        let start = bytes.as_ptr() as usize - base;
        (start, start + bytes.len())
    }

    #[test]
    fn ends_do_not_cross() {
        let platform = TestPlatform::new();
        let stack = DoubleStackAllocator::new(&platform, AllocatorConfig::DEFAULT, 100);
        assert_eq!(104, stack.capacity());

        let _ = stack.alloc_head(40).unwrap();
        assert_eq!(40, stack.head());
        let _ = stack.alloc_tail(40).unwrap();
        assert_eq!(64, stack.tail());
        assert_eq!(
            Err(AllocError::OutOfMemory {
                requested: 40,
                remaining: 24
            }),
            stack.alloc_head(40).map(|_| ()),
        );
        assert!(stack.alloc_tail(40).is_err());
        assert_eq!((40, 64), (stack.head(), stack.tail()), "failures should not move the ends");

        // The remaining space can still be split exactly.
        let _ = stack.alloc_head(16).unwrap();
        let _ = stack.alloc_tail(8).unwrap();
        assert_eq!(0, stack.free_space());
        assert!(stack.alloc_head(0).is_ok(), "zero-sized allocations always fit");
    }

    #[test]
    fn interleaved_allocations_never_overlap() {
        let platform = TestPlatform::new();
        let stack = DoubleStackAllocator::new(&platform, AllocatorConfig::DEFAULT, 512);

        let mut head_ranges = [(0, 0); 64];
        let mut tail_ranges = [(0, 0); 64];
        let (mut heads, mut tails) = (0, 0);
        for i in 0..64usize {
            let size = (i * 7) % 23 + 1;
            if i % 3 == 0 {
                if let Ok(bytes) = stack.alloc_tail(size) {
                    tail_ranges[tails] = range(&stack, bytes);
                    tails += 1;
                }
            } else if let Ok(bytes) = stack.alloc_head_aligned(size, 16) {
                head_ranges[heads] = range(&stack, bytes);
                heads += 1;
            }
            assert!(stack.head() <= stack.tail());
        }

        for &(head_start, head_end) in &head_ranges[..heads] {
            assert!(head_end <= stack.head());
            for &(tail_start, tail_end) in &tail_ranges[..tails] {
                assert!(tail_start >= stack.tail() && tail_end <= stack.capacity());
                assert!(head_end <= tail_start || tail_end <= head_start, "ranges overlap");
            }
        }
    }

    #[test]
    fn markers_rewind_each_end_independently() {
        let platform = TestPlatform::new();
        let mut stack = DoubleStackAllocator::new(&platform, AllocatorConfig::DEFAULT, 256);

        let _ = stack.alloc_head(16).unwrap();
        let _ = stack.alloc_tail(16).unwrap();
        stack.set_marker_head();
        stack.set_marker_tail();
        let _ = stack.alloc_head(32).unwrap();
        let _ = stack.alloc_tail(32).unwrap();
        assert_eq!((48, 208), (stack.head(), stack.tail()));

        stack.free_to_tail_marker();
        assert_eq!((48, 240), (stack.head(), stack.tail()));
        stack.free_to_head_marker();
        assert_eq!((16, 240), (stack.head(), stack.tail()));

        let reused = stack.alloc_tail(32).unwrap();
        assert_eq!((208, 240), range(&stack, reused));

        stack.reset_head();
        assert_eq!((0, 208), (stack.head(), stack.tail()));
        stack.reset_tail();
        assert_eq!((0, 256), (stack.head(), stack.tail()));

        let _ = stack.alloc_head(8).unwrap();
        let _ = stack.alloc_tail(8).unwrap();
        stack.free();
        assert_eq!((0, 256), (stack.head(), stack.tail()));
    }

    #[test]
    fn split_ends_rewind_while_the_other_end_is_borrowed() {
        let platform = TestPlatform::new();
        let mut stack = DoubleStackAllocator::new(&platform, AllocatorConfig::DEFAULT, 128);
        {
            let (head, mut tail) = stack.split();
            let level_data = head.calloc(32).unwrap();
            level_data.fill(7);

            for _ in 0..10 {
                tail.set_marker();
                let scratch = tail.calloc(64).unwrap();
                scratch.fill(9);
                assert!(tail.alloc(64).is_err(), "only 32 bytes should be left");
                tail.free_to_marker();
            }
            assert_eq!(&[7; 32], level_data, "tail rewinds should not touch the head");

            tail.reset();
            let _ = tail.alloc_aligned(8, 32).unwrap();
        }
        assert_eq!(32, stack.head());
        assert!(stack.tail() < 128);
    }

    #[test]
    fn huge_requests_are_out_of_memory() {
        let platform = TestPlatform::new();
        let stack = DoubleStackAllocator::new(&platform, AllocatorConfig::DEFAULT, 64);
        assert_eq!(
            Err(AllocError::OutOfMemory {
                requested: usize::MAX,
                remaining: 64
            }),
            stack.alloc_tail(usize::MAX - 3).map(|_| ()),
        );
        assert!(stack.alloc_head(usize::MAX).is_err());
        assert_eq!((0, 64), (stack.head(), stack.tail()));
    }

    #[test]
    fn zeroed_and_aligned_allocations() {
        let platform = TestPlatform::new();
        let stack = DoubleStackAllocator::new(&platform, AllocatorConfig::DEFAULT, 256);

        let head = stack.calloc_head(12).unwrap();
        assert_eq!(&[0; 12], head);
        let tail = stack.calloc_tail(12).unwrap();
        assert_eq!(&[0; 12], tail);
        head.fill(0xAA);
        assert_eq!(&[0; 12], tail, "head writes should not reach the tail");

        let aligned = stack.alloc_tail_aligned(5, 64).unwrap();
        assert_eq!(0, aligned.as_ptr() as usize % 64);
        assert_eq!(5, aligned.len());
    }

    #[test]
    fn reset_releases_the_buffer() {
        let platform = TestPlatform::new();
        let mut stack = DoubleStackAllocator::new(&platform, AllocatorConfig::DEFAULT, 64);
        assert_eq!(1, platform.live_allocations());
        stack.reset();
        assert_eq!(0, platform.live_allocations());
        assert!(stack.alloc_head(1).is_err());
        assert!(stack.alloc_tail(1).is_err());
        drop(stack);
        assert_eq!(0, platform.live_allocations());
    }

    #[test]
    #[should_panic(expected = "allocation alignment must be a power of two")]
    fn non_power_of_two_alignment_is_fatal() {
        let platform = TestPlatform::new();
        let stack = DoubleStackAllocator::new(&platform, AllocatorConfig::DEFAULT, 64);
        let _ = stack.alloc_tail_aligned(8, 0);
    }
}
