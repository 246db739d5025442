// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

mod boxed;

use core::{cell::Cell, fmt::Debug, ptr::NonNull};

use platform_abstraction_layer::Pal;

use crate::{
    raw_heap::{fatal, precondition, RawHeap},
    AllocError, AllocatorConfig,
};

pub use boxed::PoolBox;

/// Written at the start of every free slot, linking it to the next free slot.
#[repr(C)]
struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

/// Written at the start of every buffer, linking it to the previously
/// allocated buffer.
#[repr(C)]
struct BufferHeader {
    next: Option<NonNull<BufferHeader>>,
}

/// A fixed-size block allocator.
///
/// Hands out blocks of [`PoolAllocator::element_size`] bytes in constant time
/// from a free list threaded through the unused blocks themselves. The blocks
/// live in buffers of [`PoolAllocator::buffer_capacity`] blocks each, which
/// are chained together: when the free list runs out, another buffer is
/// allocated and prepended to the chain, unless the pool has been made
/// static with [`PoolAllocator::set_static`].
///
/// Buffers are only released by [`PoolAllocator::reset`] (or dropping the
/// pool), so blocks never move, and the pool reserves enough memory for its
/// peak usage.
///
/// For storing values of a specific type, see [`PoolAllocator::insert`].
pub struct PoolAllocator<'platform> {
    heap: RawHeap<'platform>,
    element_size: usize,
    alignment: usize,
    buffer_capacity: usize,
    /// The size of the [`BufferHeader`] rounded up to `alignment`, i.e. the
    /// offset of the first block in each buffer.
    header_size: usize,
    is_static: Cell<bool>,
    /// The most recently allocated buffer, the head of the buffer chain.
    buffers: Cell<Option<NonNull<BufferHeader>>>,
    buffer_count: Cell<usize>,
    free_list: Cell<Option<NonNull<FreeNode>>>,
    /// The amount of nodes reachable from `free_list`.
    free_count: Cell<usize>,
    total_capacity: Cell<usize>,
}

impl Debug for PoolAllocator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("element_size", &self.element_size)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("buffer_count", &self.buffer_count)
            .field("free_count", &self.free_count)
            .field("total_capacity", &self.total_capacity)
            .field("is_static", &self.is_static)
            .finish_non_exhaustive()
    }
}

impl Drop for PoolAllocator<'_> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<'platform> PoolAllocator<'platform> {
    /// Creates a new pool for blocks of `element_size` bytes, and allocates the
    /// first buffer of `capacity_per_buffer` blocks.
    ///
    /// `element_size` is raised to fit a pointer if it's smaller, and rounded
    /// up to the configured alignment (or pointer alignment, if that's
    /// larger). `capacity_per_buffer` must be at least 1, and is raised to
    /// [`AllocatorConfig::min_pool_buffer_capacity`] if it's smaller.
    #[track_caller]
    pub fn new(
        platform: &'platform dyn Pal,
        config: AllocatorConfig,
        element_size: usize,
        capacity_per_buffer: usize,
    ) -> PoolAllocator<'platform> {
        config.validate(platform);
        precondition(
            platform,
            capacity_per_buffer > 0,
            "pool buffers must have room for at least one block",
        );

        let alignment = config.alignment.max(align_of::<FreeNode>());
        let element_size = element_size
            .max(size_of::<FreeNode>())
            .checked_next_multiple_of(alignment);
        let buffer_capacity = capacity_per_buffer.max(config.min_pool_buffer_capacity);
        let header_size = size_of::<BufferHeader>().next_multiple_of(alignment);
        let buffer_size = element_size
            .and_then(|element_size| element_size.checked_mul(buffer_capacity))
            .and_then(|slots_size| slots_size.checked_add(header_size));
        let (Some(element_size), Some(buffer_size)) = (element_size, buffer_size) else {
            fatal(platform, "pool buffer size overflows usize");
        };
        precondition(
            platform,
            buffer_size <= isize::MAX as usize,
            "pool buffer size overflows isize",
        );

        let pool = PoolAllocator {
            heap: RawHeap::new(platform),
            element_size,
            alignment,
            buffer_capacity,
            header_size,
            is_static: Cell::new(false),
            buffers: Cell::new(None),
            buffer_count: Cell::new(0),
            free_list: Cell::new(None),
            free_count: Cell::new(0),
            total_capacity: Cell::new(0),
        };
        pool.grow();
        pool
    }

    /// The size of each block, in bytes.
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// The alignment of each block, in bytes.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// The amount of blocks in each buffer.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// The amount of buffers currently owned by the pool.
    pub fn buffer_count(&self) -> usize {
        self.buffer_count.get()
    }

    /// The total amount of blocks across all buffers, free or not.
    pub fn capacity(&self) -> usize {
        self.total_capacity.get()
    }

    /// The amount of blocks available without growing.
    pub fn free_count(&self) -> usize {
        self.free_count.get()
    }

    /// The amount of heap memory held by the pool, in bytes.
    pub fn memory_usage(&self) -> usize {
        self.buffer_count.get() * self.buffer_size()
    }

    pub fn is_static(&self) -> bool {
        self.is_static.get()
    }

    /// While static, the pool does not grow: [`PoolAllocator::allocate`]
    /// returns [`AllocError::PoolExhausted`] instead. Useful for catching
    /// unbounded growth once a system's memory usage should've stabilized.
    pub fn set_static(&self, is_static: bool) {
        self.is_static.set(is_static);
    }

    /// Pops a block off the free list, growing the pool by one buffer if the
    /// free list is empty and the pool isn't static.
    ///
    /// The block is `element_size` bytes, aligned to `alignment`, and its
    /// contents are unspecified. It stays valid until it's passed to
    /// [`PoolAllocator::free`], or the pool is reset or dropped.
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        let head = match self.free_list.get() {
            Some(head) => head,
            None if self.is_static.get() => {
                tracing::warn!(capacity = self.capacity(), "static pool is exhausted");
                return Err(AllocError::PoolExhausted {
                    capacity: self.capacity(),
                });
            }
            None => self.grow(),
        };

        // Safety: every node in the free list is a block in one of our buffers,
        // which had a FreeNode written to it when it was added to the list.
        let next = unsafe { head.as_ptr().read().next };
        self.free_list.set(next);
        self.free_count.set(self.free_count.get() - 1);

        Ok(head.cast())
    }

    /// Pushes a block back onto the free list.
    ///
    /// Blocks that aren't in any of this pool's buffers, or not at a block
    /// boundary, are reported as a fatal error. Every buffer in the chain is
    /// checked, so this is O(buffers).
    ///
    /// ### Safety
    ///
    /// `block` must have been returned by [`PoolAllocator::allocate`] of this
    /// pool, and not freed since (double frees are not detected). The block
    /// must not be accessed after this call.
    #[track_caller]
    pub unsafe fn free(&self, block: NonNull<u8>) {
        let platform = self.heap.platform();
        if !self.owns(block) {
            fatal(platform, "freed a block this pool does not own");
        }
        precondition(
            platform,
            self.free_count.get() < self.total_capacity.get(),
            "freed more blocks than the pool has handed out",
        );

        let node = block.cast::<FreeNode>();
        // Safety: the block is one of ours (checked above) and the caller
        // guarantees it's not in use anymore. Blocks are aligned for FreeNode
        // and large enough to fit one, see the constructor.
        unsafe {
            node.as_ptr().write(FreeNode {
                next: self.free_list.get(),
            })
        };
        self.free_list.set(Some(node));
        self.free_count.set(self.free_count.get() + 1);
    }

    /// Returns true if `block` is at a block boundary in one of this pool's
    /// buffers.
    pub fn owns(&self, block: NonNull<u8>) -> bool {
        let address = block.as_ptr() as usize;
        let slots_size = self.buffer_capacity * self.element_size;
        self.buffers().any(|buffer| {
            let first_block = buffer.as_ptr() as usize + self.header_size;
            (first_block..first_block + slots_size).contains(&address)
                && (address - first_block) % self.element_size == 0
        })
    }

    /// Marks every block of every buffer free again, without releasing any
    /// memory. Any blocks still in use are invalidated.
    pub fn clear(&mut self) {
        // Safety: though this is not an unsafe operation itself, it relies on
        // nobody using the blocks anymore. Safe code only gets at blocks via
        // PoolBox, which borrows the pool, so the exclusive borrow here means
        // no PoolBoxes are alive. Raw blocks from `allocate` come with the
        // caveat of not being used after a clear.
        self.free_list.set(None);
        self.free_count.set(0);
        let mut buffer = self.buffers.get();
        while let Some(current) = buffer {
            self.thread_free_list(current);
            // Safety: every buffer starts with a BufferHeader written in grow.
            buffer = unsafe { current.as_ptr().read().next };
        }
    }

    /// Releases every buffer, leaving the pool with no capacity. The next
    /// [`PoolAllocator::allocate`] will allocate a new buffer, unless the pool
    /// is static.
    pub fn reset(&mut self) {
        let mut buffer = self.buffers.take();
        let released = self.buffer_count.get();
        while let Some(current) = buffer {
            // Safety: every buffer starts with a BufferHeader written in grow.
            buffer = unsafe { current.as_ptr().read().next };
            // Safety: the buffer is from this heap, and since we have an
            // exclusive borrow of self, there are no PoolBoxes pointing into
            // it anymore.
            unsafe { self.heap.free(current.cast()) };
        }
        if released > 0 {
            tracing::debug!(buffers = released, "released pool buffers");
        }

        self.buffer_count.set(0);
        self.free_list.set(None);
        self.free_count.set(0);
        self.total_capacity.set(0);
    }

    fn buffer_size(&self) -> usize {
        self.header_size + self.buffer_capacity * self.element_size
    }

    fn buffers(&self) -> impl Iterator<Item = NonNull<BufferHeader>> + '_ {
        core::iter::successors(self.buffers.get(), |buffer| {
            // Safety: every buffer starts with a BufferHeader written in grow.
            unsafe { buffer.as_ptr().read().next }
        })
    }

    /// Allocates a new buffer, prepends it to the buffer chain and its blocks
    /// to the free list. Returns the new head of the free list.
    fn grow(&self) -> NonNull<FreeNode> {
        let buffer = self
            .heap
            .allocate_aligned(self.buffer_size(), self.alignment)
            .cast::<BufferHeader>();
        // Safety: the buffer is at least `header_size` bytes, and aligned for
        // the header since `alignment` is at least pointer alignment.
        unsafe {
            buffer.as_ptr().write(BufferHeader {
                next: self.buffers.get(),
            })
        };
        self.buffers.set(Some(buffer));
        self.buffer_count.set(self.buffer_count.get() + 1);
        self.total_capacity
            .set(self.total_capacity.get() + self.buffer_capacity);

        let head = self.thread_free_list(buffer);
        tracing::debug!(
            element_size = self.element_size,
            capacity = self.capacity(),
            buffers = self.buffer_count(),
            "pool grew by one buffer"
        );
        head
    }

    /// Writes a FreeNode into every block of `buffer`, linking each to the next
    /// one and the last to the current free list head, and makes the first
    /// block the new head.
    fn thread_free_list(&self, buffer: NonNull<BufferHeader>) -> NonNull<FreeNode> {
        // Safety: the header is followed by `buffer_capacity` blocks of
        // `element_size` bytes, all within the buffer's allocation.
        let first_block = unsafe { buffer.cast::<u8>().add(self.header_size) };
        let mut next = self.free_list.get();
        for i in (0..self.buffer_capacity).rev() {
            // Safety: `i` is a valid block index (see above), and blocks are
            // aligned for and large enough to fit a FreeNode.
            let node = unsafe { first_block.add(i * self.element_size) }.cast::<FreeNode>();
            unsafe { node.as_ptr().write(FreeNode { next }) };
            next = Some(node);
        }
        let Some(head) = next else {
            unreachable!("pool buffers always have at least one block");
        };

        self.free_list.set(Some(head));
        self.free_count
            .set(self.free_count.get() + self.buffer_capacity);
        head
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use crate::{test_platform::TestPlatform, AllocError, AllocatorConfig};

    use super::PoolAllocator;

    #[test]
    fn blocks_are_contiguous_within_a_buffer() {
        let platform = TestPlatform::new();
        let pool = PoolAllocator::new(&platform, AllocatorConfig::DEFAULT, 16, 4);
        assert_eq!(16, pool.element_size());
        assert_eq!(4, pool.capacity());

        let blocks: Vec<usize> = (0..4)
            .map(|_| pool.allocate().unwrap().as_ptr() as usize)
            .collect();
        for pair in blocks.windows(2) {
            assert_eq!(pair[0] + 16, pair[1], "blocks should be 16 bytes apart");
        }
        for block in &blocks {
            assert_eq!(0, block % pool.alignment());
        }
        assert_eq!(0, pool.free_count());

        let fifth = pool.allocate().unwrap();
        assert_eq!(8, pool.capacity());
        assert_eq!(2, pool.buffer_count());
        assert_eq!(3, pool.free_count());
        assert!(!blocks.contains(&(fifth.as_ptr() as usize)));
    }

    #[test]
    fn element_size_is_raised_and_aligned() {
        let platform = TestPlatform::new();
        let tiny = PoolAllocator::new(&platform, AllocatorConfig::DEFAULT, 1, 4);
        assert_eq!(size_of::<usize>().next_multiple_of(8), tiny.element_size());

        let odd = PoolAllocator::new(&platform, AllocatorConfig::DEFAULT.with_alignment(16), 20, 4);
        assert_eq!(32, odd.element_size());
        assert_eq!(0, odd.allocate().unwrap().as_ptr() as usize % 16);
    }

    #[test]
    fn buffer_capacity_is_raised_to_the_floor() {
        let platform = TestPlatform::new();
        let config = AllocatorConfig {
            min_pool_buffer_capacity: 16,
            ..AllocatorConfig::DEFAULT
        };
        let pool = PoolAllocator::new(&platform, config, 8, 2);
        assert_eq!(16, pool.buffer_capacity());
        assert_eq!(16, pool.free_count());
    }

    #[test]
    fn freed_blocks_are_reused_first() {
        let platform = TestPlatform::new();
        let pool = PoolAllocator::new(&platform, AllocatorConfig::DEFAULT, 32, 8);

        let _a = pool.allocate().unwrap();
        let free_before = pool.free_count();
        let b = pool.allocate().unwrap();
        unsafe { pool.free(b) };
        assert_eq!(free_before, pool.free_count());
        assert_eq!(b, pool.allocate().unwrap(), "free list should be LIFO");
    }

    #[test]
    fn growth_keeps_earlier_blocks_valid() {
        let platform = TestPlatform::new();
        let pool = PoolAllocator::new(&platform, AllocatorConfig::DEFAULT, 8, 4);

        let mut blocks = Vec::new();
        for i in 0..20u64 {
            let block = pool.allocate().unwrap();
            unsafe { block.cast::<u64>().as_ptr().write(i) };
            blocks.push(block);
        }
        assert_eq!(5, pool.buffer_count());
        assert_eq!(5, platform.live_allocations());

        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(i as u64, unsafe { block.cast::<u64>().as_ptr().read() });
            assert!(pool.owns(*block));
        }
        let mut addresses: Vec<_> = blocks.iter().map(|b| b.as_ptr() as usize).collect();
        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(20, addresses.len(), "blocks should be distinct");

        // Blocks from the oldest buffer can be freed after growth too.
        unsafe { pool.free(blocks[0]) };
        assert_eq!(1, pool.free_count());
    }

    #[test]
    fn static_pools_do_not_grow() {
        let platform = TestPlatform::new();
        let pool = PoolAllocator::new(&platform, AllocatorConfig::DEFAULT, 8, 2);
        pool.set_static(true);
        assert!(pool.is_static());

        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert_eq!(
            Err(AllocError::PoolExhausted { capacity: 2 }),
            pool.allocate()
        );
        assert_eq!(1, pool.buffer_count());

        unsafe { pool.free(a) };
        assert_eq!(Ok(a), pool.allocate());

        pool.set_static(false);
        assert!(pool.allocate().is_ok());
        assert_eq!(2, pool.buffer_count());
    }

    #[test]
    fn clear_frees_every_block() {
        let platform = TestPlatform::new();
        let mut pool = PoolAllocator::new(&platform, AllocatorConfig::DEFAULT, 8, 3);
        for _ in 0..5 {
            pool.allocate().unwrap();
        }
        assert_eq!(1, pool.free_count());

        pool.clear();
        assert_eq!(6, pool.free_count());
        assert_eq!(6, pool.capacity());
        assert_eq!(2, platform.live_allocations());
        for _ in 0..6 {
            pool.allocate().unwrap();
        }
        assert_eq!(2, pool.buffer_count(), "cleared pool should not need to grow");
    }

    #[test]
    fn reset_releases_every_buffer() {
        let platform = TestPlatform::new();
        let mut pool = PoolAllocator::new(&platform, AllocatorConfig::DEFAULT, 8, 2);
        for _ in 0..5 {
            pool.allocate().unwrap();
        }
        assert_eq!(3, platform.live_allocations());
        let header_size = size_of::<usize>().next_multiple_of(8);
        assert_eq!(3 * (header_size + 2 * pool.element_size()), pool.memory_usage());

        pool.reset();
        assert_eq!(0, platform.live_allocations());
        assert_eq!((0, 0, 0), (pool.capacity(), pool.free_count(), pool.memory_usage()));
        pool.reset();

        // A reset pool grows again on demand.
        assert!(pool.allocate().is_ok());
        assert_eq!(2, pool.capacity());
        drop(pool);
        assert_eq!(0, platform.live_allocations());
    }

    #[test]
    #[should_panic(expected = "freed a block this pool does not own")]
    fn freeing_a_foreign_block_is_fatal() {
        let platform = TestPlatform::new();
        let pool = PoolAllocator::new(&platform, AllocatorConfig::DEFAULT, 16, 4);
        let other = PoolAllocator::new(&platform, AllocatorConfig::DEFAULT, 16, 4);
        let block = other.allocate().unwrap();
        unsafe { pool.free(block) };
    }

    #[test]
    #[should_panic(expected = "freed a block this pool does not own")]
    fn freeing_a_misaligned_block_is_fatal() {
        let platform = TestPlatform::new();
        let pool = PoolAllocator::new(&platform, AllocatorConfig::DEFAULT, 16, 4);
        let block = pool.allocate().unwrap();
        unsafe { pool.free(block.add(8)) };
    }

    #[test]
    #[should_panic(expected = "pool buffers must have room for at least one block")]
    fn zero_capacity_is_fatal() {
        let platform = TestPlatform::new();
        let _ = PoolAllocator::new(&platform, AllocatorConfig::DEFAULT, 16, 0);
    }
}
