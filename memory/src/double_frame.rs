// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::{
    fmt::Debug,
    marker::PhantomData,
    ops::Deref,
    sync::atomic::{AtomicUsize, Ordering},
};

use bytemuck::Pod;
use platform_abstraction_layer::Pal;

use crate::{AllocError, AllocatorConfig, StackAllocator};

static NEXT_ALLOCATOR_ID: AtomicUsize = AtomicUsize::new(0);

/// A handle to a slice allocated with
/// [`DoubleFrameAllocator::alloc_frame_slice`]. Resolved with
/// [`DoubleFrameAllocator::get`], which succeeds during the frame the slice
/// was allocated in and the one after it.
pub struct FrameSlice<T> {
    allocator_id: usize,
    frame: u64,
    offset: usize,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FrameSlice<T> {
    /// The frame this slice was allocated in.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Clone for FrameSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FrameSlice<T> {}

impl<T> Debug for FrameSlice<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameSlice")
            .field("frame", &self.frame)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Two equally sized [`StackAllocator`]s taking turns being the "current"
/// and the "previous" frame's allocator.
///
/// Allocations go to the current stack (this type derefs to it, so every
/// [`StackAllocator`] allocation function is available). At each frame
/// boundary, [`DoubleFrameAllocator::swap`] makes the current stack the
/// previous one, and empties the other stack to become the new current one.
/// So everything allocated during a frame stays intact for one more frame,
/// which is handy for e.g. interpolating between the last two frames' states.
///
/// Borrows from the allocation functions can't survive a swap, since swapping
/// requires an exclusive borrow. To read last frame's data after a swap,
/// allocate it with [`DoubleFrameAllocator::alloc_frame_slice`] and read it
/// back with [`DoubleFrameAllocator::get`].
pub struct DoubleFrameAllocator<'platform> {
    stacks: [StackAllocator<'platform>; 2],
    /// Index of the current stack in `stacks`.
    current: usize,
    id: usize,
    frame: u64,
    /// Handles from frames before this one don't resolve anymore, even if
    /// they're from the previous frame.
    oldest_valid_frame: u64,
}

impl Debug for DoubleFrameAllocator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DoubleFrameAllocator")
            .field("current", self.current())
            .field("previous", self.previous())
            .field("frame", &self.frame)
            .finish_non_exhaustive()
    }
}

impl<'platform> Deref for DoubleFrameAllocator<'platform> {
    type Target = StackAllocator<'platform>;

    fn deref(&self) -> &Self::Target {
        self.current()
    }
}

impl<'platform> DoubleFrameAllocator<'platform> {
    /// Creates a new [`DoubleFrameAllocator`], with two stacks of `capacity`
    /// bytes each.
    #[track_caller]
    pub fn new(
        platform: &'platform dyn Pal,
        config: AllocatorConfig,
        capacity: usize,
    ) -> DoubleFrameAllocator<'platform> {
        DoubleFrameAllocator {
            stacks: [
                StackAllocator::new(platform, config, capacity),
                StackAllocator::new(platform, config, capacity),
            ],
            current: 0,
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            frame: 0,
            oldest_valid_frame: 0,
        }
    }

    /// The stack allocations are currently made from.
    pub fn current(&self) -> &StackAllocator<'platform> {
        &self.stacks[self.current]
    }

    /// The stack holding the previous frame's allocations.
    pub fn previous(&self) -> &StackAllocator<'platform> {
        &self.stacks[1 - self.current]
    }

    /// The current frame number. Starts at 0, increases by one on every swap.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Returns false after [`DoubleFrameAllocator::reset`].
    pub fn is_initialized(&self) -> bool {
        self.stacks.iter().all(StackAllocator::is_initialized)
    }

    /// Moves on to the next frame: the current stack becomes the previous one,
    /// and the previous one is emptied and becomes the current one.
    ///
    /// Should be called exactly once per frame, after everything reading the
    /// previous frame's data is done, and before the new frame's allocations.
    pub fn swap(&mut self) {
        self.current = 1 - self.current;
        self.stacks[self.current].free();
        self.frame += 1;
        tracing::trace!(
            frame = self.frame,
            previous_frame_usage = self.previous().top(),
            "swapped frame allocators"
        );
    }

    /// Empties both stacks, discarding the previous frame's allocations too.
    /// This starts a new frame, with no handles from earlier frames resolving.
    pub fn free(&mut self) {
        for stack in &mut self.stacks {
            stack.free();
        }
        self.frame += 1;
        self.oldest_valid_frame = self.frame;
    }

    /// Releases both stacks' backing memory. Any allocations made after this
    /// fail with [`AllocError::OutOfMemory`].
    pub fn reset(&mut self) {
        for stack in &mut self.stacks {
            stack.reset();
        }
        self.frame += 1;
        self.oldest_valid_frame = self.frame;
    }

    /// Allocates a copy of `src` from the current stack, returning a handle
    /// which can be resolved during this frame and the next one.
    pub fn alloc_frame_slice<T: Pod>(&self, src: &[T]) -> Result<FrameSlice<T>, AllocError> {
        let current = self.current();
        let copy = current.alloc_slice_copy(src)?;
        let Some(offset) = current.offset_of(copy.as_ptr()) else {
            unreachable!("the allocation was just made from the current stack");
        };
        Ok(FrameSlice {
            allocator_id: self.id,
            frame: self.frame,
            offset,
            len: src.len(),
            _marker: PhantomData,
        })
    }

    /// Resolves a handle from [`DoubleFrameAllocator::alloc_frame_slice`].
    /// Returns None if the handle is from another allocator, or if its frame
    /// is neither the current nor the previous one.
    pub fn get<T: Pod>(&self, slice: FrameSlice<T>) -> Option<&[T]> {
        if slice.allocator_id != self.id || slice.frame < self.oldest_valid_frame {
            return None;
        }
        let stack = if slice.frame == self.frame {
            self.current()
        } else if slice.frame + 1 == self.frame {
            self.previous()
        } else {
            return None;
        };
        // Safety:
        // - The handle is from this allocator, and from a frame whose stack
        //   has not been emptied since: `swap` only empties the stack two
        //   frames back, and `free` and `reset` invalidate every earlier
        //   frame.
        // - alloc_frame_slice initialized the whole range as `T`s, and it
        //   never deals out a mutable borrow to it.
        unsafe { stack.slice_at(slice.offset, slice.len) }
    }
}

#[cfg(test)]
mod tests {
    use crate::{test_platform::TestPlatform, AllocatorConfig};

    use super::DoubleFrameAllocator;

    #[test]
    fn data_survives_exactly_one_swap() {
        let platform = TestPlatform::new();
        let mut frames = DoubleFrameAllocator::new(&platform, AllocatorConfig::DEFAULT, 64);

        let first = frames.alloc_frame_slice(&[0xC0FFEE_u64]).unwrap();
        assert_eq!(Some(&[0xC0FFEE][..]), frames.get(first));

        frames.swap();
        assert_eq!(1, frames.frame());
        assert_eq!(Some(&[0xC0FFEE][..]), frames.get(first), "should survive one swap");
        let second = frames.alloc_frame_slice(&[1u64, 2]).unwrap();
        assert_eq!(Some(&[0xC0FFEE][..]), frames.get(first), "new frame should not overwrite");
        assert_eq!(Some(&[1, 2][..]), frames.get(second));

        frames.swap();
        assert_eq!(None, frames.get(first), "should not survive two swaps");
        assert_eq!(Some(&[1, 2][..]), frames.get(second));
    }

    #[test]
    fn swap_empties_the_new_current_stack() {
        let platform = TestPlatform::new();
        let mut frames = DoubleFrameAllocator::new(&platform, AllocatorConfig::DEFAULT, 64);

        let frame_0_ptr = frames.try_alloc_bytes(8).unwrap().as_ptr() as usize;
        frames.swap();
        let _ = frames.try_alloc_bytes(24).unwrap();
        assert_eq!(8, frames.previous().top());
        assert_eq!(24, frames.current().top());

        frames.swap();
        assert_eq!(0, frames.top(), "the new current stack should be empty");
        assert_eq!(24, frames.previous().top());
        let frame_2_ptr = frames.try_alloc_bytes(8).unwrap().as_ptr() as usize;
        assert_eq!(frame_0_ptr, frame_2_ptr, "frame 0 memory should be reused in frame 2");
    }

    #[test]
    fn current_frame_exhaustion_is_recoverable() {
        let platform = TestPlatform::new();
        let mut frames = DoubleFrameAllocator::new(&platform, AllocatorConfig::DEFAULT, 64);
        assert!(frames.try_alloc_bytes(64).is_ok());
        assert!(frames.try_alloc_bytes(1).is_err());
        frames.swap();
        assert!(frames.try_alloc_bytes(64).is_ok(), "the other stack should be empty");
    }

    #[test]
    fn free_discards_history() {
        let platform = TestPlatform::new();
        let mut frames = DoubleFrameAllocator::new(&platform, AllocatorConfig::DEFAULT, 64);
        let old = frames.alloc_frame_slice(&[1u32]).unwrap();
        frames.swap();
        let recent = frames.alloc_frame_slice(&[2u32]).unwrap();

        frames.free();
        assert_eq!((0, 0), (frames.current().top(), frames.previous().top()));
        assert_eq!(None, frames.get(old));
        assert_eq!(None, frames.get(recent));
    }

    #[test]
    fn handles_do_not_resolve_in_other_allocators() {
        let platform = TestPlatform::new();
        let a = DoubleFrameAllocator::new(&platform, AllocatorConfig::DEFAULT, 64);
        let b = DoubleFrameAllocator::new(&platform, AllocatorConfig::DEFAULT, 64);
        let handle = a.alloc_frame_slice(&[7u8; 4]).unwrap();
        let _ = b.alloc_frame_slice(&[8u8; 4]).unwrap();
        assert_eq!(None, b.get(handle));
        assert_eq!(Some(&[7u8; 4][..]), a.get(handle));
    }

    #[test]
    fn reset_goes_back_to_uninitialized() {
        let platform = TestPlatform::new();
        let mut frames = DoubleFrameAllocator::new(&platform, AllocatorConfig::DEFAULT, 64);
        assert!(frames.is_initialized());
        assert_eq!(2, platform.live_allocations());

        let handle = frames.alloc_frame_slice(&[1u16]).unwrap();
        frames.reset();
        assert!(!frames.is_initialized());
        assert_eq!(0, platform.live_allocations());
        assert_eq!(None, frames.get(handle));
        assert!(frames.try_alloc_bytes(1).is_err());
    }
}
