use core::{
    fmt::Debug,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

use crate::raw_heap::precondition;

use super::PoolAllocator;

/// A container for `T`. Think of `Box`, but allocated from a
/// [`PoolAllocator`]. Drops the value and frees the block on drop.
///
/// ## Lifetime notes
///
/// `'pool` is the lifetime of the [`PoolAllocator::insert`] borrow, which
/// keeps the pool from being reset, cleared or dropped while this box exists.
///
/// `'platform` is the pool's platform lifetime (the `'platform` in
/// `PoolAllocator<'platform>`).
pub struct PoolBox<'pool, 'platform, T> {
    value: NonNull<T>,
    pool: &'pool PoolAllocator<'platform>,
}

impl<T> Deref for PoolBox<'_, '_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: the value was initialized in insert, and this box is the
        // only way to reach it until it's dropped.
        unsafe { self.value.as_ref() }
    }
}

impl<T> DerefMut for PoolBox<'_, '_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: see deref.
        unsafe { self.value.as_mut() }
    }
}

impl<T: Debug> Debug for PoolBox<'_, '_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner: &T = self;
        f.debug_tuple("PoolBox").field(&inner).finish()
    }
}

impl<T> Drop for PoolBox<'_, '_, T> {
    fn drop(&mut self) {
        // Safety: the value was initialized in insert, and isn't accessible
        // after this since we're in the box's drop.
        unsafe { self.value.drop_in_place() };
        // Safety: the block is from `self.pool` (insert allocated it there)
        // and it's not used after this.
        unsafe { self.pool.free(self.value.cast()) };
    }
}

impl<'platform> PoolAllocator<'platform> {
    /// Stores the value in a [`PoolBox`], in a block from the free list or from
    /// a new buffer if the free list is empty. If the pool is static and out of
    /// blocks, the value is returned back wrapped in a [`Result::Err`].
    ///
    /// `T` must fit in a block, both size- and alignment-wise. Storing larger
    /// types is a precondition violation.
    ///
    /// If `T` doesn't implement [`Debug`] and you want to unwrap the result,
    /// use [`Result::ok`] and then unwrap.
    #[track_caller]
    pub fn insert<T>(&self, value: T) -> Result<PoolBox<'_, 'platform, T>, T> {
        precondition(
            self.heap.platform(),
            size_of::<T>() <= self.element_size && align_of::<T>() <= self.alignment,
            "the value does not fit in a pool block",
        );

        let Ok(block) = self.allocate() else {
            return Err(value);
        };
        let value_ptr = block.cast::<T>();
        // Safety: the block is a fresh, unused allocation, large and aligned
        // enough for T (checked above).
        unsafe { value_ptr.as_ptr().write(value) };

        Ok(PoolBox {
            value: value_ptr,
            pool: self,
        })
    }
}
