// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Custom memory allocators for the engine: a fixed-block [`PoolAllocator`],
//! a rewindable [`StackAllocator`], and their compositions, the
//! [`DoubleStackAllocator`] and the [`DoubleFrameAllocator`]. All of them get
//! their memory in big chunks through a [`RawHeap`] over the platform's heap.
//!
//! None of the allocators are thread-safe, each instance is meant to be owned
//! by one subsystem.

#![no_std]

mod config;
mod double_frame;
mod double_stack;
mod error;
mod pool;
mod raw_heap;
mod stack;

#[cfg(test)]
mod test_platform;

pub use config::AllocatorConfig;
pub use double_frame::{DoubleFrameAllocator, FrameSlice};
pub use double_stack::{DoubleStackAllocator, HeadStack, TailStack};
pub use error::AllocError;
pub use pool::{PoolAllocator, PoolBox};
pub use raw_heap::{fatal, RawHeap};
pub use stack::StackAllocator;
