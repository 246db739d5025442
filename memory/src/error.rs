// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use core::fmt::{self, Display};

/// The recoverable allocation failures. Everything else (misuse of the API,
/// the heap running dry) is reported through the platform and terminates the
/// process, see [`fatal`](crate::fatal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// A stack-like allocator does not have `requested` bytes left. The
    /// `requested` size includes alignment rounding.
    OutOfMemory { requested: usize, remaining: usize },
    /// A static [`PoolAllocator`](crate::PoolAllocator) has handed out all of
    /// its `capacity` blocks and isn't allowed to grow.
    PoolExhausted { capacity: usize },
}

impl Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory {
                requested,
                remaining,
            } => write!(
                f,
                "out of memory: requested {requested} bytes, {remaining} bytes remaining"
            ),
            AllocError::PoolExhausted { capacity } => {
                write!(f, "static pool exhausted: all {capacity} blocks are in use")
            }
        }
    }
}

impl core::error::Error for AllocError {}
