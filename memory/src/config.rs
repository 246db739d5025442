// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use platform_abstraction_layer::Pal;

use crate::raw_heap::precondition;

/// Tunables shared by all the allocators in this crate.
///
/// Passed by value into every allocator constructor. With the `serde` feature
/// enabled, missing fields deserialize to their [`AllocatorConfig::DEFAULT`]
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default, deny_unknown_fields)
)]
pub struct AllocatorConfig {
    /// The default alignment of allocations, in bytes. Allocation sizes are
    /// rounded up to a multiple of this, and backing buffers are aligned to
    /// it. Must be a power of two.
    pub alignment: usize,
    /// The smallest amount of elements a [`PoolAllocator`] buffer is created
    /// with. Smaller requests are silently raised to this.
    ///
    /// [`PoolAllocator`]: crate::PoolAllocator
    pub min_pool_buffer_capacity: usize,
    /// The smallest accepted capacity for the stack-like allocators, in bytes.
    /// Asking for less is a precondition violation.
    pub min_stack_capacity: usize,
}

impl AllocatorConfig {
    pub const DEFAULT: AllocatorConfig = AllocatorConfig {
        alignment: 8,
        min_pool_buffer_capacity: 1,
        min_stack_capacity: 64,
    };

    /// Returns a copy of this config with a different default alignment.
    pub const fn with_alignment(self, alignment: usize) -> AllocatorConfig {
        AllocatorConfig { alignment, ..self }
    }

    #[track_caller]
    pub(crate) fn validate(&self, platform: &dyn Pal) {
        precondition(
            platform,
            self.alignment.is_power_of_two(),
            "allocator alignment must be a power of two",
        );
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig::DEFAULT
    }
}
