use std::{fs, path::Path};

use anyhow::Context;
use memory::AllocatorConfig;
use serde::{Deserialize, Serialize};

/// The sizes of everything the frame loop allocates. Fields missing from the
/// settings file keep their default values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DemoSettings {
    pub allocators: AllocatorConfig,
    /// Capacity of each of the two frame stacks, in bytes.
    pub frame_capacity: usize,
    /// Capacity of the level allocator, which holds the tiles at its head and
    /// per-frame scratch at its tail, in bytes.
    pub level_capacity: usize,
    /// Amount of one-byte tiles loaded into the level.
    pub level_tiles: usize,
    pub particles_per_buffer: usize,
    pub max_particles: usize,
    /// The particle pool stops growing on this frame.
    pub lock_pool_after: u64,
}

impl Default for DemoSettings {
    fn default() -> Self {
        DemoSettings {
            allocators: AllocatorConfig::DEFAULT,
            frame_capacity: 64 * 1024,
            level_capacity: 16 * 1024,
            level_tiles: 64 * 64,
            particles_per_buffer: 64,
            max_particles: 256,
            lock_pool_after: 60,
        }
    }
}

pub fn read(path: Option<&Path>) -> anyhow::Result<DemoSettings> {
    let Some(path) = path else {
        return Ok(DemoSettings::default());
    };
    let settings = fs::read_to_string(path)
        .with_context(|| format!("Failed to open the settings file {}", path.display()))?;
    let settings: DemoSettings =
        serde_json::from_str(&settings).context("Failed to parse the settings file")?;
    validate(&settings)?;
    Ok(settings)
}

/// Catches the settings the allocators would treat as fatal precondition
/// violations, so they can be reported as regular errors instead.
fn validate(settings: &DemoSettings) -> anyhow::Result<()> {
    let alignment = settings.allocators.alignment;
    anyhow::ensure!(
        alignment.is_power_of_two(),
        "allocators.alignment must be a power of two, not {alignment}",
    );
    let min_stack_capacity = settings.allocators.min_stack_capacity;
    anyhow::ensure!(
        settings.frame_capacity >= min_stack_capacity
            && settings.level_capacity >= min_stack_capacity,
        "frame_capacity and level_capacity must be at least {min_stack_capacity} bytes",
    );
    anyhow::ensure!(
        settings.particles_per_buffer > 0,
        "particles_per_buffer must be at least 1",
    );
    anyhow::ensure!(settings.level_tiles > 0, "level_tiles must be at least 1");
    Ok(())
}
