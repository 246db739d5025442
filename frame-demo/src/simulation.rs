use anyhow::Context;
use bytemuck::{Pod, Zeroable};
use memory::{DoubleFrameAllocator, DoubleStackAllocator, FrameSlice, PoolAllocator, PoolBox};
use platform_abstraction_layer::Pal;

use crate::settings::DemoSettings;

const SPAWNS_PER_FRAME: usize = 4;
const PARTICLE_LIFETIME: u32 = 90;

#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// One particle's position in a frame's snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Sample {
    pub id: u32,
    pub position: Position,
}

#[derive(Debug)]
struct Particle {
    id: u32,
    position: Position,
    velocity: Position,
    frames_left: u32,
}

/// What happened during [`run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub frames: u64,
    pub particles_spawned: u64,
    /// Spawns that failed because the pool was locked and out of blocks.
    pub spawns_refused: u64,
    pub particles_alive: usize,
    pub peak_particles: usize,
    pub pool_buffers: usize,
    pub pool_memory: usize,
    pub peak_frame_usage: usize,
    /// Frames whose snapshot didn't fit in the frame allocator.
    pub dropped_snapshots: u64,
    /// Frames which had the previous frame's snapshot available.
    pub interpolated_frames: u64,
    /// Average distance the particles moved between frames.
    pub average_step: f32,
}

/// A small deterministic xorshift generator for particle velocities.
struct Rng(u32);

impl Rng {
    fn next_f32(&mut self) -> f32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        (self.0 >> 8) as f32 / (1 << 24) as f32
    }
}

/// Simulates `frames` frames of bouncing particles:
///
/// - The level's tiles are loaded once into the head of a
///   [`DoubleStackAllocator`], and each frame's scratch data is allocated from
///   its tail and rewound at the end of the frame.
/// - Particles are stored in a [`PoolAllocator`], which is locked after
///   [`DemoSettings::lock_pool_after`] frames.
/// - Particle positions are snapshotted into a [`DoubleFrameAllocator`] every
///   frame, and compared against the previous frame's snapshot.
pub fn run(platform: &dyn Pal, settings: &DemoSettings, frames: u64) -> anyhow::Result<Summary> {
    let config = settings.allocators;
    let mut level = DoubleStackAllocator::new(platform, config, settings.level_capacity);
    let (head, mut tail) = level.split();

    let width = (settings.level_tiles as f64).sqrt().max(1.0) as usize;
    let height = (settings.level_tiles / width).max(1);
    let tiles = head
        .calloc(width * height)
        .context("Failed to load the level tiles")?;
    for (i, tile) in tiles.iter_mut().enumerate() {
        let (x, y) = (i % width, i / width);
        let is_wall = x == 0 || y == 0 || x == width - 1 || y == height - 1;
        *tile = if is_wall { 1 } else { 0 };
    }
    let tiles: &[u8] = tiles;
    tail.set_marker();
    tracing::debug!(width, height, "level loaded");

    let pool = PoolAllocator::new(
        platform,
        config,
        size_of::<Particle>(),
        settings.particles_per_buffer,
    );
    let mut particles: Vec<PoolBox<Particle>> = Vec::with_capacity(settings.max_particles);
    let mut frame_allocator = DoubleFrameAllocator::new(platform, config, settings.frame_capacity);
    let mut previous_snapshot: Option<FrameSlice<Sample>> = None;
    let mut snapshot = Vec::with_capacity(settings.max_particles);
    let mut rng = Rng(0x9E37_79B9);
    let mut summary = Summary::default();
    let mut total_step = 0.0;
    let mut step_samples = 0u64;

    for frame in 0..frames {
        if frame == settings.lock_pool_after {
            tracing::debug!(frame, capacity = pool.capacity(), "locking the particle pool");
            pool.set_static(true);
        }

        for _ in 0..SPAWNS_PER_FRAME {
            if particles.len() >= settings.max_particles {
                break;
            }
            let particle = Particle {
                id: summary.particles_spawned as u32,
                position: Position {
                    x: width as f32 / 2.0,
                    y: height as f32 / 2.0,
                },
                velocity: Position {
                    x: rng.next_f32() - 0.5,
                    y: rng.next_f32() - 0.5,
                },
                frames_left: PARTICLE_LIFETIME,
            };
            match pool.insert(particle) {
                Ok(particle) => {
                    particles.push(particle);
                    summary.particles_spawned += 1;
                }
                Err(_) => summary.spawns_refused += 1,
            }
        }
        summary.peak_particles = summary.peak_particles.max(particles.len());

        for particle in &mut particles {
            step(particle, tiles, width);
        }
        // Dropping the boxes returns their blocks to the pool.
        particles.retain(|particle| particle.frames_left > 0);

        {
            let row_counts = match tail.calloc(height) {
                Ok(row_counts) => Some(row_counts),
                Err(err) => {
                    tracing::warn!(frame, "no room for scratch data: {err}");
                    None
                }
            };
            if let Some(row_counts) = row_counts {
                for particle in &particles {
                    let row = (particle.position.y as usize).min(height - 1);
                    row_counts[row] = row_counts[row].saturating_add(1);
                }
                let busiest_row = (0..height).max_by_key(|&row| row_counts[row]);
                tracing::trace!(frame, ?busiest_row, "counted particles per row");
            }
        }
        tail.free_to_marker();

        snapshot.clear();
        snapshot.extend(particles.iter().map(|particle| Sample {
            id: particle.id,
            position: particle.position,
        }));
        let current_snapshot = match frame_allocator.alloc_frame_slice(&snapshot) {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(frame, "snapshot dropped: {err}");
                summary.dropped_snapshots += 1;
                None
            }
        };

        let previous = previous_snapshot.and_then(|handle| frame_allocator.get(handle));
        let current = current_snapshot.and_then(|handle| frame_allocator.get(handle));
        if let (Some(previous), Some(current)) = (previous, current) {
            summary.interpolated_frames += 1;
            for (a, b) in matching_samples(previous, current) {
                total_step += ((b.x - a.x).powi(2) + (b.y - a.y).powi(2)).sqrt();
                step_samples += 1;
            }
        }

        summary.peak_frame_usage = summary.peak_frame_usage.max(frame_allocator.top());
        previous_snapshot = current_snapshot;
        frame_allocator.swap();
        summary.frames += 1;
    }

    summary.particles_alive = particles.len();
    summary.pool_buffers = pool.buffer_count();
    summary.pool_memory = pool.memory_usage();
    if step_samples > 0 {
        summary.average_step = total_step / step_samples as f32;
    }
    Ok(summary)
}

/// Pairs up the positions of particles present in both snapshots. Snapshots
/// are sorted by id, since particles are spawned in id order and despawning
/// keeps the order of the rest.
fn matching_samples<'a>(
    previous: &'a [Sample],
    current: &'a [Sample],
) -> impl Iterator<Item = (Position, Position)> + 'a {
    let mut previous = previous.iter().peekable();
    current.iter().filter_map(move |b| {
        while previous.next_if(|a| a.id < b.id).is_some() {}
        let a = previous.next_if(|a| a.id == b.id)?;
        Some((a.position, b.position))
    })
}

fn step(particle: &mut Particle, tiles: &[u8], width: usize) {
    particle.frames_left = particle.frames_left.saturating_sub(1);
    let Position { x, y } = particle.position;
    let next = Position {
        x: x + particle.velocity.x,
        y: y + particle.velocity.y,
    };
    let tile = |position: Position| {
        let index = position.y.max(0.0) as usize * width + position.x.max(0.0) as usize;
        tiles.get(index).copied().unwrap_or(1)
    };
    if tile(Position { x: next.x, y }) != 0 {
        particle.velocity.x = -particle.velocity.x;
    }
    if tile(Position { x, y: next.y }) != 0 {
        particle.velocity.y = -particle.velocity.y;
    }
    particle.position = Position {
        x: x + particle.velocity.x,
        y: y + particle.velocity.y,
    };
}
