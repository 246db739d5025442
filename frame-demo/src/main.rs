// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

mod cli;
mod settings;
mod simulation;

use platform_std::StdPal;

fn main() -> anyhow::Result<()> {
    let opts = cli::options().run();

    tracing_subscriber::fmt()
        .with_max_level(opts.verbosity_level)
        .with_writer(std::io::stderr)
        .init();

    let settings = settings::read(opts.config_path.as_deref())?;
    tracing::debug!(?settings, "settings loaded");

    let platform = StdPal::new();
    let summary = simulation::run(&platform, &settings, opts.frames)?;
    tracing::info!(
        frames = summary.frames,
        spawned = summary.particles_spawned,
        refused = summary.spawns_refused,
        alive = summary.particles_alive,
        peak = summary.peak_particles,
        "particle simulation finished"
    );
    tracing::info!(
        pool_buffers = summary.pool_buffers,
        pool_memory = summary.pool_memory,
        peak_frame_usage = summary.peak_frame_usage,
        dropped_snapshots = summary.dropped_snapshots,
        interpolated_frames = summary.interpolated_frames,
        average_step = summary.average_step,
        "allocator usage"
    );
    Ok(())
}
