//! Streaming simulator: drives the container through a camera fly-over and
//! prints the final stats as JSON.
//!
//! Usage: cargo run --release --bin stream_sim -- [OPTIONS]
//!
//! Options:
//!   --chunks <N>      Chunks along each horizontal axis (default: 16)
//!   --frames <N>      Frames to simulate (default: 240)
//!   --quads <N>       Quads per chunk (default: 256)
//!   --config <PATH>   StreamingConfig JSON (default: built-in defaults)
//!   --gpu             Use a real wgpu device instead of the headless backend

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;

use raystream::core::{logging, Result, StreamingConfig};
use raystream::gpu::{GpuBackend, HeadlessBackend, WgpuBackend};
use raystream::streaming::{
    ChunkKey, DrawMode, GarbageCollector, GeometryList, GeometryTask, GeometryType,
    StreamingContainer, StreamingStats, VertexFormat,
};

const CHUNK_SIZE: f32 = 32.0;

fn main() -> Result<()> {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let chunks = parse_usize_arg(&args, "--chunks").unwrap_or(16).max(1);
    let frames = parse_usize_arg(&args, "--frames").unwrap_or(240);
    let quads = parse_usize_arg(&args, "--quads").unwrap_or(256);
    let use_gpu = args.iter().any(|a| a == "--gpu");

    let mut config = match parse_str_arg(&args, "--config") {
        Some(path) => StreamingConfig::load_json(&PathBuf::from(path))?,
        None => StreamingConfig::default(),
    };
    config.initial_capacity = chunks * chunks;

    log::info!(
        "Simulating {} chunks x {} quads for {} frames ({})",
        config.initial_capacity,
        quads,
        frames,
        if use_gpu { "wgpu" } else { "headless" }
    );

    let start = Instant::now();
    let stats = if use_gpu {
        let backend = pollster::block_on(WgpuBackend::request_headless())?;
        run(Arc::new(backend), &config, chunks, frames, quads)?
    } else {
        run(Arc::new(HeadlessBackend::with_auto_signal()), &config, chunks, frames, quads)?
    };

    log::info!("Done in {:.2}s", start.elapsed().as_secs_f32());
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn run<B: GpuBackend>(
    backend: Arc<B>,
    config: &StreamingConfig,
    chunks: usize,
    frames: usize,
    quads: usize,
) -> Result<StreamingStats> {
    let gc = Arc::new(GarbageCollector::new(config.frames_in_flight));
    let container = StreamingContainer::new(backend, Arc::clone(&gc), config)?;
    let vertices = chunk_vertices(quads);

    // Everything starts pending; the camera's path decides build order.
    for x in 0..chunks {
        for z in 0..chunks {
            let task = chunk_task(chunks, x, z, &vertices);
            container.queue_chunk_build(&task, false)?;
        }
    }

    let extent = chunks as f32 * CHUNK_SIZE;
    for frame in 0..frames {
        gc.advance();

        let t = frame as f32 / frames.max(1) as f32;
        let camera = Vec3::new(t * extent, 24.0, extent * 0.5);

        // Edits under the camera are rebuilt immediately
        if frame % 30 == 29 {
            let x = ((camera.x / CHUNK_SIZE) as usize).min(chunks - 1);
            let z = chunks / 2;
            container.queue_chunk_build(&chunk_task(chunks, x, z, &vertices), true)?;
        }

        let report = container.tick(camera)?;
        if report.submitted > 0 || report.reaped_batches > 0 {
            log::debug!(
                "Frame {}: reaped {}, committed {}, submitted {}, waiting {}",
                frame,
                report.reaped_batches,
                report.committed,
                report.submitted,
                report.back_pressured
            );
        }
    }

    let stats = container.stats();
    container.close()?;
    Ok(stats)
}

fn chunk_task(chunks: usize, x: usize, z: usize, vertices: &[u8]) -> GeometryTask<'_> {
    GeometryTask {
        key: ChunkKey(x * chunks + z),
        origin: Vec3::new(x as f32 * CHUNK_SIZE, 0.0, z as f32 * CHUNK_SIZE),
        lists: vec![GeometryList {
            geometry_type: GeometryType::Solid,
            texture_id: 0,
            vertex_format: VertexFormat::Position,
            draw_mode: DrawMode::Quads,
            vertices,
        }],
    }
}

/// A row of unit quads on the chunk floor.
fn chunk_vertices(quads: usize) -> Vec<u8> {
    let mut positions: Vec<[f32; 3]> = Vec::with_capacity(quads * 4);
    for i in 0..quads {
        let x = (i % 32) as f32;
        let z = (i / 32) as f32;
        positions.push([x, 0.0, z]);
        positions.push([x + 1.0, 0.0, z]);
        positions.push([x + 1.0, 0.0, z + 1.0]);
        positions.push([x, 0.0, z + 1.0]);
    }
    bytemuck::cast_slice(&positions).to_vec()
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
