//! wgpu implementation of the GPU backend seam
//!
//! Requires a device created with `Features::EXPERIMENTAL_RAY_QUERY`.
//! wgpu exposes a single queue per device, so [`QueueKind::Async`] work is
//! submitted on the same queue as graphics work; the batching and fence
//! bookkeeping upstream are unchanged by that.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use wgpu::util::DeviceExt;

use crate::core::{Error, Result};
use crate::gpu::{BlasBuild, BlasDesc, BufferDesc, BufferUsage, BuildHint, GpuBackend, QueueKind};

/// Acceleration structure plus the size descriptors its builds must reference.
pub struct WgpuBlas {
    blas: wgpu::Blas,
    sizes: Vec<wgpu::BlasTriangleGeometrySizeDescriptor>,
}

impl WgpuBlas {
    pub fn raw(&self) -> &wgpu::Blas {
        &self.blas
    }
}

/// Completion flag set by `on_submitted_work_done`, plus the submission index
/// for blocking waits.
pub struct WgpuFence {
    signalled: Arc<AtomicBool>,
    submission: Mutex<Option<wgpu::SubmissionIndex>>,
}

/// GPU backend over a shared wgpu device and queue.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl WgpuBackend {
    /// Wrap the renderer's device and queue.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Result<Self> {
        if !device.features().contains(wgpu::Features::EXPERIMENTAL_RAY_QUERY) {
            return Err(Error::Gpu(
                "device was created without EXPERIMENTAL_RAY_QUERY".into(),
            ));
        }
        Ok(Self { device, queue })
    }

    /// Create a windowless device with ray query support.
    ///
    /// Used by tools and benches; the renderer passes its own device to [`WgpuBackend::new`].
    pub async fn request_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::Gpu(format!("No suitable adapter found: {:?}", e)))?;

        if !adapter.features().contains(wgpu::Features::EXPERIMENTAL_RAY_QUERY) {
            return Err(Error::Gpu(format!(
                "adapter '{}' does not support ray queries",
                adapter.get_info().name
            )));
        }

        let device_desc = wgpu::DeviceDescriptor {
            label: Some("raystream_device"),
            required_features: wgpu::Features::EXPERIMENTAL_RAY_QUERY,
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            // SAFETY: ray query is an experimental wgpu feature; the streaming
            // core only builds BLASes and never traces rays itself.
            experimental_features: unsafe { wgpu::ExperimentalFeatures::enabled() },
            trace: Default::default(),
        };

        let (device, queue) = adapter
            .request_device(&device_desc)
            .await
            .map_err(|e| Error::Gpu(e.to_string()))?;

        log::info!("Streaming device: {}", adapter.get_info().name);
        Self::new(device, queue)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }
}

impl GpuBackend for WgpuBackend {
    type Buffer = wgpu::Buffer;
    type Blas = WgpuBlas;
    type Fence = WgpuFence;
    type Encoder = wgpu::CommandEncoder;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<wgpu::Buffer> {
        let usage = match desc.usage {
            BufferUsage::Vertex => wgpu::BufferUsages::VERTEX,
            BufferUsage::Index => wgpu::BufferUsages::INDEX,
        } | wgpu::BufferUsages::BLAS_INPUT
            | wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST;

        if desc.size > self.device.limits().max_buffer_size {
            return Err(Error::Gpu(format!(
                "buffer '{}' of {} bytes exceeds max_buffer_size",
                desc.label, desc.size
            )));
        }

        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.label),
            size: desc.size,
            usage,
            mapped_at_creation: false,
        }))
    }

    fn create_blas(&self, desc: &BlasDesc<'_>) -> Result<WgpuBlas> {
        let sizes: Vec<_> = desc
            .geometries
            .iter()
            .map(|g| wgpu::BlasTriangleGeometrySizeDescriptor {
                vertex_format: wgpu::VertexFormat::Float32x3,
                vertex_count: g.vertex_count,
                index_format: Some(wgpu::IndexFormat::Uint32),
                index_count: Some(g.index_count),
                flags: if g.opaque {
                    wgpu::AccelerationStructureGeometryFlags::OPAQUE
                } else {
                    wgpu::AccelerationStructureGeometryFlags::empty()
                },
            })
            .collect();

        let flags = match desc.hint {
            BuildHint::FastTrace => wgpu::AccelerationStructureFlags::PREFER_FAST_TRACE,
            BuildHint::FastBuild => wgpu::AccelerationStructureFlags::PREFER_FAST_BUILD,
        };

        let blas = self.device.create_blas(
            &wgpu::CreateBlasDescriptor {
                label: Some(desc.label),
                flags,
                update_mode: wgpu::AccelerationStructureUpdateMode::Build,
            },
            wgpu::BlasGeometrySizeDescriptors::Triangles {
                descriptors: sizes.clone(),
            },
        );

        Ok(WgpuBlas { blas, sizes })
    }

    fn create_fence(&self) -> Result<WgpuFence> {
        Ok(WgpuFence {
            signalled: Arc::new(AtomicBool::new(false)),
            submission: Mutex::new(None),
        })
    }

    fn create_encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    fn record_upload(&self, encoder: &mut wgpu::CommandEncoder, dst: &wgpu::Buffer, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        // The staging buffer stays alive inside wgpu until the copy retires.
        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("geometry_staging"),
            contents: data,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        encoder.copy_buffer_to_buffer(&staging, 0, dst, 0, data.len() as u64);
    }

    fn record_build_barrier(&self, _encoder: &mut wgpu::CommandEncoder, _buffers: &[&wgpu::Buffer]) {
        // wgpu tracks COPY_DST -> BLAS_INPUT transitions itself.
    }

    fn record_blas_builds(&self, encoder: &mut wgpu::CommandEncoder, builds: &[BlasBuild<'_, Self>]) {
        let entries: Vec<wgpu::BlasBuildEntry<'_>> = builds
            .iter()
            .map(|build| wgpu::BlasBuildEntry {
                blas: &build.blas.blas,
                geometry: wgpu::BlasGeometries::TriangleGeometries(
                    build
                        .geometries
                        .iter()
                        .zip(&build.blas.sizes)
                        .map(|(input, size)| wgpu::BlasTriangleGeometry {
                            size,
                            vertex_buffer: input.vertex_buffer,
                            first_vertex: 0,
                            vertex_stride: input.desc.vertex_stride as wgpu::BufferAddress,
                            index_buffer: Some(input.index_buffer),
                            first_index: Some(0),
                            transform_buffer: None,
                            transform_buffer_offset: None,
                        })
                        .collect(),
                ),
            })
            .collect();

        encoder.build_acceleration_structures(entries.iter(), std::iter::empty::<&wgpu::Tlas>());
    }

    fn submit(&self, encoder: wgpu::CommandEncoder, queue: QueueKind, signal: Option<&WgpuFence>) -> Result<()> {
        let index = self.queue.submit(std::iter::once(encoder.finish()));
        if let Some(fence) = signal {
            let flag = Arc::clone(&fence.signalled);
            self.queue
                .on_submitted_work_done(move || flag.store(true, Ordering::Release));
            *fence.submission.lock().unwrap_or_else(PoisonError::into_inner) = Some(index);
        }
        log::trace!("wgpu submit on {:?}", queue);
        Ok(())
    }

    fn wait_fence(&self, fence: &WgpuFence, timeout: Option<Duration>) -> Result<bool> {
        if fence.signalled.load(Ordering::Acquire) {
            return Ok(true);
        }
        let submission = fence
            .submission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(submission) = submission else {
            return match timeout {
                None => Err(Error::Gpu("unbounded wait on never-submitted fence".into())),
                Some(_) => Ok(false),
            };
        };

        let poll = match timeout {
            Some(t) if t.is_zero() => wgpu::PollType::Poll,
            t => wgpu::PollType::Wait {
                submission_index: Some(submission),
                timeout: t,
            },
        };

        match self.device.poll(poll) {
            Ok(_) => {}
            Err(wgpu::PollError::Timeout) => return Ok(false),
            Err(e) => return Err(Error::DeviceLost(e.to_string())),
        }
        Ok(fence.signalled.load(Ordering::Acquire))
    }

    fn reset_fence(&self, fence: &WgpuFence) -> Result<()> {
        fence.signalled.store(false, Ordering::Release);
        *fence.submission.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
