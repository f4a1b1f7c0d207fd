//! GPU backend seam
//!
//! The streaming core never talks to a graphics API directly. Buffers,
//! acceleration structures, command recording and fences come from a
//! [`GpuBackend`] injected into the container at construction.
//!
//! - [`WgpuBackend`]: real device through wgpu's ray query extension
//! - [`HeadlessBackend`]: CPU-only recorder with manually signalled fences

pub mod headless;
pub mod wgpu_backend;

pub use headless::{HeadlessBackend, HeadlessBlas, HeadlessBuffer, HeadlessEncoder, HeadlessFence, SubmissionRecord};
pub use wgpu_backend::{WgpuBackend, WgpuBlas, WgpuFence};

use std::time::Duration;

use crate::core::Result;

/// What a device buffer is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Vertex data read by BLAS builds and hit shaders
    Vertex,
    /// `u32` index data read by BLAS builds and hit shaders
    Index,
}

/// Device buffer description.
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Build preference for a bottom-level acceleration structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildHint {
    /// Geometry that lives for many frames (chunks)
    FastTrace,
    /// Geometry rebuilt every frame (entities)
    FastBuild,
}

/// Size description of one triangle geometry inside a BLAS.
///
/// Positions are the leading `float32x3` of every vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlasGeometryDesc {
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub index_count: u32,
    /// Opaque geometry skips any-hit invocation during traversal
    pub opaque: bool,
}

/// BLAS description.
#[derive(Clone, Debug)]
pub struct BlasDesc<'a> {
    pub label: &'a str,
    pub hint: BuildHint,
    pub geometries: &'a [BlasGeometryDesc],
}

/// Queue a command stream is submitted on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    /// Main render queue, ordered before the next frame's work
    Graphics,
    /// Background queue for batched streaming builds
    Async,
}

/// One geometry input of a BLAS build.
pub struct BlasGeometryInput<'a, B: GpuBackend + ?Sized> {
    pub vertex_buffer: &'a B::Buffer,
    pub index_buffer: &'a B::Buffer,
    pub desc: BlasGeometryDesc,
}

/// One BLAS build: the structure and its geometries, in creation order.
pub struct BlasBuild<'a, B: GpuBackend + ?Sized> {
    pub blas: &'a B::Blas,
    pub geometries: Vec<BlasGeometryInput<'a, B>>,
}

/// GPU primitives consumed by the streaming core.
///
/// Recording is synchronous to issue and asynchronous to complete: nothing
/// recorded here has executed until the encoder is submitted and its fence
/// signals.
pub trait GpuBackend: Send + Sync + 'static {
    type Buffer: Send + Sync + 'static;
    type Blas: Send + Sync + 'static;
    type Fence: Send + 'static;
    type Encoder;

    /// Allocate a device-local buffer.
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Self::Buffer>;

    /// Allocate an (unbuilt) bottom-level acceleration structure.
    fn create_blas(&self, desc: &BlasDesc<'_>) -> Result<Self::Blas>;

    /// Create an unsignalled fence.
    fn create_fence(&self) -> Result<Self::Fence>;

    /// Begin a command stream.
    fn create_encoder(&self, label: &str) -> Self::Encoder;

    /// Record a host-to-device copy of `data` into `dst` at offset 0.
    fn record_upload(&self, encoder: &mut Self::Encoder, dst: &Self::Buffer, data: &[u8]);

    /// Make prior uploads into `buffers` visible to acceleration structure builds.
    fn record_build_barrier(&self, encoder: &mut Self::Encoder, buffers: &[&Self::Buffer]);

    /// Record all `builds` as one batched acceleration structure build.
    fn record_blas_builds(&self, encoder: &mut Self::Encoder, builds: &[BlasBuild<'_, Self>]);

    /// Submit a finished command stream, signalling `signal` on completion.
    fn submit(&self, encoder: Self::Encoder, queue: QueueKind, signal: Option<&Self::Fence>) -> Result<()>;

    /// Wait for a fence. `Some(Duration::ZERO)` polls, `None` blocks until signalled.
    ///
    /// Returns whether the fence is signalled. Errors mean the device is lost.
    fn wait_fence(&self, fence: &Self::Fence, timeout: Option<Duration>) -> Result<bool>;

    /// Return a signalled fence to the unsignalled state for reuse.
    fn reset_fence(&self, fence: &Self::Fence) -> Result<()>;
}
