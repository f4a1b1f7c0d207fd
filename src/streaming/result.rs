//! Immutable build products

use glam::Vec3;

use crate::gpu::GpuBackend;
use crate::streaming::task::{ChunkKey, GeometryOwner, GeometryType, VertexFormat};

/// Metadata of one compiled geometry list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListInfo {
    pub geometry_type: GeometryType,
    pub texture_id: u32,
    pub vertex_format: VertexFormat,
    pub vertex_count: u32,
    pub index_count: u32,
}

/// Device buffers of one geometry list.
pub struct CompiledList<B: GpuBackend> {
    pub info: ListInfo,
    pub vertex_buffer: B::Buffer,
    pub index_buffer: B::Buffer,
}

/// CPU copy of a list's data waiting to be uploaded.
pub(crate) struct StagedList {
    pub vertices: Vec<u8>,
    pub indices: Vec<u32>,
}

/// Vertex/index buffers plus one BLAS built from a geometry task.
///
/// Owned by exactly one holder at a time: the batch building it, the cell
/// showing it, or a GC bucket waiting for the GPU to retire it.
pub struct GeometryBuildResult<B: GpuBackend> {
    pub(crate) owner: GeometryOwner,
    pub(crate) version: u64,
    pub(crate) origin: Vec3,
    pub(crate) lists: Vec<CompiledList<B>>,
    pub(crate) blas: Option<B::Blas>,
    pub(crate) all_vertex_count: u32,
    pub(crate) all_index_count: u32,
    pub(crate) gpu_bytes: u64,
    /// Taken when uploads are recorded
    pub(crate) staged: Option<Vec<StagedList>>,
}

impl<B: GpuBackend> GeometryBuildResult<B> {
    pub fn owner(&self) -> GeometryOwner {
        self.owner
    }

    /// Chunk this result belongs to, if it is chunk geometry.
    pub fn chunk_key(&self) -> Option<ChunkKey> {
        match self.owner {
            GeometryOwner::Chunk(key) => Some(key),
            GeometryOwner::Entity(_) => None,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    pub fn lists(&self) -> &[CompiledList<B>] {
        &self.lists
    }

    pub fn blas(&self) -> Option<&B::Blas> {
        self.blas.as_ref()
    }

    pub fn all_vertex_count(&self) -> u32 {
        self.all_vertex_count
    }

    pub fn all_index_count(&self) -> u32 {
        self.all_index_count
    }

    /// Bytes of device memory held by the vertex and index buffers.
    pub fn gpu_bytes(&self) -> u64 {
        self.gpu_bytes
    }

    /// An empty result has no geometry and is never shown.
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Whether uploads and the BLAS build have been recorded.
    pub fn is_recorded(&self) -> bool {
        self.staged.is_none()
    }
}
