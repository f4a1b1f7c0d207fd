//! Geometry compilation
//!
//! Compilation is split in three steps so the expensive GPU part can be
//! batched across many tasks:
//!
//! 1. [`prepare_lists`]: validate host data, copy it, synthesize indices (CPU only)
//! 2. [`compile`]: allocate device buffers and the BLAS for one prepared task
//! 3. [`record_builds`]: record uploads, one barrier and one batched BLAS
//!    build for any number of compiled results

use glam::Vec3;

use crate::core::{Error, Result};
use crate::gpu::{
    BlasBuild, BlasDesc, BlasGeometryDesc, BlasGeometryInput, BufferDesc, BufferUsage, BuildHint, GpuBackend,
};
use crate::streaming::result::{CompiledList, GeometryBuildResult, ListInfo, StagedList};
use crate::streaming::task::{DrawMode, GeometryList, GeometryOwner, GeometryType, VertexFormat};

/// Per-quad index pattern: two counter-clockwise triangles.
pub const QUAD_INDEX_PATTERN: [u32; 6] = [0, 1, 2, 2, 3, 0];

/// Host data of one list, copied and indexed.
#[derive(Clone, Debug)]
pub struct PreparedList {
    pub geometry_type: GeometryType,
    pub texture_id: u32,
    pub vertex_format: VertexFormat,
    pub vertices: Vec<u8>,
    pub indices: Vec<u32>,
}

impl PreparedList {
    // Both counts were checked against u32 in `prepare_list`.
    pub fn vertex_count(&self) -> u32 {
        (self.vertices.len() / self.vertex_format.stride()) as u32
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }
}

/// A described but not yet built result: host data copied out of a task and
/// tagged with the version it was requested as.
#[derive(Clone, Debug)]
pub struct PreparedGeometry {
    pub owner: GeometryOwner,
    pub version: u64,
    pub origin: Vec3,
    pub lists: Vec<PreparedList>,
}

impl PreparedGeometry {
    pub fn new(owner: GeometryOwner, version: u64, origin: Vec3, lists: Vec<PreparedList>) -> Self {
        Self { owner, version, origin, lists }
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn vertex_count(&self) -> u32 {
        self.lists.iter().map(PreparedList::vertex_count).sum()
    }

    pub fn index_count(&self) -> u32 {
        self.lists.iter().map(PreparedList::index_count).sum()
    }
}

/// Number of indices [`quad_indices`] produces for `vertex_count` vertices.
pub fn quad_index_count(vertex_count: u32) -> Result<u32> {
    let count = u64::from(vertex_count / 4) * QUAD_INDEX_PATTERN.len() as u64;
    u32::try_from(count).map_err(|_| Error::MismatchedLength {
        what: "quad index count",
        len: count as usize,
        multiple: 1,
    })
}

/// Index buffer expanding `vertex_count` quad vertices into triangles.
///
/// Vertices `i..i+3` become `i, i+1, i+2, i+2, i+3, i`.
pub fn quad_indices(vertex_count: u32) -> Vec<u32> {
    let quads = vertex_count / 4;
    let mut indices = Vec::with_capacity(quads as usize * QUAD_INDEX_PATTERN.len());
    for quad in 0..quads {
        let base = quad * 4;
        indices.extend(QUAD_INDEX_PATTERN.iter().map(|&offset| base + offset));
    }
    indices
}

fn prepare_list(list: &GeometryList<'_>) -> Result<Option<PreparedList>> {
    let stride = list.vertex_format.stride();
    if list.vertices.len() % stride != 0 {
        return Err(Error::MismatchedLength {
            what: "vertex bytes",
            len: list.vertices.len(),
            multiple: stride,
        });
    }

    let vertex_count = list.vertices.len() / stride;
    let vertex_count = u32::try_from(vertex_count).map_err(|_| Error::MismatchedLength {
        what: "vertex count",
        len: vertex_count,
        multiple: 1,
    })?;

    let indices = match list.draw_mode {
        DrawMode::Quads => {
            if vertex_count % 4 != 0 {
                return Err(Error::MismatchedLength {
                    what: "quad vertices",
                    len: vertex_count as usize,
                    multiple: 4,
                });
            }
            quad_index_count(vertex_count)?;
            quad_indices(vertex_count)
        }
        DrawMode::Triangles => {
            if vertex_count % 3 != 0 {
                return Err(Error::MismatchedLength {
                    what: "triangle vertices",
                    len: vertex_count as usize,
                    multiple: 3,
                });
            }
            (0..vertex_count).collect()
        }
        mode => return Err(Error::UnsupportedTopology(mode)),
    };

    if vertex_count == 0 {
        return Ok(None);
    }

    Ok(Some(PreparedList {
        geometry_type: list.geometry_type,
        texture_id: list.texture_id,
        vertex_format: list.vertex_format,
        vertices: list.vertices.to_vec(),
        indices,
    }))
}

/// Validate and copy host lists. Empty lists are dropped.
///
/// Any violation fails the whole task before anything is retained.
pub fn prepare_lists(lists: &[GeometryList<'_>]) -> Result<Vec<PreparedList>> {
    let mut prepared = Vec::with_capacity(lists.len());
    for list in lists {
        if let Some(list) = prepare_list(list)? {
            prepared.push(list);
        }
    }
    Ok(prepared)
}

/// Allocate device buffers and the BLAS for a prepared task.
///
/// Nothing is uploaded yet; the host data moves onto the result until
/// [`record_builds`] records it.
pub fn compile<B: GpuBackend>(
    backend: &B,
    prepared: PreparedGeometry,
    hint: BuildHint,
) -> Result<GeometryBuildResult<B>> {
    let PreparedGeometry { owner, version, origin, lists: prepared_lists } = prepared;

    let mut lists = Vec::with_capacity(prepared_lists.len());
    let mut staged = Vec::with_capacity(prepared_lists.len());
    let mut geometries = Vec::with_capacity(prepared_lists.len());
    let mut all_vertex_count = 0u32;
    let mut all_index_count = 0u32;
    let mut gpu_bytes = 0u64;

    for (i, list) in prepared_lists.into_iter().enumerate() {
        let vertex_size = list.vertices.len() as u64;
        let index_size = (list.indices.len() * std::mem::size_of::<u32>()) as u64;

        let vertex_buffer = backend.create_buffer(&BufferDesc {
            label: &format!("{} v{} vertices[{}]", owner, version, i),
            size: vertex_size,
            usage: BufferUsage::Vertex,
        })?;
        let index_buffer = backend.create_buffer(&BufferDesc {
            label: &format!("{} v{} indices[{}]", owner, version, i),
            size: index_size,
            usage: BufferUsage::Index,
        })?;

        let info = ListInfo {
            geometry_type: list.geometry_type,
            texture_id: list.texture_id,
            vertex_format: list.vertex_format,
            vertex_count: list.vertex_count(),
            index_count: list.index_count(),
        };
        geometries.push(BlasGeometryDesc {
            vertex_count: info.vertex_count,
            vertex_stride: list.vertex_format.stride() as u32,
            index_count: info.index_count,
            opaque: list.geometry_type.is_opaque(),
        });

        all_vertex_count += info.vertex_count;
        all_index_count += info.index_count;
        gpu_bytes += vertex_size + index_size;

        lists.push(CompiledList { info, vertex_buffer, index_buffer });
        staged.push(StagedList { vertices: list.vertices, indices: list.indices });
    }

    let blas = if geometries.is_empty() {
        None
    } else {
        Some(backend.create_blas(&BlasDesc {
            label: &format!("{} v{} blas", owner, version),
            hint,
            geometries: &geometries,
        })?)
    };

    Ok(GeometryBuildResult {
        owner,
        version,
        origin,
        lists,
        blas,
        all_vertex_count,
        all_index_count,
        gpu_bytes,
        staged: Some(staged),
    })
}

/// Record uploads, one transfer-to-build barrier and one batched BLAS build
/// for every result that has not been recorded yet.
///
/// Returns how many results were recorded. Never waits on the GPU.
pub fn record_builds<B: GpuBackend>(
    backend: &B,
    encoder: &mut B::Encoder,
    results: &mut [GeometryBuildResult<B>],
) -> usize {
    let staged: Vec<Option<Vec<StagedList>>> = results.iter_mut().map(|r| r.staged.take()).collect();

    let mut uploaded: Vec<&B::Buffer> = Vec::new();
    let mut builds: Vec<BlasBuild<'_, B>> = Vec::new();
    let mut recorded = 0;

    for (result, staged) in results.iter().zip(&staged) {
        let Some(staged) = staged else { continue };
        recorded += 1;

        for (list, data) in result.lists.iter().zip(staged) {
            backend.record_upload(encoder, &list.vertex_buffer, &data.vertices);
            backend.record_upload(encoder, &list.index_buffer, bytemuck::cast_slice(&data.indices));
            uploaded.push(&list.vertex_buffer);
            uploaded.push(&list.index_buffer);
        }

        if let Some(blas) = &result.blas {
            builds.push(BlasBuild {
                blas,
                geometries: result
                    .lists
                    .iter()
                    .map(|list| BlasGeometryInput {
                        vertex_buffer: &list.vertex_buffer,
                        index_buffer: &list.index_buffer,
                        desc: BlasGeometryDesc {
                            vertex_count: list.info.vertex_count,
                            vertex_stride: list.info.vertex_format.stride() as u32,
                            index_count: list.info.index_count,
                            opaque: list.info.geometry_type.is_opaque(),
                        },
                    })
                    .collect(),
            });
        }
    }

    if !uploaded.is_empty() {
        backend.record_build_barrier(encoder, &uploaded);
    }
    if !builds.is_empty() {
        backend.record_blas_builds(encoder, &builds);
    }
    recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{HeadlessBackend, QueueKind};
    use crate::streaming::task::ChunkKey;

    fn block_vertices(count: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(count * VertexFormat::Block.stride());
        for i in 0..count {
            let position = [i as f32, 0.0, 0.0];
            bytes.extend_from_slice(bytemuck::cast_slice(&position));
            bytes.extend_from_slice(&[0u8; 20]);
        }
        bytes
    }

    fn quad_list(vertices: &[u8]) -> GeometryList<'_> {
        GeometryList {
            geometry_type: GeometryType::Solid,
            texture_id: 0,
            vertex_format: VertexFormat::Block,
            draw_mode: DrawMode::Quads,
            vertices,
        }
    }

    fn prepared(lists: Vec<PreparedList>) -> PreparedGeometry {
        PreparedGeometry::new(GeometryOwner::Chunk(ChunkKey(0)), 1, Vec3::ZERO, lists)
    }

    #[test]
    fn test_quad_indices_pattern() {
        assert_eq!(quad_indices(8), vec![0, 1, 2, 2, 3, 0, 4, 5, 6, 6, 7, 4]);
        assert!(quad_indices(0).is_empty());
    }

    #[test]
    fn test_quad_index_count_overflow() {
        assert_eq!(quad_index_count(8).unwrap(), 12);
        // 4 * 715_827_882 vertices is the largest quad count whose indices fit
        assert_eq!(quad_index_count(4 * 715_827_882).unwrap(), 4_294_967_292);
        assert!(matches!(
            quad_index_count(4 * 715_827_883),
            Err(Error::MismatchedLength { what: "quad index count", .. })
        ));
        assert!(quad_index_count(u32::MAX - 3).is_err());
    }

    #[test]
    fn test_quad_round_trip_counts() {
        // k lists of v quad vertices each
        let (k, v) = (3usize, 12usize);
        let data = block_vertices(v);
        let lists: Vec<_> = (0..k).map(|_| quad_list(&data)).collect();

        let prepared = prepared(prepare_lists(&lists).unwrap());
        assert_eq!(prepared.vertex_count() as usize, k * v);
        assert_eq!(prepared.index_count() as usize, k * v * 3 / 2);

        for list in &prepared.lists {
            for (quad, chunk) in list.indices.chunks_exact(6).enumerate() {
                let base = quad as u32 * 4;
                let expected: Vec<u32> = QUAD_INDEX_PATTERN.iter().map(|o| base + o).collect();
                assert_eq!(chunk, expected.as_slice());
            }
        }
    }

    #[test]
    fn test_triangles_use_identity_indices() {
        let data = vec![0u8; 3 * VertexFormat::Position.stride()];
        let list = GeometryList {
            geometry_type: GeometryType::Translucent,
            texture_id: 4,
            vertex_format: VertexFormat::Position,
            draw_mode: DrawMode::Triangles,
            vertices: &data,
        };
        let lists = prepare_lists(&[list]).unwrap();
        assert_eq!(lists[0].indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_unsupported_topology_rejected() {
        let data = vec![0u8; 2 * VertexFormat::Position.stride()];
        let list = GeometryList {
            geometry_type: GeometryType::Solid,
            texture_id: 0,
            vertex_format: VertexFormat::Position,
            draw_mode: DrawMode::Lines,
            vertices: &data,
        };
        let err = prepare_lists(&[list]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedTopology(DrawMode::Lines)));
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let ragged = vec![0u8; VertexFormat::Block.stride() * 4 + 5];
        assert!(matches!(
            prepare_lists(&[quad_list(&ragged)]),
            Err(Error::MismatchedLength { what: "vertex bytes", .. })
        ));

        let partial_quad = block_vertices(6);
        assert!(matches!(
            prepare_lists(&[quad_list(&partial_quad)]),
            Err(Error::MismatchedLength { what: "quad vertices", .. })
        ));
    }

    #[test]
    fn test_empty_lists_dropped() {
        let empty: Vec<u8> = Vec::new();
        let lists = prepare_lists(&[quad_list(&empty)]).unwrap();
        assert!(lists.is_empty());
    }

    #[test]
    fn test_compile_allocates_per_list() {
        let backend = HeadlessBackend::new();
        let a = block_vertices(4);
        let b = block_vertices(8);
        let mut lists = vec![quad_list(&a), quad_list(&b)];
        lists[1].geometry_type = GeometryType::Cutout;

        let result = compile(&backend, prepared(prepare_lists(&lists).unwrap()), BuildHint::FastTrace).unwrap();

        assert_eq!(result.lists().len(), 2);
        assert_eq!(result.all_vertex_count(), 12);
        assert_eq!(result.all_index_count(), 18);
        assert_eq!(backend.live_buffers(), 4);
        assert_eq!(backend.live_blases(), 1);
        assert!(!result.is_recorded());

        let blas = result.blas().unwrap();
        assert_eq!(blas.geometries().len(), 2);
        assert!(blas.geometries()[0].opaque);
        assert!(!blas.geometries()[1].opaque);
        assert_eq!(blas.geometries()[0].vertex_stride, 32);

        let expected_bytes = (12 * 32 + 18 * 4) as u64;
        assert_eq!(result.gpu_bytes(), expected_bytes);
    }

    #[test]
    fn test_empty_task_compiles_to_empty_result() {
        let backend = HeadlessBackend::new();
        let mut result = compile(&backend, prepared(Vec::new()), BuildHint::FastTrace).unwrap();
        assert!(result.is_empty());
        assert!(result.blas().is_none());
        assert_eq!(backend.live_buffers(), 0);

        let mut encoder = backend.create_encoder("empty");
        assert_eq!(record_builds(&backend, &mut encoder, std::slice::from_mut(&mut result)), 1);
        backend.submit(encoder, QueueKind::Async, None).unwrap();
        let record = &backend.submissions()[0];
        assert_eq!(record.uploads, 0);
        assert_eq!(record.barriers, 0);
        assert_eq!(record.blas_builds, 0);
    }

    #[test]
    fn test_record_batches_uploads_then_builds() {
        let backend = HeadlessBackend::new();
        let data = block_vertices(8);

        let mut results: Vec<_> = (0..3)
            .map(|i| {
                let lists = prepare_lists(&[quad_list(&data)]).unwrap();
                let prepared = PreparedGeometry::new(GeometryOwner::Chunk(ChunkKey(i)), 1, Vec3::ZERO, lists);
                compile(&backend, prepared, BuildHint::FastTrace).unwrap()
            })
            .collect();

        let mut encoder = backend.create_encoder("batch");
        assert_eq!(record_builds(&backend, &mut encoder, &mut results), 3);
        // Recording twice does nothing.
        assert_eq!(record_builds(&backend, &mut encoder, &mut results), 0);
        backend.submit(encoder, QueueKind::Async, None).unwrap();

        let record = &backend.submissions()[0];
        assert_eq!(record.uploads, 6);
        assert_eq!(record.barriers, 1);
        assert_eq!(record.barrier_buffers, 6);
        assert_eq!(record.blas_builds, 3);

        let uploaded = results[0].lists()[0].index_buffer.contents_u32();
        assert_eq!(uploaded, quad_indices(8));
        assert_eq!(results[0].lists()[0].vertex_buffer.contents(), data);
        assert!(results.iter().all(|r| r.blas().unwrap().is_built()));
    }
}
