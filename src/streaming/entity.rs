//! Per-frame entity geometry
//!
//! Entities move every frame, so their geometry never goes through the
//! versioned chunk path: each frame's submission replaces the previous
//! frame's results wholesale and the old ones retire through the GC.

use std::sync::Arc;

use rayon::prelude::*;

use crate::core::Result;
use crate::gpu::GpuBackend;
use crate::streaming::compile::{prepare_lists, PreparedGeometry};
use crate::streaming::gc::GarbageCollector;
use crate::streaming::result::GeometryBuildResult;
use crate::streaming::task::{EntityTask, GeometryOwner};

/// Copy and index every entity task in parallel.
///
/// Versions are filled in with the entity frame once the container lock is held.
pub fn prepare_entities(tasks: &[EntityTask<'_>]) -> Result<Vec<PreparedGeometry>> {
    tasks
        .par_iter()
        .map(|task| {
            let lists = prepare_lists(&task.lists)?;
            Ok(PreparedGeometry::new(
                GeometryOwner::Entity(task.entity_id),
                0,
                task.origin,
                lists,
            ))
        })
        .collect()
}

/// The entity results visible this frame.
pub struct EntityFrame<B: GpuBackend> {
    frame: u64,
    results: Vec<Arc<GeometryBuildResult<B>>>,
}

impl<B: GpuBackend> Default for EntityFrame<B> {
    fn default() -> Self {
        Self {
            frame: 0,
            results: Vec::new(),
        }
    }
}

impl<B: GpuBackend> EntityFrame<B> {
    /// Start the next entity frame, returning its number.
    pub fn next_frame(&mut self) -> u64 {
        self.frame += 1;
        self.frame
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Show `results` from now on; last frame's results go to the GC.
    pub fn replace(&mut self, results: Vec<GeometryBuildResult<B>>, gc: &GarbageCollector) {
        for old in self.results.drain(..) {
            gc.collect(old);
        }
        for result in results {
            if result.is_empty() {
                gc.collect(result);
            } else {
                self.results.push(Arc::new(result));
            }
        }
    }

    /// Release everything into the GC.
    pub fn clear(&mut self, gc: &GarbageCollector) {
        self.replace(Vec::new(), gc);
    }

    pub fn results(&self) -> &[Arc<GeometryBuildResult<B>>] {
        &self.results
    }

    pub fn gpu_bytes(&self) -> u64 {
        self.results.iter().map(|r| r.gpu_bytes()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use crate::streaming::task::{DrawMode, GeometryList, GeometryType, VertexFormat};
    use glam::Vec3;

    fn list(data: &[u8], draw_mode: DrawMode) -> GeometryList<'_> {
        GeometryList {
            geometry_type: GeometryType::Cutout,
            texture_id: 2,
            vertex_format: VertexFormat::Entity,
            draw_mode,
            vertices: data,
        }
    }

    #[test]
    fn test_prepare_entities_keeps_order() {
        let data = vec![0u8; 4 * VertexFormat::Entity.stride()];
        let tasks: Vec<_> = (0..32)
            .map(|id| EntityTask {
                entity_id: id,
                origin: Vec3::new(id as f32, 0.0, 0.0),
                lists: vec![list(&data, DrawMode::Quads)],
            })
            .collect();

        let prepared = prepare_entities(&tasks).unwrap();
        assert_eq!(prepared.len(), 32);
        for (i, p) in prepared.iter().enumerate() {
            assert_eq!(p.owner, GeometryOwner::Entity(i as u64));
            assert_eq!(p.index_count(), 6);
        }
    }

    #[test]
    fn test_frame_replaces_results() {
        use crate::gpu::{BuildHint, HeadlessBackend};
        use crate::streaming::compile::compile;

        let backend = HeadlessBackend::new();
        let gc = GarbageCollector::new(2);
        let data = vec![0u8; 4 * VertexFormat::Entity.stride()];
        let tasks = vec![EntityTask { entity_id: 9, origin: Vec3::ZERO, lists: vec![list(&data, DrawMode::Quads)] }];

        let mut entities = EntityFrame::<HeadlessBackend>::default();
        assert_eq!(entities.frame(), 0);
        for expected_frame in 1..=2 {
            let frame = entities.next_frame();
            assert_eq!(frame, expected_frame);
            let results: Vec<_> = prepare_entities(&tasks)
                .unwrap()
                .into_iter()
                .map(|mut p| {
                    p.version = frame;
                    compile(&backend, p, BuildHint::FastBuild).unwrap()
                })
                .collect();
            entities.replace(results, &gc);
        }

        assert_eq!(entities.frame(), 2);
        assert_eq!(entities.results().len(), 1);
        assert_eq!(entities.results()[0].version(), 2);
        assert_eq!(gc.pending(), 1);

        entities.clear(&gc);
        assert!(entities.results().is_empty());
        assert_eq!(entities.gpu_bytes(), 0);
    }

    #[test]
    fn test_prepare_entities_fails_whole_frame() {
        let data = vec![0u8; 2 * VertexFormat::Entity.stride()];
        let tasks = vec![
            EntityTask { entity_id: 0, origin: Vec3::ZERO, lists: vec![] },
            EntityTask { entity_id: 1, origin: Vec3::ZERO, lists: vec![list(&data, DrawMode::LineStrip)] },
        ];
        assert!(matches!(
            prepare_entities(&tasks),
            Err(Error::UnsupportedTopology(DrawMode::LineStrip))
        ));
    }
}
