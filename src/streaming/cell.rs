//! Versioned per-chunk live state
//!
//! Versions are handed out when a request is ingested, so a request made later
//! always carries a higher version than one made earlier, whatever order the
//! builds finish in. A finished build is shown only if its version is newer
//! than what the cell has already committed; otherwise it is stale and goes
//! straight to the garbage collector.

use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec3;

use crate::gpu::GpuBackend;
use crate::streaming::gc::GarbageCollector;
use crate::streaming::result::GeometryBuildResult;
use crate::streaming::task::ChunkKey;

/// What happened to a result handed to [`VersionedCell::enqueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The result is now the committed state of the cell
    Committed,
    /// An equal or newer version was already committed; the result was discarded
    Stale,
    /// The result had no geometry; it was discarded and the cell is unchanged
    Empty,
}

/// Live state of one chunk key.
pub struct VersionedCell<B: GpuBackend> {
    key: ChunkKey,
    /// Next version to assign
    latest_version: u64,
    /// Version of the visible state; 0 is below any real version
    committed_version: u64,
    visible: Option<Arc<GeometryBuildResult<B>>>,
    origin: Option<Vec3>,
    last_update: Option<Instant>,
}

impl<B: GpuBackend> VersionedCell<B> {
    pub fn new(key: ChunkKey) -> Self {
        Self {
            key,
            latest_version: 1,
            committed_version: 0,
            visible: None,
            origin: None,
            last_update: None,
        }
    }

    pub fn key(&self) -> ChunkKey {
        self.key
    }

    /// Assign the version for a new request.
    pub fn next_version(&mut self) -> u64 {
        let version = self.latest_version;
        self.latest_version += 1;
        version
    }

    pub fn latest_version(&self) -> u64 {
        self.latest_version
    }

    pub fn committed_version(&self) -> u64 {
        self.committed_version
    }

    /// Offer a finished build to the cell.
    pub fn enqueue(&mut self, result: GeometryBuildResult<B>, gc: &GarbageCollector, now: Instant) -> CommitOutcome {
        self.origin = Some(result.origin());
        self.last_update = Some(now);

        if result.version() <= self.committed_version {
            log::debug!(
                "{}: dropping stale v{} (committed v{})",
                self.key,
                result.version(),
                self.committed_version
            );
            gc.collect(result);
            return CommitOutcome::Stale;
        }

        if result.is_empty() {
            log::trace!("{}: empty v{} not committed", self.key, result.version());
            gc.collect(result);
            return CommitOutcome::Empty;
        }

        self.committed_version = result.version();
        gc.collect_maybe(self.visible.take());
        self.visible = Some(Arc::new(result));
        log::trace!("{}: committed v{}", self.key, self.committed_version);
        CommitOutcome::Committed
    }

    /// Stop showing the current geometry and make every outstanding build stale.
    pub fn invalidate(&mut self, gc: &GarbageCollector) {
        // Every version handed out so far is < latest_version.
        self.committed_version = self.latest_version;
        self.latest_version += 1;
        gc.collect_maybe(self.visible.take());
    }

    /// Release the visible result, e.g. when the cell is destroyed.
    pub fn release(&mut self, gc: &GarbageCollector) {
        gc.collect_maybe(self.visible.take());
    }

    pub fn is_ready(&self) -> bool {
        self.visible.is_some()
    }

    /// Snapshot of the committed result, if there is one to draw.
    pub fn try_get_valid(&self) -> Option<Arc<GeometryBuildResult<B>>> {
        self.visible.clone()
    }

    /// Origin reported by the most recent build, committed or not.
    pub fn origin(&self) -> Option<Vec3> {
        self.origin
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    /// Time since the cell last received a build; `None` if it never did.
    pub fn since_update(&self, now: Instant) -> Option<Duration> {
        self.last_update.map(|t| now.saturating_duration_since(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BuildHint, HeadlessBackend};
    use crate::streaming::compile::{compile, prepare_lists, PreparedGeometry};
    use crate::streaming::task::{DrawMode, GeometryList, GeometryOwner, GeometryType, VertexFormat};

    const KEY: ChunkKey = ChunkKey(0);

    fn build(backend: &HeadlessBackend, version: u64, quads: usize) -> GeometryBuildResult<HeadlessBackend> {
        let data = vec![0u8; quads * 4 * VertexFormat::Position.stride()];
        let list = GeometryList {
            geometry_type: GeometryType::Solid,
            texture_id: 0,
            vertex_format: VertexFormat::Position,
            draw_mode: DrawMode::Quads,
            vertices: &data,
        };
        let lists = prepare_lists(&[list]).unwrap();
        let prepared = PreparedGeometry::new(GeometryOwner::Chunk(KEY), version, Vec3::new(16.0, 0.0, 0.0), lists);
        compile(backend, prepared, BuildHint::FastTrace).unwrap()
    }

    #[test]
    fn test_versions_strictly_increase() {
        let mut cell = VersionedCell::<HeadlessBackend>::new(KEY);
        let a = cell.next_version();
        let b = cell.next_version();
        let c = cell.next_version();
        assert!(a < b && b < c);
        assert!(a > cell.committed_version());
    }

    #[test]
    fn test_commit_newer() {
        let backend = HeadlessBackend::new();
        let gc = GarbageCollector::new(2);
        let mut cell = VersionedCell::new(KEY);
        let v = cell.next_version();

        assert!(!cell.is_ready());
        assert_eq!(cell.enqueue(build(&backend, v, 1), &gc, Instant::now()), CommitOutcome::Committed);
        assert!(cell.is_ready());
        assert_eq!(cell.committed_version(), v);
        assert_eq!(cell.try_get_valid().unwrap().version(), v);
        assert_eq!(cell.origin(), Some(Vec3::new(16.0, 0.0, 0.0)));
        assert_eq!(gc.pending(), 0);
    }

    #[test]
    fn test_stale_result_rejected() {
        let backend = HeadlessBackend::new();
        let gc = GarbageCollector::new(2);
        let mut cell = VersionedCell::new(KEY);
        let v1 = cell.next_version();
        let v2 = cell.next_version();

        assert_eq!(cell.enqueue(build(&backend, v2, 2), &gc, Instant::now()), CommitOutcome::Committed);
        let before = cell.last_update();
        assert_eq!(cell.enqueue(build(&backend, v1, 1), &gc, Instant::now()), CommitOutcome::Stale);

        let visible = cell.try_get_valid().unwrap();
        assert_eq!(visible.version(), v2);
        assert_eq!(visible.all_vertex_count(), 8);
        assert_eq!(cell.committed_version(), v2);
        // Metadata refreshes even for stale results
        assert!(cell.last_update() >= before);
        // Only the stale result went to the GC
        assert_eq!(gc.pending(), 1);
    }

    #[test]
    fn test_replacement_collects_old() {
        let backend = HeadlessBackend::new();
        let gc = GarbageCollector::new(2);
        let mut cell = VersionedCell::new(KEY);

        let v1 = cell.next_version();
        cell.enqueue(build(&backend, v1, 1), &gc, Instant::now());
        let v2 = cell.next_version();
        cell.enqueue(build(&backend, v2, 1), &gc, Instant::now());

        assert_eq!(gc.pending(), 1);
        assert_eq!(backend.live_buffers(), 4);
        gc.advance();
        gc.advance();
        assert_eq!(backend.live_buffers(), 2);
    }

    #[test]
    fn test_snapshot_outlives_replacement() {
        let backend = HeadlessBackend::new();
        let gc = GarbageCollector::new(1);
        let mut cell = VersionedCell::new(KEY);

        let v1 = cell.next_version();
        cell.enqueue(build(&backend, v1, 1), &gc, Instant::now());
        let snapshot = cell.try_get_valid().unwrap();

        let v2 = cell.next_version();
        cell.enqueue(build(&backend, v2, 1), &gc, Instant::now());
        gc.advance();

        // The renderer's snapshot keeps v1 alive until it drops it.
        assert_eq!(snapshot.version(), v1);
        assert_eq!(backend.live_buffers(), 4);
        drop(snapshot);
        assert_eq!(backend.live_buffers(), 2);
    }

    #[test]
    fn test_invalidate_supersedes_in_flight() {
        let backend = HeadlessBackend::new();
        let gc = GarbageCollector::new(2);
        let mut cell = VersionedCell::new(KEY);

        let v1 = cell.next_version();
        cell.enqueue(build(&backend, v1, 1), &gc, Instant::now());
        let in_flight = cell.next_version();

        cell.invalidate(&gc);
        assert!(!cell.is_ready());
        assert!(cell.committed_version() > in_flight);
        assert!(cell.latest_version() > cell.committed_version());

        // The build issued before the invalidate finishes afterwards
        assert_eq!(cell.enqueue(build(&backend, in_flight, 1), &gc, Instant::now()), CommitOutcome::Stale);
        assert!(!cell.is_ready());

        // A new request is accepted again
        let v3 = cell.next_version();
        assert_eq!(cell.enqueue(build(&backend, v3, 1), &gc, Instant::now()), CommitOutcome::Committed);
        assert!(cell.is_ready());
    }

    #[test]
    fn test_empty_result_keeps_previous_geometry() {
        let backend = HeadlessBackend::new();
        let gc = GarbageCollector::new(2);
        let mut cell = VersionedCell::new(KEY);

        let v1 = cell.next_version();
        cell.enqueue(build(&backend, v1, 1), &gc, Instant::now());

        let v2 = cell.next_version();
        let empty = compile(
            &backend,
            PreparedGeometry::new(GeometryOwner::Chunk(KEY), v2, Vec3::ZERO, Vec::new()),
            BuildHint::FastTrace,
        )
        .unwrap();
        assert_eq!(cell.enqueue(empty, &gc, Instant::now()), CommitOutcome::Empty);
        assert!(cell.is_ready());
        assert_eq!(cell.committed_version(), v1);
        assert_eq!(cell.try_get_valid().unwrap().version(), v1);
        assert_eq!(gc.pending(), 1);

        // A newer real build still commits
        let v3 = cell.next_version();
        assert_eq!(cell.enqueue(build(&backend, v3, 2), &gc, Instant::now()), CommitOutcome::Committed);
        assert_eq!(cell.try_get_valid().unwrap().all_vertex_count(), 8);
    }

    #[test]
    fn test_empty_result_on_fresh_cell() {
        let backend = HeadlessBackend::new();
        let gc = GarbageCollector::new(2);
        let mut cell = VersionedCell::new(KEY);

        let v1 = cell.next_version();
        let empty = compile(
            &backend,
            PreparedGeometry::new(GeometryOwner::Chunk(KEY), v1, Vec3::ZERO, Vec::new()),
            BuildHint::FastTrace,
        )
        .unwrap();
        assert_eq!(cell.enqueue(empty, &gc, Instant::now()), CommitOutcome::Empty);
        assert!(!cell.is_ready());
        assert_eq!(cell.committed_version(), 0);
    }

    #[test]
    fn test_committed_version_never_decreases() {
        let backend = HeadlessBackend::new();
        let gc = GarbageCollector::new(2);
        let mut cell = VersionedCell::new(KEY);
        let versions: Vec<u64> = (0..6).map(|_| cell.next_version()).collect();

        // Completion order shuffled
        let mut last = cell.committed_version();
        for &i in &[2usize, 0, 5, 1, 4, 3] {
            cell.enqueue(build(&backend, versions[i], 1), &gc, Instant::now());
            assert!(cell.committed_version() >= last);
            last = cell.committed_version();
        }
        assert_eq!(cell.committed_version(), versions[5]);
    }

    #[test]
    fn test_since_update() {
        let mut cell = VersionedCell::<HeadlessBackend>::new(KEY);
        let now = Instant::now();
        assert_eq!(cell.since_update(now), None);
        cell.last_update = Some(now);
        assert_eq!(cell.since_update(now + Duration::from_millis(5)), Some(Duration::from_millis(5)));
    }
}
