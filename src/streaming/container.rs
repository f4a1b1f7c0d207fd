//! Chunk streaming container
//!
//! Owns one [`VersionedCell`] per chunk key, the pending request set, the
//! [`BuildScheduler`] and the current entity frame. Producers queue geometry
//! tasks at any time; the frame driver calls [`StreamingContainer::tick`]
//! once per frame to reap finished batches and submit new ones, and the
//! renderer reads committed results through [`StreamingContainer::try_get_valid`]
//! or [`StreamingContainer::ready_instances`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use glam::Vec3;
use serde::Serialize;

use crate::core::{Error, Result, StreamingConfig};
use crate::gpu::{BuildHint, GpuBackend, QueueKind};
use crate::streaming::cell::{CommitOutcome, VersionedCell};
use crate::streaming::compile::{compile, prepare_lists, record_builds, PreparedGeometry};
use crate::streaming::entity::{prepare_entities, EntityFrame};
use crate::streaming::gc::GarbageCollector;
use crate::streaming::priority::{select_top, BuildPriority, PriorityWeights};
use crate::streaming::result::GeometryBuildResult;
use crate::streaming::scheduler::BuildScheduler;
use crate::streaming::task::{ChunkKey, EntityTask, GeometryOwner, GeometryTask};

/// What one [`StreamingContainer::tick`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Batches whose fence had signalled
    pub reaped_batches: usize,
    /// Reaped results that became visible
    pub committed: usize,
    /// Reaped results discarded as stale
    pub stale: usize,
    /// Builds submitted this tick
    pub submitted: usize,
    /// Pending requests left waiting for a free fence
    pub back_pressured: usize,
}

/// Snapshot of the container for debugging overlays and logs.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StreamingStats {
    pub capacity: usize,
    pub ready_cells: usize,
    pub pending: usize,
    pub in_flight_batches: usize,
    pub free_fences: usize,
    pub batch_size: usize,
    pub total_batches: usize,
    /// Results that became visible since creation
    pub committed_total: u64,
    /// Results discarded as stale since creation
    pub stale_total: u64,
    /// Builds that bypassed the scheduler
    pub important_total: u64,
    pub batches_submitted: u64,
    pub entity_results: usize,
    /// GPU bytes held by visible chunk and entity results
    pub resident_gpu_bytes: u64,
    /// Resources waiting in the GC
    pub gc_pending: usize,
}

/// A ready chunk as seen by TLAS instancing.
pub struct ReadyInstance<B: GpuBackend> {
    pub key: ChunkKey,
    pub origin: Vec3,
    pub result: Arc<GeometryBuildResult<B>>,
}

#[derive(Default)]
struct Totals {
    committed: u64,
    stale: u64,
    important: u64,
    batches_submitted: u64,
}

struct ContainerState<B: GpuBackend> {
    cells: Vec<VersionedCell<B>>,
    pending: HashMap<ChunkKey, PreparedGeometry>,
    scheduler: BuildScheduler<B>,
    entities: EntityFrame<B>,
    priority: PriorityWeights,
    totals: Totals,
}

impl<B: GpuBackend> ContainerState<B> {
    fn cell_mut(&mut self, key: ChunkKey) -> Result<&mut VersionedCell<B>> {
        let capacity = self.cells.len();
        self.cells.get_mut(key.index()).ok_or(Error::KeyOutOfRange {
            key: key.index(),
            capacity,
        })
    }

    /// Hand a finished build to its cell.
    fn commit(&mut self, result: GeometryBuildResult<B>, gc: &GarbageCollector, now: Instant) -> Option<CommitOutcome> {
        let capacity = self.cells.len();
        let cell = match result.chunk_key() {
            Some(key) => self.cells.get_mut(key.index()),
            None => None,
        };
        let Some(cell) = cell else {
            log::warn!(
                "Dropping build for {} outside capacity {}",
                result.owner(),
                capacity
            );
            gc.collect(result);
            return None;
        };

        let outcome = cell.enqueue(result, gc, now);
        match outcome {
            CommitOutcome::Committed => self.totals.committed += 1,
            CommitOutcome::Stale => self.totals.stale += 1,
            CommitOutcome::Empty => {}
        }
        Some(outcome)
    }

    /// Wait for every in-flight batch and commit what it built.
    fn drain_into_cells(&mut self, gc: &GarbageCollector) -> Result<()> {
        let completed = self.scheduler.drain()?;
        let now = Instant::now();
        for result in completed {
            self.commit(result, gc, now);
        }
        Ok(())
    }

    /// Release every cell's visible result and the pending set.
    fn release_cells(&mut self, gc: &GarbageCollector) {
        for cell in &mut self.cells {
            cell.release(gc);
        }
        self.pending.clear();
    }
}

/// Streams versioned chunk geometry onto the GPU.
pub struct StreamingContainer<B: GpuBackend> {
    backend: Arc<B>,
    gc: Arc<GarbageCollector>,
    state: Mutex<ContainerState<B>>,
}

impl<B: GpuBackend> StreamingContainer<B> {
    pub fn new(backend: Arc<B>, gc: Arc<GarbageCollector>, config: &StreamingConfig) -> Result<Self> {
        config.validate()?;
        let scheduler = BuildScheduler::new(Arc::clone(&backend), config.batch_size, config.total_batches)?;
        let cells = (0..config.initial_capacity).map(|i| VersionedCell::new(ChunkKey(i))).collect();

        log::info!(
            "Streaming container: {} cells, {} fences x {} builds",
            config.initial_capacity,
            config.total_batches,
            config.batch_size
        );

        Ok(Self {
            backend,
            gc,
            state: Mutex::new(ContainerState {
                cells,
                pending: HashMap::new(),
                scheduler,
                entities: EntityFrame::default(),
                priority: config.priority,
                totals: Totals::default(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, ContainerState<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    pub fn capacity(&self) -> usize {
        self.state().cells.len()
    }

    /// Discard all chunk state and allocate `capacity` fresh cells.
    ///
    /// In-flight builds are waited for and discarded; their keys may no longer
    /// mean the same chunk.
    pub fn reset(&self, capacity: usize) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;

        for result in state.scheduler.drain()? {
            self.gc.collect(result);
        }
        state.release_cells(&self.gc);

        let (batch_size, total_batches) = (state.scheduler.batch_size(), state.scheduler.total_batches());
        state.scheduler = BuildScheduler::new(Arc::clone(&self.backend), batch_size, total_batches)?;
        state.cells = (0..capacity).map(|i| VersionedCell::new(ChunkKey(i))).collect();

        log::info!("Streaming container reset to {} cells", capacity);
        Ok(())
    }

    /// Retune the build scheduler. In-flight builds finish and are committed first.
    pub fn reset_scheduler(&self, batch_size: usize, total_batches: usize) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;

        let completed = state.scheduler.reconfigure(batch_size, total_batches)?;
        let now = Instant::now();
        for result in completed {
            state.commit(result, &self.gc, now);
        }
        Ok(())
    }

    /// Replace the priority weights used by later ticks.
    pub fn set_priority_weights(&self, weights: PriorityWeights) -> Result<()> {
        weights.validate()?;
        self.state().priority = weights;
        Ok(())
    }

    /// Request a (re)build of a chunk. Returns the version assigned to it.
    ///
    /// Important builds are compiled and submitted on the graphics queue
    /// right away and are visible when this returns. Others wait in the
    /// pending set for a tick, replacing any older request for the key.
    pub fn queue_chunk_build(&self, task: &GeometryTask<'_>, important: bool) -> Result<u64> {
        let lists = prepare_lists(&task.lists)?;

        let mut guard = self.state();
        let state = &mut *guard;
        let version = state.cell_mut(task.key)?.next_version();
        let prepared = PreparedGeometry::new(GeometryOwner::Chunk(task.key), version, task.origin, lists);

        if !important {
            if let Some(previous) = state.pending.insert(task.key, prepared) {
                log::trace!("{}: pending v{} replaced by v{}", task.key, previous.version, version);
            }
            return Ok(version);
        }

        if state.pending.remove(&task.key).is_some() {
            log::trace!("{}: pending request superseded by important v{}", task.key, version);
        }

        let mut result = compile(self.backend.as_ref(), prepared, BuildHint::FastTrace)?;
        let mut encoder = self.backend.create_encoder(&format!("{} important", task.key));
        record_builds(self.backend.as_ref(), &mut encoder, std::slice::from_mut(&mut result));
        self.backend.submit(encoder, QueueKind::Graphics, None)?;

        state.totals.important += 1;
        state.commit(result, &self.gc, Instant::now());
        Ok(version)
    }

    /// Stop showing a chunk. Builds already requested for it will be dropped.
    pub fn invalidate_chunk(&self, key: ChunkKey) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.cell_mut(key)?.invalidate(&self.gc);
        state.pending.remove(&key);
        log::debug!("{}: invalidated", key);
        Ok(())
    }

    /// Whether `key` has committed geometry. Unknown keys are not ready.
    pub fn is_ready(&self, key: ChunkKey) -> bool {
        self.state().cells.get(key.index()).is_some_and(VersionedCell::is_ready)
    }

    pub fn try_get_valid(&self, key: ChunkKey) -> Option<Arc<GeometryBuildResult<B>>> {
        self.state().cells.get(key.index()).and_then(VersionedCell::try_get_valid)
    }

    /// Version most recently made visible for `key`.
    pub fn committed_version(&self, key: ChunkKey) -> Option<u64> {
        self.state().cells.get(key.index()).map(VersionedCell::committed_version)
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn in_flight_batches(&self) -> usize {
        self.state().scheduler.in_flight()
    }

    /// Per-frame driver step. See [`StreamingContainer::tick_at`].
    pub fn tick(&self, camera_pos: Vec3) -> Result<TickReport> {
        self.tick_at(camera_pos, Instant::now())
    }

    /// Reap finished batches, then submit the highest-priority pending
    /// builds under a free fence.
    pub fn tick_at(&self, camera_pos: Vec3, now: Instant) -> Result<TickReport> {
        let mut guard = self.state();
        let state = &mut *guard;
        let mut report = TickReport::default();

        // Reap
        let in_flight_before = state.scheduler.in_flight();
        let completed = state.scheduler.reap()?;
        report.reaped_batches = in_flight_before - state.scheduler.in_flight();
        for result in completed {
            match state.commit(result, &self.gc, now) {
                Some(CommitOutcome::Committed) => report.committed += 1,
                Some(CommitOutcome::Stale) => report.stale += 1,
                Some(CommitOutcome::Empty) | None => {}
            }
        }

        if state.pending.is_empty() {
            return Ok(report);
        }
        if !state.scheduler.can_submit() {
            report.back_pressured = state.pending.len();
            log::debug!("No free build fence; {} requests waiting", report.back_pressured);
            return Ok(report);
        }

        // Select
        let candidates = state.pending.iter().map(|(key, prepared)| {
            let since_update = state.cells.get(key.index()).and_then(|cell| cell.since_update(now));
            BuildPriority {
                key: *key,
                score: state.priority.score(since_update, camera_pos.distance(prepared.origin)),
            }
        });
        let selected = select_top(candidates, state.scheduler.batch_size());

        let mut batch = Vec::with_capacity(selected.len());
        for priority in selected {
            if let Some(prepared) = state.pending.remove(&priority.key) {
                batch.push(compile(self.backend.as_ref(), prepared, BuildHint::FastTrace)?);
            }
        }

        // Submit
        report.submitted = batch.len();
        if let Some(unsubmitted) = state.scheduler.submit(batch)? {
            // can_submit was checked under the same lock
            log::warn!("Build batch of {} refused by scheduler", unsubmitted.len());
            report.submitted = 0;
            for result in unsubmitted {
                self.gc.collect(result);
            }
        } else {
            state.totals.batches_submitted += 1;
        }
        report.back_pressured = state.pending.len();

        log::trace!(
            "Tick: reaped {} batches ({} committed, {} stale), submitted {}",
            report.reaped_batches,
            report.committed,
            report.stale,
            report.submitted
        );
        Ok(report)
    }

    /// Build this frame's entity geometry and replace last frame's.
    ///
    /// Returns the number of non-empty entity results now visible.
    pub fn build_entities(&self, tasks: &[EntityTask<'_>]) -> Result<usize> {
        let prepared = prepare_entities(tasks)?;

        let mut guard = self.state();
        let state = &mut *guard;
        let frame = state.entities.next_frame();

        let mut results = Vec::with_capacity(prepared.len());
        for mut geometry in prepared {
            geometry.version = frame;
            results.push(compile(self.backend.as_ref(), geometry, BuildHint::FastBuild)?);
        }

        if !results.is_empty() {
            let mut encoder = self.backend.create_encoder(&format!("entities frame {}", frame));
            record_builds(self.backend.as_ref(), &mut encoder, &mut results);
            self.backend.submit(encoder, QueueKind::Graphics, None)?;
        }

        state.entities.replace(results, &self.gc);
        log::trace!("Entity frame {}: {} results", frame, state.entities.results().len());
        Ok(state.entities.results().len())
    }

    pub fn entity_results(&self) -> Vec<Arc<GeometryBuildResult<B>>> {
        self.state().entities.results().to_vec()
    }

    /// Every ready chunk with its origin, in key order.
    pub fn ready_instances(&self) -> Vec<ReadyInstance<B>> {
        self.state()
            .cells
            .iter()
            .filter_map(|cell| {
                cell.try_get_valid().map(|result| ReadyInstance {
                    key: cell.key(),
                    origin: result.origin(),
                    result,
                })
            })
            .collect()
    }

    pub fn stats(&self) -> StreamingStats {
        let state = self.state();
        let visible: Vec<_> = state.cells.iter().filter_map(VersionedCell::try_get_valid).collect();
        let chunk_bytes: u64 = visible.iter().map(|r| r.gpu_bytes()).sum();

        StreamingStats {
            capacity: state.cells.len(),
            ready_cells: visible.len(),
            pending: state.pending.len(),
            in_flight_batches: state.scheduler.in_flight(),
            free_fences: state.scheduler.free_fences(),
            batch_size: state.scheduler.batch_size(),
            total_batches: state.scheduler.total_batches(),
            committed_total: state.totals.committed,
            stale_total: state.totals.stale,
            important_total: state.totals.important,
            batches_submitted: state.totals.batches_submitted,
            entity_results: state.entities.results().len(),
            resident_gpu_bytes: chunk_bytes + state.entities.gpu_bytes(),
            gc_pending: self.gc.pending(),
        }
    }

    /// Finish in-flight work and hand every resource to the GC.
    ///
    /// The container stays usable; it simply has no cells until the next
    /// [`StreamingContainer::reset`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;

        state.drain_into_cells(&self.gc)?;
        state.release_cells(&self.gc);
        state.cells.clear();
        state.entities.clear(&self.gc);

        log::info!("Streaming container closed; {} resources awaiting GC", self.gc.pending());
        Ok(())
    }
}

impl<B: GpuBackend> Drop for StreamingContainer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Streaming container shutdown failed: {}", e);
        }
    }
}
