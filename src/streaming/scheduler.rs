//! Fence-bounded batching of BLAS builds
//!
//! The scheduler owns a fixed pool of `total_batches` fences. Every submitted
//! batch holds one fence until the GPU signals it; with no free fence nothing
//! new is dispatched and requests wait upstream (back-pressure, not an error).
//!
//! Completed batches are found by polling every in-flight fence with a zero
//! timeout, so batches that finish out of order are reaped as soon as they
//! are done. Only [`BuildScheduler::drain`] blocks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::config::validate_scheduler;
use crate::core::Result;
use crate::gpu::{GpuBackend, QueueKind};
use crate::streaming::compile::record_builds;
use crate::streaming::result::GeometryBuildResult;

struct InFlightBatch<B: GpuBackend> {
    id: u64,
    fence: B::Fence,
    results: Vec<GeometryBuildResult<B>>,
    submitted_at: Instant,
}

/// Pool of completion fences and the FIFO of batches they guard.
pub struct BuildScheduler<B: GpuBackend> {
    backend: Arc<B>,
    batch_size: usize,
    total_batches: usize,
    free: Vec<B::Fence>,
    in_flight: VecDeque<InFlightBatch<B>>,
    next_batch_id: u64,
}

impl<B: GpuBackend> BuildScheduler<B> {
    pub fn new(backend: Arc<B>, batch_size: usize, total_batches: usize) -> Result<Self> {
        validate_scheduler(batch_size, total_batches)?;
        let free = (0..total_batches)
            .map(|_| backend.create_fence())
            .collect::<Result<Vec<_>>>()?;
        log::debug!(
            "Build scheduler: {} fences, up to {} builds per batch",
            total_batches,
            batch_size
        );
        Ok(Self {
            backend,
            batch_size,
            total_batches,
            free,
            in_flight: VecDeque::new(),
            next_batch_id: 0,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn total_batches(&self) -> usize {
        self.total_batches
    }

    pub fn free_fences(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether a batch could be submitted right now.
    pub fn can_submit(&self) -> bool {
        !self.free.is_empty()
    }

    /// Collect the results of every batch whose fence has signalled.
    ///
    /// Never blocks. Returns results in completion-scan order.
    pub fn reap(&mut self) -> Result<Vec<GeometryBuildResult<B>>> {
        let mut done = Vec::new();
        let mut still_running = VecDeque::with_capacity(self.in_flight.len());
        let mut failure = None;

        while let Some(batch) = self.in_flight.pop_front() {
            if failure.is_some() {
                still_running.push_back(batch);
                continue;
            }
            match self.backend.wait_fence(&batch.fence, Some(Duration::ZERO)) {
                Ok(true) => done.push(batch),
                Ok(false) => still_running.push_back(batch),
                Err(e) => {
                    failure = Some(e);
                    still_running.push_back(batch);
                }
            }
        }
        self.in_flight = still_running;

        if let Some(e) = failure {
            // Keep every fence accounted for before bailing out.
            self.in_flight.extend(done);
            return Err(e);
        }

        let mut completed = Vec::new();
        for batch in done {
            self.retire(batch, &mut completed)?;
        }
        Ok(completed)
    }

    /// Block until every in-flight batch completes and return their results.
    pub fn drain(&mut self) -> Result<Vec<GeometryBuildResult<B>>> {
        let mut completed = Vec::new();
        if !self.in_flight.is_empty() {
            log::debug!("Draining {} in-flight build batches", self.in_flight.len());
        }
        while let Some(batch) = self.in_flight.pop_front() {
            if let Err(e) = self.backend.wait_fence(&batch.fence, None) {
                self.in_flight.push_front(batch);
                return Err(e);
            }
            self.retire(batch, &mut completed)?;
        }
        Ok(completed)
    }

    fn retire(&mut self, batch: InFlightBatch<B>, completed: &mut Vec<GeometryBuildResult<B>>) -> Result<()> {
        log::trace!(
            "Batch {} done: {} builds in {:.2}ms",
            batch.id,
            batch.results.len(),
            batch.submitted_at.elapsed().as_secs_f32() * 1000.0
        );
        self.backend.reset_fence(&batch.fence)?;
        self.free.push(batch.fence);
        completed.extend(batch.results);
        Ok(())
    }

    /// Record and submit one batch on the async queue under a free fence.
    ///
    /// With no free fence, or nothing to build, the results are handed back
    /// untouched.
    pub fn submit(&mut self, mut results: Vec<GeometryBuildResult<B>>) -> Result<Option<Vec<GeometryBuildResult<B>>>> {
        if results.is_empty() {
            return Ok(None);
        }
        let Some(fence) = self.free.pop() else {
            return Ok(Some(results));
        };

        let id = self.next_batch_id;
        self.next_batch_id += 1;

        let mut encoder = self.backend.create_encoder(&format!("build_batch_{}", id));
        record_builds(self.backend.as_ref(), &mut encoder, &mut results);

        if let Err(e) = self.backend.submit(encoder, QueueKind::Async, Some(&fence)) {
            self.free.push(fence);
            return Err(e);
        }

        log::trace!("Batch {} submitted: {} builds", id, results.len());
        self.in_flight.push_back(InFlightBatch {
            id,
            fence,
            results,
            submitted_at: Instant::now(),
        });
        Ok(None)
    }

    /// Drain, then rebuild the fence pool with new tuning.
    ///
    /// Returns the drained results; in-flight work is never discarded.
    pub fn reconfigure(&mut self, batch_size: usize, total_batches: usize) -> Result<Vec<GeometryBuildResult<B>>> {
        validate_scheduler(batch_size, total_batches)?;
        let completed = self.drain()?;

        if total_batches != self.total_batches {
            let free = (0..total_batches)
                .map(|_| self.backend.create_fence())
                .collect::<Result<Vec<_>>>()?;
            self.free = free;
        }
        self.batch_size = batch_size;
        self.total_batches = total_batches;

        log::info!(
            "Build scheduler reconfigured: {} fences, batch size {}",
            total_batches,
            batch_size
        );
        Ok(completed)
    }
}
