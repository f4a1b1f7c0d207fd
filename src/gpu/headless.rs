//! CPU-only GPU backend
//!
//! Records everything the streaming core issues so it can be inspected, and
//! lets the caller decide when "the GPU" finishes: fences stay pending until
//! [`HeadlessBackend::signal_all`] / [`HeadlessBackend::signal_oldest`] is
//! called, or immediately when auto-signal is enabled. Used by unit tests,
//! benches and tools that run without a device.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::{Error, Result};
use crate::gpu::{
    BlasBuild, BlasDesc, BlasGeometryDesc, BufferDesc, BufferUsage, BuildHint, GpuBackend, QueueKind,
};

/// Live object counters shared by the backend and every object it created.
#[derive(Default)]
struct LiveCounters {
    buffers: AtomicUsize,
    blases: AtomicUsize,
}

/// Decrements a live counter on drop.
struct LiveToken {
    counters: Arc<LiveCounters>,
    is_blas: bool,
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        let counter = if self.is_blas { &self.counters.blases } else { &self.counters.buffers };
        counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A host-memory stand-in for a device buffer.
pub struct HeadlessBuffer {
    id: u64,
    label: String,
    usage: BufferUsage,
    contents: Arc<Mutex<Vec<u8>>>,
    _live: LiveToken,
}

impl HeadlessBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn size(&self) -> u64 {
        lock(&self.contents).len() as u64
    }

    /// Copy of the buffer contents as of the last submitted upload.
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.contents).clone()
    }

    /// Contents reinterpreted as `u32`s (index buffers).
    pub fn contents_u32(&self) -> Vec<u32> {
        lock(&self.contents)
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

/// A recorded acceleration structure; `is_built` flips once a submitted
/// encoder containing its build runs.
pub struct HeadlessBlas {
    id: u64,
    label: String,
    hint: BuildHint,
    geometries: Vec<BlasGeometryDesc>,
    built: Arc<AtomicBool>,
    _live: LiveToken,
}

impl HeadlessBlas {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn hint(&self) -> BuildHint {
        self.hint
    }

    pub fn geometries(&self) -> &[BlasGeometryDesc] {
        &self.geometries
    }

    pub fn is_built(&self) -> bool {
        self.built.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceState {
    Idle,
    Pending,
    Signaled,
}

/// Fence whose completion is driven by the test.
pub struct HeadlessFence {
    id: u64,
    state: Arc<Mutex<FenceState>>,
}

impl HeadlessFence {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_signaled(&self) -> bool {
        *lock(&self.state) == FenceState::Signaled
    }
}

enum HeadlessCommand {
    Upload { target: Arc<Mutex<Vec<u8>>>, data: Vec<u8> },
    Barrier { buffers: usize },
    BuildBlas { blas: Arc<AtomicBool>, geometries: usize },
}

/// Command stream recorded against a [`HeadlessBackend`].
pub struct HeadlessEncoder {
    label: String,
    commands: Vec<HeadlessCommand>,
}

/// Summary of one submitted encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub label: String,
    pub queue: QueueKind,
    pub fence: Option<u64>,
    pub uploads: usize,
    pub upload_bytes: usize,
    pub barriers: usize,
    pub barrier_buffers: usize,
    pub blas_builds: usize,
    pub blas_geometries: usize,
}

#[derive(Default)]
struct HeadlessState {
    submissions: Vec<SubmissionRecord>,
    /// Submitted fences in submission order, not yet signalled by the test
    pending_fences: Vec<Arc<Mutex<FenceState>>>,
}

/// CPU-only [`GpuBackend`].
#[derive(Default)]
pub struct HeadlessBackend {
    next_id: AtomicU64,
    auto_signal: AtomicBool,
    device_lost: AtomicBool,
    live: Arc<LiveCounters>,
    state: Mutex<HeadlessState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose fences signal as soon as they are submitted.
    pub fn with_auto_signal() -> Self {
        let backend = Self::default();
        backend.auto_signal.store(true, Ordering::Relaxed);
        backend
    }

    /// Complete every submitted fence. Returns how many were signalled.
    pub fn signal_all(&self) -> usize {
        let pending = std::mem::take(&mut lock(&self.state).pending_fences);
        let count = pending.len();
        for fence in pending {
            *lock(&fence) = FenceState::Signaled;
        }
        count
    }

    /// Complete the oldest outstanding submission. Returns false if none.
    pub fn signal_oldest(&self) -> bool {
        let mut state = lock(&self.state);
        if state.pending_fences.is_empty() {
            return false;
        }
        let fence = state.pending_fences.remove(0);
        *lock(&fence) = FenceState::Signaled;
        true
    }

    /// Complete the newest outstanding submission, leaving older ones pending.
    pub fn signal_newest(&self) -> bool {
        let fence = lock(&self.state).pending_fences.pop();
        match fence {
            Some(fence) => {
                *lock(&fence) = FenceState::Signaled;
                true
            }
            None => false,
        }
    }

    /// Every later fence wait fails as if the device was lost.
    pub fn simulate_device_loss(&self) {
        self.device_lost.store(true, Ordering::Release);
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        lock(&self.state).submissions.clone()
    }

    pub fn outstanding_fences(&self) -> usize {
        lock(&self.state).pending_fences.len()
    }

    /// Buffers created and not yet dropped.
    pub fn live_buffers(&self) -> usize {
        self.live.buffers.load(Ordering::Relaxed)
    }

    /// Acceleration structures created and not yet dropped.
    pub fn live_blases(&self) -> usize {
        self.live.blases.load(Ordering::Relaxed)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn token(&self, is_blas: bool) -> LiveToken {
        let counter = if is_blas { &self.live.blases } else { &self.live.buffers };
        counter.fetch_add(1, Ordering::Relaxed);
        LiveToken { counters: Arc::clone(&self.live), is_blas }
    }
}

impl GpuBackend for HeadlessBackend {
    type Buffer = HeadlessBuffer;
    type Blas = HeadlessBlas;
    type Fence = HeadlessFence;
    type Encoder = HeadlessEncoder;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<HeadlessBuffer> {
        let size = usize::try_from(desc.size)
            .map_err(|_| Error::Gpu(format!("buffer '{}' too large: {}", desc.label, desc.size)))?;
        Ok(HeadlessBuffer {
            id: self.next_id(),
            label: desc.label.to_string(),
            usage: desc.usage,
            contents: Arc::new(Mutex::new(vec![0; size])),
            _live: self.token(false),
        })
    }

    fn create_blas(&self, desc: &BlasDesc<'_>) -> Result<HeadlessBlas> {
        Ok(HeadlessBlas {
            id: self.next_id(),
            label: desc.label.to_string(),
            hint: desc.hint,
            geometries: desc.geometries.to_vec(),
            built: Arc::new(AtomicBool::new(false)),
            _live: self.token(true),
        })
    }

    fn create_fence(&self) -> Result<HeadlessFence> {
        Ok(HeadlessFence {
            id: self.next_id(),
            state: Arc::new(Mutex::new(FenceState::Idle)),
        })
    }

    fn create_encoder(&self, label: &str) -> HeadlessEncoder {
        HeadlessEncoder {
            label: label.to_string(),
            commands: Vec::new(),
        }
    }

    fn record_upload(&self, encoder: &mut HeadlessEncoder, dst: &HeadlessBuffer, data: &[u8]) {
        encoder.commands.push(HeadlessCommand::Upload {
            target: Arc::clone(&dst.contents),
            data: data.to_vec(),
        });
    }

    fn record_build_barrier(&self, encoder: &mut HeadlessEncoder, buffers: &[&HeadlessBuffer]) {
        encoder.commands.push(HeadlessCommand::Barrier { buffers: buffers.len() });
    }

    fn record_blas_builds(&self, encoder: &mut HeadlessEncoder, builds: &[BlasBuild<'_, Self>]) {
        for build in builds {
            encoder.commands.push(HeadlessCommand::BuildBlas {
                blas: Arc::clone(&build.blas.built),
                geometries: build.geometries.len(),
            });
        }
    }

    fn submit(&self, encoder: HeadlessEncoder, queue: QueueKind, signal: Option<&HeadlessFence>) -> Result<()> {
        let mut record = SubmissionRecord {
            label: encoder.label,
            queue,
            fence: signal.map(|f| f.id),
            uploads: 0,
            upload_bytes: 0,
            barriers: 0,
            barrier_buffers: 0,
            blas_builds: 0,
            blas_geometries: 0,
        };

        // Execute eagerly; fence state alone models completion.
        for command in encoder.commands {
            match command {
                HeadlessCommand::Upload { target, data } => {
                    record.uploads += 1;
                    record.upload_bytes += data.len();
                    let mut contents = lock(&target);
                    let len = data.len().min(contents.len());
                    contents[..len].copy_from_slice(&data[..len]);
                }
                HeadlessCommand::Barrier { buffers } => {
                    record.barriers += 1;
                    record.barrier_buffers += buffers;
                }
                HeadlessCommand::BuildBlas { blas, geometries } => {
                    record.blas_builds += 1;
                    record.blas_geometries += geometries;
                    blas.store(true, Ordering::Release);
                }
            }
        }

        let mut state = lock(&self.state);
        if let Some(fence) = signal {
            let mut fence_state = lock(&fence.state);
            if *fence_state == FenceState::Pending {
                return Err(Error::Gpu(format!("fence {} submitted while pending", fence.id)));
            }
            if self.auto_signal.load(Ordering::Relaxed) {
                *fence_state = FenceState::Signaled;
            } else {
                *fence_state = FenceState::Pending;
                state.pending_fences.push(Arc::clone(&fence.state));
            }
        }
        log::trace!("headless submit '{}' on {:?}", record.label, queue);
        state.submissions.push(record);
        Ok(())
    }

    fn wait_fence(&self, fence: &HeadlessFence, timeout: Option<Duration>) -> Result<bool> {
        if self.device_lost.load(Ordering::Acquire) {
            return Err(Error::DeviceLost("headless device lost".into()));
        }
        let current = *lock(&fence.state);
        match (current, timeout) {
            (FenceState::Signaled, _) => Ok(true),
            (FenceState::Pending, None) => {
                // A blocking wait lets the simulated GPU finish the work.
                lock(&self.state)
                    .pending_fences
                    .retain(|pending| !Arc::ptr_eq(pending, &fence.state));
                *lock(&fence.state) = FenceState::Signaled;
                Ok(true)
            }
            (FenceState::Pending, Some(_)) => Ok(false),
            (FenceState::Idle, None) => Err(Error::Gpu(format!(
                "unbounded wait on never-submitted fence {}",
                fence.id
            ))),
            (FenceState::Idle, Some(_)) => Ok(false),
        }
    }

    fn reset_fence(&self, fence: &HeadlessFence) -> Result<()> {
        let mut state = lock(&fence.state);
        if *state == FenceState::Pending {
            return Err(Error::Gpu(format!("reset of pending fence {}", fence.id)));
        }
        *state = FenceState::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::BlasGeometryInput;

    fn buffer(backend: &HeadlessBackend, size: u64) -> HeadlessBuffer {
        backend
            .create_buffer(&BufferDesc { label: "test", size, usage: BufferUsage::Vertex })
            .unwrap()
    }

    #[test]
    fn test_upload_applied_on_submit() {
        let backend = HeadlessBackend::new();
        let dst = buffer(&backend, 8);

        let mut encoder = backend.create_encoder("upload");
        backend.record_upload(&mut encoder, &dst, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(dst.contents(), vec![0; 8]);

        backend.submit(encoder, QueueKind::Graphics, None).unwrap();
        assert_eq!(dst.contents(), vec![1, 2, 3, 4, 5, 6, 7, 8]);

        let records = backend.submissions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].uploads, 1);
        assert_eq!(records[0].upload_bytes, 8);
    }

    #[test]
    fn test_buffer_metadata() {
        let backend = HeadlessBackend::new();
        let vertices = buffer(&backend, 48);
        let indices = backend
            .create_buffer(&BufferDesc { label: "chunk#0 indices", size: 24, usage: BufferUsage::Index })
            .unwrap();

        assert_ne!(vertices.id(), indices.id());
        assert_eq!(vertices.label(), "test");
        assert_eq!(indices.label(), "chunk#0 indices");
        assert_eq!(vertices.usage(), BufferUsage::Vertex);
        assert_eq!(indices.usage(), BufferUsage::Index);
        assert_eq!(vertices.size(), 48);
        assert_eq!(indices.size(), 24);
    }

    #[test]
    fn test_fence_lifecycle() {
        let backend = HeadlessBackend::new();
        let fence = backend.create_fence().unwrap();

        assert!(!backend.wait_fence(&fence, Some(Duration::ZERO)).unwrap());

        let encoder = backend.create_encoder("work");
        backend.submit(encoder, QueueKind::Async, Some(&fence)).unwrap();
        assert!(!backend.wait_fence(&fence, Some(Duration::ZERO)).unwrap());
        assert_eq!(backend.outstanding_fences(), 1);

        assert_eq!(backend.signal_all(), 1);
        assert!(backend.wait_fence(&fence, Some(Duration::ZERO)).unwrap());

        backend.reset_fence(&fence).unwrap();
        assert!(!fence.is_signaled());
    }

    #[test]
    fn test_unbounded_wait_completes_pending_fence() {
        let backend = HeadlessBackend::new();
        let fence = backend.create_fence().unwrap();
        backend.submit(backend.create_encoder("work"), QueueKind::Async, Some(&fence)).unwrap();

        assert!(backend.wait_fence(&fence, None).unwrap());
        assert_eq!(backend.outstanding_fences(), 0);
    }

    #[test]
    fn test_unbounded_wait_on_idle_fence_is_error() {
        let backend = HeadlessBackend::new();
        let fence = backend.create_fence().unwrap();
        assert!(backend.wait_fence(&fence, None).is_err());
    }

    #[test]
    fn test_resubmitting_pending_fence_is_error() {
        let backend = HeadlessBackend::new();
        let fence = backend.create_fence().unwrap();
        backend.submit(backend.create_encoder("a"), QueueKind::Async, Some(&fence)).unwrap();
        assert!(backend.submit(backend.create_encoder("b"), QueueKind::Async, Some(&fence)).is_err());
        assert!(backend.reset_fence(&fence).is_err());
    }

    #[test]
    fn test_device_loss() {
        let backend = HeadlessBackend::with_auto_signal();
        let fence = backend.create_fence().unwrap();
        backend.submit(backend.create_encoder("work"), QueueKind::Async, Some(&fence)).unwrap();

        backend.simulate_device_loss();
        assert!(matches!(
            backend.wait_fence(&fence, Some(Duration::ZERO)),
            Err(Error::DeviceLost(_))
        ));
    }

    #[test]
    fn test_signal_order() {
        let backend = HeadlessBackend::new();
        let first = backend.create_fence().unwrap();
        let second = backend.create_fence().unwrap();
        backend.submit(backend.create_encoder("1"), QueueKind::Async, Some(&first)).unwrap();
        backend.submit(backend.create_encoder("2"), QueueKind::Async, Some(&second)).unwrap();

        assert!(backend.signal_newest());
        assert!(!first.is_signaled());
        assert!(second.is_signaled());

        assert!(backend.signal_oldest());
        assert!(first.is_signaled());
        assert!(!backend.signal_oldest());
    }

    #[test]
    fn test_blas_build_and_live_counts() {
        let backend = HeadlessBackend::new();
        let vb = buffer(&backend, 36);
        let ib = buffer(&backend, 12);
        let desc = BlasGeometryDesc { vertex_count: 3, vertex_stride: 12, index_count: 3, opaque: true };
        let blas = backend
            .create_blas(&BlasDesc { label: "tri", hint: BuildHint::FastTrace, geometries: &[desc] })
            .unwrap();
        assert_eq!(backend.live_buffers(), 2);
        assert_eq!(backend.live_blases(), 1);

        let mut encoder = backend.create_encoder("build");
        backend.record_build_barrier(&mut encoder, &[&vb, &ib]);
        backend.record_blas_builds(
            &mut encoder,
            &[BlasBuild {
                blas: &blas,
                geometries: vec![BlasGeometryInput { vertex_buffer: &vb, index_buffer: &ib, desc }],
            }],
        );
        backend.submit(encoder, QueueKind::Async, None).unwrap();
        assert!(blas.is_built());

        let record = &backend.submissions()[0];
        assert_eq!(record.barrier_buffers, 2);
        assert_eq!(record.blas_geometries, 1);

        drop(vb);
        drop(blas);
        assert_eq!(backend.live_buffers(), 1);
        assert_eq!(backend.live_blases(), 0);
    }
}
