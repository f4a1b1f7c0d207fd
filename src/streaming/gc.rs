//! Frame-indexed deferred destruction
//!
//! GPU resources replaced or discarded while frames are in flight may still be
//! referenced by submitted command buffers. Instead of dropping them, every
//! mutation path hands them to the [`GarbageCollector`], which keeps them in a
//! ring of `N` buckets (`N` = frames in flight) and drops a bucket's contents
//! only when the write cursor comes back around to it.
//!
//! The frame driver must call [`GarbageCollector::advance`] exactly once per
//! frame, after waiting on the fence of the frame whose slot is being reused.
//! Since at most `N` frames are in flight, anything collected `N` frames ago
//! can no longer be referenced by the GPU.

use std::any::Any;
use std::sync::{Mutex, MutexGuard, PoisonError};

struct Ring {
    buckets: Vec<Vec<Box<dyn Any + Send>>>,
    cursor: usize,
    frame: u64,
    released_total: u64,
}

/// Ring buffer of deferred-free buckets.
///
/// Shared by injection (`Arc<GarbageCollector>`) between the frame driver and
/// every component that releases GPU resources.
pub struct GarbageCollector {
    ring: Mutex<Ring>,
}

impl GarbageCollector {
    /// Create a collector for `frames_in_flight` frames (at least 1).
    pub fn new(frames_in_flight: usize) -> Self {
        let count = frames_in_flight.max(1);
        Self {
            ring: Mutex::new(Ring {
                buckets: (0..count).map(|_| Vec::new()).collect(),
                cursor: 0,
                frame: 0,
                released_total: 0,
            }),
        }
    }

    fn ring(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Defer dropping `resource` until the GPU can no longer reference it.
    pub fn collect<T: Send + 'static>(&self, resource: T) {
        let mut ring = self.ring();
        let cursor = ring.cursor;
        ring.buckets[cursor].push(Box::new(resource));
    }

    /// Like [`GarbageCollector::collect`]; `None` is a no-op.
    pub fn collect_maybe<T: Send + 'static>(&self, resource: Option<T>) {
        if let Some(resource) = resource {
            self.collect(resource);
        }
    }

    /// Move to the next frame's bucket, releasing what it held.
    ///
    /// Returns the number of resources released.
    pub fn advance(&self) -> usize {
        // Drop outside the lock; destructors may be slow.
        let released = {
            let mut ring = self.ring();
            ring.cursor = (ring.cursor + 1) % ring.buckets.len();
            ring.frame += 1;
            let cursor = ring.cursor;
            let released = std::mem::take(&mut ring.buckets[cursor]);
            ring.released_total += released.len() as u64;
            released
        };
        let count = released.len();
        if count > 0 {
            log::trace!("GC released {} resources", count);
        }
        drop(released);
        count
    }

    /// Release everything immediately.
    ///
    /// Only valid once the device is idle, e.g. on shutdown after draining.
    pub fn flush(&self) -> usize {
        let released: Vec<_> = {
            let mut ring = self.ring();
            let released: Vec<_> = ring.buckets.iter_mut().flat_map(std::mem::take).collect();
            ring.released_total += released.len() as u64;
            released
        };
        released.len()
    }

    /// Resources waiting for release.
    pub fn pending(&self) -> usize {
        self.ring().buckets.iter().map(Vec::len).sum()
    }

    /// Total resources released since creation.
    pub fn released_total(&self) -> u64 {
        self.ring().released_total
    }

    pub fn frames_in_flight(&self) -> usize {
        self.ring().buckets.len()
    }

    /// Number of `advance` calls so far.
    pub fn frame(&self) -> u64 {
        self.ring().frame
    }
}
