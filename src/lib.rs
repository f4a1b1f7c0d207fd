//! Raystream - chunk geometry streaming for hardware ray tracing
//!
//! Producers hand in per-chunk geometry; the crate compiles it into vertex,
//! index and BLAS resources, batches the builds under a bounded pool of
//! fences, and exposes the newest finished version of every chunk to the
//! renderer. Replaced resources retire through a frame-indexed garbage
//! collector.

pub mod core;
pub mod gpu;
pub mod streaming;
