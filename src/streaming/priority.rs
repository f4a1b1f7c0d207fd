//! Build priority for pending chunk requests
//!
//! Score = time term × distance term:
//!
//! ```text
//! (1 - e^(-Δt / T½))^Tw · (1 / (1 + (Δd / D½)^Ds))^Dw
//! ```
//!
//! Keys that have been stale for a while and are near the camera come first;
//! keys that just updated score near zero wherever they are; far keys decay
//! by a power law.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};
use crate::streaming::task::ChunkKey;

/// Tunable constants of the priority score.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    /// T½: staleness time scale in seconds
    pub time_half_life_secs: f32,
    /// D½: distance at which the distance term halves (world units)
    pub distance_half_life: f32,
    /// Ds: distance falloff exponent
    pub distance_exponent: f32,
    /// Tw: weight of the time term
    pub time_weight: f32,
    /// Dw: weight of the distance term
    pub distance_weight: f32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            time_half_life_secs: 0.2,
            distance_half_life: 96.0,
            distance_exponent: 2.0,
            time_weight: 1.0,
            distance_weight: 1.0,
        }
    }
}

impl PriorityWeights {
    pub fn validate(&self) -> Result<()> {
        if !(self.time_half_life_secs > 0.0) || !(self.distance_half_life > 0.0) {
            return Err(Error::InvalidConfig("priority half-lives must be positive".into()));
        }
        if self.distance_exponent < 0.0 || self.time_weight < 0.0 || self.distance_weight < 0.0 {
            return Err(Error::InvalidConfig("priority exponents must be non-negative".into()));
        }
        Ok(())
    }

    /// Staleness term in `[0, 1]`. `None` (never updated) is maximally stale.
    pub fn time_factor(&self, since_update: Option<Duration>) -> f32 {
        let Some(elapsed) = since_update else { return 1.0 };
        let x = elapsed.as_secs_f32() / self.time_half_life_secs;
        (1.0 - (-x).exp()).powf(self.time_weight)
    }

    /// Distance term in `(0, 1]`.
    pub fn distance_factor(&self, distance: f32) -> f32 {
        let ratio = distance.max(0.0) / self.distance_half_life;
        (1.0 / (1.0 + ratio.powf(self.distance_exponent))).powf(self.distance_weight)
    }

    /// Priority of a pending build. Higher = sooner.
    pub fn score(&self, since_update: Option<Duration>, distance: f32) -> f32 {
        self.time_factor(since_update) * self.distance_factor(distance)
    }
}

/// Priority of one pending key.
#[derive(Clone, Copy, Debug)]
pub struct BuildPriority {
    pub key: ChunkKey,
    pub score: f32,
}

// Ord for BinaryHeap (max-heap by score)
impl Eq for BuildPriority {}

impl PartialEq for BuildPriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for BuildPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        // total_cmp handles NaN; ties fall back to key for a stable order
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for BuildPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The `count` highest-priority candidates, best first.
pub fn select_top(candidates: impl IntoIterator<Item = BuildPriority>, count: usize) -> Vec<BuildPriority> {
    let mut heap: BinaryHeap<BuildPriority> = candidates.into_iter().collect();
    let mut selected = Vec::with_capacity(count.min(heap.len()));
    while selected.len() < count {
        match heap.pop() {
            Some(priority) => selected.push(priority),
            None => break,
        }
    }
    selected
}
