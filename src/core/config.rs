//! Streaming configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};
use crate::streaming::priority::PriorityWeights;

/// Tuning for the streaming container and its build scheduler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Maximum number of chunk builds submitted together under one fence.
    pub batch_size: usize,
    /// Number of fences in the pool, i.e. batches that may be in flight at once.
    pub total_batches: usize,
    /// Frames the frame driver keeps in flight. Sizes the GC ring.
    pub frames_in_flight: usize,
    /// Number of chunk cells allocated by `StreamingContainer::new`.
    pub initial_capacity: usize,
    /// Weights of the build priority score.
    pub priority: PriorityWeights,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            total_batches: 3,
            frames_in_flight: 3,
            initial_capacity: 0,
            priority: PriorityWeights::default(),
        }
    }
}

impl StreamingConfig {
    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_scheduler(self.batch_size, self.total_batches)?;
        if self.frames_in_flight == 0 {
            return Err(Error::InvalidConfig("frames_in_flight must be at least 1".into()));
        }
        self.priority.validate()
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load_json(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a JSON file, creating parent directories.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Shared by config validation and runtime scheduler reconfiguration.
pub(crate) fn validate_scheduler(batch_size: usize, total_batches: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(Error::InvalidConfig("batch_size must be at least 1".into()));
    }
    if total_batches == 0 {
        return Err(Error::InvalidConfig("total_batches must be at least 1".into()));
    }
    Ok(())
}
