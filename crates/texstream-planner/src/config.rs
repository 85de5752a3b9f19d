//! Streaming Configuration
//!
//! Tunables of the planning streamer. Every field has a default, so a JSON
//! document only needs the keys it overrides.

use serde::{Deserialize, Serialize};
use texstream_core::memory::MemoryBudget;

use crate::{StreamError, StreamResult};

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

/// Streamer tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Streaming pool size in megabytes
    pub pool_size_mb: usize,
    /// Share of the pool kept as slack above the soft limit
    pub pool_slack_percent: u32,
    /// Concurrent stream-in task slots
    pub max_stream_tasks: usize,
    /// Stream jobs allowed in flight when issuing requests
    pub max_requested_jobs: usize,
    /// Bytes allowed in flight when issuing requests, in megabytes
    pub max_requested_mb: f32,
    /// Most mips a texture may gain in one cycle
    pub max_update_rate: u8,
    /// Reads smaller than this are widened, in kilobytes
    pub min_read_size_kb: usize,
    /// Lowest final bias, fixed point
    pub lowest_prefetch_bias: i16,
    /// Finest mip the planner targets
    pub min_streamable_mip: u8,
    /// Zone rounds a report stays relevant for
    pub precache_rounds: i32,
    /// Bias moves of this size or less are ignored, fixed point
    pub bias_damping: i16,
    pub postpone_mips: bool,
    pub postpone_threshold_kb: usize,
    pub postpone_threshold_mip: u8,
    pub streaming_from_hdd: bool,
    /// Run planning on the background job instead of inline
    pub job_update: bool,
    /// Queue visibility reports and apply them when a cycle begins
    pub defer_update_mip: bool,
    /// Stop streaming and fall back to persistent mips
    pub suppress: bool,
    pub gc_items_normal: usize,
    pub gc_items_overflow: usize,
    /// Added to every desired mip computed from a mip factor
    pub global_mip_bias: f32,
    /// 0 quiet, 1 per-cycle summary, 2 per-texture detail
    pub debug_level: u8,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            pool_size_mb: 512,
            pool_slack_percent: 5,
            max_stream_tasks: 256,
            max_requested_jobs: 256,
            max_requested_mb: 2.0,
            max_update_rate: 2,
            min_read_size_kb: 64,
            lowest_prefetch_bias: 0,
            min_streamable_mip: 0,
            precache_rounds: 1,
            bias_damping: 8,
            postpone_mips: true,
            postpone_threshold_kb: 1024,
            postpone_threshold_mip: 0,
            streaming_from_hdd: true,
            job_update: true,
            defer_update_mip: false,
            suppress: false,
            gc_items_normal: 2,
            gc_items_overflow: 1000,
            global_mip_bias: 0.0,
            debug_level: 0,
        }
    }
}

impl StreamingConfig {
    /// Parse a JSON document; missing keys keep their defaults
    pub fn from_json_str(json: &str) -> StreamResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> StreamResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values the streamer cannot run with
    ///
    /// A zero-sized pool is accepted: planning degrades to persistent mips.
    pub fn validate(&self) -> StreamResult<()> {
        if self.pool_slack_percent > 100 {
            return Err(StreamError::InvalidConfig(format!(
                "pool_slack_percent {} above 100",
                self.pool_slack_percent
            )));
        }
        if self.max_update_rate == 0 {
            return Err(StreamError::InvalidConfig("max_update_rate must be at least 1".into()));
        }
        if self.max_stream_tasks == 0 {
            return Err(StreamError::InvalidConfig("max_stream_tasks must be at least 1".into()));
        }
        if self.debug_level > 2 {
            return Err(StreamError::InvalidConfig(format!(
                "debug_level {} above 2",
                self.debug_level
            )));
        }
        if !self.max_requested_mb.is_finite() || self.max_requested_mb < 0.0 {
            return Err(StreamError::InvalidConfig(format!(
                "max_requested_mb {} is not a size",
                self.max_requested_mb
            )));
        }
        Ok(())
    }

    pub fn pool_budget(&self) -> MemoryBudget {
        MemoryBudget::from_megabytes(self.pool_size_mb, self.pool_slack_percent)
    }

    pub fn min_transfer_size(&self) -> usize {
        self.min_read_size_kb * KB
    }

    pub fn max_requested_bytes(&self) -> usize {
        (self.max_requested_mb as f64 * MB as f64) as usize
    }

    pub fn postpone_threshold_bytes(&self) -> usize {
        self.postpone_threshold_kb * KB
    }

    pub fn verbose(&self) -> bool {
        self.debug_level >= 2
    }
}
