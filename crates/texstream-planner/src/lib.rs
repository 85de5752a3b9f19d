//! # Texstream Planner
//!
//! Budget-driven texture mip streaming scheduler.
//!
//! Once per frame the streamer snapshots its working set and runs a planning
//! cycle on a background job:
//! - **Order keys**: every texture is ranked by a packed 32-bit key
//! - **Budget partition**: a bias search and a weighted quickselect split
//!   the ranked list into precached, in-budget and on-screen regions
//! - **Plan**: per-texture target mips become load requests, trim
//!   candidates, unlinks and aborts
//! - **Apply**: on the render thread the schedule is drained into disk
//!   stream requests, trims, kicks and pool garbage collection
//!
//! [`PlanningStreamer`] owns the cycle state machine; the disk reader sits
//! behind the [`StreamEngine`] trait.

pub mod apply;
pub mod budget;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod mip;
pub mod order_key;
pub mod plan;
pub mod pool;
pub mod resources;
pub mod schedule;
pub mod select;
pub mod streamer;
pub mod update_mip;

pub use budget::{BudgetPartition, MemoryState};
pub use catalog::{TextureCatalog, TextureDesc, TextureFlags, TextureHandle, TextureRecord};
pub use config::StreamingConfig;
pub use engine::{ChannelStreamEngine, StreamEngine, StreamInRequest};
pub use mip::{MipSizes, TextureFormat};
pub use order_key::OrderKey;
pub use pool::{StreamTaskPriority, TexturePool};
pub use resources::{StreamCompletion, TextureResources};
pub use schedule::{MipRequest, PlanningAction, Schedule};
pub use streamer::{CycleState, FrameInfo, PlanningStreamer, StreamerStats};
pub use update_mip::UpdateMipFlags;

use thiserror::Error;

/// Number of look-ahead visibility zones tracked per texture
pub const MAX_PREDICTION_ZONES: usize = 2;

/// Streaming errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Invalid texture: {0}")]
    InvalidTexture(String),

    #[error("Texture not found: {0}")]
    TextureNotFound(TextureHandle),

    #[error("No stream in flight for {0}")]
    NoStreamInFlight(TextureHandle),

    #[error("Texture catalog is full")]
    CatalogFull,
}

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;
