//! # Texstream Core
//!
//! Runtime building blocks shared by the texture streaming crates.
//!
//! - **Job System**: Background worker threads with priority queues and
//!   blocking completion handles
//! - **Memory**: Pool budgets with slack, atomic usage counters, and the
//!   generational slot pool behind texture and stream-task handles

pub mod job;
pub mod memory;

pub use job::{Job, JobHandle, JobPriority, JobSystem};
pub use memory::{MemoryBudget, MemoryStats, SlotId, SlotPool};
