//! Texture Pool and Stream Tasks
//!
//! The pool accounts for GPU memory held by streamed mips. Persistent mips
//! are bound for as long as a texture is loaded; streamed mips are carved out
//! of the pool as pool items when a stream starts and handed back to a reuse
//! cache when they are trimmed or a stream is cancelled. Garbage collection
//! releases cached items.
//!
//! Stream-in tasks live in a bounded slot table; each carries a cooperative
//! abort flag shared with the disk engine.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use texstream_core::memory::{MemoryBudget, MemoryStats, SlotId, SlotPool};

use crate::catalog::TextureHandle;

/// Disk stream priority classes, most urgent first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum StreamTaskPriority {
    Urgent = 0,
    AboveNormal = 1,
    Normal = 2,
    BelowNormal = 3,
    Idle = 4,
}

impl StreamTaskPriority {
    /// One class more urgent
    pub fn raised(self) -> Self {
        match self {
            Self::Urgent | Self::AboveNormal => Self::Urgent,
            Self::Normal => Self::AboveNormal,
            Self::BelowNormal => Self::Normal,
            Self::Idle => Self::BelowNormal,
        }
    }

    /// One class less urgent
    pub fn lowered(self) -> Self {
        match self {
            Self::Urgent => Self::AboveNormal,
            Self::AboveNormal => Self::Normal,
            Self::Normal => Self::BelowNormal,
            Self::BelowNormal | Self::Idle => Self::Idle,
        }
    }
}

/// Reservation of streaming memory for one stream-in
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct PoolItem {
    size: usize,
}

impl PoolItem {
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Streaming memory pool
pub struct TexturePool {
    budget: MemoryBudget,
    /// Streamed mips bound to textures plus memory reserved by in-flight loads
    in_use: MemoryStats,
    /// Persistent mips of loaded textures
    persistent: MemoryStats,
    /// Released items kept for reuse, oldest first
    free_items: VecDeque<usize>,
    free_bytes: usize,
}

impl TexturePool {
    pub fn new(budget: MemoryBudget) -> Self {
        Self {
            budget,
            in_use: MemoryStats::new(),
            persistent: MemoryStats::new(),
            free_items: VecDeque::new(),
            free_bytes: 0,
        }
    }

    pub fn budget(&self) -> MemoryBudget {
        self.budget
    }

    pub fn in_use_bytes(&self) -> usize {
        self.in_use.current()
    }

    pub fn peak_in_use_bytes(&self) -> usize {
        self.in_use.peak_usage()
    }

    pub fn persistent_bytes(&self) -> usize {
        self.persistent.current()
    }

    /// Bytes held by the reuse cache
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn free_items(&self) -> usize {
        self.free_items.len()
    }

    /// Everything the pool currently holds
    pub fn reserved_bytes(&self) -> usize {
        self.in_use_bytes() + self.persistent_bytes() + self.free_bytes
    }

    pub(crate) fn bind_persistent(&mut self, bytes: usize) {
        self.persistent.record_alloc(bytes);
    }

    pub(crate) fn unbind_persistent(&mut self, bytes: usize) {
        self.persistent.record_dealloc(bytes);
    }

    /// Reserve `bytes` for a stream-in
    ///
    /// An exact-size cached item is reused first; otherwise cached items are
    /// evicted until the request fits the pool. Returns `None` when it cannot.
    pub fn allocate(&mut self, bytes: usize) -> Option<PoolItem> {
        if let Some(pos) = self.free_items.iter().position(|&size| size == bytes) {
            self.free_items.remove(pos);
            self.free_bytes -= bytes;
            self.in_use.record_alloc(bytes);
            return Some(PoolItem { size: bytes });
        }

        while self.reserved_bytes() + bytes > self.budget.max_bytes {
            match self.free_items.pop_front() {
                Some(size) => self.free_bytes -= size,
                None => return None,
            }
        }

        self.in_use.record_alloc(bytes);
        Some(PoolItem { size: bytes })
    }

    /// Hand `bytes` of streamed memory back to the reuse cache
    pub(crate) fn release(&mut self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.in_use.record_dealloc(bytes);
        self.free_items.push_back(bytes);
        self.free_bytes += bytes;
    }

    /// Return an unused reservation
    pub(crate) fn release_item(&mut self, item: PoolItem) {
        self.release(item.size);
    }

    /// Free cached items, oldest first, while the pool holds more than
    /// `limit` bytes. At most `max_items` items are freed; returns the bytes
    /// released.
    pub fn garbage_collect(&mut self, limit: usize, max_items: usize) -> usize {
        let mut freed = 0;
        let mut items = 0;
        while items < max_items && self.reserved_bytes() > limit {
            match self.free_items.pop_front() {
                Some(size) => {
                    self.free_bytes -= size;
                    freed += size;
                    items += 1;
                }
                None => break,
            }
        }
        freed
    }
}

/// Handle to a stream-in task slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTaskId(SlotId);

/// One in-flight stream-in
#[derive(Debug)]
pub struct StreamInTask {
    pub texture: TextureHandle,
    /// Finest mip being loaded
    pub start_mip: u8,
    /// Coarsest mip being loaded
    pub end_mip: u8,
    pub activate_mip: u8,
    pub priority: StreamTaskPriority,
    /// Finest mip uploaded so far; starts at the previously resident mip
    pub lower_uploaded_mip: u8,
    pub bytes: usize,
    abort: Arc<AtomicBool>,
}

impl StreamInTask {
    pub(crate) fn new(
        texture: TextureHandle,
        start_mip: u8,
        end_mip: u8,
        activate_mip: u8,
        priority: StreamTaskPriority,
        bytes: usize,
    ) -> Self {
        Self {
            texture,
            start_mip,
            end_mip,
            activate_mip,
            priority,
            lower_uploaded_mip: end_mip + 1,
            bytes,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Ask the disk engine to drop this stream
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }
}

/// Bounded table of in-flight stream-in tasks
pub struct StreamTaskTable {
    tasks: SlotPool<StreamInTask>,
    submitted_bytes: usize,
}

impl StreamTaskTable {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            tasks: SlotPool::with_limit(max_tasks),
            submitted_bytes: 0,
        }
    }

    pub fn num_free(&self) -> usize {
        self.tasks.num_free()
    }

    /// Stream jobs currently in flight
    pub fn submitted_jobs(&self) -> usize {
        self.tasks.len()
    }

    /// Bytes requested by in-flight streams
    pub fn submitted_bytes(&self) -> usize {
        self.submitted_bytes
    }

    pub(crate) fn insert(&mut self, task: StreamInTask) -> Option<StreamTaskId> {
        let bytes = task.bytes;
        let id = self.tasks.insert(task).map(StreamTaskId)?;
        self.submitted_bytes += bytes;
        Some(id)
    }

    pub(crate) fn remove(&mut self, id: StreamTaskId) -> Option<StreamInTask> {
        let task = self.tasks.remove(id.0)?;
        self.submitted_bytes -= task.bytes;
        Some(task)
    }

    pub fn get(&self, id: StreamTaskId) -> Option<&StreamInTask> {
        self.tasks.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: StreamTaskId) -> Option<&mut StreamInTask> {
        self.tasks.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamInTask> {
        self.tasks.iter().map(|(_, task)| task)
    }
}
