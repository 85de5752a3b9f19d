//! Memory Accounting
//!
//! Bookkeeping for budgeted GPU-side pools:
//! - Pool budgets with a slack band above the soft limit
//! - Atomic usage counters with peak tracking
//! - Generational slot pool backing every index-based handle

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Memory budget for a pool, split into a soft limit and a slack band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    /// Total bytes the pool may reserve
    pub max_bytes: usize,
    /// Share of `max_bytes` kept as slack, in percent
    pub slack_percent: u32,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024, // 256 MB default
            slack_percent: 5,
        }
    }
}

impl MemoryBudget {
    /// Create a budget from a byte count
    pub fn new(max_bytes: usize, slack_percent: u32) -> Self {
        Self {
            max_bytes,
            slack_percent: slack_percent.min(100),
        }
    }

    /// Create a budget from a size in megabytes
    pub fn from_megabytes(megabytes: usize, slack_percent: u32) -> Self {
        Self::new(megabytes.saturating_mul(1024 * 1024), slack_percent)
    }

    /// Soft limit: the budget with the slack band taken off
    pub fn soft_limit(&self) -> usize {
        self.scaled(100 - self.slack_percent.min(100))
    }

    /// Size of the slack band
    pub fn slack(&self) -> usize {
        self.scaled(self.slack_percent.min(100))
    }

    fn scaled(&self, percent: u32) -> usize {
        (self.max_bytes as u128 * percent as u128 / 100) as usize
    }
}

/// Memory tracking statistics
#[derive(Debug, Default)]
pub struct MemoryStats {
    /// Total bytes allocated
    pub allocated: AtomicUsize,
    /// Peak bytes allocated
    pub peak: AtomicUsize,
    /// Number of allocations
    pub allocation_count: AtomicUsize,
}

impl MemoryStats {
    /// Create new memory stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation
    pub fn record_alloc(&self, size: usize) {
        let new_size = self.allocated.fetch_add(size, Ordering::Relaxed) + size;
        self.allocation_count.fetch_add(1, Ordering::Relaxed);

        let mut peak = self.peak.load(Ordering::Relaxed);
        while new_size > peak {
            match self.peak.compare_exchange_weak(
                peak,
                new_size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => peak = current,
            }
        }
    }

    /// Record a deallocation, saturating at zero
    pub fn record_dealloc(&self, size: usize) {
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(size);
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Get current allocated bytes
    pub fn current(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Get peak allocated bytes
    pub fn peak_usage(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Get total allocation count
    pub fn count(&self) -> usize {
        self.allocation_count.load(Ordering::Relaxed)
    }

    /// Reset statistics
    pub fn reset(&self) {
        self.allocated.store(0, Ordering::Relaxed);
        self.peak.store(0, Ordering::Relaxed);
        self.allocation_count.store(0, Ordering::Relaxed);
    }
}

/// Stable reference into a [`SlotPool`]
///
/// The generation changes every time a slot is vacated, so ids held past a
/// removal stop resolving instead of aliasing the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    /// Position of the slot in the pool's dense table
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Pool of objects addressed by generational [`SlotId`]s
///
/// Vacated slots are recycled most-recently-freed first. An optional limit
/// caps the number of live objects.
pub struct SlotPool<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    limit: Option<usize>,
    len: usize,
}

impl<T> SlotPool<T> {
    /// Create an unbounded pool
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            limit: None,
            len: 0,
        }
    }

    /// Create a pool holding at most `limit` live objects
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::with_capacity(limit.min(4096)),
            free_list: Vec::new(),
            limit: Some(limit),
            len: 0,
        }
    }

    /// Store a value, returning `None` when the pool is at its limit
    pub fn insert(&mut self, value: T) -> Option<SlotId> {
        if self.num_free() == 0 {
            return None;
        }

        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).ok()?;
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                index
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.len += 1;
        Some(SlotId {
            index,
            generation: slot.generation,
        })
    }

    /// Remove and return the value behind `id`
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(id.index);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Objects that can still be inserted before the limit is reached
    pub fn num_free(&self) -> usize {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.len),
            None => usize::MAX - self.len,
        }
    }

    /// Iterate live objects in slot order
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

impl<T> Default for SlotPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
