//! Planning Schedule
//!
//! Output of one planning cycle, handed from the background job to the
//! render thread and drained by [`crate::apply`].

use serde::Serialize;

use crate::budget::{BudgetPartition, MemoryState};
use crate::catalog::TextureHandle;

/// Load `texture` down to `mip`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MipRequest {
    pub texture: TextureHandle,
    pub mip: u8,
}

/// Change to a stream already in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlanningAction {
    /// The stream loads mips the texture no longer wants
    Abort { texture: TextureHandle, want_mip: u8 },
}

/// Staged result of a planning cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct Schedule {
    pub frame_id: i32,
    pub mem_state: MemoryState,
    pub partition: BudgetPartition,
    /// Most urgent first
    pub requests: Vec<MipRequest>,
    /// Resident above their target; trimmed only under memory pressure
    pub trimmable: Vec<TextureHandle>,
    /// Idle at their persistent mip and no longer precached
    pub unlink: Vec<TextureHandle>,
    pub actions: Vec<PlanningAction>,
}

impl Schedule {
    pub fn bias(&self) -> i16 {
        self.partition.bias
    }

    pub fn balance_point(&self) -> usize {
        self.partition.balance_point
    }

    /// Whether planning cut textures from the budget this cycle
    pub fn is_over_budget(&self) -> bool {
        self.partition.balance_point < self.partition.precached
    }

    pub fn has_work(&self) -> bool {
        !(self.requests.is_empty()
            && self.trimmable.is_empty()
            && self.unlink.is_empty()
            && self.actions.is_empty())
    }

    /// Drop every staged list, keeping the partition for statistics
    pub fn clear_lists(&mut self) {
        self.requests.clear();
        self.trimmable.clear();
        self.unlink.clear();
        self.actions.clear();
    }
}
