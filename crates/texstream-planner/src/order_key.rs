//! Order Keys
//!
//! Every texture in a planning cycle is ranked by a packed 32-bit key.
//! Smaller keys are more important. The high bits hold flags stored
//! inverted (0 = set) so that sorting ascending puts forced, high priority,
//! visible and zone-resident textures first:
//!
//! | bit   | meaning when clear |
//! |-------|--------------------|
//! | 31    | force high-res     |
//! | 30    | high priority      |
//! | 29    | visible            |
//! | 28    | in zone 0          |
//! | 27    | in zone 1          |
//! | 0..16 | desired mip (fixed point) + [`PACKED_FP_BIAS`] |
//!
//! Equal keys are broken by catalog index, so the order is total.

use std::cmp::Ordering;

use crate::MAX_PREDICTION_ZONES;
use crate::catalog::{TextureFlags, TextureHandle, TextureRecord};
use crate::mip::{MipSizes, clamp_mip, fp_to_mip};
use crate::pool::StreamTaskTable;

pub const NOT_FORCE_HIGH_RES: u32 = 1 << 31;
pub const NOT_HIGH_PRIORITY: u32 = 1 << 30;
pub const NOT_VISIBLE: u32 = 1 << 29;
pub const NOT_IN_ZONE0: u32 = 1 << 28;
pub const NOT_IN_ZONE1: u32 = 1 << 27;

/// Offset that makes the signed desired mip sort as an unsigned 16-bit value
pub const PACKED_FP_BIAS: i32 = 0x7f00;

/// Ordering used when selecting within the budget: priority and visibility
/// are ignored so that only forced, zone and distance information count
pub const IN_BUDGET_MASK: u32 = !(NOT_HIGH_PRIORITY | NOT_VISIBLE);
/// Ordering over the full key
pub const OVER_BUDGET_MASK: u32 = u32::MAX;

/// Frames a texture counts as visible after it was last drawn
pub const VISIBILITY_FRAME_WINDOW: i32 = 8;

/// State of one working-set texture captured when a cycle begins
#[derive(Debug, Clone)]
pub struct TextureSnapshot {
    pub handle: TextureHandle,
    pub name: std::sync::Arc<str>,
    pub flags: TextureFlags,
    pub mips: u8,
    pub persistent_mips: u8,
    pub resident_mip: u8,
    pub fp_min_mip_cur: i16,
    pub access_frame_id: i32,
    pub round_update_ids: [i32; MAX_PREDICTION_ZONES],
    pub stream_priority: u8,
    pub sizes: MipSizes,
    /// Finest uploaded mip of the in-flight stream, if one is running
    pub streaming: Option<u8>,
}

impl TextureSnapshot {
    pub fn capture(handle: TextureHandle, record: &TextureRecord, tasks: &StreamTaskTable) -> Self {
        let streaming = record.stream_task().map(|id| {
            tasks
                .get(id)
                .map_or(record.resident_mip(), |task| task.lower_uploaded_mip)
        });

        Self {
            handle,
            name: record.name.clone(),
            flags: record.flags,
            mips: record.mips,
            persistent_mips: record.persistent_mips,
            resident_mip: record.resident_mip(),
            fp_min_mip_cur: record.fp_min_mip_cur,
            access_frame_id: record.access_frame_id,
            round_update_ids: [
                record.rounds[0].round_update_id,
                record.rounds[1].round_update_id,
            ],
            stream_priority: record.stream_priority,
            sizes: record.sizes().clone(),
            streaming,
        }
    }
}

/// Ranking key plus the cached per-texture fields the planner reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderKey {
    pub key: u32,
    pub handle: TextureHandle,
    /// Index of the texture in the cycle snapshot
    pub snapshot: u32,
    pub mips: u8,
    /// All mips for forced textures, otherwise the persistent count
    pub mips_persistent: u8,
    pub cur_mip: u8,
    pub persistent_size: usize,
    pub is_streaming: bool,
    pub is_unloaded: bool,
    pub stream_priority: u8,
}

impl OrderKey {
    /// Pack a key from its flags and the desired mip
    pub fn pack(
        force_high_res: bool,
        high_priority: bool,
        visible: bool,
        in_zone: [bool; MAX_PREDICTION_ZONES],
        fp_min_mip_cur: i16,
    ) -> u32 {
        let mut key = (fp_min_mip_cur as i32 + PACKED_FP_BIAS) as u16 as u32;
        if !force_high_res {
            key |= NOT_FORCE_HIGH_RES;
        }
        if !high_priority {
            key |= NOT_HIGH_PRIORITY;
        }
        if !visible {
            key |= NOT_VISIBLE;
        }
        if !in_zone[0] {
            key |= NOT_IN_ZONE0;
        }
        if !in_zone[1] {
            key |= NOT_IN_ZONE1;
        }
        key
    }

    pub fn new(
        snapshot_index: usize,
        texture: &TextureSnapshot,
        visible_after: i32,
        zone_thresholds: [i32; MAX_PREDICTION_ZONES],
    ) -> Self {
        let force = texture.flags.contains(TextureFlags::FORCE_STREAM_HIGH_RES);
        let key = if texture.flags.contains(TextureFlags::STREAMED) {
            Self::pack(
                force,
                texture.flags.contains(TextureFlags::STREAM_HIGH_PRIORITY),
                texture.access_frame_id >= visible_after,
                [
                    texture.round_update_ids[0] >= zone_thresholds[0],
                    texture.round_update_ids[1] >= zone_thresholds[1],
                ],
                texture.fp_min_mip_cur,
            )
        } else {
            // No streaming info: least important bucket
            u32::MAX
        };

        let persistent_mip = (texture.mips - texture.persistent_mips) as i32;
        Self {
            key,
            handle: texture.handle,
            snapshot: snapshot_index as u32,
            mips: texture.mips,
            mips_persistent: if force { texture.mips } else { texture.persistent_mips },
            cur_mip: texture.resident_mip,
            persistent_size: texture.sizes.size_from(persistent_mip),
            is_streaming: texture.streaming.is_some(),
            is_unloaded: texture.flags.contains(TextureFlags::UNLOADED),
            stream_priority: texture.stream_priority,
        }
    }

    pub fn is_force_stream_high_res(&self) -> bool {
        self.key & NOT_FORCE_HIGH_RES == 0
    }

    pub fn is_high_priority(&self) -> bool {
        self.key & NOT_HIGH_PRIORITY == 0
    }

    pub fn is_visible(&self) -> bool {
        self.key & NOT_VISIBLE == 0
    }

    pub fn is_in_zone(&self, zone: usize) -> bool {
        match zone {
            0 => self.key & NOT_IN_ZONE0 == 0,
            1 => self.key & NOT_IN_ZONE1 == 0,
            _ => false,
        }
    }

    /// Forced, or in either prediction zone
    pub fn is_precached(&self) -> bool {
        let mask = NOT_FORCE_HIGH_RES | NOT_IN_ZONE0 | NOT_IN_ZONE1;
        self.key & mask != mask
    }

    pub fn fp_min_mip_cur(&self) -> i32 {
        (self.key & 0xffff) as i32 - PACKED_FP_BIAS
    }

    /// Coarsest mip the planner keeps; 0 for forced textures
    pub fn persistent_mip(&self) -> i32 {
        (self.mips - self.mips_persistent) as i32
    }

    /// Streamed bytes needed to hold mips `mip..`
    pub fn stream_size(&self, sizes: &MipSizes, mip: i32) -> usize {
        sizes.size_from(mip).saturating_sub(self.persistent_size)
    }

    /// Streamed bytes at the desired mip shifted by `bias`, kept within
    /// `[min_mip, persistent_mip]`
    pub fn biased_stream_size(&self, sizes: &MipSizes, min_mip: i32, bias: i32) -> usize {
        let mip = clamp_mip(
            fp_to_mip(self.fp_min_mip_cur() + bias),
            min_mip,
            self.persistent_mip(),
        );
        self.stream_size(sizes, mip)
    }

    /// Compare under `mask`, breaking ties by catalog index
    pub fn cmp_masked(&self, other: &Self, mask: u32) -> Ordering {
        (self.key & mask)
            .cmp(&(other.key & mask))
            .then_with(|| self.handle.index().cmp(&other.handle.index()))
    }
}

/// Build the keys for one cycle, in snapshot order
///
/// `frame_id` is the current render frame; textures drawn within the last
/// [`VISIBILITY_FRAME_WINDOW`] frames count as visible. A texture is in a
/// zone when its round id for that zone is at least the threshold.
pub fn build_order_keys(
    textures: &[TextureSnapshot],
    frame_id: i32,
    zone_thresholds: [i32; MAX_PREDICTION_ZONES],
) -> Vec<OrderKey> {
    let _span = tracing::debug_span!("texstream.init_keys", textures = textures.len()).entered();
    let visible_after = frame_id.saturating_sub(VISIBILITY_FRAME_WINDOW);
    textures
        .iter()
        .enumerate()
        .map(|(index, texture)| OrderKey::new(index, texture, visible_after, zone_thresholds))
        .collect()
}
