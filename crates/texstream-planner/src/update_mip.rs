//! Visibility Reports
//!
//! The visibility system reports a mip factor per texture and prediction
//! zone many times per frame. Reports are folded into a running minimum per
//! zone; when a new round starts the accumulated minimum moves into history
//! and the texture's desired mip is recomputed from the smallest recent
//! factor across both zones.

use bitflags::bitflags;

use crate::catalog::{TextureFlags, TextureHandle, TextureRecord, UNSET_MIP_FACTOR};
use crate::resources::TextureResources;
use crate::{MAX_PREDICTION_ZONES, StreamResult};

bitflags! {
    /// Flags attached to a visibility report
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdateMipFlags: u32 {
        /// Prefer this texture when issuing loads
        const HIGH_PRIORITY = 1 << 0;
        /// Report belongs to the current view (zone 0) rather than the
        /// predicted one (zone 1)
        const SINGLE_FRAME_PRIORITY_UPDATE = 1 << 1;
    }
}

/// Round id precached textures are pinned to
pub const ROUND_ALWAYS: i32 = (1 << 29) - 1;

/// A zone's history counts while its round is this recent
const ROUND_RECENCY: i32 = 2;

/// A queued visibility report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateMipRequest {
    pub texture: TextureHandle,
    pub mip_factor: f32,
    pub flags: UpdateMipFlags,
    pub update_id: i32,
}

/// Streamer state a report is evaluated against
#[derive(Debug, Clone, Copy, Default)]
pub struct MipUpdateContext {
    /// Current round id per prediction zone
    pub round_ids: [i32; MAX_PREDICTION_ZONES],
    pub global_mip_bias: f32,
    pub verbose: bool,
}

impl MipUpdateContext {
    fn is_recent(&self, zone: usize, round_update_id: i32) -> bool {
        round_update_id >= 0 && round_update_id > self.round_ids[zone] - ROUND_RECENCY
    }
}

/// Fold one report into `record`
///
/// Returns `true` when a new round started and the desired mip was
/// recomputed; the caller relinks the texture into the working set.
pub fn apply_mip_update(
    record: &mut TextureRecord,
    mip_factor: f32,
    flags: UpdateMipFlags,
    update_id: i32,
    ctx: &MipUpdateContext,
) -> bool {
    if !record.is_streamed() || mip_factor.is_nan() {
        return false;
    }

    let zone = if flags.contains(UpdateMipFlags::SINGLE_FRAME_PRIORITY_UPDATE) {
        0
    } else {
        1
    };
    let other = zone ^ 1;

    let mut recomputed = false;
    if record.rounds[zone].round_update_id != update_id {
        let mut final_factor = mip_factor;
        if ctx.is_recent(zone, record.rounds[zone].round_update_id) {
            final_factor = final_factor.min(record.zones[zone].min_mip_factor);
        }

        let zone_info = &mut record.zones[zone];
        zone_info.last_min_mip_factor = if zone_info.min_mip_factor >= UNSET_MIP_FACTOR {
            mip_factor
        } else {
            zone_info.min_mip_factor
        };
        zone_info.min_mip_factor = mip_factor;

        let round = &mut record.rounds[zone];
        round.last_high_priority = round.high_priority;
        round.high_priority = false;
        round.round_update_id = update_id.max(ctx.round_ids[zone]);

        if ctx.is_recent(other, record.rounds[other].round_update_id) {
            final_factor = final_factor.min(record.zones[other].last_min_mip_factor);
        }

        let high_priority = record.rounds[zone].last_high_priority;
        set_desired_mip(record, final_factor, high_priority, ctx);
        recomputed = true;
    }

    let zone_info = &mut record.zones[zone];
    zone_info.min_mip_factor = zone_info.min_mip_factor.min(mip_factor);
    record.rounds[zone].high_priority |= flags.contains(UpdateMipFlags::HIGH_PRIORITY);
    recomputed
}

fn set_desired_mip(record: &mut TextureRecord, mip_factor: f32, high_priority: bool, ctx: &MipUpdateContext) {
    let fp = record.desired_mip_fp(mip_factor, ctx.global_mip_bias);

    if ctx.verbose {
        let previous = record.required_mip();
        let current = (fp.max(0) >> crate::mip::FP_SHIFT) as u8;
        if previous != current {
            log::debug!(
                "Updating mips: {} - Previous: {}, Current: {}",
                record.name,
                previous,
                current
            );
        }
    }

    record.fp_min_mip_cur = fp;
    if high_priority {
        record.flags.insert(TextureFlags::STREAM_HIGH_PRIORITY);
    }
}

/// Pin a force-high-res texture into every zone and make sure its
/// persistent mips are loaded
///
/// Other textures are left alone.
pub fn precache(resources: &mut TextureResources, handle: TextureHandle) -> StreamResult<bool> {
    let record = resources.catalog.record_mut(handle)?;
    if !record.is_force_stream_high_res() {
        return Ok(false);
    }

    for zone in 0..MAX_PREDICTION_ZONES {
        record.rounds[zone].round_update_id = ROUND_ALWAYS;
        record.zones[zone].min_mip_factor = 0.0;
    }
    if record.is_unloaded() {
        resources.load_persistent(handle)?;
    }
    Ok(true)
}
