//! Mip Planning
//!
//! Second half of a planning cycle. With the keys partitioned, every
//! texture gets a target mip and lands in at most one schedule list:
//!
//! - in budget, idle: finer target → load request, coarser → trimmable
//! - in budget, streaming: target coarser than what is uploaded → abort
//! - over budget, idle and loaded: coarser → trimmable, below the persistent
//!   mips → reload them, otherwise unlink once no longer precached
//!
//! Targets move at most `max_update_rate` mips finer per cycle. Reads
//! smaller than the minimum transfer size are widened by pulling in the
//! next finer mip while the rate allows it.
//!
//! Requests are sorted by a priority key:
//!
//! | bit    | set when |
//! |--------|----------|
//! | 31     | always   |
//! | 30     | resident finer than the unbiased desired mip |
//! | 29     | not high priority |
//! | 28     | only the top mip is missing (in budget only) |
//! | 27     | not visible |
//! | 19..22 | 7 - stream priority |
//! | 18     | not in zone 0 |
//! | 17     | not in zone 1 |
//! | 0..16  | desired mip - resident mip, fixed point, + 0x7f00 |

use crate::MAX_PREDICTION_ZONES;
use crate::budget::{BiasRange, BudgetParams, BudgetPartition, MemoryState, partition_budget};
use crate::catalog::TextureHandle;
use crate::mip::{FP_SHIFT, MipSizes, clamp_mip, fp_to_mip};
use crate::order_key::{OrderKey, PACKED_FP_BIAS, TextureSnapshot, build_order_keys};
use crate::schedule::{MipRequest, PlanningAction, Schedule};

/// Requests kept per cycle; the rest wait for the next one
pub const MAX_REQUESTS: usize = 16384;

/// Inputs of [`plan_mips`]
#[derive(Debug, Clone, Copy)]
pub struct PlanParams {
    pub min_mip: i32,
    pub bias: i16,
    pub max_update_rate: u8,
    pub min_transfer_size: usize,
    pub verbose: bool,
}

/// Target mip before rate limiting
///
/// Precached textures want their biased desired mip, everything else
/// falls back to its persistent mip.
fn desired_mip(key: &OrderKey, precached: bool, min_mip: i32, bias: i16) -> i32 {
    let persistent_mip = key.persistent_mip();
    if !precached {
        return persistent_mip;
    }
    let fp = clamp_mip(
        key.fp_min_mip_cur() + bias as i32,
        min_mip << FP_SHIFT,
        persistent_mip << FP_SHIFT,
    );
    fp_to_mip(fp)
}

/// Mip to load this cycle on the way from `have` to `desired`
///
/// Coarser targets are taken as is. Finer ones start one mip below `have`
/// and step further while the read is under `min_transfer_size`, never past
/// `desired` nor more than `max_update_rate` mips from `have`.
pub fn rate_limited_mip(
    sizes: &MipSizes,
    have: i32,
    desired: i32,
    max_update_rate: u8,
    min_transfer_size: usize,
) -> i32 {
    if desired >= have {
        return desired;
    }

    let limit = desired.max(have - max_update_rate.max(1) as i32);
    let resident = sizes.size_from(have);
    let mut want = have - 1;
    while want > limit && sizes.size_from(want).saturating_sub(resident) < min_transfer_size {
        want -= 1;
    }
    want
}

fn request_sort_key(key: &OrderKey, have: i32, want: i32, in_budget: bool) -> u32 {
    let fp = key.fp_min_mip_cur();
    let distance = (fp - (have << FP_SHIFT) + PACKED_FP_BIAS) as u16 as u32;

    let mut sort_key = 1 << 31 | distance;
    if have < fp.max(0) >> FP_SHIFT {
        sort_key |= 1 << 30;
    }
    if !key.is_high_priority() {
        sort_key |= 1 << 29;
    }
    if in_budget && want == 0 && have == 1 {
        sort_key |= 1 << 28;
    }
    if !key.is_visible() {
        sort_key |= 1 << 27;
    }
    sort_key |= (7 - key.stream_priority.min(7) as u32) << 19;
    if !key.is_in_zone(0) {
        sort_key |= 1 << 18;
    }
    if !key.is_in_zone(1) {
        sort_key |= 1 << 17;
    }
    sort_key
}

/// Fill the schedule lists from partitioned keys
///
/// Returns the streamed bytes of every texture at its planned mip;
/// persistent mips are not counted.
pub fn plan_mips(
    keys: &[OrderKey],
    snapshots: &[TextureSnapshot],
    partition: &BudgetPartition,
    params: &PlanParams,
    schedule: &mut Schedule,
) -> usize {
    let _span = tracing::debug_span!("texstream.plan", keys = keys.len()).entered();

    let mut list_size = 0usize;
    // (sort key, catalog index, key index, mip)
    let mut requests: Vec<(u32, usize, usize, u8)> = Vec::new();

    for (index, key) in keys.iter().enumerate() {
        let snapshot = &snapshots[key.snapshot as usize];
        let in_budget = index < partition.balance_point;
        let have = key.cur_mip as i32;
        let persistent_mip = key.persistent_mip();

        let desired = desired_mip(key, index < partition.precached, params.min_mip, params.bias);
        let want = rate_limited_mip(
            &snapshot.sizes,
            have,
            desired,
            params.max_update_rate,
            params.min_transfer_size,
        );
        list_size += key.stream_size(&snapshot.sizes, want);

        let mut request = |mip: i32| {
            if requests.len() < MAX_REQUESTS {
                let sort_key = request_sort_key(key, have, want, in_budget);
                requests.push((sort_key, key.handle.index(), index, mip as u8));
            }
        };

        if in_budget {
            match snapshot.streaming {
                None => {
                    if want > have {
                        schedule.trimmable.push(key.handle);
                    } else if have > want {
                        request(want);
                    }
                }
                Some(lower_uploaded_mip) => {
                    if want > lower_uploaded_mip as i32 {
                        schedule.actions.push(PlanningAction::Abort {
                            texture: key.handle,
                            want_mip: want as u8,
                        });
                    }
                }
            }
        } else if !key.is_streaming && !key.is_unloaded {
            if want > have {
                schedule.trimmable.push(key.handle);
            } else if have > persistent_mip {
                // Persistent mips went missing
                request(persistent_mip);
            } else if !key.is_precached() && have == persistent_mip {
                schedule.unlink.push(key.handle);
            }
        }
    }

    requests.sort_unstable_by_key(|&(sort_key, catalog_index, _, _)| (sort_key, catalog_index));
    schedule.requests.extend(requests.into_iter().map(|(_, _, index, mip)| {
        let key = &keys[index];
        if params.verbose {
            log::debug!(
                "Requesting mip: {} - Level: {}",
                snapshots[key.snapshot as usize].name,
                mip
            );
        }
        MipRequest {
            texture: key.handle,
            mip,
        }
    }));

    list_size
}

/// Everything a planning cycle reads, captured when the cycle begins
#[derive(Debug, Clone)]
pub struct SortInput {
    pub snapshots: Vec<TextureSnapshot>,
    pub frame_id: i32,
    pub zone_thresholds: [i32; MAX_PREDICTION_ZONES],
    pub mem_state: MemoryState,
    pub prev_bias: i16,
    pub bias_range: BiasRange,
    pub min_mip: i32,
    pub lowest_prefetch_bias: i16,
    pub bias_damping: i16,
    pub max_update_rate: u8,
    pub min_transfer_size: usize,
    pub verbose: bool,
}

/// Result of a planning cycle
#[derive(Debug, Clone, Default)]
pub struct CycleOutput {
    /// Working set in final key order
    pub order: Vec<TextureHandle>,
    pub schedule: Schedule,
    pub list_size: usize,
}

/// Rank, partition and plan one cycle
pub fn run_planning_cycle(input: &SortInput) -> CycleOutput {
    let _span = tracing::debug_span!("texstream.cycle", frame = input.frame_id).entered();

    let mut keys = build_order_keys(&input.snapshots, input.frame_id, input.zone_thresholds);

    let budget = BudgetParams {
        stream_limit: input.mem_state.stream_limit.max(0) as usize,
        prev_bias: input.prev_bias,
        bias_range: input.bias_range,
        min_mip: input.min_mip,
        lowest_prefetch_bias: input.lowest_prefetch_bias,
        damping: input.bias_damping,
        verbose: input.verbose,
    };
    let partition = partition_budget(&mut keys, &input.snapshots, &budget);

    let mut schedule = Schedule {
        frame_id: input.frame_id,
        mem_state: input.mem_state,
        partition,
        ..Default::default()
    };
    let params = PlanParams {
        min_mip: input.min_mip,
        bias: partition.bias,
        max_update_rate: input.max_update_rate,
        min_transfer_size: input.min_transfer_size,
        verbose: input.verbose,
    };
    let list_size = plan_mips(&keys, &input.snapshots, &partition, &params, &mut schedule);

    CycleOutput {
        order: keys.iter().map(|key| key.handle).collect(),
        schedule,
        list_size,
    }
}
