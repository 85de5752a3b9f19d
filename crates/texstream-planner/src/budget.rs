//! Budget Partitioning
//!
//! Splits the ranked key list of a cycle into three nested regions:
//!
//! ```text
//! [0, on_screen) ⊆ [0, balance) ⊆ [0, precached) ⊆ [0, n)
//! ```
//!
//! Precached textures (forced, or recently reported in a zone) come first.
//! A binary search finds the global mip bias at which the precached set
//! fits the streaming budget, and a quickselect over the precached keys
//! finds the balance point: the keys before it are in budget. Visible
//! in-budget keys are then moved to the front.

use serde::Serialize;

use crate::mip::{FP_SHIFT, clamp_mip, fp_to_mip};
use crate::order_key::{OVER_BUDGET_MASK, OrderKey, TextureSnapshot};
use crate::pool::TexturePool;
use crate::select::{partition, quick_select_sum};
use texstream_core::memory::MemoryBudget;

/// Lowest global bias the search may pick: eight mips finer
pub const DEFAULT_MIN_BIAS: i16 = -(8 << FP_SHIFT);
/// Highest global bias the search may pick: eight mips coarser
pub const DEFAULT_MAX_BIAS: i16 = 8 << FP_SHIFT;
/// Binary search steps per cycle
pub const BIAS_SEARCH_STEPS: usize = 8;

/// Streaming pool occupancy captured when a cycle begins
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryState {
    /// Bytes bound in the pool, persistent mips and in flight loads included
    pub mem_streamed: isize,
    pub mem_bound_streamed: isize,
    pub mem_bound_streamed_persistent: isize,
    /// Bytes reserved by loads still in flight
    pub mem_temp: isize,
    pub pool_limit: isize,
    /// Soft limit: the pool with the slack band taken off
    pub mem_limit: isize,
    pub mem_free_slack: isize,
    pub mem_free_lower: isize,
    pub mem_free_upper: isize,
    /// Budget available to streamed (non-persistent) mips
    pub stream_limit: isize,
    pub stream_mid: isize,
    /// How far the last cycle's planned set was from the middle of the band
    pub stream_delta: isize,
}

impl MemoryState {
    pub fn compute(budget: MemoryBudget, pool: &TexturePool, in_flight_bytes: usize, prev_list_size: usize) -> Self {
        let pool_limit = budget.max_bytes as isize;
        let mem_limit = budget.soft_limit() as isize;
        let mem_free_slack = budget.slack() as isize;

        let mem_streamed = (pool.in_use_bytes() + pool.persistent_bytes()) as isize;
        let mem_temp = in_flight_bytes as isize;
        let mem_bound_streamed = mem_streamed - mem_temp;
        let mem_bound_streamed_persistent = pool.persistent_bytes() as isize;

        let stream_limit = mem_limit - mem_bound_streamed_persistent;
        let stream_mid = stream_limit + mem_free_slack / 2;

        Self {
            mem_streamed,
            mem_bound_streamed,
            mem_bound_streamed_persistent,
            mem_temp,
            pool_limit,
            mem_limit,
            mem_free_slack,
            mem_free_lower: mem_limit - mem_streamed,
            mem_free_upper: mem_limit + mem_free_slack - mem_streamed,
            stream_limit,
            stream_mid,
            stream_delta: prev_list_size as isize - stream_mid,
        }
    }
}

/// Bounds of the bias search, fixed point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiasRange {
    pub min: i16,
    pub max: i16,
}

impl Default for BiasRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_BIAS,
            max: DEFAULT_MAX_BIAS,
        }
    }
}

/// Inputs of [`partition_budget`]
#[derive(Debug, Clone, Copy)]
pub struct BudgetParams {
    /// Bytes available to streamed mips
    pub stream_limit: usize,
    /// Bias chosen by the previous cycle
    pub prev_bias: i16,
    pub bias_range: BiasRange,
    /// Finest mip any texture may target
    pub min_mip: i32,
    /// Floor of the final bias
    pub lowest_prefetch_bias: i16,
    /// Bias moves of this size or less are ignored
    pub damping: i16,
    pub verbose: bool,
}

/// Region boundaries over the key list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BudgetPartition {
    pub precached: usize,
    pub balance_point: usize,
    pub on_screen_point: usize,
    pub bias: i16,
}

/// Binary search for the bias that brings the precached set's streamed
/// size to the budget
///
/// Each step tries the midpoint of the current range: every key wants its
/// desired mip shifted by the midpoint, never finer than `min_mip` and
/// never coarser than its persistent mip. Fitting moves the range down,
/// overflowing moves it up. The result replaces `prev_bias` only when it
/// moves by more than `damping`.
pub fn search_bias(
    keys: &[OrderKey],
    snapshots: &[TextureSnapshot],
    params: &BudgetParams,
) -> i16 {
    let _span = tracing::debug_span!("texstream.bias", keys = keys.len()).entered();

    let fp_min_mip = params.min_mip << FP_SHIFT;
    let limit = params.stream_limit;
    let low_bound = params.bias_range.min as i32;
    let high_bound = (params.bias_range.max as i32).max(low_bound);

    let mut bias = clamp_mip(params.prev_bias as i32, low_bound, high_bound);
    let mut low = low_bound;
    let mut high = high_bound;

    for _ in 0..BIAS_SEARCH_STEPS {
        if high - low <= 1 {
            break;
        }
        let mid = (low + high) / 2;

        let mut size = 0usize;
        for key in keys {
            if size >= limit {
                break;
            }
            let fp_req = (key.fp_min_mip_cur() + mid).max(fp_min_mip);
            let req_mip = clamp_mip(fp_to_mip(fp_req), 0, key.persistent_mip());
            size += key.stream_size(&snapshots[key.snapshot as usize].sizes, req_mip);
        }

        if params.verbose {
            log::debug!(
                "Bias {:+.2} ({:#06x}) needs {} of {} bytes",
                mid as f32 / 256.0,
                mid as i16,
                size,
                limit
            );
        }

        if size < limit {
            high = mid;
        } else {
            low = mid;
        }
    }

    let prospective = (low + high) / 2;
    if (bias - prospective).abs() > params.damping as i32 {
        bias = prospective;
    }

    if params.verbose {
        log::debug!("Final bias {:+.2}", bias as f32 / 256.0);
    }
    bias as i16
}

/// Partition `keys` in place into precached, in-budget and on-screen
/// regions
pub fn partition_budget(
    keys: &mut [OrderKey],
    snapshots: &[TextureSnapshot],
    params: &BudgetParams,
) -> BudgetPartition {
    let precached = partition(keys, OrderKey::is_precached);

    if precached == 0 {
        return BudgetPartition {
            precached: 0,
            balance_point: 0,
            on_screen_point: 0,
            bias: params.prev_bias.max(params.lowest_prefetch_bias),
        };
    }

    let bias = search_bias(&keys[..precached], snapshots, params).max(params.lowest_prefetch_bias);

    let balance_point = if bias >= 0 {
        let _span = tracing::debug_span!("texstream.balance", precached).entered();
        let min_mip = params.min_mip;
        quick_select_sum(
            &mut keys[..precached],
            params.stream_limit.min(isize::MAX as usize) as isize,
            |a, b| a.cmp_masked(b, OVER_BUDGET_MASK).is_lt(),
            |key| {
                key.biased_stream_size(&snapshots[key.snapshot as usize].sizes, min_mip, bias as i32)
            },
        )
    } else {
        precached
    };

    let on_screen_point = partition(&mut keys[..balance_point], OrderKey::is_visible);

    BudgetPartition {
        precached,
        balance_point,
        on_screen_point,
        bias,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ROUND_NEVER, TextureFlags};
    use crate::order_key::build_order_keys;
    use crate::order_key::tests::snapshot_fixture;

    const MB: usize = 1024 * 1024;

    fn params(stream_limit: usize) -> BudgetParams {
        BudgetParams {
            stream_limit,
            prev_bias: 0,
            bias_range: BiasRange::default(),
            min_mip: 0,
            lowest_prefetch_bias: 0,
            damping: 8,
            verbose: false,
        }
    }

    #[test]
    fn test_memory_state_bands() {
        let budget = MemoryBudget::from_megabytes(100, 5);
        let mut pool = TexturePool::new(budget);
        pool.bind_persistent(10 * MB);
        let item = pool.allocate(20 * MB).unwrap();
        assert_eq!(item.size(), 20 * MB);

        let state = MemoryState::compute(budget, &pool, 4 * MB, 90 * MB);
        assert_eq!(state.mem_limit, (95 * MB) as isize);
        assert_eq!(state.mem_free_slack, (5 * MB) as isize);
        assert_eq!(state.mem_streamed, (30 * MB) as isize);
        assert_eq!(state.mem_bound_streamed, (26 * MB) as isize);
        assert_eq!(state.mem_free_lower, (65 * MB) as isize);
        assert_eq!(state.mem_free_upper, (70 * MB) as isize);
        assert_eq!(state.stream_limit, (85 * MB) as isize);
        assert_eq!(state.stream_mid, (85 * MB + 5 * MB / 2) as isize);
        assert_eq!(state.stream_delta, (90 * MB) as isize - state.stream_mid);
    }

    #[test]
    fn test_balance_fills_budget_exactly() {
        // 100 precached textures, 1MB streamable each, 50MB budget; odd
        // catalog entries are visible and so rank first
        let mut snapshots = snapshot_fixture(100);
        for (i, snapshot) in snapshots.iter_mut().enumerate() {
            if i % 2 == 0 {
                snapshot.access_frame_id = 0;
            }
        }
        let mut keys = build_order_keys(&snapshots, 100, [0, 0]);
        let result = partition_budget(&mut keys, &snapshots, &params(50 * MB));

        assert_eq!(result.precached, 100);
        assert_eq!(result.balance_point, 50);
        assert_eq!(result.on_screen_point, 50);
        assert!(result.bias > 0 && result.bias < 256, "bias {}", result.bias);
        assert!(keys[..50].iter().all(|k| k.is_visible()));
        assert!(keys[50..].iter().all(|k| !k.is_visible()));

        let in_budget: usize = keys[..result.balance_point]
            .iter()
            .map(|k| k.biased_stream_size(&snapshots[k.snapshot as usize].sizes, 0, result.bias as i32))
            .sum();
        assert!(in_budget <= 50 * MB);
    }

    #[test]
    fn test_regions_nest() {
        let mut snapshots = snapshot_fixture(40);
        for (i, snapshot) in snapshots.iter_mut().enumerate() {
            if i % 3 == 0 {
                snapshot.round_update_ids = [ROUND_NEVER; 2];
            }
            if i % 5 == 0 {
                snapshot.access_frame_id = 0;
            }
            if i % 7 == 0 {
                snapshot.flags |= TextureFlags::FORCE_STREAM_HIGH_RES;
            }
        }

        for limit in [0, 3 * MB, 10 * MB, 100 * MB] {
            let mut keys = build_order_keys(&snapshots, 100, [0, 0]);
            let result = partition_budget(&mut keys, &snapshots, &params(limit));

            assert!(result.on_screen_point <= result.balance_point);
            assert!(result.balance_point <= result.precached);
            assert!(result.precached <= keys.len());
            assert!(keys[..result.precached].iter().all(|k| k.is_precached()));
            assert!(keys[result.precached..].iter().all(|k| !k.is_precached()));
            assert!(keys[..result.on_screen_point].iter().all(|k| k.is_visible()));
            assert!(keys[result.on_screen_point..result.balance_point]
                .iter()
                .all(|k| !k.is_visible()));
        }
    }

    #[test]
    fn test_everything_fits_keeps_full_detail() {
        let snapshots = snapshot_fixture(10);
        let mut keys = build_order_keys(&snapshots, 100, [0, 0]);
        let result = partition_budget(&mut keys, &snapshots, &params(64 * MB));
        assert_eq!(result.bias, 0);
        assert_eq!(result.balance_point, 10);
    }

    #[test]
    fn test_zero_budget_degrades() {
        let snapshots = snapshot_fixture(10);
        let mut keys = build_order_keys(&snapshots, 100, [0, 0]);
        let result = partition_budget(&mut keys, &snapshots, &params(0));
        assert_eq!(result.precached, 10);
        // The search saturates towards the coarsest bias
        assert!(result.bias > DEFAULT_MAX_BIAS - 16, "bias {}", result.bias);
        // At most the straddling key is kept, and it streams nothing
        assert!(result.balance_point <= 1);
        let streamed: usize = keys[..result.balance_point]
            .iter()
            .map(|k| k.biased_stream_size(&snapshots[k.snapshot as usize].sizes, 0, result.bias as i32))
            .sum();
        assert_eq!(streamed, 0);
    }

    #[test]
    fn test_no_precached_skips_search() {
        let mut snapshots = snapshot_fixture(5);
        for snapshot in &mut snapshots {
            snapshot.round_update_ids = [ROUND_NEVER; 2];
        }
        let mut keys = build_order_keys(&snapshots, 100, [0, 0]);
        let mut p = params(MB);
        p.prev_bias = 77;
        let result = partition_budget(&mut keys, &snapshots, &p);
        assert_eq!(
            result,
            BudgetPartition {
                precached: 0,
                balance_point: 0,
                on_screen_point: 0,
                bias: 77
            }
        );
    }

    #[test]
    fn test_damping_holds_small_moves() {
        let snapshots = snapshot_fixture(100);
        let keys = build_order_keys(&snapshots, 100, [0, 0]);
        let fresh = search_bias(&keys, &snapshots, &params(50 * MB));

        let mut p = params(50 * MB);
        p.prev_bias = fresh + 5;
        assert_eq!(search_bias(&keys, &snapshots, &p), fresh + 5);
        p.prev_bias = fresh + 20;
        assert_eq!(search_bias(&keys, &snapshots, &p), fresh);
    }

    #[test]
    fn test_bias_range_is_clamped() {
        let snapshots = snapshot_fixture(4);
        let keys = build_order_keys(&snapshots, 100, [0, 0]);
        let mut p = params(0);
        p.bias_range = BiasRange { min: 256, max: 256 };
        p.prev_bias = -1000;
        // Collapsed range: no search steps, previous bias is clamped into it
        assert_eq!(search_bias(&keys, &snapshots, &p), 256);
    }

    #[test]
    fn test_more_budget_never_hurts() {
        let snapshots = snapshot_fixture(64);
        let mut last_balance = 0;
        let mut last_bias = i16::MAX;
        for megabytes in 1..=80 {
            let mut keys = build_order_keys(&snapshots, 100, [0, 0]);
            let result = partition_budget(&mut keys, &snapshots, &params(megabytes * MB));
            assert!(result.balance_point >= last_balance, "{} MB", megabytes);
            assert!(result.bias <= last_bias, "{} MB", megabytes);
            assert_eq!(result.balance_point, megabytes.min(64));
            last_balance = result.balance_point;
            last_bias = result.bias;
        }
    }
}
