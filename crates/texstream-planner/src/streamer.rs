//! Planning Streamer
//!
//! Drives one planning cycle per frame:
//!
//! ```text
//! Idle -> QueuedForUpdate -> Updating -> QueuedForSync -> QueuedForSchedule -> Idle
//!                                                    \-> QueuedForScheduleDiscard -> Idle
//! ```
//!
//! [`PlanningStreamer::begin_update_schedule`] snapshots the working set
//! and hands it to a background job. [`PlanningStreamer::apply_schedule`]
//! waits for that job, commits its ordering and drains the schedule. A
//! texture destroyed while a schedule is staged switches the cycle to the
//! discard path; the staged lists are dropped instead of applied.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use texstream_core::job::{JobHandle, JobPriority, JobSystem};

use crate::MAX_PREDICTION_ZONES;
use crate::apply::{ApplyParams, ApplyReport, apply_schedule};
use crate::budget::{BiasRange, MemoryState};
use crate::catalog::{TextureDesc, TextureHandle};
use crate::config::StreamingConfig;
use crate::engine::StreamEngine;
use crate::mip::FP_ONE;
use crate::order_key::TextureSnapshot;
use crate::plan::{CycleOutput, SortInput, run_planning_cycle};
use crate::pool::TexturePool;
use crate::resources::{StreamCompletion, TextureResources};
use crate::schedule::Schedule;
use crate::update_mip::{self, MipUpdateContext, UpdateMipFlags, UpdateMipRequest, apply_mip_update};
use crate::{StreamError, StreamResult};

/// Planning cycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum CycleState {
    Idle = 0,
    QueuedForUpdate = 1,
    Updating = 2,
    QueuedForSync = 3,
    QueuedForSchedule = 4,
    QueuedForScheduleDiscard = 5,
}

impl CycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::QueuedForUpdate,
            2 => Self::Updating,
            3 => Self::QueuedForSync,
            4 => Self::QueuedForSchedule,
            5 => Self::QueuedForScheduleDiscard,
            _ => Self::Idle,
        }
    }
}

/// Cycle state shared with the planning job
#[derive(Debug)]
struct SharedState(AtomicU8);

impl SharedState {
    fn new(state: CycleState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> CycleState {
        CycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: CycleState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Per-frame inputs from the renderer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameInfo {
    pub frame_id: i32,
    /// Current round id of each prediction zone
    pub zone_round_ids: [i32; MAX_PREDICTION_ZONES],
}

/// Streamer counters, refreshed by every committed cycle and apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamerStats {
    pub frame_id: i32,
    pub bias: i16,
    pub over_budget: bool,
    pub working_set: usize,
    pub precached: usize,
    pub balance_point: usize,
    pub on_screen_point: usize,
    pub list_size: usize,
    /// Streamed bytes the last cycle planned minus the middle of the
    /// slack band; positive when the planned set overshoots
    pub stream_delta: isize,
    pub requests: usize,
    pub submitted_jobs: usize,
    pub submitted_bytes: usize,
    pub in_flight_tasks: usize,
    /// Allocation failures since the streamer was created
    pub alloc_fails: usize,
    pub trimmed_bytes: usize,
    pub kicked_bytes: usize,
    pub gc_freed_bytes: usize,
    pub pool_in_use_bytes: usize,
    pub pool_persistent_bytes: usize,
    pub pool_free_bytes: usize,
    pub pool_peak_bytes: usize,
}

/// State guarded by the streamer lock
struct CycleControl {
    engine: Box<dyn StreamEngine>,
    job: Option<JobHandle>,
    schedule: Schedule,
    bias: i16,
    prev_list_size: usize,
    over_budget: bool,
    /// Allocation failures since the last garbage collection
    alloc_fails: usize,
    flush_cycles: u32,
    prestream: bool,
    suppress: bool,
    round_ids: [i32; MAX_PREDICTION_ZONES],
    /// Deferred visibility reports, double buffered
    deferred: [Vec<UpdateMipRequest>; 2],
    /// List new reports go into
    rt_list: usize,
    stats: StreamerStats,
}

/// Budget-driven texture streamer
pub struct PlanningStreamer {
    config: StreamingConfig,
    jobs: Arc<JobSystem>,
    state: Arc<SharedState>,
    cycle_output: Arc<Mutex<Option<CycleOutput>>>,
    control: Mutex<CycleControl>,
    /// Texture access lock
    resources: Mutex<TextureResources>,
}

impl PlanningStreamer {
    pub fn new(config: StreamingConfig, engine: Box<dyn StreamEngine>, jobs: Arc<JobSystem>) -> StreamResult<Self> {
        config.validate()?;

        let resources = TextureResources::new(TexturePool::new(config.pool_budget()), config.max_stream_tasks);
        let control = CycleControl {
            engine,
            job: None,
            schedule: Schedule::default(),
            bias: 0,
            prev_list_size: 0,
            over_budget: false,
            alloc_fails: 0,
            flush_cycles: 0,
            prestream: false,
            suppress: config.suppress,
            round_ids: [0; MAX_PREDICTION_ZONES],
            deferred: Default::default(),
            rt_list: 0,
            stats: StreamerStats::default(),
        };

        log::info!(
            "Texture streamer: {} MB pool, {} task slots, {} planning",
            config.pool_size_mb,
            config.max_stream_tasks,
            if config.job_update { "background" } else { "inline" }
        );

        Ok(Self {
            config,
            jobs,
            state: Arc::new(SharedState::new(CycleState::Idle)),
            cycle_output: Arc::new(Mutex::new(None)),
            control: Mutex::new(control),
            resources: Mutex::new(resources),
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn state(&self) -> CycleState {
        self.state.load()
    }

    /// Whether the last committed cycle cut textures from the budget
    pub fn is_overflowing(&self) -> bool {
        self.control.lock().over_budget
    }

    /// Global mip bias of the last committed cycle, fixed point
    pub fn bias(&self) -> i16 {
        self.control.lock().bias
    }

    pub fn stats(&self) -> StreamerStats {
        let mut stats = self.control.lock().stats;
        let resources = self.resources.lock();
        stats.in_flight_tasks = resources.tasks.submitted_jobs();
        stats.pool_in_use_bytes = resources.pool.in_use_bytes();
        stats.pool_persistent_bytes = resources.pool.persistent_bytes();
        stats.pool_free_bytes = resources.pool.free_bytes();
        stats.pool_peak_bytes = resources.pool.peak_in_use_bytes();
        stats
    }

    /// Run `f` with the texture access lock held
    pub fn with_resources<R>(&self, f: impl FnOnce(&TextureResources) -> R) -> R {
        f(&self.resources.lock())
    }

    pub fn register_texture(&self, desc: TextureDesc) -> StreamResult<TextureHandle> {
        let handle = self.resources.lock().register(desc)?;
        log::trace!("Registered {}", handle);
        Ok(handle)
    }

    /// Remove a texture, cancelling its stream
    pub fn destroy_texture(&self, handle: TextureHandle) -> StreamResult<()> {
        self.on_texture_destroy(handle);
        self.resources
            .lock()
            .remove(handle)
            .map(|_| ())
            .ok_or(StreamError::TextureNotFound(handle))
    }

    /// Invalidate staged work that may reference `handle`
    ///
    /// Waits for a running planning job. A staged schedule is discarded
    /// rather than applied, and pending deferred reports for the texture
    /// are dropped.
    pub fn on_texture_destroy(&self, handle: TextureHandle) {
        let streamed = self
            .resources
            .lock()
            .catalog
            .get(handle)
            .is_some_and(|record| record.is_streamed());
        if !streamed {
            return;
        }

        let mut control = self.control.lock();
        self.sync_with_job_locked(&mut control);

        if self.state.load() == CycleState::QueuedForSchedule {
            self.state.store(CycleState::QueuedForScheduleDiscard);
        }
        for list in control.deferred.iter_mut() {
            list.retain(|request| request.texture != handle);
        }
    }

    /// Mark a texture as drawn in `frame_id`
    pub fn touch(&self, handle: TextureHandle, frame_id: i32) -> StreamResult<()> {
        self.resources.lock().catalog.touch(handle, frame_id)
    }

    /// Report the mip factor a texture was seen at
    pub fn update_mip(
        &self,
        handle: TextureHandle,
        mip_factor: f32,
        flags: UpdateMipFlags,
        update_id: i32,
    ) -> StreamResult<()> {
        let request = UpdateMipRequest {
            texture: handle,
            mip_factor,
            flags,
            update_id,
        };

        let mut control = self.control.lock();
        if self.config.defer_update_mip {
            if !self.resources.lock().catalog.contains(handle) {
                return Err(StreamError::TextureNotFound(handle));
            }
            let list = control.rt_list;
            control.deferred[list].push(request);
            return Ok(());
        }

        let ctx = self.mip_context(&control);
        drop(control);
        Self::apply_update(&mut self.resources.lock(), &request, &ctx)
    }

    /// Pin a force-high-res texture into every zone
    pub fn precache(&self, handle: TextureHandle) -> StreamResult<bool> {
        update_mip::precache(&mut self.resources.lock(), handle)
    }

    /// Lift the job and byte budgets for the next `cycles` applies that
    /// have requests
    pub fn flush_pending_jobs(&self, cycles: u32) {
        self.control.lock().flush_cycles = cycles;
    }

    pub fn set_prestream(&self, prestream: bool) {
        self.control.lock().prestream = prestream;
    }

    pub fn set_suppress(&self, suppress: bool) {
        self.control.lock().suppress = suppress;
    }

    /// Count a stream the pool could not back
    pub fn flag_out_of_memory(&self) {
        let mut control = self.control.lock();
        control.alloc_fails += 1;
        control.stats.alloc_fails += 1;
    }

    pub fn report_uploaded(&self, handle: TextureHandle, mip: u8) -> StreamResult<()> {
        self.resources.lock().report_uploaded(handle, mip)
    }

    pub fn complete_stream_in(&self, handle: TextureHandle, succeeded: bool) -> StreamResult<StreamCompletion> {
        let completion = self.resources.lock().complete_stream_in(handle, succeeded)?;
        log::trace!("Stream of {} finished: {:?}", handle, completion);
        Ok(completion)
    }

    /// Start a planning cycle
    ///
    /// Returns `false` when the previous cycle has not been applied yet or
    /// there is nothing to plan.
    pub fn begin_update_schedule(&self, frame: FrameInfo) -> bool {
        let mut control = self.control.lock();
        if self.state.load() != CycleState::Idle {
            return false;
        }

        let mut resources = self.resources.lock();

        control.rt_list ^= 1;
        let job_list = control.rt_list ^ 1;
        let pending = std::mem::take(&mut control.deferred[job_list]);
        if !pending.is_empty() {
            let ctx = self.mip_context(&control);
            for request in &pending {
                if let Err(err) = Self::apply_update(&mut resources, request, &ctx) {
                    log::trace!("Dropping deferred report: {}", err);
                }
            }
        }

        if resources.working.is_empty() {
            return false;
        }

        let mem_state = MemoryState::compute(
            resources.pool.budget(),
            &resources.pool,
            resources.tasks.submitted_bytes(),
            control.prev_list_size,
        );
        control.schedule.clear_lists();
        control.schedule.frame_id = frame.frame_id;
        control.schedule.mem_state = mem_state;

        if control.suppress {
            self.state.store(CycleState::QueuedForSync);
            return true;
        }

        let snapshots: Vec<TextureSnapshot> = resources
            .working
            .iter()
            .filter_map(|&handle| {
                resources
                    .catalog
                    .get(handle)
                    .map(|record| TextureSnapshot::capture(handle, record, &resources.tasks))
            })
            .collect();
        drop(resources);

        let precache_rounds = self.config.precache_rounds;
        let bias_range = if control.prestream {
            BiasRange {
                min: FP_ONE as i16,
                max: FP_ONE as i16,
            }
        } else {
            BiasRange::default()
        };

        let input = SortInput {
            snapshots,
            frame_id: frame.frame_id,
            zone_thresholds: frame.zone_round_ids.map(|round| round.saturating_sub(precache_rounds)),
            mem_state,
            prev_bias: control.bias,
            bias_range,
            min_mip: self.config.min_streamable_mip as i32,
            lowest_prefetch_bias: self.config.lowest_prefetch_bias,
            bias_damping: self.config.bias_damping,
            max_update_rate: self.config.max_update_rate,
            min_transfer_size: self.config.min_transfer_size(),
            verbose: self.config.verbose(),
        };
        control.round_ids = frame.zone_round_ids;

        self.state.store(CycleState::QueuedForUpdate);
        let state = Arc::clone(&self.state);
        let output = Arc::clone(&self.cycle_output);
        let job = move || {
            state.store(CycleState::Updating);
            let result = run_planning_cycle(&input);
            *output.lock() = Some(result);
            state.store(CycleState::QueuedForSync);
        };

        if self.config.job_update {
            control.job = Some(self.jobs.submit_fn("texstream.plan", JobPriority::Normal, job));
        } else {
            job();
        }
        true
    }

    /// Drain the staged schedule
    ///
    /// Blocks on a running planning job. Returns `None` when no schedule
    /// was staged.
    pub fn apply_schedule(&self) -> Option<ApplyReport> {
        let mut control = self.control.lock();
        self.sync_with_job_locked(&mut control);

        match self.state.load() {
            CycleState::QueuedForSchedule => {}
            CycleState::QueuedForScheduleDiscard => {
                log::debug!("Discarding schedule of frame {}", control.schedule.frame_id);
                control.schedule.clear_lists();
            }
            _ => return None,
        }

        let control = &mut *control;
        let mut params = ApplyParams::from_config(&self.config);
        params.prestream = control.prestream;
        params.suppress = control.suppress;
        params.gc_max_items = if control.alloc_fails > 0 {
            self.config.gc_items_overflow
        } else {
            self.config.gc_items_normal
        };
        control.alloc_fails = 0;
        if control.flush_cycles > 0 && !control.schedule.requests.is_empty() {
            params.flush = true;
            control.flush_cycles -= 1;
        }

        let report = {
            let mut resources = self.resources.lock();
            apply_schedule(&mut resources, &mut control.schedule, &params, control.engine.as_mut())
        };
        control.alloc_fails += report.alloc_fails;

        let stats = &mut control.stats;
        stats.requests = report.requests;
        stats.submitted_jobs = report.submitted;
        stats.submitted_bytes = report.submitted_bytes;
        stats.alloc_fails += report.alloc_fails;
        stats.trimmed_bytes = report.trimmed_bytes;
        stats.kicked_bytes = report.kicked_bytes;
        stats.gc_freed_bytes = report.gc_freed_bytes;

        if self.config.debug_level >= 1 {
            log::info!(
                "Frame {}: bias {} balance {}/{} requests {} submitted {} ({} bytes) trimmed {} kicked {} gc {}{}",
                control.schedule.frame_id,
                control.bias,
                stats.balance_point,
                stats.precached,
                report.requests,
                report.submitted,
                report.submitted_bytes,
                report.trimmed_bytes,
                report.kicked_bytes,
                report.gc_freed_bytes,
                if control.over_budget { " over budget" } else { "" }
            );
        }
        if report.alloc_fails > 0 {
            log::warn!("Streaming pool out of memory; {} allocations failed", report.alloc_fails);
        }

        self.state.store(CycleState::Idle);
        Some(report)
    }

    /// Wait for the planning job and commit its output
    fn sync_with_job_locked(&self, control: &mut CycleControl) {
        if let Some(job) = control.job.take() {
            self.jobs.wait_for(&job);
        }

        if matches!(self.state.load(), CycleState::QueuedForUpdate | CycleState::Updating) {
            log::error!("Planning job ended without a schedule");
            self.state.store(CycleState::QueuedForSync);
        }
        if self.state.load() != CycleState::QueuedForSync {
            return;
        }

        let output = self.cycle_output.lock().take();
        if let Some(output) = output {
            let mut resources = self.resources.lock();
            resources.commit_order(&output.order);

            let partition = output.schedule.partition;
            control.over_budget = output.schedule.is_over_budget();
            control.bias = partition.bias;
            control.prev_list_size = output.list_size;

            let stats = &mut control.stats;
            stats.frame_id = output.schedule.frame_id;
            stats.bias = partition.bias;
            stats.over_budget = control.over_budget;
            stats.working_set = resources.working.len();
            stats.precached = partition.precached;
            stats.balance_point = partition.balance_point;
            stats.on_screen_point = partition.on_screen_point;
            stats.list_size = output.list_size;
            stats.stream_delta = output.schedule.mem_state.stream_delta;

            control.schedule = output.schedule;
        }
        self.state.store(CycleState::QueuedForSchedule);
    }

    fn mip_context(&self, control: &CycleControl) -> MipUpdateContext {
        MipUpdateContext {
            round_ids: control.round_ids,
            global_mip_bias: self.config.global_mip_bias,
            verbose: self.config.verbose(),
        }
    }

    fn apply_update(
        resources: &mut TextureResources,
        request: &UpdateMipRequest,
        ctx: &MipUpdateContext,
    ) -> StreamResult<()> {
        let record = resources.catalog.record_mut(request.texture)?;
        if apply_mip_update(record, request.mip_factor, request.flags, request.update_id, ctx) {
            resources.link(request.texture);
        }
        Ok(())
    }
}
