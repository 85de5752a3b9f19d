//! Schedule Application
//!
//! Drains a staged [`Schedule`] on the render thread. Superseded streams are
//! aborted, the pool is garbage collected, and load requests are issued in
//! priority order until the task slots, the job budget or the byte budget
//! run out. A request that does not fit the pool first trims textures from
//! the trimmable list, then kicks textures from the end of the working set;
//! it starts on a later cycle once the memory is back.

use serde::Serialize;

use crate::catalog::TextureHandle;
use crate::config::StreamingConfig;
use crate::engine::StreamEngine;
use crate::mip::{clamp_mip, fp_to_mip};
use crate::pool::StreamTaskPriority;
use crate::resources::{StreamStart, TextureResources};
use crate::schedule::{MipRequest, PlanningAction, Schedule};

/// Byte budget while prestreaming or flushing
pub const UNCAPPED_REQUEST_BYTES: usize = 1024 * 1024 * 1024;
/// Job budget while flushing
pub const UNCAPPED_REQUEST_JOBS: usize = 1024 * 1024;

/// Per-apply limits and switches
#[derive(Debug, Clone, Copy)]
pub struct ApplyParams {
    pub max_requested_jobs: usize,
    pub max_requested_bytes: usize,
    pub max_stream_tasks: usize,
    pub prestream: bool,
    /// Lift the job and byte budgets for this apply
    pub flush: bool,
    pub postpone_mips: bool,
    pub postpone_threshold_bytes: usize,
    pub postpone_threshold_mip: u8,
    pub streaming_from_hdd: bool,
    pub suppress: bool,
    /// Cached pool items garbage collection may free
    pub gc_max_items: usize,
    pub verbose: bool,
}

impl ApplyParams {
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            max_requested_jobs: config.max_requested_jobs,
            max_requested_bytes: config.max_requested_bytes(),
            max_stream_tasks: config.max_stream_tasks,
            prestream: false,
            flush: false,
            postpone_mips: config.postpone_mips,
            postpone_threshold_bytes: config.postpone_threshold_bytes(),
            postpone_threshold_mip: config.postpone_threshold_mip,
            streaming_from_hdd: config.streaming_from_hdd,
            suppress: config.suppress,
            gc_max_items: config.gc_items_normal,
            verbose: config.verbose(),
        }
    }
}

/// What one apply did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub requests: usize,
    pub aborted: usize,
    pub submitted: usize,
    pub submitted_bytes: usize,
    pub trimmed_bytes: usize,
    pub kicked_bytes: usize,
    pub gc_freed_bytes: usize,
    pub unlinked: usize,
    /// Pool allocations that failed while issuing
    pub alloc_fails: usize,
    /// Whether the flush budgets were used
    pub flushed: bool,
}

/// Flag every in-flight stream named by an abort action
///
/// Streams that finished since the plan was made are skipped.
pub fn abort_superseded(resources: &TextureResources, actions: &[PlanningAction]) -> usize {
    let mut aborted = 0;
    for action in actions {
        match *action {
            PlanningAction::Abort { texture, want_mip } => {
                let task = resources
                    .catalog
                    .get(texture)
                    .and_then(|record| record.stream_task())
                    .and_then(|id| resources.tasks.get(id));
                if let Some(task) = task {
                    log::trace!("Aborting stream of {} (wants mip {})", texture, want_mip);
                    task.abort();
                    aborted += 1;
                }
            }
        }
    }
    aborted
}

/// Trim every idle texture back to its persistent mips
pub fn trim_to_persistent(resources: &mut TextureResources) -> usize {
    let mut trimmed = 0;
    for index in 0..resources.working.len() {
        let handle = resources.working[index];
        let Some(record) = resources.catalog.get(handle) else {
            continue;
        };
        if record.is_streaming() || record.is_unloaded() {
            continue;
        }
        let persistent_mip = record.persistent_mip();
        let resident_mip = record.resident_mip();
        if resident_mip < persistent_mip {
            let profit =
                record.sys_data_size(resident_mip as i32) - record.sys_data_size(persistent_mip as i32);
            if resources.stream_trim(handle, persistent_mip) {
                trimmed += profit;
            }
        }
    }
    trimmed
}

/// Issues requests against a memory estimate that trims and starts keep
/// current
struct RequestIssuer<'a> {
    resources: &'a mut TextureResources,
    params: &'a ApplyParams,
    bias: i32,
    balance_point: usize,
    mem_free_lower: isize,
    mem_free_upper: isize,
    kick_idx: isize,
    submitted_jobs: usize,
    submitted_bytes: usize,
    report: ApplyReport,
}

impl<'a> RequestIssuer<'a> {
    fn new(
        resources: &'a mut TextureResources,
        params: &'a ApplyParams,
        schedule: &Schedule,
    ) -> Self {
        let kick_idx = resources.working.len() as isize - 1;
        let submitted_jobs = resources.tasks.submitted_jobs();
        let submitted_bytes = resources.tasks.submitted_bytes();
        Self {
            resources,
            params,
            bias: schedule.bias() as i32,
            balance_point: schedule.balance_point(),
            mem_free_lower: schedule.mem_state.mem_free_lower,
            mem_free_upper: schedule.mem_state.mem_free_upper,
            kick_idx,
            submitted_jobs,
            submitted_bytes,
            report: ApplyReport::default(),
        }
    }

    fn issue(
        &mut self,
        engine: &mut dyn StreamEngine,
        requests: &[MipRequest],
        trimmable: &mut Vec<TextureHandle>,
    ) {
        let params = self.params;
        let (mut max_bytes, mut max_jobs) = if params.prestream {
            (UNCAPPED_REQUEST_BYTES, params.max_stream_tasks)
        } else {
            (params.max_requested_bytes, params.max_requested_jobs)
        };
        if params.flush && max_bytes > 0 && max_jobs > 0 {
            max_bytes = UNCAPPED_REQUEST_BYTES;
            max_jobs = UNCAPPED_REQUEST_JOBS;
            self.report.flushed = true;
        }

        let postpone_bytes = if params.postpone_mips && !params.streaming_from_hdd {
            params.postpone_threshold_bytes
        } else {
            usize::MAX
        };
        let postpone_mip = if params.postpone_mips {
            params.postpone_threshold_mip
        } else {
            0
        };

        engine.begin_read_group();
        for request in requests {
            if self.resources.tasks.num_free() == 0
                || self.submitted_jobs >= max_jobs
                || self.submitted_bytes >= max_bytes
            {
                break;
            }

            let Some(record) = self.resources.catalog.get(request.texture) else {
                continue;
            };
            if !record.is_streamed() {
                continue;
            }
            if record.is_unloaded() {
                // Streamed mips need the persistent ones underneath
                if let Err(err) = self.resources.load_persistent(request.texture) {
                    log::warn!("Cannot reload persistent mips of {}: {}", request.texture, err);
                }
                continue;
            }

            let persistent_mip = record.persistent_mip();
            let avail_mip = record.resident_mip();
            let mut wanted_mip = request.mip.min(persistent_mip);

            if !params.prestream {
                // Hold back large top mips unless they are the only ones missing
                let largest = record.sizes().level_size(wanted_mip);
                if (largest >= postpone_bytes || postpone_mip > wanted_mip)
                    && wanted_mip < persistent_mip.min(avail_mip.saturating_sub(1))
                {
                    wanted_mip += 1;
                }
            } else if wanted_mip == 0 {
                wanted_mip = 1;
            }

            if wanted_mip < avail_mip
                && !self.try_begin_from_disk(engine, request.texture, persistent_mip, wanted_mip, avail_mip, trimmable)
            {
                break;
            }
        }
        engine.end_read_group();
    }

    /// Start streaming `handle` from `avail_mip - 1` down to `wanted_mip`
    ///
    /// Returns `false` once issuing should stop for this cycle.
    fn try_begin_from_disk(
        &mut self,
        engine: &mut dyn StreamEngine,
        handle: TextureHandle,
        persistent_mip: u8,
        wanted_mip: u8,
        avail_mip: u8,
        trimmable: &mut Vec<TextureHandle>,
    ) -> bool {
        let Some(record) = self.resources.catalog.get(handle) else {
            return true;
        };

        let activate_mip =
            clamp_mip(record.required_mip() as i32, wanted_mip as i32, persistent_mip as i32) as u8;
        let mut priority = if self.params.streaming_from_hdd {
            StreamTaskPriority::Normal
        } else {
            StreamTaskPriority::BelowNormal
        };
        if record.is_high_priority() {
            priority = priority.raised();
        }

        let mut wanted_mip = wanted_mip;
        if activate_mip < avail_mip {
            // Load the mips the working set needs first; caching mips follow later
            wanted_mip = wanted_mip.max(activate_mip);
        }
        if wanted_mip < activate_mip {
            priority = priority.lowered();
        }

        let required = record.sys_data_size(wanted_mip as i32) - record.sys_data_size(avail_mip as i32);
        let required_signed = required as isize;

        if required_signed > self.mem_free_upper {
            let trimmed = self.trim_textures(required_signed - self.mem_free_lower, trimmable);
            self.mem_free_lower += trimmed;
            self.mem_free_upper += trimmed;

            if required_signed > self.mem_free_upper {
                let kicked = self.kick_textures(required_signed - self.mem_free_lower);
                self.mem_free_lower += kicked;
                self.mem_free_upper += kicked;
            }
            return true;
        }

        if record.is_streaming() {
            return true;
        }

        let Some(item) = self.resources.pool.allocate(required) else {
            self.report.alloc_fails += 1;
            return false;
        };

        let start = StreamStart {
            start_mip: wanted_mip,
            end_mip: avail_mip - 1,
            activate_mip,
            priority,
        };
        if self.resources.start_streaming(handle, item, start, engine) {
            if self.params.verbose {
                log::debug!(
                    "Streaming {} mips {}..={} ({} bytes, {:?})",
                    handle,
                    wanted_mip,
                    avail_mip - 1,
                    required,
                    priority
                );
            }
            self.mem_free_lower -= required_signed;
            self.mem_free_upper -= required_signed;
            self.submitted_jobs += 1;
            self.submitted_bytes += required;
            self.report.submitted += 1;
            self.report.submitted_bytes += required;
        }
        true
    }

    /// Trim from the back of the trimmable list until `required` bytes are
    /// freed; visited entries are dropped from the list
    fn trim_textures(&mut self, required: isize, trimmable: &mut Vec<TextureHandle>) -> isize {
        let _span = tracing::debug_span!("texstream.trim", candidates = trimmable.len()).entered();

        let mut trimmed: isize = 0;
        while trimmed < required {
            let Some(handle) = trimmable.pop() else {
                break;
            };
            let Some(record) = self.resources.catalog.get(handle) else {
                continue;
            };
            if record.is_unloaded() {
                continue;
            }

            let resident_mip = record.resident_mip();
            let target = clamp_mip(
                fp_to_mip(record.fp_min_mip_cur as i32 + self.bias),
                0,
                record.trim_floor_mip() as i32,
            );
            let profit = record.sys_data_size(resident_mip as i32) as isize - record.sys_data_size(target) as isize;

            if self.resources.stream_trim(handle, target as u8) {
                trimmed += profit;
            }
        }

        self.report.trimmed_bytes += trimmed.max(0) as usize;
        trimmed
    }

    /// Drop textures past the balance point to their trim floor, walking the
    /// working set backwards from where the last kick stopped
    fn kick_textures(&mut self, required: isize) -> isize {
        let _span = tracing::debug_span!("texstream.kick", from = self.kick_idx).entered();

        let mut kicked: isize = 0;
        while kicked < required && self.kick_idx >= self.balance_point as isize {
            let index = self.kick_idx as usize;
            self.kick_idx -= 1;

            let Some(&handle) = self.resources.working.get(index) else {
                continue;
            };
            let Some(record) = self.resources.catalog.get(handle) else {
                continue;
            };
            if record.is_unloaded() {
                continue;
            }

            let resident_mip = record.resident_mip();
            let floor = record.trim_floor_mip();
            if floor > resident_mip {
                let profit = record.sys_data_size(resident_mip as i32) - record.sys_data_size(floor as i32);
                if self.resources.stream_trim(handle, floor) {
                    kicked += profit as isize;
                }
            }
        }

        self.report.kicked_bytes += kicked as usize;
        kicked
    }
}

/// Apply a staged schedule and clear its lists
pub fn apply_schedule(
    resources: &mut TextureResources,
    schedule: &mut Schedule,
    params: &ApplyParams,
    engine: &mut dyn StreamEngine,
) -> ApplyReport {
    let _span = tracing::debug_span!("texstream.apply", frame = schedule.frame_id).entered();

    let aborted = abort_superseded(resources, &schedule.actions);

    let gc_limit = schedule.mem_state.mem_limit.max(0) as usize;
    let gc_freed_bytes = resources.pool.garbage_collect(gc_limit, params.gc_max_items);

    let mut report = if params.suppress {
        ApplyReport {
            trimmed_bytes: trim_to_persistent(resources),
            ..Default::default()
        }
    } else if schedule.requests.is_empty() {
        ApplyReport::default()
    } else {
        let mut issuer = RequestIssuer::new(resources, params, schedule);
        issuer.issue(engine, &schedule.requests, &mut schedule.trimmable);
        issuer.report
    };

    report.requests = schedule.requests.len();
    report.aborted = aborted;
    report.gc_freed_bytes = gc_freed_bytes;

    for handle in schedule.unlink.drain(..) {
        if resources.unlink(handle) {
            report.unlinked += 1;
        }
    }
    schedule.clear_lists();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::MemoryState;
    use crate::catalog::{TextureDesc, TextureFlags};
    use crate::engine::{ChannelStreamEngine, StreamInRequest};
    use crate::mip::TextureFormat;
    use crate::pool::TexturePool;
    use crossbeam::channel::Receiver;
    use texstream_core::memory::MemoryBudget;

    const KB: usize = 1024;
    const MB: usize = 1024 * 1024;

    struct Fixture {
        resources: TextureResources,
        engine: ChannelStreamEngine,
        receiver: Receiver<StreamInRequest>,
        params: ApplyParams,
    }

    impl Fixture {
        fn new(pool_mb: usize, tasks: usize) -> Self {
            let budget = MemoryBudget::from_megabytes(pool_mb, 0);
            let (engine, receiver) = ChannelStreamEngine::new();
            let mut params = ApplyParams::from_config(&StreamingConfig::default());
            params.max_requested_bytes = 64 * MB;
            Self {
                resources: TextureResources::new(TexturePool::new(budget), tasks),
                engine,
                receiver,
                params,
            }
        }

        /// 512x512 RGBA8: mip 0 is 1MB streamed, mip 1 (256KB) persistent
        fn texture(&mut self, name: &str) -> TextureHandle {
            self.resources
                .register(TextureDesc::new(name, 512, 512, TextureFormat::Rgba8).with_mips(2, 1))
                .unwrap()
        }

        fn make_resident(&mut self, handle: TextureHandle) {
            let item = self.resources.pool.allocate(MB).unwrap();
            let start = StreamStart {
                start_mip: 0,
                end_mip: 0,
                activate_mip: 0,
                priority: StreamTaskPriority::Normal,
            };
            assert!(self.resources.start_streaming(handle, item, start, &mut self.engine));
            self.resources.complete_stream_in(handle, true).unwrap();
            self.receiver.try_recv().unwrap();
        }

        fn schedule(&self, requests: &[(TextureHandle, u8)]) -> Schedule {
            let budget = self.resources.pool.budget();
            Schedule {
                mem_state: MemoryState::compute(budget, &self.resources.pool, 0, 0),
                requests: requests
                    .iter()
                    .map(|&(texture, mip)| MipRequest { texture, mip })
                    .collect(),
                ..Default::default()
            }
        }

        fn apply(&mut self, schedule: &mut Schedule) -> ApplyReport {
            apply_schedule(&mut self.resources, schedule, &self.params, &mut self.engine)
        }

        fn issued(&self) -> Vec<StreamInRequest> {
            self.receiver.try_iter().collect()
        }
    }

    #[test]
    fn test_requests_start_streams() {
        let mut fx = Fixture::new(64, 8);
        let textures: Vec<_> = (0..3).map(|i| fx.texture(&format!("t{i}"))).collect();
        let mut schedule = fx.schedule(&textures.iter().map(|&t| (t, 0)).collect::<Vec<_>>());

        let report = fx.apply(&mut schedule);
        assert_eq!(report.requests, 3);
        assert_eq!(report.submitted, 3);
        assert_eq!(report.submitted_bytes, 3 * MB);

        let issued = fx.issued();
        assert_eq!(issued.len(), 3);
        assert!(issued.iter().all(|r| r.start_mip == 0 && r.end_mip == 0));
        assert_eq!(fx.resources.tasks().submitted_jobs(), 3);
        assert_eq!(fx.resources.pool().in_use_bytes(), 3 * MB);
        assert!(!schedule.has_work());
    }

    #[test]
    fn test_unloaded_request_reloads_persistent_mips() {
        let mut fx = Fixture::new(64, 8);
        let texture = fx.texture("t");
        fx.resources.unload(texture).unwrap();
        assert_eq!(fx.resources.pool.persistent_bytes(), 0);

        let mut schedule = fx.schedule(&[(texture, 0)]);
        let report = fx.apply(&mut schedule);

        assert_eq!(report.submitted, 0);
        assert!(fx.issued().is_empty());
        assert!(!fx.resources.catalog.get(texture).unwrap().is_unloaded());
        assert_eq!(fx.resources.pool.persistent_bytes(), 256 * 1024);
    }

    #[test]
    fn test_job_and_byte_budgets() {
        let mut fx = Fixture::new(64, 8);
        let textures: Vec<_> = (0..4).map(|i| fx.texture(&format!("t{i}"))).collect();
        let requests: Vec<_> = textures.iter().map(|&t| (t, 0)).collect();

        fx.params.max_requested_jobs = 2;
        let report = fx.apply(&mut fx.schedule(&requests));
        assert_eq!(report.submitted, 2);

        // Two jobs are in flight already; one more byte-limited slot
        fx.params.max_requested_jobs = 256;
        fx.params.max_requested_bytes = 2 * MB + 1;
        let report = fx.apply(&mut fx.schedule(&requests));
        assert_eq!(report.submitted, 1);
        assert_eq!(fx.resources.tasks().submitted_jobs(), 3);
    }

    #[test]
    fn test_flush_lifts_budgets() {
        let mut fx = Fixture::new(64, 8);
        let textures: Vec<_> = (0..4).map(|i| fx.texture(&format!("t{i}"))).collect();
        let requests: Vec<_> = textures.iter().map(|&t| (t, 0)).collect();

        fx.params.max_requested_jobs = 1;
        fx.params.flush = true;
        let report = fx.apply(&mut fx.schedule(&requests));
        assert!(report.flushed);
        assert_eq!(report.submitted, 4);
    }

    #[test]
    fn test_task_slots_limit_issuing() {
        let mut fx = Fixture::new(64, 1);
        let a = fx.texture("a");
        let b = fx.texture("b");
        let report = fx.apply(&mut fx.schedule(&[(a, 0), (b, 0)]));
        assert_eq!(report.submitted, 1);
        assert_eq!(fx.issued()[0].texture, a);
    }

    #[test]
    fn test_trim_makes_room() {
        // 3MB pool: 768KB persistent plus two resident textures
        let mut fx = Fixture::new(3, 8);
        let a = fx.texture("a");
        let b = fx.texture("b");
        let c = fx.texture("c");
        fx.make_resident(a);
        fx.make_resident(b);

        let mut schedule = fx.schedule(&[(c, 0)]);
        schedule.trimmable = vec![a];
        let report = fx.apply(&mut schedule);

        assert_eq!(report.trimmed_bytes, MB);
        assert_eq!(report.kicked_bytes, 0);
        assert_eq!(report.submitted, 0);
        assert_eq!(fx.resources.catalog().get(a).unwrap().resident_mip(), 1);
        assert_eq!(fx.resources.catalog().get(b).unwrap().resident_mip(), 0);
        assert_eq!(fx.resources.pool().free_bytes(), MB);

        // The next cycle finds the room
        let report = fx.apply(&mut fx.schedule(&[(c, 0)]));
        assert_eq!(report.submitted, 1);
    }

    #[test]
    fn test_kick_walks_back_to_balance_point() {
        let mut fx = Fixture::new(3, 8);
        let a = fx.texture("a");
        let b = fx.texture("b");
        let c = fx.texture("c");
        fx.make_resident(a);
        fx.make_resident(b);

        let mut schedule = fx.schedule(&[(c, 0)]);
        schedule.partition.balance_point = 1;
        let report = fx.apply(&mut schedule);

        assert_eq!(report.kicked_bytes, MB);
        assert_eq!(fx.resources.catalog().get(a).unwrap().resident_mip(), 0);
        assert_eq!(fx.resources.catalog().get(b).unwrap().resident_mip(), 1);

        // Nothing past the balance point is left to kick
        fx.make_resident(b);
        let mut schedule = fx.schedule(&[(c, 0)]);
        schedule.partition.balance_point = 3;
        let report = fx.apply(&mut schedule);
        assert_eq!(report.kicked_bytes, 0);
        assert_eq!(report.submitted, 0);
    }

    #[test]
    fn test_allocation_failure_stops_issuing() {
        let mut fx = Fixture::new(2, 8);
        let a = fx.texture("a");
        let b = fx.texture("b");
        let c = fx.texture("c");
        fx.make_resident(a);

        // A stale estimate claims room the pool does not have
        let mut schedule = fx.schedule(&[(b, 0), (c, 0)]);
        schedule.mem_state.mem_free_lower = 64 * MB as isize;
        schedule.mem_state.mem_free_upper = 64 * MB as isize;
        let report = fx.apply(&mut schedule);

        assert_eq!(report.alloc_fails, 1);
        assert_eq!(report.submitted, 0);
        assert!(fx.issued().is_empty());
    }

    #[test]
    fn test_abort_actions() {
        let mut fx = Fixture::new(64, 8);
        let a = fx.texture("a");
        let idle = fx.texture("idle");
        fx.apply(&mut fx.schedule(&[(a, 0)]));
        let request = fx.issued().pop().unwrap();

        let mut schedule = fx.schedule(&[]);
        schedule.actions = vec![
            PlanningAction::Abort { texture: a, want_mip: 1 },
            PlanningAction::Abort { texture: idle, want_mip: 1 },
        ];
        let report = fx.apply(&mut schedule);
        assert_eq!(report.aborted, 1);
        assert!(request.is_aborted());
    }

    #[test]
    fn test_prestream_skips_top_mip() {
        let mut fx = Fixture::new(64, 8);
        let t = fx
            .resources
            .register(TextureDesc::new("t", 512, 512, TextureFormat::Rgba8).with_mips(3, 1))
            .unwrap();
        fx.params.prestream = true;
        let report = fx.apply(&mut fx.schedule(&[(t, 0)]));
        assert_eq!(report.submitted, 1);
        let issued = fx.issued();
        assert_eq!((issued[0].start_mip, issued[0].end_mip), (1, 1));
    }

    #[test]
    fn test_postpone_large_top_mips() {
        // 1024x1024 RGBA8: mip 0 is 4MB, mip 2 persistent
        let desc = || TextureDesc::new("t", 1024, 1024, TextureFormat::Rgba8).with_mips(3, 1);

        let mut fx = Fixture::new(64, 8);
        let t = fx.resources.register(desc()).unwrap();
        fx.params.streaming_from_hdd = false;
        fx.params.postpone_threshold_bytes = 1024 * KB;
        fx.apply(&mut fx.schedule(&[(t, 0)]));
        assert_eq!(fx.issued()[0].start_mip, 1);

        // From HDD only the mip threshold applies
        let mut fx = Fixture::new(64, 8);
        let t = fx.resources.register(desc()).unwrap();
        fx.resources.catalog_mut().get_mut(t).unwrap().fp_min_mip_cur = 0;
        fx.apply(&mut fx.schedule(&[(t, 0)]));
        assert_eq!(fx.issued()[0].start_mip, 0);
    }

    #[test]
    fn test_stream_priority_and_activation() {
        let desc = |name: &str| TextureDesc::new(name, 512, 512, TextureFormat::Rgba8).with_mips(3, 1);
        let mut fx = Fixture::new(64, 8);
        let caching = fx.resources.register(desc("caching")).unwrap();
        let needed = fx.resources.register(desc("needed")).unwrap();
        let split = fx.resources.register(desc("split")).unwrap();
        let urgent = fx
            .resources
            .register(desc("urgent").with_flags(TextureFlags::STREAM_HIGH_PRIORITY))
            .unwrap();
        {
            let catalog = fx.resources.catalog_mut();
            catalog.get_mut(needed).unwrap().fp_min_mip_cur = 0;
            catalog.get_mut(split).unwrap().fp_min_mip_cur = 256;
            catalog.get_mut(urgent).unwrap().fp_min_mip_cur = 0;
        }

        fx.apply(&mut fx.schedule(&[(caching, 0), (needed, 0), (split, 0), (urgent, 0)]));
        let issued = fx.issued();
        let find = |t: TextureHandle| issued.iter().find(|r| r.texture == t).unwrap();

        // Only wanted for caching: lowered
        assert_eq!(find(caching).priority, StreamTaskPriority::BelowNormal);
        assert_eq!(find(caching).activate_mip, 2);
        assert_eq!(find(needed).priority, StreamTaskPriority::Normal);
        assert_eq!(find(needed).activate_mip, 0);
        // Working-set mips load first
        assert_eq!((find(split).start_mip, find(split).activate_mip), (1, 1));
        assert_eq!(find(urgent).priority, StreamTaskPriority::AboveNormal);
    }

    #[test]
    fn test_suppress_trims_to_persistent() {
        let mut fx = Fixture::new(64, 8);
        let a = fx.texture("a");
        let b = fx.texture("b");
        fx.make_resident(a);

        fx.params.suppress = true;
        let report = fx.apply(&mut fx.schedule(&[(b, 0)]));
        assert_eq!(report.trimmed_bytes, MB);
        assert_eq!(report.submitted, 0);
        assert_eq!(fx.resources.catalog().get(a).unwrap().resident_mip(), 1);
        assert!(fx.issued().is_empty());
    }

    #[test]
    fn test_unlink_and_gc() {
        let mut fx = Fixture::new(64, 8);
        let a = fx.texture("a");
        let b = fx.texture("b");
        let items: Vec<_> = (0..3).map(|_| fx.resources.pool.allocate(MB).unwrap()).collect();
        for item in items {
            fx.resources.pool.release_item(item);
        }
        assert_eq!(fx.resources.pool().free_items(), 3);

        let mut schedule = fx.schedule(&[]);
        schedule.unlink = vec![b];
        schedule.mem_state.mem_limit = 0;
        let report = fx.apply(&mut schedule);

        assert_eq!(report.unlinked, 1);
        assert_eq!(fx.resources.working_set(), &[a]);
        // Normal cap: two cached items per apply
        assert_eq!(report.gc_freed_bytes, 2 * MB);
        assert_eq!(fx.resources.pool().free_items(), 1);
    }
}
