//! Streaming Resources
//!
//! Everything guarded by the texture access lock: the catalog, the pool,
//! the stream-task table and the streamer's working set. The mutations
//! that touch more than one of them (registration, trimming, stream start
//! and completion) live here so the pool totals always match the resident
//! state of the catalog.

use ahash::AHashSet;

use crate::catalog::{TextureCatalog, TextureDesc, TextureFlags, TextureHandle, TextureRecord};
use crate::engine::{StreamEngine, StreamInRequest};
use crate::pool::{PoolItem, StreamInTask, StreamTaskPriority, StreamTaskTable, TexturePool};
use crate::{StreamError, StreamResult};

/// How a stream-in ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCompletion {
    /// New mips are resident
    Completed { resident_mip: u8 },
    /// Aborted or failed; reserved memory went back to the pool cache
    Cancelled,
}

/// Range and priority for [`TextureResources::start_streaming`]
#[derive(Debug, Clone, Copy)]
pub struct StreamStart {
    pub start_mip: u8,
    pub end_mip: u8,
    pub activate_mip: u8,
    pub priority: StreamTaskPriority,
}

pub struct TextureResources {
    pub(crate) catalog: TextureCatalog,
    pub(crate) pool: TexturePool,
    pub(crate) tasks: StreamTaskTable,
    /// Streamer working set, in the order of the last committed cycle
    pub(crate) working: Vec<TextureHandle>,
}

impl TextureResources {
    pub fn new(pool: TexturePool, max_stream_tasks: usize) -> Self {
        Self {
            catalog: TextureCatalog::new(),
            pool,
            tasks: StreamTaskTable::new(max_stream_tasks),
            working: Vec::new(),
        }
    }

    pub fn catalog(&self) -> &TextureCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut TextureCatalog {
        &mut self.catalog
    }

    pub fn pool(&self) -> &TexturePool {
        &self.pool
    }

    pub fn tasks(&self) -> &StreamTaskTable {
        &self.tasks
    }

    /// Textures the streamer currently plans for
    pub fn working_set(&self) -> &[TextureHandle] {
        &self.working
    }

    pub(crate) fn register(&mut self, desc: TextureDesc) -> StreamResult<TextureHandle> {
        let handle = self.catalog.insert(desc)?;
        if let Some(record) = self.catalog.get(handle) {
            if !record.is_unloaded() {
                let bytes = record.persistent_size();
                self.pool.bind_persistent(bytes);
            }
        }
        self.link(handle);
        Ok(handle)
    }

    /// Drop a texture, cancelling its stream and returning its memory
    pub(crate) fn remove(&mut self, handle: TextureHandle) -> Option<TextureRecord> {
        let record = self.catalog.remove(handle)?;

        if let Some(task) = record.stream_task.and_then(|id| self.tasks.remove(id)) {
            task.abort();
            self.pool.release(task.bytes);
        }
        self.pool.release(record.streamed_size());
        if !record.is_unloaded() {
            self.pool.unbind_persistent(record.persistent_size());
        }
        if record.linked {
            self.working.retain(|&h| h != handle);
        }
        Some(record)
    }

    /// Add a streamed texture to the working set
    pub(crate) fn link(&mut self, handle: TextureHandle) -> bool {
        match self.catalog.get_mut(handle) {
            Some(record) if record.is_streamed() && !record.linked => {
                record.linked = true;
                self.working.push(handle);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn unlink(&mut self, handle: TextureHandle) -> bool {
        match self.catalog.get_mut(handle) {
            Some(record) if record.linked => {
                record.linked = false;
                self.working.retain(|&h| h != handle);
                true
            }
            _ => false,
        }
    }

    /// Replace the working set with a cycle's key order
    ///
    /// Entries destroyed or unlinked since the snapshot are dropped; textures
    /// linked during the cycle keep their place at the end.
    pub(crate) fn commit_order(&mut self, order: &[TextureHandle]) {
        let known: AHashSet<TextureHandle> = order.iter().copied().collect();
        let catalog = &self.catalog;
        let mut committed: Vec<TextureHandle> = order
            .iter()
            .copied()
            .filter(|&h| catalog.get(h).is_some_and(|record| record.linked))
            .collect();
        committed.extend(self.working.iter().copied().filter(|h| !known.contains(h)));
        self.working = committed;
    }

    /// Reduce the resident chain to `mip`
    ///
    /// Fails while a stream is in flight, for unloaded textures, and when
    /// `mip` is not coarser than what is resident.
    pub fn stream_trim(&mut self, handle: TextureHandle, mip: u8) -> bool {
        let Some(record) = self.catalog.get_mut(handle) else {
            return false;
        };
        let mip = mip.min(record.persistent_mip());
        if record.is_streaming() || record.is_unloaded() || mip <= record.resident_mip {
            return false;
        }

        let freed = record.sys_data_size(record.resident_mip as i32) - record.sys_data_size(mip as i32);
        record.resident_mip = mip;
        self.pool.release(freed);
        true
    }

    /// Bring the persistent mips of an unloaded texture back
    pub fn load_persistent(&mut self, handle: TextureHandle) -> StreamResult<bool> {
        let record = self.catalog.record_mut(handle)?;
        if !record.is_unloaded() {
            return Ok(false);
        }
        record.flags.remove(TextureFlags::UNLOADED);
        record.resident_mip = record.persistent_mip();
        let bytes = record.persistent_size();
        self.pool.bind_persistent(bytes);
        Ok(true)
    }

    /// Release every mip of a texture, persistent ones included
    pub fn unload(&mut self, handle: TextureHandle) -> StreamResult<bool> {
        let record = self.catalog.record_mut(handle)?;
        if record.is_unloaded() || record.is_streaming() {
            return Ok(false);
        }
        let streamed = record.streamed_size();
        let persistent = record.persistent_size();
        record.flags.insert(TextureFlags::UNLOADED);
        record.resident_mip = record.persistent_mip();
        self.pool.release(streamed);
        self.pool.unbind_persistent(persistent);
        Ok(true)
    }

    /// Create a stream task for `handle` and submit it to the engine
    ///
    /// The pool item is returned to the pool when no task slot is free or
    /// the engine rejects the request.
    pub(crate) fn start_streaming(
        &mut self,
        handle: TextureHandle,
        item: PoolItem,
        start: StreamStart,
        engine: &mut dyn StreamEngine,
    ) -> bool {
        if self.catalog.get(handle).is_none_or(|record| record.is_streaming()) {
            self.pool.release_item(item);
            return false;
        }

        let task = StreamInTask::new(
            handle,
            start.start_mip,
            start.end_mip,
            start.activate_mip,
            start.priority,
            item.size(),
        );
        let request = StreamInRequest::new(
            handle,
            start.start_mip,
            start.end_mip,
            start.activate_mip,
            start.priority,
            item.size(),
            task.abort_flag(),
        );

        let Some(task_id) = self.tasks.insert(task) else {
            self.pool.release_item(item);
            return false;
        };

        if !engine.submit(request) {
            self.tasks.remove(task_id);
            self.pool.release_item(item);
            return false;
        }

        if let Some(record) = self.catalog.get_mut(handle) {
            record.stream_task = Some(task_id);
        }
        true
    }

    /// Record that mips down to `mip` have been uploaded
    pub fn report_uploaded(&mut self, handle: TextureHandle, mip: u8) -> StreamResult<()> {
        let record = self.catalog.record(handle)?;
        let task_id = record.stream_task.ok_or(StreamError::NoStreamInFlight(handle))?;
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or(StreamError::NoStreamInFlight(handle))?;
        task.lower_uploaded_mip = task.lower_uploaded_mip.min(mip.max(task.start_mip));
        Ok(())
    }

    /// Finish the stream of `handle`
    ///
    /// Aborted or failed streams leave the resident mip unchanged.
    pub fn complete_stream_in(
        &mut self,
        handle: TextureHandle,
        succeeded: bool,
    ) -> StreamResult<StreamCompletion> {
        let record = self.catalog.record_mut(handle)?;
        let task_id = record.stream_task.take().ok_or(StreamError::NoStreamInFlight(handle))?;
        let task = self
            .tasks
            .remove(task_id)
            .ok_or(StreamError::NoStreamInFlight(handle))?;

        if succeeded && !task.is_aborted() {
            record.resident_mip = task.start_mip.min(record.resident_mip);
            Ok(StreamCompletion::Completed {
                resident_mip: record.resident_mip,
            })
        } else {
            self.pool.release(task.bytes);
            Ok(StreamCompletion::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ChannelStreamEngine;
    use crate::mip::TextureFormat;
    use texstream_core::memory::MemoryBudget;

    const MB: usize = 1024 * 1024;

    fn resources(mb: usize) -> TextureResources {
        TextureResources::new(TexturePool::new(MemoryBudget::from_megabytes(mb, 5)), 8)
    }

    fn desc(name: &str) -> TextureDesc {
        // 512x512 RGBA8, mip 0 is 1MB, mip 1 (256KB) is persistent
        TextureDesc::new(name, 512, 512, TextureFormat::Rgba8).with_mips(2, 1)
    }

    fn start(mip: u8, end: u8) -> StreamStart {
        StreamStart {
            start_mip: mip,
            end_mip: end,
            activate_mip: end,
            priority: StreamTaskPriority::Normal,
        }
    }

    #[test]
    fn test_register_binds_persistent() {
        let mut res = resources(16);
        let handle = res.register(desc("a")).unwrap();
        assert_eq!(res.pool().persistent_bytes(), 256 * 1024);
        assert_eq!(res.working_set(), &[handle]);

        res.remove(handle).unwrap();
        assert_eq!(res.pool().persistent_bytes(), 0);
        assert!(res.working_set().is_empty());
    }

    #[test]
    fn test_stream_and_complete() {
        let mut res = resources(16);
        let (mut engine, receiver) = ChannelStreamEngine::new();
        let handle = res.register(desc("a")).unwrap();

        let item = res.pool.allocate(MB).unwrap();
        assert!(res.start_streaming(handle, item, start(0, 0), &mut engine));
        assert!(res.catalog().get(handle).unwrap().is_streaming());
        assert_eq!(receiver.try_recv().unwrap().start_mip, 0);
        assert_eq!(res.tasks().submitted_bytes(), MB);

        // Trims are refused while streaming
        assert!(!res.stream_trim(handle, 1));

        let done = res.complete_stream_in(handle, true).unwrap();
        assert_eq!(done, StreamCompletion::Completed { resident_mip: 0 });
        assert_eq!(res.pool().in_use_bytes(), MB);
        assert_eq!(res.catalog().get(handle).unwrap().streamed_size(), MB);
        assert_eq!(res.tasks().submitted_jobs(), 0);
    }

    #[test]
    fn test_aborted_stream_returns_memory() {
        let mut res = resources(16);
        let (mut engine, _receiver) = ChannelStreamEngine::new();
        let handle = res.register(desc("a")).unwrap();

        let item = res.pool.allocate(MB).unwrap();
        assert!(res.start_streaming(handle, item, start(0, 0), &mut engine));
        let task_id = res.catalog().get(handle).unwrap().stream_task().unwrap();
        res.tasks().get(task_id).unwrap().abort();

        assert_eq!(
            res.complete_stream_in(handle, true).unwrap(),
            StreamCompletion::Cancelled
        );
        assert_eq!(res.catalog().get(handle).unwrap().resident_mip(), 1);
        assert_eq!(res.pool().in_use_bytes(), 0);
        assert_eq!(res.pool().free_bytes(), MB);
    }

    #[test]
    fn test_rejected_submission_releases_item() {
        let mut res = resources(16);
        let (mut engine, receiver) = ChannelStreamEngine::new();
        drop(receiver);
        let handle = res.register(desc("a")).unwrap();

        let item = res.pool.allocate(MB).unwrap();
        assert!(!res.start_streaming(handle, item, start(0, 0), &mut engine));
        assert!(!res.catalog().get(handle).unwrap().is_streaming());
        assert_eq!(res.pool().in_use_bytes(), 0);
        assert_eq!(res.tasks().submitted_jobs(), 0);
    }

    #[test]
    fn test_trim_releases_streamed_bytes() {
        let mut res = resources(16);
        let (mut engine, _receiver) = ChannelStreamEngine::new();
        let handle = res.register(desc("a")).unwrap();
        let item = res.pool.allocate(MB).unwrap();
        assert!(res.start_streaming(handle, item, start(0, 0), &mut engine));
        res.complete_stream_in(handle, true).unwrap();

        assert!(!res.stream_trim(handle, 0));
        assert!(res.stream_trim(handle, 1));
        assert_eq!(res.catalog().get(handle).unwrap().resident_mip(), 1);
        assert_eq!(res.pool().in_use_bytes(), 0);
    }

    #[test]
    fn test_report_uploaded_tracks_progress() {
        let mut res = resources(16);
        let (mut engine, _receiver) = ChannelStreamEngine::new();
        let handle = res
            .register(TextureDesc::new("b", 1024, 1024, TextureFormat::Rgba8).with_mips(4, 1))
            .unwrap();
        let bytes = {
            let record = res.catalog().get(handle).unwrap();
            record.sys_data_size(0) - record.sys_data_size(3)
        };
        let item = res.pool.allocate(bytes).unwrap();
        assert!(res.start_streaming(handle, item, start(0, 2), &mut engine));

        res.report_uploaded(handle, 1).unwrap();
        let task_id = res.catalog().get(handle).unwrap().stream_task().unwrap();
        assert_eq!(res.tasks().get(task_id).unwrap().lower_uploaded_mip, 1);

        let idle = res.register(desc("idle")).unwrap();
        assert!(matches!(
            res.report_uploaded(idle, 0),
            Err(StreamError::NoStreamInFlight(_))
        ));
    }

    #[test]
    fn test_unload_and_reload() {
        let mut res = resources(16);
        let handle = res.register(desc("a")).unwrap();
        assert!(res.unload(handle).unwrap());
        assert!(res.catalog().get(handle).unwrap().is_unloaded());
        assert_eq!(res.pool().persistent_bytes(), 0);

        assert!(res.load_persistent(handle).unwrap());
        assert_eq!(res.pool().persistent_bytes(), 256 * 1024);
        assert!(!res.load_persistent(handle).unwrap());
    }

    #[test]
    fn test_commit_order_filters_and_appends() {
        let mut res = resources(16);
        let a = res.register(desc("a")).unwrap();
        let b = res.register(desc("b")).unwrap();
        let c = res.register(desc("c")).unwrap();

        let snapshot_order = vec![c, b, a];
        // During the cycle: b is destroyed and d is linked
        res.remove(b);
        let d = res.register(desc("d")).unwrap();

        res.commit_order(&snapshot_order);
        assert_eq!(res.working_set(), &[c, a, d]);
    }
}
