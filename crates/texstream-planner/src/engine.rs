//! Disk Stream Engine Boundary
//!
//! The streamer never reads files itself. Stream-in requests are handed to a
//! [`StreamEngine`]; the engine reports progress and completion back through
//! [`crate::PlanningStreamer::report_uploaded`] and
//! [`crate::PlanningStreamer::complete_stream_in`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{self, Receiver, Sender};

use crate::catalog::TextureHandle;
use crate::pool::StreamTaskPriority;

/// A mip range to read from disk and upload
#[derive(Debug, Clone)]
pub struct StreamInRequest {
    pub texture: TextureHandle,
    /// Finest mip to load
    pub start_mip: u8,
    /// Coarsest mip to load
    pub end_mip: u8,
    /// Mip the texture may switch to once loaded
    pub activate_mip: u8,
    pub priority: StreamTaskPriority,
    pub bytes: usize,
    abort: Arc<AtomicBool>,
}

impl StreamInRequest {
    pub(crate) fn new(
        texture: TextureHandle,
        start_mip: u8,
        end_mip: u8,
        activate_mip: u8,
        priority: StreamTaskPriority,
        bytes: usize,
        abort: Arc<AtomicBool>,
    ) -> Self {
        Self {
            texture,
            start_mip,
            end_mip,
            activate_mip,
            priority,
            bytes,
            abort,
        }
    }

    /// Set once the planner no longer wants this data; the engine should
    /// finish early and report the stream as not completed
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// Asynchronous file reader the streamer submits to
pub trait StreamEngine: Send {
    /// Called before a batch of submissions
    fn begin_read_group(&mut self) {}

    /// Called after a batch of submissions
    fn end_read_group(&mut self) {}

    /// Queue a read; returning `false` rejects it and leaves the texture idle
    fn submit(&mut self, request: StreamInRequest) -> bool;
}

/// Engine that forwards every request over a channel
///
/// Whoever owns the receiver performs the reads and reports completion.
pub struct ChannelStreamEngine {
    sender: Sender<StreamInRequest>,
}

impl ChannelStreamEngine {
    pub fn new() -> (Self, Receiver<StreamInRequest>) {
        let (sender, receiver) = channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl StreamEngine for ChannelStreamEngine {
    fn submit(&mut self, request: StreamInRequest) -> bool {
        self.sender.send(request).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{TextureCatalog, TextureDesc};
    use crate::mip::TextureFormat;

    #[test]
    fn test_channel_engine_forwards_requests() {
        let mut catalog = TextureCatalog::new();
        let texture = catalog
            .insert(TextureDesc::new("t", 128, 128, TextureFormat::Rgba8))
            .unwrap();
        let (mut engine, receiver) = ChannelStreamEngine::new();
        let abort = Arc::new(AtomicBool::new(false));

        assert!(engine.submit(StreamInRequest::new(
            texture,
            0,
            1,
            1,
            StreamTaskPriority::Normal,
            4096,
            abort.clone(),
        )));

        let request = receiver.try_recv().unwrap();
        assert_eq!(request.texture, texture);
        assert_eq!(request.bytes, 4096);
        assert!(!request.is_aborted());
        abort.store(true, Ordering::Release);
        assert!(request.is_aborted());
    }

    #[test]
    fn test_channel_engine_rejects_after_disconnect() {
        let mut catalog = TextureCatalog::new();
        let texture = catalog
            .insert(TextureDesc::new("t", 128, 128, TextureFormat::Rgba8))
            .unwrap();
        let (mut engine, receiver) = ChannelStreamEngine::new();
        drop(receiver);

        assert!(!engine.submit(StreamInRequest::new(
            texture,
            0,
            0,
            0,
            StreamTaskPriority::Idle,
            1,
            Arc::new(AtomicBool::new(false)),
        )));
    }
}
