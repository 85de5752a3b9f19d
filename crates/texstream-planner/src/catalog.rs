//! Texture Catalog
//!
//! Dense table of streamable textures addressed by generational handles.
//! Each record carries the static description of a texture (size, format,
//! mip chain, persistent mips) and the dynamic state the streamer reads
//! and writes: resident mip, desired mip, visibility frame, per-zone
//! visibility history, and the in-flight stream task.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use texstream_core::memory::{SlotId, SlotPool};

use crate::mip::{FP_MIN_DESIRED, MAX_MIPS, MipSizes, TextureFormat, clamp_mip, mip_to_fp};
use crate::pool::StreamTaskId;
use crate::{MAX_PREDICTION_ZONES, StreamError, StreamResult};

bitflags! {
    /// Static and runtime texture flags relevant to streaming
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureFlags: u8 {
        /// Texture participates in mip streaming
        const STREAMED = 1 << 0;
        /// Texture is always kept at full resolution
        const FORCE_STREAM_HIGH_RES = 1 << 1;
        /// Texture was reported with high priority
        const STREAM_HIGH_PRIORITY = 1 << 2;
        /// Persistent mips are not resident
        const UNLOADED = 1 << 3;
    }
}

/// Round id of a zone that has never received a report
pub const ROUND_NEVER: i32 = i32::MIN / 2;

/// Mip factor of a zone that has not been reported this round
pub const UNSET_MIP_FACTOR: f32 = 1_000_000.0;

/// Stable reference to a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct TextureHandle(SlotId);

impl TextureHandle {
    /// Position in the catalog table; used as the final ordering tie-break
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

impl fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tex#{}", self.0)
    }
}

/// Per-zone visibility accumulation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneInfo {
    pub min_mip_factor: f32,
    pub last_min_mip_factor: f32,
}

impl Default for ZoneInfo {
    fn default() -> Self {
        Self {
            min_mip_factor: UNSET_MIP_FACTOR,
            last_min_mip_factor: UNSET_MIP_FACTOR,
        }
    }
}

/// Per-zone round bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundInfo {
    pub round_update_id: i32,
    pub high_priority: bool,
    pub last_high_priority: bool,
}

impl Default for RoundInfo {
    fn default() -> Self {
        Self {
            round_update_id: ROUND_NEVER,
            high_priority: false,
            last_high_priority: false,
        }
    }
}

/// Description of a texture being registered
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub mips: u8,
    pub persistent_mips: u8,
    pub slices: u16,
    pub flags: TextureFlags,
    /// Disk stream priority, 0..=7 (higher loads first)
    pub stream_priority: u8,
    /// Explicit per-level sizes (all slices), overriding the format math
    pub level_sizes: Option<Vec<usize>>,
}

impl TextureDesc {
    /// Streamed texture with a full mip chain
    ///
    /// Mips whose larger side is 64 pixels or less are persistent.
    pub fn new(name: impl Into<String>, width: u32, height: u32, format: TextureFormat) -> Self {
        let max_dim = width.max(height).max(1);
        let mips = ((32 - max_dim.leading_zeros()) as u8).min(MAX_MIPS);
        let persistent_mips = (0..mips)
            .filter(|&mip| max_dim.checked_shr(mip as u32).unwrap_or(0) <= 64)
            .count()
            .max(1) as u8;

        Self {
            name: name.into(),
            width,
            height,
            format,
            mips,
            persistent_mips,
            slices: 1,
            flags: TextureFlags::STREAMED,
            stream_priority: 0,
            level_sizes: None,
        }
    }

    pub fn with_mips(mut self, mips: u8, persistent_mips: u8) -> Self {
        self.mips = mips;
        self.persistent_mips = persistent_mips;
        self
    }

    pub fn with_slices(mut self, slices: u16) -> Self {
        self.slices = slices;
        self
    }

    pub fn with_flags(mut self, flags: TextureFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_stream_priority(mut self, priority: u8) -> Self {
        self.stream_priority = priority;
        self
    }

    pub fn with_level_sizes(mut self, sizes: Vec<usize>) -> Self {
        self.level_sizes = Some(sizes);
        self
    }

    /// Reject descriptions the streamer cannot represent
    pub fn validate(&self) -> StreamResult<()> {
        let fail = |reason: String| Err(StreamError::InvalidTexture(format!("{}: {}", self.name, reason)));

        if self.width == 0 || self.height == 0 {
            return fail("zero-sized texture".into());
        }
        if self.mips == 0 || self.mips > MAX_MIPS {
            return fail(format!("mip count {} outside 1..={}", self.mips, MAX_MIPS));
        }
        if self.persistent_mips > self.mips {
            return fail(format!(
                "{} persistent mips exceed {} total",
                self.persistent_mips, self.mips
            ));
        }
        if self.slices == 0 {
            return fail("zero slices".into());
        }
        if self.stream_priority > 7 {
            return fail(format!("stream priority {} above 7", self.stream_priority));
        }
        if let Some(levels) = &self.level_sizes {
            if levels.len() != self.mips as usize {
                return fail(format!(
                    "{} level sizes for {} mips",
                    levels.len(),
                    self.mips
                ));
            }
        }
        Ok(())
    }
}

/// Streaming state of one catalog entry
#[derive(Debug, Clone)]
pub struct TextureRecord {
    pub name: Arc<str>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub mips: u8,
    pub persistent_mips: u8,
    pub slices: u16,
    pub flags: TextureFlags,
    pub stream_priority: u8,
    /// Desired mip, fixed point; negative values ask for more than mip 0
    pub fp_min_mip_cur: i16,
    /// Last frame the texture was drawn
    pub access_frame_id: i32,
    pub zones: [ZoneInfo; MAX_PREDICTION_ZONES],
    pub rounds: [RoundInfo; MAX_PREDICTION_ZONES],
    sizes: MipSizes,
    pub(crate) resident_mip: u8,
    pub(crate) stream_task: Option<StreamTaskId>,
    pub(crate) linked: bool,
}

impl TextureRecord {
    fn from_desc(desc: TextureDesc) -> Self {
        let sizes = match &desc.level_sizes {
            Some(levels) => MipSizes::from_level_sizes(levels),
            None => MipSizes::from_format(desc.format, desc.width, desc.height, desc.mips, desc.slices),
        };
        let persistent_mip = desc.mips - desc.persistent_mips;

        Self {
            name: Arc::from(desc.name),
            width: desc.width,
            height: desc.height,
            format: desc.format,
            mips: desc.mips,
            persistent_mips: desc.persistent_mips,
            slices: desc.slices,
            flags: desc.flags,
            stream_priority: desc.stream_priority,
            fp_min_mip_cur: mip_to_fp(persistent_mip as i32) as i16,
            access_frame_id: i32::MIN / 2,
            zones: Default::default(),
            rounds: Default::default(),
            sizes,
            resident_mip: persistent_mip,
            stream_task: None,
            linked: false,
        }
    }

    pub fn is_streamed(&self) -> bool {
        self.flags.contains(TextureFlags::STREAMED)
    }

    pub fn is_force_stream_high_res(&self) -> bool {
        self.flags.contains(TextureFlags::FORCE_STREAM_HIGH_RES)
    }

    pub fn is_high_priority(&self) -> bool {
        self.flags.contains(TextureFlags::STREAM_HIGH_PRIORITY)
    }

    pub fn is_unloaded(&self) -> bool {
        self.flags.contains(TextureFlags::UNLOADED)
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_task.is_some()
    }

    pub fn stream_task(&self) -> Option<StreamTaskId> {
        self.stream_task
    }

    /// Whether the texture is part of the streamer's working set
    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Finest mip currently uploaded
    pub fn resident_mip(&self) -> u8 {
        self.resident_mip
    }

    /// Coarsest mip that is always resident
    pub fn persistent_mip(&self) -> u8 {
        self.mips - self.persistent_mips
    }

    /// Floor the trimmer and kicker may reduce this texture to
    pub fn trim_floor_mip(&self) -> u8 {
        if self.is_force_stream_high_res() {
            0
        } else {
            self.persistent_mip()
        }
    }

    /// Desired mip as a whole level, never finer than mip 0
    pub fn required_mip(&self) -> u8 {
        let mip = (self.fp_min_mip_cur.max(0) as i32) >> crate::mip::FP_SHIFT;
        mip.min(self.mips as i32 - 1) as u8
    }

    pub fn sizes(&self) -> &MipSizes {
        &self.sizes
    }

    /// Bytes of mips `mip..` across all slices
    pub fn sys_data_size(&self, mip: i32) -> usize {
        self.sizes.size_from(mip)
    }

    pub fn persistent_size(&self) -> usize {
        self.sizes.size_from(self.persistent_mip() as i32)
    }

    /// Resident bytes above the persistent mips
    pub fn streamed_size(&self) -> usize {
        if self.is_unloaded() {
            return 0;
        }
        self.sys_data_size(self.resident_mip as i32)
            .saturating_sub(self.persistent_size())
    }

    /// Convert a visibility mip factor into a fixed-point desired mip
    ///
    /// A factor of `1 / (width * height)` maps to mip 0. Non-positive factors
    /// request the finest representable level.
    pub fn desired_mip_fp(&self, mip_factor: f32, global_mip_bias: f32) -> i16 {
        let hi = mip_to_fp(self.mips as i32 - 1);
        if mip_factor.is_nan() || mip_factor <= 0.0 {
            return FP_MIN_DESIRED as i16;
        }

        let texels = self.width as f32 * self.height as f32;
        let mip = 0.5 * (mip_factor * texels).log2() + global_mip_bias;
        let fp = (mip * crate::mip::FP_ONE as f32).round() as i32;
        clamp_mip(fp, FP_MIN_DESIRED, hi) as i16
    }
}

/// Dense table of texture records
#[derive(Default)]
pub struct TextureCatalog {
    textures: SlotPool<TextureRecord>,
}

impl TextureCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, desc: TextureDesc) -> StreamResult<TextureHandle> {
        desc.validate()?;
        self.textures
            .insert(TextureRecord::from_desc(desc))
            .map(TextureHandle)
            .ok_or(StreamError::CatalogFull)
    }

    pub(crate) fn remove(&mut self, handle: TextureHandle) -> Option<TextureRecord> {
        self.textures.remove(handle.0)
    }

    pub fn get(&self, handle: TextureHandle) -> Option<&TextureRecord> {
        self.textures.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: TextureHandle) -> Option<&mut TextureRecord> {
        self.textures.get_mut(handle.0)
    }

    pub fn record(&self, handle: TextureHandle) -> StreamResult<&TextureRecord> {
        self.get(handle).ok_or(StreamError::TextureNotFound(handle))
    }

    pub fn record_mut(&mut self, handle: TextureHandle) -> StreamResult<&mut TextureRecord> {
        self.get_mut(handle).ok_or(StreamError::TextureNotFound(handle))
    }

    pub fn contains(&self, handle: TextureHandle) -> bool {
        self.textures.contains(handle.0)
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TextureHandle, &TextureRecord)> {
        self.textures.iter().map(|(id, record)| (TextureHandle(id), record))
    }

    /// Mark a texture as drawn in `frame_id`
    pub fn touch(&mut self, handle: TextureHandle, frame_id: i32) -> StreamResult<()> {
        let record = self.record_mut(handle)?;
        record.access_frame_id = record.access_frame_id.max(frame_id);
        Ok(())
    }
}
