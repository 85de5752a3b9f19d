//! Mip Chain Math
//!
//! Fixed-point mip values (8 fractional bits) and per-format level sizes.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Fractional bits of a fixed-point mip value
pub const FP_SHIFT: u32 = 8;
/// One whole mip level in fixed point
pub const FP_ONE: i32 = 1 << FP_SHIFT;
/// Deepest supported mip chain; order keys pack mip counts into 4 bits
pub const MAX_MIPS: u8 = 15;
/// Lowest desired mip a visibility report can produce
pub const FP_MIN_DESIRED: i32 = -((MAX_MIPS as i32) << FP_SHIFT);

/// Whole mip level of a fixed-point value, rounding toward negative infinity
pub fn fp_to_mip(fp: i32) -> i32 {
    fp >> FP_SHIFT
}

pub fn mip_to_fp(mip: i32) -> i32 {
    mip << FP_SHIFT
}

/// Clamp `value` into `[lo, hi]`; when the bounds cross, `hi` wins
pub fn clamp_mip(value: i32, lo: i32, hi: i32) -> i32 {
    value.max(lo).min(hi)
}

/// Pixel formats the streamer can size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    R8,
    Rg8,
    Rgba8,
    Rgba16F,
    Bc1,
    Bc3,
    Bc4,
    Bc5,
    Bc7,
}

impl TextureFormat {
    pub fn is_block_compressed(self) -> bool {
        matches!(
            self,
            TextureFormat::Bc1
                | TextureFormat::Bc3
                | TextureFormat::Bc4
                | TextureFormat::Bc5
                | TextureFormat::Bc7
        )
    }

    /// Bytes per pixel, or bytes per 4x4 block for compressed formats
    fn unit_bytes(self) -> usize {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::Rg8 => 2,
            TextureFormat::Rgba8 => 4,
            TextureFormat::Rgba16F => 8,
            TextureFormat::Bc1 | TextureFormat::Bc4 => 8,
            TextureFormat::Bc3 | TextureFormat::Bc5 | TextureFormat::Bc7 => 16,
        }
    }

    /// Size in bytes of one face of mip level `mip`
    pub fn level_size(self, width: u32, height: u32, mip: u8) -> usize {
        let w = width.checked_shr(mip as u32).unwrap_or(0).max(1) as usize;
        let h = height.checked_shr(mip as u32).unwrap_or(0).max(1) as usize;
        if self.is_block_compressed() {
            w.div_ceil(4) * h.div_ceil(4) * self.unit_bytes()
        } else {
            w * h * self.unit_bytes()
        }
    }
}

/// Cumulative mip sizes of one texture, across all slices
///
/// `size_from(m)` is the memory needed to hold mips `m..` of the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MipSizes {
    cumulative: SmallVec<[usize; 16]>,
}

impl MipSizes {
    pub fn from_format(format: TextureFormat, width: u32, height: u32, mips: u8, slices: u16) -> Self {
        let levels: SmallVec<[usize; 16]> = (0..mips)
            .map(|mip| format.level_size(width, height, mip) * slices.max(1) as usize)
            .collect();
        Self::from_level_sizes(&levels)
    }

    /// Build from explicit per-level sizes (all slices included), finest first
    pub fn from_level_sizes(levels: &[usize]) -> Self {
        let mut cumulative: SmallVec<[usize; 16]> = SmallVec::new();
        cumulative.resize(levels.len() + 1, 0);
        for mip in (0..levels.len()).rev() {
            cumulative[mip] = cumulative[mip + 1].saturating_add(levels[mip]);
        }
        Self { cumulative }
    }

    pub fn num_mips(&self) -> u8 {
        (self.cumulative.len() - 1) as u8
    }

    /// Bytes held by mips `mip..`; negative mips count the whole chain
    pub fn size_from(&self, mip: i32) -> usize {
        let last = self.cumulative.len() as i32 - 1;
        self.cumulative[mip.clamp(0, last) as usize]
    }

    /// Bytes of a single level
    pub fn level_size(&self, mip: u8) -> usize {
        self.size_from(mip as i32) - self.size_from(mip as i32 + 1)
    }

    pub fn total(&self) -> usize {
        self.cumulative[0]
    }
}
