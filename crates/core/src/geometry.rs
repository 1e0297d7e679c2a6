use std::fmt;

use crate::ids::ChainId;

/// Fixed-point unit for ratios: 1000 equals 1.0x.
///
/// All hot-path ratio math stays in integers; nothing in the chain
/// controller touches floating point.
pub const RATIO_ONE: u32 = 1000;

/// Maximum upscale factor of the hardware scalers.
pub const SCALE_UP_MAX: u32 = 4;

/// Maximum downscale divisor of the hardware scalers.
pub const SCALE_DOWN_MAX: u32 = 16;

/// Round down to the nearest even value.
///
/// Several hardware crops require even alignment, so corrected sizes always
/// round toward even.
pub const fn round_down_even(value: u32) -> u32 {
    value & !1
}

/// Apply a x1000 fixed-point ratio to a dimension, rounding down to even.
///
/// # Example
/// ```rust
/// use acheron_core::prelude::{RATIO_ONE, apply_ratio};
///
/// assert_eq!(apply_ratio(4128, RATIO_ONE), 4128);
/// assert_eq!(apply_ratio(4128, 2000), 2064);
/// ```
pub const fn apply_ratio(dim: u32, ratio: u32) -> u32 {
    if ratio == 0 {
        return 0;
    }
    round_down_even((dim as u64 * RATIO_ONE as u64 / ratio as u64) as u32)
}

/// Width/height pair in pixels.
///
/// # Example
/// ```rust
/// use acheron_core::prelude::PixelSize;
///
/// let size = PixelSize::new(1280, 720);
/// assert!(!size.is_zero());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either dimension is zero.
    pub const fn is_zero(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether `self` fits within `outer` on both axes.
    pub const fn fits_within(self, outer: PixelSize) -> bool {
        self.width <= outer.width && self.height <= outer.height
    }
}

impl fmt::Display for PixelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Crop rectangle in pixels, relative to the stage input.
///
/// # Example
/// ```rust
/// use acheron_core::prelude::{CropRect, PixelSize};
///
/// let crop = CropRect::full(PixelSize::new(640, 480));
/// assert!(crop.fits_within(PixelSize::new(640, 480)));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Crop covering the whole input.
    pub const fn full(size: PixelSize) -> Self {
        Self {
            x: 0,
            y: 0,
            width: size.width,
            height: size.height,
        }
    }

    /// Crop of `inner` centered inside `outer`, with even-aligned offsets.
    ///
    /// Offsets round toward even because the bayer crop demands even
    /// alignment on both axes.
    pub const fn centered(outer: PixelSize, inner: PixelSize) -> Self {
        let x = round_down_even(outer.width.saturating_sub(inner.width) / 2);
        let y = round_down_even(outer.height.saturating_sub(inner.height) / 2);
        Self {
            x,
            y,
            width: inner.width,
            height: inner.height,
        }
    }

    /// Size of the cropped area.
    pub const fn size(self) -> PixelSize {
        PixelSize::new(self.width, self.height)
    }

    /// Whether the rectangle lies within the declared input bounds.
    pub const fn fits_within(self, input: PixelSize) -> bool {
        if self.width == 0 || self.height == 0 {
            return false;
        }
        let right = self.x as u64 + self.width as u64;
        let bottom = self.y as u64 + self.height as u64;
        right <= input.width as u64 && bottom <= input.height as u64
    }
}

impl fmt::Display for CropRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{},{}", self.width, self.height, self.x, self.y)
    }
}

/// Fixed sensor crop margins in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Margins {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl Margins {
    pub const fn new(left: u32, right: u32, top: u32, bottom: u32) -> Self {
        Self {
            left,
            right,
            top,
            bottom,
        }
    }

    pub const fn horizontal(self) -> u32 {
        self.left + self.right
    }

    pub const fn vertical(self) -> u32 {
        self.top + self.bottom
    }
}

/// Sensor output geometry, set once per stream-open and refreshed on `init`.
///
/// # Example
/// ```rust
/// use acheron_core::prelude::{Margins, PixelSize, SensorGeometry, RATIO_ONE};
///
/// let sensor = SensorGeometry {
///     output: PixelSize::new(4128, 3096),
///     margins: Margins::new(16, 16, 12, 12),
///     binning: RATIO_ONE,
///     bns: PixelSize::new(4096, 3072),
///     framerate: 30,
/// };
/// assert_eq!(sensor.active_size(), PixelSize::new(4096, 3072));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorGeometry {
    /// Raw sensor output size including margins.
    pub output: PixelSize,
    /// Fixed crop margins applied before any processing.
    pub margins: Margins,
    /// Binning ratio, x1000 fixed point (1000 = no binning).
    pub binning: u32,
    /// Post-binning-scaler output size.
    pub bns: PixelSize,
    /// Stream frame rate in frames per second.
    pub framerate: u32,
}

impl SensorGeometry {
    /// Sensor area left after removing the fixed margins.
    pub const fn active_size(&self) -> PixelSize {
        PixelSize::new(
            self.output.width.saturating_sub(self.margins.horizontal()),
            self.output.height.saturating_sub(self.margins.vertical()),
        )
    }

    /// Active size scaled down by the binning ratio.
    pub const fn binned_size(&self) -> PixelSize {
        let active = self.active_size();
        PixelSize::new(
            apply_ratio(active.width, self.binning),
            apply_ratio(active.height, self.binning),
        )
    }

    /// Basic sanity validation; margins must leave a usable area.
    pub fn validate(&self) -> Result<(), String> {
        if self.output.is_zero() {
            return Err("sensor output size is zero".into());
        }
        if self.binning < RATIO_ONE {
            return Err(format!("binning ratio {} below 1.0x", self.binning));
        }
        if self.active_size().is_zero() {
            return Err("margins consume the whole sensor output".into());
        }
        Ok(())
    }
}

/// Clamp a requested output size against the hardware scaler ratio limits.
///
/// The output must lie within `[input/16, input*4]` per axis. Returns the
/// corrected size and whether clamping occurred; corrected values round
/// down to even. Out-of-range requests are always clamped, never rejected.
///
/// # Example
/// ```rust
/// use acheron_core::prelude::{PixelSize, clamp_scale};
///
/// let input = PixelSize::new(2560, 1920);
/// let (out, clamped) = clamp_scale(input, PixelSize::new(1280, 720));
/// assert_eq!(out, PixelSize::new(1280, 720));
/// assert!(!clamped);
///
/// let (out, clamped) = clamp_scale(input, PixelSize::new(64, 64));
/// assert_eq!(out, PixelSize::new(160, 120));
/// assert!(clamped);
/// ```
pub fn clamp_scale(input: PixelSize, requested: PixelSize) -> (PixelSize, bool) {
    let clamp_axis = |input: u32, req: u32| -> (u32, bool) {
        let min = round_down_even(input / SCALE_DOWN_MAX);
        let max = input.saturating_mul(SCALE_UP_MAX);
        if req < min {
            (min, true)
        } else if req > max {
            (round_down_even(max), true)
        } else {
            (req, false)
        }
    };
    let (width, w_clamped) = clamp_axis(input.width, requested.width);
    let (height, h_clamped) = clamp_axis(input.height, requested.height);
    (PixelSize::new(width, height), w_clamped || h_clamped)
}

/// Geometry of one pipeline segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChainSegment {
    /// Declared input size, equal to the upstream segment's output.
    pub input: PixelSize,
    /// Output size fed to the downstream segment.
    pub output: PixelSize,
    /// Crop applied within the input bounds.
    pub crop: CropRect,
}

/// Width/height/crop state for all four pipeline segments.
///
/// Mutated only by the stage size negotiator; read by the tap dispatcher
/// and the chain device.
///
/// # Example
/// ```rust
/// use acheron_core::prelude::{ChainGeometry, ChainId, PixelSize};
///
/// let mut chain = ChainGeometry::default();
/// chain.link(ChainId::Chain0, PixelSize::new(2560, 1920), PixelSize::new(2560, 1920));
/// chain.link(ChainId::Chain1, PixelSize::new(2560, 1920), PixelSize::new(2560, 1920));
/// assert!(chain.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChainGeometry {
    segments: [ChainSegment; 4],
}

impl ChainGeometry {
    /// Borrow one segment.
    pub fn segment(&self, id: ChainId) -> &ChainSegment {
        &self.segments[id.index()]
    }

    /// Mutably borrow one segment.
    pub fn segment_mut(&mut self, id: ChainId) -> &mut ChainSegment {
        &mut self.segments[id.index()]
    }

    /// Set a segment's input/output pair with a full-input crop.
    pub fn link(&mut self, id: ChainId, input: PixelSize, output: PixelSize) {
        self.segments[id.index()] = ChainSegment {
            input,
            output,
            crop: CropRect::full(input),
        };
    }

    /// Reset all segments to zero, as done at device open.
    pub fn reset(&mut self) {
        self.segments = [ChainSegment::default(); 4];
    }

    /// Check the coupling and crop invariants across all populated segments.
    ///
    /// `chain(n).output` must equal `chain(n+1).input`, and every segment's
    /// crop must lie within its declared input bounds.
    pub fn validate(&self) -> Result<(), String> {
        for id in ChainId::ALL {
            let seg = self.segment(id);
            if seg.input.is_zero() {
                continue;
            }
            if !seg.crop.fits_within(seg.input) {
                return Err(format!(
                    "{} crop {} exceeds input {}",
                    id, seg.crop, seg.input
                ));
            }
            if let Some(next) = id.next() {
                let downstream = self.segment(next);
                if !downstream.input.is_zero() && downstream.input != seg.output {
                    return Err(format!(
                        "{} output {} does not feed {} input {}",
                        id, seg.output, next, downstream.input
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_rounding() {
        assert_eq!(round_down_even(161), 160);
        assert_eq!(round_down_even(160), 160);
        assert_eq!(round_down_even(0), 0);
    }

    #[test]
    fn clamp_limits_are_inclusive() {
        let input = PixelSize::new(1600, 1200);
        // Exactly 1/16 and exactly 4x pass through unclamped.
        let (out, clamped) = clamp_scale(input, PixelSize::new(100, 75));
        assert_eq!(out, PixelSize::new(100, 75));
        assert!(!clamped);
        let (out, clamped) = clamp_scale(input, PixelSize::new(6400, 4800));
        assert_eq!(out, PixelSize::new(6400, 4800));
        assert!(!clamped);
    }

    #[test]
    fn clamp_rounds_even() {
        let input = PixelSize::new(1610, 1200);
        let (out, clamped) = clamp_scale(input, PixelSize::new(10, 10));
        assert!(clamped);
        assert_eq!(out.width % 2, 0);
    }

    #[test]
    fn centered_crop_offsets_are_even() {
        let crop = CropRect::centered(PixelSize::new(4096, 3072), PixelSize::new(2561, 1921));
        assert_eq!(crop.x % 2, 0);
        assert_eq!(crop.y % 2, 0);
    }

    #[test]
    fn chain_validate_rejects_broken_coupling() {
        let mut chain = ChainGeometry::default();
        chain.link(ChainId::Chain0, PixelSize::new(100, 100), PixelSize::new(100, 100));
        chain.link(ChainId::Chain1, PixelSize::new(90, 100), PixelSize::new(90, 100));
        assert!(chain.validate().is_err());
    }

    #[test]
    fn chain_validate_rejects_out_of_bounds_crop() {
        let mut chain = ChainGeometry::default();
        chain.link(ChainId::Chain0, PixelSize::new(100, 100), PixelSize::new(100, 100));
        chain.segment_mut(ChainId::Chain0).crop = CropRect::new(50, 50, 60, 60);
        assert!(chain.validate().is_err());
    }

    #[test]
    fn binned_size_applies_ratio() {
        let sensor = SensorGeometry {
            output: PixelSize::new(4128, 3096),
            margins: Margins::new(16, 16, 12, 12),
            binning: 2000,
            bns: PixelSize::default(),
            framerate: 30,
        };
        assert_eq!(sensor.binned_size(), PixelSize::new(2048, 1536));
    }
}
