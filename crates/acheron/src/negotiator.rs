//! Stage size negotiation across the four dependent pipeline segments.
//!
//! Given sensor geometry, the current chain geometry, and a requested
//! input/output crop for one segment, each entry point produces an updated
//! chain geometry plus the delta mask of parameter blocks that must be
//! rewritten. Callers serialize through whatever exclusive guard owns the
//! device; on overlapping requests the later call wins.

use tracing::debug;

use acheron_core::geometry::{
    ChainGeometry, CropRect, PixelSize, SensorGeometry, clamp_scale,
};
use acheron_core::ids::ChainId;
use acheron_core::params::{
    ControlParam, DeltaMask, OtfInputParam, OtfOutputParam, ParamBlockId,
};
use acheron_core::region::ParamTable;

use crate::error::ChainError;

/// Result of a stage-3 negotiation, which may clamp the requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage3Outcome {
    /// Parameter blocks rewritten by the call.
    pub delta: DeltaMask,
    /// Final output size after clamping.
    pub output: PixelSize,
    /// Whether the request was corrected against the scaler limits.
    pub clamped: bool,
}

/// Borrowed negotiation context over the device's geometry and parameters.
///
/// # Example
/// ```rust
/// use acheron::negotiator::StageNegotiator;
/// use acheron::prelude::*;
///
/// let sensor = SensorGeometry {
///     output: PixelSize::new(4128, 3096),
///     margins: Margins::new(16, 16, 12, 12),
///     binning: RATIO_ONE,
///     bns: PixelSize::default(),
///     framerate: 30,
/// };
/// let mut chain = ChainGeometry::default();
/// let mut params = ParamTable::default();
/// let mut negotiator = StageNegotiator {
///     sensor: &sensor,
///     chain: &mut chain,
///     params: &mut params,
///     reprocessing: false,
/// };
/// let crop = CropRect::full(PixelSize::new(4096, 3072));
/// let out = CropRect::full(PixelSize::new(2560, 1920));
/// let delta = negotiator.stage0(crop, out).unwrap();
/// assert!(!delta.is_empty());
/// ```
pub struct StageNegotiator<'a> {
    pub sensor: &'a SensorGeometry,
    pub chain: &'a mut ChainGeometry,
    pub params: &'a mut ParamTable,
    pub reprocessing: bool,
}

impl StageNegotiator<'_> {
    /// Input feeding the first stage: the binning-scaler output when
    /// present, otherwise the binned active sensor area.
    pub fn base_input(&self) -> PixelSize {
        if self.sensor.bns.is_zero() {
            self.sensor.binned_size()
        } else {
            self.sensor.bns
        }
    }

    fn write_control(&mut self, delta: &mut DeltaMask, id: ParamBlockId, value: ControlParam) {
        self.params.write_control(id, value);
        delta.set(id);
    }

    fn write_otf_input(&mut self, delta: &mut DeltaMask, id: ParamBlockId, value: OtfInputParam) {
        self.params.write_otf_input(id, value);
        delta.set(id);
    }

    fn write_otf_output(&mut self, delta: &mut DeltaMask, id: ParamBlockId, value: OtfOutputParam) {
        self.params.write_otf_output(id, value);
        delta.set(id);
    }

    /// Negotiate the first segment: bayer crop and demosaic input.
    ///
    /// `input_crop` is applied before optical/bayer processing;
    /// `output_crop` selects the demosaic output within the cropped area.
    /// The two immediately dependent consumers (distortion correction and
    /// the first scale/crop stage) always mirror chain0 1:1.
    pub fn stage0(
        &mut self,
        input_crop: CropRect,
        output_crop: CropRect,
    ) -> Result<DeltaMask, ChainError> {
        let base = self.base_input();
        if base.is_zero() {
            return Err(ChainError::InvalidGeometry(
                "sensor geometry not initialized".into(),
            ));
        }
        if !input_crop.fits_within(base) {
            return Err(ChainError::InvalidGeometry(format!(
                "chain0 input crop {input_crop} exceeds sensor input {base}"
            )));
        }
        if !output_crop.fits_within(input_crop.size()) {
            return Err(ChainError::InvalidGeometry(format!(
                "chain0 output crop {} exceeds input crop {}",
                output_crop,
                input_crop.size()
            )));
        }

        let output = output_crop.size();
        let seg0 = self.chain.segment_mut(ChainId::Chain0);
        seg0.input = base;
        seg0.crop = input_crop;
        seg0.output = output;
        // Distortion correction and the capture scaler mirror chain0 1:1.
        self.chain.link(ChainId::Chain1, output, output);
        // A populated downstream segment re-seats on the new input; its
        // own output stays until the next stage1 call.
        let seg2 = self.chain.segment_mut(ChainId::Chain2);
        if !seg2.input.is_zero() {
            seg2.input = output;
            seg2.crop = CropRect::full(output);
        }

        let mut delta = DeltaMask::default();
        self.write_control(&mut delta, ParamBlockId::BayerControl, ControlParam::enabled());
        self.write_otf_input(
            &mut delta,
            ParamBlockId::BayerOtfInput,
            OtfInputParam::enabled(base, input_crop),
        );
        self.write_otf_input(
            &mut delta,
            ParamBlockId::IspOtfInput,
            OtfInputParam::enabled(input_crop.size(), output_crop),
        );
        self.write_otf_input(
            &mut delta,
            ParamBlockId::DrcOtfInput,
            OtfInputParam::enabled(output, CropRect::full(output)),
        );
        self.write_otf_output(
            &mut delta,
            ParamBlockId::DrcOtfOutput,
            OtfOutputParam::enabled(output),
        );
        self.write_otf_input(
            &mut delta,
            ParamBlockId::SccOtfInput,
            OtfInputParam::enabled(output, CropRect::full(output)),
        );

        debug_assert!(self.chain.validate().is_ok());
        debug!(%input_crop, %output_crop, "stage0 negotiated");
        Ok(delta)
    }

    /// Negotiate the color-correction scale output and its downstream
    /// consumers (distortion compensation and the stabilization input).
    pub fn stage1(&mut self, size: PixelSize) -> Result<DeltaMask, ChainError> {
        if size.is_zero() {
            return Err(ChainError::InvalidGeometry("chain1 output size is zero".into()));
        }
        let seg1 = self.chain.segment(ChainId::Chain1);
        if seg1.input.is_zero() {
            return Err(ChainError::InvalidGeometry(
                "chain1 input not negotiated".into(),
            ));
        }

        self.chain.segment_mut(ChainId::Chain1).output = size;
        self.chain.link(ChainId::Chain2, size, size);
        let seg3 = self.chain.segment_mut(ChainId::Chain3);
        seg3.input = size;
        seg3.crop = CropRect::full(size);
        if seg3.output.is_zero() {
            seg3.output = size;
        }

        let mut delta = DeltaMask::default();
        self.write_otf_output(
            &mut delta,
            ParamBlockId::SccOtfOutput,
            OtfOutputParam::enabled(size),
        );
        self.write_otf_input(
            &mut delta,
            ParamBlockId::OdcOtfInput,
            OtfInputParam::enabled(size, CropRect::full(size)),
        );
        self.write_otf_output(
            &mut delta,
            ParamBlockId::OdcOtfOutput,
            OtfOutputParam::enabled(size),
        );
        self.write_otf_input(
            &mut delta,
            ParamBlockId::DisOtfInput,
            OtfInputParam::enabled(size, CropRect::full(size)),
        );

        debug_assert!(self.chain.validate().is_ok());
        debug!(%size, "stage1 negotiated");
        Ok(delta)
    }

    /// Negotiate the stabilization output / noise-reduction chain.
    ///
    /// A no-op in reprocessing mode: offline reprocessing bypasses
    /// stabilization entirely.
    pub fn stage2(&mut self, size: PixelSize) -> Result<DeltaMask, ChainError> {
        if self.reprocessing {
            return Ok(DeltaMask::default());
        }
        if size.is_zero() {
            return Err(ChainError::InvalidGeometry("chain2 output size is zero".into()));
        }
        if self.chain.segment(ChainId::Chain2).input.is_zero() {
            return Err(ChainError::InvalidGeometry(
                "chain2 input not negotiated".into(),
            ));
        }

        self.chain.segment_mut(ChainId::Chain2).output = size;
        let seg3 = self.chain.segment_mut(ChainId::Chain3);
        seg3.input = size;
        seg3.crop = CropRect::full(size);
        if seg3.output.is_zero() {
            seg3.output = size;
        }

        let mut delta = DeltaMask::default();
        self.write_otf_output(
            &mut delta,
            ParamBlockId::DisOtfOutput,
            OtfOutputParam::enabled(size),
        );
        self.write_otf_input(
            &mut delta,
            ParamBlockId::TdnrOtfInput,
            OtfInputParam::enabled(size, CropRect::full(size)),
        );
        self.write_otf_output(
            &mut delta,
            ParamBlockId::TdnrOtfOutput,
            OtfOutputParam::enabled(size),
        );
        self.write_otf_input(
            &mut delta,
            ParamBlockId::ScpOtfInput,
            OtfInputParam::enabled(size, CropRect::full(size)),
        );

        debug_assert!(self.chain.validate().is_ok());
        debug!(%size, "stage2 negotiated");
        Ok(delta)
    }

    /// Negotiate the final scale/crop stage and the face-detection input.
    ///
    /// The requested size is first clamped against the stage's 1/16x–4x
    /// scale limits relative to its current input; clamping is a corrected
    /// value notice, not an error. A no-op in reprocessing mode.
    pub fn stage3(&mut self, size: PixelSize) -> Result<Stage3Outcome, ChainError> {
        if self.reprocessing {
            return Ok(Stage3Outcome {
                delta: DeltaMask::default(),
                output: self.chain.segment(ChainId::Chain3).output,
                clamped: false,
            });
        }
        if size.is_zero() {
            return Err(ChainError::InvalidGeometry("chain3 output size is zero".into()));
        }
        let input = self.chain.segment(ChainId::Chain3).input;
        if input.is_zero() {
            return Err(ChainError::InvalidGeometry(
                "chain3 input not negotiated".into(),
            ));
        }

        let (output, clamped) = clamp_scale(input, size);
        if clamped {
            debug!(requested = %size, corrected = %output, %input, "stage3 scale clamped");
        }

        let seg3 = self.chain.segment_mut(ChainId::Chain3);
        seg3.output = output;
        seg3.crop = CropRect::full(input);

        let mut delta = DeltaMask::default();
        self.write_otf_input(
            &mut delta,
            ParamBlockId::ScpCropOutput,
            OtfInputParam::enabled(output, CropRect::full(input)),
        );
        self.write_otf_output(
            &mut delta,
            ParamBlockId::ScpOtfOutput,
            OtfOutputParam::enabled(output),
        );
        self.write_control(&mut delta, ParamBlockId::FdControl, ControlParam::enabled());
        self.write_otf_input(
            &mut delta,
            ParamBlockId::FdOtfInput,
            OtfInputParam::enabled(output, CropRect::full(output)),
        );

        debug_assert!(self.chain.validate().is_ok());
        Ok(Stage3Outcome {
            delta,
            output,
            clamped,
        })
    }
}
