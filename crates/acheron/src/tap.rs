//! Per-frame capture tap dispatch.
//!
//! Each optional output tap runs a small state machine
//! (`Closed → Open → Started ⇄ Open`) and is consulted once per frame by
//! its owning group: stop when the request flag dropped, start or resize
//! when the requested size changed, then attach a destination buffer — or
//! drop the tap for this frame when none is queued.

use tracing::{debug, warn};

use acheron_core::frame::{Frame, TapQueue};
use acheron_core::geometry::{ChainGeometry, PixelSize, clamp_scale};
use acheron_core::ids::{ChainId, TapId};
use acheron_core::metrics::ChainCounters;
use acheron_core::params::{DeltaMask, DmaOutputParam, OtfInputParam, ParamBlockId};
use acheron_core::region::ParamTable;

use crate::error::ChainError;

/// Lifecycle state of one capture tap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TapState {
    #[default]
    Closed,
    Open,
    Started,
}

struct TapBlocks {
    crop: Option<ParamBlockId>,
    dma: ParamBlockId,
}

/// One optional output tap and its pending destination buffers.
///
/// # Example
/// ```rust
/// use acheron::tap::{CaptureTap, TapState};
/// use acheron::prelude::*;
///
/// let mut tap = CaptureTap::new(TapId::ScalePreview);
/// tap.open();
/// assert_eq!(tap.state(), TapState::Open);
/// ```
pub struct CaptureTap {
    id: TapId,
    state: TapState,
    size: PixelSize,
    queue: TapQueue,
}

impl CaptureTap {
    pub fn new(id: TapId) -> Self {
        Self {
            id,
            state: TapState::Closed,
            size: PixelSize::default(),
            queue: TapQueue::default(),
        }
    }

    pub fn id(&self) -> TapId {
        self.id
    }

    pub fn state(&self) -> TapState {
        self.state
    }

    /// Current output size, meaningful once started.
    pub fn size(&self) -> PixelSize {
        self.size
    }

    /// Destination buffer queue for this tap.
    pub fn queue(&self) -> &TapQueue {
        &self.queue
    }

    /// Open the tap at device open.
    pub fn open(&mut self) {
        if self.state == TapState::Closed {
            self.state = TapState::Open;
        }
    }

    /// Close the tap and drop any queued buffers.
    pub fn close(&mut self) {
        self.state = TapState::Closed;
        self.size = PixelSize::default();
        self.queue.clear();
    }

    fn blocks(&self) -> TapBlocks {
        match self.id {
            TapId::BayerRaw => TapBlocks {
                crop: None,
                dma: ParamBlockId::BayerRawOutput,
            },
            TapId::BayerProcessed => TapBlocks {
                crop: None,
                dma: ParamBlockId::BayerProcessedOutput,
            },
            TapId::ColorOut => TapBlocks {
                crop: None,
                dma: ParamBlockId::IspDmaOutput,
            },
            TapId::ScaleCapture => TapBlocks {
                crop: Some(ParamBlockId::SccCropOutput),
                dma: ParamBlockId::SccDmaOutput,
            },
            TapId::DistortionOut => TapBlocks {
                crop: None,
                dma: ParamBlockId::OdcDmaOutput,
            },
            TapId::ScalePreview => TapBlocks {
                crop: Some(ParamBlockId::ScpCropOutput),
                dma: ParamBlockId::ScpDmaOutput,
            },
        }
    }

    /// Validate a requested size against the owning stage's bounds.
    fn bounds_ok(&self, chain: &ChainGeometry, size: PixelSize) -> Result<(), ChainError> {
        if size.is_zero() {
            return Err(ChainError::InvalidGeometry(format!(
                "tap {} requested zero size",
                self.id
            )));
        }
        match self.id {
            TapId::BayerRaw | TapId::BayerProcessed => {
                let bound = chain.segment(ChainId::Chain0).crop.size();
                ensure_within(self.id, size, bound)
            }
            TapId::ColorOut => {
                let bound = chain.segment(ChainId::Chain1).input;
                ensure_within(self.id, size, bound)
            }
            TapId::DistortionOut => {
                let bound = chain.segment(ChainId::Chain2).input;
                ensure_within(self.id, size, bound)
            }
            TapId::ScaleCapture => ensure_scalable(self.id, size, chain.segment(ChainId::Chain1).input),
            TapId::ScalePreview => ensure_scalable(self.id, size, chain.segment(ChainId::Chain3).input),
        }
    }

    /// Per-frame tag decision for this tap.
    ///
    /// Returns the delta-mask contribution of any block writes. A missing
    /// destination buffer clears the frame's request for this tap only —
    /// the frame proceeds without it. A conflicting bounds-down-scale
    /// request between the companion bayer taps surfaces as
    /// [`ChainError::BdsSizeMismatch`], which the owning group converts
    /// into the same drop policy.
    pub fn dispatch(
        &mut self,
        frame: &mut Frame,
        chain: &ChainGeometry,
        params: &mut ParamTable,
        bds: &mut Option<PixelSize>,
        counters: &ChainCounters,
    ) -> Result<DeltaMask, ChainError> {
        let mut delta = DeltaMask::default();
        let blocks = self.blocks();
        let req = *frame.request(self.id);

        if !req.enabled {
            if self.state == TapState::Started {
                params.write_dma_output(blocks.dma, DmaOutputParam::disabled());
                delta.set(blocks.dma);
                // Pending crop/scale writes are moot once the path is off.
                if let Some(crop) = blocks.crop {
                    params.retire(crop);
                }
                self.state = TapState::Open;
                debug!(tap = %self.id, "tap stopped");
            }
            frame.addresses[self.id.index()] = 0;
            return Ok(delta);
        }

        if self.state == TapState::Closed {
            return Err(ChainError::NotReady("tap not open"));
        }

        if self.id.companion().is_some() {
            match *bds {
                Some(fixed) if fixed != req.size => {
                    return Err(ChainError::BdsSizeMismatch {
                        requested: req.size,
                        fixed,
                    });
                }
                _ => *bds = Some(req.size),
            }
        }

        if self.state == TapState::Open || req.size != self.size {
            self.bounds_ok(chain, req.size)?;
            if let Some(crop) = blocks.crop {
                params.write_otf_input(crop, OtfInputParam::enabled(req.size, req.crop));
                delta.set(crop);
            }
            params.write_dma_output(blocks.dma, DmaOutputParam::enabled(req.size));
            delta.set(blocks.dma);
            self.size = req.size;
            self.state = TapState::Started;
            debug!(tap = %self.id, size = %req.size, "tap started");
        }

        match self.queue.pop_pending() {
            Some(buffer) => {
                frame.addresses[self.id.index()] = buffer.address;
                frame.mark_output(self.id);
            }
            None => {
                frame.addresses[self.id.index()] = 0;
                frame.clear_request(self.id);
                counters.tap_dropped();
                debug!(tap = %self.id, frame = frame.count, "no buffer queued, tap dropped for frame");
            }
        }

        Ok(delta)
    }
}

fn ensure_within(id: TapId, size: PixelSize, bound: PixelSize) -> Result<(), ChainError> {
    if bound.is_zero() {
        return Err(ChainError::InvalidGeometry(format!(
            "tap {id} requested before its stage was negotiated"
        )));
    }
    if !size.fits_within(bound) {
        return Err(ChainError::InvalidGeometry(format!(
            "tap {id} size {size} exceeds stage bound {bound}"
        )));
    }
    Ok(())
}

fn ensure_scalable(id: TapId, size: PixelSize, input: PixelSize) -> Result<(), ChainError> {
    if input.is_zero() {
        return Err(ChainError::InvalidGeometry(format!(
            "tap {id} requested before its stage was negotiated"
        )));
    }
    let (corrected, clamped) = clamp_scale(input, size);
    if clamped {
        warn!(tap = %id, requested = %size, corrected = %corrected, "tap size outside scaler range");
        return Err(ChainError::InvalidGeometry(format!(
            "tap {id} size {size} outside scaler range of {input}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use acheron_core::frame::TapBuffer;
    use acheron_core::geometry::CropRect;

    fn chain() -> ChainGeometry {
        let mut chain = ChainGeometry::default();
        let base = PixelSize::new(4096, 3072);
        let out = PixelSize::new(2560, 1920);
        chain.link(ChainId::Chain0, base, out);
        chain.segment_mut(ChainId::Chain0).crop = CropRect::full(base);
        chain.link(ChainId::Chain1, out, out);
        chain.link(ChainId::Chain2, out, out);
        chain.link(ChainId::Chain3, out, PixelSize::new(1280, 720));
        chain
    }

    fn started_tap(id: TapId, size: PixelSize) -> (CaptureTap, ParamTable, ChainCounters) {
        let chain = chain();
        let mut tap = CaptureTap::new(id);
        tap.open();
        tap.queue().push(TapBuffer {
            index: 0,
            address: 0x4000,
        });
        let mut params = ParamTable::default();
        let counters = ChainCounters::default();
        let mut frame = Frame::new();
        frame.set_request(id, size);
        let mut bds = None;
        tap.dispatch(&mut frame, &chain, &mut params, &mut bds, &counters)
            .unwrap();
        assert_eq!(tap.state(), TapState::Started);
        (tap, params, counters)
    }

    #[test]
    fn start_then_attach_marks_output() {
        let chain = chain();
        let mut tap = CaptureTap::new(TapId::ScalePreview);
        tap.open();
        tap.queue().push(TapBuffer {
            index: 1,
            address: 0x8000,
        });
        let mut params = ParamTable::default();
        let counters = ChainCounters::default();
        let mut frame = Frame::new();
        frame.set_request(TapId::ScalePreview, PixelSize::new(1280, 720));
        let mut bds = None;

        let delta = tap
            .dispatch(&mut frame, &chain, &mut params, &mut bds, &counters)
            .unwrap();
        assert!(delta.contains(ParamBlockId::ScpDmaOutput));
        assert!(delta.contains(ParamBlockId::ScpCropOutput));
        assert!(frame.has_output(TapId::ScalePreview));
        assert_eq!(frame.addresses[TapId::ScalePreview.index()], 0x8000);
    }

    #[test]
    fn empty_queue_drops_tap_without_error() {
        let chain = chain();
        let mut tap = CaptureTap::new(TapId::ColorOut);
        tap.open();
        let mut params = ParamTable::default();
        let counters = ChainCounters::default();
        let mut frame = Frame::new();
        frame.set_request(TapId::ColorOut, PixelSize::new(2560, 1920));
        let mut bds = None;

        let result = tap.dispatch(&mut frame, &chain, &mut params, &mut bds, &counters);
        assert!(result.is_ok());
        assert!(!frame.request(TapId::ColorOut).enabled);
        assert!(!frame.has_output(TapId::ColorOut));
        assert_eq!(frame.addresses[TapId::ColorOut.index()], 0);
        assert_eq!(counters.snapshot().taps_dropped, 1);
    }

    #[test]
    fn request_off_runs_stop_sequence() {
        let (mut tap, mut params, counters) =
            started_tap(TapId::ScaleCapture, PixelSize::new(2560, 1920));
        let chain = chain();
        let mut frame = Frame::new();
        let mut bds = None;

        let delta = tap
            .dispatch(&mut frame, &chain, &mut params, &mut bds, &counters)
            .unwrap();
        assert_eq!(tap.state(), TapState::Open);
        assert!(delta.contains(ParamBlockId::SccDmaOutput));
        assert_eq!(
            params.region().dma_output(ParamBlockId::SccDmaOutput).cmd,
            acheron_core::params::PARAM_CMD_DISABLE
        );
    }

    #[test]
    fn companion_bds_conflict_is_rejected() {
        let chain = chain();
        let mut raw = CaptureTap::new(TapId::BayerRaw);
        let mut processed = CaptureTap::new(TapId::BayerProcessed);
        raw.open();
        processed.open();
        raw.queue().push(TapBuffer {
            index: 0,
            address: 0x1000,
        });
        let mut params = ParamTable::default();
        let counters = ChainCounters::default();
        let mut frame = Frame::new();
        frame.set_request(TapId::BayerRaw, PixelSize::new(4096, 3072));
        frame.set_request(TapId::BayerProcessed, PixelSize::new(2048, 1536));
        let mut bds = None;

        raw.dispatch(&mut frame, &chain, &mut params, &mut bds, &counters)
            .unwrap();
        let err = processed
            .dispatch(&mut frame, &chain, &mut params, &mut bds, &counters)
            .unwrap_err();
        assert_eq!(err.code(), "bds_size_mismatch");
    }

    #[test]
    fn oversized_request_is_invalid_geometry() {
        let chain = chain();
        let mut tap = CaptureTap::new(TapId::ColorOut);
        tap.open();
        let mut params = ParamTable::default();
        let counters = ChainCounters::default();
        let mut frame = Frame::new();
        frame.set_request(TapId::ColorOut, PixelSize::new(4096, 3072));
        let mut bds = None;

        let err = tap
            .dispatch(&mut frame, &chain, &mut params, &mut bds, &counters)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_geometry");
    }

    #[test]
    fn resize_rewrites_blocks() {
        let (mut tap, mut params, counters) =
            started_tap(TapId::ScalePreview, PixelSize::new(1280, 720));
        let chain = chain();
        tap.queue().push(TapBuffer {
            index: 2,
            address: 0xA000,
        });
        let mut frame = Frame::new();
        frame.set_request(TapId::ScalePreview, PixelSize::new(640, 480));
        let mut bds = None;

        let delta = tap
            .dispatch(&mut frame, &chain, &mut params, &mut bds, &counters)
            .unwrap();
        assert!(delta.contains(ParamBlockId::ScpCropOutput));
        assert_eq!(tap.size(), PixelSize::new(640, 480));
    }
}
