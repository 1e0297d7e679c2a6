//! The parameter region shared with the processing engine.
//!
//! The region content is core-owned; the engine reads it asynchronously.
//! No implicit coherence is assumed: every CPU write is paired with an
//! explicit [`RegionSync::flush`] before the corresponding hardware
//! command, and every engine-produced read with a
//! [`RegionSync::invalidate`].

use std::ops::Range;
use std::sync::Arc;

use crate::params::{
    ControlParam, DeltaMask, DmaOutputParam, EffectParam, OtfInputParam, OtfOutputParam,
    PARAM_BLOCK_SLOTS, PARAM_BLOCK_WORDS, ParamBlockId,
};

/// Cache maintenance hooks for the shared region.
///
/// Implementations map to the platform's CPU→device flush and device→CPU
/// invalidate primitives. Ranges are byte offsets into the region.
pub trait RegionSync: Send + Sync {
    /// Make CPU writes in `range` visible to the engine.
    fn flush(&self, range: Range<usize>);

    /// Discard stale CPU cache for `range` before reading engine output.
    fn invalidate(&self, range: Range<usize>);
}

/// No-op sync for tests and coherent-memory platforms.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSync;

impl RegionSync for NullSync {
    fn flush(&self, _range: Range<usize>) {}

    fn invalidate(&self, _range: Range<usize>) {}
}

/// Per-stage configuration blocks shared with the processing engine.
///
/// Blocks are fixed-size word arrays addressed by [`ParamBlockId`]; typed
/// accessors encode and decode the views the chain controller uses. A block
/// is only meaningful once its owning stage has been started at least once.
pub struct ParameterRegion {
    blocks: Box<[[u32; PARAM_BLOCK_WORDS]; PARAM_BLOCK_SLOTS]>,
}

impl Default for ParameterRegion {
    fn default() -> Self {
        Self {
            blocks: Box::new([[0; PARAM_BLOCK_WORDS]; PARAM_BLOCK_SLOTS]),
        }
    }
}

impl ParameterRegion {
    /// Byte range of one block inside the region.
    pub const fn byte_range(id: ParamBlockId) -> Range<usize> {
        let start = id.slot() * PARAM_BLOCK_WORDS * 4;
        start..start + PARAM_BLOCK_WORDS * 4
    }

    pub fn set_control(&mut self, id: ParamBlockId, value: ControlParam) {
        value.encode(&mut self.blocks[id.slot()]);
    }

    pub fn control(&self, id: ParamBlockId) -> ControlParam {
        ControlParam::decode(&self.blocks[id.slot()])
    }

    pub fn set_otf_input(&mut self, id: ParamBlockId, value: OtfInputParam) {
        value.encode(&mut self.blocks[id.slot()]);
    }

    pub fn otf_input(&self, id: ParamBlockId) -> OtfInputParam {
        OtfInputParam::decode(&self.blocks[id.slot()])
    }

    pub fn set_otf_output(&mut self, id: ParamBlockId, value: OtfOutputParam) {
        value.encode(&mut self.blocks[id.slot()]);
    }

    pub fn otf_output(&self, id: ParamBlockId) -> OtfOutputParam {
        OtfOutputParam::decode(&self.blocks[id.slot()])
    }

    pub fn set_dma_output(&mut self, id: ParamBlockId, value: DmaOutputParam) {
        value.encode(&mut self.blocks[id.slot()]);
    }

    pub fn dma_output(&self, id: ParamBlockId) -> DmaOutputParam {
        DmaOutputParam::decode(&self.blocks[id.slot()])
    }

    pub fn set_effect(&mut self, id: ParamBlockId, value: EffectParam) {
        value.encode(&mut self.blocks[id.slot()]);
    }

    pub fn effect(&self, id: ParamBlockId) -> EffectParam {
        EffectParam::decode(&self.blocks[id.slot()])
    }
}

/// Parameter region plus the device-global delta accumulation.
///
/// Every write helper stores into the region and records the block in the
/// delta mask; the mask is the unit of synchronization with the engine.
///
/// # Example
/// ```rust
/// use acheron_core::prelude::*;
///
/// let mut table = ParamTable::default();
/// table.write_otf_input(
///     ParamBlockId::IspOtfInput,
///     OtfInputParam::enabled(PixelSize::new(2560, 1920), CropRect::full(PixelSize::new(2560, 1920))),
/// );
/// assert!(table.delta().contains(ParamBlockId::IspOtfInput));
/// ```
pub struct ParamTable {
    region: ParameterRegion,
    delta: DeltaMask,
    sync: Arc<dyn RegionSync>,
}

impl Default for ParamTable {
    fn default() -> Self {
        Self::new(Arc::new(NullSync))
    }
}

impl ParamTable {
    pub fn new(sync: Arc<dyn RegionSync>) -> Self {
        Self {
            region: ParameterRegion::default(),
            delta: DeltaMask::default(),
            sync,
        }
    }

    /// The accumulated device-global delta.
    pub fn delta(&self) -> &DeltaMask {
        &self.delta
    }

    /// Read-only access to the region content.
    pub fn region(&self) -> &ParameterRegion {
        &self.region
    }

    pub fn write_control(&mut self, id: ParamBlockId, value: ControlParam) {
        self.region.set_control(id, value);
        self.delta.set(id);
    }

    pub fn write_otf_input(&mut self, id: ParamBlockId, value: OtfInputParam) {
        self.region.set_otf_input(id, value);
        self.delta.set(id);
    }

    pub fn write_otf_output(&mut self, id: ParamBlockId, value: OtfOutputParam) {
        self.region.set_otf_output(id, value);
        self.delta.set(id);
    }

    pub fn write_dma_output(&mut self, id: ParamBlockId, value: DmaOutputParam) {
        self.region.set_dma_output(id, value);
        self.delta.set(id);
    }

    pub fn write_effect(&mut self, id: ParamBlockId, value: EffectParam) {
        self.region.set_effect(id, value);
        self.delta.set(id);
    }

    /// Drop a block from the accumulated delta, used by tap stop sequences.
    pub fn retire(&mut self, id: ParamBlockId) {
        self.delta.unset(id);
    }

    /// Take the accumulated delta, leaving the table's mask empty.
    ///
    /// Callers that fail to deliver the mask downstream must hand it back
    /// via [`ParamTable::restore`] so a retry resends exactly the
    /// unflushed blocks.
    pub fn take_delta(&mut self) -> DeltaMask {
        std::mem::take(&mut self.delta)
    }

    /// Merge an undelivered delta back after a failed flush.
    pub fn restore(&mut self, delta: DeltaMask) {
        self.delta.merge(&delta);
    }

    /// CPU→device flush of every block named by `mask`.
    pub fn flush_blocks(&self, mask: &DeltaMask) {
        for id in mask.ids() {
            self.sync.flush(ParameterRegion::byte_range(id));
        }
    }

    /// Device→CPU invalidate for a block the engine has written.
    pub fn invalidate_block(&self, id: ParamBlockId) {
        self.sync.invalidate(ParameterRegion::byte_range(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{CropRect, PixelSize};

    #[test]
    fn writes_accumulate_delta() {
        let mut table = ParamTable::default();
        table.write_control(ParamBlockId::BayerControl, ControlParam::enabled());
        table.write_dma_output(
            ParamBlockId::BayerRawOutput,
            DmaOutputParam::enabled(PixelSize::new(64, 48)),
        );
        assert_eq!(table.delta().block_count(), 2);

        let taken = table.take_delta();
        assert!(table.delta().is_empty());
        assert_eq!(taken.block_count(), 2);
    }

    #[test]
    fn restore_merges_failed_flush_back() {
        let mut table = ParamTable::default();
        table.write_control(ParamBlockId::ScpControl, ControlParam::enabled());
        let taken = table.take_delta();
        table.write_control(ParamBlockId::FdControl, ControlParam::enabled());
        table.restore(taken);
        assert!(table.delta().contains(ParamBlockId::ScpControl));
        assert!(table.delta().contains(ParamBlockId::FdControl));
    }

    #[test]
    fn region_round_trips_typed_views() {
        let mut region = ParameterRegion::default();
        let input = OtfInputParam::enabled(
            PixelSize::new(2560, 1920),
            CropRect::new(2, 4, 2556, 1912),
        );
        region.set_otf_input(ParamBlockId::IspOtfInput, input);
        assert_eq!(region.otf_input(ParamBlockId::IspOtfInput), input);
    }

    #[test]
    fn block_byte_ranges_do_not_overlap() {
        let a = ParameterRegion::byte_range(ParamBlockId::GlobalShotMode);
        let b = ParameterRegion::byte_range(ParamBlockId::SensorControl);
        assert_eq!(a.end, b.start);
    }
}
