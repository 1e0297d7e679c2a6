//! Hardware group clusters and their per-frame tagging pass.
//!
//! A group runs `Idle → Tagging → Dispatched → Idle` per frame; at most one
//! Tagging/Dispatched transition is in flight per group at a time. A
//! queue-head identity violation flips the group into `Faulted`, which
//! terminates its stream cleanly.

use smallvec::SmallVec;
use tracing::warn;

use acheron_core::frame::{Frame, FramePool};
use acheron_core::geometry::{ChainGeometry, PixelSize};
use acheron_core::ids::{GroupSlot, TapId};
use acheron_core::metrics::ChainCounters;
use acheron_core::params::DeltaMask;
use acheron_core::region::ParamTable;

use crate::error::ChainError;
use crate::tap::{CaptureTap, TapState};

/// Per-frame state of one hardware group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GroupState {
    #[default]
    Idle,
    /// Running the tap dispatcher for a frame.
    Tagging,
    /// A non-blocking shot is in flight.
    Dispatched,
    /// Unrecoverable identity violation; the group's stream is dead.
    Faulted,
}

/// One hardware pipeline stage cluster and its owned capture taps.
pub struct Group {
    slot: GroupSlot,
    state: GroupState,
    taps: SmallVec<[CaptureTap; 2]>,
    pool: FramePool,
    inflight: u32,
    opened: bool,
}

impl Group {
    /// Create the group with its owned taps and frame queue.
    ///
    /// Only the first group in the chain preallocates frames; downstream
    /// groups receive frames via resubmission.
    pub fn new(slot: GroupSlot, frame_capacity: usize) -> Self {
        let taps = TapId::ALL
            .iter()
            .filter(|tap| tap.group() == slot)
            .map(|tap| CaptureTap::new(*tap))
            .collect();
        Self {
            slot,
            state: GroupState::Idle,
            taps,
            pool: FramePool::with_capacity(frame_capacity),
            inflight: 0,
            opened: false,
        }
    }

    pub fn slot(&self) -> GroupSlot {
        self.slot
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Frames currently in flight through the engine for this group.
    pub fn inflight(&self) -> u32 {
        self.inflight
    }

    /// The group's frame queues.
    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn tap(&self, id: TapId) -> Option<&CaptureTap> {
        self.taps.iter().find(|tap| tap.id() == id)
    }

    pub fn tap_mut(&mut self, id: TapId) -> Option<&mut CaptureTap> {
        self.taps.iter_mut().find(|tap| tap.id() == id)
    }

    /// Open the group and all owned taps.
    pub fn open(&mut self) {
        if self.opened {
            return;
        }
        for tap in &mut self.taps {
            tap.open();
        }
        self.state = GroupState::Idle;
        self.inflight = 0;
        self.opened = true;
    }

    /// Close the group, its taps, and drop queued buffers.
    pub fn close(&mut self) {
        for tap in &mut self.taps {
            tap.close();
        }
        self.state = GroupState::Idle;
        self.inflight = 0;
        self.opened = false;
    }

    /// Enter the tagging phase; rejects concurrent passes.
    pub fn begin_tagging(&mut self) -> Result<(), ChainError> {
        match self.state {
            GroupState::Idle => {
                self.state = GroupState::Tagging;
                Ok(())
            }
            GroupState::Faulted => Err(ChainError::NotReady("group faulted")),
            _ => Err(ChainError::NotReady("group pass already in flight")),
        }
    }

    /// Run the tap dispatcher across every owned tap for this frame and
    /// merge the per-tap delta contributions.
    ///
    /// A bds conflict between the companion bayer taps drops the offending
    /// tap for this frame; any other tap error aborts the pass.
    pub fn tag_frame(
        &mut self,
        frame: &mut Frame,
        chain: &ChainGeometry,
        params: &mut ParamTable,
        counters: &ChainCounters,
    ) -> Result<DeltaMask, ChainError> {
        let mut merged = DeltaMask::default();
        // A started companion tap has already fixed the bds size.
        let mut bds: Option<PixelSize> = self
            .taps
            .iter()
            .find(|tap| tap.id().companion().is_some() && tap.state() == TapState::Started)
            .map(|tap| tap.size());

        for tap in &mut self.taps {
            match tap.dispatch(frame, chain, params, &mut bds, counters) {
                Ok(delta) => merged.merge(&delta),
                Err(ChainError::BdsSizeMismatch { requested, fixed }) => {
                    warn!(
                        tap = %tap.id(),
                        frame = frame.count,
                        %requested,
                        %fixed,
                        "bds size conflict, tap dropped for frame"
                    );
                    frame.clear_request(tap.id());
                    counters.tap_dropped();
                }
                Err(err) => return Err(err),
            }
        }
        Ok(merged)
    }

    /// Record the shot dispatch; the group stays busy until completion.
    pub fn mark_dispatched(&mut self) {
        self.state = GroupState::Dispatched;
        self.inflight += 1;
    }

    /// Abort a tagging pass that did not dispatch.
    pub fn abort_pass(&mut self) {
        if self.state == GroupState::Tagging {
            self.state = GroupState::Idle;
        }
    }

    /// Completion arrived for this group's in-flight shot.
    pub fn complete_pass(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
        if self.state == GroupState::Dispatched {
            self.state = GroupState::Idle;
        }
    }

    /// Terminal fault; further passes are rejected.
    pub fn fault(&mut self) {
        self.state = GroupState::Faulted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acheron_core::frame::TapBuffer;
    use acheron_core::geometry::CropRect;
    use acheron_core::ids::ChainId;

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

    #[test]
    fn groups_own_their_taps() {
        let bayer = Group::new(GroupSlot::Bayer, 4);
        assert!(bayer.tap(TapId::BayerRaw).is_some());
        assert!(bayer.tap(TapId::BayerProcessed).is_some());
        assert!(bayer.tap(TapId::ScalePreview).is_none());

        let stab = Group::new(GroupSlot::Stabilizer, 0);
        assert!(stab.tap(TapId::ScalePreview).is_some());
        assert!(stab.tap(TapId::DistortionOut).is_some());
    }

    #[test]
    fn only_one_pass_in_flight() {
        let mut group = Group::new(GroupSlot::Isp, 0);
        group.open();
        group.begin_tagging().unwrap();
        let err = group.begin_tagging().unwrap_err();
        assert_eq!(err.code(), "not_ready");
        group.mark_dispatched();
        group.complete_pass();
        group.begin_tagging().unwrap();
    }

    #[test]
    fn bds_conflict_drops_offender_but_keeps_frame() {
        let mut group = Group::new(GroupSlot::Bayer, 1);
        group.open();
        group
            .tap_mut(TapId::BayerRaw)
            .unwrap()
            .queue()
            .push(TapBuffer {
                index: 0,
                address: 0x1000,
            });
        let chain = chain();
        let mut params = ParamTable::default();
        let counters = ChainCounters::default();

        let mut frame = Frame::new();
        frame.set_request(TapId::BayerRaw, PixelSize::new(4096, 3072));
        frame.set_request(TapId::BayerProcessed, PixelSize::new(2048, 1536));

        let delta = group
            .tag_frame(&mut frame, &chain, &mut params, &counters)
            .unwrap();
        assert!(!delta.is_empty());
        assert!(frame.request(TapId::BayerRaw).enabled);
        assert!(!frame.request(TapId::BayerProcessed).enabled);
        assert_eq!(counters.snapshot().taps_dropped, 1);
    }

    #[test]
    fn faulted_group_rejects_passes() {
        let mut group = Group::new(GroupSlot::Bayer, 0);
        group.open();
        group.fault();
        assert!(group.begin_tagging().is_err());
    }
}
