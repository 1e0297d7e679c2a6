//! Frame-synchronous shot dispatch and group chaining.
//!
//! One logical shot crosses the 3A → ISP → stabilizer cascade as a chain
//! of per-group passes: each pass validates the queue head, runs the tap
//! dispatcher, merges the delta mask into the frame, and issues the
//! non-blocking hardware shot. Engine completions pushed into the
//! completion queue drive the next group's pass, so the whole chain can be
//! exercised with synthetic completions.

use std::time::Instant;

use tracing::{debug, error, warn};

use acheron_core::frame::{Frame, ShotMapState};
use acheron_core::ids::GroupSlot;
use acheron_core::queue::{CompletionStatus, ShotCompletion};
use acheron_engine::{EngineError, ShotRequest};

use crate::device::IspChain;
use crate::error::ChainError;
use crate::setfile;
use crate::tunables::chain_tunables;

/// Bytes of per-frame shot metadata flushed to the engine.
pub const SHOT_METADATA_BYTES: u32 = 0x1000;

const SHOT_ADDR_BASE: u32 = 0x4000_0000;
const FRAME_BUFFER_BASE: u32 = 0x6000_0000;

impl IspChain {
    /// Run one group pass for the frame at the head of the group's
    /// request queue.
    ///
    /// On failure anywhere before the dispatch, the frame's shot is
    /// skipped — logged, parked for reclamation, never silently dropped —
    /// and the accumulated delta is restored so a retry resends exactly
    /// the unflushed blocks.
    pub fn shot_ready(&mut self, slot: GroupSlot, expected: u64) -> Result<(), ChainError> {
        if !self.state.open {
            return Err(ChainError::NotReady("device not open"));
        }

        // Queue-head identity: a mismatch is a programming error that
        // terminates this group's stream cleanly.
        let head = self.group(slot).pool().request_head();
        let Some(head) = head else {
            return Err(ChainError::NotReady("no frame queued for group"));
        };
        if head != expected {
            self.group_mut(slot).fault();
            error!(group = %slot, expected, head, "frame identity mismatch");
            return Err(ChainError::FrameIdentity { expected, head });
        }

        self.group_mut(slot).begin_tagging()?;
        let Some(mut frame) = self.group(slot).pool().take_request_head() else {
            self.group_mut(slot).abort_pass();
            return Err(ChainError::NotReady("request queue drained"));
        };

        let tag_start = Instant::now();

        if frame.shot_addr == 0 {
            frame.shot_addr = SHOT_ADDR_BASE + frame.count as u32 * SHOT_METADATA_BYTES;
        }
        if frame.buffer_addr == 0 {
            frame.buffer_addr = FRAME_BUFFER_BASE + frame.count as u32 * SHOT_METADATA_BYTES;
        }

        // Close the device-visible staleness window before dispatch.
        let shot_base = frame.shot_addr as usize;
        self.sync.flush(shot_base..shot_base + SHOT_METADATA_BYTES as usize);

        // One-time mapping of the shot buffer into the engine.
        if frame.map_state == ShotMapState::Unmapped {
            if let Err(err) =
                self.engine
                    .map_shot(slot, frame.shot_addr, SHOT_METADATA_BYTES)
            {
                return self.skip_frame(slot, frame, "shot map failed", err.into());
            }
            frame.map_state = ShotMapState::Mapped;
        }

        // Scene-preset swap requested with this frame.
        if let Some(word) = frame.setfile
            && word != self.active_setfile
        {
            let swap = setfile::swap_setfile(
                self.engine.as_ref(),
                &mut self.params,
                Some(slot),
                word,
                &self.metrics.counters,
            );
            if let Err(err) = swap {
                return self.skip_frame(slot, frame, "setfile swap failed", err);
            }
            self.active_setfile = word;
        }

        // Tap dispatch across every node this group owns.
        let tagged = self.groups[slot.index()].tag_frame(
            &mut frame,
            &self.chain,
            &mut self.params,
            &self.metrics.counters,
        );
        let tag_delta = match tagged {
            Ok(delta) => delta,
            Err(err) => return self.skip_frame(slot, frame, "tap dispatch failed", err),
        };

        // Merge the device-global accumulation plus this pass's writes
        // into the frame and flush the touched blocks to the engine.
        frame.delta.merge(&tag_delta);
        let pending = self.params.take_delta();
        frame.delta.merge(&pending);
        self.params.flush_blocks(&frame.delta);
        self.metrics.counters.param_flush();
        self.metrics.tag.record(tag_start.elapsed());

        self.dispatch(slot, frame)
    }

    /// Issue the non-blocking shot, retrying transient busy responses up
    /// to the tunable budget.
    fn dispatch(&mut self, slot: GroupSlot, mut frame: Frame) -> Result<(), ChainError> {
        let tunables = chain_tunables();
        let dispatch_start = Instant::now();
        let request = ShotRequest {
            group: slot,
            buffer_addr: frame.buffer_addr,
            shot_addr: frame.shot_addr,
            frame: frame.count,
            retry: tunables.shot_retry,
        };

        let mut budget = tunables.shot_busy_retries;
        loop {
            match self.engine.shot_nonblocking(request) {
                Ok(()) => break,
                Err(EngineError::Busy) if budget > 0 => {
                    budget -= 1;
                    self.metrics.counters.shot_retried();
                    debug!(group = %slot, frame = frame.count, budget, "engine busy, retrying shot");
                }
                Err(err) => {
                    return self.skip_frame(slot, frame, "engine rejected shot", err.into());
                }
            }
        }

        frame.mark_group(slot);
        let count = frame.count;
        self.group(slot).pool().begin_processing(frame);
        self.group_mut(slot).mark_dispatched();
        self.metrics.counters.shot_issued();
        self.metrics.dispatch.record(dispatch_start.elapsed());
        debug!(group = %slot, frame = count, "shot dispatched");
        Ok(())
    }

    /// Skip path shared by steps that fail before the dispatch succeeds.
    fn skip_frame(
        &mut self,
        slot: GroupSlot,
        frame: Frame,
        reason: &'static str,
        err: ChainError,
    ) -> Result<(), ChainError> {
        let count = frame.count;
        error!(group = %slot, frame = count, %err, reason, "shot skipped");
        self.metrics.counters.shot_skipped();
        // Leave the delta resendable by a later pass.
        self.params.restore(frame.delta);
        self.group_mut(slot).abort_pass();
        self.group(slot).pool().park(frame);
        Err(ChainError::ShotDispatch {
            frame: count,
            reason,
        })
    }

    /// Handle one engine completion, chaining the frame into the next
    /// group's pass when one is due.
    ///
    /// The stabilizer group only runs when the frame requested a
    /// stabilization tap; otherwise the frame finishes after the ISP pass.
    pub fn on_completion(&mut self, completion: ShotCompletion) -> Result<(), ChainError> {
        let slot = completion.group;
        self.group_mut(slot).complete_pass();

        let Some(frame) = self.group(slot).pool().complete(completion.frame) else {
            warn!(group = %slot, frame = completion.frame, "completion for unknown frame");
            return Ok(());
        };

        if let CompletionStatus::Error(status) = completion.status {
            warn!(group = %slot, frame = frame.count, status, "engine reported shot error");
            self.finish_frame(frame);
            return Ok(());
        }

        let next = slot.next().filter(|next| {
            self.group(*next).is_open()
                && (*next != GroupSlot::Stabilizer || frame.wants_stabilizer())
        });
        match next {
            Some(next) => {
                let count = frame.count;
                self.group(next).pool().resubmit(frame);
                self.shot_ready(next, count)
            }
            None => {
                self.finish_frame(frame);
                Ok(())
            }
        }
    }

    /// Drain the completion queue, driving the group cascade.
    ///
    /// Returns the number of completions handled. Per-frame skip errors
    /// are absorbed (the frame is already parked); fatal errors propagate.
    pub fn pump_completions(&mut self) -> Result<u32, ChainError> {
        let mut handled = 0;
        while let Some(completion) = self.completions.pop() {
            match self.on_completion(completion) {
                Ok(()) => {}
                Err(err) if err.fatal() => return Err(err),
                Err(err) => {
                    debug!(%err, "completion pass skipped a frame");
                }
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Async helper that yields until at least one completion is handled
    /// or the completion queue closes.
    #[cfg(feature = "async")]
    pub async fn pump_completions_async(&mut self) -> Result<u32, ChainError> {
        loop {
            let handled = self.pump_completions()?;
            if handled > 0 {
                return Ok(handled);
            }
            if self.completions.is_closed() {
                return Ok(0);
            }
            tokio::task::yield_now().await;
        }
    }

    fn finish_frame(&mut self, frame: Frame) {
        for tap in acheron_core::ids::TapId::ALL {
            if frame.has_output(tap) {
                if let Some(owner) = self.group(tap.group()).tap(tap) {
                    owner.queue().finish_front();
                }
            }
        }
        debug!(frame = frame.count, outputs = frame.output_flags, "frame finished");
        self.group(GroupSlot::Bayer).pool().release(frame);
    }
}
