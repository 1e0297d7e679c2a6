//! Virtual engine that records commands and lets tests drive completions.

use std::collections::VecDeque;

use parking_lot::Mutex;

use acheron_core::ids::{GroupSlot, SensorModuleId};
use acheron_core::params::SetfileWord;
use acheron_core::queue::{CompletionQueue, CompletionStatus, ShotCompletion};

use crate::{EngineCommands, EngineError, GroupTopology, OpenMargins, ShotRequest};

/// Recorded engine command, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCmd {
    Open { module: u32 },
    Close,
    ApplySetfile { name: String },
    SetParam { group: GroupSlot, lo: u32, hi: u32, blocks: u32 },
    ApplyParam { group: GroupSlot, setfile: SetfileWord },
    ProcessOn { group: GroupSlot },
    ProcessOff { group: GroupSlot, force: bool },
    StreamOn,
    StreamOff,
    MapShot { group: GroupSlot, addr: u32, size: u32 },
    UnmapShot { group: GroupSlot },
    Shot { group: GroupSlot, frame: u64 },
}

#[derive(Default)]
struct VirtualState {
    log: Vec<EngineCmd>,
    pending: VecDeque<(GroupSlot, u64)>,
    busy_shots: u32,
    fail_set_param: bool,
    rejected_module: Option<u32>,
    stalled: [bool; 3],
    running: [bool; 3],
    group_ready: bool,
}

/// In-memory engine double for tests and examples.
///
/// Records every command, queues shots until the test injects their
/// completions, and can simulate busy/failed commands to exercise the
/// chain's error paths.
///
/// # Example
/// ```rust
/// use acheron_engine::prelude::*;
///
/// let completions = CompletionQueue::with_capacity(8);
/// let engine = VirtualEngine::new(completions.clone());
/// engine
///     .shot_nonblocking(ShotRequest {
///         group: GroupSlot::Bayer,
///         buffer_addr: 0x1000,
///         shot_addr: 0x2000,
///         frame: 1,
///         retry: 0,
///     })
///     .unwrap();
/// assert!(engine.complete_next());
/// assert_eq!(completions.pop().unwrap().frame, 1);
/// ```
pub struct VirtualEngine {
    completions: CompletionQueue,
    margins: OpenMargins,
    state: Mutex<VirtualState>,
}

impl VirtualEngine {
    pub fn new(completions: CompletionQueue) -> Self {
        Self {
            completions,
            margins: OpenMargins {
                left: 16,
                right: 16,
                top: 12,
                bottom: 12,
            },
            state: Mutex::new(VirtualState {
                group_ready: true,
                ..VirtualState::default()
            }),
        }
    }

    /// Override the margins reported by `open`.
    pub fn with_margins(mut self, margins: OpenMargins) -> Self {
        self.margins = margins;
        self
    }

    /// Clone of the command log in issue order.
    pub fn commands(&self) -> Vec<EngineCmd> {
        self.state.lock().log.clone()
    }

    /// Number of pending, uncompleted shots.
    pub fn pending_shots(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Complete the oldest pending shot successfully.
    pub fn complete_next(&self) -> bool {
        self.finish_next(CompletionStatus::Done)
    }

    /// Complete the oldest pending shot with an engine error status.
    pub fn fail_next(&self, status: u32) -> bool {
        self.finish_next(CompletionStatus::Error(status))
    }

    fn finish_next(&self, status: CompletionStatus) -> bool {
        let front = self.state.lock().pending.pop_front();
        let Some((group, frame)) = front else {
            return false;
        };
        tracing::trace!(%group, frame, "virtual engine completion");
        self.completions.push(ShotCompletion {
            group,
            frame,
            status,
        });
        true
    }

    /// Make the next `count` shot dispatches return [`EngineError::Busy`].
    pub fn inject_busy(&self, count: u32) {
        self.state.lock().busy_shots = count;
    }

    /// Make the next `set_param` fail permanently.
    pub fn fail_next_set_param(&self) {
        self.state.lock().fail_set_param = true;
    }

    /// Reject a specific sensor module at `open`.
    pub fn reject_module(&self, module: u32) {
        self.state.lock().rejected_module = Some(module);
    }

    /// Keep the group's processing flag stuck, so `poll_process_stopped`
    /// never reports a stop.
    pub fn stall_group(&self, group: GroupSlot) {
        self.state.lock().stalled[group.index()] = true;
    }

    /// Control whether groups report stream readiness.
    pub fn set_group_ready(&self, ready: bool) {
        self.state.lock().group_ready = ready;
    }
}

impl EngineCommands for VirtualEngine {
    fn open(
        &self,
        module: SensorModuleId,
        _topology: GroupTopology,
    ) -> Result<OpenMargins, EngineError> {
        let mut state = self.state.lock();
        if state.rejected_module == Some(module.0) {
            return Err(EngineError::InvalidModule(module.0));
        }
        state.log.push(EngineCmd::Open { module: module.0 });
        Ok(self.margins)
    }

    fn close(&self) -> Result<(), EngineError> {
        self.state.lock().log.push(EngineCmd::Close);
        Ok(())
    }

    fn apply_setfile(&self, _addr: u32, name: &str) -> Result<(), EngineError> {
        self.state.lock().log.push(EngineCmd::ApplySetfile {
            name: name.to_string(),
        });
        Ok(())
    }

    fn set_param(
        &self,
        group: GroupSlot,
        lo: u32,
        hi: u32,
        blocks: u32,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.fail_set_param {
            state.fail_set_param = false;
            return Err(EngineError::CommandFailed {
                cmd: "set_param",
                status: -22,
            });
        }
        state.log.push(EngineCmd::SetParam {
            group,
            lo,
            hi,
            blocks,
        });
        Ok(())
    }

    fn apply_param(&self, group: GroupSlot, setfile: SetfileWord) -> Result<(), EngineError> {
        self.state
            .lock()
            .log
            .push(EngineCmd::ApplyParam { group, setfile });
        Ok(())
    }

    fn process_on(&self, group: GroupSlot) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.running[group.index()] = true;
        state.log.push(EngineCmd::ProcessOn { group });
        Ok(())
    }

    fn process_off(&self, group: GroupSlot, force: bool) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.stalled[group.index()] {
            state.running[group.index()] = false;
        }
        state.log.push(EngineCmd::ProcessOff { group, force });
        Ok(())
    }

    fn poll_process_stopped(&self, group: GroupSlot) -> bool {
        !self.state.lock().running[group.index()]
    }

    fn stream_on(&self) -> Result<(), EngineError> {
        self.state.lock().log.push(EngineCmd::StreamOn);
        Ok(())
    }

    fn stream_off(&self) -> Result<(), EngineError> {
        self.state.lock().log.push(EngineCmd::StreamOff);
        Ok(())
    }

    fn poll_group_ready(&self, _group: GroupSlot) -> bool {
        self.state.lock().group_ready
    }

    fn map_shot(&self, group: GroupSlot, addr: u32, size: u32) -> Result<(), EngineError> {
        self.state
            .lock()
            .log
            .push(EngineCmd::MapShot { group, addr, size });
        Ok(())
    }

    fn unmap_shot(&self, group: GroupSlot) -> Result<(), EngineError> {
        self.state.lock().log.push(EngineCmd::UnmapShot { group });
        Ok(())
    }

    fn shot_nonblocking(&self, shot: ShotRequest) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.busy_shots > 0 {
            state.busy_shots -= 1;
            return Err(EngineError::Busy);
        }
        state.log.push(EngineCmd::Shot {
            group: shot.group,
            frame: shot.frame,
        });
        state.pending.push_back((shot.group, shot.frame));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shot(group: GroupSlot, frame: u64) -> ShotRequest {
        ShotRequest {
            group,
            buffer_addr: 0x1000,
            shot_addr: 0x2000,
            frame,
            retry: 0,
        }
    }

    #[test]
    fn completions_preserve_shot_order() {
        let completions = CompletionQueue::with_capacity(4);
        let engine = VirtualEngine::new(completions.clone());
        engine.shot_nonblocking(shot(GroupSlot::Bayer, 1)).unwrap();
        engine.shot_nonblocking(shot(GroupSlot::Isp, 1)).unwrap();
        assert!(engine.complete_next());
        assert!(engine.complete_next());
        assert_eq!(completions.pop().unwrap().group, GroupSlot::Bayer);
        assert_eq!(completions.pop().unwrap().group, GroupSlot::Isp);
    }

    #[test]
    fn busy_injection_is_consumed() {
        let engine = VirtualEngine::new(CompletionQueue::with_capacity(1));
        engine.inject_busy(1);
        assert_eq!(
            engine.shot_nonblocking(shot(GroupSlot::Bayer, 1)),
            Err(EngineError::Busy)
        );
        assert!(engine.shot_nonblocking(shot(GroupSlot::Bayer, 1)).is_ok());
    }

    #[test]
    fn stalled_group_never_reports_stop() {
        let engine = VirtualEngine::new(CompletionQueue::with_capacity(1));
        engine.process_on(GroupSlot::Isp).unwrap();
        engine.stall_group(GroupSlot::Isp);
        engine.process_off(GroupSlot::Isp, false).unwrap();
        assert!(!engine.poll_process_stopped(GroupSlot::Isp));
    }
}
