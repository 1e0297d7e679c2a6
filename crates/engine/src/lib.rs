#![doc = include_str!("../README.md")]

use acheron_core::ids::{GroupSlot, SensorModuleId};
use acheron_core::params::SetfileWord;

pub mod virtual_engine;

/// Errors returned by engine commands.
///
/// `Busy` is the one transient condition: callers may retry the same
/// command. Everything else aborts the lifecycle operation that issued it.
///
/// # Example
/// ```rust
/// use acheron_engine::EngineError;
///
/// let err = EngineError::Busy;
/// assert!(err.retryable());
/// assert_eq!(err.code(), "busy");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine busy, command not accepted")]
    Busy,
    #[error("engine command {cmd} failed with status {status}")]
    CommandFailed { cmd: &'static str, status: i32 },
    #[error("engine timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("engine interface closed")]
    Closed,
    #[error("sensor module {0:#06x} rejected by engine")]
    InvalidModule(u32),
}

impl EngineError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Busy => "busy",
            EngineError::CommandFailed { .. } => "command_failed",
            EngineError::Timeout(_) => "timeout",
            EngineError::Closed => "closed",
            EngineError::InvalidModule(_) => "invalid_module",
        }
    }

    /// Whether the command may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(self, EngineError::Busy)
    }
}

/// Crop margins the engine reports back from `open`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OpenMargins {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// Requested group topology flags passed with `open`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupTopology {
    /// 3A input arrives on the fly from the sensor rather than via DMA.
    pub otf_input: bool,
    /// Offline reprocessing instance (bypasses stabilization).
    pub reprocessing: bool,
}

/// One non-blocking shot dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotRequest {
    pub group: GroupSlot,
    /// Device address of the frame's payload buffer.
    pub buffer_addr: u32,
    /// Device address of the frame's shot metadata.
    pub shot_addr: u32,
    /// Frame count the completion will be keyed by.
    pub frame: u64,
    /// Engine-side retry budget for the dispatch.
    pub retry: u32,
}

/// Synchronous command interface to the processing engine.
///
/// All calls are request/ack except [`EngineCommands::shot_nonblocking`],
/// whose completion arrives asynchronously as a
/// [`ShotCompletion`](acheron_core::queue::ShotCompletion) keyed by frame
/// count.
pub trait EngineCommands: Send + Sync {
    /// Open the engine for a sensor module; returns the margins the engine
    /// wants applied to the sensor output.
    fn open(
        &self,
        module: SensorModuleId,
        topology: GroupTopology,
    ) -> Result<OpenMargins, EngineError>;

    fn close(&self) -> Result<(), EngineError>;

    /// Point the engine at a loaded scene-preset bundle.
    fn apply_setfile(&self, addr: u32, name: &str) -> Result<(), EngineError>;

    /// Announce changed parameter blocks for a group.
    fn set_param(&self, group: GroupSlot, lo: u32, hi: u32, blocks: u32)
    -> Result<(), EngineError>;

    /// Apply previously announced parameters under a setfile selection.
    fn apply_param(&self, group: GroupSlot, setfile: SetfileWord) -> Result<(), EngineError>;

    fn process_on(&self, group: GroupSlot) -> Result<(), EngineError>;

    fn process_off(&self, group: GroupSlot, force: bool) -> Result<(), EngineError>;

    /// Whether the group's processing has come to a stop after
    /// `process_off`. Polled with bounded retries by the caller.
    fn poll_process_stopped(&self, group: GroupSlot) -> bool;

    fn stream_on(&self) -> Result<(), EngineError>;

    fn stream_off(&self) -> Result<(), EngineError>;

    /// Whether the group is ready for streaming. Polled with bounded
    /// retries before `stream_on`.
    fn poll_group_ready(&self, group: GroupSlot) -> bool;

    /// One-time mapping of a frame's shot buffer into the engine's
    /// address space.
    fn map_shot(&self, group: GroupSlot, addr: u32, size: u32) -> Result<(), EngineError>;

    fn unmap_shot(&self, group: GroupSlot) -> Result<(), EngineError>;

    /// Issue a non-blocking shot; completion arrives via the completion
    /// queue.
    fn shot_nonblocking(&self, shot: ShotRequest) -> Result<(), EngineError>;
}

/// Companion-chip firmware loader, driven over a serial bus by rear-facing
/// non-reprocessing instances. Out of scope here beyond the contract.
pub trait CompanionLoader: Send + Sync {
    /// Whether a companion chip is present and answering.
    fn is_valid(&self) -> bool;

    fn load_firmware(&self) -> Result<(), EngineError>;

    fn load_setfiles(&self) -> Result<(), EngineError>;
}

/// Loader used when no companion chip exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompanion;

impl CompanionLoader for NoCompanion {
    fn is_valid(&self) -> bool {
        false
    }

    fn load_firmware(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn load_setfiles(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

pub mod prelude {
    pub use crate::{
        CompanionLoader, EngineCommands, EngineError, GroupTopology, NoCompanion, OpenMargins,
        ShotRequest,
        virtual_engine::{EngineCmd, VirtualEngine},
    };
    pub use acheron_core::prelude::*;
}
