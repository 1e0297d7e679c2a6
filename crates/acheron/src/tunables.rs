use std::sync::{Mutex, OnceLock};

/// Default bounded retries while waiting for 3A stream readiness.
pub const DEFAULT_GROUP_READY_RETRIES: u32 = 100;
/// Default sleep between readiness polls (milliseconds).
pub const DEFAULT_GROUP_READY_WAIT_MS: u64 = 1;
/// Default bounded retries while waiting for a process stop.
pub const DEFAULT_PROCESS_STOP_RETRIES: u32 = 100;
/// Default sleep between process-stop polls (milliseconds).
pub const DEFAULT_PROCESS_STOP_WAIT_MS: u64 = 1;
/// Default chain-side retries when the engine reports busy on a shot.
pub const DEFAULT_SHOT_BUSY_RETRIES: u32 = 2;
/// Default engine-side retry budget passed with each shot.
pub const DEFAULT_SHOT_RETRY: u32 = 3;
/// Default preallocated frames per device instance.
pub const DEFAULT_FRAME_CAPACITY: usize = 8;
/// Default completion queue depth.
pub const DEFAULT_COMPLETION_DEPTH: usize = 32;

/// Tunables for waits, retries, and queue depths.
///
/// # Example
/// ```rust
/// use acheron::prelude::*;
///
/// set_chain_tunables(ChainTunables {
///     shot_busy_retries: 4,
///     ..ChainTunables::default()
/// });
/// ```
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ChainTunables {
    pub group_ready_retries: u32,
    pub group_ready_wait_ms: u64,
    pub process_stop_retries: u32,
    pub process_stop_wait_ms: u64,
    pub shot_busy_retries: u32,
    pub shot_retry: u32,
    pub frame_capacity: usize,
    pub completion_depth: usize,
}

impl Default for ChainTunables {
    fn default() -> Self {
        Self {
            group_ready_retries: DEFAULT_GROUP_READY_RETRIES,
            group_ready_wait_ms: DEFAULT_GROUP_READY_WAIT_MS,
            process_stop_retries: DEFAULT_PROCESS_STOP_RETRIES,
            process_stop_wait_ms: DEFAULT_PROCESS_STOP_WAIT_MS,
            shot_busy_retries: DEFAULT_SHOT_BUSY_RETRIES,
            shot_retry: DEFAULT_SHOT_RETRY,
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            completion_depth: DEFAULT_COMPLETION_DEPTH,
        }
    }
}

impl ChainTunables {
    fn sanitized(self) -> Self {
        Self {
            group_ready_retries: self.group_ready_retries.max(1),
            group_ready_wait_ms: self.group_ready_wait_ms,
            process_stop_retries: self.process_stop_retries.max(1),
            process_stop_wait_ms: self.process_stop_wait_ms,
            shot_busy_retries: self.shot_busy_retries,
            shot_retry: self.shot_retry,
            frame_capacity: self.frame_capacity.max(1),
            completion_depth: self.completion_depth.max(1),
        }
    }
}

static CHAIN_TUNABLES: OnceLock<Mutex<ChainTunables>> = OnceLock::new();

/// Override chain tunables process-wide.
pub fn set_chain_tunables(tunables: ChainTunables) {
    let lock = CHAIN_TUNABLES.get_or_init(|| Mutex::new(ChainTunables::default()));
    *lock.lock().unwrap_or_else(|e| e.into_inner()) = tunables.sanitized();
}

/// Current chain tunables.
pub fn chain_tunables() -> ChainTunables {
    CHAIN_TUNABLES
        .get()
        .and_then(|lock| lock.lock().ok().map(|t| *t))
        .unwrap_or_default()
}
