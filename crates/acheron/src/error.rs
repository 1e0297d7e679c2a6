use acheron_core::geometry::PixelSize;
use acheron_engine::EngineError;

/// Errors surfaced by the chain controller.
///
/// Lifecycle operations abort on error and leave the pipeline state at its
/// pre-call value; per-frame dispatch errors skip the frame's shot without
/// failing the stream.
///
/// # Example
/// ```rust
/// use acheron::ChainError;
///
/// let err = ChainError::AlreadyOpen;
/// assert_eq!(err.code(), "already_open");
/// assert!(!err.retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// Zero/negative dimension or out-of-bounds crop, rejected before any
    /// hardware write.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// Conflicting bounds-down-scale sizes between the companion bayer
    /// taps.
    #[error("bds size conflict: requested {requested}, companion fixed {fixed}")]
    BdsSizeMismatch {
        requested: PixelSize,
        fixed: PixelSize,
    },
    /// An engine command round-trip failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The frame's shot was skipped; the frame is parked for reclamation.
    #[error("shot for frame {frame} skipped: {reason}")]
    ShotDispatch { frame: u64, reason: &'static str },
    #[error("device already open")]
    AlreadyOpen,
    #[error("device already closed")]
    AlreadyClosed,
    /// Lifecycle precondition not met; no state was mutated.
    #[error("not ready: {0}")]
    NotReady(&'static str),
    /// Queue-head identity mismatch in the callback chain. Unrecoverable:
    /// the affected group stops cleanly instead of halting the process.
    #[error("frame identity mismatch: expected {expected}, queue head {head}")]
    FrameIdentity { expected: u64, head: u64 },
    /// A bounded hardware-status wait ran out of retries.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl ChainError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            ChainError::InvalidGeometry(_) => "invalid_geometry",
            ChainError::BdsSizeMismatch { .. } => "bds_size_mismatch",
            ChainError::Engine(err) => err.code(),
            ChainError::ShotDispatch { .. } => "shot_dispatch",
            ChainError::AlreadyOpen => "already_open",
            ChainError::AlreadyClosed => "already_closed",
            ChainError::NotReady(_) => "not_ready",
            ChainError::FrameIdentity { .. } => "frame_identity",
            ChainError::Timeout(_) => "timeout",
        }
    }

    /// Whether the operation may succeed when retried.
    pub fn retryable(&self) -> bool {
        match self {
            ChainError::Engine(err) => err.retryable(),
            ChainError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Whether the error terminates the affected stream.
    pub fn fatal(&self) -> bool {
        matches!(self, ChainError::FrameIdentity { .. })
    }
}
