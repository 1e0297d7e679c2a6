use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime counters for the chain controller.
///
/// # Example
/// ```rust
/// use acheron_core::metrics::ChainCounters;
///
/// let counters = ChainCounters::default();
/// counters.shot_issued();
/// assert_eq!(counters.snapshot().shots_issued, 1);
/// ```
#[derive(Debug, Default)]
pub struct ChainCounters {
    shots_issued: AtomicU64,
    shots_skipped: AtomicU64,
    shots_retried: AtomicU64,
    taps_dropped: AtomicU64,
    param_flushes: AtomicU64,
    setfile_swaps: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChainCountersSnapshot {
    pub shots_issued: u64,
    pub shots_skipped: u64,
    pub shots_retried: u64,
    pub taps_dropped: u64,
    pub param_flushes: u64,
    pub setfile_swaps: u64,
}

impl ChainCounters {
    pub fn shot_issued(&self) {
        self.shots_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shot_skipped(&self) {
        self.shots_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shot_retried(&self) {
        self.shots_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tap_dropped(&self) {
        self.taps_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn param_flush(&self) {
        self.param_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn setfile_swap(&self) {
        self.setfile_swaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChainCountersSnapshot {
        ChainCountersSnapshot {
            shots_issued: self.shots_issued.load(Ordering::Relaxed),
            shots_skipped: self.shots_skipped.load(Ordering::Relaxed),
            shots_retried: self.shots_retried.load(Ordering::Relaxed),
            taps_dropped: self.taps_dropped.load(Ordering::Relaxed),
            param_flushes: self.param_flushes.load(Ordering::Relaxed),
            setfile_swaps: self.setfile_swaps.load(Ordering::Relaxed),
        }
    }
}
