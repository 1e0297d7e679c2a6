//! Frame descriptors and the request/processing queues that carry them.
//!
//! A [`Frame`] is one in-flight unit of work crossing the whole group
//! chain. The [`FramePool`] plays the buffer-manager role: frames move
//! free → request → processing → free, and frames whose shot dispatch
//! failed are parked for reclamation instead of being silently dropped.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::geometry::{CropRect, PixelSize};
use crate::ids::{GroupSlot, TAP_COUNT, TapId};
use crate::params::{DeltaMask, SetfileWord};

/// One-time shot-buffer mapping state, recorded at frame creation.
///
/// Replaces a manual "first pass" flag: a frame starts `Unmapped`, the
/// first group pass maps it into the engine's address space, and later
/// passes skip the mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShotMapState {
    #[default]
    Unmapped,
    Mapped,
}

/// Per-tap request carried in a frame's metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TapRequest {
    /// Whether the tap should produce output for this frame.
    pub enabled: bool,
    /// Requested output size.
    pub size: PixelSize,
    /// Requested output crop within the owning stage.
    pub crop: CropRect,
}

/// An in-flight unit of work crossing the group chain.
///
/// # Example
/// ```rust
/// use acheron_core::prelude::*;
///
/// let mut frame = Frame::new();
/// frame.set_request(TapId::ScalePreview, PixelSize::new(1280, 720));
/// assert!(frame.wants_stabilizer());
/// ```
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing frame count, stamped at submission.
    pub count: u64,
    /// One-time shot-map state.
    pub map_state: ShotMapState,
    /// Per-tap request flags and requested geometry.
    pub requests: [TapRequest; TAP_COUNT],
    /// Device-visible destination addresses per tap.
    pub addresses: [u32; TAP_COUNT],
    /// Which taps produced output for this frame.
    pub output_flags: u32,
    /// Changed-block snapshot applied with this frame's shot.
    pub delta: DeltaMask,
    /// Groups that have issued a shot for this frame.
    pub groups_requested: u8,
    /// Optional scene-preset swap requested with this frame.
    pub setfile: Option<SetfileWord>,
    /// Device address of the frame's payload buffer.
    pub buffer_addr: u32,
    /// Device address of the frame's shot metadata.
    pub shot_addr: u32,
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame {
    pub fn new() -> Self {
        Self {
            count: 0,
            map_state: ShotMapState::Unmapped,
            requests: [TapRequest::default(); TAP_COUNT],
            addresses: [0; TAP_COUNT],
            output_flags: 0,
            delta: DeltaMask::default(),
            groups_requested: 0,
            setfile: None,
            buffer_addr: 0,
            shot_addr: 0,
        }
    }

    pub fn request(&self, tap: TapId) -> &TapRequest {
        &self.requests[tap.index()]
    }

    /// Enable a tap request with a full-size crop.
    pub fn set_request(&mut self, tap: TapId, size: PixelSize) {
        self.requests[tap.index()] = TapRequest {
            enabled: true,
            size,
            crop: CropRect::full(size),
        };
    }

    /// Clear a tap's request for this frame only (drop policy).
    pub fn clear_request(&mut self, tap: TapId) {
        self.requests[tap.index()].enabled = false;
        self.addresses[tap.index()] = 0;
    }

    /// Record a produced output for the tap.
    pub fn mark_output(&mut self, tap: TapId) {
        self.output_flags |= tap.bit();
    }

    pub fn has_output(&self, tap: TapId) -> bool {
        self.output_flags & tap.bit() != 0
    }

    /// Mark that `group` issued a shot for this frame.
    pub fn mark_group(&mut self, group: GroupSlot) {
        self.groups_requested |= group.bit();
    }

    pub fn group_requested(&self, group: GroupSlot) -> bool {
        self.groups_requested & group.bit() != 0
    }

    /// Whether the stabilizer group participates for this frame.
    pub fn wants_stabilizer(&self) -> bool {
        self.request(TapId::ScalePreview).enabled || self.request(TapId::DistortionOut).enabled
    }

    /// Reset per-shot state when the frame returns to the free queue.
    ///
    /// The shot-map state survives reuse; mapping is once per frame
    /// lifetime, not once per pass.
    pub fn reset_for_reuse(&mut self) {
        self.requests = [TapRequest::default(); TAP_COUNT];
        self.addresses = [0; TAP_COUNT];
        self.output_flags = 0;
        self.delta.clear();
        self.groups_requested = 0;
        self.setfile = None;
    }
}

/// Frame queues in the buffer-manager role.
///
/// The lock is short-held: acquire/submit/head transitions only, never
/// across a hardware dispatch.
///
/// # Example
/// ```rust
/// use acheron_core::prelude::*;
///
/// let pool = FramePool::with_capacity(4);
/// let frame = pool.acquire().unwrap();
/// let count = pool.submit(frame);
/// assert_eq!(pool.request_head(), Some(count));
/// ```
pub struct FramePool {
    state: Mutex<PoolState>,
}

struct PoolState {
    free: VecDeque<Frame>,
    request: VecDeque<Frame>,
    processing: VecDeque<Frame>,
    parked: VecDeque<Frame>,
    next_count: u64,
}

impl FramePool {
    /// Create a pool holding `capacity` preallocated frames.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut free = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            free.push_back(Frame::new());
        }
        Self {
            state: Mutex::new(PoolState {
                free,
                request: VecDeque::new(),
                processing: VecDeque::new(),
                parked: VecDeque::new(),
                next_count: 1,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // Frame bookkeeping must stay consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a free frame for the caller to fill with requests.
    pub fn acquire(&self) -> Option<Frame> {
        self.lock().free.pop_front()
    }

    /// Stamp the frame count and enqueue the frame for the chain.
    pub fn submit(&self, mut frame: Frame) -> u64 {
        let mut state = self.lock();
        frame.count = state.next_count;
        state.next_count += 1;
        let count = frame.count;
        state.request.push_back(frame);
        count
    }

    /// Frame count at the head of the request queue.
    pub fn request_head(&self) -> Option<u64> {
        self.lock().request.front().map(|f| f.count)
    }

    /// Dequeue the request head.
    pub fn take_request_head(&self) -> Option<Frame> {
        self.lock().request.pop_front()
    }

    /// Re-enqueue a frame for its next group pass, keeping its count.
    pub fn resubmit(&self, frame: Frame) {
        self.lock().request.push_back(frame);
    }

    /// Record a dispatched frame in the processing queue.
    pub fn begin_processing(&self, frame: Frame) {
        self.lock().processing.push_back(frame);
    }

    /// Remove a completed frame from the processing queue by count.
    pub fn complete(&self, count: u64) -> Option<Frame> {
        let mut state = self.lock();
        let index = state.processing.iter().position(|f| f.count == count)?;
        state.processing.remove(index)
    }

    /// Park a frame whose shot was skipped, pending reclamation.
    pub fn park(&self, frame: Frame) {
        self.lock().parked.push_back(frame);
    }

    /// Reclaim one parked frame back to the free queue.
    pub fn reclaim_parked(&self) -> Option<u64> {
        let mut state = self.lock();
        let mut frame = state.parked.pop_front()?;
        let count = frame.count;
        frame.reset_for_reuse();
        state.free.push_back(frame);
        Some(count)
    }

    /// Return a finished frame to the free queue.
    pub fn release(&self, mut frame: Frame) {
        frame.reset_for_reuse();
        self.lock().free.push_back(frame);
    }

    pub fn free_len(&self) -> usize {
        self.lock().free.len()
    }

    pub fn request_len(&self) -> usize {
        self.lock().request.len()
    }

    pub fn processing_len(&self) -> usize {
        self.lock().processing.len()
    }

    pub fn parked_len(&self) -> usize {
        self.lock().parked.len()
    }
}

/// Destination buffer for one capture tap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapBuffer {
    /// Caller-side buffer index.
    pub index: u32,
    /// Device-visible address.
    pub address: u32,
}

/// Pending destination buffers for one tap.
///
/// An empty queue at tag time means the tap is dropped for that frame —
/// a policy, not an error.
#[derive(Default)]
pub struct TapQueue {
    state: Mutex<TapQueueState>,
}

#[derive(Default)]
struct TapQueueState {
    pending: VecDeque<TapBuffer>,
    in_flight: VecDeque<TapBuffer>,
}

impl TapQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, TapQueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a destination buffer.
    pub fn push(&self, buffer: TapBuffer) {
        self.lock().pending.push_back(buffer);
    }

    /// Take the oldest pending buffer and track it in flight.
    pub fn pop_pending(&self) -> Option<TapBuffer> {
        let mut state = self.lock();
        let buffer = state.pending.pop_front()?;
        state.in_flight.push_back(buffer);
        Some(buffer)
    }

    /// Retire an in-flight buffer once its frame completed.
    pub fn finish(&self, index: u32) -> Option<TapBuffer> {
        let mut state = self.lock();
        let pos = state.in_flight.iter().position(|b| b.index == index)?;
        state.in_flight.remove(pos)
    }

    /// Retire the oldest in-flight buffer; in-flight order matches frame
    /// order.
    pub fn finish_front(&self) -> Option<TapBuffer> {
        self.lock().in_flight.pop_front()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Drop all queued buffers, as done when the tap closes.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.pending.clear();
        state.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_stamps_monotonic_counts() {
        let pool = FramePool::with_capacity(2);
        let a = pool.submit(pool.acquire().unwrap());
        let b = pool.submit(pool.acquire().unwrap());
        assert!(b > a);
    }

    #[test]
    fn processing_complete_round_trip() {
        let pool = FramePool::with_capacity(1);
        let count = pool.submit(pool.acquire().unwrap());
        let frame = pool.take_request_head().unwrap();
        pool.begin_processing(frame);
        let frame = pool.complete(count).unwrap();
        pool.release(frame);
        assert_eq!(pool.free_len(), 1);
        assert_eq!(pool.processing_len(), 0);
    }

    #[test]
    fn parked_frames_are_reclaimable() {
        let pool = FramePool::with_capacity(1);
        let count = pool.submit(pool.acquire().unwrap());
        let frame = pool.take_request_head().unwrap();
        pool.park(frame);
        assert_eq!(pool.parked_len(), 1);
        assert_eq!(pool.reclaim_parked(), Some(count));
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn reuse_clears_requests_but_keeps_map_state() {
        let mut frame = Frame::new();
        frame.map_state = ShotMapState::Mapped;
        frame.set_request(TapId::ColorOut, PixelSize::new(640, 480));
        frame.mark_output(TapId::ColorOut);
        frame.reset_for_reuse();
        assert!(!frame.request(TapId::ColorOut).enabled);
        assert_eq!(frame.output_flags, 0);
        assert_eq!(frame.map_state, ShotMapState::Mapped);
    }

    #[test]
    fn empty_tap_queue_pops_none() {
        let queue = TapQueue::default();
        assert!(queue.pop_pending().is_none());
        queue.push(TapBuffer {
            index: 3,
            address: 0x1000,
        });
        let buf = queue.pop_pending().unwrap();
        assert_eq!(buf.index, 3);
        assert_eq!(queue.finish(3), Some(buf));
    }
}
