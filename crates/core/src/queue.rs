//! Bounded completion queue feeding engine shot completions back into the
//! chain, so the group cascade can be driven by synthetic completions in
//! tests as easily as by real interrupts.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crossbeam_queue::ArrayQueue;

use crate::ids::GroupSlot;

/// Engine-side status delivered with a shot completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Shot finished normally.
    Done,
    /// Engine reported an error code for the shot.
    Error(u32),
}

/// Asynchronous completion of one non-blocking shot, keyed by frame count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotCompletion {
    pub group: GroupSlot,
    pub frame: u64,
    pub status: CompletionStatus,
}

/// Outcome of pushing into the completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Ok,
    /// Queue is full; the completion was not accepted.
    Full,
    /// Queue was closed by the consumer.
    Closed,
}

/// Bounded multi-producer completion queue.
///
/// # Example
/// ```rust
/// use acheron_core::prelude::*;
///
/// let queue = CompletionQueue::with_capacity(8);
/// queue.push(ShotCompletion {
///     group: GroupSlot::Bayer,
///     frame: 1,
///     status: CompletionStatus::Done,
/// });
/// assert!(queue.pop().is_some());
/// ```
#[derive(Clone)]
pub struct CompletionQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    queue: ArrayQueue<ShotCompletion>,
    closed: AtomicBool,
}

impl CompletionQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queue: ArrayQueue::new(capacity.max(1)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Push a completion without blocking.
    pub fn push(&self, completion: ShotCompletion) -> PushOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        match self.inner.queue.push(completion) {
            Ok(()) => PushOutcome::Ok,
            Err(_) => PushOutcome::Full,
        }
    }

    /// Pop the oldest pending completion, if any.
    pub fn pop(&self) -> Option<ShotCompletion> {
        self.inner.queue.pop()
    }

    /// Close the queue; producers will see [`PushOutcome::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }
}

#[cfg(feature = "async")]
impl CompletionQueue {
    /// Async helper that yields until a completion arrives or the queue
    /// closes and drains.
    pub async fn pop_async(&self) -> Option<ShotCompletion> {
        loop {
            if let Some(completion) = self.pop() {
                return Some(completion);
            }
            if self.is_closed() {
                return None;
            }
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_preserves_order() {
        let queue = CompletionQueue::with_capacity(4);
        for frame in 1..=3 {
            assert_eq!(
                queue.push(ShotCompletion {
                    group: GroupSlot::Isp,
                    frame,
                    status: CompletionStatus::Done,
                }),
                PushOutcome::Ok
            );
        }
        assert_eq!(queue.pop().unwrap().frame, 1);
        assert_eq!(queue.pop().unwrap().frame, 2);
        assert_eq!(queue.pop().unwrap().frame, 3);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn closed_queue_rejects_producers() {
        let queue = CompletionQueue::with_capacity(1);
        queue.close();
        assert_eq!(
            queue.push(ShotCompletion {
                group: GroupSlot::Bayer,
                frame: 1,
                status: CompletionStatus::Done,
            }),
            PushOutcome::Closed
        );
    }
}
