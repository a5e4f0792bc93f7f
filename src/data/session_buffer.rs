//! Per-session sample queue with overflow policy.
//!
//! The device read path calls [`SessionBuffer::push`] once per sample for
//! every Running session. That call only takes a short mutex and never waits
//! on the client, so a slow consumer can never stall the producer.
//!
//! # Policy
//!
//! - **downsampling = true**: when the queue is full, every other queued
//!   sample is discarded (always keeping the newest) before the new one is
//!   appended. Delivery stays chronological and nothing is fabricated.
//! - **downsampling = false**: the queue holds at most `capacity` samples.
//!   Further samples are rejected and counted; the count is surfaced to the
//!   client as an overflow marker on the data channel and through the
//!   session's error state.
//!
//! A buffer can also be suspended (device lost) or closed (session
//! released); pushes are refused in both states.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Buffering knobs of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    /// Maximum queued samples
    pub capacity: usize,
    /// Decimate instead of rejecting when full
    pub downsampling: bool,
    /// Minimum time between deliveries; zero delivers as soon as possible
    pub interval: Duration,
}

impl BufferPolicy {
    /// Policy with `capacity` raised to at least 1.
    pub fn new(capacity: usize, downsampling: bool, interval_ms: u32) -> Self {
        Self {
            capacity: capacity.max(1),
            downsampling,
            interval: Duration::from_millis(u64::from(interval_ms)),
        }
    }
}

/// Result of a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended with room to spare
    Queued,
    /// Queue was full; `dropped` older samples were discarded to make room
    Downsampled { dropped: usize },
    /// Queue was full and downsampling is off; the sample was rejected
    Overflow,
    /// Buffer is suspended or closed
    Refused,
}

/// What the delivery task should write next.
#[derive(Debug, Default)]
pub struct Drained {
    /// Queued samples, oldest first
    pub frames: Vec<Bytes>,
    /// Samples rejected since the previous drain
    pub overflow: Option<u32>,
    /// Device was lost since the previous drain
    pub device_lost: bool,
    /// Session was released
    pub closed: bool,
}

impl Drained {
    /// Nothing to write.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.overflow.is_none() && !self.device_lost && !self.closed
    }
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<Bytes>,
    policy: BufferPolicy,
    /// Rejected since the last drain (goes on the wire)
    rejected_since_drain: u32,
    /// Rejected since the client last acknowledged (goes to the error state)
    rejected_unacknowledged: u32,
    suspended: bool,
    device_lost_pending: bool,
    closed: bool,
}

/// Bounded queue between the device read path and one session's data channel.
#[derive(Debug)]
pub struct SessionBuffer {
    frame_size: usize,
    inner: Mutex<Inner>,
    ready: Notify,
}

impl SessionBuffer {
    /// Empty buffer for records of `frame_size` bytes.
    pub fn new(frame_size: usize, policy: BufferPolicy) -> Self {
        Self {
            frame_size,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(policy.capacity.min(4096)),
                policy,
                rejected_since_drain: 0,
                rejected_unacknowledged: 0,
                suspended: false,
                device_lost_pending: false,
                closed: false,
            }),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record size in bytes.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Current policy.
    pub fn policy(&self) -> BufferPolicy {
        self.lock().policy
    }

    /// Replace the policy. Shrinking the capacity below the current fill
    /// level keeps queued samples; the bound applies to later pushes.
    pub fn set_policy(&self, policy: BufferPolicy) {
        self.lock().policy = policy;
    }

    /// Number of queued samples.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no sample is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue one encoded sample. Never blocks on the consumer.
    pub fn push(&self, frame: Bytes) -> PushOutcome {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed || inner.suspended {
                return PushOutcome::Refused;
            }

            if inner.queue.len() < inner.policy.capacity {
                inner.queue.push_back(frame);
                PushOutcome::Queued
            } else if inner.policy.downsampling {
                let capacity = inner.policy.capacity;
                let mut dropped = decimate(&mut inner.queue);
                // Decimation cannot make room in a one-sample queue, or in
                // one left over-full by a shrunken capacity.
                while inner.queue.len() >= capacity {
                    inner.queue.pop_front();
                    dropped += 1;
                }
                inner.queue.push_back(frame);
                PushOutcome::Downsampled { dropped }
            } else {
                inner.rejected_since_drain = inner.rejected_since_drain.saturating_add(1);
                inner.rejected_unacknowledged = inner.rejected_unacknowledged.saturating_add(1);
                PushOutcome::Overflow
            }
        };
        self.ready.notify_one();
        outcome
    }

    /// Take everything that is ready for delivery.
    pub fn drain(&self) -> Drained {
        let mut inner = self.lock();
        let frames = inner.queue.drain(..).collect();
        let overflow = match inner.rejected_since_drain {
            0 => None,
            n => Some(n),
        };
        inner.rejected_since_drain = 0;
        let device_lost = std::mem::take(&mut inner.device_lost_pending);
        Drained {
            frames,
            overflow,
            device_lost,
            closed: inner.closed,
        }
    }

    /// Wait until a push, state change or close happened since the last wait.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    /// Overflow count the client has not yet cleared.
    pub fn unacknowledged_overflow(&self) -> Option<u32> {
        match self.lock().rejected_unacknowledged {
            0 => None,
            n => Some(n),
        }
    }

    /// Clear the overflow count reported through the error state.
    pub fn acknowledge_overflow(&self) {
        self.lock().rejected_unacknowledged = 0;
    }

    /// Stop accepting samples because the device went away.
    pub fn suspend(&self) {
        {
            let mut inner = self.lock();
            inner.suspended = true;
            inner.device_lost_pending = true;
            inner.queue.clear();
        }
        self.ready.notify_one();
    }

    /// Accept samples again after the device came back.
    pub fn resume(&self) {
        let mut inner = self.lock();
        inner.suspended = false;
        inner.device_lost_pending = false;
    }

    /// Whether the device is currently lost.
    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    /// Refuse further pushes and wake the delivery task so it can exit.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_one();
    }

    /// Whether the session was released.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Drop every other sample, counting back from the newest so it survives.
fn decimate(queue: &mut VecDeque<Bytes>) -> usize {
    let before = queue.len();
    let mut position = before;
    queue.retain(|_| {
        position -= 1;
        position % 2 == 0
    });
    before - queue.len()
}
