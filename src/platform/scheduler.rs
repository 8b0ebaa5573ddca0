//! Timer scheduling for the single-threaded protocol context.
//!
//! All waits in the core are expressed as scheduled callbacks: the MRP
//! retry deadline, the standalone-ack delay window and the ICD
//! active-duration timer. A timer carries an owned [`TimerEvent`] value
//! rather than a closure over raw context pointers, so cancellation
//! races cannot dangle: a cancelled handle simply never fires.
//!
//! [`TimerQueue`] is the in-crate implementation with a virtual clock.
//! Production drives it from real time (see [`super::driver`]); tests
//! advance it manually for deterministic timer interleavings.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::exchange::ExchangeKey;

/// Events delivered when a timer fires.
///
/// The composition root maps each event back to the component that
/// armed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// An MRP retransmit deadline for the given exchange
    MrpRetry(ExchangeKey),
    /// The standalone-ack delay window for the given exchange elapsed
    AckDelay(ExchangeKey),
    /// The ICD active-mode duration elapsed
    IcdActiveExpired,
}

/// Cancellation handle returned by [`Scheduler::schedule_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Scheduler consumed by the protocol core.
///
/// Implementations serialize timer delivery with message processing on
/// one logical context; nothing here is thread-safe by design.
pub trait Scheduler {
    /// Current time on this scheduler's clock
    fn now(&self) -> Instant;

    /// Arm a timer that delivers `event` at `deadline`
    fn schedule_at(&mut self, deadline: Instant, event: TimerEvent) -> TimerHandle;

    /// Cancel a previously armed timer.
    ///
    /// Idempotent: cancelling an already-cancelled or already-fired
    /// handle is a no-op. Returns whether a live timer was cancelled.
    fn cancel(&mut self, handle: TimerHandle) -> bool;
}

/// Binary-heap timer queue with a virtual clock.
#[derive(Debug)]
pub struct TimerQueue {
    now: Instant,
    next_id: u64,
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    live: HashMap<u64, TimerEvent>,
}

impl TimerQueue {
    /// Create a queue whose clock starts at `now`
    pub fn new(now: Instant) -> Self {
        Self {
            now,
            next_id: 0,
            heap: BinaryHeap::new(),
            live: HashMap::new(),
        }
    }

    /// Arm a timer `delay` from the current clock
    pub fn schedule_after(&mut self, delay: Duration, event: TimerEvent) -> TimerHandle {
        let deadline = self.now + delay;
        self.schedule_at(deadline, event)
    }

    /// Earliest live deadline, if any
    pub fn next_deadline(&mut self) -> Option<Instant> {
        // Discard cancelled entries lazily
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.live.contains_key(&id) {
                return Some(deadline);
            }
            let _ = self.heap.pop();
        }
        None
    }

    /// Advance the clock to `to` and collect every event whose deadline
    /// has passed, in deadline order.
    pub fn advance_to(&mut self, to: Instant) -> Vec<TimerEvent> {
        if to > self.now {
            self.now = to;
        }
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > self.now {
                break;
            }
            let _ = self.heap.pop();
            if let Some(event) = self.live.remove(&id) {
                fired.push(event);
            }
        }
        fired
    }

    /// Number of live timers
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no timers are armed
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl Scheduler for TimerQueue {
    fn now(&self) -> Instant {
        self.now
    }

    fn schedule_at(&mut self, deadline: Instant, event: TimerEvent) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.live.insert(id, event);
        TimerHandle(id)
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.live.remove(&handle.0).is_some()
    }
}
