//! Reliable Message Protocol engine.
//!
//! Per-exchange retransmission/acknowledgment state machine providing
//! at-least-once delivery over lossy transports.
//!
//! ## State Machine
//!
//! ```text
//!                 reliable send
//!     [Idle] ─────────────────────> [AwaitingAck]
//!        ^                               │   ^
//!        │   last entry acked            │   │ retry timer:
//!        └───────────────────────────────┘   │ attempts < max
//!                                            └──┘
//!     any ──── close() ────> [Closed]
//! ```
//!
//! Every reliable send stores the full encoded frame in the retransmit
//! table. The retry timer walks entries past their deadline:
//! attempts below the cap are resent with a strictly increasing
//! backoff interval; an entry at the cap is removed and surfaced as a
//! delivery failure. A message counter, once assigned, is never
//! reused.
//!
//! Inbound reliable messages set a pending-ack counter which either
//! piggy-backs on the next outbound message or goes out as a
//! standalone acknowledgment once the ack-delay window closes. The
//! peer's acknowledged counter is a monotone high-water mark: stale or
//! never-sent acks are absorbed (and reported to the analytics
//! observer), never trusted to move state backward.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::session::PeerId;

/// Retransmission timing and attempt bounds.
///
/// These are transport-characteristics configuration, not protocol
/// constants: the defaults suit 802.15.4/BLE-class links and are
/// overridden through [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct MrpConfig {
    /// Delay before the first retransmission
    pub initial_retry_interval: Duration,
    /// Multiplier applied to the retry interval after each attempt
    pub backoff_factor: f64,
    /// Retransmissions attempted beyond the original send before the
    /// message is reported as undeliverable
    pub max_attempts: u8,
    /// How long an inbound reliable message may wait for a
    /// piggy-backing opportunity before a standalone ack is emitted
    pub ack_delay: Duration,
}

impl Default for MrpConfig {
    fn default() -> Self {
        Self {
            initial_retry_interval: Duration::from_millis(300),
            backoff_factor: 1.6,
            max_attempts: 4,
            ack_delay: Duration::from_millis(200),
        }
    }
}

/// Reliability phase of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityPhase {
    /// No reliable message in flight
    Idle,
    /// One or more reliable messages await acknowledgment
    AwaitingAck,
    /// The exchange is closed; no further sends are accepted
    Closed,
}

/// One in-flight reliable message
#[derive(Debug, Clone)]
pub struct RetransEntry {
    /// Message counter assigned at send time
    pub counter: u32,
    /// Full encoded frame, resent verbatim
    pub frame: Bytes,
    /// Retransmissions performed so far
    pub attempts: u8,
    /// Next retry deadline
    pub deadline: Instant,
    interval: Duration,
}

/// Outcome of processing an inbound reliable message counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveDisposition {
    /// First sighting; dispatch the payload and arrange an ack
    New,
    /// Retransmission of the last-seen counter; re-ack, do not dispatch
    Duplicate,
}

/// Outcome of processing an inbound acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// A pending entry was retired
    Acknowledged,
    /// Already-acknowledged or never-sent counter; absorbed
    Stale,
}

/// Action produced by the retry timer
#[derive(Debug, Clone)]
pub enum RetryAction {
    /// Resend the stored frame
    Retransmit {
        /// Counter of the message being resent
        counter: u32,
        /// Frame to put back on the wire
        frame: Bytes,
        /// Retransmissions performed including this one
        attempts: u8,
    },
    /// Attempts exhausted; surface a delivery failure
    Failed {
        /// Counter of the undeliverable message
        counter: u32,
    },
}

/// Reliable-message sub-state of one exchange.
#[derive(Debug)]
pub struct ReliableMessageState {
    config: MrpConfig,
    phase: ReliabilityPhase,
    next_counter: u32,
    last_received: Option<u32>,
    pending_ack: Option<u32>,
    acked_high_water: Option<u32>,
    table: Vec<RetransEntry>,
}

impl ReliableMessageState {
    /// Create the sub-state for a fresh exchange
    pub fn new(config: MrpConfig) -> Self {
        Self {
            config,
            phase: ReliabilityPhase::Idle,
            next_counter: 1,
            last_received: None,
            pending_ack: None,
            acked_high_water: None,
            table: Vec::new(),
        }
    }

    /// Current reliability phase
    pub fn phase(&self) -> ReliabilityPhase {
        self.phase
    }

    /// Timing configuration
    pub fn config(&self) -> &MrpConfig {
        &self.config
    }

    /// Assign the next outbound message counter. Counters advance by
    /// wrapping arithmetic and are never reused within the exchange.
    pub fn next_counter(&mut self) -> u32 {
        let counter = self.next_counter;
        self.next_counter = self.next_counter.wrapping_add(1);
        counter
    }

    /// Record a reliable send: store the frame for retransmission and
    /// return the first retry deadline.
    pub fn record_reliable_send(&mut self, counter: u32, frame: Bytes, now: Instant) -> Instant {
        debug_assert_ne!(self.phase, ReliabilityPhase::Closed, "send on closed exchange");
        let interval = self.config.initial_retry_interval;
        let deadline = now + interval;
        self.table.push(RetransEntry {
            counter,
            frame,
            attempts: 0,
            deadline,
            interval,
        });
        self.phase = ReliabilityPhase::AwaitingAck;
        deadline
    }

    /// Counter waiting to be acknowledged, without consuming it
    pub fn pending_ack(&self) -> Option<u32> {
        self.pending_ack
    }

    /// Consume the pending-ack counter for piggy-backing onto an
    /// outbound message (or a standalone ack).
    pub fn take_pending_ack(&mut self) -> Option<u32> {
        self.pending_ack.take()
    }

    /// Process the counter of an inbound reliable message.
    pub fn on_reliable_received(&mut self, counter: u32) -> ReceiveDisposition {
        if self.last_received == Some(counter) {
            return ReceiveDisposition::Duplicate;
        }
        self.last_received = Some(counter);
        self.pending_ack = Some(counter);
        ReceiveDisposition::New
    }

    /// Process an inbound acknowledged-counter field.
    ///
    /// The acknowledged high-water mark only moves forward; an ack for
    /// an already-acknowledged or never-sent counter changes nothing.
    pub fn on_ack(&mut self, counter: u32) -> AckDisposition {
        let Some(index) = self.table.iter().position(|e| e.counter == counter) else {
            return AckDisposition::Stale;
        };
        self.table.swap_remove(index);
        self.acked_high_water = Some(match self.acked_high_water {
            Some(hw) => hw.max(counter),
            None => counter,
        });
        if self.table.is_empty() && self.phase == ReliabilityPhase::AwaitingAck {
            self.phase = ReliabilityPhase::Idle;
        }
        AckDisposition::Acknowledged
    }

    /// Highest counter the peer has acknowledged
    pub fn acked_high_water(&self) -> Option<u32> {
        self.acked_high_water
    }

    /// Earliest retry deadline across in-flight entries
    pub fn next_retry_deadline(&self) -> Option<Instant> {
        self.table.iter().map(|e| e.deadline).min()
    }

    /// Number of in-flight reliable messages
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    /// Walk entries past their deadline: resend those below the
    /// attempt cap with an increased backoff interval, fail the rest.
    pub fn on_retry_timer(&mut self, now: Instant) -> Vec<RetryAction> {
        let mut actions = Vec::new();
        let max_attempts = self.config.max_attempts;
        let backoff = self.config.backoff_factor;

        self.table.retain_mut(|entry| {
            if entry.deadline > now {
                return true;
            }
            if entry.attempts < max_attempts {
                entry.attempts += 1;
                entry.interval = entry.interval.mul_f64(backoff);
                entry.deadline = now + entry.interval;
                actions.push(RetryAction::Retransmit {
                    counter: entry.counter,
                    frame: entry.frame.clone(),
                    attempts: entry.attempts,
                });
                true
            } else {
                actions.push(RetryAction::Failed {
                    counter: entry.counter,
                });
                false
            }
        });

        if self.table.is_empty() && self.phase == ReliabilityPhase::AwaitingAck {
            self.phase = ReliabilityPhase::Idle;
        }
        actions
    }

    /// Close the exchange's reliability state: the retransmit table is
    /// dropped and further sends are rejected by debug assertion.
    pub fn close(&mut self) {
        self.table.clear();
        self.phase = ReliabilityPhase::Closed;
    }
}

/// Kind of a reliability event reported to the analytics observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrpEventKind {
    /// A reliable message was sent for the first time
    MessageSent,
    /// A stored frame was retransmitted
    Retransmitted,
    /// A pending entry was acknowledged
    AckReceived,
    /// A stale or never-sent counter was acknowledged (anomalous)
    StaleAck,
    /// Retransmission attempts were exhausted
    DeliveryFailed,
}

/// One reliability event, with enough identity for per-peer
/// diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct MrpEvent {
    /// Peer (and fabric) the exchange talks to
    pub peer: PeerId,
    /// What happened
    pub kind: MrpEventKind,
    /// Message counter involved
    pub counter: u32,
}

/// Optional observer for reliability diagnostics.
///
/// Reporting must never affect protocol correctness: the engine
/// behaves identically whether an observer is attached or not.
pub trait MrpAnalyticsDelegate {
    /// Called on every send, retransmit, ack and terminal failure
    fn on_mrp_event(&mut self, event: MrpEvent);
}
