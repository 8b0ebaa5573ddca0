//! # D2D Protocol - Device-to-Device Communication Core
//!
//! Session, exchange-multiplexing and liveness-coordination layer for
//! constrained IoT nodes: per-peer conversational state, ordered
//! at-least-once delivery over lossy transports, duty-cycle
//! coordination for battery-powered peers, and change-notification
//! routing toward the reporting engine.
//!
//! ## Features
//!
//! - **Session registry**: four session variants (unauthenticated,
//!   secure, incoming/outgoing group) behind generation-checked
//!   handles
//! - **Exchange multiplexing**: per-conversation routing with a
//!   pluggable message-permission policy per exchange category
//! - **Reliable Message Protocol**: retransmission with configurable
//!   backoff, piggy-backed and standalone acknowledgments, monotone
//!   ack high-water marks
//! - **ICD management**: Idle/Active duty-cycle selection, SIT/LIT
//!   classes, persisted anti-replay Check-In counter
//! - **Change routing**: wildcardable dirty-path forwarding to the
//!   reporting engine
//!
//! ## Architecture
//!
//! ```text
//! Peer A                       Node (CoreStack)
//!    |                              |
//!    |===== datagram =========>  on_datagram
//!    |                              │ session resolve (registry)
//!    |                              │ exchange route + policy check
//!    |                              │ MRP ack/retransmit bookkeeping
//!    |                              v
//!    |                         ExchangeDelegate (application layer)
//!    |                              │
//!    |<==== poll_transmit ====  outbox (acks, sends, retransmits)
//! ```
//!
//! The core runs on one logical processing context: inbound messages,
//! timer callbacks and outbound API calls are serialized, no operation
//! blocks, and every wait is a scheduled timer event. The platform
//! supplies a transport (out of scope), drives [`CoreStack::advance_to`]
//! from its clock (or [`platform::driver`] on tokio) and drains
//! [`CoreStack::poll_transmit`].
//!
//! ## Reliability state machine
//!
//! ```text
//!                  reliable send
//!     [Idle] ─────────────────────> [AwaitingAck]
//!        ^                               │   ^
//!        │   last entry acked /          │   │ retry timer,
//!        │   attempts exhausted          │   │ attempts < max
//!        └───────────────────────────────┘   └──┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use d2d::{Config, CoreStack, MemoryStore, PeerId};
//! use std::time::Instant;
//!
//! let mut stack = CoreStack::new(
//!     &Config::default(),
//!     Box::new(my_report_sink),
//!     Box::new(MemoryStore::new()),
//!     Instant::now(),
//! )?;
//!
//! // Feed inbound traffic and drain outbound frames
//! stack.on_datagram(PeerId::new(0x1234, 1), &datagram)?;
//! while let Some(out) = stack.poll_transmit() {
//!     transport.send(out.peer, &out.frame);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: session variants and the session registry
//! - [`exchange`]: exchange manager and dispatch policies
//! - [`mrp`]: reliable-message retransmission/ack engine
//! - [`icd`]: duty-cycle manager and Check-In counter
//! - [`reporting`]: dirty-path change router
//! - [`message`]: wire header and secure-channel opcodes
//! - [`platform`]: scheduler, storage and tokio driver interfaces
//! - [`config`]: configuration management
//! - [`stack`]: the composition root
//! - [`error`]: error types and result alias

pub mod config;
pub mod error;
pub mod exchange;
pub mod icd;
pub mod message;
pub mod mrp;
pub mod platform;
pub mod reporting;
pub mod session;
pub mod stack;

// Re-exports for convenience
pub use config::Config;
pub use error::{D2dError, Result};
pub use exchange::{
    ApplicationPolicy, DispatchPolicy, ExchangeDelegate, ExchangeKey, ExchangeManager,
    ExchangeRole, SessionEstablishmentPolicy, UnsolicitedMessageHandler,
};
pub use icd::{CheckInCounter, IcdClass, IcdManager, OperationalMode};
pub use message::{MessageFlags, MessageHeader, ProtocolId, SecureChannelMsgType};
pub use mrp::{MrpAnalyticsDelegate, MrpConfig, MrpEvent, MrpEventKind};
pub use platform::{MemoryStore, Scheduler, StateStore, TimerQueue};
pub use reporting::{AttributeId, AttributePath, ChangeRouter, ClusterId, EndpointId, ReportSink};
pub use session::{
    GroupId, PeerId, Session, SessionId, SessionKeys, SessionKind, SessionMaterialProvider,
    SessionRegistry,
};
pub use stack::{CoreStack, OutboundMessage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// D2D Protocol version
pub const PROTOCOL_VERSION: &str = "1.1";
