//! Exchange multiplexing for the D2D core.
//!
//! An exchange is one logical conversation (request/response or
//! stream) multiplexed over a session. Each exchange owns a
//! reliable-message sub-state, a dispatch policy deciding which
//! message types may traverse it, and a delegate receiving payloads
//! and delivery failures.
//!
//! ## Inbound routing
//!
//! ```text
//! datagram ──> ExchangeManager::on_message_received
//!                │
//!                ├── matches live (session, exchange id, role)?
//!                │        └── policy check ──> MRP ──> delegate
//!                │
//!                ├── registered unsolicited (protocol, type)?
//!                │        └── create responder exchange ──> dispatch
//!                │
//!                └── otherwise: drop (debug log, duplicate re-ack)
//! ```
//!
//! Exchanges are addressed by value keys; the manager is the only
//! owner. Delegates receive `&mut self` callbacks without a route back
//! into the manager, which makes the reentrancy hazards of shared
//! ownership structurally impossible instead of merely discouraged.

mod manager;
mod policy;

pub use manager::{ExchangeManager, UnsolicitedMessageHandler};
pub use policy::{ApplicationPolicy, DispatchPolicy, SessionEstablishmentPolicy};

use crate::message::MessageHeader;
use crate::mrp::ReliableMessageState;
use crate::platform::TimerHandle;
use crate::session::{SessionId, SessionInfo};

/// Role this node plays on an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeRole {
    /// We opened the exchange
    Initiator,
    /// The peer opened the exchange
    Responder,
}

/// Key addressing one exchange: session handle, per-session exchange
/// id, and our role. Initiator and responder spaces are disjoint, so
/// both peers can use the same numeric id without ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeKey {
    /// Session the exchange is bound to
    pub session: SessionId,
    /// Per-session exchange id
    pub id: u16,
    /// Our role on the exchange
    pub role: ExchangeRole,
}

impl std::fmt::Display for ExchangeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = match self.role {
            ExchangeRole::Initiator => "i",
            ExchangeRole::Responder => "r",
        };
        write!(f, "{}/e{}{}", self.session, self.id, role)
    }
}

/// Upper-layer callbacks for one exchange.
///
/// Callbacks carry no route back into the exchange manager; delegates
/// record what happened and act on it from their own context.
pub trait ExchangeDelegate {
    /// A permitted, non-duplicate payload arrived on the exchange
    fn on_message(&mut self, key: ExchangeKey, header: &MessageHeader, payload: &[u8]);

    /// Retransmission attempts for `counter` were exhausted.
    ///
    /// Terminal for that message only: the exchange itself remains
    /// usable for subsequent traffic.
    fn on_delivery_failed(&mut self, key: ExchangeKey, counter: u32);

    /// The exchange was closed (explicitly, by session eviction, or at
    /// manager shutdown)
    fn on_exchange_closed(&mut self, _key: ExchangeKey) {}
}

/// One live exchange.
pub(crate) struct Exchange {
    pub(crate) key: ExchangeKey,
    /// Session view captured at creation; sessions are immutable for
    /// the fields cached here
    pub(crate) session: SessionInfo,
    pub(crate) mrp: ReliableMessageState,
    pub(crate) policy: Box<dyn DispatchPolicy>,
    pub(crate) delegate: Box<dyn ExchangeDelegate>,
    pub(crate) retry_timer: Option<TimerHandle>,
    pub(crate) ack_timer: Option<TimerHandle>,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("key", &self.key)
            .field("peer", &self.session.peer)
            .field("policy", &self.policy.name())
            .field("in_flight", &self.mrp.in_flight())
            .finish_non_exhaustive()
    }
}
