//! Exchange manager: creation, lookup and inbound routing of
//! exchanges, plus the timers that keep their reliability state
//! moving.
//!
//! The manager is the sole owner of live exchanges. Everything runs on
//! the single protocol-processing context; cancellation is idempotent
//! at every level (timers, exchanges, shutdown).

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use super::{
    DispatchPolicy, Exchange, ExchangeDelegate, ExchangeKey, ExchangeRole,
};
use crate::error::{D2dError, Result};
use crate::message::{MessageFlags, MessageHeader, ProtocolId, SecureChannelMsgType};
use crate::mrp::{
    AckDisposition, MrpAnalyticsDelegate, MrpConfig, MrpEvent, MrpEventKind,
    ReceiveDisposition, ReliableMessageState, RetryAction,
};
use crate::platform::{Scheduler, TimerEvent};
use crate::session::{SessionId, SessionInfo};
use crate::stack::OutboundMessage;

/// Handler for unsolicited messages of a registered (protocol, type).
///
/// When an inbound initiator message matches no live exchange but does
/// match a registration, the manager creates a responder exchange and
/// asks the handler for its delegate.
pub trait UnsolicitedMessageHandler {
    /// Dispatch policy for exchanges created by this handler
    fn dispatch_policy(&self) -> Box<dyn DispatchPolicy>;

    /// Produce the delegate for a newly created responder exchange
    fn on_exchange_created(
        &mut self,
        key: ExchangeKey,
        header: &MessageHeader,
    ) -> Box<dyn ExchangeDelegate>;
}

struct UnsolicitedRegistration {
    protocol: ProtocolId,
    msg_type: Option<u8>,
    handler: Box<dyn UnsolicitedMessageHandler>,
}

/// Owner and router of live exchanges.
pub struct ExchangeManager {
    exchanges: HashMap<ExchangeKey, Exchange>,
    next_exchange_id: u16,
    max_exchanges: usize,
    mrp_config: MrpConfig,
    unsolicited: Vec<UnsolicitedRegistration>,
    analytics: Option<Box<dyn MrpAnalyticsDelegate>>,
    policy_violations: u64,
}

impl ExchangeManager {
    /// Create a manager bounded to `max_exchanges` live exchanges.
    pub fn new(max_exchanges: usize, mrp_config: MrpConfig) -> Self {
        Self {
            exchanges: HashMap::new(),
            next_exchange_id: 1,
            max_exchanges,
            mrp_config,
            unsolicited: Vec::new(),
            analytics: None,
            policy_violations: 0,
        }
    }

    /// Attach the optional reliability analytics observer.
    pub fn set_analytics(&mut self, observer: Box<dyn MrpAnalyticsDelegate>) {
        self.analytics = Some(observer);
    }

    /// Register a handler for unsolicited messages. `msg_type = None`
    /// matches every type of the protocol; a typed registration takes
    /// precedence over an untyped one.
    pub fn register_unsolicited(
        &mut self,
        protocol: ProtocolId,
        msg_type: Option<u8>,
        handler: Box<dyn UnsolicitedMessageHandler>,
    ) {
        self.unsolicited.push(UnsolicitedRegistration {
            protocol,
            msg_type,
            handler,
        });
    }

    /// Number of live exchanges
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    /// Whether no exchange is live
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Messages dropped by the dispatch policy since startup
    pub fn policy_violations(&self) -> u64 {
        self.policy_violations
    }

    /// Whether any exchange still has reliable messages in flight.
    /// Feeds the ICD manager's "qualifying activity pending" check.
    pub fn has_pending_work(&self) -> bool {
        self.exchanges.values().any(|e| e.mrp.in_flight() > 0)
    }

    /// Open a new initiator exchange on `session`.
    pub fn new_exchange(
        &mut self,
        session: &SessionInfo,
        policy: Box<dyn DispatchPolicy>,
        delegate: Box<dyn ExchangeDelegate>,
    ) -> Result<ExchangeKey> {
        if self.exchanges.len() >= self.max_exchanges {
            return Err(D2dError::ResourceExhausted("exchange table"));
        }
        let id = self.allocate_exchange_id(session.id);
        let key = ExchangeKey {
            session: session.id,
            id,
            role: ExchangeRole::Initiator,
        };
        self.exchanges.insert(
            key,
            Exchange {
                key,
                session: *session,
                mrp: ReliableMessageState::new(self.mrp_config),
                policy,
                delegate,
                retry_timer: None,
                ack_timer: None,
            },
        );
        tracing::debug!("Exchange {} opened to {}", key, session.peer);
        Ok(key)
    }

    /// Send a message on an exchange.
    ///
    /// Piggy-backs any pending acknowledgment, stores reliable frames
    /// for retransmission, and returns the assigned message counter.
    pub fn send_message(
        &mut self,
        key: ExchangeKey,
        protocol: ProtocolId,
        msg_type: u8,
        payload: &[u8],
        reliable: bool,
        sched: &mut dyn Scheduler,
        outbox: &mut VecDeque<OutboundMessage>,
    ) -> Result<u32> {
        let exchange = self
            .exchanges
            .get_mut(&key)
            .ok_or(D2dError::ExchangeNotFound)?;

        if reliable && exchange.session.is_group {
            return Err(D2dError::Protocol(
                "reliable send on a group session: multicast is never acknowledged".to_string(),
            ));
        }

        let counter = exchange.mrp.next_counter();
        let mut header = MessageHeader::new(
            exchange.session.peer_wire_id,
            protocol,
            msg_type,
            key.id,
            counter,
        );
        if key.role == ExchangeRole::Initiator {
            header.flags.set(MessageFlags::INITIATOR);
        }
        if exchange.session.is_group {
            header.flags.set(MessageFlags::GROUP);
        }
        if reliable {
            header.flags.set(MessageFlags::RELIABLE);
        }
        if let Some(ack) = exchange.mrp.take_pending_ack() {
            header = header.with_ack(ack);
            if let Some(handle) = exchange.ack_timer.take() {
                sched.cancel(handle);
            }
        }

        let mut buf = header.to_bytes();
        buf.extend_from_slice(payload);
        let frame = Bytes::from(buf);

        if reliable {
            exchange.mrp.record_reliable_send(counter, frame.clone(), sched.now());
            Self::rearm_retry(exchange, sched);
            let peer = exchange.session.peer;
            if let Some(obs) = self.analytics.as_deref_mut() {
                obs.on_mrp_event(MrpEvent {
                    peer,
                    kind: MrpEventKind::MessageSent,
                    counter,
                });
            }
        }

        outbox.push_back(OutboundMessage {
            peer: exchange.session.peer,
            frame,
        });
        Ok(counter)
    }

    /// Route an inbound message to its exchange, creating a responder
    /// exchange for registered unsolicited traffic.
    pub fn on_message_received(
        &mut self,
        session: &SessionInfo,
        header: &MessageHeader,
        payload: &[u8],
        sched: &mut dyn Scheduler,
        outbox: &mut VecDeque<OutboundMessage>,
    ) {
        // The sender's initiator flag maps onto our role space
        let role = if header.is_initiator() {
            ExchangeRole::Responder
        } else {
            ExchangeRole::Initiator
        };
        let key = ExchangeKey {
            session: session.id,
            id: header.exchange_id,
            role,
        };

        if self.exchanges.contains_key(&key) {
            self.process_on_exchange(key, header, payload, sched, outbox);
            return;
        }

        // Only an initiator message may open a conversation on our side
        if header.is_initiator() && self.try_create_unsolicited(key, session, header) {
            self.process_on_exchange(key, header, payload, sched, outbox);
            return;
        }

        tracing::debug!(
            "Dropping message on unknown exchange {} ({} type {:#04x}) from {}",
            key,
            header.protocol,
            header.msg_type,
            session.peer
        );
    }

    /// Retry deadline fired for `key`. A stale key (exchange already
    /// closed) is a no-op.
    pub fn on_retry_timer(
        &mut self,
        key: ExchangeKey,
        sched: &mut dyn Scheduler,
        outbox: &mut VecDeque<OutboundMessage>,
    ) {
        let Some(exchange) = self.exchanges.get_mut(&key) else {
            return;
        };
        exchange.retry_timer = None;
        let peer = exchange.session.peer;

        for action in exchange.mrp.on_retry_timer(sched.now()) {
            match action {
                RetryAction::Retransmit {
                    counter,
                    frame,
                    attempts,
                } => {
                    tracing::debug!(
                        "Retransmitting #{} on {} (attempt {})",
                        counter,
                        key,
                        attempts
                    );
                    outbox.push_back(OutboundMessage { peer, frame });
                    if let Some(obs) = self.analytics.as_deref_mut() {
                        obs.on_mrp_event(MrpEvent {
                            peer,
                            kind: MrpEventKind::Retransmitted,
                            counter,
                        });
                    }
                }
                RetryAction::Failed { counter } => {
                    tracing::warn!("Delivery of #{} on {} failed: attempts exhausted", counter, key);
                    exchange.delegate.on_delivery_failed(key, counter);
                    if let Some(obs) = self.analytics.as_deref_mut() {
                        obs.on_mrp_event(MrpEvent {
                            peer,
                            kind: MrpEventKind::DeliveryFailed,
                            counter,
                        });
                    }
                }
            }
        }
        Self::rearm_retry(exchange, sched);
    }

    /// Ack-delay window closed for `key`: emit a standalone
    /// acknowledgment if one is still pending.
    pub fn on_ack_delay(&mut self, key: ExchangeKey, outbox: &mut VecDeque<OutboundMessage>) {
        let Some(exchange) = self.exchanges.get_mut(&key) else {
            return;
        };
        exchange.ack_timer = None;
        if let Some(ack) = exchange.mrp.take_pending_ack() {
            tracing::debug!("Standalone ack for #{} on {}", ack, key);
            Self::emit_standalone_ack(exchange, ack, outbox);
        }
    }

    /// Close an exchange: flush any pending acknowledgment, cancel its
    /// timers and notify the delegate.
    pub fn close_exchange(
        &mut self,
        key: ExchangeKey,
        sched: &mut dyn Scheduler,
        outbox: &mut VecDeque<OutboundMessage>,
    ) -> Result<()> {
        let mut exchange = self
            .exchanges
            .remove(&key)
            .ok_or(D2dError::ExchangeNotFound)?;
        if let Some(ack) = exchange.mrp.take_pending_ack() {
            Self::emit_standalone_ack(&mut exchange, ack, outbox);
        }
        Self::teardown(&mut exchange, sched);
        tracing::debug!("Exchange {} closed", key);
        Ok(())
    }

    /// A session was evicted: synchronously cancel every exchange
    /// bound to it.
    pub fn on_session_evicted(&mut self, session: SessionId, sched: &mut dyn Scheduler) {
        let keys: Vec<ExchangeKey> = self
            .exchanges
            .keys()
            .filter(|k| k.session == session)
            .copied()
            .collect();
        for key in keys {
            if let Some(mut exchange) = self.exchanges.remove(&key) {
                Self::teardown(&mut exchange, sched);
                tracing::debug!("Exchange {} cancelled by session eviction", key);
            }
        }
    }

    /// Cancel everything. Idempotent.
    pub fn shutdown(&mut self, sched: &mut dyn Scheduler) {
        let keys: Vec<ExchangeKey> = self.exchanges.keys().copied().collect();
        for key in keys {
            if let Some(mut exchange) = self.exchanges.remove(&key) {
                Self::teardown(&mut exchange, sched);
            }
        }
    }

    fn process_on_exchange(
        &mut self,
        key: ExchangeKey,
        header: &MessageHeader,
        payload: &[u8],
        sched: &mut dyn Scheduler,
        outbox: &mut VecDeque<OutboundMessage>,
    ) {
        let Some(exchange) = self.exchanges.get_mut(&key) else {
            return;
        };
        let peer = exchange.session.peer;

        // Security control: a message failing the permission check is
        // dropped and never acknowledged as valid.
        if !exchange.policy.is_permitted(header.protocol, header.msg_type) {
            self.policy_violations += 1;
            tracing::warn!(
                "Policy violation on {}: {} type {:#04x} not permitted by {} policy",
                key,
                header.protocol,
                header.msg_type,
                exchange.policy.name()
            );
            return;
        }

        if let Some(ack) = header.ack_counter {
            match exchange.mrp.on_ack(ack) {
                AckDisposition::Acknowledged => {
                    Self::rearm_retry(exchange, sched);
                    if let Some(obs) = self.analytics.as_deref_mut() {
                        obs.on_mrp_event(MrpEvent {
                            peer,
                            kind: MrpEventKind::AckReceived,
                            counter: ack,
                        });
                    }
                }
                AckDisposition::Stale => {
                    tracing::debug!("Stale ack for #{} on {} absorbed", ack, key);
                    if let Some(obs) = self.analytics.as_deref_mut() {
                        obs.on_mrp_event(MrpEvent {
                            peer,
                            kind: MrpEventKind::StaleAck,
                            counter: ack,
                        });
                    }
                }
            }
        }

        if header.is_reliable() {
            if exchange.session.is_group {
                // Multicast is never acknowledged
                tracing::debug!("Reliable flag on group traffic ignored ({})", key);
            } else {
                match exchange.mrp.on_reliable_received(header.message_counter) {
                    ReceiveDisposition::New => {
                        if exchange.ack_timer.is_none() {
                            let deadline = sched.now() + exchange.mrp.config().ack_delay;
                            exchange.ack_timer =
                                Some(sched.schedule_at(deadline, TimerEvent::AckDelay(key)));
                        }
                    }
                    ReceiveDisposition::Duplicate => {
                        tracing::debug!(
                            "Duplicate #{} on {}: re-acking without dispatch",
                            header.message_counter,
                            key
                        );
                        Self::emit_standalone_ack(exchange, header.message_counter, outbox);
                        return;
                    }
                }
            }
        }

        // Standalone acks carry no payload for the upper layer
        let is_standalone_ack = header.protocol == ProtocolId::SECURE_CHANNEL
            && header.msg_type == SecureChannelMsgType::StandaloneAck.as_byte();
        if !is_standalone_ack {
            exchange.delegate.on_message(key, header, payload);
        }
    }

    fn try_create_unsolicited(
        &mut self,
        key: ExchangeKey,
        session: &SessionInfo,
        header: &MessageHeader,
    ) -> bool {
        let index = self
            .unsolicited
            .iter()
            .position(|r| r.protocol == header.protocol && r.msg_type == Some(header.msg_type))
            .or_else(|| {
                self.unsolicited
                    .iter()
                    .position(|r| r.protocol == header.protocol && r.msg_type.is_none())
            });
        let Some(index) = index else {
            return false;
        };

        let policy = self.unsolicited[index].handler.dispatch_policy();
        if !policy.is_permitted(header.protocol, header.msg_type) {
            self.policy_violations += 1;
            tracing::warn!(
                "Policy violation: unsolicited {} type {:#04x} denied by {} policy",
                header.protocol,
                header.msg_type,
                policy.name()
            );
            return false;
        }
        if self.exchanges.len() >= self.max_exchanges {
            tracing::warn!("Exchange table full: dropping unsolicited message from {}", session.peer);
            return false;
        }

        let delegate = self.unsolicited[index].handler.on_exchange_created(key, header);
        self.exchanges.insert(
            key,
            Exchange {
                key,
                session: *session,
                mrp: ReliableMessageState::new(self.mrp_config),
                policy,
                delegate,
                retry_timer: None,
                ack_timer: None,
            },
        );
        tracing::debug!("Responder exchange {} created for {}", key, session.peer);
        true
    }

    fn allocate_exchange_id(&mut self, session: SessionId) -> u16 {
        loop {
            let candidate = self.next_exchange_id;
            self.next_exchange_id = self.next_exchange_id.wrapping_add(1).max(1);
            let key = ExchangeKey {
                session,
                id: candidate,
                role: ExchangeRole::Initiator,
            };
            if !self.exchanges.contains_key(&key) {
                return candidate;
            }
        }
    }

    fn rearm_retry(exchange: &mut Exchange, sched: &mut dyn Scheduler) {
        if let Some(handle) = exchange.retry_timer.take() {
            sched.cancel(handle);
        }
        if let Some(deadline) = exchange.mrp.next_retry_deadline() {
            exchange.retry_timer =
                Some(sched.schedule_at(deadline, TimerEvent::MrpRetry(exchange.key)));
        }
    }

    fn emit_standalone_ack(
        exchange: &mut Exchange,
        ack: u32,
        outbox: &mut VecDeque<OutboundMessage>,
    ) {
        let counter = exchange.mrp.next_counter();
        let mut header = MessageHeader::new(
            exchange.session.peer_wire_id,
            ProtocolId::SECURE_CHANNEL,
            SecureChannelMsgType::StandaloneAck.as_byte(),
            exchange.key.id,
            counter,
        )
        .with_ack(ack);
        if exchange.key.role == ExchangeRole::Initiator {
            header.flags.set(MessageFlags::INITIATOR);
        }
        outbox.push_back(OutboundMessage {
            peer: exchange.session.peer,
            frame: Bytes::from(header.to_bytes()),
        });
    }

    fn teardown(exchange: &mut Exchange, sched: &mut dyn Scheduler) {
        if let Some(handle) = exchange.retry_timer.take() {
            sched.cancel(handle);
        }
        if let Some(handle) = exchange.ack_timer.take() {
            sched.cancel(handle);
        }
        exchange.mrp.close();
        let key = exchange.key;
        exchange.delegate.on_exchange_closed(key);
    }
}

impl std::fmt::Debug for ExchangeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeManager")
            .field("live", &self.exchanges.len())
            .field("max", &self.max_exchanges)
            .field("policy_violations", &self.policy_violations)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::exchange::{ApplicationPolicy, SessionEstablishmentPolicy};
    use crate::platform::TimerQueue;
    use crate::session::{PeerId, SessionId};

    #[derive(Default)]
    struct Record {
        messages: Vec<(ExchangeKey, u8, Vec<u8>)>,
        failures: Vec<(ExchangeKey, u32)>,
        closed: Vec<ExchangeKey>,
    }

    #[derive(Clone, Default)]
    struct RecordingDelegate(Rc<RefCell<Record>>);

    impl ExchangeDelegate for RecordingDelegate {
        fn on_message(&mut self, key: ExchangeKey, header: &MessageHeader, payload: &[u8]) {
            self.0
                .borrow_mut()
                .messages
                .push((key, header.msg_type, payload.to_vec()));
        }

        fn on_delivery_failed(&mut self, key: ExchangeKey, counter: u32) {
            self.0.borrow_mut().failures.push((key, counter));
        }

        fn on_exchange_closed(&mut self, key: ExchangeKey) {
            self.0.borrow_mut().closed.push(key);
        }
    }

    struct RecordingHandler(Rc<RefCell<Record>>);

    impl UnsolicitedMessageHandler for RecordingHandler {
        fn dispatch_policy(&self) -> Box<dyn DispatchPolicy> {
            Box::new(ApplicationPolicy)
        }

        fn on_exchange_created(
            &mut self,
            _key: ExchangeKey,
            _header: &MessageHeader,
        ) -> Box<dyn ExchangeDelegate> {
            Box::new(RecordingDelegate(self.0.clone()))
        }
    }

    fn session_info() -> SessionInfo {
        SessionInfo {
            id: SessionId::from_parts(0, 0),
            wire_id: 10,
            peer_wire_id: 20,
            peer: PeerId::new(0xBEEF, 1),
            is_group: false,
            ack_timeout: Duration::from_millis(300),
        }
    }

    fn fixture() -> (ExchangeManager, TimerQueue, VecDeque<OutboundMessage>) {
        (
            ExchangeManager::new(4, MrpConfig::default()),
            TimerQueue::new(Instant::now()),
            VecDeque::new(),
        )
    }

    #[test]
    fn test_send_assigns_counters_and_queues_frame() {
        let (mut mgr, mut sched, mut outbox) = fixture();
        let session = session_info();
        let record = Rc::new(RefCell::new(Record::default()));
        let key = mgr
            .new_exchange(
                &session,
                Box::new(ApplicationPolicy),
                Box::new(RecordingDelegate(record)),
            )
            .unwrap();

        let c1 = mgr
            .send_message(key, ProtocolId::INTERACTION_MODEL, 0x02, b"a", false, &mut sched, &mut outbox)
            .unwrap();
        let c2 = mgr
            .send_message(key, ProtocolId::INTERACTION_MODEL, 0x02, b"b", true, &mut sched, &mut outbox)
            .unwrap();

        assert_ne!(c1, c2);
        assert_eq!(outbox.len(), 2);

        let out = outbox.pop_back().unwrap();
        let (header, consumed) = MessageHeader::from_bytes(&out.frame).unwrap();
        assert_eq!(header.session_id, session.peer_wire_id);
        assert!(header.is_reliable());
        assert!(header.is_initiator());
        assert_eq!(&out.frame[consumed..], b"b");

        // Reliable send armed the retry timer
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn test_unsolicited_message_creates_responder_exchange() {
        let (mut mgr, mut sched, mut outbox) = fixture();
        let session = session_info();
        let record = Rc::new(RefCell::new(Record::default()));
        mgr.register_unsolicited(
            ProtocolId::INTERACTION_MODEL,
            None,
            Box::new(RecordingHandler(record.clone())),
        );

        let mut header =
            MessageHeader::new(session.wire_id, ProtocolId::INTERACTION_MODEL, 0x03, 7, 1);
        header.flags.set(MessageFlags::INITIATOR);
        mgr.on_message_received(&session, &header, b"hello", &mut sched, &mut outbox);

        assert_eq!(mgr.len(), 1);
        let record = record.borrow();
        assert_eq!(record.messages.len(), 1);
        let (key, msg_type, payload) = &record.messages[0];
        assert_eq!(key.role, ExchangeRole::Responder);
        assert_eq!(key.id, 7);
        assert_eq!(*msg_type, 0x03);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_unregistered_unsolicited_message_is_dropped() {
        let (mut mgr, mut sched, mut outbox) = fixture();
        let session = session_info();

        let mut header =
            MessageHeader::new(session.wire_id, ProtocolId::INTERACTION_MODEL, 0x03, 7, 1);
        header.flags.set(MessageFlags::INITIATOR);
        mgr.on_message_received(&session, &header, b"x", &mut sched, &mut outbox);

        assert!(mgr.is_empty());
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_policy_violation_drops_without_ack() {
        let (mut mgr, mut sched, mut outbox) = fixture();
        let session = session_info();
        let record = Rc::new(RefCell::new(Record::default()));
        let key = mgr
            .new_exchange(
                &session,
                Box::new(SessionEstablishmentPolicy),
                Box::new(RecordingDelegate(record.clone())),
            )
            .unwrap();

        // Application traffic smuggled into a handshake exchange
        let mut header =
            MessageHeader::new(session.wire_id, ProtocolId::INTERACTION_MODEL, 0x05, key.id, 9);
        header.flags.set(MessageFlags::RELIABLE);
        mgr.on_message_received(&session, &header, b"evil", &mut sched, &mut outbox);

        assert_eq!(mgr.policy_violations(), 1);
        assert!(record.borrow().messages.is_empty());
        // Never acknowledged as valid: no ack timer, no outbound frame
        assert!(outbox.is_empty());
        assert_eq!(sched.len(), 0);
    }

    #[test]
    fn test_reliable_receive_acks_after_delay_window() {
        let (mut mgr, mut sched, mut outbox) = fixture();
        let session = session_info();
        let record = Rc::new(RefCell::new(Record::default()));
        let key = mgr
            .new_exchange(
                &session,
                Box::new(ApplicationPolicy),
                Box::new(RecordingDelegate(record)),
            )
            .unwrap();

        let mut header =
            MessageHeader::new(session.wire_id, ProtocolId::INTERACTION_MODEL, 0x01, key.id, 41);
        header.flags.set(MessageFlags::RELIABLE);
        mgr.on_message_received(&session, &header, b"req", &mut sched, &mut outbox);

        // No immediate ack: the window waits for piggy-backing
        assert!(outbox.is_empty());
        let fired = sched.advance_to(sched.now() + Duration::from_millis(250));
        assert_eq!(fired, vec![TimerEvent::AckDelay(key)]);
        mgr.on_ack_delay(key, &mut outbox);

        let out = outbox.pop_front().unwrap();
        let (ack_header, _) = MessageHeader::from_bytes(&out.frame).unwrap();
        assert_eq!(
            ack_header.msg_type,
            SecureChannelMsgType::StandaloneAck.as_byte()
        );
        assert_eq!(ack_header.ack_counter, Some(41));
        assert!(!ack_header.is_reliable());
    }

    #[test]
    fn test_outbound_send_piggybacks_pending_ack() {
        let (mut mgr, mut sched, mut outbox) = fixture();
        let session = session_info();
        let record = Rc::new(RefCell::new(Record::default()));
        let key = mgr
            .new_exchange(
                &session,
                Box::new(ApplicationPolicy),
                Box::new(RecordingDelegate(record)),
            )
            .unwrap();

        let mut header =
            MessageHeader::new(session.wire_id, ProtocolId::INTERACTION_MODEL, 0x01, key.id, 77);
        header.flags.set(MessageFlags::RELIABLE);
        mgr.on_message_received(&session, &header, b"req", &mut sched, &mut outbox);

        mgr.send_message(key, ProtocolId::INTERACTION_MODEL, 0x02, b"resp", false, &mut sched, &mut outbox)
            .unwrap();

        let out = outbox.pop_front().unwrap();
        let (resp_header, _) = MessageHeader::from_bytes(&out.frame).unwrap();
        assert_eq!(resp_header.ack_counter, Some(77));

        // The ack-delay timer was cancelled; nothing further fires
        let fired = sched.advance_to(sched.now() + Duration::from_secs(1));
        assert!(fired.is_empty());
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_duplicate_reliable_message_reacked_not_redispatched() {
        let (mut mgr, mut sched, mut outbox) = fixture();
        let session = session_info();
        let record = Rc::new(RefCell::new(Record::default()));
        let key = mgr
            .new_exchange(
                &session,
                Box::new(ApplicationPolicy),
                Box::new(RecordingDelegate(record.clone())),
            )
            .unwrap();

        let mut header =
            MessageHeader::new(session.wire_id, ProtocolId::INTERACTION_MODEL, 0x01, key.id, 5);
        header.flags.set(MessageFlags::RELIABLE);
        mgr.on_message_received(&session, &header, b"once", &mut sched, &mut outbox);
        mgr.on_message_received(&session, &header, b"once", &mut sched, &mut outbox);

        assert_eq!(record.borrow().messages.len(), 1);
        // The duplicate was re-acked immediately
        let out = outbox.pop_front().unwrap();
        let (ack_header, _) = MessageHeader::from_bytes(&out.frame).unwrap();
        assert_eq!(ack_header.ack_counter, Some(5));
    }

    #[test]
    fn test_retry_exhaustion_reports_failure_and_keeps_exchange() {
        let (mut mgr, mut sched, mut outbox) = fixture();
        let session = session_info();
        let record = Rc::new(RefCell::new(Record::default()));
        let key = mgr
            .new_exchange(
                &session,
                Box::new(ApplicationPolicy),
                Box::new(RecordingDelegate(record.clone())),
            )
            .unwrap();

        let counter = mgr
            .send_message(key, ProtocolId::INTERACTION_MODEL, 0x02, b"lost", true, &mut sched, &mut outbox)
            .unwrap();
        outbox.clear();

        let mut retransmissions = 0;
        while let Some(deadline) = sched.next_deadline() {
            for event in sched.advance_to(deadline) {
                if let TimerEvent::MrpRetry(k) = event {
                    mgr.on_retry_timer(k, &mut sched, &mut outbox);
                }
            }
            retransmissions += outbox.len();
            outbox.clear();
        }

        assert_eq!(retransmissions, usize::from(MrpConfig::default().max_attempts));
        assert_eq!(record.borrow().failures, vec![(key, counter)]);
        // The exchange survives the failure
        assert_eq!(mgr.len(), 1);
        assert!(mgr
            .send_message(key, ProtocolId::INTERACTION_MODEL, 0x02, b"again", false, &mut sched, &mut outbox)
            .is_ok());
    }

    #[test]
    fn test_session_eviction_cancels_exchanges() {
        let (mut mgr, mut sched, mut outbox) = fixture();
        let session = session_info();
        let record = Rc::new(RefCell::new(Record::default()));
        let key = mgr
            .new_exchange(
                &session,
                Box::new(ApplicationPolicy),
                Box::new(RecordingDelegate(record.clone())),
            )
            .unwrap();
        mgr.send_message(key, ProtocolId::INTERACTION_MODEL, 0x02, b"x", true, &mut sched, &mut outbox)
            .unwrap();
        assert_eq!(sched.len(), 1);

        mgr.on_session_evicted(session.id, &mut sched);
        assert!(mgr.is_empty());
        assert_eq!(record.borrow().closed, vec![key]);
        // Pending retransmit timer was cancelled
        let fired = sched.advance_to(sched.now() + Duration::from_secs(10));
        assert!(fired.is_empty());

        // Stale timer delivery after eviction is a no-op
        mgr.on_retry_timer(key, &mut sched, &mut outbox);
    }

    #[test]
    fn test_exchange_table_exhaustion() {
        let mut mgr = ExchangeManager::new(1, MrpConfig::default());
        let session = session_info();
        let record = Rc::new(RefCell::new(Record::default()));
        mgr.new_exchange(
            &session,
            Box::new(ApplicationPolicy),
            Box::new(RecordingDelegate(record.clone())),
        )
        .unwrap();

        let err = mgr
            .new_exchange(
                &session,
                Box::new(ApplicationPolicy),
                Box::new(RecordingDelegate(record)),
            )
            .unwrap_err();
        assert!(matches!(err, D2dError::ResourceExhausted("exchange table")));
    }

    #[test]
    fn test_reliable_send_on_group_session_rejected() {
        let (mut mgr, mut sched, mut outbox) = fixture();
        let session = SessionInfo {
            is_group: true,
            ..session_info()
        };
        let record = Rc::new(RefCell::new(Record::default()));
        let key = mgr
            .new_exchange(
                &session,
                Box::new(ApplicationPolicy),
                Box::new(RecordingDelegate(record)),
            )
            .unwrap();

        let err = mgr
            .send_message(key, ProtocolId::INTERACTION_MODEL, 0x02, b"m", true, &mut sched, &mut outbox)
            .unwrap_err();
        assert!(matches!(err, D2dError::Protocol(_)));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (mut mgr, mut sched, mut outbox) = fixture();
        let session = session_info();
        let record = Rc::new(RefCell::new(Record::default()));
        let key = mgr
            .new_exchange(
                &session,
                Box::new(ApplicationPolicy),
                Box::new(RecordingDelegate(record.clone())),
            )
            .unwrap();
        mgr.send_message(key, ProtocolId::INTERACTION_MODEL, 0x02, b"x", true, &mut sched, &mut outbox)
            .unwrap();

        mgr.shutdown(&mut sched);
        mgr.shutdown(&mut sched);
        assert!(mgr.is_empty());
        assert_eq!(record.borrow().closed, vec![key]);
        assert_eq!(sched.len(), 0);
    }

    #[test]
    fn test_close_flushes_pending_ack() {
        let (mut mgr, mut sched, mut outbox) = fixture();
        let session = session_info();
        let record = Rc::new(RefCell::new(Record::default()));
        let key = mgr
            .new_exchange(
                &session,
                Box::new(ApplicationPolicy),
                Box::new(RecordingDelegate(record)),
            )
            .unwrap();

        let mut header =
            MessageHeader::new(session.wire_id, ProtocolId::INTERACTION_MODEL, 0x01, key.id, 13);
        header.flags.set(MessageFlags::RELIABLE);
        mgr.on_message_received(&session, &header, b"req", &mut sched, &mut outbox);

        mgr.close_exchange(key, &mut sched, &mut outbox).unwrap();
        let out = outbox.pop_front().unwrap();
        let (ack_header, _) = MessageHeader::from_bytes(&out.frame).unwrap();
        assert_eq!(ack_header.ack_counter, Some(13));

        // Closing again is an error the caller can observe, not a crash
        assert!(matches!(
            mgr.close_exchange(key, &mut sched, &mut outbox),
            Err(D2dError::ExchangeNotFound)
        ));
    }
}
