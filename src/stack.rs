//! The D2D core stack: composition root for one node.
//!
//! [`CoreStack`] owns every component (session registry, exchange
//! manager, ICD mode manager, change router, timer queue, state store
//! and the outbound queue) and wires their interactions. There are no
//! global singletons: a process can run any number of independent
//! stacks, which is what the multi-node integration tests do.
//!
//! ## Data flow
//!
//! ```text
//! inbound datagram ──> on_datagram ──> session resolve ──> exchanges
//!                                            │
//!                                            └──> ICD activity
//!
//! application ──> send_message ──> exchanges ──> outbox ──> poll_transmit
//! data layer  ──> mark_dirty ───> change router ──> reporting engine
//! platform    ──> advance_to ───> timer events ──> exchanges / ICD
//! ```
//!
//! Everything executes on one logical processing context; the stack is
//! deliberately `!Sync` and never blocks.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::Config;
use crate::error::{D2dError, Result};
use crate::exchange::{
    DispatchPolicy, ExchangeDelegate, ExchangeKey, ExchangeManager, UnsolicitedMessageHandler,
};
use crate::icd::{CheckInCounter, IcdManager, OperationalMode};
use crate::message::{MessageHeader, ProtocolId, UNSECURED_SESSION_ID};
use crate::mrp::MrpAnalyticsDelegate;
use crate::platform::{Scheduler, StateStore, TimerEvent, TimerQueue};
use crate::reporting::{AttributePath, ChangeRouter, ReportSink};
use crate::session::{
    GroupId, PeerId, Session, SessionId, SessionMaterialProvider, SessionRegistry,
};

/// One outbound datagram: an encoded frame addressed to a peer.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Destination peer
    pub peer: PeerId,
    /// Encoded header + payload, ready for the transport
    pub frame: Bytes,
}

/// Composition root owning the protocol core of one node.
pub struct CoreStack {
    sessions: SessionRegistry,
    exchanges: ExchangeManager,
    icd: IcdManager,
    router: ChangeRouter,
    checkin: CheckInCounter,
    timers: TimerQueue,
    store: Box<dyn StateStore>,
    outbox: VecDeque<OutboundMessage>,
}

impl CoreStack {
    /// Build a stack from configuration, a reporting sink and the
    /// platform's persistent store. The clock starts at `now`.
    pub fn new(
        config: &Config,
        sink: Box<dyn ReportSink>,
        store: Box<dyn StateStore>,
        now: Instant,
    ) -> Result<Self> {
        Self::with_rng(config, sink, store, now, &mut rand::thread_rng())
    }

    /// Like [`CoreStack::new`] with an injected RNG for the Check-In
    /// counter seed (deterministic tests).
    pub fn with_rng(
        config: &Config,
        sink: Box<dyn ReportSink>,
        mut store: Box<dyn StateStore>,
        now: Instant,
        rng: &mut dyn rand::RngCore,
    ) -> Result<Self> {
        let icd = IcdManager::new(config.icd.to_icd_config(), store.as_ref())?;
        let checkin = CheckInCounter::load_or_init(store.as_mut(), rng)?;
        Ok(Self {
            sessions: SessionRegistry::new(config.tables.max_sessions, config.mrp.ack_timeout()),
            exchanges: ExchangeManager::new(
                config.tables.max_exchanges,
                config.mrp.to_mrp_config(),
            ),
            icd,
            router: ChangeRouter::new(sink),
            checkin,
            timers: TimerQueue::new(now),
            store,
            outbox: VecDeque::new(),
        })
    }

    // === Sessions ===

    /// Create an unauthenticated session toward `peer`.
    pub fn create_unauthenticated_session(&mut self, peer: PeerId) -> Result<SessionId> {
        self.sessions.create_unauthenticated(peer)
    }

    /// Establish a secure session toward `peer`, deriving key material
    /// from the establishment layer's provider. `peer_session_id` is
    /// the wire id the peer allocated for its side.
    pub fn establish_secure_session(
        &mut self,
        peer: PeerId,
        peer_session_id: u16,
        provider: &mut dyn SessionMaterialProvider,
    ) -> Result<SessionId> {
        let keys = provider.session_keys(peer)?;
        self.sessions.create_secure(peer, peer_session_id, keys)
    }

    /// Create an outgoing group session.
    pub fn create_outgoing_group_session(
        &mut self,
        group: GroupId,
        fabric_index: u8,
    ) -> Result<SessionId> {
        self.sessions.create_outgoing_group(group, fabric_index)
    }

    /// Look up a session. Stale handles return `None`.
    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Evict a session, synchronously cancelling every exchange bound
    /// to it.
    pub fn evict_session(&mut self, id: SessionId) -> Result<()> {
        if self.sessions.evict(id).is_none() {
            return Err(D2dError::SessionNotFound);
        }
        self.exchanges.on_session_evicted(id, &mut self.timers);
        Ok(())
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // === Exchanges ===

    /// Open an initiator exchange on `session`.
    pub fn new_exchange(
        &mut self,
        session: SessionId,
        policy: Box<dyn DispatchPolicy>,
        delegate: Box<dyn ExchangeDelegate>,
    ) -> Result<ExchangeKey> {
        let info = self.sessions.info(session).ok_or(D2dError::SessionNotFound)?;
        self.exchanges.new_exchange(&info, policy, delegate)
    }

    /// Register a handler for unsolicited (protocol, type) traffic.
    pub fn register_unsolicited(
        &mut self,
        protocol: ProtocolId,
        msg_type: Option<u8>,
        handler: Box<dyn UnsolicitedMessageHandler>,
    ) {
        self.exchanges.register_unsolicited(protocol, msg_type, handler);
    }

    /// Attach the optional reliability analytics observer.
    pub fn set_mrp_analytics(&mut self, observer: Box<dyn MrpAnalyticsDelegate>) {
        self.exchanges.set_analytics(observer);
    }

    /// Send a message on an exchange. A pending outbound operation is
    /// qualifying ICD activity.
    pub fn send_message(
        &mut self,
        key: ExchangeKey,
        protocol: ProtocolId,
        msg_type: u8,
        payload: &[u8],
        reliable: bool,
    ) -> Result<u32> {
        let counter = self.exchanges.send_message(
            key,
            protocol,
            msg_type,
            payload,
            reliable,
            &mut self.timers,
            &mut self.outbox,
        )?;
        self.icd.on_activity(&mut self.timers);
        Ok(counter)
    }

    /// Close an exchange, flushing any pending acknowledgment.
    pub fn close_exchange(&mut self, key: ExchangeKey) -> Result<()> {
        self.exchanges
            .close_exchange(key, &mut self.timers, &mut self.outbox)
    }

    /// Number of live exchanges
    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }

    /// Messages dropped by dispatch policies since startup
    pub fn policy_violations(&self) -> u64 {
        self.exchanges.policy_violations()
    }

    // === Inbound path ===

    /// Process one inbound datagram from `source`.
    ///
    /// Malformed frames error; traffic for unknown secure sessions is
    /// absorbed with a log (it may be a stale or malicious peer and
    /// must not disrupt the rest of the stack).
    pub fn on_datagram(&mut self, source: PeerId, datagram: &[u8]) -> Result<()> {
        let (header, consumed) = MessageHeader::from_bytes(datagram)?;
        let payload = &datagram[consumed..];

        let session_id = if header.is_group() {
            Some(self.sessions.incoming_group_for(GroupId(header.session_id), source)?)
        } else if header.session_id == UNSECURED_SESSION_ID {
            Some(self.sessions.unauthenticated_for(source)?)
        } else {
            self.sessions.by_wire_id(header.session_id)
        };

        let Some(session_id) = session_id else {
            tracing::debug!(
                "Dropping datagram for unknown session {} from {}",
                header.session_id,
                source
            );
            return Ok(());
        };
        let Some(info) = self.sessions.info(session_id) else {
            return Ok(());
        };

        // An inbound message is qualifying ICD activity
        self.icd.on_activity(&mut self.timers);

        self.exchanges.on_message_received(
            &info,
            &header,
            payload,
            &mut self.timers,
            &mut self.outbox,
        );
        Ok(())
    }

    // === Change notification ===

    /// Forward a dirty-path notification to the reporting engine.
    ///
    /// Must be invoked only from the protocol-processing context.
    pub fn mark_dirty(&mut self, path: AttributePath) -> Result<()> {
        self.router.mark_dirty(path)
    }

    // === ICD / liveness ===

    /// Explicit stay-active request from the application layer.
    pub fn request_stay_active(&mut self) {
        self.icd.on_activity(&mut self.timers);
    }

    /// Change the ICD liveness class and persist it.
    pub fn set_icd_class(&mut self, class: crate::icd::IcdClass) -> Result<()> {
        self.icd.set_class(class, self.store.as_mut())
    }

    /// Configured ICD liveness class
    pub fn icd_class(&self) -> crate::icd::IcdClass {
        self.icd.class()
    }

    /// Current duty-cycle mode
    pub fn operational_mode(&self) -> OperationalMode {
        self.icd.mode()
    }

    /// Interval at which the platform should poll right now
    pub fn poll_interval(&self) -> Duration {
        self.icd.poll_interval()
    }

    /// Value the next check-in message will carry (non-mutating).
    pub fn next_check_in_counter(&self) -> u32 {
        self.checkin.next()
    }

    /// Persist the counter after a check-in message was actually sent.
    pub fn commit_check_in(&mut self) -> Result<u32> {
        self.checkin.advance(self.store.as_mut())
    }

    /// Invalidate previously issued check-in counters by half the
    /// range (after key rotation).
    pub fn invalidate_check_in_half(&mut self) -> Result<()> {
        self.checkin.invalidate_half(self.store.as_mut())
    }

    /// Invalidate previously issued check-in counters by the full
    /// range (after key rotation).
    pub fn invalidate_check_in_all(&mut self) -> Result<()> {
        self.checkin.invalidate_all(self.store.as_mut())
    }

    // === Timers and transmission ===

    /// Current time on the stack's clock
    pub fn now(&self) -> Instant {
        self.timers.now()
    }

    /// Earliest armed timer deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Advance the clock, dispatching every timer that fires.
    ///
    /// Loops until quiescent so that timers re-armed behind the new
    /// clock (a retry rescheduled during a coarse advance) still fire.
    pub fn advance_to(&mut self, to: Instant) {
        loop {
            let fired = self.timers.advance_to(to);
            if fired.is_empty() {
                break;
            }
            for event in fired {
                match event {
                    TimerEvent::MrpRetry(key) => {
                        self.exchanges
                            .on_retry_timer(key, &mut self.timers, &mut self.outbox);
                    }
                    TimerEvent::AckDelay(key) => {
                        self.exchanges.on_ack_delay(key, &mut self.outbox);
                    }
                    TimerEvent::IcdActiveExpired => {
                        let pending = self.exchanges.has_pending_work();
                        self.icd.on_active_timer_expired(pending, &mut self.timers);
                    }
                }
            }
        }
    }

    /// Advance the clock by `delta`
    pub fn advance(&mut self, delta: Duration) {
        self.advance_to(self.timers.now() + delta);
    }

    /// Take the next outbound datagram, if any.
    pub fn poll_transmit(&mut self) -> Option<OutboundMessage> {
        self.outbox.pop_front()
    }

    /// Cancel everything: exchanges, their timers, and all sessions.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        self.exchanges.shutdown(&mut self.timers);
        let ids: Vec<SessionId> = self.sessions.ids().collect();
        for id in ids {
            self.sessions.evict(id);
        }
    }
}

impl std::fmt::Debug for CoreStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreStack")
            .field("sessions", &self.sessions.len())
            .field("exchanges", &self.exchanges.len())
            .field("mode", &self.icd.mode())
            .finish_non_exhaustive()
    }
}
