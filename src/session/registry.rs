//! Session registry: the authoritative owner of live sessions.
//!
//! Sessions live in a fixed-capacity slot arena. Each slot carries a
//! generation counter that advances on eviction, so a [`SessionId`]
//! held past its session's lifetime fails lookup instead of touching
//! the slot's next occupant.

use std::time::Duration;

use super::{
    GroupId, IncomingGroupSession, OutgoingGroupSession, PeerId, SecureSession, Session,
    SessionId, SessionInfo, SessionKeys, UnauthenticatedSession,
};
use crate::error::{D2dError, Result};
use crate::message::UNSECURED_SESSION_ID;

#[derive(Debug, Default)]
struct Slot {
    generation: u16,
    session: Option<Session>,
}

/// Owner of the live session set.
#[derive(Debug)]
pub struct SessionRegistry {
    slots: Vec<Slot>,
    default_ack_timeout: Duration,
    next_wire_id: u16,
    live: usize,
}

impl SessionRegistry {
    /// Create a registry with `capacity` slots. `default_ack_timeout`
    /// seeds the ack timeout of new unicast sessions.
    pub fn new(capacity: usize, default_ack_timeout: Duration) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        Self {
            slots,
            default_ack_timeout,
            next_wire_id: 1,
            live: 0,
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no session is live
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Create an unauthenticated session for `peer`.
    pub fn create_unauthenticated(&mut self, peer: PeerId) -> Result<SessionId> {
        let ack_timeout = self.default_ack_timeout;
        self.insert(Session::Unauthenticated(UnauthenticatedSession {
            peer,
            ack_timeout,
        }))
    }

    /// Create a secure session for `peer` from established key
    /// material. Allocates a fresh local wire session id.
    pub fn create_secure(
        &mut self,
        peer: PeerId,
        peer_session_id: u16,
        keys: SessionKeys,
    ) -> Result<SessionId> {
        let local_session_id = self.allocate_wire_id();
        let ack_timeout = self.default_ack_timeout;
        let id = self.insert(Session::Secure(SecureSession {
            peer,
            local_session_id,
            peer_session_id,
            keys,
            ack_timeout,
        }))?;
        tracing::debug!(
            "Secure session {} established with {} (local id {})",
            id,
            peer,
            local_session_id
        );
        Ok(id)
    }

    /// Create an incoming group session.
    pub fn create_incoming_group(&mut self, group: GroupId, peer: PeerId) -> Result<SessionId> {
        self.insert(Session::IncomingGroup(IncomingGroupSession { group, peer }))
    }

    /// Create an outgoing group session.
    pub fn create_outgoing_group(&mut self, group: GroupId, fabric_index: u8) -> Result<SessionId> {
        self.insert(Session::OutgoingGroup(OutgoingGroupSession {
            group,
            fabric_index,
        }))
    }

    /// Find the unauthenticated session for `peer`, creating it on
    /// first contact.
    pub fn unauthenticated_for(&mut self, peer: PeerId) -> Result<SessionId> {
        if let Some(id) = self.find(|s| {
            matches!(s, Session::Unauthenticated(u) if u.peer == peer)
        }) {
            return Ok(id);
        }
        self.create_unauthenticated(peer)
    }

    /// Find the incoming group session for `group`, creating it on the
    /// first inbound group message.
    pub fn incoming_group_for(&mut self, group: GroupId, peer: PeerId) -> Result<SessionId> {
        if let Some(id) = self.find(|s| {
            matches!(s, Session::IncomingGroup(g) if g.group == group)
        }) {
            return Ok(id);
        }
        self.create_incoming_group(group, peer)
    }

    /// Resolve a secure session by its local wire id.
    pub fn by_wire_id(&self, wire_id: u16) -> Option<SessionId> {
        if wire_id == UNSECURED_SESSION_ID {
            return None;
        }
        self.find(|s| matches!(s, Session::Secure(sec) if sec.local_session_id == wire_id))
    }

    /// Look up a session by handle. Stale handles return `None`.
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.session.as_ref()
    }

    /// Copied-out view of a session for the exchange layer.
    pub fn info(&self, id: SessionId) -> Option<SessionInfo> {
        self.get(id).map(|s| SessionInfo {
            id,
            wire_id: s.wire_id(),
            peer_wire_id: s.peer_wire_id(),
            peer: s.peer(),
            is_group: s.is_group(),
            ack_timeout: s.ack_timeout(),
        })
    }

    /// Evict a session, returning it. The caller is responsible for
    /// synchronously cancelling every exchange bound to it before any
    /// further message processing.
    pub fn evict(&mut self, id: SessionId) -> Option<Session> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        let session = slot.session.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        tracing::debug!("Session {} evicted ({})", id, session.kind());
        Some(session)
    }

    /// Iterate over live session ids.
    pub fn ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.session.as_ref().map(|_| SessionId::from_parts(
                index as u16,
                slot.generation,
            ))
        })
    }

    fn find(&self, pred: impl Fn(&Session) -> bool) -> Option<SessionId> {
        self.ids().find(|id| self.get(*id).is_some_and(&pred))
    }

    fn insert(&mut self, session: Session) -> Result<SessionId> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.session.is_none())
            .ok_or(D2dError::ResourceExhausted("session table"))?;
        let slot = &mut self.slots[index];
        slot.session = Some(session);
        self.live += 1;
        Ok(SessionId::from_parts(index as u16, slot.generation))
    }

    /// Allocate an unused non-zero wire session id.
    fn allocate_wire_id(&mut self) -> u16 {
        loop {
            let candidate = self.next_wire_id;
            self.next_wire_id = self.next_wire_id.wrapping_add(1).max(1);
            if candidate != UNSECURED_SESSION_ID && self.by_wire_id(candidate).is_none() {
                return candidate;
            }
        }
    }
}
