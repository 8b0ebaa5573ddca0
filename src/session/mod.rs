//! Session management for the D2D core.
//!
//! A [`Session`] represents one peer relationship. It is a closed
//! variant set:
//!
//! | Variant           | Peer traffic                  | Acked? |
//! |-------------------|-------------------------------|--------|
//! | `Unauthenticated` | Pre-handshake unicast         | yes    |
//! | `Secure`          | Established encrypted unicast | yes    |
//! | `IncomingGroup`   | Received multicast            | never  |
//! | `OutgoingGroup`   | Emitted multicast             | never  |
//!
//! Callers are expected to determine the variant through [`Session::kind`]
//! before narrowing with the `as_*` accessors; narrowing to the wrong
//! variant is a programmer error and panics rather than corrupting
//! state.
//!
//! Sessions are owned by the [`SessionRegistry`] and addressed through
//! generation-checked [`SessionId`] handles: holding an id never keeps
//! a session alive, and an id outlives its session only as a lookup
//! that fails.

mod registry;

pub use registry::SessionRegistry;

use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Peer identity: node id scoped by fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    /// Node identifier within the fabric
    pub node_id: u64,
    /// Fabric the node belongs to
    pub fabric_index: u8,
}

impl PeerId {
    /// Create a peer id
    pub fn new(node_id: u64, fabric_index: u8) -> Self {
        Self {
            node_id,
            fabric_index,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}@{}", self.node_id, self.fabric_index)
    }
}

/// Multicast group identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub u16);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group {:#06x}", self.0)
    }
}

/// Opaque secure-session material.
///
/// Produced by the out-of-scope key-agreement layer; this core only
/// carries it alongside the session it belongs to.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys([u8; 32]);

impl SessionKeys {
    /// Wrap raw key material
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Access the raw key material
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material never lands in logs
        write!(f, "SessionKeys(..)")
    }
}

/// Provider of secure-session material, consumed only to construct
/// `Secure` sessions.
pub trait SessionMaterialProvider {
    /// Derive session keys for the given peer
    fn session_keys(&mut self, peer: PeerId) -> Result<SessionKeys>;
}

/// Generation-checked handle to a registry slot.
///
/// A stale handle (its session was evicted) fails lookup instead of
/// aliasing whatever reused the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: u16,
    generation: u16,
}

impl SessionId {
    /// Construct from raw slot index and generation.
    ///
    /// Mainly useful to tests exercising stale-handle behavior.
    pub fn from_parts(index: u16, generation: u16) -> Self {
        Self { index, generation }
    }

    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(&self) -> u16 {
        self.generation
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}#{}", self.index, self.generation)
    }
}

/// Session variant tag, for type queries before narrowing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Pre-handshake unicast session
    Unauthenticated,
    /// Established encrypted unicast session
    Secure,
    /// Received-multicast session
    IncomingGroup,
    /// Emitted-multicast session
    OutgoingGroup,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unauthenticated => "Unauthenticated",
            Self::Secure => "Secure",
            Self::IncomingGroup => "IncomingGroup",
            Self::OutgoingGroup => "OutgoingGroup",
        };
        write!(f, "{name}")
    }
}

/// Pre-handshake unicast session state
#[derive(Debug, Clone)]
pub struct UnauthenticatedSession {
    /// Peer this session talks to
    pub peer: PeerId,
    /// Time to wait for an acknowledgment from this peer
    pub ack_timeout: Duration,
}

/// Established encrypted unicast session state
#[derive(Debug, Clone)]
pub struct SecureSession {
    /// Peer this session talks to
    pub peer: PeerId,
    /// Wire session id under which the peer addresses us
    pub local_session_id: u16,
    /// Wire session id under which we address the peer
    pub peer_session_id: u16,
    /// Opaque key material from the establishment layer
    pub keys: SessionKeys,
    /// Time to wait for an acknowledgment from this peer
    pub ack_timeout: Duration,
}

/// Received-multicast session state
#[derive(Debug, Clone)]
pub struct IncomingGroupSession {
    /// Group the traffic arrived on
    pub group: GroupId,
    /// Sender of the first message that created this session
    pub peer: PeerId,
}

/// Emitted-multicast session state
#[derive(Debug, Clone)]
pub struct OutgoingGroupSession {
    /// Group the traffic is emitted to
    pub group: GroupId,
    /// Fabric the group belongs to
    pub fabric_index: u8,
}

/// One peer relationship.
#[derive(Debug, Clone)]
pub enum Session {
    /// Pre-handshake unicast
    Unauthenticated(UnauthenticatedSession),
    /// Established encrypted unicast
    Secure(SecureSession),
    /// Received multicast
    IncomingGroup(IncomingGroupSession),
    /// Emitted multicast
    OutgoingGroup(OutgoingGroupSession),
}

impl Session {
    /// Variant tag
    pub fn kind(&self) -> SessionKind {
        match self {
            Self::Unauthenticated(_) => SessionKind::Unauthenticated,
            Self::Secure(_) => SessionKind::Secure,
            Self::IncomingGroup(_) => SessionKind::IncomingGroup,
            Self::OutgoingGroup(_) => SessionKind::OutgoingGroup,
        }
    }

    /// Whether this is either group variant
    pub fn is_group(&self) -> bool {
        matches!(self, Self::IncomingGroup(_) | Self::OutgoingGroup(_))
    }

    /// Peer identity. Outgoing group sessions have no single peer and
    /// report the group as a fabric-scoped broadcast identity.
    pub fn peer(&self) -> PeerId {
        match self {
            Self::Unauthenticated(s) => s.peer,
            Self::Secure(s) => s.peer,
            Self::IncomingGroup(s) => s.peer,
            Self::OutgoingGroup(s) => PeerId::new(u64::from(s.group.0), s.fabric_index),
        }
    }

    /// Wire session id the peer uses to address us (0 for
    /// unauthenticated, the group id for group sessions).
    pub fn wire_id(&self) -> u16 {
        match self {
            Self::Unauthenticated(_) => crate::message::UNSECURED_SESSION_ID,
            Self::Secure(s) => s.local_session_id,
            Self::IncomingGroup(s) => s.group.0,
            Self::OutgoingGroup(s) => s.group.0,
        }
    }

    /// Wire session id we put on outbound headers so the peer can
    /// resolve its side of the session.
    pub fn peer_wire_id(&self) -> u16 {
        match self {
            Self::Unauthenticated(_) => crate::message::UNSECURED_SESSION_ID,
            Self::Secure(s) => s.peer_session_id,
            Self::IncomingGroup(s) => s.group.0,
            Self::OutgoingGroup(s) => s.group.0,
        }
    }

    /// Per-message acknowledgment timeout. Zero for group sessions,
    /// which are never acknowledged.
    pub fn ack_timeout(&self) -> Duration {
        match self {
            Self::Unauthenticated(s) => s.ack_timeout,
            Self::Secure(s) => s.ack_timeout,
            Self::IncomingGroup(_) | Self::OutgoingGroup(_) => Duration::ZERO,
        }
    }

    /// Expected round-trip time for a message plus its response:
    /// ack timeout plus the upper layer's processing budget.
    ///
    /// Group sessions return zero regardless of the budget: no
    /// acknowledgment is ever expected for multicast traffic.
    pub fn round_trip_timeout(&self, upper_layer_budget: Duration) -> Duration {
        if self.is_group() {
            return Duration::ZERO;
        }
        self.ack_timeout() + upper_layer_budget
    }

    /// Narrow to the `Unauthenticated` variant.
    ///
    /// # Panics
    /// Panics if the session is any other variant; callers must have
    /// already checked [`Session::kind`].
    pub fn as_unauthenticated(&self) -> &UnauthenticatedSession {
        match self {
            Self::Unauthenticated(s) => s,
            other => panic!(
                "session variant mismatch: expected Unauthenticated, got {}",
                other.kind()
            ),
        }
    }

    /// Narrow to the `Secure` variant.
    ///
    /// # Panics
    /// Panics if the session is any other variant.
    pub fn as_secure(&self) -> &SecureSession {
        match self {
            Self::Secure(s) => s,
            other => panic!(
                "session variant mismatch: expected Secure, got {}",
                other.kind()
            ),
        }
    }

    /// Narrow to the `IncomingGroup` variant.
    ///
    /// # Panics
    /// Panics if the session is any other variant.
    pub fn as_incoming_group(&self) -> &IncomingGroupSession {
        match self {
            Self::IncomingGroup(s) => s,
            other => panic!(
                "session variant mismatch: expected IncomingGroup, got {}",
                other.kind()
            ),
        }
    }

    /// Narrow to the `OutgoingGroup` variant.
    ///
    /// # Panics
    /// Panics if the session is any other variant.
    pub fn as_outgoing_group(&self) -> &OutgoingGroupSession {
        match self {
            Self::OutgoingGroup(s) => s,
            other => panic!(
                "session variant mismatch: expected OutgoingGroup, got {}",
                other.kind()
            ),
        }
    }
}

/// Copied-out view of a session, used by the exchange layer so it
/// never has to borrow the registry mid-operation.
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    /// Registry handle
    pub id: SessionId,
    /// Wire session id the peer addresses us under
    pub wire_id: u16,
    /// Wire session id we address the peer under
    pub peer_wire_id: u16,
    /// Peer identity
    pub peer: PeerId,
    /// Whether this is a group session
    pub is_group: bool,
    /// Acknowledgment timeout
    pub ack_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secure() -> Session {
        Session::Secure(SecureSession {
            peer: PeerId::new(0xA1, 1),
            local_session_id: 11,
            peer_session_id: 22,
            keys: SessionKeys::from_bytes([7u8; 32]),
            ack_timeout: Duration::from_millis(400),
        })
    }

    #[test]
    fn test_narrowing_roundtrip() {
        let session = secure();
        assert_eq!(session.kind(), SessionKind::Secure);

        let inner = session.as_secure();
        assert_eq!(inner.peer, PeerId::new(0xA1, 1));
        assert_eq!(inner.local_session_id, 11);
        assert_eq!(inner.keys, SessionKeys::from_bytes([7u8; 32]));

        let unauth = Session::Unauthenticated(UnauthenticatedSession {
            peer: PeerId::new(2, 0),
            ack_timeout: Duration::from_millis(300),
        });
        assert_eq!(unauth.as_unauthenticated().peer.node_id, 2);

        let incoming = Session::IncomingGroup(IncomingGroupSession {
            group: GroupId(5),
            peer: PeerId::new(3, 1),
        });
        assert_eq!(incoming.as_incoming_group().group, GroupId(5));

        let outgoing = Session::OutgoingGroup(OutgoingGroupSession {
            group: GroupId(6),
            fabric_index: 2,
        });
        assert_eq!(outgoing.as_outgoing_group().group, GroupId(6));
    }

    #[test]
    #[should_panic(expected = "expected Secure, got Unauthenticated")]
    fn test_wrong_narrowing_is_fatal() {
        let session = Session::Unauthenticated(UnauthenticatedSession {
            peer: PeerId::new(1, 0),
            ack_timeout: Duration::from_millis(300),
        });
        let _ = session.as_secure();
    }

    #[test]
    #[should_panic(expected = "expected IncomingGroup, got Secure")]
    fn test_wrong_group_narrowing_is_fatal() {
        let _ = secure().as_incoming_group();
    }

    #[test]
    fn test_round_trip_timeout_unicast() {
        let session = secure();
        assert_eq!(
            session.round_trip_timeout(Duration::from_millis(600)),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_round_trip_timeout_zero_for_groups() {
        let budget = Duration::from_secs(30);

        let incoming = Session::IncomingGroup(IncomingGroupSession {
            group: GroupId(1),
            peer: PeerId::new(9, 1),
        });
        assert_eq!(incoming.round_trip_timeout(budget), Duration::ZERO);

        let outgoing = Session::OutgoingGroup(OutgoingGroupSession {
            group: GroupId(2),
            fabric_index: 1,
        });
        assert_eq!(outgoing.round_trip_timeout(budget), Duration::ZERO);
    }

    #[test]
    fn test_keys_not_in_debug_output() {
        let keys = SessionKeys::from_bytes([0x41; 32]);
        let rendered = format!("{keys:?}");
        assert!(!rendered.contains("41"));
    }
}
