//! Pluggable message-permission policy.
//!
//! Every exchange carries a [`DispatchPolicy`] deciding which
//! (protocol, message type) combinations may traverse it. This is a
//! security control, not an optimization: a message failing the check
//! is dropped, never processed and never acknowledged as valid.
//!
//! Two categories exist:
//!
//! - [`SessionEstablishmentPolicy`] permits only handshake traffic
//!   (plus standalone acks and status reports), so an attacker or
//!   buggy peer cannot smuggle application traffic into a handshake
//!   exchange.
//! - [`ApplicationPolicy`] denies every handshake message type, so a
//!   completed application exchange cannot be hijacked into re-running
//!   a handshake.

use crate::message::{ProtocolId, SecureChannelMsgType};

/// Per-exchange allow-list for inbound message types.
pub trait DispatchPolicy {
    /// Whether a message of this (protocol, type) may be dispatched on
    /// the exchange
    fn is_permitted(&self, protocol: ProtocolId, msg_type: u8) -> bool;

    /// Policy name for diagnostics
    fn name(&self) -> &'static str;
}

/// Policy for session-establishment exchanges: handshake traffic only.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionEstablishmentPolicy;

impl DispatchPolicy for SessionEstablishmentPolicy {
    fn is_permitted(&self, protocol: ProtocolId, msg_type: u8) -> bool {
        if protocol != ProtocolId::SECURE_CHANNEL {
            return false;
        }
        match SecureChannelMsgType::from_byte(msg_type) {
            Some(t) => {
                t.is_handshake()
                    || matches!(
                        t,
                        SecureChannelMsgType::StandaloneAck | SecureChannelMsgType::StatusReport
                    )
            }
            None => false,
        }
    }

    fn name(&self) -> &'static str {
        "session-establishment"
    }
}

/// Policy for application exchanges: everything except handshake
/// traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplicationPolicy;

impl DispatchPolicy for ApplicationPolicy {
    fn is_permitted(&self, protocol: ProtocolId, msg_type: u8) -> bool {
        if protocol != ProtocolId::SECURE_CHANNEL {
            return true;
        }
        match SecureChannelMsgType::from_byte(msg_type) {
            Some(t) => !t.is_handshake(),
            // Unknown secure-channel opcodes are not routable
            None => false,
        }
    }

    fn name(&self) -> &'static str {
        "application"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_establishment_policy_allow_list() {
        let policy = SessionEstablishmentPolicy;

        // Every handshake type is permitted, plus ack and status
        for t in SecureChannelMsgType::all() {
            assert!(
                policy.is_permitted(ProtocolId::SECURE_CHANNEL, t.as_byte()),
                "{t:?} must be permitted during establishment"
            );
        }

        // Application traffic is rejected wholesale
        assert!(!policy.is_permitted(ProtocolId::INTERACTION_MODEL, 0x01));
        assert!(!policy.is_permitted(ProtocolId::new(0x7FFF), 0x00));
        // Unknown secure-channel opcode
        assert!(!policy.is_permitted(ProtocolId::SECURE_CHANNEL, 0xEE));
    }

    #[test]
    fn test_application_policy_denies_handshake() {
        let policy = ApplicationPolicy;

        for t in SecureChannelMsgType::all() {
            let permitted = policy.is_permitted(ProtocolId::SECURE_CHANNEL, t.as_byte());
            assert_eq!(
                permitted,
                !t.is_handshake(),
                "{t:?}: application policy must deny exactly the handshake set"
            );
        }

        // Application protocols pass through
        assert!(policy.is_permitted(ProtocolId::INTERACTION_MODEL, 0x05));
        assert!(policy.is_permitted(ProtocolId::new(0x7FFF), 0xFF));
    }

    #[test]
    fn test_policies_are_mutually_exclusive_on_handshake_types() {
        let establishment = SessionEstablishmentPolicy;
        let application = ApplicationPolicy;

        for t in SecureChannelMsgType::all().into_iter().filter(|t| t.is_handshake()) {
            let byte = t.as_byte();
            assert!(establishment.is_permitted(ProtocolId::SECURE_CHANNEL, byte));
            assert!(!application.is_permitted(ProtocolId::SECURE_CHANNEL, byte));
        }
    }
}
