//! Wire header for D2D messages.
//!
//! The header carries the fields this core routes on: session id,
//! exchange id, protocol id + message type (for the dispatch policy),
//! the reliable-message flag, the message counter and the optional
//! acknowledged-counter field. The application payload that follows is
//! an opaque byte buffer.
//!
//! Layout (little-endian):
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 2    | session id       |
//! | 2      | 1    | flags            |
//! | 3      | 2    | protocol id      |
//! | 5      | 1    | message type     |
//! | 6      | 2    | exchange id      |
//! | 8      | 4    | message counter  |
//! | 12     | 4    | ack counter (only if `HAS_ACK`) |

use super::flags::MessageFlags;
use super::ProtocolId;
use crate::error::{D2dError, Result};

/// Fixed header size in bytes (without the optional ack counter)
pub const FIXED_HEADER_SIZE: usize = 12;

/// Wire session id of the unsecured session space.
///
/// Traffic carrying this id resolves by source peer instead of by
/// session table entry.
pub const UNSECURED_SESSION_ID: u16 = 0;

/// D2D message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    /// Wire session id (`UNSECURED_SESSION_ID` for unauthenticated traffic)
    pub session_id: u16,
    /// Header flags
    pub flags: MessageFlags,
    /// Protocol the payload belongs to
    pub protocol: ProtocolId,
    /// Protocol-scoped message type
    pub msg_type: u8,
    /// Per-session exchange id
    pub exchange_id: u16,
    /// Message counter
    pub message_counter: u32,
    /// Counter being acknowledged (present when `HAS_ACK` is set)
    pub ack_counter: Option<u32>,
}

impl MessageHeader {
    /// Create a header with empty flags and no ack
    pub fn new(
        session_id: u16,
        protocol: ProtocolId,
        msg_type: u8,
        exchange_id: u16,
        message_counter: u32,
    ) -> Self {
        Self {
            session_id,
            flags: MessageFlags::new(),
            protocol,
            msg_type,
            exchange_id,
            message_counter,
            ack_counter: None,
        }
    }

    /// Whether the sender expects this message to be acknowledged
    pub fn is_reliable(&self) -> bool {
        self.flags.has(MessageFlags::RELIABLE)
    }

    /// Whether the sender initiated the exchange
    pub fn is_initiator(&self) -> bool {
        self.flags.has(MessageFlags::INITIATOR)
    }

    /// Whether the message travels over a group session
    pub fn is_group(&self) -> bool {
        self.flags.has(MessageFlags::GROUP)
    }

    /// Attach an acknowledged counter and set `HAS_ACK`
    pub fn with_ack(mut self, counter: u32) -> Self {
        self.flags.set(MessageFlags::HAS_ACK);
        self.ack_counter = Some(counter);
        self
    }

    /// Encoded size in bytes
    pub fn encoded_size(&self) -> usize {
        if self.ack_counter.is_some() {
            FIXED_HEADER_SIZE + 4
        } else {
            FIXED_HEADER_SIZE
        }
    }

    /// Encode to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        buf.extend_from_slice(&self.session_id.to_le_bytes());
        buf.push(self.flags.bits());
        buf.extend_from_slice(&self.protocol.raw().to_le_bytes());
        buf.push(self.msg_type);
        buf.extend_from_slice(&self.exchange_id.to_le_bytes());
        buf.extend_from_slice(&self.message_counter.to_le_bytes());
        if let Some(ack) = self.ack_counter {
            buf.extend_from_slice(&ack.to_le_bytes());
        }
        buf
    }

    /// Decode from bytes, returning the header and the number of bytes
    /// consumed. The remainder of the buffer is the opaque payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < FIXED_HEADER_SIZE {
            return Err(D2dError::InvalidMessage(format!(
                "Header too short: {} < {}",
                bytes.len(),
                FIXED_HEADER_SIZE
            )));
        }

        let session_id = u16::from_le_bytes([bytes[0], bytes[1]]);
        let flags = MessageFlags::from_bits(bytes[2]);
        let protocol = ProtocolId::new(u16::from_le_bytes([bytes[3], bytes[4]]));
        let msg_type = bytes[5];
        let exchange_id = u16::from_le_bytes([bytes[6], bytes[7]]);
        let message_counter = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        let mut consumed = FIXED_HEADER_SIZE;
        let ack_counter = if flags.has(MessageFlags::HAS_ACK) {
            if bytes.len() < FIXED_HEADER_SIZE + 4 {
                return Err(D2dError::InvalidMessage(
                    "Ack counter truncated".to_string(),
                ));
            }
            let ack = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
            consumed += 4;
            Some(ack)
        } else {
            None
        };

        Ok((
            Self {
                session_id,
                flags,
                protocol,
                msg_type,
                exchange_id,
                message_counter,
                ack_counter,
            },
            consumed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SecureChannelMsgType;

    #[test]
    fn test_header_roundtrip() {
        let mut header = MessageHeader::new(7, ProtocolId::INTERACTION_MODEL, 0x02, 42, 1001);
        header.flags.set(MessageFlags::RELIABLE);
        header.flags.set(MessageFlags::INITIATOR);

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), FIXED_HEADER_SIZE);

        let (decoded, consumed) = MessageHeader::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, FIXED_HEADER_SIZE);
        assert_eq!(decoded, header);
        assert!(decoded.is_reliable());
        assert!(decoded.is_initiator());
    }

    #[test]
    fn test_header_roundtrip_with_ack() {
        let header = MessageHeader::new(
            3,
            ProtocolId::SECURE_CHANNEL,
            SecureChannelMsgType::StandaloneAck.as_byte(),
            9,
            55,
        )
        .with_ack(54);

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), FIXED_HEADER_SIZE + 4);

        let (decoded, consumed) = MessageHeader::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, FIXED_HEADER_SIZE + 4);
        assert_eq!(decoded.ack_counter, Some(54));
        assert!(decoded.flags.has(MessageFlags::HAS_ACK));
    }

    #[test]
    fn test_header_payload_follows() {
        let header = MessageHeader::new(1, ProtocolId::INTERACTION_MODEL, 0x05, 2, 10);
        let mut frame = header.to_bytes();
        frame.extend_from_slice(b"payload");

        let (decoded, consumed) = MessageHeader::from_bytes(&frame).unwrap();
        assert_eq!(decoded.message_counter, 10);
        assert_eq!(&frame[consumed..], b"payload");
    }

    #[test]
    fn test_header_too_short() {
        let result = MessageHeader::from_bytes(&[0u8; 5]);
        assert!(result.is_err());
    }

    #[test]
    fn test_ack_counter_truncated() {
        let header =
            MessageHeader::new(1, ProtocolId::SECURE_CHANNEL, 0x10, 2, 10).with_ack(9);
        let bytes = header.to_bytes();

        // Drop the last byte of the ack counter
        let result = MessageHeader::from_bytes(&bytes[..bytes.len() - 1]);
        assert!(result.is_err());
    }
}
