//! Wire format of coded frames.
//!
//! Every coded frame is a [`CodedHeader`] followed by a coded row. An empty
//! row marks a pure acknowledgement carrying only feedback.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::config::MAX_WINDOW_SIZE;
use crate::error::ProtocolError;
use crate::field::FieldType;
use crate::generation::{Direction, FlowState, Role};

/// Length of a link-layer address.
pub const ADDR_LEN: usize = 6;

// =============================================================================
// Addresses
// =============================================================================

/// 48-bit link-layer address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HwAddr(pub [u8; ADDR_LEN]);

impl HwAddr {
    pub const fn new(bytes: [u8; ADDR_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ADDR_LEN] {
        &self.0
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<[u8; ADDR_LEN]> for HwAddr {
    fn from(bytes: [u8; ADDR_LEN]) -> Self {
        Self(bytes)
    }
}

/// Session identifier: both endpoint addresses, smaller first.
///
/// Both peers derive the same id regardless of who sends first. The smaller
/// address is the Initiator, the larger the Responder.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    initiator: HwAddr,
    responder: HwAddr,
}

impl SessionId {
    /// Wire size in bytes.
    pub const SIZE: usize = 2 * ADDR_LEN;

    /// Build the canonical id for a pair of addresses.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::IdenticalAddresses`] if `a == b`.
    pub fn new(a: HwAddr, b: HwAddr) -> Result<Self, ProtocolError> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Ok(Self {
                initiator: a,
                responder: b,
            }),
            std::cmp::Ordering::Greater => Ok(Self {
                initiator: b,
                responder: a,
            }),
            std::cmp::Ordering::Equal => Err(ProtocolError::IdenticalAddresses),
        }
    }

    #[inline]
    pub fn initiator(&self) -> HwAddr {
        self.initiator
    }

    #[inline]
    pub fn responder(&self) -> HwAddr {
        self.responder
    }

    /// Role of the node with address `local` in this session.
    pub fn role_for(&self, local: HwAddr) -> Role {
        if local == self.initiator {
            Role::Initiator
        } else if local == self.responder {
            Role::Responder
        } else {
            Role::Relay
        }
    }

    /// The endpoint that is not `local`, if `local` is an endpoint.
    pub fn peer_of(&self, local: HwAddr) -> Option<HwAddr> {
        match self.role_for(local) {
            Role::Initiator => Some(self.responder),
            Role::Responder => Some(self.initiator),
            Role::Relay => None,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..ADDR_LEN].copy_from_slice(&self.initiator.0);
        buf[ADDR_LEN..].copy_from_slice(&self.responder.0);
        buf
    }

    /// Parse an id as sent on the wire. The halves are taken as-is.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Result<Self, ProtocolError> {
        let mut initiator = [0u8; ADDR_LEN];
        let mut responder = [0u8; ADDR_LEN];
        initiator.copy_from_slice(&buf[..ADDR_LEN]);
        responder.copy_from_slice(&buf[ADDR_LEN..]);
        if initiator == responder {
            return Err(ProtocolError::IdenticalAddresses);
        }
        Ok(Self {
            initiator: HwAddr(initiator),
            responder: HwAddr(responder),
        })
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.initiator, self.responder)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

// =============================================================================
// Feedback
// =============================================================================

/// Per-generation delivery state as reported to the peer.
///
/// # Wire Format
///
/// ```text
/// ┌──────────┬──────────┬──────────┬──────────┬──────────┐
/// │ locks    │ ddim I→R │ ddim R→I │ sdim I→R │ sdim R→I │
/// │ (1B)     │ (1B)     │ (1B)     │ (1B)     │ (1B)     │
/// └──────────┴──────────┴──────────┴──────────┴──────────┘
///   locks: bit 0 = I→R locked, bit 1 = R→I locked
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedbackRecord {
    pub forward: FlowState,
    pub backward: FlowState,
}

impl FeedbackRecord {
    /// Packet size in bytes.
    pub const SIZE: usize = 5;

    pub fn flow(&self, direction: Direction) -> FlowState {
        match direction {
            Direction::InitiatorToResponder => self.forward,
            Direction::ResponderToInitiator => self.backward,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let locks = u8::from(self.forward.locked) | (u8::from(self.backward.locked) << 1);
        [
            locks,
            self.forward.dest_dim,
            self.backward.dest_dim,
            self.forward.source_dim,
            self.backward.source_dim,
        ]
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            forward: FlowState {
                locked: buf[0] & 0x01 != 0,
                dest_dim: buf[1],
                source_dim: buf[3],
            },
            backward: FlowState {
                locked: buf[0] & 0x02 != 0,
                dest_dim: buf[2],
                source_dim: buf[4],
            },
        }
    }
}

// =============================================================================
// Coded Header
// =============================================================================

/// Header preceding every coded payload.
///
/// # Wire Format
///
/// ```text
/// ┌──────────────┬───────────┬─────────┬─────────┬──────────────────────┐
/// │ session id   │ gf | W<<2 │ seq     │ lseq    │ W feedback records   │
/// │ (12B)        │ (1B)      │ (2B LE) │ (2B LE) │ (5B each)            │
/// └──────────────┴───────────┴─────────┴─────────┴──────────────────────┘
/// ```
///
/// Record `i` describes generation `lseq + i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedHeader {
    pub session: SessionId,
    pub field: FieldType,
    /// Generation this frame belongs to.
    pub seq: u16,
    /// Sender's lowest live sequence number.
    pub lseq: u16,
    pub feedback: Vec<FeedbackRecord>,
}

impl CodedHeader {
    /// Size of the fixed part.
    pub const FIXED_SIZE: usize = SessionId::SIZE + 1 + 2 + 2;

    /// Encoded size including feedback.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        Self::FIXED_SIZE + self.feedback.len() * FeedbackRecord::SIZE
    }

    /// Append the header to `dst`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::InvalidWindow`] if the feedback array does not fit
    /// the 6-bit length field or is empty.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let window = self.feedback.len();
        if window == 0 || window > MAX_WINDOW_SIZE {
            return Err(ProtocolError::InvalidWindow(window));
        }

        dst.reserve(self.encoded_len());
        dst.put_slice(&self.session.to_bytes());
        dst.put_u8(self.field.bits() | ((window as u8) << 2));
        dst.put_u16_le(self.seq);
        dst.put_u16_le(self.lseq);
        for record in &self.feedback {
            dst.put_slice(&record.to_bytes());
        }
        Ok(())
    }

    /// Parse a frame into its header and coded payload.
    ///
    /// # Errors
    ///
    /// Fails if the frame is shorter than the header it announces, the window
    /// field is zero, or the session id is malformed.
    pub fn decode(frame: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if frame.len() < Self::FIXED_SIZE {
            return Err(ProtocolError::Truncated {
                have: frame.len(),
                need: Self::FIXED_SIZE,
            });
        }

        let mut buf = frame;
        let mut sid = [0u8; SessionId::SIZE];
        buf.copy_to_slice(&mut sid);
        let session = SessionId::from_bytes(&sid)?;

        let control = buf.get_u8();
        let window = (control >> 2) as usize;
        if window == 0 {
            return Err(ProtocolError::InvalidWindow(window));
        }
        // Two bits always name a field.
        let field = FieldType::from_bits(control & 0x03).unwrap_or_default();
        let seq = buf.get_u16_le();
        let lseq = buf.get_u16_le();

        let need = window * FeedbackRecord::SIZE;
        if buf.remaining() < need {
            return Err(ProtocolError::Truncated {
                have: frame.len(),
                need: Self::FIXED_SIZE + need,
            });
        }

        let mut feedback = Vec::with_capacity(window);
        for _ in 0..window {
            let mut record = [0u8; FeedbackRecord::SIZE];
            buf.copy_to_slice(&mut record);
            feedback.push(FeedbackRecord::from_bytes(&record));
        }

        Ok((
            Self {
                session,
                field,
                seq,
                lseq,
                feedback,
            },
            buf,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> HwAddr {
        HwAddr::new([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn test_session_id_is_symmetric() {
        let a = addr(1);
        let b = addr(2);
        let ab = SessionId::new(a, b).unwrap();
        let ba = SessionId::new(b, a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.initiator(), a);
        assert_eq!(ab.responder(), b);
        assert_eq!(SessionId::new(a, a), Err(ProtocolError::IdenticalAddresses));
    }

    #[test]
    fn test_role_derivation() {
        let sid = SessionId::new(addr(9), addr(3)).unwrap();
        assert_eq!(sid.role_for(addr(3)), Role::Initiator);
        assert_eq!(sid.role_for(addr(9)), Role::Responder);
        assert_eq!(sid.role_for(addr(5)), Role::Relay);
        assert_eq!(sid.peer_of(addr(3)), Some(addr(9)));
        assert_eq!(sid.peer_of(addr(5)), None);
    }

    #[test]
    fn test_address_display() {
        let a = HwAddr::new([0xde, 0xad, 0xbe, 0xef, 0x02, 0x03]);
        assert_eq!(a.to_string(), "de:ad:be:ef:02:03");
    }

    #[test]
    fn test_feedback_layout() {
        let record = FeedbackRecord {
            forward: FlowState {
                source_dim: 4,
                dest_dim: 3,
                locked: true,
            },
            backward: FlowState {
                source_dim: 2,
                dest_dim: 1,
                locked: false,
            },
        };
        assert_eq!(record.to_bytes(), [0x01, 3, 1, 4, 2]);
        assert_eq!(FeedbackRecord::from_bytes(&record.to_bytes()), record);
    }

    #[test]
    fn test_header_layout() {
        let header = CodedHeader {
            session: SessionId::new(addr(1), addr(2)).unwrap(),
            field: FieldType::Gf16,
            seq: 0x0102,
            lseq: 0xfffe,
            feedback: vec![FeedbackRecord::default(); 3],
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        buf.put_slice(b"payload");

        assert_eq!(buf.len(), header.encoded_len() + 7);
        assert_eq!(buf[12], 0x02 | (3 << 2));
        assert_eq!(&buf[13..15], &[0x02, 0x01]);
        assert_eq!(&buf[15..17], &[0xfe, 0xff]);

        let (parsed, payload) = CodedHeader::decode(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_empty_payload_is_ack() {
        let header = CodedHeader {
            session: SessionId::new(addr(1), addr(2)).unwrap(),
            field: FieldType::Gf256,
            seq: 7,
            lseq: 7,
            feedback: vec![FeedbackRecord::default()],
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        let (_, payload) = CodedHeader::decode(&buf).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            CodedHeader::decode(&[0u8; 10]),
            Err(ProtocolError::Truncated { have: 10, .. })
        ));

        let header = CodedHeader {
            session: SessionId::new(addr(1), addr(2)).unwrap(),
            field: FieldType::Gf256,
            seq: 0,
            lseq: 0,
            feedback: vec![FeedbackRecord::default(); 2],
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();

        // Feedback array overruns the frame.
        assert!(matches!(
            CodedHeader::decode(&buf[..buf.len() - 1]),
            Err(ProtocolError::Truncated { .. })
        ));

        // Zero window.
        let mut zero = buf.to_vec();
        zero[12] &= 0x03;
        assert_eq!(CodedHeader::decode(&zero), Err(ProtocolError::InvalidWindow(0)));

        // Identical halves.
        let mut same = buf.to_vec();
        same[6..12].copy_from_slice(&addr(1).0);
        assert_eq!(CodedHeader::decode(&same), Err(ProtocolError::IdenticalAddresses));
    }

    #[test]
    fn test_encode_rejects_oversized_window() {
        let header = CodedHeader {
            session: SessionId::new(addr(1), addr(2)).unwrap(),
            field: FieldType::Gf256,
            seq: 0,
            lseq: 0,
            feedback: vec![FeedbackRecord::default(); 64],
        };
        let mut buf = BytesMut::new();
        assert_eq!(header.encode(&mut buf), Err(ProtocolError::InvalidWindow(64)));
    }
}
