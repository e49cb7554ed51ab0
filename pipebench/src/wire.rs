//! Wire format: frame header, RPC verbs, and the fixed-layout records
//! exchanged with the benchmark server.
//!
//! Everything is little-endian. Records have no framing of their own; each
//! one is consumed by reading fixed-size fields in order from a frame
//! payload.

use crate::error::{Error, Result};

/// Frame header size in bytes.
pub const FRAME_HDR_SIZE: usize = 16;

/// Magic number for valid frames.
pub const FRAME_MAGIC: u8 = 0xB7;

/// Largest payload a single frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024 * 1024;

/// RPC verb identifier.
pub type Verb = u16;

/// Ask a bootstrap endpoint for the URL of its data endpoint.
pub const GET_DATA_URL: Verb = 0x0010;
/// Start a benchmark session; payload is a `SessionConfig` record.
pub const START_SESSION: Verb = 0x0011;
/// One pipelined benchmark request; payload starts with a `RequestHeader`.
pub const REQUEST: Verb = 0x0012;
/// Server-originated batched acknowledgement; payload is an `Ack` record.
pub const ACK: Verb = 0x0013;

/// Frame kind (request/response correlation vs fire-and-forget).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Round-trip request; the peer answers with a `Response` of equal seq.
    Request = 0,
    /// Answer to a `Request`.
    Response = 1,
    /// Fire-and-forget message, dispatched to the verb's observer.
    Oneway = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Request),
            1 => Ok(FrameKind::Response),
            2 => Ok(FrameKind::Oneway),
            _ => Err(Error::MalformedFrame(format!("unknown frame kind {value}"))),
        }
    }
}

/// Frame header (16 bytes).
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       1     magic
/// 1       1     kind
/// 2       2     verb
/// 4       4     payload length
/// 8       8     sequence number
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame kind.
    pub kind: FrameKind,
    /// RPC verb.
    pub verb: Verb,
    /// Payload length in bytes.
    pub len: u32,
    /// Sequence number correlating requests with responses; zero for one-way.
    pub seq: u64,
}

impl FrameHeader {
    /// Header for a round-trip request.
    pub fn request(verb: Verb, seq: u64, len: usize) -> Self {
        Self { kind: FrameKind::Request, verb, len: len as u32, seq }
    }

    /// Header for a response to `seq`.
    pub fn response(verb: Verb, seq: u64, len: usize) -> Self {
        Self { kind: FrameKind::Response, verb, len: len as u32, seq }
    }

    /// Header for a fire-and-forget message.
    pub fn oneway(verb: Verb, len: usize) -> Self {
        Self { kind: FrameKind::Oneway, verb, len: len as u32, seq: 0 }
    }

    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; FRAME_HDR_SIZE] {
        let mut buf = [0u8; FRAME_HDR_SIZE];
        buf[0] = FRAME_MAGIC;
        buf[1] = self.kind as u8;
        buf[2..4].copy_from_slice(&self.verb.to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf[8..16].copy_from_slice(&self.seq.to_le_bytes());
        buf
    }

    /// Parse and validate a header from the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HDR_SIZE {
            return Err(Error::MalformedFrame(format!(
                "header truncated to {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != FRAME_MAGIC {
            return Err(Error::MalformedFrame(format!(
                "bad magic {:#04x}, expected {:#04x}",
                bytes[0], FRAME_MAGIC
            )));
        }
        let kind = FrameKind::try_from(bytes[1])?;
        let verb = u16::from_le_bytes([bytes[2], bytes[3]]);
        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if len as usize > MAX_FRAME_PAYLOAD {
            return Err(Error::MalformedFrame(format!("payload length {len} too large")));
        }
        let seq = u64::from_le_bytes([
            bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ]);
        Ok(Self { kind, verb, len, seq })
    }
}

/// Extract one complete frame from the front of a connection's receive
/// buffer, if present. The consumed bytes are removed from `rx`.
pub fn extract_frame(rx: &mut Vec<u8>) -> Result<Option<(FrameHeader, Vec<u8>)>> {
    if rx.len() < FRAME_HDR_SIZE {
        return Ok(None);
    }
    let hdr = FrameHeader::from_bytes(rx)?;
    let total = FRAME_HDR_SIZE + hdr.len as usize;
    if rx.len() < total {
        return Ok(None);
    }
    let rest = rx.split_off(total);
    let frame = std::mem::replace(rx, rest);
    Ok(Some((hdr, frame[FRAME_HDR_SIZE..].to_vec())))
}

/// Encoded size of [`SessionAck`].
pub const SESSION_ACK_SIZE: usize = 8;

/// Encoded size of [`RequestHeader`].
pub const REQUEST_HEADER_SIZE: usize = 16;

/// Encoded size of [`Ack`].
pub const ACK_SIZE: usize = 32;

fn u64_at(bytes: &[u8], off: usize) -> u64 {
    u64::from_le_bytes([
        bytes[off],
        bytes[off + 1],
        bytes[off + 2],
        bytes[off + 3],
        bytes[off + 4],
        bytes[off + 5],
        bytes[off + 6],
        bytes[off + 7],
    ])
}

/// Server response to `START_SESSION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionAck {
    /// Server-assigned session id.
    pub session_id: u64,
}

impl SessionAck {
    /// Serialize the record.
    pub fn to_bytes(&self) -> [u8; SESSION_ACK_SIZE] {
        self.session_id.to_le_bytes()
    }

    /// Decode the record from a frame payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SESSION_ACK_SIZE {
            return Err(Error::MalformedRecord("session ack"));
        }
        Ok(Self { session_id: u64_at(bytes, 0) })
    }
}

/// Fixed prefix of every `REQUEST` payload; `response_size − 16` padding
/// bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Session the request belongs to.
    pub session_id: u64,
    /// Cumulative request number, 1-based.
    pub total_count: u64,
}

impl RequestHeader {
    /// Serialize the record.
    pub fn to_bytes(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut buf = [0u8; REQUEST_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.session_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.total_count.to_le_bytes());
        buf
    }

    /// Decode the record from the front of a `REQUEST` payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < REQUEST_HEADER_SIZE {
            return Err(Error::MalformedRecord("request header"));
        }
        Ok(Self { session_id: u64_at(bytes, 0), total_count: u64_at(bytes, 8) })
    }
}

/// Server-originated batched acknowledgement.
///
/// All fields are cumulative totals as observed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Session the ack belongs to.
    pub session_id: u64,
    /// Cumulative acknowledged request count.
    pub total_count: u64,
    /// Cumulative acknowledged byte count.
    pub total_size: u64,
    /// Triangular-number checksum over `total_count`.
    pub checksum: u64,
}

impl Ack {
    /// Serialize the record.
    pub fn to_bytes(&self) -> [u8; ACK_SIZE] {
        let mut buf = [0u8; ACK_SIZE];
        buf[0..8].copy_from_slice(&self.session_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.total_count.to_le_bytes());
        buf[16..24].copy_from_slice(&self.total_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Decode the record from a frame payload. Trailing bytes (echoed
    /// payload data in echo mode) are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ACK_SIZE {
            return Err(Error::MalformedRecord("ack"));
        }
        Ok(Self {
            session_id: u64_at(bytes, 0),
            total_count: u64_at(bytes, 8),
            total_size: u64_at(bytes, 16),
            checksum: u64_at(bytes, 24),
        })
    }
}

/// The checksum every valid ack must carry: the triangular number of the
/// cumulative request count.
#[inline]
pub fn expected_checksum(total_count: u64) -> u64 {
    total_count * (total_count + 1) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_roundtrip() {
        let hdr = FrameHeader::request(START_SESSION, 42, 20);
        let parsed = FrameHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(parsed.kind, FrameKind::Request);
        assert_eq!(parsed.verb, START_SESSION);
        assert_eq!(parsed.len, 20);
        assert_eq!(parsed.seq, 42);
    }

    #[test]
    fn test_frame_header_bad_magic() {
        let mut bytes = FrameHeader::oneway(ACK, 0).to_bytes();
        bytes[0] = 0x00;
        assert!(FrameHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_frame_header_bad_kind() {
        let mut bytes = FrameHeader::oneway(ACK, 0).to_bytes();
        bytes[1] = 9;
        assert!(FrameHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_extract_frame_incremental() {
        let hdr = FrameHeader::oneway(ACK, 4);
        let mut wire = hdr.to_bytes().to_vec();
        wire.extend_from_slice(&[1, 2, 3, 4]);

        // Feed the bytes one at a time; nothing comes out until the last one.
        let mut rx = Vec::new();
        for &b in &wire[..wire.len() - 1] {
            rx.push(b);
            assert!(extract_frame(&mut rx).unwrap().is_none());
        }
        rx.push(wire[wire.len() - 1]);
        let (got_hdr, payload) = extract_frame(&mut rx).unwrap().unwrap();
        assert_eq!(got_hdr, hdr);
        assert_eq!(payload, vec![1, 2, 3, 4]);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_extract_frame_back_to_back() {
        let mut rx = Vec::new();
        for seq in 0..3u64 {
            rx.extend_from_slice(&FrameHeader::response(GET_DATA_URL, seq, 1).to_bytes());
            rx.push(seq as u8);
        }
        for seq in 0..3u64 {
            let (hdr, payload) = extract_frame(&mut rx).unwrap().unwrap();
            assert_eq!(hdr.seq, seq);
            assert_eq!(payload, vec![seq as u8]);
        }
        assert!(extract_frame(&mut rx).unwrap().is_none());
    }

    #[test]
    fn test_record_roundtrips() {
        let ack = Ack { session_id: 7, total_count: 100, total_size: 51_200, checksum: 5_050 };
        assert_eq!(Ack::from_bytes(&ack.to_bytes()).unwrap(), ack);

        let hdr = RequestHeader { session_id: 7, total_count: 101 };
        assert_eq!(RequestHeader::from_bytes(&hdr.to_bytes()).unwrap(), hdr);

        let sack = SessionAck { session_id: 9 };
        assert_eq!(SessionAck::from_bytes(&sack.to_bytes()).unwrap(), sack);
    }

    #[test]
    fn test_ack_ignores_echoed_tail() {
        let ack = Ack { session_id: 1, total_count: 2, total_size: 1024, checksum: 3 };
        let mut bytes = ack.to_bytes().to_vec();
        bytes.extend_from_slice(&[0xAA; 64]);
        assert_eq!(Ack::from_bytes(&bytes).unwrap(), ack);
    }

    #[test]
    fn test_checksum_law() {
        assert_eq!(expected_checksum(0), 0);
        assert_eq!(expected_checksum(1), 1);
        assert_eq!(expected_checksum(3), 6);
        assert_eq!(expected_checksum(100), 5_050);
    }
}
