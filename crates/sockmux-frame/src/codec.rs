use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Preamble: operator (4) + sequence (8) + header length (4) + body length (4).
pub const PREAMBLE_SIZE: usize = 20;

/// Default maximum frame size (preamble included): 1 MiB.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Operator code reserved for keep-alive traffic.
pub const PING_OPERATOR: u32 = 0;

/// Body handed upstream in place of an empty one.
pub const EMPTY_BODY: &str = "{}";

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Hash of the operator name. 0 is the ping operator.
    pub operator: u32,
    /// Per-call disambiguator, derived from send time.
    pub sequence: i64,
    /// Encoded `key=value;` header block.
    pub header: String,
    /// Opaque payload (JSON text in practice).
    pub body: Bytes,
}

impl Packet {
    /// Create a new packet.
    pub fn new(
        operator: u32,
        sequence: i64,
        header: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            operator,
            sequence,
            header: header.into(),
            body: body.into(),
        }
    }

    /// Create a keep-alive packet (operator 0, sequence 0).
    pub fn ping(header: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(PING_OPERATOR, 0, header, body)
    }

    pub fn is_ping(&self) -> bool {
        self.operator == PING_OPERATOR
    }

    /// The total wire size of this packet (preamble + header + body).
    pub fn wire_size(&self) -> u64 {
        wire_size(self.header.len(), self.body.len())
    }

    /// Body with an empty payload replaced by `{}`.
    pub fn normalized_body(&self) -> Bytes {
        if self.body.is_empty() {
            Bytes::from_static(EMPTY_BODY.as_bytes())
        } else {
            self.body.clone()
        }
    }
}

fn wire_size(header_len: usize, body_len: usize) -> u64 {
    PREAMBLE_SIZE as u64 + header_len as u64 + body_len as u64
}

/// Encode a packet into the wire format.
///
/// Wire format (all integers big-endian):
/// ```text
/// ┌────────────┬────────────┬────────────┬────────────┬──────────┬──────────┐
/// │ Operator   │ Sequence   │ Header len │ Body len   │ Header   │ Body     │
/// │ (4B u32)   │ (8B i64)   │ (4B u32)   │ (4B u32)   │ (UTF-8)  │ (bytes)  │
/// └────────────┴────────────┴────────────┴────────────┴──────────┴──────────┘
/// ```
///
/// Fails with `OversizedFrame` if the encoded frame would exceed `max_frame`.
pub fn encode_packet(packet: &Packet, dst: &mut BytesMut, max_frame: usize) -> Result<()> {
    let size = packet.wire_size();
    if size > max_frame as u64 {
        return Err(FrameError::OversizedFrame {
            size,
            max: max_frame,
        });
    }
    let (header_len, body_len) = match (
        u32::try_from(packet.header.len()),
        u32::try_from(packet.body.len()),
    ) {
        (Ok(h), Ok(b)) => (h, b),
        _ => {
            return Err(FrameError::OversizedFrame {
                size,
                max: max_frame,
            })
        }
    };

    dst.reserve(size as usize);
    dst.put_u32(packet.operator);
    dst.put_i64(packet.sequence);
    dst.put_u32(header_len);
    dst.put_u32(body_len);
    dst.put_slice(packet.header.as_bytes());
    dst.put_slice(&packet.body);
    Ok(())
}

struct Preamble {
    operator: u32,
    sequence: i64,
    header_len: usize,
    body_len: usize,
}

impl Preamble {
    fn read(mut src: &[u8]) -> Self {
        Self {
            operator: src.get_u32(),
            sequence: src.get_i64(),
            header_len: src.get_u32() as usize,
            body_len: src.get_u32() as usize,
        }
    }

    /// Total declared frame size, checked against the ceiling.
    fn checked_size(&self, max_frame: usize) -> Result<u64> {
        let size = wire_size(self.header_len, self.body_len);
        if size > max_frame as u64 {
            return Err(FrameError::OversizedFrame {
                size,
                max: max_frame,
            });
        }
        Ok(size)
    }
}

/// Decode exactly one packet from a complete message.
///
/// The size ceiling is enforced from the preamble alone, before anything is
/// copied out of `src`. The message must hold exactly the declared number of
/// bytes: a short buffer or trailing bytes are both `MalformedFrame`.
pub fn decode_packet(src: &[u8], max_frame: usize) -> Result<Packet> {
    if src.len() < PREAMBLE_SIZE {
        return Err(FrameError::MalformedFrame {
            declared: PREAMBLE_SIZE as u64,
            actual: src.len(),
        });
    }

    let preamble = Preamble::read(&src[..PREAMBLE_SIZE]);
    let size = preamble.checked_size(max_frame)?;
    if src.len() as u64 != size {
        return Err(FrameError::MalformedFrame {
            declared: size,
            actual: src.len(),
        });
    }

    let header_end = PREAMBLE_SIZE + preamble.header_len;
    let header = String::from_utf8(src[PREAMBLE_SIZE..header_end].to_vec())?;
    let body = Bytes::copy_from_slice(&src[header_end..header_end + preamble.body_len]);

    Ok(Packet {
        operator: preamble.operator,
        sequence: preamble.sequence,
        header,
        body,
    })
}

/// Decode a packet from a stream buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete packet yet.
/// On success, consumes the packet bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_frame: usize) -> Result<Option<Packet>> {
    if src.len() < PREAMBLE_SIZE {
        return Ok(None); // Need more data
    }

    let preamble = Preamble::read(&src[..PREAMBLE_SIZE]);
    let size = preamble.checked_size(max_frame)? as usize;
    if src.len() < size {
        src.reserve(size - src.len());
        return Ok(None); // Need more data
    }

    let frame = src.split_to(size);
    decode_packet(&frame, max_frame).map(Some)
}

/// Configuration for the packet codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum frame size in bytes, preamble included. Default: 1 MiB.
    pub max_frame_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_packet(packet, &mut buf, DEFAULT_MAX_FRAME).unwrap();
        buf
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let packet = Packet::new(
            0xDEAD_BEEF,
            1_700_000_000_123,
            "token=abc;lang=en;",
            Bytes::from_static(br#"{"msg":"hi"}"#),
        );

        let buf = encode(&packet);
        assert_eq!(buf.len() as u64, packet.wire_size());

        let decoded = decode_packet(&buf, DEFAULT_MAX_FRAME).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_preamble_layout_is_big_endian() {
        let packet = Packet::new(0x0102_0304, -2, "a=b;", Bytes::from_static(b"xyz"));
        let buf = encode(&packet);

        assert_eq!(&buf[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[4..12], &(-2i64).to_be_bytes());
        assert_eq!(&buf[12..16], &4u32.to_be_bytes());
        assert_eq!(&buf[16..20], &3u32.to_be_bytes());
        assert_eq!(&buf[20..24], b"a=b;");
        assert_eq!(&buf[24..], b"xyz");
    }

    #[test]
    fn test_header_length_counts_utf8_bytes() {
        let packet = Packet::new(1, 1, "name=zoë;", Bytes::new());
        let buf = encode(&packet);
        assert_eq!(&buf[12..16], &10u32.to_be_bytes());
        assert_eq!(decode_packet(&buf, DEFAULT_MAX_FRAME).unwrap().header, "name=zoë;");
    }

    #[test]
    fn test_decode_short_preamble() {
        let err = decode_packet(&[0u8; 7], DEFAULT_MAX_FRAME).unwrap_err();
        assert!(matches!(
            err,
            FrameError::MalformedFrame {
                declared: 20,
                actual: 7
            }
        ));
    }

    #[test]
    fn test_decode_truncated_body() {
        let packet = Packet::new(5, 9, "", Bytes::from_static(b"hello world"));
        let mut buf = encode(&packet);
        buf.truncate(PREAMBLE_SIZE + 4);

        let err = decode_packet(&buf, DEFAULT_MAX_FRAME).unwrap_err();
        assert!(matches!(
            err,
            FrameError::MalformedFrame {
                declared: 31,
                actual: 24
            }
        ));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut buf = encode(&Packet::new(5, 9, "", Bytes::from_static(b"{}")));
        buf.put_u8(0);

        let err = decode_packet(&buf, DEFAULT_MAX_FRAME).unwrap_err();
        assert!(matches!(err, FrameError::MalformedFrame { .. }));
    }

    #[test]
    fn test_decode_oversized_checked_before_body() {
        // Only the preamble is present; the declared lengths alone must trip the check.
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_i64(1);
        buf.put_u32(u32::MAX);
        buf.put_u32(u32::MAX);

        let err = decode_packet(&buf, DEFAULT_MAX_FRAME).unwrap_err();
        match err {
            FrameError::OversizedFrame { size, max } => {
                assert_eq!(size, 20 + 2 * u32::MAX as u64);
                assert_eq!(max, DEFAULT_MAX_FRAME);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_limit_includes_preamble() {
        let body = vec![b'x'; 100 - PREAMBLE_SIZE];
        let packet = Packet::new(1, 1, "", body);
        let buf = encode(&packet);

        assert!(decode_packet(&buf, 100).is_ok());
        assert!(matches!(
            decode_packet(&buf, 99),
            Err(FrameError::OversizedFrame { size: 100, max: 99 })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let packet = Packet::new(1, 1, "", vec![0u8; 64]);
        let mut buf = BytesMut::new();
        let err = encode_packet(&packet, &mut buf, 32).unwrap_err();
        assert!(matches!(err, FrameError::OversizedFrame { size: 84, max: 32 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_invalid_utf8_header() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_i64(1);
        buf.put_u32(2);
        buf.put_u32(0);
        buf.put_slice(&[0xFF, 0xFE]);

        let err = decode_packet(&buf, DEFAULT_MAX_FRAME).unwrap_err();
        assert!(matches!(err, FrameError::InvalidUtf8(_)));
    }

    #[test]
    fn test_empty_body_normalized() {
        let packet = decode_packet(&encode(&Packet::new(3, 4, "", Bytes::new())), DEFAULT_MAX_FRAME)
            .unwrap();
        assert!(packet.body.is_empty());
        assert_eq!(packet.normalized_body().as_ref(), EMPTY_BODY.as_bytes());

        let full = Packet::new(3, 4, "", Bytes::from_static(b"[1]"));
        assert_eq!(full.normalized_body().as_ref(), b"[1]");
    }

    #[test]
    fn test_ping_packet() {
        let packet = Packet::ping("", Bytes::from_static(b"{}"));
        assert!(packet.is_ping());
        assert_eq!(packet.sequence, 0);
    }

    #[test]
    fn test_stream_decode_partial_then_complete() {
        let first = Packet::new(1, 10, "k=v;", Bytes::from_static(b"one"));
        let second = Packet::new(2, 20, "", Bytes::from_static(b"two"));
        let mut wire = encode(&first);
        wire.extend_from_slice(&encode(&second));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..PREAMBLE_SIZE + 2]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().is_none());

        buf.extend_from_slice(&wire[PREAMBLE_SIZE + 2..]);
        let f1 = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        let f2 = decode_frame(&mut buf, DEFAULT_MAX_FRAME).unwrap().unwrap();
        assert_eq!(f1, first);
        assert_eq!(f2, second);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_stream_decode_oversized() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_i64(1);
        buf.put_u32(0);
        buf.put_u32(1024);

        let err = decode_frame(&mut buf, 512).unwrap_err();
        assert!(matches!(err, FrameError::OversizedFrame { .. }));
    }

    #[test]
    fn test_frame_config_default() {
        assert_eq!(FrameConfig::default().max_frame_size, 1_048_576);
    }
}
