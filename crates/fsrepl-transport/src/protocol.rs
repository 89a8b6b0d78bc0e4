//! Protocol definitions and serialization for the transport layer.
//!
//! Every message on the wire is a frame with a fixed 24-byte header followed
//! by the payload. A call is a Request frame, optionally followed by the
//! request stream, answered by a Response or ErrorResponse frame, optionally
//! followed by the response stream. A stream is a run of StreamData frames
//! closed by StreamEnd, or cut short by StreamAbort.

use crate::error::{Result, TransportError};

/// Frame header size in bytes (magic:4 + version:1 + kind:1 + flags:2 + request_id:8 + payload_length:4 + checksum:4)
pub const FRAME_HEADER_SIZE: usize = 24;

/// First four bytes of every frame header.
pub const MAGIC: u32 = 0x5A52_5001;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload a single frame may carry (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Longest endpoint name a Request frame may carry.
pub const MAX_ENDPOINT_NAME: usize = 255;

/// Kind of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Call: endpoint name plus structured request.
    Request = 1,
    /// Successful reply: structured response.
    Response = 2,
    /// Failed reply: encoded [`crate::RemoteError`].
    ErrorResponse = 3,
    /// One chunk of a data stream.
    StreamData = 4,
    /// Regular end of a data stream.
    StreamEnd = 5,
    /// The sender could not finish the stream; payload is the reason.
    StreamAbort = 6,
}

impl FrameKind {
    /// Short name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Request => "request",
            FrameKind::Response => "response",
            FrameKind::ErrorResponse => "error response",
            FrameKind::StreamData => "stream data",
            FrameKind::StreamEnd => "stream end",
            FrameKind::StreamAbort => "stream abort",
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = TransportError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Response),
            3 => Ok(FrameKind::ErrorResponse),
            4 => Ok(FrameKind::StreamData),
            5 => Ok(FrameKind::StreamEnd),
            6 => Ok(FrameKind::StreamAbort),
            other => Err(TransportError::InvalidFrame {
                reason: format!("unknown frame kind {}", other),
            }),
        }
    }
}

/// Per-frame flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags {
    /// A data stream follows this Request or Response frame.
    pub has_stream: bool,
}

impl FrameFlags {
    /// Create empty flags
    pub fn empty() -> Self {
        Self::default()
    }

    /// Flags announcing a trailing stream.
    pub fn with_stream() -> Self {
        Self { has_stream: true }
    }

    /// Convert to raw representation
    pub fn as_u16(&self) -> u16 {
        let mut b = 0u16;
        if self.has_stream {
            b |= 0x0001;
        }
        b
    }

    /// Create from raw representation, rejecting unknown bits.
    pub fn from_u16(b: u16) -> Result<Self> {
        if b & !0x0001 != 0 {
            return Err(TransportError::InvalidFrame {
                reason: format!("unknown flag bits 0x{:04X}", b),
            });
        }
        Ok(Self {
            has_stream: (b & 0x0001) != 0,
        })
    }
}

/// Fixed-size header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame kind
    pub kind: FrameKind,
    /// Control flags
    pub flags: FrameFlags,
    /// Call this frame belongs to
    pub request_id: u64,
    /// Bytes following the header.
    pub payload_length: u32,
    /// CRC32 over the payload bytes.
    pub checksum: u32,
}

impl FrameHeader {
    /// Serialize the header into its fixed wire layout.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4] = PROTOCOL_VERSION;
        buf[5] = self.kind as u8;
        buf[6..8].copy_from_slice(&self.flags.as_u16().to_be_bytes());
        buf[8..16].copy_from_slice(&self.request_id.to_be_bytes());
        buf[16..20].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Parse and validate a header.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        if buf[4] != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: buf[4],
            });
        }
        let kind = FrameKind::try_from(buf[5])?;
        let flags = FrameFlags::from_u16(u16::from_be_bytes([buf[6], buf[7]]))?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[8..16]);
        let payload_length = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let checksum = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
        Ok(Self {
            kind,
            flags,
            request_id: u64::from_be_bytes(id),
            payload_length,
            checksum,
        })
    }
}

/// Header plus payload as it travels on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame, computing length and checksum.
    pub fn new(kind: FrameKind, request_id: u64, payload: Vec<u8>, flags: FrameFlags) -> Self {
        let header = FrameHeader {
            kind,
            flags,
            request_id,
            payload_length: payload.len() as u32,
            checksum: crc32fast::hash(&payload),
        };
        Self { header, payload }
    }

    /// Build a Request frame: `name_len (u8) ++ name ++ structured`.
    pub fn request(
        request_id: u64,
        endpoint: &str,
        structured: &[u8],
        has_stream: bool,
    ) -> Result<Self> {
        if endpoint.is_empty() || endpoint.len() > MAX_ENDPOINT_NAME {
            return Err(TransportError::InvalidFrame {
                reason: format!("endpoint name length {} out of range", endpoint.len()),
            });
        }
        let mut payload = Vec::with_capacity(1 + endpoint.len() + structured.len());
        payload.push(endpoint.len() as u8);
        payload.extend_from_slice(endpoint.as_bytes());
        payload.extend_from_slice(structured);
        let flags = if has_stream {
            FrameFlags::with_stream()
        } else {
            FrameFlags::empty()
        };
        Ok(Self::new(FrameKind::Request, request_id, payload, flags))
    }

    /// Split a Request frame into endpoint name and structured request.
    pub fn into_request_parts(self) -> Result<(String, Vec<u8>)> {
        if self.header.kind != FrameKind::Request {
            return Err(TransportError::UnexpectedFrame {
                expected: FrameKind::Request.name(),
                got: self.header.kind.name(),
            });
        }
        let name_len = *self.payload.first().ok_or_else(|| TransportError::InvalidFrame {
            reason: "empty request payload".to_string(),
        })? as usize;
        if name_len == 0 || self.payload.len() < 1 + name_len {
            return Err(TransportError::InvalidFrame {
                reason: "truncated endpoint name".to_string(),
            });
        }
        let name = std::str::from_utf8(&self.payload[1..1 + name_len])
            .map_err(|_| TransportError::InvalidFrame {
                reason: "endpoint name is not utf-8".to_string(),
            })?
            .to_string();
        let mut payload = self.payload;
        let structured = payload.split_off(1 + name_len);
        Ok((name, structured))
    }

    /// Frame kind.
    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    /// Whether a data stream follows this frame.
    pub fn has_stream(&self) -> bool {
        self.header.flags.has_stream
    }

    /// Call this frame belongs to.
    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    /// Serialize header and payload into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a complete encoded frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("frame shorter than header: {} bytes", buf.len()),
            });
        }
        let mut hdr = [0u8; FRAME_HEADER_SIZE];
        hdr.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let header = FrameHeader::decode(&hdr)?;
        let payload = buf[FRAME_HEADER_SIZE..].to_vec();
        if payload.len() != header.payload_length as usize {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "payload length {} does not match header {}",
                    payload.len(),
                    header.payload_length
                ),
            });
        }
        let frame = Frame { header, payload };
        frame.validate()?;
        Ok(frame)
    }

    /// Verify length and checksum against the header.
    pub fn validate(&self) -> Result<()> {
        if self.header.payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: self.header.payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let computed = crc32fast::hash(&self.payload);
        if computed != self.header.checksum {
            return Err(TransportError::ChecksumMismatch {
                expected: self.header.checksum,
                computed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(FrameKind::Response, 0x0102, b"abc".to_vec(), FrameFlags::empty());
        let buf = frame.encode();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 3);
        assert_eq!(&buf[0..4], &MAGIC.to_be_bytes());
        assert_eq!(buf[4], PROTOCOL_VERSION);
        assert_eq!(buf[5], FrameKind::Response as u8);
        assert_eq!(&buf[16..20], &3u32.to_be_bytes());
    }

    #[test]
    fn test_request_parts() {
        let frame = Frame::request(9, "Send", b"payload", true).unwrap();
        assert!(frame.has_stream());
        let (name, structured) = frame.into_request_parts().unwrap();
        assert_eq!(name, "Send");
        assert_eq!(structured, b"payload");
    }

    #[test]
    fn test_request_empty_structured() {
        let frame = Frame::request(1, "ListFilesystems", &[], false).unwrap();
        let (name, structured) = frame.into_request_parts().unwrap();
        assert_eq!(name, "ListFilesystems");
        assert!(structured.is_empty());
    }

    #[test]
    fn test_request_rejects_empty_name() {
        assert!(Frame::request(1, "", b"x", false).is_err());
    }

    #[test]
    fn test_response_is_not_request() {
        let frame = Frame::new(FrameKind::Response, 1, vec![], FrameFlags::empty());
        assert!(matches!(
            frame.into_request_parts(),
            Err(TransportError::UnexpectedFrame { .. })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = Frame::new(FrameKind::StreamEnd, 1, vec![], FrameFlags::empty()).encode();
        buf[0] = 0;
        assert!(matches!(
            Frame::decode(&buf),
            Err(TransportError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_corrupted_payload() {
        let mut buf = Frame::new(FrameKind::StreamData, 1, b"data".to_vec(), FrameFlags::empty()).encode();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(matches!(
            Frame::decode(&buf),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut buf = Frame::new(FrameKind::Response, 1, vec![], FrameFlags::empty()).encode();
        buf[7] = 0x80;
        assert!(Frame::decode(&buf).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = Frame::new(FrameKind::Response, 1, vec![], FrameFlags::empty()).encode();
        buf[5] = 42;
        assert!(matches!(
            Frame::decode(&buf),
            Err(TransportError::InvalidFrame { .. })
        ));
    }
}
