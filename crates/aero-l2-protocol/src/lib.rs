//! Framing for the L2 tunnel (`aero-l2-tunnel-v1`).
//!
//! Every record on the tunnel socket is a fixed 8-byte header followed by
//! the payload:
//!
//! ```text
//! [ version u8 | msg_type u8 | flags u8 | reserved u8 | payload_len u32 BE ]
//! ```
//!
//! FRAME payloads are raw ethernet frames. PING/PONG carry an opaque payload
//! echoed back verbatim. ERROR payloads are either free-form UTF-8 or the
//! structured form (`[code u16 BE | msg_len u16 BE | msg]`) handled by
//! [`encode_structured_error_payload`] / [`decode_structured_error_payload`].
//!
//! Decoding is strict: wrong version, unknown type, non-zero reserved byte,
//! or a length that disagrees with the record all fail. Both directions
//! enforce [`Limits`] so a hostile peer cannot make us buffer an arbitrarily
//! large payload.

pub const L2_TUNNEL_VERSION: u8 = 1;

pub const L2_TUNNEL_TYPE_FRAME: u8 = 1;
pub const L2_TUNNEL_TYPE_PING: u8 = 2;
pub const L2_TUNNEL_TYPE_PONG: u8 = 3;
pub const L2_TUNNEL_TYPE_ERROR: u8 = 4;

pub const L2_TUNNEL_HEADER_LEN: usize = 8;

/// Subprotocol tag negotiated during the WebSocket upgrade.
pub const TUNNEL_SUBPROTOCOL: &str = "aero-l2-tunnel-v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_payload: usize,
}

impl Default for Limits {
    fn default() -> Self {
        // Generous enough for jumbo ethernet frames and error payloads.
        Self { max_payload: 64 * 1024 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2ProtocolError {
    Truncated { len: usize },
    BadVersion { found: u8 },
    UnknownType { found: u8 },
    ReservedNotZero { found: u8 },
    LengthMismatch { declared: usize, actual: usize },
    PayloadTooLarge { len: usize, max: usize },
}

impl std::fmt::Display for L2ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Truncated { len } => write!(f, "truncated record ({len} bytes)"),
            Self::BadVersion { found } => write!(f, "unsupported version {found}"),
            Self::UnknownType { found } => write!(f, "unknown message type {found}"),
            Self::ReservedNotZero { found } => write!(f, "reserved byte is 0x{found:02x}"),
            Self::LengthMismatch { declared, actual } => {
                write!(f, "declared payload length {declared} does not match {actual}")
            }
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload length {len} exceeds limit {max}")
            }
        }
    }
}

impl std::error::Error for L2ProtocolError {}

/// A decoded record, borrowing the payload from the wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2Message<'a> {
    pub version: u8,
    pub msg_type: u8,
    pub flags: u8,
    pub payload: &'a [u8],
}

fn known_type(msg_type: u8) -> bool {
    matches!(
        msg_type,
        L2_TUNNEL_TYPE_FRAME | L2_TUNNEL_TYPE_PING | L2_TUNNEL_TYPE_PONG | L2_TUNNEL_TYPE_ERROR
    )
}

pub fn encode_with_limits(
    msg_type: u8,
    flags: u8,
    payload: &[u8],
    limits: &Limits,
) -> Result<Vec<u8>, L2ProtocolError> {
    if payload.len() > limits.max_payload {
        return Err(L2ProtocolError::PayloadTooLarge {
            len: payload.len(),
            max: limits.max_payload,
        });
    }
    let mut out = Vec::with_capacity(L2_TUNNEL_HEADER_LEN + payload.len());
    out.push(L2_TUNNEL_VERSION);
    out.push(msg_type);
    out.push(flags);
    out.push(0);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, L2ProtocolError> {
    encode_with_limits(L2_TUNNEL_TYPE_FRAME, 0, payload, &Limits::default())
}

pub fn encode_ping(payload: Option<&[u8]>) -> Result<Vec<u8>, L2ProtocolError> {
    encode_with_limits(L2_TUNNEL_TYPE_PING, 0, payload.unwrap_or(&[]), &Limits::default())
}

pub fn encode_pong(payload: Option<&[u8]>) -> Result<Vec<u8>, L2ProtocolError> {
    encode_with_limits(L2_TUNNEL_TYPE_PONG, 0, payload.unwrap_or(&[]), &Limits::default())
}

pub fn decode_message_with_limits<'a>(
    bytes: &'a [u8],
    limits: &Limits,
) -> Result<L2Message<'a>, L2ProtocolError> {
    if bytes.len() < L2_TUNNEL_HEADER_LEN {
        return Err(L2ProtocolError::Truncated { len: bytes.len() });
    }
    let version = bytes[0];
    if version != L2_TUNNEL_VERSION {
        return Err(L2ProtocolError::BadVersion { found: version });
    }
    let msg_type = bytes[1];
    if !known_type(msg_type) {
        return Err(L2ProtocolError::UnknownType { found: msg_type });
    }
    let flags = bytes[2];
    if bytes[3] != 0 {
        return Err(L2ProtocolError::ReservedNotZero { found: bytes[3] });
    }
    let declared = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
    if declared > limits.max_payload {
        return Err(L2ProtocolError::PayloadTooLarge { len: declared, max: limits.max_payload });
    }
    let actual = bytes.len() - L2_TUNNEL_HEADER_LEN;
    if declared != actual {
        return Err(L2ProtocolError::LengthMismatch { declared, actual });
    }
    Ok(L2Message { version, msg_type, flags, payload: &bytes[L2_TUNNEL_HEADER_LEN..] })
}

pub fn decode_message(bytes: &[u8]) -> Result<L2Message<'_>, L2ProtocolError> {
    decode_message_with_limits(bytes, &Limits::default())
}

/// `[code u16 BE | msg_len u16 BE]` ahead of the UTF-8 message.
pub const L2_TUNNEL_ERROR_STRUCTURED_HEADER_LEN: usize = 4;

/// Builds a structured ERROR payload that fits in `max_len` bytes. The
/// message is truncated on a UTF-8 character boundary; when not even the
/// header fits, the payload is empty.
pub fn encode_structured_error_payload(code: u16, message: &str, max_len: usize) -> Vec<u8> {
    if max_len < L2_TUNNEL_ERROR_STRUCTURED_HEADER_LEN {
        return Vec::new();
    }
    let budget = max_len - L2_TUNNEL_ERROR_STRUCTURED_HEADER_LEN;
    let mut keep = message.len().min(budget);
    while keep > 0 && !message.is_char_boundary(keep) {
        keep -= 1;
    }
    let kept = &message[..keep];

    let mut out = Vec::with_capacity(L2_TUNNEL_ERROR_STRUCTURED_HEADER_LEN + kept.len());
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(&(kept.len() as u16).to_be_bytes());
    out.extend_from_slice(kept.as_bytes());
    out
}

/// Decodes a structured ERROR payload. `None` for anything malformed: short
/// payloads, a length that is not exact, or a message that is not UTF-8.
pub fn decode_structured_error_payload(payload: &[u8]) -> Option<(u16, &str)> {
    if payload.len() < L2_TUNNEL_ERROR_STRUCTURED_HEADER_LEN {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let msg_len = u16::from_be_bytes([payload[2], payload[3]]) as usize;
    let msg_bytes = &payload[L2_TUNNEL_ERROR_STRUCTURED_HEADER_LEN..];
    if msg_bytes.len() != msg_len {
        return None;
    }
    let msg = std::str::from_utf8(msg_bytes).ok()?;
    Some((code, msg))
}
