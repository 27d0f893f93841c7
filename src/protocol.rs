//! Server List Ping wire codec.
//!
//! Outbound: a Handshake packet declaring the status state, followed by the fixed Status
//! Request packet. Inbound: `VarInt length | 0x00 | VarInt json_length | json`.

use serde::Deserialize;
use serde_json::value::RawValue;

use crate::error::{DecodeError, EncodeError};

/// Port game servers listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 25565;

/// Protocol version announced in the handshake (encodes as `0xF8 0x05`).
pub const PROTOCOL_VERSION: u32 = 760;

/// Handshake `next_state` value requesting the status state.
pub const NEXT_STATE_STATUS: u32 = 1;

/// Packet id of both the handshake and the status response.
pub const STATUS_RESPONSE_ID: u8 = 0x00;

/// A VarInt never spans more than this many bytes (32 payload bits).
pub const MAX_VARINT_LEN: usize = 5;

/// Largest value a single-byte VarInt can hold.
const SINGLE_BYTE_VARINT_MAX: usize = 0x7F;

/// Status Request frame: length 1, packet id 0.
const STATUS_REQUEST: [u8; 2] = [0x01, 0x00];

const SEGMENT_BITS: u8 = 0x7F;
const CONTINUE_BIT: u8 = 0x80;

/// Longest host string the handshake builder accepts.
///
/// The handshake body is `id(1) + version(2) + host_len(1) + host + port(2) + next_state(1)`
/// and its length must fit in one VarInt byte.
pub const MAX_HOST_LEN: usize = SINGLE_BYTE_VARINT_MAX - 7;

/// Append `value` to `out` as a VarInt, 7 bits per byte, low group first.
pub fn encode_varint(mut value: u32, out: &mut Vec<u8>) {
    loop {
        let byte = (value & u32::from(SEGMENT_BITS)) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | CONTINUE_BIT);
    }
}

/// Decode a VarInt from the start of `buf`, reading no further than `bound` bytes.
///
/// Returns the value and the number of bytes consumed.
/// - `Overrun` if the bound (or the buffer) ends before the final byte.
/// - `TooLarge` if the value would need more than [`MAX_VARINT_LEN`] bytes.
pub fn decode_varint(buf: &[u8], bound: usize) -> Result<(u32, usize), DecodeError> {
    let bound = bound.min(buf.len());
    let mut value: u32 = 0;

    for (idx, &byte) in buf[..bound].iter().enumerate() {
        value |= u32::from(byte & SEGMENT_BITS) << (7 * idx);
        if byte & CONTINUE_BIT == 0 {
            return Ok((value, idx + 1));
        }
        if idx + 1 >= MAX_VARINT_LEN {
            return Err(DecodeError::TooLarge);
        }
    }

    Err(DecodeError::Overrun)
}

/// Build the Handshake packet for `host:port` followed by the Status Request packet.
///
/// The host length prefix and the frame length are both written as single-byte VarInts, so
/// hosts longer than [`MAX_HOST_LEN`] are rejected instead of being truncated.
pub fn encode_handshake_and_status_request(host: &str, port: u16) -> Result<Vec<u8>, EncodeError> {
    let host_bytes = host.as_bytes();
    if host_bytes.len() > MAX_HOST_LEN {
        return Err(EncodeError::HostTooLong {
            len: host_bytes.len(),
            max: MAX_HOST_LEN,
        });
    }

    let mut body = Vec::with_capacity(host_bytes.len() + 8);
    body.push(0x00);
    encode_varint(PROTOCOL_VERSION, &mut body);
    encode_varint(host_bytes.len() as u32, &mut body);
    body.extend_from_slice(host_bytes);
    body.extend_from_slice(&port.to_be_bytes());
    encode_varint(NEXT_STATE_STATUS, &mut body);

    // Guarded by MAX_HOST_LEN; kept as a hard check in case the body layout changes.
    if body.len() > SINGLE_BYTE_VARINT_MAX {
        return Err(EncodeError::HostTooLong {
            len: host_bytes.len(),
            max: MAX_HOST_LEN,
        });
    }

    let mut packet = Vec::with_capacity(body.len() + 1 + STATUS_REQUEST.len());
    encode_varint(body.len() as u32, &mut packet);
    packet.extend_from_slice(&body);
    packet.extend_from_slice(&STATUS_REQUEST);
    Ok(packet)
}

/// Parse a status response frame and return its JSON payload as text.
///
/// The outer frame length is decoded but not enforced; the JSON length is.
pub fn parse_status_response(buf: &[u8]) -> Result<&str, DecodeError> {
    let (_frame_len, mut pos) = decode_varint(buf, buf.len())?;

    let packet_id = *buf.get(pos).ok_or(DecodeError::Truncated {
        declared: 1,
        available: 0,
    })?;
    if packet_id != STATUS_RESPONSE_ID {
        return Err(DecodeError::UnexpectedPacketType(packet_id));
    }
    pos += 1;

    let rest = &buf[pos..];
    let (json_len, consumed) = decode_varint(rest, rest.len())?;
    let payload = &rest[consumed..];
    let json_len = json_len as usize;
    if payload.len() < json_len {
        return Err(DecodeError::Truncated {
            declared: json_len,
            available: payload.len(),
        });
    }

    std::str::from_utf8(&payload[..json_len]).map_err(|_| DecodeError::InvalidUtf8)
}

/// Validate the payload as JSON, keeping its exact text.
pub fn parse_status_json(json: &str) -> Result<Box<RawValue>, DecodeError> {
    RawValue::from_string(json.to_owned()).map_err(|e| DecodeError::InvalidJson(e.to_string()))
}

/// Whether `buf` already holds the whole frame its length prefix announces.
///
/// A malformed prefix counts as complete: there is nothing more worth waiting for.
pub fn is_complete_frame(buf: &[u8]) -> bool {
    match decode_varint(buf, buf.len()) {
        Ok((len, consumed)) => buf.len() - consumed >= len as usize,
        Err(DecodeError::Overrun) => false,
        Err(_) => true,
    }
}

/// Typed view of the well-known status fields, used for log output.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusSummary {
    #[serde(default)]
    pub version: Option<VersionInfo>,
    #[serde(default)]
    pub players: Option<PlayersInfo>,
    #[serde(default)]
    pub description: Option<serde_json::Value>,
    #[serde(default)]
    pub favicon: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub protocol: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayersInfo {
    pub online: i64,
    pub max: i64,
}

impl StatusSummary {
    /// Best-effort summary; anything unexpected just yields empty fields.
    pub fn from_raw(raw: &RawValue) -> Self {
        serde_json::from_str(raw.get()).unwrap_or_default()
    }

    /// Plain text of the description, flattening text components.
    pub fn motd(&self) -> Option<String> {
        let description = self.description.as_ref()?;
        let mut out = String::new();
        collect_text(description, &mut out);
        let trimmed = out.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_owned())
    }

    /// Whether the server sent a non-empty favicon.
    pub fn has_favicon(&self) -> bool {
        self.favicon.as_deref().is_some_and(|f| !f.trim().is_empty())
    }
}

fn collect_text(component: &serde_json::Value, out: &mut String) {
    match component {
        serde_json::Value::String(s) => out.push_str(s),
        serde_json::Value::Array(parts) => parts.iter().for_each(|p| collect_text(p, out)),
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(text)) = map.get("text") {
                out.push_str(text);
            }
            if let Some(extra) = map.get("extra") {
                collect_text(extra, out);
            }
        }
        _ => {}
    }
}

impl std::fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{} ({})", v.name, v.protocol)?,
            None => f.write_str("unknown version")?,
        }
        if let Some(p) = &self.players {
            write!(f, ", {}/{} players", p.online, p.max)?;
        }
        if let Some(motd) = self.motd() {
            write!(f, ", \"{motd}\"")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_version_encodes_as_two_bytes() {
        let mut out = Vec::new();
        encode_varint(PROTOCOL_VERSION, &mut out);
        assert_eq!(out, vec![0xF8, 0x05]);
    }

    #[test]
    fn varint_known_values() {
        let cases: &[(u32, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (255, &[0xFF, 0x01]),
            (25565, &[0xDD, 0xC7, 0x01]),
            (2_147_483_647, &[0xFF, 0xFF, 0xFF, 0xFF, 0x07]),
        ];
        for &(value, bytes) in cases {
            let mut out = Vec::new();
            encode_varint(value, &mut out);
            assert_eq!(out, bytes, "encoding {value}");
            assert_eq!(decode_varint(bytes, bytes.len()), Ok((value, bytes.len())));
        }
    }

    #[test]
    fn decode_respects_caller_bound() {
        // Buffer holds a complete two-byte VarInt but the caller only allows one byte.
        let buf = [0x80, 0x01];
        assert_eq!(decode_varint(&buf, 1), Err(DecodeError::Overrun));
        assert_eq!(decode_varint(&buf, 10), Ok((128, 2)));
    }

    #[test]
    fn five_continuation_bytes_are_too_large() {
        let buf = [0x80; 5];
        assert_eq!(decode_varint(&buf, buf.len()), Err(DecodeError::TooLarge));
    }

    #[test]
    fn frame_completeness() {
        assert!(!is_complete_frame(&[]));
        assert!(!is_complete_frame(&[0x04, 0x00, 0x02]));
        assert!(is_complete_frame(&[0x04, 0x00, 0x02, b'{', b'}']));
        assert!(is_complete_frame(&[0xFF; 6]));
    }

    #[test]
    fn summary_flattens_text_components() {
        let raw = parse_status_json(
            r#"{"version":{"name":"1.19.2","protocol":760},
                "players":{"online":3,"max":20},
                "description":{"text":"Hello ","extra":[{"text":"world"}]}}"#,
        )
        .unwrap();
        let summary = StatusSummary::from_raw(&raw);
        assert_eq!(summary.motd().as_deref(), Some("Hello world"));
        assert_eq!(summary.to_string(), "1.19.2 (760), 3/20 players, \"Hello world\"");
        assert!(!summary.has_favicon());
    }

    #[test]
    fn summary_tolerates_odd_payloads() {
        let raw = parse_status_json(r#"{"description":"plain motd","players":"nope"}"#).unwrap();
        let summary = StatusSummary::from_raw(&raw);
        // `players` has the wrong shape, so the whole typed view falls back to empty.
        assert!(summary.version.is_none());
        assert_eq!(summary.to_string(), "unknown version");
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(matches!(
            parse_status_json("{not json"),
            Err(DecodeError::InvalidJson(_))
        ));
    }
}
