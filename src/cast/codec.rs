//! CASTV2 wire codec
//!
//! Cast receivers speak length-prefixed protobuf frames over TLS. The
//! message schema is small and stable (seven fields, two wire types), so
//! the frames are encoded and decoded by hand instead of pulling in a
//! protobuf toolchain.

use serde_json::Value;

use crate::{Error, Result};

/// Default Media Receiver application
pub const DEFAULT_MEDIA_RECEIVER_APP_ID: &str = "CC1AD845";

pub const NAMESPACE_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
pub const NAMESPACE_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub const NAMESPACE_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
pub const NAMESPACE_MEDIA: &str = "urn:x-cast:com.google.cast.media";

/// A decoded control-channel message
#[derive(Debug, Clone)]
pub struct Frame {
    pub source_id: String,
    pub namespace: String,
    pub payload: String,
}

/// Encode a CastMessage with a UTF-8 payload, prefixed by its big-endian
/// length.
pub fn encode_frame(
    source_id: &str,
    destination_id: &str,
    namespace: &str,
    payload: &str,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    write_varint_field(&mut body, 1, 0); // protocol_version CASTV2_1_0
    write_string_field(&mut body, 2, source_id);
    write_string_field(&mut body, 3, destination_id);
    write_string_field(&mut body, 4, namespace);
    write_varint_field(&mut body, 5, 0); // payload_type STRING
    write_string_field(&mut body, 6, payload);

    let len: u32 = body
        .len()
        .try_into()
        .map_err(|_| Error::Connection("cast frame too large".to_string()))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a CastMessage body (without the length prefix)
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let mut cursor = 0usize;
    let mut source_id = String::new();
    let mut namespace = String::new();
    let mut payload = String::new();

    while cursor < bytes.len() {
        let key = read_varint(bytes, &mut cursor)
            .ok_or_else(|| Error::Connection("invalid cast frame key".to_string()))?;
        let field_number = (key >> 3) as u32;
        let wire_type = (key & 0x07) as u8;
        match wire_type {
            0 => {
                read_varint(bytes, &mut cursor)
                    .ok_or_else(|| Error::Connection("invalid cast frame varint".to_string()))?;
            }
            2 => {
                let len = read_varint(bytes, &mut cursor)
                    .ok_or_else(|| Error::Connection("invalid cast frame length".to_string()))?
                    as usize;
                if cursor + len > bytes.len() {
                    return Err(Error::Connection("cast frame string out of bounds".to_string()));
                }
                let value = std::str::from_utf8(&bytes[cursor..cursor + len])
                    .map_err(|_| Error::Connection("cast frame invalid utf8".to_string()))?
                    .to_string();
                match field_number {
                    2 => source_id = value,
                    4 => namespace = value,
                    6 => payload = value,
                    _ => {}
                }
                cursor += len;
            }
            _ => {
                return Err(Error::Connection(
                    "unsupported cast frame wire type".to_string(),
                ))
            }
        }
    }

    Ok(Frame {
        source_id,
        namespace,
        payload,
    })
}

fn write_varint_field(out: &mut Vec<u8>, field_number: u32, value: u64) {
    write_varint(out, u64::from(field_number) << 3);
    write_varint(out, value);
}

fn write_string_field(out: &mut Vec<u8>, field_number: u32, value: &str) {
    write_varint(out, (u64::from(field_number) << 3) | 2);
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(bytes: &[u8], cursor: &mut usize) -> Option<u64> {
    let mut shift = 0u32;
    let mut value = 0u64;
    while *cursor < bytes.len() && shift <= 63 {
        let byte = bytes[*cursor];
        *cursor += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}

/// One entry from a MEDIA_STATUS message
#[derive(Debug, Clone)]
pub struct MediaStatus {
    pub player_state: String,
    pub position_secs: f64,
    pub duration_secs: f64,
    pub idle_reason: Option<String>,
}

/// Parse the first status entry of a MEDIA_STATUS payload.
///
/// Returns `None` for other media-namespace messages; the receiver sends
/// empty status arrays when no media session exists, which also yields
/// `None`.
pub fn parse_media_status(payload: &str) -> Option<MediaStatus> {
    let value: Value = serde_json::from_str(payload).ok()?;
    if value.get("type").and_then(Value::as_str) != Some("MEDIA_STATUS") {
        return None;
    }
    let status = value.get("status")?.as_array()?.first()?;
    Some(MediaStatus {
        player_state: status
            .get("playerState")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string(),
        position_secs: status
            .get("currentTime")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        duration_secs: status
            .get("media")
            .and_then(|media| media.get("duration"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        idle_reason: status
            .get("idleReason")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    })
}

/// Extract the Default Media Receiver's transport and session ids from a
/// RECEIVER_STATUS payload, once the app has launched.
pub fn find_media_app(payload: &str) -> Option<(String, String)> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let applications = value.get("status")?.get("applications")?.as_array()?;
    for app in applications {
        if app.get("appId").and_then(Value::as_str) == Some(DEFAULT_MEDIA_RECEIVER_APP_ID) {
            let transport_id = app.get("transportId").and_then(Value::as_str)?;
            let session_id = app.get("sessionId").and_then(Value::as_str)?;
            return Some((transport_id.to_string(), session_id.to_string()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let encoded = encode_frame(
            "sender-0",
            "receiver-0",
            NAMESPACE_HEARTBEAT,
            r#"{"type":"PING"}"#,
        )
        .unwrap();

        let len = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        assert_eq!(len, encoded.len() - 4);

        let frame = decode_frame(&encoded[4..]).unwrap();
        assert_eq!(frame.source_id, "sender-0");
        assert_eq!(frame.namespace, NAMESPACE_HEARTBEAT);
        assert_eq!(frame.payload, r#"{"type":"PING"}"#);
    }

    #[test]
    fn long_payload_uses_multibyte_varint() {
        let payload = "x".repeat(300);
        let encoded = encode_frame("a", "b", NAMESPACE_MEDIA, &payload).unwrap();
        let frame = decode_frame(&encoded[4..]).unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let encoded = encode_frame("a", "b", NAMESPACE_MEDIA, "payload").unwrap();
        assert!(decode_frame(&encoded[4..encoded.len() - 2]).is_err());
    }

    #[test]
    fn media_status_with_idle_reason() {
        let payload = r#"{
            "type": "MEDIA_STATUS",
            "status": [{
                "playerState": "IDLE",
                "currentTime": 12.5,
                "idleReason": "FINISHED",
                "media": {"duration": 12.5}
            }]
        }"#;
        let status = parse_media_status(payload).unwrap();
        assert_eq!(status.player_state, "IDLE");
        assert_eq!(status.idle_reason.as_deref(), Some("FINISHED"));
        assert!((status.position_secs - 12.5).abs() < f64::EPSILON);
        assert!((status.duration_secs - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_media_status_yields_none() {
        let payload = r#"{"type": "MEDIA_STATUS", "status": []}"#;
        assert!(parse_media_status(payload).is_none());
    }

    #[test]
    fn receiver_status_transport_id() {
        let payload = r#"{
            "type": "RECEIVER_STATUS",
            "status": {
                "applications": [{
                    "appId": "CC1AD845",
                    "sessionId": "sess-1",
                    "transportId": "transport-9"
                }]
            }
        }"#;
        let (transport_id, session_id) = find_media_app(payload).unwrap();
        assert_eq!(transport_id, "transport-9");
        assert_eq!(session_id, "sess-1");
    }

    #[test]
    fn receiver_status_without_media_app() {
        let payload = r#"{"type": "RECEIVER_STATUS", "status": {"applications": []}}"#;
        assert!(find_media_app(payload).is_none());
    }
}
