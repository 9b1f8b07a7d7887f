//! Wire framing for TradingView's `~m~<len>~m~<payload>` protocol.
//!
//! The codec itself separates heartbeats from protocol messages rather than
//! leaving that classification to the caller.

use rand::{Rng, distr::Alphanumeric};
use serde::Serialize;
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::warn;

use crate::error::Result;

/// One `method(params...)` message sent to the server.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    pub m: &'static str,
    pub p: Vec<Value>,
}

impl OutgoingMessage {
    pub fn new(m: &'static str, p: Vec<Value>) -> Self {
        Self { m, p }
    }
}

/// A message received from the server after JSON decoding.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct RawMessage {
    pub m: String,
    pub p: Vec<Value>,
}

/// One reclassified unit produced by [`decode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A `~h~<n>` heartbeat. Holds the complete framed bytes so the caller
    /// can echo them back byte-identical.
    Heartbeat(String),
    Message(RawMessage),
}

/// Encode one message as `~m~<len>~m~<json>`.
pub fn encode(message: &OutgoingMessage) -> Result<Message> {
    let json = serde_json::to_string(message)?;
    Ok(Message::text(format!("~m~{}~m~{}", json.len(), json)))
}

/// Encode a raw heartbeat frame, used by the heartbeat manager to echo.
pub fn encode_raw(framed: &str) -> Message {
    Message::text(framed.to_string())
}

/// Split a socket text payload (which may concatenate several frames) into
/// [`Frame`]s. Unparsable payloads are skipped with a warning, never
/// propagated as an error.
pub fn decode(text: &str) -> Vec<Frame> {
    let mut frames = Vec::new();
    let bytes = text.as_bytes();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let Some(rest) = text.get(pos..) else { break };
        let Some(marker) = rest.strip_prefix("~m~") else {
            warn!("frame decode: expected ~m~ marker at offset {pos}, stopping");
            break;
        };

        let digits_end = marker.find("~m~").unwrap_or(0);
        if digits_end == 0 || !marker[..digits_end].bytes().all(|b| b.is_ascii_digit()) {
            warn!("frame decode: malformed length prefix, stopping");
            break;
        }

        let len: usize = match marker[..digits_end].parse() {
            Ok(n) => n,
            Err(_) => {
                warn!("frame decode: non-numeric length, stopping");
                break;
            }
        };

        let payload_start = pos + 3 + digits_end + 3;
        let payload_end = payload_start + len;
        if payload_end > bytes.len() {
            warn!("frame decode: declared length {len} exceeds remaining buffer, stopping");
            break;
        }

        if !text.is_char_boundary(payload_start) || !text.is_char_boundary(payload_end) {
            warn!("frame decode: declared length {len} splits a UTF-8 character, stopping");
            break;
        }

        let payload = &text[payload_start..payload_end];
        if payload.starts_with("~h~") {
            frames.push(Frame::Heartbeat(format!("~m~{len}~m~{payload}")));
        } else {
            match serde_json::from_str::<RawMessage>(payload) {
                Ok(msg) => frames.push(Frame::Message(msg)),
                Err(e) => warn!("frame decode: skipping unparsable payload: {e}"),
            }
        }

        pos = payload_end;
    }

    frames
}

/// Generate a client-minted session id: `prefix_<12 alnum>`.
pub fn gen_session_id(prefix: &str) -> String {
    format!("{prefix}_{}", gen_id())
}

/// 12 random alphanumeric characters.
pub fn gen_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Build the `={"symbol":...}` literal form consumed by `resolve_symbol`/
/// `create_series`.
pub fn symbol_spec(symbol: &str, adjustment: Option<&str>, session: Option<&str>) -> Result<String> {
    let mut map = serde_json::Map::new();
    map.insert("symbol".to_string(), Value::from(symbol));
    if let Some(a) = adjustment {
        map.insert("adjustment".to_string(), Value::from(a));
    }
    if let Some(s) = session {
        map.insert("session".to_string(), Value::from(s));
    }
    let json = serde_json::to_value(map)?;
    Ok(format!("={json}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_then_decodes_a_message() {
        let msg = OutgoingMessage::new("set_locale", vec![Value::from("en"), Value::from("US")]);
        let encoded = encode(&msg).unwrap();
        let text = encoded.into_text().unwrap();
        let frames = decode(&text);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Message(m) => {
                assert_eq!(m.m, "set_locale");
                assert_eq!(m.p, vec![Value::from("en"), Value::from("US")]);
            }
            other => panic!("expected Message frame, got {other:?}"),
        }
    }

    #[test]
    fn decodes_heartbeat() {
        let framed = "~m~4~m~~h~1";
        let frames = decode(framed);
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::Heartbeat(s) if s == framed));
    }

    #[test]
    fn decodes_concatenated_heartbeat_and_message() {
        let hb = "~m~4~m~~h~1";
        let msg = OutgoingMessage::new("ping_ack", vec![]);
        let msg_text = encode(&msg).unwrap().into_text().unwrap();
        let combined = format!("{hb}{msg_text}");
        let frames = decode(&combined);
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Frame::Heartbeat(_)));
        assert!(matches!(&frames[1], Frame::Message(_)));
    }

    #[test]
    fn skips_unparsable_payload_without_panicking() {
        let bad = "~m~7~m~not{json";
        let frames = decode(bad);
        assert!(frames.is_empty());
    }

    #[test]
    fn gen_session_id_has_expected_shape() {
        let id = gen_session_id("cs");
        assert!(id.starts_with("cs_"));
        assert_eq!(id.len(), 3 + 12);
    }

    #[test]
    fn symbol_spec_builds_expected_literal() {
        let spec = symbol_spec("NSE:RELIANCE", Some("dividends"), None).unwrap();
        assert_eq!(
            spec,
            r#"={"adjustment":"dividends","symbol":"NSE:RELIANCE"}"#
        );
    }
}
