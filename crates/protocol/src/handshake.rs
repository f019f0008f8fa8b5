//! Polling handshake response parsing.
//!
//! The handshake body is normally a polling envelope `<len>:0<json>` (or the
//! bare `0<json>` form). Some deployments wrap it differently, so when the
//! envelope is not recognised the JSON object is recovered from the first `{`
//! to the last `}` of the body.

use serde::{Deserialize, Serialize};

/// Engine.IO record separator used when several packets share one polling body.
const RECORD_SEPARATOR: char = '\u{1e}';

/// Session parameters granted by the server during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    /// Milliseconds between client pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

impl Handshake {
    pub fn supports_websocket(&self) -> bool {
        self.upgrades.iter().any(|u| u == "websocket")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeParseError {
    #[error("handshake body contains no JSON object")]
    NoJson,
    #[error("handshake JSON is invalid: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("handshake carries an empty sid")]
    EmptySid,
    #[error("handshake carries a zero {0}")]
    ZeroTiming(&'static str),
}

/// Extract the handshake from a polling response body.
pub fn parse_handshake(body: &str) -> Result<Handshake, HandshakeParseError> {
    let handshake = match parse_envelope(body) {
        Some(handshake) => handshake,
        None => parse_embedded_object(body)?,
    };
    if handshake.sid.is_empty() {
        return Err(HandshakeParseError::EmptySid);
    }
    if handshake.ping_interval == 0 {
        return Err(HandshakeParseError::ZeroTiming("pingInterval"));
    }
    if handshake.ping_timeout == 0 {
        return Err(HandshakeParseError::ZeroTiming("pingTimeout"));
    }
    Ok(handshake)
}

/// Standard path: optional `<len>:` prefix, then the open packet `0{...}`.
fn parse_envelope(body: &str) -> Option<Handshake> {
    let first = body.trim().split(RECORD_SEPARATOR).next()?;
    let packet = match first.split_once(':') {
        Some((len, rest)) if !len.is_empty() && len.bytes().all(|b| b.is_ascii_digit()) => rest,
        _ => first,
    };
    let json = packet.strip_prefix('0')?;
    serde_json::from_str(json).ok()
}

/// Defensive path: the substring between the first `{` and the last `}`.
fn parse_embedded_object(body: &str) -> Result<Handshake, HandshakeParseError> {
    let start = body.find('{').ok_or(HandshakeParseError::NoJson)?;
    let end = body.rfind('}').ok_or(HandshakeParseError::NoJson)?;
    if end < start {
        return Err(HandshakeParseError::NoJson);
    }
    Ok(serde_json::from_str(&body[start..=end])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str =
        r#"{"sid":"abc","pingInterval":25000,"pingTimeout":20000,"upgrades":["websocket"]}"#;

    #[test]
    fn length_prefixed_envelope() {
        let body = format!("{}:0{}", BODY.len() + 1, BODY);
        let hs = parse_handshake(&body).unwrap();
        assert_eq!(hs.sid, "abc");
        assert_eq!(hs.ping_interval, 25000);
        assert_eq!(hs.ping_timeout, 20000);
        assert!(hs.supports_websocket());
    }

    #[test]
    fn bare_open_packet() {
        let hs = parse_handshake(&format!("0{BODY}")).unwrap();
        assert_eq!(hs.sid, "abc");
        assert_eq!(hs.ping_interval, 25000);
    }

    #[test]
    fn open_packet_followed_by_other_records() {
        let body = format!("0{BODY}\u{1e}40");
        assert_eq!(parse_handshake(&body).unwrap().sid, "abc");
    }

    #[test]
    fn plain_json_body() {
        let hs = parse_handshake(BODY).unwrap();
        assert_eq!(hs.sid, "abc");
        assert_eq!(hs.upgrades, vec!["websocket".to_string()]);
    }

    #[test]
    fn non_standard_wrapper_uses_brace_extraction() {
        let body = format!("ok\n)]}}'garbage {BODY} trailing");
        let hs = parse_handshake(&body).unwrap();
        assert_eq!(hs.sid, "abc");
        assert_eq!(hs.ping_timeout, 20000);
    }

    #[test]
    fn missing_upgrades_defaults_to_empty() {
        let hs = parse_handshake(r#"0{"sid":"x","pingInterval":1,"pingTimeout":2}"#).unwrap();
        assert!(hs.upgrades.is_empty());
        assert!(!hs.supports_websocket());
    }

    #[test]
    fn zero_ping_timing_is_rejected() {
        let body = r#"0{"sid":"s1","upgrades":["websocket"],"pingInterval":0,"pingTimeout":0}"#;
        assert!(matches!(
            parse_handshake(body),
            Err(HandshakeParseError::ZeroTiming("pingInterval"))
        ));
        let body = r#"0{"sid":"s1","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":0}"#;
        assert!(matches!(
            parse_handshake(body),
            Err(HandshakeParseError::ZeroTiming("pingTimeout"))
        ));
    }

    #[test]
    fn rejects_bodies_without_json() {
        assert!(matches!(parse_handshake("ok"), Err(HandshakeParseError::NoJson)));
        assert!(matches!(parse_handshake("} {"), Err(HandshakeParseError::NoJson)));
        assert!(matches!(
            parse_handshake("{not json}"),
            Err(HandshakeParseError::InvalidJson(_))
        ));
    }

    #[test]
    fn rejects_empty_sid() {
        assert!(matches!(
            parse_handshake(r#"0{"sid":"","pingInterval":1,"pingTimeout":2}"#),
            Err(HandshakeParseError::EmptySid)
        ));
    }
}
