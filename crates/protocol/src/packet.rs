//! Two-layer text framing spoken with the signaling server.
//!
//! Every WebSocket text frame starts with one transport digit:
//! ```text
//! 0 open   1 close   2 ping   3 pong   4 message   5 upgrade   6 noop
//! ```
//! A `4` message carries a second, application digit:
//! ```text
//! 0 connect   1 disconnect   2 event   3 ack   4 error
//! ```
//! An event is `42` followed immediately by a JSON array
//! `[eventName, eventPayload]`, e.g. `42["message",{"type":"offer"}]`.
//! Only the default namespace (`/`) is used.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Noop,
}

impl TransportType {
    pub fn from_digit(c: char) -> Result<Self, PacketError> {
        Ok(match c {
            '0' => Self::Open,
            '1' => Self::Close,
            '2' => Self::Ping,
            '3' => Self::Pong,
            '4' => Self::Message,
            '5' => Self::Upgrade,
            '6' => Self::Noop,
            other => return Err(PacketError::UnknownTransport(other)),
        })
    }

    pub fn digit(self) -> char {
        match self {
            Self::Open => '0',
            Self::Close => '1',
            Self::Ping => '2',
            Self::Pong => '3',
            Self::Message => '4',
            Self::Upgrade => '5',
            Self::Noop => '6',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppType {
    Connect,
    Disconnect,
    Event,
    Ack,
    Error,
}

impl AppType {
    pub fn from_digit(c: char) -> Result<Self, PacketError> {
        Ok(match c {
            '0' => Self::Connect,
            '1' => Self::Disconnect,
            '2' => Self::Event,
            '3' => Self::Ack,
            '4' => Self::Error,
            other => return Err(PacketError::UnknownApp(other)),
        })
    }

    pub fn digit(self) -> char {
        match self {
            Self::Connect => '0',
            Self::Disconnect => '1',
            Self::Event => '2',
            Self::Ack => '3',
            Self::Error => '4',
        }
    }
}

/// A decoded transport-level frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Handshake ack; carries the raw JSON body.
    Open(String),
    Close,
    /// Ping with optional text data (e.g. `probe`).
    Ping(String),
    Pong(String),
    Message(AppPacket),
    Upgrade,
    Noop,
}

/// Application packet carried inside a transport `4` message.
#[derive(Debug, Clone, PartialEq)]
pub enum AppPacket {
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, payload: Value },
    Ack { id: Option<u64>, data: Value },
    Error(Value),
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("empty frame")]
    Empty,
    #[error("unknown transport packet type '{0}'")]
    UnknownTransport(char),
    #[error("unknown application packet type '{0}'")]
    UnknownApp(char),
    #[error("message frame without application type")]
    MissingAppType,
    #[error("namespaced packets are not supported")]
    Namespaced,
    #[error("invalid event: {0}")]
    InvalidEvent(&'static str),
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl Packet {
    /// Build an application event frame.
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Packet::Message(AppPacket::Event {
            name: name.into(),
            payload,
        })
    }

    /// Namespace connect for the default namespace (`40`).
    pub fn connect() -> Self {
        Packet::Message(AppPacket::Connect(None))
    }

    pub fn transport_type(&self) -> TransportType {
        match self {
            Packet::Open(_) => TransportType::Open,
            Packet::Close => TransportType::Close,
            Packet::Ping(_) => TransportType::Ping,
            Packet::Pong(_) => TransportType::Pong,
            Packet::Message(_) => TransportType::Message,
            Packet::Upgrade => TransportType::Upgrade,
            Packet::Noop => TransportType::Noop,
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.transport_type().digit());
        match self {
            Packet::Open(body) => out.push_str(body),
            Packet::Ping(data) | Packet::Pong(data) => out.push_str(data),
            Packet::Message(app) => app.encode_into(&mut out),
            Packet::Close | Packet::Upgrade | Packet::Noop => {}
        }
        out
    }

    pub fn decode(frame: &str) -> Result<Self, PacketError> {
        let mut chars = frame.chars();
        let first = chars.next().ok_or(PacketError::Empty)?;
        let rest = chars.as_str();
        Ok(match TransportType::from_digit(first)? {
            TransportType::Open => Packet::Open(rest.to_string()),
            TransportType::Close => Packet::Close,
            TransportType::Ping => Packet::Ping(rest.to_string()),
            TransportType::Pong => Packet::Pong(rest.to_string()),
            TransportType::Message => Packet::Message(AppPacket::decode(rest)?),
            TransportType::Upgrade => Packet::Upgrade,
            TransportType::Noop => Packet::Noop,
        })
    }
}

impl AppPacket {
    pub fn app_type(&self) -> AppType {
        match self {
            AppPacket::Connect(_) => AppType::Connect,
            AppPacket::Disconnect => AppType::Disconnect,
            AppPacket::Event { .. } => AppType::Event,
            AppPacket::Ack { .. } => AppType::Ack,
            AppPacket::Error(_) => AppType::Error,
        }
    }

    fn encode_into(&self, out: &mut String) {
        out.push(self.app_type().digit());
        match self {
            AppPacket::Connect(Some(data)) => out.push_str(&data.to_string()),
            AppPacket::Connect(None) | AppPacket::Disconnect => {}
            AppPacket::Event { name, payload } => {
                let array = Value::Array(vec![Value::String(name.clone()), payload.clone()]);
                out.push_str(&array.to_string());
            }
            AppPacket::Ack { id, data } => {
                if let Some(id) = id {
                    out.push_str(&id.to_string());
                }
                out.push_str(&data.to_string());
            }
            AppPacket::Error(data) => out.push_str(&data.to_string()),
        }
    }

    fn decode(body: &str) -> Result<Self, PacketError> {
        let mut chars = body.chars();
        let first = chars.next().ok_or(PacketError::MissingAppType)?;
        let rest = chars.as_str();
        if rest.starts_with('/') {
            return Err(PacketError::Namespaced);
        }
        Ok(match AppType::from_digit(first)? {
            AppType::Connect => AppPacket::Connect(parse_optional_json(rest)?),
            AppType::Disconnect => AppPacket::Disconnect,
            AppType::Event => {
                let (_, json) = split_ack_id(rest);
                let value: Value = serde_json::from_str(json)?;
                let Value::Array(mut items) = value else {
                    return Err(PacketError::InvalidEvent("payload is not an array"));
                };
                if items.is_empty() {
                    return Err(PacketError::InvalidEvent("missing event name"));
                }
                let payload = if items.len() > 1 {
                    items.swap_remove(1)
                } else {
                    Value::Null
                };
                let Value::String(name) = items.swap_remove(0) else {
                    return Err(PacketError::InvalidEvent("event name is not a string"));
                };
                AppPacket::Event { name, payload }
            }
            AppType::Ack => {
                let (id, json) = split_ack_id(rest);
                AppPacket::Ack {
                    id,
                    data: serde_json::from_str(json)?,
                }
            }
            AppType::Error => AppPacket::Error(parse_optional_json(rest)?.unwrap_or(Value::Null)),
        })
    }
}

fn parse_optional_json(s: &str) -> Result<Option<Value>, PacketError> {
    if s.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::from_str(s)?))
    }
}

/// Split a leading numeric ack id (`12["x"]`) from the JSON that follows it.
fn split_ack_id(s: &str) -> (Option<u64>, &str) {
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return (None, s);
    }
    (s[..digits].parse().ok(), &s[digits..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn control_frames_encode_to_single_digit() {
        assert_eq!(Packet::Close.encode(), "1");
        assert_eq!(Packet::Ping(String::new()).encode(), "2");
        assert_eq!(Packet::Pong(String::new()).encode(), "3");
        assert_eq!(Packet::Upgrade.encode(), "5");
        assert_eq!(Packet::Noop.encode(), "6");
        assert_eq!(Packet::connect().encode(), "40");
        assert_eq!(Packet::Message(AppPacket::Disconnect).encode(), "41");
    }

    #[test]
    fn event_encodes_without_separator() {
        let packet = Packet::event("register", json!({"hostId": "h1"}));
        assert_eq!(packet.encode(), r#"42["register",{"hostId":"h1"}]"#);
    }

    #[test]
    fn decode_event_frame() {
        let frame = r#"42["message",{"type":"offer","from":"p1","payload":{"sdp":"v=0"}}]"#;
        match Packet::decode(frame).unwrap() {
            Packet::Message(AppPacket::Event { name, payload }) => {
                assert_eq!(name, "message");
                assert_eq!(payload["from"], "p1");
                assert_eq!(payload["payload"]["sdp"], "v=0");
            }
            other => panic!("Expected event, got {other:?}"),
        }
    }

    #[test]
    fn decode_event_without_payload_is_null() {
        match Packet::decode(r#"42["ping-me"]"#).unwrap() {
            Packet::Message(AppPacket::Event { name, payload }) => {
                assert_eq!(name, "ping-me");
                assert!(payload.is_null());
            }
            other => panic!("Expected event, got {other:?}"),
        }
    }

    #[test]
    fn decode_event_with_ack_id() {
        match Packet::decode(r#"4217["message",{}]"#).unwrap() {
            Packet::Message(AppPacket::Event { name, .. }) => assert_eq!(name, "message"),
            other => panic!("Expected event, got {other:?}"),
        }
    }

    #[test]
    fn decode_connect_ack_with_sid() {
        match Packet::decode(r#"40{"sid":"sock-1"}"#).unwrap() {
            Packet::Message(AppPacket::Connect(Some(data))) => assert_eq!(data["sid"], "sock-1"),
            other => panic!("Expected connect, got {other:?}"),
        }
        assert_eq!(
            Packet::decode("40").unwrap(),
            Packet::Message(AppPacket::Connect(None))
        );
    }

    #[test]
    fn decode_ack_and_error() {
        assert_eq!(
            Packet::decode(r#"433["ok"]"#).unwrap(),
            Packet::Message(AppPacket::Ack {
                id: Some(3),
                data: json!(["ok"]),
            })
        );
        assert_eq!(
            Packet::decode(r#"44{"message":"unauthorized"}"#).unwrap(),
            Packet::Message(AppPacket::Error(json!({"message": "unauthorized"})))
        );
    }

    #[test]
    fn decode_ping_probe_and_open() {
        assert_eq!(Packet::decode("2probe").unwrap(), Packet::Ping("probe".into()));
        assert_eq!(
            Packet::decode(r#"0{"sid":"a"}"#).unwrap(),
            Packet::Open(r#"{"sid":"a"}"#.into())
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Packet::decode(""), Err(PacketError::Empty)));
        assert!(matches!(Packet::decode("9"), Err(PacketError::UnknownTransport('9'))));
        assert!(matches!(Packet::decode("4"), Err(PacketError::MissingAppType)));
        assert!(matches!(Packet::decode("47"), Err(PacketError::UnknownApp('7'))));
        assert!(matches!(Packet::decode("42[oops"), Err(PacketError::InvalidJson(_))));
        assert!(matches!(
            Packet::decode(r#"42{"a":1}"#),
            Err(PacketError::InvalidEvent(_))
        ));
        assert!(matches!(Packet::decode("42[]"), Err(PacketError::InvalidEvent(_))));
        assert!(matches!(Packet::decode("42[7]"), Err(PacketError::InvalidEvent(_))));
        assert!(matches!(Packet::decode("40/admin,"), Err(PacketError::Namespaced)));
    }
}
