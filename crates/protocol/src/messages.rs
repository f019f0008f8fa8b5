use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name carrying peer-to-peer signaling in both directions.
pub const MESSAGE_EVENT: &str = "message";
/// Event name of the host registration sent after the namespace connect.
pub const REGISTER_EVENT: &str = "register";

/// Kind of a peer signaling message, as carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    ConnectRequest,
    Offer,
    Answer,
    IceCandidate,
    Disconnect,
    ConnectRejected,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::ConnectRequest => "connect-request",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
            MessageKind::Disconnect => "disconnect",
            MessageKind::ConnectRejected => "connect-rejected",
        }
    }
}

/// SDP offer or answer, shaped like the browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub sdp_type: Option<String>,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: Some("offer".into()),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: Some("answer".into()),
            sdp: sdp.into(),
        }
    }
}

/// Trickle ICE candidate, shaped like the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// A viewer asking this host for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Whether the viewer wants to drive keyboard and mouse. Absent means yes;
    /// view-only clients send `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<bool>,
}

impl ConnectRequest {
    pub fn wants_control(&self) -> bool {
        self.control.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: String,
}

/// Typed peer signal, decoded once at the channel boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerSignal {
    ConnectRequest(ConnectRequest),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Disconnect,
    ConnectRejected(Rejection),
}

impl PeerSignal {
    pub fn kind(&self) -> MessageKind {
        match self {
            PeerSignal::ConnectRequest(_) => MessageKind::ConnectRequest,
            PeerSignal::Offer(_) => MessageKind::Offer,
            PeerSignal::Answer(_) => MessageKind::Answer,
            PeerSignal::IceCandidate(_) => MessageKind::IceCandidate,
            PeerSignal::Disconnect => MessageKind::Disconnect,
            PeerSignal::ConnectRejected(_) => MessageKind::ConnectRejected,
        }
    }

    /// Decode the inner `payload` object for a message of the given kind.
    pub fn from_payload(kind: MessageKind, payload: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::ConnectRequest => {
                if payload.is_null() {
                    PeerSignal::ConnectRequest(ConnectRequest::default())
                } else {
                    PeerSignal::ConnectRequest(serde_json::from_value(payload)?)
                }
            }
            MessageKind::Offer => PeerSignal::Offer(serde_json::from_value(payload)?),
            MessageKind::Answer => PeerSignal::Answer(serde_json::from_value(payload)?),
            MessageKind::IceCandidate => PeerSignal::IceCandidate(serde_json::from_value(payload)?),
            MessageKind::Disconnect => PeerSignal::Disconnect,
            MessageKind::ConnectRejected => {
                PeerSignal::ConnectRejected(serde_json::from_value(payload)?)
            }
        })
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            PeerSignal::ConnectRequest(req) => serde_json::to_value(req),
            PeerSignal::Offer(desc) | PeerSignal::Answer(desc) => serde_json::to_value(desc),
            PeerSignal::IceCandidate(c) => serde_json::to_value(c),
            PeerSignal::Disconnect => Ok(Value::Object(Default::default())),
            PeerSignal::ConnectRejected(r) => serde_json::to_value(r),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalDecodeError {
    #[error("malformed message envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("malformed {kind:?} payload: {source}")]
    Payload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("message has an empty sender")]
    MissingSender,
}

#[derive(Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    kind: MessageKind,
    from: String,
    #[serde(default)]
    payload: Value,
}

/// A peer signal received from the server, tagged with the sending peer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    pub peer_id: String,
    pub signal: PeerSignal,
}

impl InboundSignal {
    /// Decode the payload of a `message` event:
    /// `{"type": "...", "from": "<peer>", "payload": {...}}`.
    pub fn decode(event_payload: Value) -> Result<Self, SignalDecodeError> {
        let envelope: InboundEnvelope =
            serde_json::from_value(event_payload).map_err(SignalDecodeError::Envelope)?;
        if envelope.from.is_empty() {
            return Err(SignalDecodeError::MissingSender);
        }
        let signal = PeerSignal::from_payload(envelope.kind, envelope.payload).map_err(
            |source| SignalDecodeError::Payload {
                kind: envelope.kind,
                source,
            },
        )?;
        Ok(Self {
            peer_id: envelope.from,
            signal,
        })
    }
}

/// A peer signal addressed to a viewer.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub to: String,
    pub signal: PeerSignal,
}

impl OutboundSignal {
    pub fn new(to: impl Into<String>, signal: PeerSignal) -> Self {
        Self {
            to: to.into(),
            signal,
        }
    }

    /// Payload for a `message` event: `{"type", "to", "payload"}`.
    pub fn to_event_payload(&self) -> Result<Value, serde_json::Error> {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), Value::String(self.signal.kind().as_str().into()));
        map.insert("to".into(), Value::String(self.to.clone()));
        map.insert("payload".into(), self.signal.payload()?);
        Ok(Value::Object(map))
    }
}

/// Host registration sent right after connecting the namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub host_id: String,
    pub hostname: String,
    pub os: String,
    pub version: String,
}

/// Remote input commands received over the `input` data channel (compact format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum InputCommand {
    /// Key press/release: evdev code + down state
    #[serde(rename = "k")]
    Key { c: u16, d: bool },
    /// Mouse move: normalized coordinates (0.0 - 1.0)
    #[serde(rename = "m")]
    MouseMove { x: f64, y: f64 },
    /// Mouse button press/release (0=left, 1=middle, 2=right)
    #[serde(rename = "b")]
    Button { b: u8, d: bool },
    #[serde(rename = "s")]
    Scroll { dx: f64, dy: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_keeps_peer_and_payload() {
        let payload = json!({"type": "offer", "sdp": "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\n"});
        let msg = InboundSignal::decode(json!({
            "type": "offer",
            "from": "p1",
            "payload": payload.clone(),
        }))
        .unwrap();
        assert_eq!(msg.peer_id, "p1");
        match &msg.signal {
            PeerSignal::Offer(desc) => assert!(desc.sdp.starts_with("v=0")),
            other => panic!("Expected Offer, got {other:?}"),
        }
        assert_eq!(msg.signal.payload().unwrap(), payload);
    }

    #[test]
    fn ice_candidate_field_names() {
        let msg = InboundSignal::decode(json!({
            "type": "ice-candidate",
            "from": "p2",
            "payload": {"candidate": "candidate:1 1 UDP 1 1.2.3.4 5 typ host", "sdpMid": "0", "sdpMLineIndex": 0},
        }))
        .unwrap();
        match msg.signal {
            PeerSignal::IceCandidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
            }
            other => panic!("Expected IceCandidate, got {other:?}"),
        }
    }

    #[test]
    fn connect_request_without_payload() {
        let msg =
            InboundSignal::decode(json!({"type": "connect-request", "from": "p3"})).unwrap();
        assert_eq!(msg.signal, PeerSignal::ConnectRequest(ConnectRequest::default()));
        let PeerSignal::ConnectRequest(req) = msg.signal else {
            unreachable!()
        };
        assert!(req.wants_control());
    }

    #[test]
    fn view_only_request_declines_control() {
        let msg = InboundSignal::decode(json!({
            "type": "connect-request",
            "from": "p4",
            "payload": {"control": false},
        }))
        .unwrap();
        match msg.signal {
            PeerSignal::ConnectRequest(req) => assert!(!req.wants_control()),
            other => panic!("Expected ConnectRequest, got {other:?}"),
        }
    }

    #[test]
    fn connect_request_with_client_ip() {
        let msg = InboundSignal::decode(json!({
            "type": "connect-request",
            "from": "p3",
            "payload": {"clientIp": "10.0.0.7", "control": true},
        }))
        .unwrap();
        match msg.signal {
            PeerSignal::ConnectRequest(req) => {
                assert_eq!(req.client_ip.as_deref(), Some("10.0.0.7"));
                assert_eq!(req.control, Some(true));
            }
            other => panic!("Expected ConnectRequest, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = InboundSignal::decode(json!({"type": "teleport", "from": "p1"})).unwrap_err();
        assert!(matches!(err, SignalDecodeError::Envelope(_)));
    }

    #[test]
    fn missing_sender_is_rejected() {
        assert!(InboundSignal::decode(json!({"type": "disconnect"})).is_err());
        assert!(matches!(
            InboundSignal::decode(json!({"type": "disconnect", "from": ""})),
            Err(SignalDecodeError::MissingSender)
        ));
    }

    #[test]
    fn malformed_payload_names_the_kind() {
        let err = InboundSignal::decode(json!({
            "type": "answer",
            "from": "p1",
            "payload": {"type": "answer"},
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            SignalDecodeError::Payload {
                kind: MessageKind::Answer,
                ..
            }
        ));
    }

    #[test]
    fn outbound_answer_shape() {
        let out = OutboundSignal::new("p1", PeerSignal::Answer(SessionDescription::answer("v=0")));
        assert_eq!(
            out.to_event_payload().unwrap(),
            json!({"type": "answer", "to": "p1", "payload": {"type": "answer", "sdp": "v=0"}})
        );
    }

    #[test]
    fn kind_strings_match_serde() {
        for kind in [
            MessageKind::ConnectRequest,
            MessageKind::Offer,
            MessageKind::Answer,
            MessageKind::IceCandidate,
            MessageKind::Disconnect,
            MessageKind::ConnectRejected,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
    }

    #[test]
    fn registration_is_camel_case() {
        let reg = Registration {
            host_id: "h1".into(),
            hostname: "box".into(),
            os: "linux".into(),
            version: "0.1.0".into(),
        };
        let json = serde_json::to_string(&reg).unwrap();
        assert!(json.contains(r#""hostId":"h1""#));
    }

    #[test]
    fn input_command_compact_format() {
        let cmd: InputCommand = serde_json::from_str(r#"{"t":"k","c":30,"d":true}"#).unwrap();
        assert_eq!(cmd, InputCommand::Key { c: 30, d: true });
        let cmd: InputCommand = serde_json::from_str(r#"{"t":"m","x":0.5,"y":0.25}"#).unwrap();
        assert_eq!(cmd, InputCommand::MouseMove { x: 0.5, y: 0.25 });
        assert!(serde_json::from_str::<InputCommand>(r#"{"t":"zz"}"#).is_err());
    }
}
