//! Narrow interface the session coordinator drives the WebRTC engine through.

use crate::pipeline::CaptureFrame;

use std::sync::Arc;
use tether_protocol::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifies one PeerSession instance. A peer id that reconnects after its
/// session closed gets a new key, so late callbacks from the old handle are
/// recognisable.
pub type SessionKey = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callback traffic from one peer handle, tagged with its session key.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcEvent {
    LocalCandidate {
        key: SessionKey,
        candidate: IceCandidate,
    },
    StateChanged {
        key: SessionKey,
        state: LinkState,
    },
    /// Text received on the `input` data channel.
    InputReceived { key: SessionKey, data: String },
    /// Viewer asked for a keyframe (RTCP PLI/FIR).
    KeyframeRequested { key: SessionKey },
}

impl RtcEvent {
    pub fn key(&self) -> SessionKey {
        match self {
            RtcEvent::LocalCandidate { key, .. }
            | RtcEvent::StateChanged { key, .. }
            | RtcEvent::InputReceived { key, .. }
            | RtcEvent::KeyframeRequested { key } => *key,
        }
    }
}

#[async_trait::async_trait]
pub trait RtcEngine: Send + Sync {
    async fn create_peer(
        &self,
        key: SessionKey,
        events: mpsc::Sender<RtcEvent>,
    ) -> anyhow::Result<Arc<dyn RtcPeer>>;
}

#[async_trait::async_trait]
pub trait RtcPeer: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    /// Deliver one encoded frame to the viewer.
    async fn send_frame(&self, frame: &CaptureFrame) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}
