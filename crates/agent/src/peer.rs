use crate::h264::H264Profile;
use crate::pipeline::CaptureFrame;
use crate::rtc::{LinkState, RtcEngine, RtcEvent, RtcPeer, SessionKey};

use anyhow::Context;
use bytes::Bytes;
use std::sync::Arc;
use tether_protocol::{FrameCodec, FrameHeader, IceCandidate, IceConfig, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Data channel the viewer opens for input commands.
pub const INPUT_CHANNEL: &str = "input";
/// Data channel the host opens for still frames.
pub const FRAMES_CHANNEL: &str = "frames";

/// SCTP messages stay below this; larger still frames are split and the
/// viewer reassembles them using the header's payload length.
const FRAME_CHUNK_SIZE: usize = 16 * 1024;


fn h264_feedback() -> Vec<RTCPFeedback> {
    [
        ("goog-remb", ""),
        ("ccm", "fir"),
        ("nack", ""),
        ("nack", "pli"),
        ("transport-cc", ""),
    ]
    .into_iter()
    .map(|(typ, parameter)| RTCPFeedback {
        typ: typ.into(),
        parameter: parameter.into(),
    })
    .collect()
}

/// Translate the `[ice]` config section into webrtc-rs ICE servers.
pub fn ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !config.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_urls.clone(),
            ..Default::default()
        });
    }
    if !config.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.turn_urls.clone(),
            username: config.turn_username.clone().unwrap_or_default(),
            credential: config.turn_credential.clone().unwrap_or_default(),
        });
    }
    servers
}

/// webrtc-rs backed engine. One API instance serves every peer.
pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    video_fmtp: String,
}

/// Codecs to register for the encoder's profile. Constrained Baseline is
/// always offered since browsers expect it; Main only when NVENC produces it.
fn h264_codecs(profile: H264Profile) -> Vec<(String, u8)> {
    let mut codecs = vec![(H264Profile::ConstrainedBaseline.fmtp(), 125)];
    if profile == H264Profile::Main {
        codecs.push((H264Profile::Main.fmtp(), 102));
    }
    codecs
}

impl WebRtcEngine {
    /// `profile` is what the capture encoder emits; the video track
    /// advertises it.
    pub fn new(ice: &IceConfig, profile: H264Profile) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();

        // H.264 only. The viewer must not negotiate a codec we never produce.
        info!(?profile, "Registering H.264 codecs");
        for (fmtp, payload_type) in h264_codecs(profile) {
            media_engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: RTCRtpCodecCapability {
                            mime_type: MIME_TYPE_H264.to_string(),
                            clock_rate: 90000,
                            channels: 0,
                            sdp_fmtp_line: fmtp.clone(),
                            rtcp_feedback: h264_feedback(),
                        },
                        payload_type,
                        ..Default::default()
                    },
                    RTPCodecType::Video,
                )
                .with_context(|| format!("Failed to register H.264 codec {fmtp}"))?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers(ice);
        info!(servers = ice_servers.len(), "WebRTC engine ready");
        Ok(Self {
            api,
            ice_servers,
            video_fmtp: profile.fmtp(),
        })
    }
}

#[async_trait::async_trait]
impl RtcEngine for WebRtcEngine {
    async fn create_peer(
        &self,
        key: SessionKey,
        events: mpsc::Sender<RtcEvent>,
    ) -> anyhow::Result<Arc<dyn RtcPeer>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: self.video_fmtp.clone(),
                ..Default::default()
            },
            "video".to_string(),
            "tether".to_string(),
        ));
        let video_sender = pc
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add video track")?;

        let frames_channel = pc
            .create_data_channel(FRAMES_CHANNEL, None)
            .await
            .context("Failed to create frames data channel")?;

        wire_callbacks(&pc, key, &events);
        start_rtcp_reader(Arc::clone(&video_sender), key, events);

        info!(%key, "WebRTC peer connection created");
        Ok(Arc::new(WebRtcPeer {
            key,
            pc,
            video_track,
            frames_channel,
        }))
    }
}

fn wire_callbacks(pc: &Arc<RTCPeerConnection>, key: SessionKey, events: &mpsc::Sender<RtcEvent>) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            let state = match state {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
                    LinkState::Connecting
                }
                RTCPeerConnectionState::Connected => LinkState::Connected,
                RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                RTCPeerConnectionState::Failed => LinkState::Failed,
                RTCPeerConnectionState::Closed => LinkState::Closed,
                RTCPeerConnectionState::Unspecified => return,
            };
            debug!(%key, ?state, "Peer connection state changed");
            let _ = tx.send(RtcEvent::StateChanged { key, state }).await;
        })
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(c) = candidate else { return };
            match c.to_json() {
                Ok(json) => {
                    let candidate = IceCandidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: json.username_fragment,
                    };
                    let _ = tx.send(RtcEvent::LocalCandidate { key, candidate }).await;
                }
                Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move {
            if dc.label() != INPUT_CHANNEL {
                debug!(%key, label = dc.label(), "Ignoring unexpected data channel");
                return;
            }
            info!(%key, "Input data channel opened");
            dc.on_message(Box::new(move |msg| {
                let tx = tx.clone();
                Box::pin(async move {
                    let data = String::from_utf8_lossy(&msg.data).into_owned();
                    let _ = tx.send(RtcEvent::InputReceived { key, data }).await;
                })
            }));
        })
    }));
}

/// Turn RTCP PLI/FIR from the viewer into keyframe requests.
fn start_rtcp_reader(sender: Arc<RTCRtpSender>, key: SessionKey, events: mpsc::Sender<RtcEvent>) {
    tokio::spawn(async move {
        while let Ok((packets, _)) = sender.read_rtcp().await {
            let wants_keyframe = packets.iter().any(|pkt| {
                let pkt = pkt.as_any();
                pkt.is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                    || pkt.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
            });
            if wants_keyframe {
                debug!(%key, "Viewer requested a keyframe");
                if events.send(RtcEvent::KeyframeRequested { key }).await.is_err() {
                    break;
                }
            }
        }
        debug!(%key, "RTCP reader stopped");
    });
}

fn to_rtc_description(
    desc: SessionDescription,
    fallback: RTCSdpType,
) -> anyhow::Result<RTCSessionDescription> {
    let kind = match desc.sdp_type.as_deref() {
        Some(t) => RTCSdpType::from(t),
        None => fallback,
    };
    let rtc = match kind {
        RTCSdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        RTCSdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        RTCSdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        other => anyhow::bail!("Unsupported session description type {other}"),
    };
    rtc.context("Failed to parse SDP")
}

pub struct WebRtcPeer {
    key: SessionKey,
    pc: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    frames_channel: Arc<RTCDataChannel>,
}

impl WebRtcPeer {
    async fn send_still(&self, frame: &CaptureFrame) -> anyhow::Result<()> {
        if self.frames_channel.ready_state() != RTCDataChannelState::Open {
            return Ok(());
        }
        let header = FrameHeader::new(
            FrameCodec::Jpeg,
            u16::try_from(frame.width).context("Frame too wide")?,
            u16::try_from(frame.height).context("Frame too tall")?,
            frame.timestamp_us,
            u32::try_from(frame.data.len()).context("Frame too large")?,
            frame.keyframe,
        );
        let message = header.serialize_with_payload(&frame.data);
        for chunk in message.chunks(FRAME_CHUNK_SIZE) {
            self.frames_channel
                .send(&Bytes::copy_from_slice(chunk))
                .await
                .context("Failed to send still frame")?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RtcPeer for WebRtcPeer {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        let desc = to_rtc_description(desc, RTCSdpType::Answer)?;
        self.pc
            .set_local_description(desc)
            .await
            .context("Failed to set local description")
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        let desc = to_rtc_description(desc, RTCSdpType::Offer)?;
        for line in desc.sdp.lines().filter(|l| {
            l.starts_with("m=") || l.starts_with("a=rtpmap:") || l.starts_with("a=fmtp:")
        }) {
            debug!(key = %self.key, sdp_line = line, "Remote SDP");
        }
        self.pc
            .set_remote_description(desc)
            .await
            .context("Failed to set remote description")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")
    }

    async fn send_frame(&self, frame: &CaptureFrame) -> anyhow::Result<()> {
        match frame.codec {
            FrameCodec::H264 => self
                .video_track
                .write_sample(&webrtc::media::Sample {
                    data: frame.data.clone(),
                    duration: frame.duration,
                    ..Default::default()
                })
                .await
                .context("Failed to write video sample"),
            FrameCodec::Jpeg => self.send_still(frame).await,
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pc
            .close()
            .await
            .context("Failed to close peer connection")?;
        info!(key = %self.key, "Peer connection closed");
        Ok(())
    }
}
