use crate::h264::{self, H264Profile};
use crate::pipeline::{CaptureError, CaptureSettings, EncodedFrame, FrameEncoder, RawFrame};

use anyhow::{Context, bail};
use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer::{self as gst, ClockTime, ElementFactory, FlowError};
use gstreamer_app::{AppSink, AppSinkCallbacks, AppSrc};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;
use tether_protocol::FrameCodec;
use tracing::{debug, info, warn};

/// Hardware family of the chosen H.264 element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderType {
    Nvidia,
    VaApi,
    Software,
}

impl EncoderType {
    fn from_element(name: &str) -> Option<Self> {
        match name {
            "nvh264enc" => Some(EncoderType::Nvidia),
            "vah264enc" => Some(EncoderType::VaApi),
            "x264enc" => Some(EncoderType::Software),
            _ => None,
        }
    }

    /// nvh264enc emits Main; the others are pinned to Constrained Baseline.
    pub fn h264_profile(self) -> H264Profile {
        match self {
            EncoderType::Nvidia => H264Profile::Main,
            _ => H264Profile::ConstrainedBaseline,
        }
    }

    /// Raw format fed to appsrc. nvh264enc converts BGRA on the GPU; the
    /// others go through videoconvert.
    fn raw_format(self) -> &'static str {
        match self {
            EncoderType::Nvidia => "BGRA",
            _ => "BGRx",
        }
    }
}

/// appsrc caps. Colorimetry is left out on purpose: it ends up as VUI
/// colour parameters in the SPS, which browser decoders reject.
fn raw_caps(format: &str, width: u32, height: u32, framerate: u32) -> gst::Caps {
    gst::Caps::builder("video/x-raw")
        .field("format", format)
        .field("width", width as i32)
        .field("height", height as i32)
        .field("framerate", gst::Fraction::new(framerate as i32, 1))
        .build()
}

/// The GStreamer pipeline shared with the blocking pool.
struct GstPipeline {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    bus: gst::Bus,
    encoded_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl GstPipeline {
    fn check_bus(&self) -> anyhow::Result<()> {
        while let Some(msg) = self
            .bus
            .pop_filtered(&[gst::MessageType::Error, gst::MessageType::Warning])
        {
            use gst::MessageView;
            match msg.view() {
                MessageView::Error(err) => bail!(
                    "GStreamer error from {:?}: {} ({:?})",
                    err.src().map(|s| s.name().to_string()),
                    err.error(),
                    err.debug()
                ),
                MessageView::Warning(w) => warn!(
                    source = ?w.src().map(|s| s.name().to_string()),
                    warning = %w.error(),
                    "GStreamer pipeline warning"
                ),
                _ => {}
            }
        }
        Ok(())
    }

    /// Push one raw frame and wait up to `wait` for its encoded access unit.
    fn encode(&self, data: Bytes, pts: ClockTime, wait: Duration) -> anyhow::Result<Option<Vec<u8>>> {
        self.check_bus()?;
        let mut buffer = gst::Buffer::from_slice(data);
        if let Some(buffer_mut) = buffer.get_mut() {
            buffer_mut.set_pts(pts);
        }
        self.appsrc
            .push_buffer(buffer)
            .context("Failed to push buffer to appsrc")?;

        let rx = self.encoded_rx.lock().unwrap_or_else(|e| e.into_inner());
        match rx.recv_timeout(wait) {
            Ok(data) => Ok(Some(data)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => bail!("Encoder pipeline disconnected"),
        }
    }
}

impl Drop for GstPipeline {
    fn drop(&mut self) {
        let _ = self.appsrc.end_of_stream();
        let _ = self.pipeline.set_state(gst::State::Null);
        debug!("Encoder pipeline stopped");
    }
}

/// GStreamer H.264 encoder producing Annex B access units.
pub struct H264Encoder {
    inner: Arc<GstPipeline>,
    encoder_type: EncoderType,
    interval: Duration,
    frame_index: u64,
    logged_profile: bool,
}

impl H264Encoder {
    pub fn new(
        width: u32,
        height: u32,
        settings: &CaptureSettings,
        preferred_encoder: Option<&str>,
    ) -> anyhow::Result<Self> {
        gst::init().context("Failed to initialize GStreamer")?;
        let (encoder_type, encoder_name) = detect_encoder(preferred_encoder)?;
        let framerate = settings.frame_rate.max(1);
        let bitrate = settings.bitrate;
        info!(
            ?encoder_type,
            encoder_name, width, height, framerate, bitrate, "Creating H.264 encoder pipeline"
        );

        let pipeline = gst::Pipeline::new();

        let appsrc = ElementFactory::make("appsrc")
            .name("src")
            .build()
            .context("Failed to create appsrc")?
            .dynamic_cast::<AppSrc>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSrc"))?;
        appsrc.set_caps(Some(&raw_caps(
            encoder_type.raw_format(),
            width,
            height,
            framerate,
        )));
        appsrc.set_is_live(true);
        appsrc.set_format(gst::Format::Time);
        // Never block the capture loop on a stalled encoder.
        appsrc.set_property("block", false);
        appsrc.set_property("max-bytes", 0u64);
        appsrc.set_property("min-latency", 0i64);
        appsrc.set_property("max-latency", 0i64);

        let encoder = build_encoder_element(encoder_type, &encoder_name, bitrate)?;

        let parser = ElementFactory::make("h264parse")
            .property_from_str("config-interval", "-1")
            .build()
            .context("Failed to create h264parse")?;

        // Annex B with whole access units, as the RTP packetizer expects.
        let parse_caps = gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let parse_capsfilter = ElementFactory::make("capsfilter")
            .name("parse-caps")
            .property("caps", &parse_caps)
            .build()
            .context("Failed to create h264parse output capsfilter")?;

        let appsink = ElementFactory::make("appsink")
            .name("sink")
            .property("sync", false)
            .property("async", false)
            .property("emit-signals", true)
            .property("max-buffers", 1u32)
            .property("drop", true)
            .build()
            .context("Failed to create appsink")?
            .dynamic_cast::<AppSink>()
            .map_err(|_| anyhow::anyhow!("Failed to cast to AppSink"))?;

        let (encoded_tx, encoded_rx) = mpsc::channel::<Vec<u8>>();
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| FlowError::Error)?;
                    let _ = encoded_tx.send(map.to_vec());
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let mut chain: Vec<gst::Element> = vec![appsrc.clone().upcast()];
        if encoder_type != EncoderType::Nvidia {
            chain.push(
                ElementFactory::make("videoconvert")
                    .build()
                    .context("Failed to create videoconvert")?,
            );
        }
        chain.push(encoder);
        if encoder_type != EncoderType::Nvidia {
            // Pin the profile the SDP advertises (42e01f).
            let profile_caps = gst::Caps::builder("video/x-h264")
                .field("profile", "constrained-baseline")
                .build();
            chain.push(
                ElementFactory::make("capsfilter")
                    .property("caps", &profile_caps)
                    .build()
                    .context("Failed to create profile capsfilter")?,
            );
        }
        chain.push(parser);
        chain.push(parse_capsfilter);
        chain.push(appsink.upcast());

        pipeline
            .add_many(chain.iter())
            .context("Failed to add elements to pipeline")?;
        gst::Element::link_many(chain.iter()).context("Failed to link pipeline elements")?;

        let bus = pipeline.bus().context("Failed to get pipeline bus")?;
        pipeline
            .set_state(gst::State::Playing)
            .context("Failed to set pipeline to Playing")?;
        info!(elements = chain.len(), "Encoder pipeline started");

        Ok(Self {
            inner: Arc::new(GstPipeline {
                pipeline,
                appsrc,
                bus,
                encoded_rx: Mutex::new(encoded_rx),
            }),
            encoder_type,
            interval: settings.frame_interval(),
            frame_index: 0,
            logged_profile: false,
        })
    }
}

#[async_trait::async_trait]
impl FrameEncoder for H264Encoder {
    fn codec(&self) -> FrameCodec {
        FrameCodec::H264
    }

    async fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedFrame>, CaptureError> {
        let inner = Arc::clone(&self.inner);
        let data = frame.data.clone();
        let pts = ClockTime::from_nseconds(self.frame_index * self.interval.as_nanos() as u64);
        let wait = self.interval;
        self.frame_index += 1;

        let encoded = tokio::task::spawn_blocking(move || inner.encode(data, pts, wait))
            .await
            .map_err(|e| CaptureError::Encode(format!("encoder task: {e}")))?
            .map_err(|e| CaptureError::Encode(format!("{e:#}")))?;

        Ok(encoded.map(|data| {
            let keyframe = h264::contains_idr(&data);
            if keyframe && !self.logged_profile {
                self.logged_profile = true;
                let expected = self.encoder_type.h264_profile();
                let actual = h264::profile_level_id(&data);
                info!(
                    encoder_type = ?self.encoder_type,
                    profile_level_id = actual.as_deref().unwrap_or("unknown"),
                    "First H.264 keyframe"
                );
                if let Some(actual) = actual.as_deref()
                    && !expected.matches(actual)
                {
                    warn!(
                        advertised = expected.profile_level_id(),
                        actual, "Encoder output does not match the advertised H.264 profile"
                    );
                }
            }
            EncodedFrame {
                codec: FrameCodec::H264,
                data: Bytes::from(data),
                keyframe,
            }
        }))
    }

    fn force_keyframe(&mut self) {
        let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        self.inner.appsrc.send_event(event);
        debug!("Forced IDR keyframe from encoder");
    }
}

/// Element creation can fail even when the plugin is registered (no GPU,
/// missing driver), so probe by instantiating.
fn can_instantiate(name: &str) -> bool {
    match ElementFactory::make(name).build() {
        Ok(elem) => {
            let _ = elem.set_state(gst::State::Null);
            true
        }
        Err(_) => false,
    }
}

/// Profile the capture pipeline will produce, resolved the same way the
/// encoder is. Without any H.264 encoder frames go out as JPEG and the
/// track advertisement does not matter.
pub fn detect_h264_profile(preferred: Option<&str>) -> H264Profile {
    match detect_encoder(preferred) {
        Ok((encoder_type, _)) => encoder_type.h264_profile(),
        Err(e) => {
            warn!("{e:#}");
            H264Profile::ConstrainedBaseline
        }
    }
}

fn detect_encoder(preferred: Option<&str>) -> anyhow::Result<(EncoderType, String)> {
    if let Some(pref) = preferred {
        let Some(enc_type) = EncoderType::from_element(pref) else {
            bail!("Unknown encoder: {pref}. Use nvh264enc, vah264enc, or x264enc.");
        };
        if can_instantiate(pref) {
            info!(encoder = pref, "Using preferred encoder from config");
            return Ok((enc_type, pref.to_string()));
        }
        warn!(encoder = pref, "Preferred encoder not available, falling back to auto-detect");
    }

    for name in ["nvh264enc", "vah264enc", "x264enc"] {
        if can_instantiate(name)
            && let Some(enc_type) = EncoderType::from_element(name)
        {
            info!(encoder = name, "Found working encoder");
            return Ok((enc_type, name.to_string()));
        }
        debug!(encoder = name, "Encoder not available, trying next");
    }

    bail!("No H.264 encoder found. Install gstreamer plugins (good/bad/ugly).")
}

fn build_encoder_element(
    encoder_type: EncoderType,
    name: &str,
    bitrate: u32,
) -> anyhow::Result<gst::Element> {
    let elem = match encoder_type {
        EncoderType::Nvidia => ElementFactory::make(name)
            .property_from_str("preset", "low-latency-hq")
            .property_from_str("rc-mode", "cbr-ld-hq")
            .property("bitrate", bitrate)
            .property("gop-size", i32::MAX)
            .property("zerolatency", true)
            .property("rc-lookahead", 0u32)
            .property("bframes", 0u32)
            .property("strict-gop", true)
            .build()
            .context("Failed to create nvh264enc")?,
        EncoderType::VaApi => ElementFactory::make(name)
            .property_from_str("rate-control", "cbr")
            .property("bitrate", bitrate)
            .property("target-usage", 7u32)
            .property("key-int-max", 60u32)
            .build()
            .context("Failed to create vah264enc")?,
        EncoderType::Software => ElementFactory::make(name)
            .property_from_str("tune", "zerolatency")
            .property_from_str("speed-preset", "ultrafast")
            .property("bitrate", bitrate)
            .property("key-int-max", 30u32)
            .property("bframes", 0u32)
            .build()
            .context("Failed to create x264enc")?,
    };
    Ok(elem)
}

/// Drop the padding byte and reorder BGRx to RGB.
pub fn bgrx_to_rgb(bgrx: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(bgrx.len() / 4 * 3);
    for px in bgrx.chunks_exact(4) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    rgb
}

fn encode_jpeg(frame: &RawFrame, quality: u8) -> anyhow::Result<Vec<u8>> {
    let expected = frame.width as usize * frame.height as usize * 4;
    if frame.data.len() < expected {
        bail!(
            "Frame buffer holds {} bytes, {}x{} needs {expected}",
            frame.data.len(),
            frame.width,
            frame.height
        );
    }
    let rgb = bgrx_to_rgb(&frame.data[..expected]);
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode(&rgb, frame.width, frame.height, image::ExtendedColorType::Rgb8)
        .context("JPEG encode failed")?;
    Ok(out)
}

/// Still-image fallback. Every output is independently decodable.
pub struct JpegEncoder {
    quality: u8,
}

impl JpegEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

#[async_trait::async_trait]
impl FrameEncoder for JpegEncoder {
    fn codec(&self) -> FrameCodec {
        FrameCodec::Jpeg
    }

    async fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedFrame>, CaptureError> {
        let frame = frame.clone();
        let quality = self.quality;
        let data = tokio::task::spawn_blocking(move || encode_jpeg(&frame, quality))
            .await
            .map_err(|e| CaptureError::Encode(format!("jpeg task: {e}")))?
            .map_err(|e| CaptureError::Encode(format!("{e:#}")))?;
        Ok(Some(EncodedFrame {
            codec: FrameCodec::Jpeg,
            data: Bytes::from(data),
            keyframe: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, bgrx: [u8; 4]) -> RawFrame {
        RawFrame {
            width,
            height,
            data: Bytes::from(bgrx.repeat((width * height) as usize)),
        }
    }

    #[test]
    fn appsrc_caps_must_not_contain_colorimetry() {
        gst::init().unwrap();
        for encoder_type in [EncoderType::Nvidia, EncoderType::Software] {
            let caps = raw_caps(encoder_type.raw_format(), 1920, 1080, 60).to_string();
            assert!(!caps.contains("colorimetry"), "{caps}");
            assert!(caps.contains(encoder_type.raw_format()), "{caps}");
        }
    }

    #[test]
    fn encoder_names_map_to_types() {
        assert_eq!(EncoderType::from_element("nvh264enc"), Some(EncoderType::Nvidia));
        assert_eq!(EncoderType::from_element("vah264enc"), Some(EncoderType::VaApi));
        assert_eq!(EncoderType::from_element("x264enc"), Some(EncoderType::Software));
        assert_eq!(EncoderType::from_element("openh264enc"), None);
    }

    #[test]
    fn only_nvenc_advertises_main_profile() {
        assert_eq!(EncoderType::Nvidia.h264_profile(), H264Profile::Main);
        assert_eq!(EncoderType::VaApi.h264_profile(), H264Profile::ConstrainedBaseline);
        assert_eq!(EncoderType::Software.h264_profile(), H264Profile::ConstrainedBaseline);
    }

    #[test]
    fn unknown_encoder_advertises_baseline() {
        gst::init().unwrap();
        assert_eq!(
            detect_h264_profile(Some("vp8enc")),
            H264Profile::ConstrainedBaseline
        );
    }

    #[test]
    fn unknown_preferred_encoder_is_an_error() {
        gst::init().unwrap();
        let err = detect_encoder(Some("vp8enc")).unwrap_err();
        assert!(err.to_string().contains("Unknown encoder"));
    }

    #[test]
    fn bgrx_becomes_rgb() {
        let rgb = bgrx_to_rgb(&[10, 20, 30, 0xFF, 1, 2, 3, 0]);
        assert_eq!(rgb, vec![30, 20, 10, 3, 2, 1]);
    }

    #[tokio::test]
    async fn jpeg_fallback_produces_keyframes() {
        let mut encoder = JpegEncoder::new(80);
        let frame = solid_frame(16, 8, [0, 0, 255, 255]);
        let out = encoder.encode(&frame).await.unwrap().unwrap();
        assert_eq!(out.codec, FrameCodec::Jpeg);
        assert!(out.keyframe);
        assert_eq!(&out.data[..2], &[0xFF, 0xD8]);
        assert_eq!(&out.data[out.data.len() - 2..], &[0xFF, 0xD9]);

        let decoded = image::load_from_memory(&out.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[tokio::test]
    async fn jpeg_rejects_short_buffer() {
        let mut encoder = JpegEncoder::new(80);
        let frame = RawFrame {
            width: 16,
            height: 8,
            data: Bytes::from(vec![0u8; 10]),
        };
        assert!(matches!(encoder.encode(&frame).await, Err(CaptureError::Encode(_))));
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(JpegEncoder::new(0).quality, 1);
        assert_eq!(JpegEncoder::new(255).quality, 100);
    }
}
