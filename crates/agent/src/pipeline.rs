//! Paced capture loop feeding every active session.
//!
//! One loop runs while at least one session needs video. Each tick captures
//! the configured region, encodes it with the primary codec (H.264), falls
//! back to the still-image codec (JPEG) when the primary fails, and
//! broadcasts the frame. Overruns push the next deadline to "now" instead
//! of bursting catch-up frames.

use crate::capture::ScreenCapture;
use crate::encoder::{H264Encoder, JpegEncoder};

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tether_protocol::{CaptureConfig, CaptureRegion, FrameCodec};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FRAME_QUEUE_CAPACITY: usize = 4;
/// Consecutive primary failures before the loop stops trying the primary codec.
const MAX_PRIMARY_FAILURES: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("screen capture failed: {0}")]
    Capture(String),
    #[error("encoder unavailable: {0}")]
    EncoderUnavailable(String),
    #[error("encode failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub region: Option<CaptureRegion>,
    pub frame_rate: u32,
    /// Still-image quality, 1..=100.
    pub quality: u8,
    /// H.264 bitrate in kbps.
    pub bitrate: u32,
}

impl CaptureSettings {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            region: config.region,
            frame_rate: config.framerate,
            quality: config.quality,
            bitrate: config.bitrate,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }
}

/// Unencoded BGRx pixels straight from the screen.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub codec: FrameCodec,
    pub data: Bytes,
    pub keyframe: bool,
}

/// One produced frame, shared by every subscriber.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub width: u32,
    pub height: u32,
    pub codec: FrameCodec,
    pub data: Bytes,
    pub keyframe: bool,
    /// Capture time, microseconds since the Unix epoch.
    pub timestamp_us: u64,
    /// Nominal frame duration (RTP sample length).
    pub duration: Duration,
}

#[async_trait::async_trait]
pub trait ScreenSource: Send {
    async fn capture(&mut self) -> Result<RawFrame, CaptureError>;
}

#[async_trait::async_trait]
pub trait FrameEncoder: Send {
    fn codec(&self) -> FrameCodec;
    /// `Ok(None)` means the encoder has no output for this input yet.
    async fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedFrame>, CaptureError>;
    fn force_keyframe(&mut self) {}
}

/// Where sources and encoders come from.
#[async_trait::async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open_source(
        &self,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn ScreenSource>, CaptureError>;
    async fn primary_encoder(
        &self,
        width: u32,
        height: u32,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn FrameEncoder>, CaptureError>;
    fn fallback_encoder(&self, settings: &CaptureSettings) -> Box<dyn FrameEncoder>;
}

/// X11 SHM capture with a GStreamer H.264 primary and JPEG fallback.
pub struct DesktopBackend {
    display: String,
    preferred_encoder: Option<String>,
}

impl DesktopBackend {
    pub fn new(display: impl Into<String>, preferred_encoder: Option<String>) -> Self {
        Self {
            display: display.into(),
            preferred_encoder,
        }
    }
}

#[async_trait::async_trait]
impl CaptureBackend for DesktopBackend {
    async fn open_source(
        &self,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn ScreenSource>, CaptureError> {
        let display = self.display.clone();
        let region = settings.region;
        let capture = tokio::task::spawn_blocking(move || ScreenCapture::new(&display, region))
            .await
            .map_err(|e| CaptureError::Capture(format!("capture task: {e}")))?
            .map_err(|e| CaptureError::Capture(format!("{e:#}")))?;
        Ok(Box::new(capture.into_source()))
    }

    async fn primary_encoder(
        &self,
        width: u32,
        height: u32,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn FrameEncoder>, CaptureError> {
        let preferred = self.preferred_encoder.clone();
        let settings = *settings;
        let encoder = tokio::task::spawn_blocking(move || {
            H264Encoder::new(width, height, &settings, preferred.as_deref())
        })
        .await
        .map_err(|e| CaptureError::EncoderUnavailable(format!("encoder task: {e}")))?
        .map_err(|e| CaptureError::EncoderUnavailable(format!("{e:#}")))?;
        Ok(Box::new(encoder))
    }

    fn fallback_encoder(&self, settings: &CaptureSettings) -> Box<dyn FrameEncoder> {
        Box::new(JpegEncoder::new(settings.quality))
    }
}

/// Primary encoder with per-frame fallback to the still codec.
struct EncoderChain {
    primary: Option<Box<dyn FrameEncoder>>,
    primary_size: (u32, u32),
    primary_disabled: bool,
    primary_failures: u32,
    fallback: Box<dyn FrameEncoder>,
}

impl EncoderChain {
    fn new(fallback: Box<dyn FrameEncoder>) -> Self {
        Self {
            primary: None,
            primary_size: (0, 0),
            primary_disabled: false,
            primary_failures: 0,
            fallback,
        }
    }

    fn force_keyframe(&mut self) {
        if let Some(primary) = self.primary.as_mut() {
            primary.force_keyframe();
        }
    }

    async fn ensure_primary(
        &mut self,
        backend: &dyn CaptureBackend,
        raw: &RawFrame,
        settings: &CaptureSettings,
    ) {
        if self.primary_disabled {
            return;
        }
        let size = (raw.width, raw.height);
        if self.primary.is_some() && self.primary_size == size {
            return;
        }
        if self.primary.take().is_some() {
            info!(width = raw.width, height = raw.height, "Frame size changed, recreating encoder");
        }
        match backend.primary_encoder(raw.width, raw.height, settings).await {
            Ok(encoder) => {
                self.primary = Some(encoder);
                self.primary_size = size;
                self.primary_failures = 0;
            }
            Err(e) => {
                warn!("Primary encoder unavailable, streaming still frames only: {e}");
                self.primary_disabled = true;
            }
        }
    }

    async fn encode(
        &mut self,
        backend: &dyn CaptureBackend,
        raw: &RawFrame,
        settings: &CaptureSettings,
    ) -> Result<Option<EncodedFrame>, CaptureError> {
        self.ensure_primary(backend, raw, settings).await;
        if let Some(primary) = self.primary.as_mut() {
            match primary.encode(raw).await {
                Ok(encoded) => {
                    self.primary_failures = 0;
                    return Ok(encoded);
                }
                Err(e) => {
                    self.primary_failures += 1;
                    if self.primary_failures <= 3 || self.primary_failures.is_multiple_of(10) {
                        warn!(failures = self.primary_failures, "Primary encode failed, using still frame: {e}");
                    }
                    if self.primary_failures >= MAX_PRIMARY_FAILURES {
                        warn!("Primary encoder keeps failing, degrading to still frames");
                        self.primary = None;
                        self.primary_disabled = true;
                    }
                }
            }
        }
        self.fallback.encode(raw).await
    }
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    settings: CaptureSettings,
}

pub struct CapturePipeline {
    backend: Arc<dyn CaptureBackend>,
    frames: broadcast::Sender<Arc<CaptureFrame>>,
    keyframe_requested: Arc<AtomicBool>,
    produced: Arc<AtomicU64>,
    running: Mutex<Option<RunningLoop>>,
}

impl CapturePipeline {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_QUEUE_CAPACITY);
        Self {
            backend,
            frames,
            keyframe_requested: Arc::new(AtomicBool::new(false)),
            produced: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    /// Start capturing. A loop that is already running is stopped and joined first.
    pub async fn start(&self, settings: CaptureSettings) {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            debug!("Restarting capture loop with new settings");
            previous.cancel.cancel();
            let _ = previous.handle.await;
        }

        info!(
            frame_rate = settings.frame_rate,
            quality = settings.quality,
            bitrate = settings.bitrate,
            region = ?settings.region,
            "Starting capture"
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_capture_loop(
            Arc::clone(&self.backend),
            settings,
            self.frames.clone(),
            Arc::clone(&self.keyframe_requested),
            Arc::clone(&self.produced),
            cancel.clone(),
        ));
        *running = Some(RunningLoop {
            cancel,
            handle,
            settings,
        });
    }

    /// Stop capturing. No-op when idle.
    pub async fn stop(&self) {
        let Some(previous) = self.running.lock().await.take() else {
            return;
        };
        previous.cancel.cancel();
        let _ = previous.handle.await;
        info!(frames = self.frames_produced(), "Capture stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn settings(&self) -> Option<CaptureSettings> {
        self.running.lock().await.as_ref().map(|r| r.settings)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CaptureFrame>> {
        self.frames.subscribe()
    }

    /// Ask the primary encoder for an IDR on the next frame.
    pub fn request_keyframe(&self) {
        self.keyframe_requested.store(true, Ordering::Relaxed);
    }

    pub fn frames_produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Next capture deadline. Never earlier than `now`, so an overrun costs at
/// most one late frame rather than a burst.
fn next_deadline(previous: Instant, interval: Duration, now: Instant) -> Instant {
    (previous + interval).max(now)
}

async fn run_capture_loop(
    backend: Arc<dyn CaptureBackend>,
    settings: CaptureSettings,
    frames: broadcast::Sender<Arc<CaptureFrame>>,
    keyframe_requested: Arc<AtomicBool>,
    produced: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let interval = settings.frame_interval();
    let mut source: Option<Box<dyn ScreenSource>> = None;
    let mut encoders = EncoderChain::new(backend.fallback_encoder(&settings));
    let mut deadline = Instant::now();
    let mut error_count: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let tick = async {
            if source.is_none() {
                source = Some(backend.open_source(&settings).await?);
            }
            let Some(src) = source.as_mut() else {
                return Ok(None);
            };
            let raw = match src.capture().await {
                Ok(raw) => raw,
                Err(e) => {
                    // Reopen on the next tick; the display may have gone away.
                    source = None;
                    return Err(e);
                }
            };
            if keyframe_requested.swap(false, Ordering::Relaxed) {
                encoders.force_keyframe();
            }
            let encoded = encoders.encode(backend.as_ref(), &raw, &settings).await?;
            Ok::<_, CaptureError>(encoded.map(|e| CaptureFrame {
                width: raw.width,
                height: raw.height,
                codec: e.codec,
                data: e.data,
                keyframe: e.keyframe,
                timestamp_us: now_us(),
                duration: interval,
            }))
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = tick => result,
        };

        match result {
            Ok(Some(frame)) => {
                let count = produced.fetch_add(1, Ordering::Relaxed) + 1;
                if count == 1 {
                    info!(width = frame.width, height = frame.height, codec = ?frame.codec, "First frame captured");
                }
                error_count = 0;
                // No subscribers is fine; sessions may still be negotiating.
                let _ = frames.send(Arc::new(frame));
            }
            Ok(None) => {}
            Err(e) => {
                error_count += 1;
                if error_count <= 3 || error_count.is_multiple_of(100) {
                    warn!(error_count, "Frame skipped: {e}");
                }
            }
        }

        deadline = next_deadline(deadline, interval, Instant::now());
    }
    debug!("Capture loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn interval_from_frame_rate() {
        let settings = CaptureSettings {
            region: None,
            frame_rate: 20,
            quality: 75,
            bitrate: 8000,
        };
        assert_eq!(settings.frame_interval(), Duration::from_millis(50));
    }

    #[test]
    fn overrun_resets_deadline_to_now() {
        let t0 = Instant::now();
        let interval = Duration::from_millis(50);
        assert_eq!(next_deadline(t0, interval, t0 + Duration::from_millis(10)), t0 + interval);
        let late = t0 + Duration::from_millis(120);
        assert_eq!(next_deadline(t0, interval, late), late);
    }

    /// Scripted behaviour shared between the fake backend and the test body.
    #[derive(Default)]
    struct Script {
        /// Capture calls (1-based) that take 70ms.
        slow_captures: Vec<u64>,
        /// Capture calls that fail.
        failing_captures: Vec<u64>,
        primary_unavailable: bool,
        /// Primary encode calls that fail.
        failing_encodes: Vec<u64>,
        captures: u64,
        encodes: u64,
        keyframes_forced: u64,
        sources_opened: u64,
    }

    #[derive(Default, Clone)]
    struct FakeBackend {
        script: Arc<StdMutex<Script>>,
    }

    struct FakeSource {
        script: Arc<StdMutex<Script>>,
    }

    #[async_trait::async_trait]
    impl ScreenSource for FakeSource {
        async fn capture(&mut self) -> Result<RawFrame, CaptureError> {
            let (slow, fail) = {
                let mut s = self.script.lock().unwrap();
                s.captures += 1;
                let n = s.captures;
                (s.slow_captures.contains(&n), s.failing_captures.contains(&n))
            };
            if slow {
                tokio::time::sleep(Duration::from_millis(70)).await;
            }
            if fail {
                return Err(CaptureError::Capture("display busy".into()));
            }
            Ok(RawFrame {
                width: 4,
                height: 2,
                data: Bytes::from(vec![0u8; 32]),
            })
        }
    }

    struct FakeEncoder {
        script: Arc<StdMutex<Script>>,
        codec: FrameCodec,
    }

    #[async_trait::async_trait]
    impl FrameEncoder for FakeEncoder {
        fn codec(&self) -> FrameCodec {
            self.codec
        }

        async fn encode(&mut self, _frame: &RawFrame) -> Result<Option<EncodedFrame>, CaptureError> {
            if self.codec == FrameCodec::H264 {
                let mut s = self.script.lock().unwrap();
                s.encodes += 1;
                if s.failing_encodes.contains(&s.encodes) {
                    return Err(CaptureError::Encode("encoder stalled".into()));
                }
            }
            Ok(Some(EncodedFrame {
                codec: self.codec,
                data: Bytes::from_static(b"frame"),
                keyframe: self.codec == FrameCodec::Jpeg,
            }))
        }

        fn force_keyframe(&mut self) {
            self.script.lock().unwrap().keyframes_forced += 1;
        }
    }

    #[async_trait::async_trait]
    impl CaptureBackend for FakeBackend {
        async fn open_source(
            &self,
            _settings: &CaptureSettings,
        ) -> Result<Box<dyn ScreenSource>, CaptureError> {
            self.script.lock().unwrap().sources_opened += 1;
            Ok(Box::new(FakeSource {
                script: Arc::clone(&self.script),
            }))
        }

        async fn primary_encoder(
            &self,
            _width: u32,
            _height: u32,
            _settings: &CaptureSettings,
        ) -> Result<Box<dyn FrameEncoder>, CaptureError> {
            if self.script.lock().unwrap().primary_unavailable {
                return Err(CaptureError::EncoderUnavailable("no H.264 encoder".into()));
            }
            Ok(Box::new(FakeEncoder {
                script: Arc::clone(&self.script),
                codec: FrameCodec::H264,
            }))
        }

        fn fallback_encoder(&self, _settings: &CaptureSettings) -> Box<dyn FrameEncoder> {
            Box::new(FakeEncoder {
                script: Arc::clone(&self.script),
                codec: FrameCodec::Jpeg,
            })
        }
    }

    fn settings(frame_rate: u32) -> CaptureSettings {
        CaptureSettings {
            region: None,
            frame_rate,
            quality: 75,
            bitrate: 8000,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<Arc<CaptureFrame>>) -> Vec<Arc<CaptureFrame>> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn paced_within_one_frame_despite_overrun() {
        let backend = FakeBackend::default();
        backend.script.lock().unwrap().slow_captures = vec![3];
        let pipeline = CapturePipeline::new(Arc::new(backend));

        pipeline.start(settings(20)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        pipeline.stop().await;

        let frames = pipeline.frames_produced();
        assert!((19..=21).contains(&frames), "produced {frames} frames");
    }

    #[tokio::test(start_paused = true)]
    async fn many_overruns_never_burst() {
        let backend = FakeBackend::default();
        backend.script.lock().unwrap().slow_captures = (1..=100).collect();
        let pipeline = CapturePipeline::new(Arc::new(backend));

        // Every capture takes 70ms against a 50ms interval.
        pipeline.start(settings(20)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        pipeline.stop().await;

        let frames = pipeline.frames_produced();
        assert!((14..=15).contains(&frames), "produced {frames} frames");
    }

    #[tokio::test(start_paused = true)]
    async fn capture_failure_skips_one_frame() {
        let backend = FakeBackend::default();
        backend.script.lock().unwrap().failing_captures = vec![2, 3];
        let script = Arc::clone(&backend.script);
        let pipeline = CapturePipeline::new(Arc::new(backend));

        pipeline.start(settings(10)).await;
        tokio::time::sleep(Duration::from_millis(950)).await;
        pipeline.stop().await;

        assert_eq!(pipeline.frames_produced(), 8);
        // The source is reopened after each failure.
        assert_eq!(script.lock().unwrap().sources_opened, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn encoder_failure_falls_back_to_still_frames() {
        let backend = FakeBackend::default();
        backend.script.lock().unwrap().failing_encodes = vec![2];
        let pipeline = CapturePipeline::new(Arc::new(backend));
        let mut rx = pipeline.subscribe();

        pipeline.start(settings(10)).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        pipeline.stop().await;

        let codecs: Vec<FrameCodec> = drain(&mut rx).iter().map(|f| f.codec).collect();
        assert_eq!(codecs, vec![FrameCodec::H264, FrameCodec::Jpeg, FrameCodec::H264]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_primary_streams_still_frames_only() {
        let backend = FakeBackend::default();
        backend.script.lock().unwrap().primary_unavailable = true;
        let pipeline = CapturePipeline::new(Arc::new(backend));
        let mut rx = pipeline.subscribe();

        pipeline.start(settings(10)).await;
        tokio::time::sleep(Duration::from_millis(350)).await;
        pipeline.stop().await;

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f.codec == FrameCodec::Jpeg && f.keyframe));
        assert_eq!(frames[0].duration, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn keyframe_request_reaches_primary() {
        let backend = FakeBackend::default();
        let script = Arc::clone(&backend.script);
        let pipeline = CapturePipeline::new(Arc::new(backend));

        pipeline.start(settings(10)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        pipeline.request_keyframe();
        tokio::time::sleep(Duration::from_millis(200)).await;
        pipeline.stop().await;

        assert_eq!(script.lock().unwrap().keyframes_forced, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_is_noop_when_idle() {
        let pipeline = CapturePipeline::new(Arc::new(FakeBackend::default()));
        pipeline.stop().await;
        assert!(!pipeline.is_running().await);

        pipeline.start(settings(10)).await;
        pipeline.start(settings(5)).await;
        assert!(pipeline.is_running().await);
        assert_eq!(pipeline.settings().await.map(|s| s.frame_rate), Some(5));

        let before = pipeline.frames_produced();
        tokio::time::sleep(Duration::from_millis(1050)).await;
        // Only the 5 fps loop is running.
        let produced = pipeline.frames_produced() - before;
        assert!((5..=6).contains(&produced), "produced {produced} frames");

        pipeline.stop().await;
        pipeline.stop().await;
        assert!(!pipeline.is_running().await);
        let after = pipeline.frames_produced();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pipeline.frames_produced(), after);
    }
}
