mod capture;
mod cli;
mod config;
mod coordinator;
mod crypto;
mod encoder;
mod h264;
mod input;
mod netmon;
mod peer;
mod pipeline;
mod policy;
mod rtc;
mod session_store;
mod signaling;

use anyhow::Context;
use coordinator::{CoordinatorDeps, CoordinatorEvent, SessionCoordinator};
use crypto::AesGcmCipher;
use input::{InputExecutor, LogOnlyExecutor, XtestExecutor};
use netmon::{Availability, NetworkMonitor};
use peer::WebRtcEngine;
use pipeline::{CapturePipeline, CaptureSettings, DesktopBackend};
use session_store::{EncryptedFileStore, MemoryStore, SessionStore};
use signaling::{SignalingChannel, SignalingSettings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Encrypted file store, or an in-memory one when the state directory
/// cannot be created (sessions then only resume within this process).
fn build_store(session_file: Option<&str>, hostname: &str) -> Arc<dyn SessionStore> {
    let path = session_file
        .map(PathBuf::from)
        .unwrap_or_else(session_store::default_session_path);
    if let Some(parent) = path.parent()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        warn!(
            path = %parent.display(),
            error = %e,
            "Session state directory not writable, session resumption limited to this run"
        );
        return Arc::new(MemoryStore::default());
    }
    let store = EncryptedFileStore::new(path, Box::new(AesGcmCipher::for_machine(hostname)));
    info!(path = %store.path().display(), "Using encrypted session store");
    Arc::new(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (needed for TLS to the signaling server)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = cli::parse_args()?;
    init_tracing(args.log_json);

    let config_path = args
        .config_path
        .clone()
        .unwrap_or_else(|| cli::DEFAULT_CONFIG_PATH.to_string());
    let mut config = config::load_config(Path::new(&config_path), args.config_path.is_some())?;
    args.apply(&mut config);

    if let Err(issues) = config.validate() {
        let mut fatal = 0;
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{issue}");
                fatal += 1;
            } else {
                warn!("{issue}");
            }
        }
        if fatal > 0 {
            anyhow::bail!("Configuration has {fatal} error(s)");
        }
    }

    gstreamer::init().context("Failed to initialize GStreamer")?;

    let hostname = hostname();
    info!(
        server_url = %config.signaling.url,
        host_id = %config.signaling.host_id,
        display = %config.capture.display,
        framerate = config.capture.framerate,
        accept = ?config.policy.accept,
        "Starting tether-agent"
    );

    let store = build_store(config.storage.session_file.as_deref(), &hostname);
    let settings = SignalingSettings::from_config(&config.signaling, &hostname)
        .context("Invalid signaling configuration")?;
    let (channel, channel_events) = SignalingChannel::new(settings, store)?;

    let profile = encoder::detect_h264_profile(config.capture.encoder.as_deref());
    let engine = Arc::new(
        WebRtcEngine::new(&config.ice, profile).context("Failed to build WebRTC engine")?,
    );
    let backend = Arc::new(DesktopBackend::new(
        config.capture.display.clone(),
        config.capture.encoder.clone(),
    ));
    let pipeline = Arc::new(CapturePipeline::new(backend));

    let input: Arc<dyn InputExecutor> =
        match XtestExecutor::new(&config.capture.display, config.capture.region) {
            Ok(executor) => Arc::new(executor),
            Err(e) => {
                warn!("XTEST input unavailable: {e:#}. Remote input will be logged only.");
                Arc::new(LogOnlyExecutor::default())
            }
        };

    let (coordinator, sessions, mut coordinator_events) = SessionCoordinator::new(CoordinatorDeps {
        engine,
        signals: Arc::new(channel.clone()),
        pipeline: Arc::clone(&pipeline),
        capture: CaptureSettings::from_config(&config.capture),
        policy: policy::from_config(&config.policy),
        input,
    });
    let mut coordinator_task = tokio::spawn(coordinator.run(channel_events));

    let events_task = tokio::spawn(async move {
        while let Some(event) = coordinator_events.recv().await {
            match event {
                CoordinatorEvent::SessionCreated { peer_id, client_ip } => info!(
                    peer_id = %peer_id,
                    client_ip = client_ip.as_deref().unwrap_or("unknown"),
                    "Viewer session created"
                ),
                CoordinatorEvent::PeerConnectionClosed { peer_id } => {
                    info!(peer_id = %peer_id, "Viewer session closed")
                }
            }
        }
    });

    let cancel = CancellationToken::new();
    let (mut availability, netmon_task) =
        NetworkMonitor::for_server(&config.signaling.url, &config.network)?.spawn(cancel.clone());
    let restore_channel = channel.clone();
    let restore_task = tokio::spawn(async move {
        let mut previous = *availability.borrow();
        while availability.changed().await.is_ok() {
            let now = *availability.borrow_and_update();
            if previous == Availability::Unavailable && now == Availability::Available {
                restore_channel.network_restored();
            }
            previous = now;
        }
    });

    let status_channel = channel.clone();
    let status_pipeline = Arc::clone(&pipeline);
    let status_sessions = sessions.clone();
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let active = status_sessions.sessions().await;
            let capture_fps = status_pipeline.settings().await.map(|s| s.frame_rate);
            info!(
                signaling = ?status_channel.state(),
                sid = status_channel.sid().as_deref().unwrap_or("-"),
                ping_interval_ms = status_channel.ping_interval().as_millis() as u64,
                reconnect_attempts = status_channel.reconnect_attempts(),
                sessions = active.len(),
                capture_fps,
                frames = status_pipeline.frames_produced(),
                "Agent status"
            );
            for session in &active {
                debug!(
                    peer_id = %session.peer_id,
                    key = %session.key,
                    state = ?session.state,
                    control = session.control,
                    "Session"
                );
            }
        }
    });

    if let Err(e) = channel.connect().await {
        warn!(error = %e, "Initial signaling connect failed, retrying in background");
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        result = &mut coordinator_task => {
            error!(?result, "Session coordinator exited unexpectedly");
        }
    }

    sessions.shutdown().await;
    pipeline.stop().await;
    channel.disconnect().await;
    cancel.cancel();
    status_task.abort();
    restore_task.abort();
    let _ = netmon_task.await;
    let _ = events_task.await;
    info!("tether-agent stopped");
    Ok(())
}
