//! Reachability of the signaling server, probed with plain TCP connects.

use anyhow::Context;
use std::time::Duration;
use tether_protocol::NetworkConfig;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Unknown,
    Available,
    Unavailable,
}

pub struct NetworkMonitor {
    host: String,
    port: u16,
    interval: Duration,
    timeout: Duration,
}

impl NetworkMonitor {
    pub fn new(host: impl Into<String>, port: u16, interval: Duration, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            interval,
            timeout,
        }
    }

    /// Probe the host and port of the signaling URL.
    pub fn for_server(server_url: &str, config: &NetworkConfig) -> anyhow::Result<Self> {
        let url = Url::parse(server_url).context("Invalid signaling URL")?;
        let host = url.host_str().context("Signaling URL has no host")?;
        let port = url
            .port_or_known_default()
            .context("Signaling URL has no port")?;
        Ok(Self::new(
            host,
            port,
            Duration::from_secs(config.probe_interval_secs.max(1)),
            Duration::from_secs(config.probe_timeout_secs.max(1)),
        ))
    }

    /// Run the probe loop until `cancel` fires. The receiver only changes on
    /// transitions.
    pub fn spawn(self, cancel: CancellationToken) -> (watch::Receiver<Availability>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(Availability::Unknown);
        let handle = tokio::spawn(async move {
            info!(host = %self.host, port = self.port, interval_secs = self.interval.as_secs(), "Network monitor started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut failures: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let now = if self.probe().await {
                    failures = 0;
                    Availability::Available
                } else {
                    failures += 1;
                    Availability::Unavailable
                };
                let changed = tx.send_if_modified(|current| {
                    let changed = *current != now;
                    *current = now;
                    changed
                });
                if changed {
                    match now {
                        Availability::Available => info!(host = %self.host, "Signaling server reachable"),
                        _ => warn!(host = %self.host, "Signaling server unreachable"),
                    }
                } else if failures > 0 && failures.is_multiple_of(100) {
                    debug!(host = %self.host, failures, "Signaling server still unreachable");
                }
            }
            debug!("Network monitor stopped");
        });
        (rx, handle)
    }

    async fn probe(&self) -> bool {
        matches!(
            tokio::time::timeout(
                self.timeout,
                TcpStream::connect((self.host.as_str(), self.port))
            )
            .await,
            Ok(Ok(_))
        )
    }
}
