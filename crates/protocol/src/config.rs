use serde::{Deserialize, Serialize};

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Signaling server base URL (http, https, ws or wss)
    #[serde(default)]
    pub url: String,
    /// API key sent as `Authorization: ApiKey <key>` (prefer TETHER_API_KEY env)
    pub api_key: Option<String>,
    /// Identity of this host as known to the signaling server
    #[serde(default)]
    pub host_id: String,
    /// Query parameter carrying the host id on handshake and upgrade
    #[serde(default = "default_host_id_param")]
    pub host_id_param: String,
    /// Socket endpoint path on the server
    #[serde(default = "default_path")]
    pub path: String,
    /// Consecutive failed attempts before auto-reconnect gives up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// PEM certificate to trust in addition to the system roots
    pub tls_cert: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Silence on the socket for this long triggers a liveness ping
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl std::fmt::Debug for SignalingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("host_id", &self.host_id)
            .field("host_id_param", &self.host_id_param)
            .field("path", &self.path)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("tls_cert", &self.tls_cert)
            .finish_non_exhaustive()
    }
}

/// Rectangle of the screen to capture, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Target framerate
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Still-image (JPEG) quality, 1-100
    #[serde(default = "default_quality")]
    pub quality: u8,
    /// H.264 target bitrate in kbps
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Force a specific encoder: "nvh264enc", "vah264enc", "x264enc"
    pub encoder: Option<String>,
    /// X11 display to capture and inject input into
    #[serde(default = "default_display")]
    pub display: String,
    /// Capture only this region (default: whole screen)
    pub region: Option<CaptureRegion>,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptMode {
    /// Accept every inbound connection request without confirmation.
    All,
    /// Accept only peers listed in `allowed_peers`.
    AllowList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_accept_mode")]
    pub accept: AcceptMode,
    #[serde(default)]
    pub allowed_peers: Vec<String>,
    /// Grant remote keyboard/mouse control to accepted viewers that ask for it
    #[serde(default = "default_true")]
    pub allow_control: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Encrypted session file (default: $XDG_STATE_HOME/tether/session.bin)
    pub session_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            host_id: String::new(),
            host_id_param: default_host_id_param(),
            path: default_path(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            tls_cert: None,
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            framerate: default_framerate(),
            quality: default_quality(),
            bitrate: default_bitrate(),
            encoder: None,
            display: default_display(),
            region: None,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            accept: default_accept_mode(),
            allowed_peers: Vec::new(),
            allow_control: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl AgentConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, agent should not start) or
    /// "WARNING:" (advisory, agent can start but the config is likely wrong).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Signaling endpoint ---
        let url = self.signaling.url.trim();
        if url.is_empty() {
            issues.push(
                "ERROR: signaling.url is required (e.g. https://signal.example.com)".to_string(),
            );
        } else {
            match url.split_once("://") {
                Some(("http" | "https" | "ws" | "wss", rest))
                    if !rest.is_empty() && !rest.starts_with('/') => {}
                _ => issues.push(format!(
                    "ERROR: signaling.url '{}' must be an http(s) or ws(s) URL with a host.",
                    url
                )),
            }
        }

        if self.signaling.host_id.trim().is_empty() {
            issues.push("ERROR: signaling.host_id is required.".to_string());
        }

        let param = &self.signaling.host_id_param;
        if param.is_empty()
            || !param
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            issues.push(format!(
                "ERROR: signaling.host_id_param '{}' must be a non-empty query parameter name \
                 (a-z, A-Z, 0-9, _, -).",
                param
            ));
        }

        if self.signaling.api_key.as_deref().is_none_or(str::is_empty) {
            issues.push(
                "WARNING: no signaling API key configured. Set TETHER_API_KEY or signaling.api_key; \
                 the server will most likely refuse the handshake."
                    .to_string(),
            );
        }

        if self.signaling.max_reconnect_attempts == 0 {
            issues.push("ERROR: signaling.max_reconnect_attempts must be >= 1.".to_string());
        }

        for (name, value) in [
            ("connect_timeout_secs", self.signaling.connect_timeout_secs),
            ("handshake_timeout_secs", self.signaling.handshake_timeout_secs),
            ("idle_timeout_secs", self.signaling.idle_timeout_secs),
        ] {
            if value == 0 {
                issues.push(format!("ERROR: signaling.{name} must be >= 1 second."));
            }
        }

        // --- Capture ---
        if self.capture.framerate == 0 || self.capture.framerate > 120 {
            issues.push(format!(
                "ERROR: capture.framerate must be between 1 and 120, got {}.",
                self.capture.framerate
            ));
        }

        if self.capture.quality == 0 || self.capture.quality > 100 {
            issues.push(format!(
                "ERROR: capture.quality must be between 1 and 100, got {}.",
                self.capture.quality
            ));
        }

        if self.capture.bitrate > 100_000 {
            issues.push(format!(
                "WARNING: capture.bitrate is {} kbps ({} Mbps), this is unusually high \
                 and may indicate a misconfiguration. Typical values: 2000-20000 kbps.",
                self.capture.bitrate,
                self.capture.bitrate / 1000
            ));
        }

        if let Some(region) = &self.capture.region
            && (region.width == 0 || region.height == 0)
        {
            issues.push(format!(
                "ERROR: capture.region must have a non-zero size, got {}x{}.",
                region.width, region.height
            ));
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }

        // --- Policy ---
        if self.policy.accept == AcceptMode::AllowList && self.policy.allowed_peers.is_empty() {
            issues.push(
                "WARNING: policy.accept is 'allow_list' but policy.allowed_peers is empty. \
                 Every connection request will be rejected."
                    .to_string(),
            );
        }

        // --- Network probe ---
        if self.network.probe_interval_secs == 0 {
            issues.push("ERROR: network.probe_interval_secs must be >= 1.".to_string());
        }
        if self.network.probe_timeout_secs == 0 {
            issues.push("ERROR: network.probe_timeout_secs must be >= 1.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_host_id_param() -> String {
    "hostId".to_string()
}
fn default_path() -> String {
    "/socket.io/".to_string()
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    30
}
fn default_framerate() -> u32 {
    30
}
fn default_quality() -> u8 {
    75
}
fn default_bitrate() -> u32 {
    8000
}
fn default_display() -> String {
    ":0".to_string()
}
fn default_true() -> bool {
    true
}
fn default_accept_mode() -> AcceptMode {
    AcceptMode::All
}
fn default_probe_interval() -> u64 {
    5
}
fn default_probe_timeout() -> u64 {
    3
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: AgentConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        // Signaling defaults
        assert!(config.signaling.url.is_empty());
        assert!(config.signaling.api_key.is_none());
        assert_eq!(config.signaling.host_id_param, "hostId");
        assert_eq!(config.signaling.path, "/socket.io/");
        assert_eq!(config.signaling.max_reconnect_attempts, 10);
        assert_eq!(config.signaling.connect_timeout_secs, 10);
        assert_eq!(config.signaling.handshake_timeout_secs, 10);
        assert_eq!(config.signaling.idle_timeout_secs, 30);

        // Capture defaults
        assert_eq!(config.capture.framerate, 30);
        assert_eq!(config.capture.quality, 75);
        assert_eq!(config.capture.bitrate, 8000);
        assert_eq!(config.capture.display, ":0");
        assert!(config.capture.encoder.is_none());
        assert!(config.capture.region.is_none());

        // Policy defaults
        assert_eq!(config.policy.accept, AcceptMode::All);
        assert!(config.policy.allow_control);

        // ICE defaults
        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn_urls.is_empty());

        assert_eq!(config.network.probe_interval_secs, 5);
        assert!(config.storage.session_file.is_none());
    }

    #[test]
    fn custom_values_override_defaults() {
        let toml_str = r#"
[signaling]
url = "https://signal.example.com"
api_key = "k-123"
host_id = "host-42"
host_id_param = "remotePcId"
max_reconnect_attempts = 5

[capture]
framerate = 15
quality = 60
encoder = "x264enc"
display = ":1"
region = { x = 10, y = 20, width = 800, height = 600 }

[policy]
accept = "allow_list"
allowed_peers = ["viewer-1"]
allow_control = false

[storage]
session_file = "/var/lib/tether/session.bin"
"#;
        let config: AgentConfig = toml::from_str(toml_str).expect("custom config");
        assert_eq!(config.signaling.url, "https://signal.example.com");
        assert_eq!(config.signaling.api_key.as_deref(), Some("k-123"));
        assert_eq!(config.signaling.host_id_param, "remotePcId");
        assert_eq!(config.signaling.max_reconnect_attempts, 5);
        // Untouched fields keep defaults
        assert_eq!(config.signaling.idle_timeout_secs, 30);

        assert_eq!(config.capture.framerate, 15);
        assert_eq!(config.capture.quality, 60);
        assert_eq!(config.capture.encoder.as_deref(), Some("x264enc"));
        assert_eq!(
            config.capture.region,
            Some(CaptureRegion {
                x: 10,
                y: 20,
                width: 800,
                height: 600
            })
        );
        assert_eq!(config.policy.accept, AcceptMode::AllowList);
        assert_eq!(config.policy.allowed_peers, vec!["viewer-1"]);
        assert!(!config.policy.allow_control);
        assert_eq!(
            config.storage.session_file.as_deref(),
            Some("/var/lib/tether/session.bin")
        );
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut config = SignalingConfig::default();
        config.api_key = Some("super-secret".into());
        let dbg = format!("{config:?}");
        assert!(!dbg.contains("super-secret"));
        assert!(dbg.contains("REDACTED"));
    }

    // --- Validation tests ---

    /// Helper: a config that passes validation, to be mutated by each test.
    fn valid_config() -> AgentConfig {
        let mut config: AgentConfig = toml::from_str("").expect("default config");
        config.signaling.url = "https://signal.example.com".into();
        config.signaling.host_id = "host-1".into();
        config.signaling.api_key = Some("key".into());
        config
    }

    fn validate_issues(config: &AgentConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn validate_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_empty_defaults_are_errors() {
        let config: AgentConfig = toml::from_str("").unwrap();
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "signaling.url"));
        assert!(has_error(&issues, "signaling.host_id"));
        assert!(has_warning(&issues, "API key"));
    }

    #[test]
    fn validate_url_schemes() {
        for ok in ["http://a", "https://a.b:8443/x", "ws://10.0.0.1", "wss://h"] {
            let mut config = valid_config();
            config.signaling.url = ok.into();
            assert!(config.validate().is_ok(), "{ok} should be accepted");
        }
        for bad in ["ftp://a", "signal.example.com", "https://", "https:///path"] {
            let mut config = valid_config();
            config.signaling.url = bad.into();
            assert!(
                has_error(&validate_issues(&config), "signaling.url"),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn validate_host_id_param_charset() {
        let mut config = valid_config();
        config.signaling.host_id_param = "host id".into();
        assert!(has_error(&validate_issues(&config), "host_id_param"));
    }

    #[test]
    fn validate_reconnect_attempts_zero_is_error() {
        let mut config = valid_config();
        config.signaling.max_reconnect_attempts = 0;
        assert!(has_error(&validate_issues(&config), "max_reconnect_attempts"));
    }

    #[test]
    fn validate_zero_timeout_is_error() {
        let mut config = valid_config();
        config.signaling.handshake_timeout_secs = 0;
        assert!(has_error(&validate_issues(&config), "handshake_timeout_secs"));
    }

    #[test]
    fn validate_framerate_bounds() {
        let mut config = valid_config();
        config.capture.framerate = 0;
        assert!(has_error(&validate_issues(&config), "framerate"));
        config.capture.framerate = 121;
        assert!(has_error(&validate_issues(&config), "framerate"));
        config.capture.framerate = 120;
        assert!(config.validate().is_ok());
        config.capture.framerate = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_quality_bounds() {
        let mut config = valid_config();
        config.capture.quality = 0;
        assert!(has_error(&validate_issues(&config), "quality"));
        config.capture.quality = 101;
        assert!(has_error(&validate_issues(&config), "quality"));
        config.capture.quality = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_bitrate_over_100k_is_warning() {
        let mut config = valid_config();
        config.capture.bitrate = 150_000;
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "capture.bitrate"));
        assert!(!issues.iter().any(|i| i.starts_with("ERROR:")));
        assert!(issues.iter().all(|i| i.is_ascii()));
    }

    #[test]
    fn validate_empty_region_is_error() {
        let mut config = valid_config();
        config.capture.region = Some(CaptureRegion {
            x: 0,
            y: 0,
            width: 0,
            height: 480,
        });
        assert!(has_error(&validate_issues(&config), "capture.region"));
    }

    #[test]
    fn validate_stun_url_bad_prefix_is_error() {
        let mut config = valid_config();
        config.ice.stun_urls = vec!["http://stun.example.com".into()];
        assert!(has_error(&validate_issues(&config), "STUN URL"));
    }

    #[test]
    fn validate_turn_url_turns_prefix_is_ok() {
        let mut config = valid_config();
        config.ice.turn_urls = vec!["turns:turn.example.com:5349".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_empty_allow_list_is_warning() {
        let mut config = valid_config();
        config.policy.accept = AcceptMode::AllowList;
        assert!(has_warning(&validate_issues(&config), "allowed_peers"));
        config.policy.allowed_peers = vec!["viewer".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_multiple_errors_collected() {
        let mut config = valid_config();
        config.capture.framerate = 0;
        config.capture.quality = 0;
        config.network.probe_interval_secs = 0;
        let issues = validate_issues(&config);
        let errors = issues.iter().filter(|i| i.starts_with("ERROR:")).count();
        assert_eq!(errors, 3, "expected 3 errors, got: {issues:?}");
    }
}
