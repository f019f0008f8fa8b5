use anyhow::{Context, Result};
use std::path::Path;
use tether_protocol::AgentConfig;

/// Load configuration from a TOML file. A missing file yields defaults
/// unless the path was given explicitly.
pub fn load_config(path: &Path, explicit: bool) -> Result<AgentConfig> {
    if !path.exists() {
        if explicit {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(AgentConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: AgentConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_default_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("agent.toml"), false).unwrap();
        assert_eq!(config.capture.framerate, AgentConfig::default().capture.framerate);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(&dir.path().join("agent.toml"), true).is_err());
    }

    #[test]
    fn reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[signaling]
url = "https://signal.example.com"
host_id = "desk-1"

[capture]
framerate = 24
"#
        )
        .unwrap();
        let config = load_config(file.path(), true).unwrap();
        assert_eq!(config.signaling.url, "https://signal.example.com");
        assert_eq!(config.signaling.host_id, "desk-1");
        assert_eq!(config.capture.framerate, 24);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[signaling\nurl = ").unwrap();
        assert!(load_config(file.path(), true).is_err());
    }
}
