use anyhow::Context;
use tether_protocol::AgentConfig;

pub(crate) const DEFAULT_CONFIG_PATH: &str = "/etc/tether/agent.toml";
pub(crate) const API_KEY_ENV: &str = "TETHER_API_KEY";

/// Command-line overrides; anything left `None` keeps the config file value.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Args {
    pub config_path: Option<String>,
    pub server_url: Option<String>,
    pub host_id: Option<String>,
    pub api_key: Option<String>,
    pub display: Option<String>,
    pub framerate: Option<u32>,
    pub log_json: bool,
}

impl Args {
    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(url) = &self.server_url {
            config.signaling.url = url.clone();
        }
        if let Some(host_id) = &self.host_id {
            config.signaling.host_id = host_id.clone();
        }
        if let Some(key) = &self.api_key {
            config.signaling.api_key = Some(key.clone());
        }
        if let Some(display) = &self.display {
            config.capture.display = display.clone();
        }
        if let Some(fps) = self.framerate {
            config.capture.framerate = fps;
        }
    }
}

fn print_help() {
    println!("tether-agent - remote access host agent");
    println!();
    println!("USAGE:");
    println!("    tether-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --config <PATH>              Config file [default: {DEFAULT_CONFIG_PATH}]");
    println!("    --server-url <URL>           Signaling server URL (http, https, ws, wss)");
    println!("    --host-id <ID>               Identity of this host on the server");
    println!("    --api-key <KEY>              API key (prefer {API_KEY_ENV} env var)");
    println!("    --display <DISPLAY>          X11 display [default: :0]");
    println!("    --framerate <FPS>            Capture framerate [default: 30]");
    println!("    --log-json                   Emit logs as JSON lines");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    parse_from(&args, std::env::var(API_KEY_ENV).ok())
}

pub(crate) fn parse_from(args: &[String], env_api_key: Option<String>) -> anyhow::Result<Args> {
    let mut parsed = Args::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("tether-agent {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--config" => {
                i += 1;
                parsed.config_path = Some(args.get(i).context("Missing --config value")?.clone());
            }
            "--server-url" => {
                i += 1;
                parsed.server_url =
                    Some(args.get(i).context("Missing --server-url value")?.clone());
            }
            "--host-id" => {
                i += 1;
                parsed.host_id = Some(args.get(i).context("Missing --host-id value")?.clone());
            }
            "--api-key" => {
                // Legacy CLI support (argv is visible in /proc)
                i += 1;
                parsed.api_key = Some(args.get(i).context("Missing --api-key value")?.clone());
            }
            "--display" => {
                i += 1;
                parsed.display = Some(args.get(i).context("Missing --display value")?.clone());
            }
            "--framerate" => {
                i += 1;
                parsed.framerate = Some(
                    args.get(i)
                        .context("Missing --framerate value")?
                        .parse()
                        .context("Invalid --framerate value")?,
                );
            }
            "--log-json" => parsed.log_json = true,
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    if env_api_key.as_deref().is_some_and(|k| !k.is_empty()) {
        parsed.api_key = env_api_key;
    }

    Ok(parsed)
}
