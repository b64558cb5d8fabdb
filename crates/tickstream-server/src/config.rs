use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default, deserialize_with = "tickstream_helpers::de::deserialize_optional_duration")]
    pub read_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "tickstream_helpers::de::deserialize_optional_duration")]
    pub write_timeout: Option<Duration>,
    #[serde(default = "default_true")]
    pub keepalive: bool,

    #[serde(default = "default_tcp_read_buffer_size")]
    pub tcp_read_buffer_size: usize,
    #[serde(default = "default_tcp_write_buffer_size")]
    pub tcp_write_buffer_size: usize,
    #[serde(default = "default_max_write_queue_size")]
    pub max_write_queue_size: usize,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: u32,

    pub stream_user: String,
    pub stream_pass: String,
    #[serde(default, deserialize_with = "tickstream_helpers::de::deserialize_optional_duration")]
    pub auth_timeout: Option<Duration>,
    #[serde(default = "default_auth_max_attempts")]
    pub auth_max_attempts: u32,
    #[serde(default, deserialize_with = "tickstream_helpers::de::deserialize_optional_duration")]
    pub auth_rate_limit_window: Option<Duration>,

    #[serde(default, deserialize_with = "tickstream_helpers::de::deserialize_optional_duration")]
    pub heartbeat_interval: Option<Duration>,
    #[serde(default, deserialize_with = "tickstream_helpers::de::deserialize_optional_duration")]
    pub heartbeat_timeout: Option<Duration>,

    #[serde(default, deserialize_with = "tickstream_helpers::de::deserialize_optional_duration")]
    pub batch_window: Option<Duration>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default)]
    pub ip_allowlist: Vec<String>,
    #[serde(default)]
    pub ip_blocklist: Vec<String>,

    #[serde(default, deserialize_with = "tickstream_helpers::de::deserialize_optional_duration")]
    pub shutdown_drain_timeout: Option<Duration>,
}

/// Effective (post-default) timeouts, used everywhere but `Config::load`.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub auth_timeout: Duration,
    pub auth_rate_limit_window: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub batch_window: Duration,
    pub shutdown_drain_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_server_config_path)
            .context(
                "server config path not found (TICKSTREAM_CONFIG_PATH or tickstream.yaml/tickstream.yml)",
            )?;

        let mut config = load_config_yaml(&config_path)?;
        config.normalize()?;
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<()> {
        self.listen_addr = trim_owned(self.listen_addr.clone());
        self.stream_user = trim_owned(self.stream_user.clone());

        if self.listen_addr.is_empty() {
            self.listen_addr = default_listen_addr();
        }

        self.max_connections = self.max_connections.max(1);
        self.tcp_read_buffer_size = self.tcp_read_buffer_size.max(1024);
        self.tcp_write_buffer_size = self.tcp_write_buffer_size.max(1024);
        self.max_write_queue_size = self.max_write_queue_size.max(1);
        self.max_message_size = self.max_message_size.max(1);
        self.auth_max_attempts = self.auth_max_attempts.max(1);
        self.max_batch_size = self.max_batch_size.max(1);

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.stream_user.is_empty() {
            bail!("server config missing `stream_user`");
        }
        if self.stream_pass.is_empty() {
            bail!("server config missing `stream_pass`");
        }
        if self.max_message_size > tickstream_proto::MAX_PAYLOAD {
            bail!(
                "server config `max_message_size` ({}) exceeds protocol maximum ({})",
                self.max_message_size,
                tickstream_proto::MAX_PAYLOAD
            );
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            read_timeout: self.read_timeout.unwrap_or(Duration::from_secs(30)),
            write_timeout: self.write_timeout.unwrap_or(Duration::from_secs(5)),
            auth_timeout: self.auth_timeout.unwrap_or(Duration::from_secs(10)),
            auth_rate_limit_window: self
                .auth_rate_limit_window
                .unwrap_or(Duration::from_secs(60)),
            heartbeat_interval: self
                .heartbeat_interval
                .unwrap_or(Duration::from_secs(15)),
            heartbeat_timeout: self
                .heartbeat_timeout
                .unwrap_or(Duration::from_secs(20)),
            batch_window: self.batch_window.unwrap_or(Duration::from_millis(5)),
            shutdown_drain_timeout: self
                .shutdown_drain_timeout
                .unwrap_or(Duration::from_secs(30)),
        }
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!("too many arguments: {arg} (usage: tickstream-server [config-path])");
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: tickstream-server [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

fn load_config_yaml(path: &Path) -> Result<Config> {
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_slice(&raw)
        .with_context(|| format!("failed to parse YAML config {}", path.display()))
}

fn resolve_server_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("TICKSTREAM_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    for name in ["tickstream.yaml", "tickstream.yml"] {
        let candidate = cwd.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Some(home) = non_empty_env("HOME") {
        for name in ["tickstream.yaml", "tickstream.yml"] {
            let candidate = PathBuf::from(&home).join(name);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_tcp_read_buffer_size() -> usize {
    64 * 1024
}

fn default_tcp_write_buffer_size() -> usize {
    64 * 1024
}

fn default_max_write_queue_size() -> usize {
    1_000
}

fn default_max_message_size() -> u32 {
    tickstream_proto::MAX_PAYLOAD
}

fn default_auth_max_attempts() -> u32 {
    3
}

fn default_max_batch_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_fall_back_to_spec_defaults() {
        let config = Config {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            read_timeout: None,
            write_timeout: None,
            keepalive: true,
            tcp_read_buffer_size: default_tcp_read_buffer_size(),
            tcp_write_buffer_size: default_tcp_write_buffer_size(),
            max_write_queue_size: default_max_write_queue_size(),
            max_message_size: default_max_message_size(),
            stream_user: "u".to_string(),
            stream_pass: "p".to_string(),
            auth_timeout: None,
            auth_max_attempts: default_auth_max_attempts(),
            auth_rate_limit_window: None,
            heartbeat_interval: None,
            heartbeat_timeout: None,
            batch_window: None,
            max_batch_size: default_max_batch_size(),
            ip_allowlist: vec![],
            ip_blocklist: vec![],
            shutdown_drain_timeout: None,
        };
        let timeouts = config.timeouts();
        assert_eq!(timeouts.read_timeout, Duration::from_secs(30));
        assert_eq!(timeouts.batch_window, Duration::from_millis(5));
        assert_eq!(timeouts.heartbeat_timeout, Duration::from_secs(20));
    }
}
