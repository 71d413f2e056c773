use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::security::{AccessToken, ProxyAllowlist};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    pub allowed_proxy_ips: Option<Vec<String>>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

/// A host/port pair dialed when the requested destination is unreachable
#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    pub token: AccessToken,
    pub fallback: Endpoint,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_max_request_head")]
    pub max_request_head: usize,
    /// How long a client may take to send its complete request head
    #[serde(default = "default_head_timeout_ms")]
    pub head_timeout_ms: u64,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    #[serde(default)]
    pub flow: FlowConfig,
}

/// Flow-control thresholds shared by the uplink and downlink pipelines
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Client backlog above which the downlink stops reading from the target
    pub ws_high_water: usize,
    /// Client backlog the downlink waits for before resuming
    pub ws_low_water: usize,
    /// Upper bound on the size of one coalesced uplink write
    pub merge_max: usize,
    /// A pushed chunk larger than this is flushed without waiting for company
    pub large_chunk: usize,
    pub queue_slots: usize,
    pub queue_byte_cap: usize,
    /// Maximum number of queued chunks merged into one write
    pub coalesce_chunks: usize,
    /// Queue depth at which a push flushes immediately
    pub eager_slots: usize,
    pub read_buffer_size: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            ws_high_water: 32 * 1024,
            ws_low_water: 16 * 1024,
            merge_max: 16 * 1024,
            large_chunk: 8 * 1024,
            queue_slots: 32,
            queue_byte_cap: 256 * 1024,
            coalesce_chunks: 16,
            eager_slots: 15,
            read_buffer_size: 8 * 1024,
        }
    }
}

const fn default_dial_timeout_ms() -> u64 {
    2000
}

const fn default_max_request_head() -> usize {
    8192
}

const fn default_head_timeout_ms() -> u64 {
    10_000
}

const fn default_close_grace_ms() -> u64 {
    5000
}

impl TunnelConfig {
    #[must_use]
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    #[must_use]
    pub const fn head_timeout(&self) -> Duration {
        Duration::from_millis(self.head_timeout_ms)
    }

    #[must_use]
    pub const fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ProxyAllowlist::parse(self.listen.allowed_proxy_ips.as_deref())?;
        ensure!(
            self.tunnel.dial_timeout_ms > 0,
            "tunnel.dial_timeout_ms must be positive"
        );
        ensure!(
            self.tunnel.head_timeout_ms > 0,
            "tunnel.head_timeout_ms must be positive"
        );
        ensure!(
            !self.tunnel.fallback.host.is_empty(),
            "tunnel.fallback.host must not be empty"
        );
        self.tunnel.flow.validate()
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.ws_low_water < self.ws_high_water,
            "flow.ws_low_water ({}) must be below flow.ws_high_water ({})",
            self.ws_low_water,
            self.ws_high_water
        );
        ensure!(self.queue_slots > 0, "flow.queue_slots must be positive");
        ensure!(
            self.coalesce_chunks > 0,
            "flow.coalesce_chunks must be positive"
        );
        ensure!(
            self.eager_slots <= self.queue_slots,
            "flow.eager_slots must not exceed flow.queue_slots"
        );
        ensure!(self.merge_max > 0, "flow.merge_max must be positive");
        ensure!(
            self.read_buffer_size > 0,
            "flow.read_buffer_size must be positive"
        );
        ensure!(
            self.queue_byte_cap >= self.merge_max,
            "flow.queue_byte_cap must be at least flow.merge_max"
        );
        Ok(())
    }
}

pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Invalid configuration in {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config as valid TOML")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [listen]
        ip = "127.0.0.1"
        port = 8080

        [tunnel]
        token = "55d9ec38-1b8a-454b-981a-6acfe8f56d8c"
        fallback = { host = "relay.example.net", port = 443 }
    "#;

    #[test]
    fn fills_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.listen.port, 8080);
        assert_eq!(config.tunnel.dial_timeout(), Duration::from_secs(2));
        assert_eq!(config.tunnel.head_timeout(), Duration::from_secs(10));
        assert_eq!(config.tunnel.fallback.port, 443);
        assert_eq!(config.tunnel.flow.queue_slots, 32);
        assert_eq!(config.tunnel.flow.ws_high_water, 32768);
        assert!(config.listen.tls.is_none());
    }

    #[test]
    fn overrides_flow_thresholds() {
        let content = format!(
            "{MINIMAL}\n[tunnel.flow]\nws_high_water = 65536\nws_low_water = 1024\n"
        );
        let config = parse_config(&content).unwrap();
        assert_eq!(config.tunnel.flow.ws_high_water, 65536);
        assert_eq!(config.tunnel.flow.ws_low_water, 1024);
        assert_eq!(config.tunnel.flow.merge_max, 16384);
    }

    #[test]
    fn rejects_inverted_water_marks() {
        let content = format!(
            "{MINIMAL}\n[tunnel.flow]\nws_high_water = 1024\nws_low_water = 4096\n"
        );
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn rejects_bad_token() {
        let content = MINIMAL.replace("55d9ec38-1b8a-454b-981a-6acfe8f56d8c", "secret");
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn rejects_bad_allowlist() {
        let content = MINIMAL.replace(
            "port = 8080",
            "port = 8080\nallowed_proxy_ips = [\"nope\"]",
        );
        assert!(parse_config(&content).is_err());
    }
}
