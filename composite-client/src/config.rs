//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use composite_core::{AdapterConfig, BodyEncoding, CoordinatorConfig, Credentials, Location};
use serde::Deserialize;

/// Client configuration. File: ~/.config/composite/config.toml or /etc/composite/config.toml.
/// Env overrides: COMPOSITE_ENDPOINT, COMPOSITE_LOGIN, COMPOSITE_PASSCODE,
/// COMPOSITE_HEARTBEAT_MS, COMPOSITE_PING_INTERVAL_MS, COMPOSITE_DEVICE_REFRESH_DELAY_MS,
/// COMPOSITE_ADAPTER_ENCODING, COMPOSITE_COORDINATOR_ENCODING.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Broker endpoint (default "memory://composite").
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_login")]
    pub login: String,
    #[serde(default = "default_passcode")]
    pub passcode: String,
    /// Heartbeat in both directions, in ms (default 10000).
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Delay before re-requesting the device list after a join (default 100).
    #[serde(default = "default_device_refresh_delay_ms")]
    pub device_refresh_delay_ms: u64,
    /// Body encoding seen by the adapter (default double).
    #[serde(default = "default_adapter_encoding")]
    pub adapter_encoding: BodyEncoding,
    /// Body encoding seen by the coordinator (default single).
    #[serde(default)]
    pub coordinator_encoding: BodyEncoding,
    /// Position sent with join requests.
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

fn default_endpoint() -> String {
    "memory://composite".to_owned()
}
fn default_login() -> String {
    composite_core::protocol::DEFAULT_LOGIN.to_owned()
}
fn default_passcode() -> String {
    composite_core::protocol::DEFAULT_PASSCODE.to_owned()
}
fn default_heartbeat_ms() -> u64 {
    10_000
}
fn default_ping_interval_ms() -> u64 {
    250
}
fn default_device_refresh_delay_ms() -> u64 {
    100
}
fn default_adapter_encoding() -> BodyEncoding {
    BodyEncoding::Double
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            login: default_login(),
            passcode: default_passcode(),
            heartbeat_ms: default_heartbeat_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            device_refresh_delay_ms: default_device_refresh_delay_ms(),
            adapter_encoding: default_adapter_encoding(),
            coordinator_encoding: BodyEncoding::Single,
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

/// Zero intervals fall back to the default with a warning.
fn interval_ms(field: &str, ms: u64, default: u64) -> Duration {
    if ms == 0 {
        tracing::warn!(field, default, "interval must be non-zero; using default");
        return Duration::from_millis(default);
    }
    Duration::from_millis(ms)
}

impl Config {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            adapter: AdapterConfig {
                credentials: Credentials {
                    login: self.login.clone(),
                    passcode: self.passcode.clone(),
                },
                heartbeat: interval_ms("heartbeat_ms", self.heartbeat_ms, default_heartbeat_ms()),
                encoding: self.adapter_encoding,
            },
            encoding: self.coordinator_encoding,
            ping_interval: interval_ms(
                "ping_interval_ms",
                self.ping_interval_ms,
                default_ping_interval_ms(),
            ),
            device_refresh_delay: Duration::from_millis(self.device_refresh_delay_ms),
        }
    }

    pub fn location(&self) -> Location {
        Location::new(self.latitude, self.longitude)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("COMPOSITE_ENDPOINT") {
        c.endpoint = s;
    }
    if let Some(s) = var("COMPOSITE_LOGIN") {
        c.login = s;
    }
    if let Some(s) = var("COMPOSITE_PASSCODE") {
        c.passcode = s;
    }
    if let Some(ms) = var("COMPOSITE_HEARTBEAT_MS").and_then(|s| s.parse().ok()) {
        c.heartbeat_ms = ms;
    }
    if let Some(ms) = var("COMPOSITE_PING_INTERVAL_MS").and_then(|s| s.parse().ok()) {
        c.ping_interval_ms = ms;
    }
    if let Some(ms) = var("COMPOSITE_DEVICE_REFRESH_DELAY_MS").and_then(|s| s.parse().ok()) {
        c.device_refresh_delay_ms = ms;
    }
    if let Some(e) = var("COMPOSITE_ADAPTER_ENCODING").and_then(|s| s.parse().ok()) {
        c.adapter_encoding = e;
    }
    if let Some(e) = var("COMPOSITE_COORDINATOR_ENCODING").and_then(|s| s.parse().ok()) {
        c.coordinator_encoding = e;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/composite/config.toml"));
    }
    out.push(PathBuf::from("/etc/composite/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol() {
        let c = Config::default();
        let core = c.coordinator_config();
        assert_eq!(core.ping_interval, Duration::from_millis(250));
        assert_eq!(core.device_refresh_delay, Duration::from_millis(100));
        assert_eq!(core.adapter.heartbeat, Duration::from_secs(10));
        assert_eq!(core.adapter.encoding, BodyEncoding::Double);
        assert_eq!(core.encoding, BodyEncoding::Single);
        assert_eq!(core.adapter.credentials, Credentials::default());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str(
            r#"
            endpoint = "ws://broker.local/composite"
            adapter_encoding = "single"
            latitude = 51.5
            "#,
        )
        .unwrap();
        assert_eq!(c.endpoint, "ws://broker.local/composite");
        assert_eq!(c.adapter_encoding, BodyEncoding::Single);
        assert_eq!(c.ping_interval_ms, 250);
        assert_eq!(c.location(), Location::new(51.5, 0.0));
    }

    #[test]
    fn zero_intervals_fall_back_to_defaults() {
        let mut c = Config::default();
        apply_env(&mut c, |k| (k == "COMPOSITE_PING_INTERVAL_MS").then(|| "0".to_string()));
        assert_eq!(c.ping_interval_ms, 0);
        c.heartbeat_ms = 0;
        c.device_refresh_delay_ms = 0;
        let core = c.coordinator_config();
        assert_eq!(core.ping_interval, Duration::from_millis(250));
        assert_eq!(core.adapter.heartbeat, Duration::from_secs(10));
        assert_eq!(core.device_refresh_delay, Duration::ZERO);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("COMPOSITE_ENDPOINT", "ws://elsewhere"),
            ("COMPOSITE_PING_INTERVAL_MS", "500"),
            ("COMPOSITE_HEARTBEAT_MS", "not-a-number"),
            ("COMPOSITE_COORDINATOR_ENCODING", "Double"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.endpoint, "ws://elsewhere");
        assert_eq!(c.ping_interval_ms, 500);
        assert_eq!(c.heartbeat_ms, 10_000);
        assert_eq!(c.coordinator_encoding, BodyEncoding::Double);
    }
}
