use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Relay server configuration
///
/// Layered as: built-in defaults, then an optional TOML file, then
/// `BUSTRACK_*` environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Interface the HTTP/WebSocket server binds to
    pub interface: String,
    pub port: u16,
    /// Prometheus metrics port; no metrics server when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
    /// Events a client may fall behind before it starts skipping fan-out
    pub broadcast_capacity: usize,
    pub heartbeat_interval_secs: u64,
    /// Connections silent for this long are dropped
    pub idle_timeout_secs: u64,
    /// How often orphaned snapshots are swept; 0 disables the sweep
    pub audit_interval_secs: u64,
    /// Largest inbound WebSocket frame accepted
    pub max_frame_bytes: usize,
    /// Replies queued for one connection before its frames stop being read
    pub reply_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            port: 1337,
            metrics_port: None,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 20,
            idle_timeout_secs: 60,
            audit_interval_secs: 300,
            max_frame_bytes: 64 * 1024,
            reply_queue_capacity: 32,
        }
    }
}

impl RelayConfig {
    /// Load config from a TOML file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: RelayConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(config)
    }

    /// Resolve the full configuration for the process.
    ///
    /// An explicitly given path must exist; the default path is only read if present.
    pub fn resolve(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match explicit_path {
            Some(path) => Self::load(path)?,
            None => {
                let path = relay_config_path();
                if path.exists() {
                    Self::load(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Override fields from `BUSTRACK_*` variables looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BUSTRACK_INTERFACE") {
            self.interface = v;
        }
        if let Some(v) = parse_var(&lookup, "BUSTRACK_PORT")? {
            self.port = v;
        }
        if let Some(v) = parse_var(&lookup, "BUSTRACK_METRICS_PORT")? {
            self.metrics_port = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "BUSTRACK_BROADCAST_CAPACITY")? {
            self.broadcast_capacity = v;
        }
        if let Some(v) = parse_var(&lookup, "BUSTRACK_HEARTBEAT_INTERVAL_SECS")? {
            self.heartbeat_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "BUSTRACK_IDLE_TIMEOUT_SECS")? {
            self.idle_timeout_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "BUSTRACK_AUDIT_INTERVAL_SECS")? {
            self.audit_interval_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "BUSTRACK_MAX_FRAME_BYTES")? {
            self.max_frame_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, "BUSTRACK_REPLY_QUEUE_CAPACITY")? {
            self.reply_queue_capacity = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.broadcast_capacity == 0 {
            bail!("broadcast_capacity must be greater than zero");
        }
        if self.max_frame_bytes == 0 {
            bail!("max_frame_bytes must be greater than zero");
        }
        if self.reply_queue_capacity == 0 {
            bail!("reply_queue_capacity must be greater than zero");
        }
        if self.heartbeat_interval_secs == 0 {
            bail!("heartbeat_interval_secs must be greater than zero");
        }
        if self.idle_timeout_secs <= self.heartbeat_interval_secs {
            bail!(
                "idle_timeout_secs ({}) must be larger than heartbeat_interval_secs ({})",
                self.idle_timeout_secs,
                self.heartbeat_interval_secs
            );
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn audit_interval(&self) -> Option<Duration> {
        (self.audit_interval_secs > 0).then(|| Duration::from_secs(self.audit_interval_secs))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config to TOML")
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value {:?} for {}: {}", raw, name, e)),
        None => Ok(None),
    }
}

/// Resolve the relay config file path.
///
/// Priority:
/// 1. `BUSTRACK_CONFIG` env var
/// 2. `/etc/bustrack/relay.toml` (production/staging)
/// 3. `./relay.toml` (development)
pub fn relay_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("BUSTRACK_CONFIG") {
        return PathBuf::from(path);
    }

    match std::env::var("BUSTRACK_ENV").as_deref() {
        Ok("production") | Ok("staging") => PathBuf::from("/etc/bustrack/relay.toml"),
        _ => PathBuf::from("./relay.toml"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audit_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "port = 8080\nbroadcast_capacity = 32\n").unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.broadcast_capacity, 32);
        assert_eq!(config.interface, "0.0.0.0");
        assert_eq!(config.idle_timeout_secs, 60);
    }

    #[test]
    fn test_load_reports_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(RelayConfig::load(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RelayConfig::default();
        config
            .apply_env(lookup_from(&[
                ("BUSTRACK_PORT", "9000"),
                ("BUSTRACK_METRICS_PORT", "9091"),
                ("BUSTRACK_IDLE_TIMEOUT_SECS", " 120 "),
            ]))
            .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.metrics_port, Some(9091));
        assert_eq!(config.idle_timeout_secs, 120);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = RelayConfig::default();
        let err = config
            .apply_env(lookup_from(&[("BUSTRACK_PORT", "seventy")]))
            .unwrap_err();
        assert!(err.to_string().contains("BUSTRACK_PORT"));
    }

    #[test]
    fn test_validate_rejects_short_idle_timeout() {
        let config = RelayConfig {
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 30,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            broadcast_capacity: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            reply_queue_capacity: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = RelayConfig {
            metrics_port: Some(9092),
            ..RelayConfig::default()
        };
        let parsed: RelayConfig = toml::from_str(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    #[serial]
    fn test_resolve_reads_process_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "port = 7000\n").unwrap();

        // SAFETY: serialized with every other test that touches the environment
        unsafe {
            std::env::set_var("BUSTRACK_INTERFACE", "127.0.0.1");
        }
        let config = RelayConfig::resolve(Some(&path));
        unsafe {
            std::env::remove_var("BUSTRACK_INTERFACE");
        }

        let config = config.unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.interface, "127.0.0.1");
    }

    #[test]
    #[serial]
    fn test_config_path_prefers_env() {
        unsafe {
            std::env::set_var("BUSTRACK_CONFIG", "/tmp/custom-relay.toml");
        }
        let path = relay_config_path();
        unsafe {
            std::env::remove_var("BUSTRACK_CONFIG");
        }
        assert_eq!(path, PathBuf::from("/tmp/custom-relay.toml"));
    }
}
