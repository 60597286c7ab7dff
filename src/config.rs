//! Configuration loading and persistence.
//!
//! Settings live in `config.json` under the platform config directory. The
//! relay auth token is never written to disk; it comes from
//! `TALLY_BRIDGE_TOKEN`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::constants::{DEFAULT_RELAY_URL, VMIX_HTTP_PORT, VMIX_TCP_PORT};

const CONFIG_FILE: &str = "config.json";

/// Bridge configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// vMix host.
    pub vmix_host: String,
    /// vMix TCP API port.
    pub vmix_port: u16,
    /// vMix HTTP web API port (backup query).
    pub vmix_http_port: u16,
    /// Relay WebSocket URL.
    pub relay_url: String,
    /// Relay session id.
    pub session_id: String,
    /// Keep retrying until both ends are reachable instead of failing fast.
    pub auto_connect: bool,
    /// Relay auth token - NOT serialized to disk.
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vmix_host: "127.0.0.1".to_string(),
            vmix_port: VMIX_TCP_PORT,
            vmix_http_port: VMIX_HTTP_PORT,
            relay_url: DEFAULT_RELAY_URL.to_string(),
            session_id: String::new(),
            auto_connect: false,
            token: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory, creating it if necessary.
    ///
    /// Priority:
    /// 1. `TALLY_BRIDGE_CONFIG_DIR`
    /// 2. `TALLY_BRIDGE_ENV=test`: the repo's `tmp/tally-bridge-test`
    /// 3. Platform config dir (e.g. `~/.config/tally-bridge`)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("TALLY_BRIDGE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if crate::env::is_test_mode() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/tally-bridge-test")
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("tally-bridge")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Load from the config dir, then apply environment overrides.
    ///
    /// A missing file yields defaults; an unreadable or invalid one is an
    /// error.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load `config.json` from `dir` without environment overrides.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("invalid config in {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("TALLY_BRIDGE_VMIX_HOST") {
            self.vmix_host = host;
        }

        if let Some(port) = var("TALLY_BRIDGE_VMIX_PORT") {
            match port.parse() {
                Ok(port) => self.vmix_port = port,
                Err(_) => log::warn!("Ignoring invalid TALLY_BRIDGE_VMIX_PORT={}", port),
            }
        }

        if let Some(port) = var("TALLY_BRIDGE_VMIX_HTTP_PORT") {
            match port.parse() {
                Ok(port) => self.vmix_http_port = port,
                Err(_) => log::warn!("Ignoring invalid TALLY_BRIDGE_VMIX_HTTP_PORT={}", port),
            }
        }

        if let Some(url) = var("TALLY_BRIDGE_RELAY_URL") {
            self.relay_url = url;
        }

        if let Some(session_id) = var("TALLY_BRIDGE_SESSION_ID") {
            self.session_id = session_id;
        }

        // Token from env var only; never persisted
        if let Some(token) = var("TALLY_BRIDGE_TOKEN").filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }
    }

    /// Persist to the config dir. The token is not saved.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persist to `dir/config.json` with owner-only permissions.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Whether a relay session id is configured.
    pub fn has_session(&self) -> bool {
        !self.session_id.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.vmix_host, "127.0.0.1");
        assert_eq!(config.vmix_port, 8099);
        assert_eq!(config.vmix_http_port, 8088);
        assert_eq!(config.relay_url, "wss://returnfeed.net/ws/");
        assert!(!config.auto_connect);
        assert!(!config.has_session());
    }

    #[test]
    fn test_serialization_excludes_token() {
        let config = Config {
            token: Some("secret_token".to_string()),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).expect("serializes");
        assert!(!json.contains("secret_token"));
        assert!(!json.contains("token"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            vmix_host: "10.0.0.5".to_string(),
            session_id: "studio-a".to_string(),
            auto_connect: true,
            token: Some("t".to_string()),
            ..Config::default()
        };
        config.save_to(dir.path()).expect("saves");

        let loaded = Config::load_from(dir.path()).expect("loads");
        assert_eq!(loaded.vmix_host, "10.0.0.5");
        assert_eq!(loaded.session_id, "studio-a");
        assert!(loaded.auto_connect);
        assert_eq!(loaded.token, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        Config::default().save_to(dir.path()).expect("saves");
        let mode = fs::metadata(dir.path().join(CONFIG_FILE))
            .expect("exists")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(Config::load_from(dir.path()).expect("loads"), Config::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(CONFIG_FILE), r#"{"vmix_host":"mixer.local"}"#).expect("writes");
        let loaded = Config::load_from(dir.path()).expect("loads");
        assert_eq!(loaded.vmix_host, "mixer.local");
        assert_eq!(loaded.vmix_port, 8099);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(CONFIG_FILE), "{ nope").expect("writes");
        assert!(Config::load_from(dir.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TALLY_BRIDGE_VMIX_HOST", "192.168.1.50"),
            ("TALLY_BRIDGE_VMIX_PORT", "9099"),
            ("TALLY_BRIDGE_VMIX_HTTP_PORT", "not-a-port"),
            ("TALLY_BRIDGE_RELAY_URL", "ws://localhost:8765"),
            ("TALLY_BRIDGE_SESSION_ID", "abc"),
            ("TALLY_BRIDGE_TOKEN", "tok"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.vmix_host, "192.168.1.50");
        assert_eq!(config.vmix_port, 9099);
        assert_eq!(config.vmix_http_port, 8088);
        assert_eq!(config.relay_url, "ws://localhost:8765");
        assert!(config.has_session());
        assert_eq!(config.token.as_deref(), Some("tok"));
    }
}
