//! Server configuration.
//!
//! Loaded from an optional TOML file, then overridden by `COURIER_*`
//! environment variables for the deployment-sensitive fields. Every field
//! has a default so a bare `courier-server` starts a working instance.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Socket address the HTTP/WebSocket listener binds to.
    pub listen_addr: String,

    /// SQLite connection string.
    pub database_url: String,

    /// Directory for uploaded media files, created on startup if missing.
    pub upload_dir: PathBuf,

    /// Upload size cap in bytes.
    pub max_upload_bytes: u64,

    /// Bound of each connection's outbound event queue. A client that lets
    /// this many events pile up is considered stalled and disconnected.
    pub outbound_queue_depth: usize,

    /// How long a typing indicator lives without being refreshed.
    pub typing_ttl_ms: u64,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5000".into(),
            database_url: "sqlite://courier.db?mode=rwc".into(),
            upload_dir: PathBuf::from("./uploads"),
            max_upload_bytes: 50_000_000,
            outbound_queue_depth: 64,
            typing_ttl_ms: 1_000,
        }
    }
}

impl CourierConfig {
    /// Loads configuration. Missing file path means defaults; a named file
    /// that does not exist is an error (a typo'd `--config` should not
    /// silently start with defaults).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                let config: CourierConfig = toml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?;
                tracing::info!(path = %path.display(), "loaded configuration");
                config
            }
            None => CourierConfig::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides for the fields that vary per deployment.
    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("COURIER_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("COURIER_DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(dir) = std::env::var("COURIER_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_usable() {
        let config = CourierConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:5000");
        assert_eq!(config.database_url, "sqlite://courier.db?mode=rwc");
        assert_eq!(config.max_upload_bytes, 50_000_000);
        assert_eq!(config.outbound_queue_depth, 64);
        assert_eq!(config.typing_ttl(), Duration::from_millis(1_000));
    }

    #[test]
    fn file_overrides_defaults_field_by_field() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listen_addr = \"127.0.0.1:9000\"\ntyping_ttl_ms = 250"
        )
        .unwrap();

        let config = CourierConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.typing_ttl_ms, 250);
        // Untouched fields keep their defaults.
        assert_eq!(config.outbound_queue_depth, 64);
    }

    #[test]
    fn missing_named_file_is_an_error() {
        assert!(CourierConfig::load(Some(Path::new("/nonexistent/courier.toml"))).is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = CourierConfig::default();
        let raw = toml::to_string_pretty(&config).unwrap();
        let parsed: CourierConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.listen_addr, config.listen_addr);
        assert_eq!(parsed.upload_dir, config.upload_dir);
    }
}
