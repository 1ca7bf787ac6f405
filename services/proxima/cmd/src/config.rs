//! Configuration handling for the proxima service.
//!
//! The YAML file carries the desired-state declaration and the configuration
//! bundle. Environment variables override the file, command line flags
//! override both (applied in `main`).

use anyhow::{Context, Result};
use proxima_control::ConfigBundle;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Environment variable overriding the desired state
pub const STATE_ENV: &str = "PROXIMA_STATE";

/// Environment variable overriding the reconcile interval
pub const RECONCILE_INTERVAL_ENV: &str = "PROXIMA_RECONCILE_INTERVAL_MS";

/// Proxima service configuration (matches the YAML structure)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProximaConfig {
    /// Desired-state declaration, e.g. `"ws_server, tcp_client"`
    #[serde(default)]
    pub state: String,
    /// Reconcile interval and per-protocol configurations
    #[serde(flatten)]
    pub bundle: ConfigBundle,
}

impl ProximaConfig {
    /// Read and parse the file, failing on any error
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("cannot parse config file {}", path.display()))
    }

    /// Load the file, falling back to defaults when it is missing or broken,
    /// then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let mut config = match Self::read(path) {
            Ok(config) => {
                info!("Loaded configuration from {}", path.display());
                config
            }
            Err(e) => {
                warn!("{:#}, using defaults", e);
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides looked up by variable name
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(state) = lookup(STATE_ENV) {
            info!("State overridden by environment: {}", state);
            self.state = state;
        }

        if let Some(raw) = lookup(RECONCILE_INTERVAL_ENV) {
            match raw.parse::<u64>() {
                Ok(ms) => {
                    info!("Reconcile interval overridden by environment: {}ms", ms);
                    self.bundle.reconcile_interval_ms = ms;
                }
                Err(e) => warn!("Ignoring {}={}: {}", RECONCILE_INTERVAL_ENV, raw, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxima_control::{ProtocolConfig, ProtocolId, DEFAULT_RECONCILE_INTERVAL_MS};
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(yaml: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = ProximaConfig::default();
        assert!(config.state.is_empty());
        assert_eq!(
            config.bundle.reconcile_interval_ms,
            DEFAULT_RECONCILE_INTERVAL_MS
        );
    }

    #[test]
    fn test_read_file() {
        let file = write_config(
            r#"
state: "ws_server, tcp_client"
reconcile_interval_ms: 2000
protocols:
  ws_server:
    port: 8081
  tcp_client:
    host: 127.0.0.1
    port: 9000
    reconnect_interval_ms: 1000
"#,
        );

        let config = ProximaConfig::read(file.path()).unwrap();
        assert_eq!(config.state, "ws_server, tcp_client");
        assert_eq!(config.bundle.reconcile_interval_ms, 2000);
        match config.bundle.get(ProtocolId::TcpClient) {
            Some(ProtocolConfig::TcpClient(c)) => {
                assert_eq!(c.port, 9000);
                assert_eq!(c.reconnect_interval_ms, 1000);
            }
            other => panic!("unexpected config: {other:?}"),
        }
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let file = write_config("state: [unclosed");
        assert!(ProximaConfig::read(file.path()).is_err());

        let config = ProximaConfig::load(file.path());
        assert_eq!(config.bundle, ConfigBundle::default());
    }

    #[test]
    fn test_missing_file_is_an_error_for_read() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProximaConfig::read(dir.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("cannot read config file"));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (STATE_ENV, "udp_client"),
            (RECONCILE_INTERVAL_ENV, "500"),
        ]);
        let mut config = ProximaConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.state, "udp_client");
        assert_eq!(config.bundle.reconcile_interval_ms, 500);

        let mut config = ProximaConfig::default();
        config.apply_overrides(|key| {
            (key == RECONCILE_INTERVAL_ENV).then(|| "soon".to_string())
        });
        assert_eq!(
            config.bundle.reconcile_interval_ms,
            DEFAULT_RECONCILE_INTERVAL_MS
        );
    }
}
