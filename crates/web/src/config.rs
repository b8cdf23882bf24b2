//! Server configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use vncdesk_common::{Error, DEFAULT_VNC_PORT};

use crate::prober::ProberConfig;
use crate::vnc_proxy::ProxyConfig;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub listen: SocketAddr,

    /// SQLite state database
    pub db_path: PathBuf,

    /// Base URL machines use to call back after installation
    pub public_url: String,

    /// If set, management routes require `Authorization: Bearer <token>`
    pub api_token: Option<String>,

    /// Endpoint defaults
    pub vnc: VncConfig,

    /// Liveness probing
    pub probe: ProbeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8001)),
            db_path: vncdesk_common::default_db_path(),
            public_url: "http://localhost:8001".to_string(),
            api_token: None,
            vnc: VncConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

/// Defaults applied to new endpoints and sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VncConfig {
    /// Port the VNC server listens on
    pub port: u16,

    /// Shared static VNC password written into installers
    pub secret: String,

    /// Dial timeout for session targets, seconds
    pub dial_timeout_secs: u64,
}

impl Default for VncConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_VNC_PORT,
            secret: "vnc123pass".to_string(),
            dial_timeout_secs: 5,
        }
    }
}

/// Liveness probe timing, seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub error_backoff_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 3,
            error_backoff_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> vncdesk_common::Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));
        if self.probe.interval_secs == 0 {
            return invalid("probe.interval_secs must be greater than zero");
        }
        if self.probe.timeout_secs == 0 || self.vnc.dial_timeout_secs == 0 {
            return invalid("probe and dial timeouts must be greater than zero");
        }
        if self.vnc.port == 0 {
            return invalid("vnc.port must be greater than zero");
        }
        if !self.public_url.starts_with("http://") && !self.public_url.starts_with("https://") {
            return invalid("public_url must be an http(s) URL");
        }
        Ok(())
    }

    pub fn prober(&self) -> ProberConfig {
        ProberConfig {
            interval: Duration::from_secs(self.probe.interval_secs),
            probe_timeout: Duration::from_secs(self.probe.timeout_secs),
            error_backoff: Duration::from_secs(self.probe.error_backoff_secs),
        }
    }

    pub fn proxy(&self) -> ProxyConfig {
        ProxyConfig {
            dial_timeout: Duration::from_secs(self.vnc.dial_timeout_secs),
            ..ProxyConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.vnc.port, 5900);
        assert_eq!(config.prober().interval, Duration::from_secs(30));
        assert_eq!(config.prober().error_backoff, Duration::from_secs(60));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("vncdesk.toml");
        let mut config = ServerConfig::default();
        config.api_token = Some("t0k".to_string());
        config.probe.interval_secs = 10;
        config.save(&path).unwrap();

        let loaded = ServerConfig::load(&path).unwrap();
        assert_eq!(loaded.api_token.as_deref(), Some("t0k"));
        assert_eq!(loaded.probe.interval_secs, 10);
        assert_eq!(loaded.listen, config.listen);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vncdesk.toml");
        std::fs::write(&path, "public_url = \"http://10.0.0.2:8001\"\n[probe]\ntimeout_secs = 1\n")
            .unwrap();
        let loaded = ServerConfig::load(&path).unwrap();
        assert_eq!(loaded.public_url, "http://10.0.0.2:8001");
        assert_eq!(loaded.probe.timeout_secs, 1);
        assert_eq!(loaded.probe.interval_secs, 30);
        assert_eq!(loaded.vnc.secret, "vnc123pass");
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vncdesk.toml");
        std::fs::write(&path, "[probe]\ninterval_secs = 0\n").unwrap();
        assert!(ServerConfig::load(&path).is_err());
    }

    #[test]
    fn test_public_url_must_be_http() {
        let config = ServerConfig {
            public_url: "mgmt.local:8001".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
