//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use ace_proxy_core::{EngineDescriptor, ProxyConfig};
use serde::Deserialize;

/// One statically configured AceStream engine instance.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Stable identifier for logs, metrics, and engine-exclusion on reselect.
    pub id: String,
    /// Base URL of the engine's HTTP API, e.g. `http://127.0.0.1:6878`.
    pub base_url: String,
    /// Whether this engine is port-forwarded; preferred over non-forwarded
    /// engines by the selection policy.
    #[serde(default)]
    pub forwarded: bool,
    /// Free-form operator tags, carried through but not interpreted by the
    /// core.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl From<&EngineConfig> for EngineDescriptor {
    fn from(cfg: &EngineConfig) -> Self {
        let mut descriptor = EngineDescriptor::new(cfg.id.clone(), cfg.base_url.clone());
        if cfg.forwarded {
            descriptor = descriptor.forwarded();
        }
        descriptor.with_tags(cfg.tags.clone())
    }
}

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    /// Override: `ACE_PROXY_BIND_HOST`
    pub bind_host: IpAddr,

    /// Port the HTTP server binds to.
    /// Override: `ACE_PROXY_BIND_PORT`
    pub bind_port: u16,

    /// Statically configured AceStream engines.
    pub engines: Vec<EngineConfig>,

    /// Proxy tunables (§4.1): admission thresholds, buffer sizing, timeouts.
    /// Nested under `proxy:` in the YAML file rather than flattened, so a
    /// config file reads as "server settings, then proxy settings" instead
    /// of one undifferentiated field list.
    pub proxy: ProxyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::from([0, 0, 0, 0]),
            bind_port: 8080,
            engines: Vec::new(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides. Falls back to defaults (no engines configured) if no path
    /// is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `ACE_PROXY_<FIELD>` environment variable overrides.
    ///
    /// Only the handful of tunables most likely to differ between a config
    /// file checked into version control and one operator's deployment are
    /// covered; anything else belongs in the YAML file itself.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ACE_PROXY_BIND_HOST") {
            if let Ok(host) = val.parse() {
                self.bind_host = host;
            }
        }
        if let Ok(val) = std::env::var("ACE_PROXY_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }
        if let Ok(val) = std::env::var("ACE_PROXY_MAX_STREAMS_PER_ENGINE") {
            if let Ok(n) = val.parse() {
                self.proxy.max_streams_per_engine = n;
            }
        }
        if let Ok(val) = std::env::var("ACE_PROXY_MAX_CLIENTS_PER_CID") {
            if let Ok(n) = val.parse() {
                self.proxy.max_clients_per_cid = Some(n);
            }
        }
        if let Ok(val) = std::env::var("ACE_PROXY_USER_AGENT") {
            self.proxy.user_agent = val;
        }
    }

    /// Returns the validated proxy tunables, ready for
    /// [`ace_proxy_core::bootstrap_services`].
    pub fn to_core_config(&self) -> ProxyConfig {
        self.proxy.clone()
    }

    /// Converts the configured engine list into the descriptors
    /// [`ace_proxy_core::bootstrap_services`] expects.
    pub fn to_engine_descriptors(&self) -> Vec<EngineDescriptor> {
        self.engines.iter().map(EngineDescriptor::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_engines() {
        let config = ServerConfig::default();
        assert!(config.engines.is_empty());
        assert_eq!(config.bind_port, 8080);
    }

    #[test]
    fn parses_engines_from_yaml() {
        let yaml = r#"
bind_port: 9000
engines:
  - id: engine-a
    base_url: "http://127.0.0.1:6878"
    forwarded: true
  - id: engine-b
    base_url: "http://127.0.0.1:6879"
proxy:
  max_streams_per_engine: 5
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.engines.len(), 2);
        assert!(config.engines[0].forwarded);
        assert_eq!(config.proxy.max_streams_per_engine, 5);

        let descriptors = config.to_engine_descriptors();
        assert_eq!(descriptors[0].id, "engine-a");
        assert!(descriptors[0].forwarded);
    }
}
