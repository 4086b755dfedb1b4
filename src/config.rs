//! Configuration loading.
//!
//! YAML file with a fallback chain, then environment overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FundlinkError, Result};
use crate::messaging::transport::Endpoint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub backend: BackendConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    pub req_port: u16,
    pub pub_port: u16,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            req_port: 5555,
            pub_port: 5556,
            request_timeout_ms: 30000,
            connect_timeout_ms: 5000,
        }
    }
}

impl BackendConfig {
    /// Request endpoint as `tcp://host:port`.
    pub fn req_endpoint(&self) -> String {
        endpoint(&self.host, self.req_port)
    }

    /// Publish endpoint as `tcp://host:port`.
    pub fn pub_endpoint(&self) -> String {
        endpoint(&self.host, self.pub_port)
    }
}

fn endpoint(host: &str, port: u16) -> String {
    Endpoint::new(host, port).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Identity used before login; `None` means anonymous.
    pub user_id: Option<String>,
    /// Topic prefixes to subscribe at connect. Empty means everything.
    pub topics: Vec<String>,
    pub notification_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: None,
            topics: Vec::new(),
            notification_capacity: 256,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            backend: BackendConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

const PROJECT_NAME: &str = "fundlink";

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, it must load
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(PROJECT_NAME).join(format!("{}.yml", PROJECT_NAME));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", PROJECT_NAME));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply `FUNDLINK_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `FUNDLINK_*` overrides from a lookup function.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("FUNDLINK_HOST") {
            self.backend.host = host;
        }
        if let Some(port) = lookup("FUNDLINK_REQ_PORT") {
            self.backend.req_port = parse_var("FUNDLINK_REQ_PORT", &port)?;
        }
        if let Some(port) = lookup("FUNDLINK_PUB_PORT") {
            self.backend.pub_port = parse_var("FUNDLINK_PUB_PORT", &port)?;
        }
        if let Some(ms) = lookup("FUNDLINK_REQUEST_TIMEOUT_MS") {
            self.backend.request_timeout_ms = parse_var("FUNDLINK_REQUEST_TIMEOUT_MS", &ms)?;
        }
        if let Some(user) = lookup("FUNDLINK_USER") {
            self.session.user_id = Some(user);
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FundlinkError::Config(format!("{} has invalid value '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log_level.as_deref(), Some("info"));
        assert_eq!(config.backend.req_endpoint(), "tcp://localhost:5555");
        assert_eq!(config.backend.pub_endpoint(), "tcp://localhost:5556");
        assert_eq!(config.backend.request_timeout_ms, 30000);
        assert_eq!(config.backend.connect_timeout_ms, 5000);
        assert_eq!(config.session.notification_capacity, 256);
        assert!(config.session.user_id.is_none());
    }

    #[test]
    fn test_ipv6_endpoint() {
        let backend = BackendConfig {
            host: "::1".into(),
            ..BackendConfig::default()
        };
        assert_eq!(backend.req_endpoint(), "tcp://[::1]:5555");
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fundlink.yml");
        fs::write(
            &path,
            "backend:\n  host: backend.local\n  req_port: 6000\nsession:\n  topics: [progress]\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.backend.host, "backend.local");
        assert_eq!(config.backend.req_port, 6000);
        assert_eq!(config.backend.pub_port, 5556);
        assert_eq!(config.session.topics, vec!["progress".to_string()]);
    }

    #[test]
    fn test_load_explicit_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.yml");
        assert!(matches!(Config::load(Some(&path)), Err(FundlinkError::Io(_))));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yml");
        fs::write(&path, "backend: [not, a, map").unwrap();
        assert!(matches!(Config::load(Some(&path)), Err(FundlinkError::Yaml(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_from(env(&[
                ("FUNDLINK_HOST", "10.0.0.5"),
                ("FUNDLINK_REQ_PORT", "7000"),
                ("FUNDLINK_PUB_PORT", "7001"),
                ("FUNDLINK_REQUEST_TIMEOUT_MS", "1500"),
                ("FUNDLINK_USER", "analyst"),
            ]))
            .unwrap();
        assert_eq!(config.backend.req_endpoint(), "tcp://10.0.0.5:7000");
        assert_eq!(config.backend.pub_port, 7001);
        assert_eq!(config.backend.request_timeout_ms, 1500);
        assert_eq!(config.session.user_id.as_deref(), Some("analyst"));
    }

    #[test]
    fn test_env_invalid_port() {
        let mut config = Config::default();
        let err = config.apply_env_from(env(&[("FUNDLINK_REQ_PORT", "nope")])).unwrap_err();
        assert!(matches!(err, FundlinkError::Config(ref m) if m.contains("FUNDLINK_REQ_PORT")));
        assert_eq!(config.backend.req_port, 5555);
    }

    #[test]
    fn test_env_empty_leaves_config() {
        let mut config = Config::default();
        config.apply_env_from(|_| None).unwrap();
        assert_eq!(config, Config::default());
    }
}
