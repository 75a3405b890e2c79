//! Configuration loading (§A.3): `AppConfig` from a TOML file at
//! `SANDBOX_CONFIG_PATH`, falling back to built-in defaults when unset.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

/// Root configuration structure for the orchestration engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Kubernetes,
}

impl Default for RuntimeKind {
    fn default() -> Self {
        RuntimeKind::Docker
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "type", default)]
    pub kind: RuntimeKind,
    #[serde(default = "default_execd_image")]
    pub execd_image: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::default(),
            execd_image: default_execd_image(),
        }
    }
}

fn default_execd_image() -> String {
    "opensandbox/execd:latest".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    #[serde(default = "default_true")]
    pub no_new_privileges: bool,
    pub apparmor_profile: Option<String>,
    pub seccomp_profile: Option<String>,
    #[serde(default)]
    pub drop_capabilities: Vec<String>,
    pub pids_limit: Option<i64>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network_mode: default_network_mode(),
            no_new_privileges: true,
            apparmor_profile: None,
            seccomp_profile: None,
            drop_capabilities: Vec::new(),
            pids_limit: None,
        }
    }
}

fn default_network_mode() -> String {
    "bridge".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub kubeconfig: Option<String>,
    pub context: Option<String>,
    pub service_account: Option<String>,
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    /// Optional path to a user-supplied BatchSandbox template (YAML or
    /// JSON), deep-merged under the runtime-generated manifest (§4.7).
    pub template_path: Option<String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse TOML configuration")
    }

    /// Load from `SANDBOX_CONFIG_PATH` if set, else built-in defaults (§6).
    pub fn load() -> Result<Self> {
        match std::env::var("SANDBOX_CONFIG_PATH") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }
}

/// `DOCKER_API_TIMEOUT`, seconds. Invalid or non-positive values fall back
/// to the default with a logged warning rather than failing startup (§B.2).
pub const DEFAULT_DOCKER_API_TIMEOUT_SECONDS: u64 = 180;

pub fn docker_api_timeout_seconds() -> u64 {
    match std::env::var("DOCKER_API_TIMEOUT") {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(v) if v > 0 => v,
            _ => {
                warn!(value = %raw, "invalid DOCKER_API_TIMEOUT, falling back to default");
                DEFAULT_DOCKER_API_TIMEOUT_SECONDS
            }
        },
        Err(_) => DEFAULT_DOCKER_API_TIMEOUT_SECONDS,
    }
}

/// `PENDING_FAILURE_TTL`, seconds. Same graceful-fallback behavior as
/// `DOCKER_API_TIMEOUT`.
pub fn pending_failure_ttl_seconds() -> u64 {
    match std::env::var("PENDING_FAILURE_TTL") {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(v) if v > 0 => v,
            _ => {
                warn!(value = %raw, "invalid PENDING_FAILURE_TTL, falling back to default");
                crate::pending::DEFAULT_PENDING_FAILURE_TTL_SECONDS
            }
        },
        Err(_) => crate::pending::DEFAULT_PENDING_FAILURE_TTL_SECONDS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = AppConfig::from_str("").unwrap();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.runtime.kind, RuntimeKind::Docker);
        assert_eq!(config.docker.network_mode, "bridge");
        assert_eq!(config.kubernetes.namespace, "default");
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            log_level = "debug"

            [runtime]
            type = "kubernetes"
            execd_image = "registry.example.com/execd:v2"

            [docker]
            network_mode = "host"
            no_new_privileges = false
            drop_capabilities = ["NET_RAW"]
            pids_limit = 256

            [kubernetes]
            namespace = "sandboxes"
            context = "prod"
            template_path = "/etc/opensandbox/template.yaml"

            [kubernetes.node_selector]
            pool = "untrusted"
        "#;
        let config = AppConfig::from_str(toml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.runtime.kind, RuntimeKind::Kubernetes);
        assert_eq!(config.runtime.execd_image, "registry.example.com/execd:v2");
        assert_eq!(config.docker.network_mode, "host");
        assert!(!config.docker.no_new_privileges);
        assert_eq!(config.docker.drop_capabilities, vec!["NET_RAW".to_string()]);
        assert_eq!(config.docker.pids_limit, Some(256));
        assert_eq!(config.kubernetes.namespace, "sandboxes");
        assert_eq!(config.kubernetes.context.as_deref(), Some("prod"));
        assert_eq!(config.kubernetes.node_selector.get("pool"), Some(&"untrusted".to_string()));
    }

    #[test]
    fn docker_api_timeout_falls_back_on_invalid_value() {
        std::env::set_var("DOCKER_API_TIMEOUT", "not-a-number");
        assert_eq!(docker_api_timeout_seconds(), DEFAULT_DOCKER_API_TIMEOUT_SECONDS);
        std::env::set_var("DOCKER_API_TIMEOUT", "-5");
        assert_eq!(docker_api_timeout_seconds(), DEFAULT_DOCKER_API_TIMEOUT_SECONDS);
        std::env::remove_var("DOCKER_API_TIMEOUT");
    }

    #[test]
    fn docker_api_timeout_accepts_valid_value() {
        std::env::set_var("DOCKER_API_TIMEOUT", "30");
        assert_eq!(docker_api_timeout_seconds(), 30);
        std::env::remove_var("DOCKER_API_TIMEOUT");
    }
}
