//! Sandbox orchestration engine daemon entrypoint.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use opensandbox_engine::config::{self, AppConfig, RuntimeKind};
use opensandbox_engine::http_api::{self, AppState};
use opensandbox_engine::provider::docker::{DockerProvider, DockerProviderConfig};
#[cfg(feature = "kubernetes")]
use opensandbox_engine::provider::kubernetes::{KubernetesProvider, KubernetesProviderConfig};
use opensandbox_engine::service::SandboxService;

#[derive(Parser)]
#[command(name = "opensandbox-engine")]
#[command(about = "Provisions, tracks, and reclaims short-lived isolated sandbox execution environments")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file; falls back to SANDBOX_CONFIG_PATH, then
    /// built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let app_config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::load()?,
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(app_config.server.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .context("invalid [server] host/port")?;
    let pending_ttl = std::time::Duration::from_secs(config::pending_failure_ttl_seconds());
    let api_key = std::env::var("OPEN_SANDBOX_API_KEY").ok();

    match app_config.runtime.kind {
        RuntimeKind::Docker => {
            let docker_config = DockerProviderConfig {
                network_mode: app_config.docker.network_mode.parse()?,
                no_new_privileges: app_config.docker.no_new_privileges,
                apparmor_profile: app_config.docker.apparmor_profile.clone(),
                seccomp_profile: app_config.docker.seccomp_profile.clone(),
                drop_capabilities: app_config.docker.drop_capabilities.clone(),
                pids_limit: app_config.docker.pids_limit,
                execd_image: app_config.runtime.execd_image.clone(),
                public_host: app_config.server.host.clone(),
            };
            let provider = Arc::new(DockerProvider::connect(
                docker_config,
                config::docker_api_timeout_seconds(),
            )?);
            let service = SandboxService::new(
                provider,
                "default".to_string(),
                app_config.runtime.execd_image.clone(),
                pending_ttl,
            );
            service.bootstrap().await?;
            let state = Arc::new(AppState { service, api_key });
            http_api::run_server(addr, state).await
        }
        #[cfg(feature = "kubernetes")]
        RuntimeKind::Kubernetes => {
            let k8s_config = KubernetesProviderConfig {
                namespace: app_config.kubernetes.namespace.clone(),
                user_template: load_user_template(app_config.kubernetes.template_path.as_deref())?,
                ..Default::default()
            };
            let provider = Arc::new(KubernetesProvider::connect(k8s_config).await?);
            let service = SandboxService::new(
                provider,
                app_config.kubernetes.namespace.clone(),
                app_config.runtime.execd_image.clone(),
                pending_ttl,
            );
            service.bootstrap().await?;
            let state = Arc::new(AppState { service, api_key });
            http_api::run_server(addr, state).await
        }
        #[cfg(not(feature = "kubernetes"))]
        RuntimeKind::Kubernetes => {
            anyhow::bail!("kubernetes runtime support was not compiled in (enable the \"kubernetes\" feature)")
        }
    }
}

#[cfg(feature = "kubernetes")]
fn load_user_template(path: Option<&str>) -> anyhow::Result<Option<serde_json::Value>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read BatchSandbox template: {path}"))?;
    let value: serde_json::Value = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse BatchSandbox template: {path}"))?;
    Ok(Some(value))
}
