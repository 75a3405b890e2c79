//! Docker provider (C6): implements [`RuntimeProvider`] over a local
//! container daemon via `bollard`.
//!
//! Grounded on the bollard usage pattern in the wonopcode sandbox runtime
//! (`Docker::connect_with_local_defaults`, `create_image`/`inspect_image`,
//! `list_containers` with label filters, low-level `Config`/`HostConfig`)
//! and on the exact lifecycle semantics of the service this engine replaces
//! (execd archive caching, bootstrap script injection, bridge-mode port
//! allocation, label-based queries).

use super::{timed, CreateWorkloadParams, RuntimeProvider, Workload, WorkloadHandle};
use crate::error::SandboxError;
use crate::labels::{
    self, EXECD_PORT, HTTP_PORT, SANDBOX_EMBEDDING_PROXY_PORT_LABEL, SANDBOX_EXPIRES_AT_LABEL,
    SANDBOX_HTTP_PORT_LABEL, SANDBOX_ID_LABEL,
};
use crate::model::{ImageRef, SandboxState, SandboxStatus};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, RemoveContainerOptions, UploadToContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::StreamExt;
use http_body_util::Full;
use hyper::client::conn::http1 as client_http1;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

const OPENSANDBOX_DIR: &str = "/opt/opensandbox";
const EXECD_INSTALL_PATH: &str = "/opt/opensandbox/execd";
const BOOTSTRAP_PATH: &str = "/opt/opensandbox/bootstrap.sh";
const BRIDGE_PORT_RANGE: std::ops::RangeInclusive<u16> = 40000..=60000;
const BRIDGE_PORT_ALLOC_ATTEMPTS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerNetworkMode {
    Host,
    Bridge,
}

impl std::str::FromStr for DockerNetworkMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(DockerNetworkMode::Host),
            "bridge" => Ok(DockerNetworkMode::Bridge),
            other => Err(SandboxError::InvalidParameter(format!(
                "unsupported docker network mode '{other}', expected 'host' or 'bridge'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerProviderConfig {
    pub network_mode: DockerNetworkMode,
    pub no_new_privileges: bool,
    pub apparmor_profile: Option<String>,
    pub seccomp_profile: Option<String>,
    pub drop_capabilities: Vec<String>,
    pub pids_limit: Option<i64>,
    pub execd_image: String,
    pub public_host: String,
}

pub struct DockerWorkload {
    pub id: String,
    pub container_id: String,
    pub state: String,
    pub status_text: String,
    pub exit_code: i64,
    pub labels: HashMap<String, String>,
    pub bridge_ports: HashMap<u16, u16>,
    pub bridge_ip: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for DockerWorkload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerWorkload")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}

impl Workload for DockerWorkload {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct DockerProvider {
    docker: Docker,
    config: DockerProviderConfig,
    execd_cache: Mutex<Option<Arc<Vec<u8>>>>,
}

impl DockerProvider {
    /// Connect using `DOCKER_HOST`/`DOCKER_TLS_CERTDIR` from the
    /// environment, matching the collaborator contract of §6.
    pub fn connect(config: DockerProviderConfig, api_timeout_secs: u64) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::DockerInitializationError(e.to_string()))?
            .with_timeout(std::time::Duration::from_secs(api_timeout_secs));
        Ok(Self {
            docker,
            config,
            execd_cache: Mutex::new(None),
        })
    }

    #[instrument(skip(self), fields(sandbox = %sandbox_id, action = "ensure_image_available"))]
    async fn ensure_image_available(&self, sandbox_id: &str, image: &ImageRef) -> Result<(), SandboxError> {
        let inspect = timed(sandbox_id, "inspect_image", async {
            self.docker
                .inspect_image(&image.uri)
                .await
                .map_err(|e| SandboxError::ImagePullFailed(image.uri.clone(), e.to_string()))
        })
        .await;
        if inspect.is_ok() {
            return Ok(());
        }

        let credentials = image.auth.as_ref().map(|a| bollard::auth::DockerCredentials {
            username: Some(a.username.clone()),
            password: Some(a.password.clone()),
            ..Default::default()
        });

        let options = Some(CreateImageOptions {
            from_image: image.uri.clone(),
            ..Default::default()
        });

        timed(sandbox_id, "pull_image", async {
            let mut stream = self.docker.create_image(options, None, credentials);
            while let Some(progress) = stream.next().await {
                progress.map_err(|e| SandboxError::ImagePullFailed(image.uri.clone(), e.to_string()))?;
            }
            Ok(())
        })
        .await
    }

    /// Double-checked locking around a one-time fetch of the `execd`
    /// binary from the configured platform image. Not tied to a single
    /// sandbox, so it logs under the shared op id "shared" rather than a
    /// sandbox id, matching the original's `_docker_operation(sandbox_id=None)`.
    #[instrument(skip(self), fields(action = "fetch_execd_archive"))]
    async fn execd_bytes(&self) -> Result<Arc<Vec<u8>>, SandboxError> {
        if let Some(cached) = self.execd_cache.lock().await.clone() {
            return Ok(cached);
        }

        let mut guard = self.execd_cache.lock().await;
        if let Some(cached) = guard.clone() {
            return Ok(cached);
        }

        let execd_image = ImageRef {
            uri: self.config.execd_image.clone(),
            auth: None,
        };
        self.ensure_image_available("shared", &execd_image).await?;

        let create_options = CreateContainerOptions {
            name: format!("opensandbox-execd-fetch-{}", uuid::Uuid::new_v4()),
            platform: None,
        };
        let container_config = Config {
            image: Some(self.config.execd_image.clone()),
            cmd: Some(vec!["tail".into(), "-f".into(), "/dev/null".into()]),
            ..Default::default()
        };
        let created = timed(
            "shared",
            "create_execd_fetch_container",
            async {
                self.docker
                    .create_container(Some(create_options), container_config)
                    .await
                    .map_err(|e| SandboxError::ExecdDistributionFailed(e.to_string()))
            },
        )
        .await?;

        let fetch_result = self.fetch_execd_from_container(&created.id).await;

        let _ = timed("shared", "remove_execd_fetch_container", async {
            self.docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| SandboxError::ExecdDistributionFailed(e.to_string()))
        })
        .await;

        let bytes = fetch_result?;
        let bytes = Arc::new(bytes);
        *guard = Some(bytes.clone());
        Ok(bytes)
    }

    async fn fetch_execd_from_container(&self, container_id: &str) -> Result<Vec<u8>, SandboxError> {
        timed("shared", "fetch_execd_archive", async {
            let options = bollard::container::DownloadFromContainerOptions { path: "/execd" };
            let mut stream = self.docker.download_from_container(container_id, Some(options));
            let mut archive = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| SandboxError::ExecdDistributionFailed(e.to_string()))?;
                archive.extend_from_slice(&chunk);
            }
            Self::extract_execd_tar(archive)
        })
        .await
    }

    fn extract_execd_tar(archive: Vec<u8>) -> Result<Vec<u8>, SandboxError> {
        let mut tar_archive = tar::Archive::new(std::io::Cursor::new(archive));
        for entry in tar_archive
            .entries()
            .map_err(|e| SandboxError::ExecdDistributionFailed(e.to_string()))?
        {
            let mut entry = entry.map_err(|e| SandboxError::ExecdDistributionFailed(e.to_string()))?;
            let mut bytes = Vec::new();
            std::io::copy(&mut entry, &mut bytes)
                .map_err(|e| SandboxError::ExecdDistributionFailed(e.to_string()))?;
            return Ok(bytes);
        }
        Err(SandboxError::ExecdDistributionFailed(
            "archive for /execd contained no entries".to_string(),
        ))
    }

    fn bootstrap_script() -> String {
        format!("#!/bin/sh\nset -e\n{EXECD_INSTALL_PATH} >/tmp/execd.log 2>&1 &\nexec \"$@\"\n")
    }

    /// Build the tar archive injecting `execd` and the bootstrap script
    /// under `/opt/opensandbox/`, mode 0755, current mtime. A directory
    /// entry precedes both so injection does not depend on the target
    /// image already containing the parent directory.
    fn build_runtime_archive(execd: &[u8]) -> Result<Vec<u8>, SandboxError> {
        let mtime = Utc::now().timestamp() as u64;
        let mut builder = tar::Builder::new(Vec::new());

        let mut dir_header = tar::Header::new_gnu();
        dir_header.set_path(&OPENSANDBOX_DIR[1..]).map_err(io_err)?;
        dir_header.set_entry_type(tar::EntryType::Directory);
        dir_header.set_mode(0o755);
        dir_header.set_mtime(mtime);
        dir_header.set_size(0);
        dir_header.set_cksum();
        builder
            .append(&dir_header, std::io::empty())
            .map_err(io_err)?;

        append_file(&mut builder, "opt/opensandbox/execd", execd, mtime)?;
        let bootstrap = Self::bootstrap_script();
        append_file(
            &mut builder,
            "opt/opensandbox/bootstrap.sh",
            bootstrap.as_bytes(),
            mtime,
        )?;

        builder.into_inner().map_err(io_err)
    }

    /// Bind-then-release port allocation in [40000, 60000], retried until a
    /// free, distinct pair is found or the attempt budget is exhausted.
    /// Known TOCTOU limitation: the port may be claimed by another process
    /// between release and the daemon's own bind (§9 design notes).
    fn allocate_bridge_ports() -> Result<(u16, u16), SandboxError> {
        let mut ports = Vec::new();
        for _ in 0..2 {
            let port = Self::allocate_one_port()?;
            ports.push(port);
        }
        let mut attempts = 0;
        while ports[0] == ports[1] && attempts < BRIDGE_PORT_ALLOC_ATTEMPTS {
            ports[1] = Self::allocate_one_port()?;
            attempts += 1;
        }
        if ports[0] == ports[1] {
            return Err(SandboxError::ContainerStartFailed(
                "could not allocate two distinct bridge ports".to_string(),
            ));
        }
        Ok((ports[0], ports[1]))
    }

    fn allocate_one_port() -> Result<u16, SandboxError> {
        for _ in 0..BRIDGE_PORT_ALLOC_ATTEMPTS {
            let candidate = {
                use std::collections::hash_map::RandomState;
                use std::hash::{BuildHasher, Hasher};
                let mut hasher = RandomState::new().build_hasher();
                hasher.write_u64(Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64);
                let span = (*BRIDGE_PORT_RANGE.end() - *BRIDGE_PORT_RANGE.start()) as u64;
                *BRIDGE_PORT_RANGE.start() + (hasher.finish() % (span + 1)) as u16
            };
            if TcpListener::bind(("0.0.0.0", candidate)).is_ok() {
                return Ok(candidate);
            }
        }
        Err(SandboxError::ContainerStartFailed(
            "exhausted bridge port allocation attempts".to_string(),
        ))
    }

    /// Relative host paths are resolved against the server's working
    /// directory before being checked; the resolved absolute path is what
    /// gets passed to the daemon as a bind mount source.
    fn resolve_host_path(host_path: &str) -> String {
        let path = std::path::Path::new(host_path);
        if path.is_absolute() {
            return host_path.to_string();
        }
        std::env::current_dir()
            .map(|cwd| cwd.join(path).to_string_lossy().into_owned())
            .unwrap_or_else(|_| host_path.to_string())
    }

    fn ensure_host_path_exists(host_path: &str) -> Result<(), SandboxError> {
        if std::path::Path::new(&Self::resolve_host_path(host_path)).exists() {
            Ok(())
        } else {
            Err(SandboxError::InvalidVolumeMount(host_path.to_string()))
        }
    }

    fn resolve_public_host(&self) -> String {
        let host = self.config.public_host.trim();
        if host.is_empty() || host == "0.0.0.0" || host == "::" {
            "127.0.0.1".to_string()
        } else {
            host.to_string()
        }
    }

    fn container_labels(summary: &bollard::models::ContainerSummary) -> HashMap<String, String> {
        summary.labels.clone().unwrap_or_default()
    }

    fn project_status(state: &str, status_text: &str, exit_code: i64) -> SandboxStatus {
        let now = Utc::now();
        let (state_val, reason) = match state {
            "running" => (SandboxState::Running, "CONTAINER_RUNNING"),
            "paused" => (SandboxState::Paused, "CONTAINER_PAUSED"),
            "restarting" => (SandboxState::Running, "CONTAINER_RESTARTING"),
            "created" | "starting" => (SandboxState::Pending, "CONTAINER_STARTING"),
            "exited" | "dead" if exit_code == 0 => (SandboxState::Terminated, "CONTAINER_EXITED"),
            "exited" | "dead" => (SandboxState::Failed, "CONTAINER_EXITED_NONZERO"),
            _ => (SandboxState::Unknown, "CONTAINER_STATE_UNKNOWN"),
        };
        SandboxStatus {
            state: state_val,
            reason: reason.to_string(),
            message: status_text.to_string(),
            last_transition_at: now,
        }
    }
}

fn io_err(e: std::io::Error) -> SandboxError {
    SandboxError::BootstrapInstallFailed(e.to_string())
}

fn append_file(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    content: &[u8],
    mtime: u64,
) -> Result<(), SandboxError> {
    let mut header = tar::Header::new_gnu();
    header.set_path(path).map_err(io_err)?;
    header.set_size(content.len() as u64);
    header.set_mode(0o755);
    header.set_mtime(mtime);
    header.set_cksum();
    builder.append(&header, content).map_err(io_err)
}

/// Socket path the local daemon is reachable on, honoring `DOCKER_HOST`
/// when it names a unix socket and falling back to the standard path
/// otherwise (matching `Docker::connect_with_local_defaults`'s own
/// resolution for the common case this crate runs under).
fn docker_socket_path() -> String {
    match std::env::var("DOCKER_HOST") {
        Ok(host) if host.starts_with("unix://") => {
            host.trim_start_matches("unix://").to_string()
        }
        _ => "/var/run/docker.sock".to_string(),
    }
}

/// Patch labels on a live container. The Docker Engine API's
/// `/containers/{id}/update` endpoint has no documented field for labels
/// (`bollard::container::UpdateContainerOptions` only carries resource
/// constraints and restart policy) — the original service patches them
/// anyway by POSTing a raw JSON body against that same endpoint
/// (`docker.py::_update_container_labels`, `container.update(labels=...)`),
/// relying on the daemon tolerating the unrecognized field rather than any
/// documented contract. Mirrored here with a one-shot HTTP/1 request over
/// the daemon socket, since bollard's typed API has no escape hatch for it.
/// Callers treat failure as non-fatal, same as the original.
async fn patch_container_labels(
    container_id: &str,
    labels: &HashMap<String, String>,
) -> Result<(), SandboxError> {
    let stream = UnixStream::connect(docker_socket_path())
        .await
        .map_err(|e| SandboxError::ExpirationNotExtended(e.to_string()))?;
    let io = TokioIo::new(stream);
    let (mut sender, connection) = client_http1::handshake(io)
        .await
        .map_err(|e| SandboxError::ExpirationNotExtended(e.to_string()))?;
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let body = serde_json::to_vec(&serde_json::json!({ "Labels": labels }))
        .map_err(|e| SandboxError::ExpirationNotExtended(e.to_string()))?;

    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/containers/{container_id}/update"))
        .header("Host", "localhost")
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| SandboxError::ExpirationNotExtended(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| SandboxError::ExpirationNotExtended(e.to_string()))?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(SandboxError::ExpirationNotExtended(format!(
            "daemon returned {}",
            response.status()
        )))
    }
}

#[async_trait]
impl RuntimeProvider for DockerProvider {
    #[instrument(skip(self, params), fields(sandbox = %params.id, action = "create_workload"))]
    async fn create_workload(
        &self,
        params: CreateWorkloadParams,
    ) -> Result<WorkloadHandle, SandboxError> {
        for mount in &params.volume_mounts {
            Self::ensure_host_path_exists(&mount.host_path)?;
        }

        self.ensure_image_available(&params.id, &params.image).await?;
        let execd = self.execd_bytes().await?;
        let archive = Self::build_runtime_archive(&execd)?;

        let mut labels = params.labels.clone();
        labels.insert(SANDBOX_ID_LABEL.to_string(), params.id.clone());
        labels.insert(
            SANDBOX_EXPIRES_AT_LABEL.to_string(),
            params.expires_at.to_rfc3339(),
        );

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        if self.config.network_mode == DockerNetworkMode::Bridge {
            let (execd_host_port, http_host_port) = Self::allocate_bridge_ports()?;
            labels.insert(
                SANDBOX_EMBEDDING_PROXY_PORT_LABEL.to_string(),
                execd_host_port.to_string(),
            );
            labels.insert(SANDBOX_HTTP_PORT_LABEL.to_string(), http_host_port.to_string());
            port_bindings.insert(
                format!("{EXECD_PORT}/tcp"),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(execd_host_port.to_string()),
                }]),
            );
            port_bindings.insert(
                format!("{HTTP_PORT}/tcp"),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(http_host_port.to_string()),
                }]),
            );
        }

        let env: Vec<String> = params
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let binds: Vec<String> = params
            .volume_mounts
            .iter()
            .map(|m| {
                let ro = if m.read_only { ":ro" } else { "" };
                format!("{}:{}{}", Self::resolve_host_path(&m.host_path), m.container_path, ro)
            })
            .collect();

        let host_config = HostConfig {
            network_mode: Some(match self.config.network_mode {
                DockerNetworkMode::Host => "host".to_string(),
                DockerNetworkMode::Bridge => "bridge".to_string(),
            }),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            binds: if binds.is_empty() { None } else { Some(binds) },
            memory: params
                .resource_limits
                .get("memory")
                .and_then(|s| crate::validation::parse_memory_limit(s)),
            nano_cpus: params
                .resource_limits
                .get("cpu")
                .and_then(|s| crate::validation::parse_nano_cpus(s)),
            pids_limit: self.config.pids_limit,
            cap_drop: if self.config.drop_capabilities.is_empty() {
                None
            } else {
                Some(self.config.drop_capabilities.clone())
            },
            security_opt: {
                let mut opts = Vec::new();
                if self.config.no_new_privileges {
                    opts.push("no-new-privileges".to_string());
                }
                if let Some(profile) = &self.config.apparmor_profile {
                    opts.push(format!("apparmor={profile}"));
                }
                if let Some(profile) = &self.config.seccomp_profile {
                    opts.push(format!("seccomp={profile}"));
                }
                if opts.is_empty() { None } else { Some(opts) }
            },
            ..Default::default()
        };

        let container_config = Config {
            image: Some(params.image.uri.clone()),
            env: Some(env),
            entrypoint: Some(vec![BOOTSTRAP_PATH.to_string()]),
            cmd: Some(params.entrypoint.clone()),
            labels: Some(labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = labels::container_name(&params.id);
        let created = timed(&params.id, "create_container", async {
            self.docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: name.clone(),
                        platform: None,
                    }),
                    container_config,
                )
                .await
                .map_err(|e| SandboxError::ContainerStartFailed(e.to_string()))
        })
        .await?;

        let upload_result = timed(&params.id, "upload_bootstrap_archive", async {
            self.docker
                .upload_to_container(
                    &created.id,
                    Some(UploadToContainerOptions {
                        path: "/".to_string(),
                        ..Default::default()
                    }),
                    archive.into(),
                )
                .await
                .map_err(|e| SandboxError::BootstrapInstallFailed(e.to_string()))
        })
        .await;
        if let Err(e) = upload_result {
            let _ = self
                .docker
                .remove_container(&created.id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                .await;
            return Err(e);
        }

        if let Err(e) = timed(&params.id, "start_container", async {
            self.docker
                .start_container::<String>(&created.id, None)
                .await
                .map_err(|e| SandboxError::ContainerStartFailed(e.to_string()))
        })
        .await
        {
            let _ = self
                .docker
                .remove_container(&created.id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                .await;
            return Err(e);
        }

        info!(sandbox = %params.id, container = %created.id, "sandbox container started");
        Ok(WorkloadHandle {
            name,
            uid: created.id,
        })
    }

    #[instrument(skip(self), fields(sandbox = %id, action = "get_workload"))]
    async fn get_workload(
        &self,
        id: &str,
        _namespace: &str,
    ) -> Result<Option<Box<dyn Workload>>, SandboxError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{SANDBOX_ID_LABEL}={id}")]);

        let summaries = timed(id, "list_containers_by_id", async {
            self.docker
                .list_containers(Some(ListContainersOptions {
                    all: true,
                    filters,
                    ..Default::default()
                }))
                .await
                .map_err(|e| SandboxError::DockerQueryFailed(e.to_string()))
        })
        .await?;

        let Some(summary) = summaries.into_iter().next() else {
            return Ok(None);
        };

        let container_id = summary.id.clone().unwrap_or_default();
        let inspect = timed(id, "inspect_container", async {
            self.docker
                .inspect_container(&container_id, None::<InspectContainerOptions>)
                .await
                .map_err(|e| SandboxError::DockerQueryFailed(e.to_string()))
        })
        .await?;

        let state = inspect
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| format!("{s:?}").to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        let exit_code = inspect.state.as_ref().and_then(|s| s.exit_code).unwrap_or(0);
        let status_text = inspect.state.as_ref().and_then(|s| s.status.clone().map(|s| format!("{s:?}"))).unwrap_or_default();

        let bridge_ip = inspect
            .network_settings
            .as_ref()
            .and_then(|n| n.ip_address.clone())
            .filter(|ip| !ip.is_empty());

        let created_at = inspect
            .created
            .as_deref()
            .map(crate::validation::parse_timestamp);

        Ok(Some(Box::new(DockerWorkload {
            id: id.to_string(),
            container_id,
            state,
            status_text,
            exit_code,
            labels: Self::container_labels(&summary),
            bridge_ports: parse_bridge_ports(&Self::container_labels(&summary)),
            bridge_ip,
            created_at,
        })))
    }

    #[instrument(skip(self), fields(action = "list_workloads"))]
    async fn list_workloads(
        &self,
        _namespace: &str,
        _label_selector: &str,
    ) -> Result<Vec<Box<dyn Workload>>, SandboxError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![SANDBOX_ID_LABEL.to_string()]);

        let summaries = timed("shared", "list_containers", async {
            self.docker
                .list_containers(Some(ListContainersOptions {
                    all: true,
                    filters,
                    ..Default::default()
                }))
                .await
                .map_err(|e| SandboxError::DockerQueryFailed(e.to_string()))
        })
        .await?;

        let mut out = Vec::new();
        for summary in summaries {
            let labels = Self::container_labels(&summary);
            let Some(id) = labels.get(SANDBOX_ID_LABEL).cloned() else {
                continue;
            };
            let state = summary.state.clone().unwrap_or_default();
            let status_text = summary.status.clone().unwrap_or_default();
            let created_at = summary.created.and_then(|secs| Utc.timestamp_opt(secs, 0).single());
            out.push(Box::new(DockerWorkload {
                id,
                container_id: summary.id.clone().unwrap_or_default(),
                state,
                status_text,
                exit_code: 0,
                bridge_ports: parse_bridge_ports(&labels),
                labels,
                bridge_ip: None,
                created_at,
            }) as Box<dyn Workload>);
        }
        Ok(out)
    }

    #[instrument(skip(self), fields(sandbox = %id, action = "delete_workload"))]
    async fn delete_workload(&self, id: &str, namespace: &str) -> Result<(), SandboxError> {
        let workload = self.get_workload(id, namespace).await?;
        let Some(workload) = workload else {
            return Err(SandboxError::DockerSandboxNotFound(id.to_string()));
        };
        let container_id = downcast(&workload).container_id.clone();

        let kill_result = timed(id, "kill_container", async {
            self.docker
                .kill_container(&container_id, None::<KillContainerOptions<String>>)
                .await
                .map_err(|e| SandboxError::SandboxDeleteFailed(e.to_string()))
        })
        .await;
        if let Err(e) = kill_result {
            let message = e.to_string();
            if !message.contains("is not running") {
                warn!(sandbox = %id, error = %message, "kill failed before delete");
            }
        }

        timed(id, "remove_container", async {
            self.docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| SandboxError::SandboxDeleteFailed(e.to_string()))
        })
        .await
    }

    fn not_found_error(&self, id: &str) -> SandboxError {
        SandboxError::DockerSandboxNotFound(id.to_string())
    }

    /// Patches the `expires-at` label on the live container (§B.4). Docker's
    /// Engine API documents no label-update field on
    /// `/containers/{id}/update`, so the attempt may simply be rejected by
    /// the daemon; either way the in-memory `ExpirationTracker` is already
    /// authoritative, so failure here is logged, not fatal, matching the
    /// original's broad `except (DockerException, TypeError)` around
    /// `_update_container_labels`.
    #[instrument(skip(self), fields(sandbox = %id, action = "update_expiration"))]
    async fn update_expiration(
        &self,
        id: &str,
        namespace: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SandboxError> {
        let workload = self.get_workload(id, namespace).await?;
        let Some(workload) = workload else {
            return Err(SandboxError::DockerSandboxNotFound(id.to_string()));
        };
        let workload = downcast(&workload);
        let mut labels = workload.labels.clone();
        labels.insert(SANDBOX_EXPIRES_AT_LABEL.to_string(), expires_at.to_rfc3339());

        let result = timed(id, "patch_container_labels", patch_container_labels(&workload.container_id, &labels)).await;
        if let Err(e) = result {
            warn!(
                sandbox = %id,
                expires_at = %expires_at.to_rfc3339(),
                error = %e,
                "failed to patch expiration label on live container, timer remains authoritative"
            );
        }
        Ok(())
    }

    fn get_expiration(&self, workload: &dyn Workload) -> Option<DateTime<Utc>> {
        let workload = downcast(workload);
        let raw = workload.labels.get(SANDBOX_EXPIRES_AT_LABEL)?;
        Some(crate::validation::parse_timestamp(raw))
    }

    fn get_created_at(&self, workload: &dyn Workload) -> Option<DateTime<Utc>> {
        downcast(workload).created_at
    }

    fn id_of(&self, workload: &dyn Workload) -> Option<String> {
        Some(downcast(workload).id.clone())
    }

    fn get_status(&self, workload: &dyn Workload) -> SandboxStatus {
        let workload = downcast(workload);
        Self::project_status(&workload.state, &workload.status_text, workload.exit_code)
    }

    #[instrument(skip(self, workload), fields(action = "get_endpoint_info"))]
    async fn get_endpoint_info(
        &self,
        workload: &dyn Workload,
        port: u16,
        resolve_internal: bool,
    ) -> Result<Option<String>, SandboxError> {
        let workload = downcast(workload);

        if self.config.network_mode == DockerNetworkMode::Host {
            let host = if resolve_internal {
                "127.0.0.1".to_string()
            } else {
                self.resolve_public_host()
            };
            return Ok(Some(format!("{host}:{port}")));
        }

        if resolve_internal {
            return Ok(workload.bridge_ip.clone().map(|ip| format!("{ip}:{port}")));
        }

        let host = self.resolve_public_host();
        if port == HTTP_PORT {
            let Some(http_port) = workload.bridge_ports.get(&HTTP_PORT) else {
                return Err(SandboxError::NetworkModeEndpointUnavailable);
            };
            return Ok(Some(format!("{host}:{http_port}")));
        }

        let Some(execd_port) = workload.bridge_ports.get(&EXECD_PORT) else {
            return Err(SandboxError::NetworkModeEndpointUnavailable);
        };
        Ok(Some(format!("{host}:{execd_port}/proxy/{port}")))
    }

    fn metadata(&self, workload: &dyn Workload) -> HashMap<String, String> {
        let workload = downcast(workload);
        labels::strip_reserved(workload.labels.clone())
    }

    #[instrument(skip(self), fields(sandbox = %id, action = "pause_workload"))]
    async fn pause_workload(&self, id: &str, namespace: &str) -> Result<(), SandboxError> {
        let workload = self.get_workload(id, namespace).await?;
        let Some(workload) = workload else {
            return Err(SandboxError::DockerSandboxNotFound(id.to_string()));
        };
        let workload = downcast(&workload);
        if workload.state != "running" {
            return Err(SandboxError::SandboxNotRunning(id.to_string()));
        }
        timed(id, "pause_container", async {
            self.docker
                .pause_container(&workload.container_id)
                .await
                .map_err(|e| SandboxError::SandboxPauseFailed(e.to_string()))
        })
        .await
    }

    #[instrument(skip(self), fields(sandbox = %id, action = "resume_workload"))]
    async fn resume_workload(&self, id: &str, namespace: &str) -> Result<(), SandboxError> {
        let workload = self.get_workload(id, namespace).await?;
        let Some(workload) = workload else {
            return Err(SandboxError::DockerSandboxNotFound(id.to_string()));
        };
        let workload = downcast(&workload);
        if workload.state != "paused" {
            return Err(SandboxError::SandboxNotPaused(id.to_string()));
        }
        timed(id, "unpause_container", async {
            self.docker
                .unpause_container(&workload.container_id)
                .await
                .map_err(|e| SandboxError::SandboxResumeFailed(e.to_string()))
        })
        .await
    }

    fn is_async_provisioning(&self) -> bool {
        true
    }
}

fn downcast(workload: &(dyn Workload)) -> &DockerWorkload {
    workload
        .as_any()
        .downcast_ref::<DockerWorkload>()
        .expect("DockerProvider received a non-DockerWorkload handle")
}

fn parse_bridge_ports(labels: &HashMap<String, String>) -> HashMap<u16, u16> {
    let mut ports = HashMap::new();
    if let Some(v) = labels.get(SANDBOX_EMBEDDING_PROXY_PORT_LABEL).and_then(|s| s.parse().ok()) {
        ports.insert(EXECD_PORT, v);
    }
    if let Some(v) = labels.get(SANDBOX_HTTP_PORT_LABEL).and_then(|s| s.parse().ok()) {
        ports.insert(HTTP_PORT, v);
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_script_backgrounds_execd_and_execs_user_command() {
        let script = DockerProvider::bootstrap_script();
        assert!(script.starts_with("#!/bin/sh\nset -e\n"));
        assert!(script.contains(EXECD_INSTALL_PATH));
        assert!(script.trim_end().ends_with("exec \"$@\""));
    }

    #[test]
    fn network_mode_parses_host_and_bridge_only() {
        assert_eq!(
            "host".parse::<DockerNetworkMode>().unwrap(),
            DockerNetworkMode::Host
        );
        assert_eq!(
            "bridge".parse::<DockerNetworkMode>().unwrap(),
            DockerNetworkMode::Bridge
        );
        assert!("swarm".parse::<DockerNetworkMode>().is_err());
    }

    #[test]
    fn status_projection_matches_table() {
        let running = DockerProvider::project_status("running", "Up 2 minutes", 0);
        assert_eq!(running.state, SandboxState::Running);

        let exited_clean = DockerProvider::project_status("exited", "Exited (0)", 0);
        assert_eq!(exited_clean.state, SandboxState::Terminated);

        let exited_failed = DockerProvider::project_status("exited", "Exited (1)", 1);
        assert_eq!(exited_failed.state, SandboxState::Failed);

        let unknown = DockerProvider::project_status("weird", "?", 0);
        assert_eq!(unknown.state, SandboxState::Unknown);
    }

    #[test]
    fn bridge_port_labels_round_trip() {
        let mut labels = HashMap::new();
        labels.insert(SANDBOX_EMBEDDING_PROXY_PORT_LABEL.to_string(), "44801".to_string());
        labels.insert(SANDBOX_HTTP_PORT_LABEL.to_string(), "44802".to_string());
        let ports = parse_bridge_ports(&labels);
        assert_eq!(ports.get(&EXECD_PORT), Some(&44801));
        assert_eq!(ports.get(&HTTP_PORT), Some(&44802));
    }
}
