//! Runtime provider interface (C5): the capability set shared by the Docker
//! and Kubernetes backends. Add a new runtime by implementing this trait,
//! not by subclassing a shared service (§9).

pub mod docker;
#[cfg(feature = "kubernetes")]
pub mod kubernetes;

use crate::error::SandboxError;
use crate::model::{ImageRef, SandboxStatus, VolumeMount};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;

/// Times a provider daemon/API call and logs `sandbox=<id> action=<name>
/// duration=<ms>` on success, the same plus `error=<exc>` on failure (§A.1,
/// §B.1). Mirrors `_docker_operation` in the original's
/// `server/src/services/docker.py`, a context manager wrapped around every
/// Docker call; expressed here as a higher-order async wrapper since Rust
/// has no `with`-statement equivalent.
pub(crate) async fn timed<T>(
    sandbox_id: &str,
    action: &str,
    fut: impl Future<Output = Result<T, SandboxError>>,
) -> Result<T, SandboxError> {
    let start = std::time::Instant::now();
    let result = fut.await;
    let duration = start.elapsed().as_secs_f64() * 1000.0;
    match &result {
        Ok(_) => {
            tracing::info!(sandbox = sandbox_id, action, duration, "provider call completed")
        }
        Err(e) => {
            tracing::warn!(sandbox = sandbox_id, action, duration, error = %e, "provider call failed")
        }
    }
    result
}

/// Parameters for [`RuntimeProvider::create_workload`].
#[derive(Debug, Clone)]
pub struct CreateWorkloadParams {
    pub id: String,
    pub namespace: String,
    pub image: ImageRef,
    pub entrypoint: Vec<String>,
    pub env: HashMap<String, String>,
    pub resource_limits: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub expires_at: DateTime<Utc>,
    pub execd_image: String,
    pub volume_mounts: Vec<VolumeMount>,
    pub extensions: HashMap<String, String>,
}

/// Identity of a created backing object.
#[derive(Debug, Clone)]
pub struct WorkloadHandle {
    pub name: String,
    pub uid: String,
}

/// An opaque reference to a backing runtime object (container or CR). Each
/// provider defines its own concrete shape behind this marker trait so the
/// service can hold it without depending on runtime-specific types.
pub trait Workload: Send + Sync + std::fmt::Debug {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Abstract CRUD + status + endpoint contract shared by all backends (§4.5).
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    async fn create_workload(
        &self,
        params: CreateWorkloadParams,
    ) -> Result<WorkloadHandle, SandboxError>;

    async fn get_workload(
        &self,
        id: &str,
        namespace: &str,
    ) -> Result<Option<Box<dyn Workload>>, SandboxError>;

    async fn list_workloads(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Box<dyn Workload>>, SandboxError>;

    async fn delete_workload(&self, id: &str, namespace: &str) -> Result<(), SandboxError>;

    /// Construct this runtime's not-found error for `id`, so a generic
    /// `SandboxService<P>` reports the provider-specific code (§7) rather
    /// than guessing which runtime a lookup failure came from.
    fn not_found_error(&self, id: &str) -> SandboxError;

    async fn update_expiration(
        &self,
        id: &str,
        namespace: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SandboxError>;

    fn get_expiration(&self, workload: &dyn Workload) -> Option<DateTime<Utc>>;

    /// Creation timestamp of the backing object, used for list sort order
    /// (§4.8). Not part of the wire contract of §4.5; an implementation
    /// detail every backing runtime happens to track natively.
    fn get_created_at(&self, workload: &dyn Workload) -> Option<DateTime<Utc>>;

    /// Sandbox id stamped on the backing object, read back from its raw
    /// label/annotation (unlike [`RuntimeProvider::metadata`], which strips
    /// reserved keys). Used for `list_workloads` dedup against the pending
    /// registry (Invariant 4).
    fn id_of(&self, workload: &dyn Workload) -> Option<String>;

    fn get_status(&self, workload: &dyn Workload) -> SandboxStatus;

    async fn get_endpoint_info(
        &self,
        workload: &dyn Workload,
        port: u16,
        resolve_internal: bool,
    ) -> Result<Option<String>, SandboxError>;

    /// Projected user metadata (labels minus the reserved prefix).
    fn metadata(&self, workload: &dyn Workload) -> HashMap<String, String>;

    async fn pause_workload(&self, id: &str, namespace: &str) -> Result<(), SandboxError> {
        let _ = (id, namespace);
        Err(SandboxError::ApiNotSupported)
    }

    async fn resume_workload(&self, id: &str, namespace: &str) -> Result<(), SandboxError> {
        let _ = (id, namespace);
        Err(SandboxError::ApiNotSupported)
    }

    /// Whether `create_workload` completes synchronously (Kubernetes waits
    /// for readiness inline) or returns immediately with provisioning
    /// continuing in the background (Docker's async path, §4.8).
    fn is_async_provisioning(&self) -> bool {
        false
    }
}
