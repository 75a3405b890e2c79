//! Kubernetes provider (C7): implements [`RuntimeProvider`] over a
//! namespaced `BatchSandbox` custom resource.
//!
//! Grounded on `examples/original_source/.../k8s/batchsandbox_provider.py`
//! (manifest shape, readiness polling, status precedence) and
//! `kubernetes_service.py` (endpoint resolution). Uses `kube`'s
//! `DynamicObject` rather than a `#[derive(CustomResource)]` type: the CRD
//! is installed externally, so there is no benefit to generating a typed
//! Rust binding for it (see `DESIGN.md`).

pub mod template;

use super::{timed, CreateWorkloadParams, RuntimeProvider, Workload, WorkloadHandle};
use crate::error::SandboxError;
use crate::labels::{self, SANDBOX_ENDPOINTS_ANNOTATION, SANDBOX_ID_LABEL};
use crate::model::{SandboxState, SandboxStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument, warn};

const GROUP: &str = "sandbox.opensandbox.io";
const VERSION: &str = "v1alpha1";
const KIND: &str = "BatchSandbox";

#[derive(Debug, Clone)]
pub struct KubernetesProviderConfig {
    pub namespace: String,
    /// Optional user-supplied template (parsed YAML or JSON), merged under
    /// the runtime-generated fields (§4.7 "template mode").
    pub user_template: Option<Value>,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
}

impl Default for KubernetesProviderConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            user_template: None,
            poll_interval: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct BatchSandboxWorkload {
    pub object: DynamicObject,
}

impl Workload for BatchSandboxWorkload {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct KubernetesProvider {
    client: Client,
    api_resource: ApiResource,
    config: KubernetesProviderConfig,
}

impl KubernetesProvider {
    /// Connect using the ambient kubeconfig (in-cluster service account or
    /// `~/.kube/config`), matching the collaborator contract of §6.
    pub async fn connect(config: KubernetesProviderConfig) -> Result<Self, SandboxError> {
        let client = Client::try_default()
            .await
            .map_err(|e| SandboxError::K8sInitializationError(e.to_string()))?;
        let gvk = GroupVersionKind::gvk(GROUP, VERSION, KIND);
        let api_resource = ApiResource::from_gvk(&gvk);
        Ok(Self {
            client,
            api_resource,
            config,
        })
    }

    fn api(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.config.namespace, &self.api_resource)
    }

    fn resource_name(id: &str) -> String {
        format!("sandbox-{id}")
    }

    /// Build the manifest for `create_workload`: template mode unless
    /// `extensions.poolRef` is set (§4.7).
    fn build_manifest(&self, params: &CreateWorkloadParams) -> Value {
        if let Some(pool_ref) = params.extensions.get("poolRef").filter(|s| !s.is_empty()) {
            return template::build_pool_manifest(params, pool_ref);
        }

        let runtime_manifest = template::build_template_manifest(params);
        match &self.config.user_template {
            Some(user) => template::deep_merge(user.clone(), runtime_manifest),
            None => runtime_manifest,
        }
    }

    #[instrument(skip(self, params), fields(sandbox = %params.id, action = "wait_for_ready"))]
    async fn wait_for_ready(&self, params: &CreateWorkloadParams, name: &str) -> Result<(), SandboxError> {
        let deadline = std::time::Instant::now() + self.config.ready_timeout;
        loop {
            let object = self
                .api()
                .get(name)
                .await
                .map_err(|e| SandboxError::KubernetesApiError(e.to_string()))?;

            let status = project_status(&object);
            match status.state {
                SandboxState::Running => {
                    return Ok(());
                }
                SandboxState::Failed => {
                    return Err(SandboxError::PodFailed(format!(
                        "sandbox '{}' reported failed status: {}",
                        params.id, status.message
                    )));
                }
                _ => {}
            }

            if std::time::Instant::now() >= deadline {
                return Err(SandboxError::PodReadyTimeout);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

fn endpoint_ip(object: &DynamicObject) -> Option<String> {
    let raw = object.metadata.annotations.as_ref()?.get(SANDBOX_ENDPOINTS_ANNOTATION)?;
    let ips: Vec<String> = serde_json::from_str(raw).ok()?;
    ips.into_iter().find(|ip| !ip.is_empty())
}

/// Status precedence from CR status (§4.7), factored out of the trait impl
/// so it can be unit tested without a live `Client`.
fn project_status(object: &DynamicObject) -> SandboxStatus {
    let now = Utc::now();
    let status = object.data.get("status");

    let ready = status.and_then(|s| s.get("ready")).and_then(|v| v.as_i64()).unwrap_or(0);
    let allocated = status.and_then(|s| s.get("allocated")).and_then(|v| v.as_i64()).unwrap_or(0);
    let has_ip = endpoint_ip(object).is_some();

    let (state, reason) = if ready >= 1 && has_ip {
        (SandboxState::Running, "READY_WITH_IP")
    } else if ready >= 1 {
        (SandboxState::Pending, "POD_READY_NO_IP")
    } else if allocated >= 1 {
        (SandboxState::Pending, "POD_SCHEDULED")
    } else {
        (SandboxState::Pending, "BATCHSANDBOX_PENDING")
    };

    let message = status
        .and_then(|s| s.get("message"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    SandboxStatus {
        state,
        reason: reason.to_string(),
        message,
        last_transition_at: now,
    }
}

#[async_trait]
impl RuntimeProvider for KubernetesProvider {
    #[instrument(skip(self, params), fields(sandbox = %params.id, action = "create_workload"))]
    async fn create_workload(
        &self,
        params: CreateWorkloadParams,
    ) -> Result<WorkloadHandle, SandboxError> {
        let name = Self::resource_name(&params.id);
        let mut labels = params.labels.clone();
        labels.insert(SANDBOX_ID_LABEL.to_string(), params.id.clone());

        let spec = self.build_manifest(&params);
        let Value::Object(spec_map) = spec else {
            return Err(SandboxError::KubernetesApiError(
                "BatchSandbox manifest must be a JSON object".to_string(),
            ));
        };

        let mut data = serde_json::Map::new();
        data.insert("spec".to_string(), Value::Object(spec_map));

        let object = DynamicObject::new(&name, &self.api_resource)
            .within(&self.config.namespace)
            .data(Value::Object(data));
        let mut object = object;
        object.metadata.labels = Some(labels.into_iter().collect());

        let created = timed(&params.id, "create_batchsandbox", async {
            self.api()
                .create(&PostParams::default(), &object)
                .await
                .map_err(|e| SandboxError::KubernetesApiError(e.to_string()))
        })
        .await?;

        let uid = created.metadata.uid.clone().unwrap_or_default();

        let wait_start = std::time::Instant::now();
        if let Err(e) = self.wait_for_ready(&params, &name).await {
            let duration = wait_start.elapsed().as_secs_f64() * 1000.0;
            warn!(sandbox = %params.id, action = "wait_for_ready", duration, error = %e, "batchsandbox did not become ready, deleting");
            let _ = self.api().delete(&name, &DeleteParams::default()).await;
            return Err(e);
        }

        let duration = wait_start.elapsed().as_secs_f64() * 1000.0;
        info!(sandbox = %params.id, name = %name, action = "wait_for_ready", duration, "batchsandbox ready");
        Ok(WorkloadHandle { name, uid })
    }

    #[instrument(skip(self), fields(sandbox = %id, action = "get_workload"))]
    async fn get_workload(
        &self,
        id: &str,
        _namespace: &str,
    ) -> Result<Option<Box<dyn Workload>>, SandboxError> {
        let name = Self::resource_name(id);
        let start = std::time::Instant::now();
        let result = self.api().get(&name).await;
        let duration = start.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(object) => {
                info!(sandbox = id, action = "get_batchsandbox", duration, "provider call completed");
                Ok(Some(Box::new(BatchSandboxWorkload { object })))
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                info!(sandbox = id, action = "get_batchsandbox", duration, "provider call completed, not found");
                Ok(None)
            }
            Err(e) => {
                warn!(sandbox = id, action = "get_batchsandbox", duration, error = %e, "provider call failed");
                Err(SandboxError::KubernetesApiError(e.to_string()))
            }
        }
    }

    #[instrument(skip(self), fields(action = "list_workloads"))]
    async fn list_workloads(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Box<dyn Workload>>, SandboxError> {
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        let list = timed("shared", "list_batchsandboxes", async {
            self.api()
                .list(&params)
                .await
                .map_err(|e| SandboxError::KubernetesApiError(e.to_string()))
        })
        .await?;
        Ok(list
            .items
            .into_iter()
            .map(|object| Box::new(BatchSandboxWorkload { object }) as Box<dyn Workload>)
            .collect())
    }

    #[instrument(skip(self), fields(sandbox = %id, action = "delete_workload"))]
    async fn delete_workload(&self, id: &str, _namespace: &str) -> Result<(), SandboxError> {
        let name = Self::resource_name(id);
        let start = std::time::Instant::now();
        let result = self.api().delete(&name, &DeleteParams::default()).await;
        let duration = start.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(_) => {
                info!(sandbox = id, action = "delete_batchsandbox", duration, "provider call completed");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!(sandbox = id, action = "delete_batchsandbox", duration, "batchsandbox already gone");
                Err(SandboxError::KubernetesSandboxNotFound(id.to_string()))
            }
            Err(e) => {
                warn!(sandbox = id, action = "delete_batchsandbox", duration, error = %e, "provider call failed");
                Err(SandboxError::SandboxDeleteFailed(e.to_string()))
            }
        }
    }

    fn not_found_error(&self, id: &str) -> SandboxError {
        SandboxError::KubernetesSandboxNotFound(id.to_string())
    }

    #[instrument(skip(self), fields(sandbox = %id, action = "update_expiration"))]
    async fn update_expiration(
        &self,
        id: &str,
        _namespace: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SandboxError> {
        let name = Self::resource_name(id);
        let patch = json!({ "spec": { "expireTime": expires_at.to_rfc3339() } });
        timed(id, "patch_batchsandbox_expiration", async {
            self.api()
                .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
                .await
                .map_err(|e| SandboxError::ExpirationNotExtended(e.to_string()))
        })
        .await?;
        Ok(())
    }

    fn get_expiration(&self, workload: &dyn Workload) -> Option<DateTime<Utc>> {
        let workload = downcast(workload);
        let raw = workload.object.data.get("spec")?.get("expireTime")?.as_str()?;
        Some(crate::validation::parse_timestamp(raw))
    }

    fn get_created_at(&self, workload: &dyn Workload) -> Option<DateTime<Utc>> {
        downcast(workload).object.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }

    fn id_of(&self, workload: &dyn Workload) -> Option<String> {
        downcast(workload).object.metadata.labels.as_ref()?.get(SANDBOX_ID_LABEL).cloned()
    }

    /// Status precedence from CR status (§4.7): ready-with-IP beats
    /// ready-without-IP beats scheduled beats plain pending.
    fn get_status(&self, workload: &dyn Workload) -> SandboxStatus {
        project_status(&downcast(workload).object)
    }

    #[instrument(skip(self, workload), fields(action = "get_endpoint_info"))]
    async fn get_endpoint_info(
        &self,
        workload: &dyn Workload,
        port: u16,
        resolve_internal: bool,
    ) -> Result<Option<String>, SandboxError> {
        let _ = resolve_internal;
        let workload = downcast(workload);
        let Some(ip) = endpoint_ip(&workload.object) else {
            return Ok(None);
        };
        if port == labels::HTTP_PORT {
            Ok(Some(format!("{ip}:{port}")))
        } else {
            Ok(Some(format!("{ip}:{}/proxy/{port}", labels::EXECD_PORT)))
        }
    }

    fn metadata(&self, workload: &dyn Workload) -> HashMap<String, String> {
        let workload = downcast(workload);
        let raw = workload
            .object
            .metadata
            .labels
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect::<HashMap<_, _>>();
        labels::strip_reserved(raw)
    }

    /// Pause/resume are unsupported on the Kubernetes path (§4.7).
    async fn pause_workload(&self, _id: &str, _namespace: &str) -> Result<(), SandboxError> {
        Err(SandboxError::ApiNotSupported)
    }

    async fn resume_workload(&self, _id: &str, _namespace: &str) -> Result<(), SandboxError> {
        Err(SandboxError::ApiNotSupported)
    }

    fn is_async_provisioning(&self) -> bool {
        false
    }
}

fn downcast(workload: &dyn Workload) -> &BatchSandboxWorkload {
    workload
        .as_any()
        .downcast_ref::<BatchSandboxWorkload>()
        .expect("KubernetesProvider received a non-BatchSandboxWorkload handle")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload_with_status(ready: i64, allocated: i64, endpoints: Option<&str>) -> BatchSandboxWorkload {
        let mut object = DynamicObject::new(
            "sandbox-test",
            &ApiResource::from_gvk(&GroupVersionKind::gvk(GROUP, VERSION, KIND)),
        );
        object.data = json!({ "status": { "ready": ready, "allocated": allocated } });
        if let Some(ips) = endpoints {
            let mut annotations = std::collections::BTreeMap::new();
            annotations.insert(SANDBOX_ENDPOINTS_ANNOTATION.to_string(), ips.to_string());
            object.metadata.annotations = Some(annotations);
        }
        BatchSandboxWorkload { object }
    }

    #[test]
    fn status_precedence_ready_with_ip_beats_everything() {
        let status = project_status(&workload_with_status(1, 1, Some("[\"10.0.0.5\"]")).object);
        assert_eq!(status.state, SandboxState::Running);
        assert_eq!(status.reason, "READY_WITH_IP");
    }

    #[test]
    fn status_precedence_ready_without_ip() {
        let status = project_status(&workload_with_status(1, 1, None).object);
        assert_eq!(status.state, SandboxState::Pending);
        assert_eq!(status.reason, "POD_READY_NO_IP");
    }

    #[test]
    fn status_precedence_scheduled_only() {
        let status = project_status(&workload_with_status(0, 1, None).object);
        assert_eq!(status.reason, "POD_SCHEDULED");
    }

    #[test]
    fn status_precedence_pending_default() {
        let status = project_status(&workload_with_status(0, 0, None).object);
        assert_eq!(status.reason, "BATCHSANDBOX_PENDING");
    }

    #[test]
    fn endpoint_ip_parses_first_nonempty() {
        let workload = workload_with_status(1, 1, Some("[\"\", \"10.0.0.9\"]"));
        assert_eq!(endpoint_ip(&workload.object), Some("10.0.0.9".to_string()));
    }

    #[test]
    fn endpoint_ip_none_on_malformed_json() {
        let workload = workload_with_status(1, 1, Some("not json"));
        assert_eq!(endpoint_ip(&workload.object), None);
    }
}
