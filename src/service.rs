//! Sandbox service facade (C8): the single entry point the HTTP layer talks
//! to. Generic over `P: RuntimeProvider` rather than a sibling hierarchy of
//! Docker/Kubernetes services (§9 design notes) — one code path validates
//! input, dispatches to the configured provider, and owns the expiration
//! tracker and pending registry.

use crate::error::SandboxError;
use crate::expiration::ExpirationTracker;
use crate::labels;
use crate::model::{
    CreateSandboxRequest, ImageRef, ListSandboxesResponse, Pagination, Sandbox, SandboxFilter,
    VolumeMount,
};
use crate::pending::{PendingRegistry, PendingSnapshot};
use crate::provider::{CreateWorkloadParams, RuntimeProvider, Workload};
use crate::validation;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// The parts of a created sandbox that cannot be cheaply recovered by
/// re-reading the backing runtime object (full entrypoint/env/volume
/// mounts). Kept in memory only, for the lifetime of the process: losing
/// it on restart is consistent with carrying no durable state beyond what
/// the runtime itself records in labels/CR fields.
#[derive(Debug, Clone)]
struct DesiredSpec {
    image: ImageRef,
    entrypoint: Vec<String>,
    env: HashMap<String, String>,
    resource_limits: HashMap<String, String>,
    volume_mounts: Vec<VolumeMount>,
    extensions: HashMap<String, String>,
    timeout_seconds: i64,
    created_at: DateTime<Utc>,
}

pub struct SandboxService<P: RuntimeProvider> {
    provider: Arc<P>,
    namespace: String,
    execd_image: String,
    tracker: Arc<ExpirationTracker>,
    pending: Arc<PendingRegistry>,
    desired: Mutex<HashMap<String, DesiredSpec>>,
}

impl<P: RuntimeProvider + 'static> SandboxService<P> {
    pub fn new(
        provider: Arc<P>,
        namespace: String,
        execd_image: String,
        pending_failure_ttl: std::time::Duration,
    ) -> Arc<Self> {
        let tracker_provider = provider.clone();
        let tracker_namespace = namespace.clone();
        let tracker = ExpirationTracker::new(Arc::new(move |id: String| {
            let provider = tracker_provider.clone();
            let namespace = tracker_namespace.clone();
            Box::pin(async move {
                match provider.delete_workload(&id, &namespace).await {
                    Ok(())
                    | Err(SandboxError::DockerSandboxNotFound(_))
                    | Err(SandboxError::KubernetesSandboxNotFound(_)) => {}
                    Err(e) => warn!(sandbox = %id, error = %e, "expiration reclaim failed"),
                }
            })
        }));

        Arc::new(Self {
            provider,
            namespace,
            execd_image,
            tracker,
            pending: PendingRegistry::new(pending_failure_ttl),
            desired: Mutex::new(HashMap::new()),
        })
    }

    /// Seed the expiration tracker from existing runtime objects at process
    /// start (§4.3). Must be called once, before serving traffic.
    pub async fn bootstrap(&self) -> Result<(), SandboxError> {
        let workloads = self.provider.list_workloads(&self.namespace, "").await?;
        let mut deadlines = Vec::with_capacity(workloads.len());
        for workload in &workloads {
            let Some(id) = self.provider.id_of(workload.as_ref()) else {
                continue;
            };
            deadlines.push((id, self.provider.get_expiration(workload.as_ref())));
        }
        let count = deadlines.len();
        self.tracker.restore(deadlines);
        info!(sandboxes = count, "expiration tracker seeded from existing runtime objects");
        Ok(())
    }

    pub async fn create_sandbox(&self, request: CreateSandboxRequest) -> Result<Sandbox, SandboxError> {
        validation::ensure_entrypoint(&request.entrypoint)?;
        validation::ensure_metadata_labels(&request.metadata)?;
        validation::ensure_timeout_seconds(request.timeout_seconds)?;

        let id = labels::new_sandbox_id();
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(request.timeout_seconds);
        let env = filter_env(&request.env);

        let desired = DesiredSpec {
            image: request.image.clone(),
            entrypoint: request.entrypoint.clone(),
            env: env.clone(),
            resource_limits: request.resource_limits.clone(),
            volume_mounts: request.volume_mounts.clone(),
            extensions: request.extensions.clone(),
            timeout_seconds: request.timeout_seconds,
            created_at: now,
        };

        let params = CreateWorkloadParams {
            id: id.clone(),
            namespace: self.namespace.clone(),
            image: request.image.clone(),
            entrypoint: request.entrypoint.clone(),
            env,
            resource_limits: request.resource_limits.clone(),
            labels: request.metadata.clone(),
            expires_at,
            execd_image: self.execd_image.clone(),
            volume_mounts: request.volume_mounts.clone(),
            extensions: request.extensions.clone(),
        };

        self.desired.lock().expect("desired spec mutex poisoned").insert(id.clone(), desired);

        if self.provider.is_async_provisioning() {
            self.pending.insert(id.clone(), request.clone(), now, expires_at);

            let provider = self.provider.clone();
            let pending = self.pending.clone();
            let tracker = self.tracker.clone();
            let task_id = id.clone();
            tokio::spawn(async move {
                match provider.create_workload(params).await {
                    Ok(_) => {
                        pending.remove(&task_id);
                        tracker.schedule(task_id, expires_at);
                    }
                    Err(e) => {
                        warn!(sandbox = %task_id, error = %e, "async provisioning failed");
                        pending.mark_failed(&task_id, "PROVISIONING_ERROR".to_string(), e.to_string());
                    }
                }
            });

            return Ok(Sandbox {
                id,
                image: request.image,
                entrypoint: request.entrypoint,
                env: filter_env(&request.env),
                resource_limits: request.resource_limits,
                metadata: request.metadata,
                volume_mounts: request.volume_mounts,
                extensions: request.extensions,
                timeout_seconds: request.timeout_seconds,
                created_at: now,
                expires_at,
                status: crate::model::SandboxStatus {
                    state: crate::model::SandboxState::Pending,
                    reason: "PROVISIONING".to_string(),
                    message: String::new(),
                    last_transition_at: now,
                },
            });
        }

        // Synchronous path (Kubernetes waits for readiness inline).
        self.provider.create_workload(params).await?;
        self.tracker.schedule(id.clone(), expires_at);
        let workload = self
            .provider
            .get_workload(&id, &self.namespace)
            .await?
            .ok_or_else(|| SandboxError::Unknown(format!("sandbox '{id}' disappeared immediately after creation")))?;
        Ok(self.project(&id, workload.as_ref()))
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<Sandbox, SandboxError> {
        if let Some(workload) = self.provider.get_workload(id, &self.namespace).await? {
            return Ok(self.project(id, workload.as_ref()));
        }
        if let Some(snapshot) = self.pending.get(id) {
            return Ok(self.project_pending(&snapshot));
        }
        Err(self.provider.not_found_error(id))
    }

    pub async fn list_sandboxes(
        &self,
        filter: SandboxFilter,
        pagination: Pagination,
    ) -> Result<ListSandboxesResponse, SandboxError> {
        validation::ensure_page_size(pagination.page_size)?;

        let workloads = self.provider.list_workloads(&self.namespace, "").await?;
        let mut seen = std::collections::HashSet::new();
        let mut sandboxes = Vec::with_capacity(workloads.len());

        for workload in &workloads {
            let Some(id) = self.provider.id_of(workload.as_ref()) else {
                continue;
            };
            seen.insert(id.clone());
            sandboxes.push(self.project(&id, workload.as_ref()));
        }

        // Invariant 4: a runtime object shadows a pending record for the
        // same id; only surface pending/failed entries with no object yet.
        for snapshot in self.pending.snapshot() {
            if seen.contains(&snapshot.id) {
                continue;
            }
            sandboxes.push(self.project_pending(&snapshot));
        }

        sandboxes.retain(|s| filter.matches(s));
        sandboxes.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(crate::model::paginate(sandboxes, pagination))
    }

    pub async fn delete_sandbox(&self, id: &str) -> Result<(), SandboxError> {
        let workload = self.provider.get_workload(id, &self.namespace).await?;
        let result = if workload.is_some() {
            self.provider.delete_workload(id, &self.namespace).await
        } else if self.pending.contains(id) {
            Ok(())
        } else {
            Err(self.provider.not_found_error(id))
        };

        self.tracker.cancel(id);
        self.pending.remove(id);
        self.desired.lock().expect("desired spec mutex poisoned").remove(id);

        result
    }

    pub async fn pause_sandbox(&self, id: &str) -> Result<Sandbox, SandboxError> {
        self.provider.pause_workload(id, &self.namespace).await?;
        self.get_sandbox(id).await
    }

    pub async fn resume_sandbox(&self, id: &str) -> Result<Sandbox, SandboxError> {
        self.provider.resume_workload(id, &self.namespace).await?;
        self.get_sandbox(id).await
    }

    pub async fn renew_expiration(
        &self,
        id: &str,
        new_expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, SandboxError> {
        let now = Utc::now();
        let new_expires_at = validation::ensure_future_expiration(new_expires_at, now)?;

        if self.provider.get_workload(id, &self.namespace).await?.is_none() {
            return Err(self.provider.not_found_error(id));
        }

        self.provider.update_expiration(id, &self.namespace, new_expires_at).await?;
        // The timer is authoritative even when the label/CR patch is
        // best-effort (Docker); renewal still replaces it atomically.
        self.tracker.schedule(id.to_string(), new_expires_at);
        Ok(new_expires_at)
    }

    pub async fn get_endpoint(
        &self,
        id: &str,
        port: u16,
        resolve_internal: bool,
    ) -> Result<String, SandboxError> {
        if !(1..=65535).contains(&port) {
            return Err(SandboxError::InvalidPort(port as i64));
        }
        let workload = self
            .provider
            .get_workload(id, &self.namespace)
            .await?
            .ok_or_else(|| self.provider.not_found_error(id))?;
        self.provider
            .get_endpoint_info(workload.as_ref(), port, resolve_internal)
            .await?
            .ok_or_else(|| SandboxError::PodIpNotAvailable(id.to_string()))
    }

    /// Build the externally-visible `Sandbox` for a live runtime object:
    /// status/expiry/metadata are always read live from the provider; the
    /// remaining desired-state fields come from the in-memory cache when
    /// this process created the sandbox, or sit at their zero value when it
    /// did not (e.g. after a restart).
    fn project(&self, id: &str, workload: &dyn Workload) -> Sandbox {
        let status = self.provider.get_status(workload);
        let expires_at = self
            .provider
            .get_expiration(workload)
            .unwrap_or(status.last_transition_at);
        let created_at = self
            .provider
            .get_created_at(workload)
            .unwrap_or(status.last_transition_at);
        let metadata = self.provider.metadata(workload);

        let desired = self.desired.lock().expect("desired spec mutex poisoned");
        let d = desired.get(id);

        Sandbox {
            id: id.to_string(),
            image: d.map(|d| d.image.clone()).unwrap_or_else(|| ImageRef {
                uri: String::new(),
                auth: None,
            }),
            entrypoint: d.map(|d| d.entrypoint.clone()).unwrap_or_default(),
            env: d.map(|d| d.env.clone()).unwrap_or_default(),
            resource_limits: d.map(|d| d.resource_limits.clone()).unwrap_or_default(),
            metadata,
            volume_mounts: d.map(|d| d.volume_mounts.clone()).unwrap_or_default(),
            extensions: d.map(|d| d.extensions.clone()).unwrap_or_default(),
            timeout_seconds: d.map(|d| d.timeout_seconds).unwrap_or(0),
            created_at,
            expires_at,
            status,
        }
    }

    fn project_pending(&self, snapshot: &PendingSnapshot) -> Sandbox {
        Sandbox {
            id: snapshot.id.clone(),
            image: snapshot.request.image.clone(),
            entrypoint: snapshot.request.entrypoint.clone(),
            env: filter_env(&snapshot.request.env),
            resource_limits: snapshot.request.resource_limits.clone(),
            metadata: snapshot.request.metadata.clone(),
            volume_mounts: snapshot.request.volume_mounts.clone(),
            extensions: snapshot.request.extensions.clone(),
            timeout_seconds: snapshot.request.timeout_seconds,
            created_at: snapshot.created_at,
            expires_at: snapshot.expires_at,
            status: crate::model::SandboxStatus {
                state: snapshot.state,
                reason: snapshot.reason.clone(),
                message: snapshot.message.clone(),
                last_transition_at: snapshot.created_at,
            },
        }
    }
}

/// Drop `null`-valued env entries; preserve empty-string values (§3/§8).
fn filter_env(env: &HashMap<String, Option<String>>) -> HashMap<String, String> {
    env.iter()
        .filter_map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SandboxState, SandboxStatus};
    use crate::provider::{CreateWorkloadParams, RuntimeProvider, Workload, WorkloadHandle};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct FakeWorkload {
        id: String,
        expires_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
        state: SandboxState,
    }

    impl Workload for FakeWorkload {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        objects: Mutex<HashMap<String, (DateTime<Utc>, DateTime<Utc>, SandboxState)>>,
        async_mode: bool,
        fail_create: AtomicBool,
    }

    #[async_trait]
    impl RuntimeProvider for FakeProvider {
        async fn create_workload(&self, params: CreateWorkloadParams) -> Result<WorkloadHandle, SandboxError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(SandboxError::ContainerStartFailed("boom".to_string()));
            }
            self.objects.lock().unwrap().insert(
                params.id.clone(),
                (Utc::now(), params.expires_at, SandboxState::Running),
            );
            Ok(WorkloadHandle { name: params.id, uid: "uid".to_string() })
        }

        async fn get_workload(&self, id: &str, _namespace: &str) -> Result<Option<Box<dyn Workload>>, SandboxError> {
            let objects = self.objects.lock().unwrap();
            Ok(objects.get(id).map(|(created_at, expires_at, state)| {
                Box::new(FakeWorkload {
                    id: id.to_string(),
                    expires_at: *expires_at,
                    created_at: *created_at,
                    state: *state,
                }) as Box<dyn Workload>
            }))
        }

        async fn list_workloads(&self, _namespace: &str, _label_selector: &str) -> Result<Vec<Box<dyn Workload>>, SandboxError> {
            let objects = self.objects.lock().unwrap();
            Ok(objects
                .iter()
                .map(|(id, (created_at, expires_at, state))| {
                    Box::new(FakeWorkload {
                        id: id.clone(),
                        expires_at: *expires_at,
                        created_at: *created_at,
                        state: *state,
                    }) as Box<dyn Workload>
                })
                .collect())
        }

        async fn delete_workload(&self, id: &str, _namespace: &str) -> Result<(), SandboxError> {
            self.objects
                .lock()
                .unwrap()
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| self.not_found_error(id))
        }

        fn not_found_error(&self, id: &str) -> SandboxError {
            SandboxError::DockerSandboxNotFound(id.to_string())
        }

        async fn update_expiration(&self, id: &str, _namespace: &str, expires_at: DateTime<Utc>) -> Result<(), SandboxError> {
            let mut objects = self.objects.lock().unwrap();
            let entry = objects.get_mut(id).ok_or_else(|| self.not_found_error(id))?;
            entry.1 = expires_at;
            Ok(())
        }

        fn get_expiration(&self, workload: &dyn Workload) -> Option<DateTime<Utc>> {
            Some(workload.as_any().downcast_ref::<FakeWorkload>().unwrap().expires_at)
        }

        fn get_created_at(&self, workload: &dyn Workload) -> Option<DateTime<Utc>> {
            Some(workload.as_any().downcast_ref::<FakeWorkload>().unwrap().created_at)
        }

        fn id_of(&self, workload: &dyn Workload) -> Option<String> {
            Some(workload.as_any().downcast_ref::<FakeWorkload>().unwrap().id.clone())
        }

        fn get_status(&self, workload: &dyn Workload) -> SandboxStatus {
            let w = workload.as_any().downcast_ref::<FakeWorkload>().unwrap();
            SandboxStatus {
                state: w.state,
                reason: String::new(),
                message: String::new(),
                last_transition_at: w.created_at,
            }
        }

        async fn get_endpoint_info(&self, _workload: &dyn Workload, port: u16, _resolve_internal: bool) -> Result<Option<String>, SandboxError> {
            Ok(Some(format!("10.0.0.1:{port}")))
        }

        fn metadata(&self, _workload: &dyn Workload) -> HashMap<String, String> {
            HashMap::new()
        }

        fn is_async_provisioning(&self) -> bool {
            self.async_mode
        }
    }

    fn request() -> CreateSandboxRequest {
        CreateSandboxRequest {
            image: ImageRef { uri: "alpine".into(), auth: None },
            entrypoint: vec!["true".into()],
            env: HashMap::from([
                ("KEEP".to_string(), Some("yes".to_string())),
                ("DROP".to_string(), None),
                ("EMPTY".to_string(), Some(String::new())),
            ]),
            resource_limits: HashMap::new(),
            metadata: HashMap::new(),
            volume_mounts: Vec::new(),
            extensions: HashMap::new(),
            timeout_seconds: 60,
        }
    }

    #[tokio::test]
    async fn env_null_is_dropped_empty_is_kept() {
        let provider = Arc::new(FakeProvider::default());
        let service = SandboxService::new(provider, "default".to_string(), "execd:latest".to_string(), std::time::Duration::from_secs(60));
        let sandbox = service.create_sandbox(request()).await.unwrap();
        assert_eq!(sandbox.env.get("KEEP"), Some(&"yes".to_string()));
        assert_eq!(sandbox.env.get("EMPTY"), Some(&String::new()));
        assert!(!sandbox.env.contains_key("DROP"));
    }

    #[tokio::test]
    async fn synchronous_create_then_get_round_trips() {
        let provider = Arc::new(FakeProvider::default());
        let service = SandboxService::new(provider, "default".to_string(), "execd:latest".to_string(), std::time::Duration::from_secs(60));
        let created = service.create_sandbox(request()).await.unwrap();
        let fetched = service.get_sandbox(&created.id).await.unwrap();
        assert_eq!(fetched.status.state, SandboxState::Running);
    }

    #[tokio::test]
    async fn delete_unknown_id_is_not_found_then_second_delete_is_also_not_found() {
        let provider = Arc::new(FakeProvider::default());
        let service = SandboxService::new(provider, "default".to_string(), "execd:latest".to_string(), std::time::Duration::from_secs(60));
        let created = service.create_sandbox(request()).await.unwrap();
        service.delete_sandbox(&created.id).await.unwrap();
        assert!(matches!(
            service.delete_sandbox(&created.id).await,
            Err(SandboxError::DockerSandboxNotFound(_))
        ));
    }

    #[tokio::test]
    async fn async_provisioning_failure_is_visible_then_swept() {
        let provider = Arc::new(FakeProvider { async_mode: true, ..Default::default() });
        provider.fail_create.store(true, Ordering::SeqCst);
        let service = SandboxService::new(provider, "default".to_string(), "execd:latest".to_string(), std::time::Duration::from_millis(50));

        let created = service.create_sandbox(request()).await.unwrap();
        assert_eq!(created.status.state, SandboxState::Pending);

        // Let the spawned provisioning task run and fail.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let fetched = service.get_sandbox(&created.id).await.unwrap();
        assert_eq!(fetched.status.state, SandboxState::Failed);
        assert_eq!(fetched.status.reason, "PROVISIONING_ERROR");
        assert_eq!(fetched.status.message, "boom");

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(matches!(
            service.get_sandbox(&created.id).await,
            Err(SandboxError::DockerSandboxNotFound(_))
        ));
    }

    #[tokio::test]
    async fn renew_rejects_non_future_expiration() {
        let provider = Arc::new(FakeProvider::default());
        let service = SandboxService::new(provider, "default".to_string(), "execd:latest".to_string(), std::time::Duration::from_secs(60));
        let created = service.create_sandbox(request()).await.unwrap();
        let result = service.renew_expiration(&created.id, Utc::now() - chrono::Duration::seconds(1)).await;
        assert!(matches!(result, Err(SandboxError::InvalidExpiration)));
    }

    #[tokio::test]
    async fn list_sorts_newest_first() {
        let provider = Arc::new(FakeProvider::default());
        let service = SandboxService::new(provider, "default".to_string(), "execd:latest".to_string(), std::time::Duration::from_secs(60));
        let first = service.create_sandbox(request()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = service.create_sandbox(request()).await.unwrap();

        let page = service.list_sandboxes(SandboxFilter::default(), Pagination::default()).await.unwrap();
        let ids: Vec<_> = page.items.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }
}
