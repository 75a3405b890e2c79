//! Black-box lifecycle tests against `SandboxService`, driven through an
//! in-memory `RuntimeProvider` so they run without a Docker daemon or a
//! Kubernetes cluster.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opensandbox_engine::error::SandboxError;
use opensandbox_engine::model::{
    CreateSandboxRequest, ImageRef, Pagination, SandboxFilter, SandboxState,
};
use opensandbox_engine::provider::{CreateWorkloadParams, RuntimeProvider, Workload, WorkloadHandle};
use opensandbox_engine::service::SandboxService;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct Entry {
    params: CreateWorkloadParams,
    created_at: DateTime<Utc>,
    paused: bool,
}

#[derive(Debug)]
struct FakeWorkload(Entry);

impl Workload for FakeWorkload {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Default)]
struct FakeProvider {
    entries: Mutex<HashMap<String, Entry>>,
}

fn downcast(workload: &dyn Workload) -> &FakeWorkload {
    workload.as_any().downcast_ref::<FakeWorkload>().expect("unexpected workload type")
}

#[async_trait]
impl RuntimeProvider for FakeProvider {
    async fn create_workload(&self, params: CreateWorkloadParams) -> Result<WorkloadHandle, SandboxError> {
        let id = params.id.clone();
        let entry = Entry { params, created_at: Utc::now(), paused: false };
        self.entries.lock().unwrap().insert(id.clone(), entry);
        Ok(WorkloadHandle { name: id.clone(), uid: id })
    }

    async fn get_workload(&self, id: &str, _namespace: &str) -> Result<Option<Box<dyn Workload>>, SandboxError> {
        Ok(self.entries.lock().unwrap().get(id).cloned().map(|e| Box::new(FakeWorkload(e)) as Box<dyn Workload>))
    }

    async fn list_workloads(&self, _namespace: &str, _label_selector: &str) -> Result<Vec<Box<dyn Workload>>, SandboxError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .values()
            .cloned()
            .map(|e| Box::new(FakeWorkload(e)) as Box<dyn Workload>)
            .collect())
    }

    async fn delete_workload(&self, id: &str, _namespace: &str) -> Result<(), SandboxError> {
        match self.entries.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(self.not_found_error(id)),
        }
    }

    fn not_found_error(&self, id: &str) -> SandboxError {
        SandboxError::DockerSandboxNotFound(id.to_string())
    }

    async fn update_expiration(&self, id: &str, _namespace: &str, expires_at: DateTime<Utc>) -> Result<(), SandboxError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(id).ok_or_else(|| self.not_found_error(id))?;
        entry.params.expires_at = expires_at;
        Ok(())
    }

    fn get_expiration(&self, workload: &dyn Workload) -> Option<DateTime<Utc>> {
        Some(downcast(workload).0.params.expires_at)
    }

    fn get_created_at(&self, workload: &dyn Workload) -> Option<DateTime<Utc>> {
        Some(downcast(workload).0.created_at)
    }

    fn id_of(&self, workload: &dyn Workload) -> Option<String> {
        Some(downcast(workload).0.params.id.clone())
    }

    fn get_status(&self, workload: &dyn Workload) -> opensandbox_engine::model::SandboxStatus {
        let entry = &downcast(workload).0;
        let state = if entry.paused { SandboxState::Paused } else { SandboxState::Running };
        opensandbox_engine::model::SandboxStatus {
            state,
            reason: "OK".to_string(),
            message: String::new(),
            last_transition_at: Utc::now(),
        }
    }

    async fn get_endpoint_info(&self, workload: &dyn Workload, port: u16, _resolve_internal: bool) -> Result<Option<String>, SandboxError> {
        Ok(Some(format!("{}:{}", downcast(workload).0.params.id, port)))
    }

    fn metadata(&self, workload: &dyn Workload) -> HashMap<String, String> {
        opensandbox_engine::labels::strip_reserved(downcast(workload).0.params.labels.clone())
    }

    async fn pause_workload(&self, id: &str, _namespace: &str) -> Result<(), SandboxError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(id).ok_or_else(|| self.not_found_error(id))?;
        entry.paused = true;
        Ok(())
    }

    async fn resume_workload(&self, id: &str, _namespace: &str) -> Result<(), SandboxError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(id).ok_or_else(|| self.not_found_error(id))?;
        entry.paused = false;
        Ok(())
    }
}

fn request(timeout_seconds: i64) -> CreateSandboxRequest {
    CreateSandboxRequest {
        image: ImageRef { uri: "alpine:3.20".to_string(), auth: None },
        entrypoint: vec!["sleep".to_string(), "60".to_string()],
        env: HashMap::new(),
        resource_limits: HashMap::new(),
        metadata: HashMap::new(),
        volume_mounts: Vec::new(),
        extensions: HashMap::new(),
        timeout_seconds,
    }
}

fn service() -> std::sync::Arc<SandboxService<FakeProvider>> {
    SandboxService::new(
        std::sync::Arc::new(FakeProvider::default()),
        "default".to_string(),
        "opensandbox/execd:latest".to_string(),
        std::time::Duration::from_secs(300),
    )
}

#[tokio::test]
async fn full_lifecycle_create_pause_resume_renew_delete() {
    let svc = service();

    let created = svc.create_sandbox(request(300)).await.expect("create");
    assert_eq!(created.status.state, SandboxState::Running);

    let fetched = svc.get_sandbox(&created.id).await.expect("get");
    assert_eq!(fetched.id, created.id);

    let paused = svc.pause_sandbox(&created.id).await.expect("pause");
    assert_eq!(paused.status.state, SandboxState::Paused);

    let resumed = svc.resume_sandbox(&created.id).await.expect("resume");
    assert_eq!(resumed.status.state, SandboxState::Running);

    let new_expiry = Utc::now() + chrono::Duration::seconds(3600);
    let renewed = svc.renew_expiration(&created.id, new_expiry).await.expect("renew");
    assert_eq!(renewed.timestamp(), new_expiry.timestamp());

    svc.delete_sandbox(&created.id).await.expect("delete");
    let err = svc.get_sandbox(&created.id).await.unwrap_err();
    assert!(matches!(err, SandboxError::DockerSandboxNotFound(_)));
}

#[tokio::test]
async fn renew_expiration_is_strictly_increasing_or_rejected() {
    let svc = service();
    let created = svc.create_sandbox(request(300)).await.expect("create");

    let past = Utc::now() - chrono::Duration::seconds(10);
    let err = svc.renew_expiration(&created.id, past).await.unwrap_err();
    assert!(matches!(err, SandboxError::InvalidExpiration));

    let future = Utc::now() + chrono::Duration::seconds(120);
    svc.renew_expiration(&created.id, future).await.expect("future renewal succeeds");
}

#[tokio::test]
async fn list_filters_by_state_and_metadata() {
    let svc = service();
    let mut with_meta = request(300);
    with_meta.metadata.insert("project".to_string(), "t".to_string());
    let a = svc.create_sandbox(with_meta).await.expect("create a");
    let b = svc.create_sandbox(request(300)).await.expect("create b");
    svc.pause_sandbox(&b.id).await.expect("pause b");

    let filter = SandboxFilter {
        state: vec![SandboxState::Running],
        metadata: HashMap::from([("project".to_string(), "t".to_string())]),
    };
    let page = svc.list_sandboxes(filter, Pagination::default()).await.expect("list");
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].id, a.id);
}

#[tokio::test]
async fn list_pagination_splits_pages() {
    let svc = service();
    for _ in 0..5 {
        svc.create_sandbox(request(300)).await.expect("create");
    }

    let page1 = svc
        .list_sandboxes(SandboxFilter::default(), Pagination { page: 1, page_size: 2 })
        .await
        .expect("list page 1");
    assert_eq!(page1.items.len(), 2);
    assert_eq!(page1.pagination.total_pages, 3);
    assert!(page1.pagination.has_next_page);

    let page3 = svc
        .list_sandboxes(SandboxFilter::default(), Pagination { page: 3, page_size: 2 })
        .await
        .expect("list page 3");
    assert_eq!(page3.items.len(), 1);
    assert!(!page3.pagination.has_next_page);
}

#[tokio::test]
async fn get_endpoint_validates_port_range() {
    let svc = service();
    let created = svc.create_sandbox(request(300)).await.expect("create");

    let err = svc.get_endpoint(&created.id, 0, false).await.unwrap_err();
    assert!(matches!(err, SandboxError::InvalidPort(0)));

    let endpoint = svc.get_endpoint(&created.id, 8080, false).await.expect("endpoint");
    assert!(endpoint.contains("8080"));
}

#[tokio::test]
async fn delete_unknown_sandbox_is_not_found() {
    let svc = service();
    let err = svc.delete_sandbox("does-not-exist").await.unwrap_err();
    assert!(matches!(err, SandboxError::DockerSandboxNotFound(_)));
}
