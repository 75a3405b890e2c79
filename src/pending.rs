//! Pending registry (C4): tracks sandboxes whose async provisioning has not
//! yet produced a runtime object, TTL-scoped so failed provisions are
//! eventually forgotten.

use crate::model::{CreateSandboxRequest, SandboxState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingStatus {
    Pending,
    Failed { reason: String, message: String },
}

pub struct PendingEntry {
    pub id: String,
    pub request: CreateSandboxRequest,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: PendingStatus,
    cleanup: Option<JoinHandle<()>>,
}

impl PendingEntry {
    pub fn state(&self) -> SandboxState {
        match self.status {
            PendingStatus::Pending => SandboxState::Pending,
            PendingStatus::Failed { .. } => SandboxState::Failed,
        }
    }

    pub fn reason(&self) -> &str {
        match &self.status {
            PendingStatus::Pending => "",
            PendingStatus::Failed { reason, .. } => reason,
        }
    }

    pub fn message(&self) -> &str {
        match &self.status {
            PendingStatus::Pending => "",
            PendingStatus::Failed { message, .. } => message,
        }
    }
}

/// Default cleanup TTL for failed pending records, overridable via
/// `PENDING_FAILURE_TTL`.
pub const DEFAULT_PENDING_FAILURE_TTL_SECONDS: u64 = 3600;

pub struct PendingRegistry {
    entries: Mutex<HashMap<String, PendingEntry>>,
    failure_ttl: std::time::Duration,
}

impl PendingRegistry {
    pub fn new(failure_ttl: std::time::Duration) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            failure_ttl,
        })
    }

    /// Insert a new pending record when async provisioning starts.
    pub fn insert(
        &self,
        id: String,
        request: CreateSandboxRequest,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) {
        let mut entries = self.entries.lock().expect("pending registry mutex poisoned");
        entries.insert(
            id.clone(),
            PendingEntry {
                id,
                request,
                created_at,
                expires_at,
                status: PendingStatus::Pending,
                cleanup: None,
            },
        );
    }

    /// Mark an entry failed and arm a cleanup timer scoped to the failure
    /// TTL so failed sandboxes do not accumulate.
    pub fn mark_failed(self: &std::sync::Arc<Self>, id: &str, reason: String, message: String) {
        let ttl = self.failure_ttl;
        let this = std::sync::Arc::clone(self);
        let cleanup_id = id.to_string();

        let mut entries = self.entries.lock().expect("pending registry mutex poisoned");
        if let Some(entry) = entries.get_mut(id) {
            entry.status = PendingStatus::Failed { reason, message };
            if let Some(old) = entry.cleanup.take() {
                old.abort();
            }
            entry.cleanup = Some(tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                this.remove(&cleanup_id);
            }));
        }
    }

    /// Remove the entry once the runtime object becomes authoritative.
    pub fn remove(&self, id: &str) {
        let mut entries = self.entries.lock().expect("pending registry mutex poisoned");
        if let Some(entry) = entries.remove(id) {
            if let Some(cleanup) = entry.cleanup {
                cleanup.abort();
            }
        }
    }

    pub fn get_reason_and_state(&self, id: &str) -> Option<(SandboxState, String)> {
        let entries = self.entries.lock().expect("pending registry mutex poisoned");
        entries.get(id).map(|e| (e.state(), e.reason().to_string()))
    }

    /// Snapshot a single entry, used by `get_sandbox` when no runtime object
    /// exists yet for the id.
    pub fn get(&self, id: &str) -> Option<PendingSnapshot> {
        let entries = self.entries.lock().expect("pending registry mutex poisoned");
        entries.get(id).map(|e| PendingSnapshot {
            id: e.id.clone(),
            request: e.request.clone(),
            created_at: e.created_at,
            expires_at: e.expires_at,
            state: e.state(),
            reason: e.reason().to_string(),
            message: e.message().to_string(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().expect("pending registry mutex poisoned").contains_key(id)
    }

    /// Snapshot all pending entries not shadowed by a runtime object, used
    /// by `list_sandboxes` (the caller filters out ids for which a runtime
    /// object exists, since the object wins).
    pub fn snapshot(&self) -> Vec<PendingSnapshot> {
        let entries = self.entries.lock().expect("pending registry mutex poisoned");
        entries
            .values()
            .map(|e| PendingSnapshot {
                id: e.id.clone(),
                request: e.request.clone(),
                created_at: e.created_at,
                expires_at: e.expires_at,
                state: e.state(),
                reason: e.reason().to_string(),
                message: e.message().to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    pub id: String,
    pub request: CreateSandboxRequest,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: SandboxState,
    pub reason: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn dummy_request() -> CreateSandboxRequest {
        CreateSandboxRequest {
            image: crate::model::ImageRef {
                uri: "alpine".into(),
                auth: None,
            },
            entrypoint: vec!["true".into()],
            env: HashMap::new(),
            resource_limits: HashMap::new(),
            metadata: HashMap::new(),
            volume_mounts: Vec::new(),
            extensions: HashMap::new(),
            timeout_seconds: 60,
        }
    }

    #[tokio::test]
    async fn success_removes_entry() {
        let registry = PendingRegistry::new(std::time::Duration::from_secs(3600));
        let now = Utc::now();
        registry.insert("sbx-1".to_string(), dummy_request(), now, now + chrono::Duration::seconds(60));
        assert!(registry.contains("sbx-1"));
        registry.remove("sbx-1");
        assert!(!registry.contains("sbx-1"));
    }

    #[tokio::test]
    async fn failure_is_visible_until_cleanup_fires() {
        let registry = PendingRegistry::new(std::time::Duration::from_millis(50));
        let now = Utc::now();
        registry.insert("sbx-2".to_string(), dummy_request(), now, now + chrono::Duration::seconds(60));
        registry.mark_failed("sbx-2", "PROVISIONING_ERROR".to_string(), "boom".to_string());

        let (state, reason) = registry.get_reason_and_state("sbx-2").unwrap();
        assert_eq!(state, SandboxState::Failed);
        assert_eq!(reason, "PROVISIONING_ERROR");

        let snapshot = registry.get("sbx-2").unwrap();
        assert_eq!(snapshot.message, "boom");

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert!(!registry.contains("sbx-2"));
    }
}
