//! Data model shared by the service, providers, and HTTP layer (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of a sandbox (§3 state set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SandboxState {
    Pending,
    Running,
    Paused,
    Terminated,
    Failed,
    Unknown,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxState::Pending => "Pending",
            SandboxState::Running => "Running",
            SandboxState::Paused => "Paused",
            SandboxState::Terminated => "Terminated",
            SandboxState::Failed => "Failed",
            SandboxState::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// Observed status projected from the backing runtime object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub state: SandboxState,
    pub reason: String,
    pub message: String,
    #[serde(rename = "lastTransitionAt")]
    pub last_transition_at: DateTime<Utc>,
}

/// Image reference plus optional registry credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ImageAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAuth {
    pub username: String,
    pub password: String,
}

/// One volume mount request (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    #[serde(rename = "hostPath")]
    pub host_path: String,
    #[serde(rename = "containerPath")]
    pub container_path: String,
    #[serde(rename = "readOnly", default)]
    pub read_only: bool,
}

/// A provisioned or pending sandbox (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub image: ImageRef,
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(rename = "resourceLimits", default)]
    pub resource_limits: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(rename = "volumeMounts", default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub extensions: HashMap<String, String>,
    #[serde(rename = "timeoutSeconds")]
    pub timeout_seconds: i64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    pub status: SandboxStatus,
}

/// Request body for `create_sandbox`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSandboxRequest {
    pub image: ImageRef,
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, Option<String>>,
    #[serde(rename = "resourceLimits", default)]
    pub resource_limits: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(rename = "volumeMounts", default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub extensions: HashMap<String, String>,
    #[serde(rename = "timeoutSeconds")]
    pub timeout_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSandboxResponse {
    #[serde(flatten)]
    pub sandbox: Sandbox,
}

/// A filter applied to `list_sandboxes` (§4.2 `matches_filter`).
#[derive(Debug, Clone, Default)]
pub struct SandboxFilter {
    pub state: Vec<SandboxState>,
    pub metadata: HashMap<String, String>,
}

impl SandboxFilter {
    /// OR over state, AND over metadata equality. An empty filter matches all.
    pub fn matches(&self, sandbox: &Sandbox) -> bool {
        let state_ok = self.state.is_empty() || self.state.contains(&sandbox.status.state);
        let metadata_ok = self
            .metadata
            .iter()
            .all(|(k, v)| sandbox.metadata.get(k) == Some(v));
        state_ok && metadata_ok
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaginationInfo {
    pub page: u32,
    #[serde(rename = "pageSize")]
    pub page_size: u32,
    #[serde(rename = "totalItems")]
    pub total_items: u64,
    #[serde(rename = "totalPages")]
    pub total_pages: u32,
    #[serde(rename = "hasNextPage")]
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListSandboxesResponse {
    pub items: Vec<Sandbox>,
    pub pagination: PaginationInfo,
}

/// Apply pagination to an already-filtered, already-sorted list (§4.8).
pub fn paginate(sandboxes: Vec<Sandbox>, pagination: Pagination) -> ListSandboxesResponse {
    let total_items = sandboxes.len() as u64;
    let page_size = pagination.page_size.max(1);
    let total_pages = if total_items == 0 {
        0
    } else {
        total_items.div_ceil(page_size as u64) as u32
    };
    let page = pagination.page.max(1);

    let start = ((page - 1) as u64 * page_size as u64) as usize;
    let end = (start + page_size as usize).min(sandboxes.len());
    let items = if start >= sandboxes.len() {
        Vec::new()
    } else {
        sandboxes[start..end].to_vec()
    };

    ListSandboxesResponse {
        items,
        pagination: PaginationInfo {
            page,
            page_size,
            total_items,
            total_pages,
            has_next_page: page < total_pages,
        },
    }
}
