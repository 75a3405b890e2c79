//! Well-known label/annotation keys and the reserved-prefix convention (C1).

use uuid::Uuid;

/// Label carrying the sandbox id, stamped on every runtime object.
pub const SANDBOX_ID_LABEL: &str = "opensandbox.io/id";
/// Label carrying the RFC-3339 UTC absolute expiration.
pub const SANDBOX_EXPIRES_AT_LABEL: &str = "opensandbox.io/expires-at";
/// Bridge-mode host port mapped to container port 44772 (execd proxy).
pub const SANDBOX_EMBEDDING_PROXY_PORT_LABEL: &str = "opensandbox.io/embedding-proxy-port";
/// Bridge-mode host port mapped to container port 8080 (sandbox HTTP).
pub const SANDBOX_HTTP_PORT_LABEL: &str = "opensandbox.io/http-port";
/// Annotation on BatchSandbox carrying a JSON array of pod IPs.
pub const SANDBOX_ENDPOINTS_ANNOTATION: &str = "sandbox.opensandbox.io/endpoints";

/// Prefix reserved for control-plane-owned labels; user metadata keys
/// starting with this prefix are rejected on create and stripped on read.
pub const RESERVED_PREFIX: &str = "opensandbox.io/";

/// Container/pod port that serves the execd wire protocol.
pub const EXECD_PORT: u16 = 44772;
/// Container/pod port that serves the sandbox's own HTTP endpoint.
pub const HTTP_PORT: u16 = 8080;

/// Generate a new sandbox id (UUIDv4).
pub fn new_sandbox_id() -> String {
    Uuid::new_v4().to_string()
}

/// Docker container name for a sandbox id.
pub fn container_name(id: &str) -> String {
    format!("sandbox-{id}")
}

/// Strip any entry whose key starts with [`RESERVED_PREFIX`] from a label
/// map before projecting it back to the caller as user metadata.
pub fn strip_reserved(
    labels: impl IntoIterator<Item = (String, String)>,
) -> std::collections::HashMap<String, String> {
    labels
        .into_iter()
        .filter(|(k, _)| !k.starts_with(RESERVED_PREFIX))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_only_reserved_keys() {
        let mut labels = std::collections::HashMap::new();
        labels.insert(SANDBOX_ID_LABEL.to_string(), "abc".to_string());
        labels.insert(SANDBOX_EXPIRES_AT_LABEL.to_string(), "later".to_string());
        labels.insert("project".to_string(), "t".to_string());

        let projected = strip_reserved(labels);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected.get("project"), Some(&"t".to_string()));
    }

    #[test]
    fn container_name_format() {
        assert_eq!(container_name("abc-123"), "sandbox-abc-123");
    }
}
