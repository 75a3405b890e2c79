//! Typed error taxonomy for the sandbox orchestration engine (§7).
//!
//! Providers and the service return [`SandboxError`]; the HTTP layer maps
//! `status()` to a response code and serializes `code()`/`Display` into the
//! `{code, message}` envelope.

use hyper::StatusCode;

/// Canonical error codes, stable on the wire. Mirrors
/// `SandboxErrorCodes` in the service this engine replaces.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    // --- Client input (400) ---
    #[error("{0}")]
    InvalidParameter(String),
    #[error("metadata key '{0}' is not a valid label key")]
    InvalidMetadataLabel(String),
    #[error("entrypoint must be a non-empty sequence of non-empty strings")]
    InvalidEntrypoint,
    #[error("port {0} is out of range 1-65535")]
    InvalidPort(i64),
    #[error("expiration must be strictly in the future")]
    InvalidExpiration,
    #[error("volume mount host path '{0}' does not exist")]
    InvalidVolumeMount(String),

    // --- Auth (401) ---
    #[error("missing API key")]
    MissingApiKey,

    // --- Not found (404) ---
    #[error("sandbox '{0}' not found")]
    DockerSandboxNotFound(String),
    #[error("sandbox '{0}' not found")]
    KubernetesSandboxNotFound(String),
    #[error("pod IP not yet available for sandbox '{0}'")]
    PodIpNotAvailable(String),

    // --- Conflict (409) ---
    #[error("sandbox '{0}' is not running")]
    SandboxNotRunning(String),
    #[error("sandbox '{0}' is not paused")]
    SandboxNotPaused(String),

    // --- Runtime failure (500) ---
    #[error("failed to pull image '{0}': {1}")]
    ImagePullFailed(String, String),
    #[error("failed to start sandbox: {0}")]
    ContainerStartFailed(String),
    #[error("failed to distribute execd: {0}")]
    ExecdDistributionFailed(String),
    #[error("failed to install bootstrap script: {0}")]
    BootstrapInstallFailed(String),
    #[error("pod failed: {0}")]
    PodFailed(String),
    #[error("runtime API error: {0}")]
    KubernetesApiError(String),
    #[error("failed to query sandbox: {0}")]
    DockerQueryFailed(String),
    #[error("failed to delete sandbox: {0}")]
    SandboxDeleteFailed(String),
    #[error("failed to pause sandbox: {0}")]
    SandboxPauseFailed(String),
    #[error("failed to resume sandbox: {0}")]
    SandboxResumeFailed(String),
    #[error("expiration was not extended: {0}")]
    ExpirationNotExtended(String),

    // --- Timeout (504) ---
    #[error("timed out waiting for pod to become ready")]
    PodReadyTimeout,

    // --- Unavailable (503) ---
    #[error("docker daemon initialization failed: {0}")]
    DockerInitializationError(String),
    #[error("kubernetes client initialization failed: {0}")]
    K8sInitializationError(String),

    // --- Unsupported (501) ---
    #[error("operation not supported by this runtime")]
    ApiNotSupported,
    #[error("endpoint resolution unavailable for this network mode")]
    NetworkModeEndpointUnavailable,

    // --- Fallback ---
    #[error("an unexpected error occurred: {0}")]
    Unknown(String),
}

impl SandboxError {
    /// Stable error code, matches the original taxonomy's `DOMAIN::NAME` shape.
    pub fn code(&self) -> &'static str {
        use SandboxError::*;
        match self {
            InvalidParameter(_) => "SANDBOX::INVALID_PARAMETER",
            InvalidMetadataLabel(_) => "SANDBOX::INVALID_METADATA_LABEL",
            InvalidEntrypoint => "DOCKER::INVALID_ENTRYPOINT",
            InvalidPort(_) => "DOCKER::INVALID_PORT",
            InvalidExpiration => "DOCKER::INVALID_EXPIRATION",
            InvalidVolumeMount(_) => "DOCKER::INVALID_VOLUME_MOUNT",
            MissingApiKey => "GENERAL::MISSING_API_KEY",
            DockerSandboxNotFound(_) => "DOCKER::SANDBOX_NOT_FOUND",
            KubernetesSandboxNotFound(_) => "KUBERNETES::SANDBOX_NOT_FOUND",
            PodIpNotAvailable(_) => "KUBERNETES::POD_IP_NOT_AVAILABLE",
            SandboxNotRunning(_) => "DOCKER::SANDBOX_NOT_RUNNING",
            SandboxNotPaused(_) => "DOCKER::SANDBOX_NOT_PAUSED",
            ImagePullFailed(..) => "DOCKER::SANDBOX_IMAGE_PULL_FAILED",
            ContainerStartFailed(_) => "DOCKER::SANDBOX_START_FAILED",
            ExecdDistributionFailed(_) => "DOCKER::SANDBOX_EXECD_DISTRIBUTION_FAILED",
            BootstrapInstallFailed(_) => "DOCKER::SANDBOX_BOOTSTRAP_INSTALL_FAILED",
            PodFailed(_) => "KUBERNETES::POD_FAILED",
            KubernetesApiError(_) => "KUBERNETES::API_ERROR",
            DockerQueryFailed(_) => "DOCKER::SANDBOX_QUERY_FAILED",
            SandboxDeleteFailed(_) => "DOCKER::SANDBOX_DELETE_FAILED",
            SandboxPauseFailed(_) => "DOCKER::SANDBOX_PAUSE_FAILED",
            SandboxResumeFailed(_) => "DOCKER::SANDBOX_RESUME_FAILED",
            ExpirationNotExtended(_) => "DOCKER::EXPIRATION_NOT_EXTENDED",
            PodReadyTimeout => "KUBERNETES::POD_READY_TIMEOUT",
            DockerInitializationError(_) => "DOCKER::INITIALIZATION_ERROR",
            K8sInitializationError(_) => "KUBERNETES::INITIALIZATION_ERROR",
            ApiNotSupported => "SANDBOX::API_NOT_SUPPORTED",
            NetworkModeEndpointUnavailable => "DOCKER::NETWORK_MODE_ENDPOINT_UNAVAILABLE",
            Unknown(_) => "SANDBOX::UNKNOWN_ERROR",
        }
    }

    /// HTTP status category this code maps to (§7).
    pub fn status(&self) -> StatusCode {
        use SandboxError::*;
        match self {
            InvalidParameter(_)
            | InvalidMetadataLabel(_)
            | InvalidEntrypoint
            | InvalidPort(_)
            | InvalidExpiration
            | InvalidVolumeMount(_) => StatusCode::BAD_REQUEST,
            MissingApiKey => StatusCode::UNAUTHORIZED,
            DockerSandboxNotFound(_) | KubernetesSandboxNotFound(_) | PodIpNotAvailable(_) => {
                StatusCode::NOT_FOUND
            }
            SandboxNotRunning(_) | SandboxNotPaused(_) => StatusCode::CONFLICT,
            ImagePullFailed(..)
            | ContainerStartFailed(_)
            | ExecdDistributionFailed(_)
            | BootstrapInstallFailed(_)
            | PodFailed(_)
            | KubernetesApiError(_)
            | DockerQueryFailed(_)
            | SandboxDeleteFailed(_)
            | SandboxPauseFailed(_)
            | SandboxResumeFailed(_)
            | ExpirationNotExtended(_)
            | Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PodReadyTimeout => StatusCode::GATEWAY_TIMEOUT,
            DockerInitializationError(_) | K8sInitializationError(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiNotSupported | NetworkModeEndpointUnavailable => StatusCode::NOT_IMPLEMENTED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let e = SandboxError::DockerSandboxNotFound("abc".into());
        assert_eq!(e.status(), StatusCode::NOT_FOUND);
        assert_eq!(e.code(), "DOCKER::SANDBOX_NOT_FOUND");

        let e = SandboxError::KubernetesSandboxNotFound("abc".into());
        assert_eq!(e.status(), StatusCode::NOT_FOUND);
        assert_eq!(e.code(), "KUBERNETES::SANDBOX_NOT_FOUND");
    }

    #[test]
    fn timeout_maps_to_504() {
        assert_eq!(SandboxError::PodReadyTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn unsupported_maps_to_501() {
        assert_eq!(SandboxError::ApiNotSupported.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
