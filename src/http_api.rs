//! HTTP API server (§A.5): a minimal collaborator shim mapping the seven
//! sandbox operations onto routes. Not the focus of this crate — the auth
//! middleware and API-key store it stands in for are out-of-scope
//! collaborators (§1); this module only checks a single configured key.

use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::SandboxError;
use crate::model::{CreateSandboxRequest, CreateSandboxResponse, Pagination, SandboxFilter, SandboxState};
use crate::provider::RuntimeProvider;
use crate::service::SandboxService;

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

const API_KEY_HEADER: &str = "OPEN-SANDBOX-API-KEY";

/// Shared state for the HTTP server: the sandbox service plus the single
/// configured API key (`None` disables the auth check entirely).
pub struct AppState<P: RuntimeProvider> {
    pub service: Arc<SandboxService<P>>,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenewRequest {
    #[serde(rename = "expiresAt")]
    expires_at: DateTime<Utc>,
}

async fn handle_request<P: RuntimeProvider + 'static>(
    req: Request<Incoming>,
    state: Arc<AppState<P>>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if segments.as_slice() != ["health"] {
        if let Err(resp) = check_api_key(&req, &state) {
            return Ok(resp);
        }
    }

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["health"]) => json_response(StatusCode::OK, &serde_json::json!({"status": "ok"})),

        (Method::POST, ["sandboxes"]) => handle_create_sandbox(req, &state).await,
        (Method::GET, ["sandboxes"]) => handle_list_sandboxes(&req, &state).await,
        (Method::GET, ["sandboxes", id]) => handle_get_sandbox(id, &state).await,
        (Method::DELETE, ["sandboxes", id]) => handle_delete_sandbox(id, &state).await,
        (Method::POST, ["sandboxes", id, "pause"]) => handle_pause_sandbox(id, &state).await,
        (Method::POST, ["sandboxes", id, "resume"]) => handle_resume_sandbox(id, &state).await,
        (Method::POST, ["sandboxes", id, "renew"]) => handle_renew_expiration(req, id, &state).await,
        (Method::GET, ["sandboxes", id, "endpoint"]) => handle_get_endpoint(&req, id, &state).await,

        _ => json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({"code": "GENERAL::NOT_FOUND", "message": "no such route"}),
        ),
    };

    Ok(response)
}

fn check_api_key<P: RuntimeProvider>(
    req: &Request<Incoming>,
    state: &AppState<P>,
) -> Result<(), Response<BoxBody>> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(error_response(&SandboxError::MissingApiKey))
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full(body))
        .unwrap()
}

/// `{code, message}` error envelope (§A.5), matching the exception handler
/// this module stands in for.
fn error_response(err: &SandboxError) -> Response<BoxBody> {
    json_response(
        err.status(),
        &serde_json::json!({"code": err.code(), "message": err.to_string()}),
    )
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, Response<BoxBody>> {
    let body_bytes = req
        .collect()
        .await
        .map_err(|_| error_response(&SandboxError::InvalidParameter("failed to read request body".to_string())))?
        .to_bytes();

    serde_json::from_slice(&body_bytes)
        .map_err(|e| error_response(&SandboxError::InvalidParameter(format!("invalid JSON: {e}"))))
}

/// Decode a `application/x-www-form-urlencoded` query string into ordered
/// key/value pairs, preserving duplicate keys (repeated `state=` filters).
fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = percent_decode(parts.next().unwrap_or(""));
            let value = percent_decode(parts.next().unwrap_or(""));
            (key, value)
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 3 <= bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_state(s: &str) -> Option<SandboxState> {
    match s {
        "Pending" => Some(SandboxState::Pending),
        "Running" => Some(SandboxState::Running),
        "Paused" => Some(SandboxState::Paused),
        "Terminated" => Some(SandboxState::Terminated),
        "Failed" => Some(SandboxState::Failed),
        "Unknown" => Some(SandboxState::Unknown),
        _ => None,
    }
}

fn parse_list_query(query: &str) -> (SandboxFilter, Pagination) {
    let mut filter = SandboxFilter::default();
    let mut pagination = Pagination::default();

    for (key, value) in parse_query(query) {
        match key.as_str() {
            "state" => {
                if let Some(state) = parse_state(&value) {
                    filter.state.push(state);
                }
            }
            "metadata" => {
                for pair in value.split(',') {
                    if let Some((k, v)) = pair.split_once('=') {
                        filter.metadata.insert(k.to_string(), v.to_string());
                    }
                }
            }
            "page" => {
                if let Ok(p) = value.parse() {
                    pagination.page = p;
                }
            }
            "pageSize" => {
                if let Ok(p) = value.parse() {
                    pagination.page_size = p;
                }
            }
            _ => {}
        }
    }

    (filter, pagination)
}

async fn handle_create_sandbox<P: RuntimeProvider + 'static>(
    req: Request<Incoming>,
    state: &AppState<P>,
) -> Response<BoxBody> {
    let request: CreateSandboxRequest = match read_json_body(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state.service.create_sandbox(request).await {
        Ok(sandbox) => json_response(StatusCode::CREATED, &CreateSandboxResponse { sandbox }),
        Err(e) => error_response(&e),
    }
}

async fn handle_list_sandboxes<P: RuntimeProvider + 'static>(
    req: &Request<Incoming>,
    state: &AppState<P>,
) -> Response<BoxBody> {
    let (filter, pagination) = parse_list_query(req.uri().query().unwrap_or(""));
    match state.service.list_sandboxes(filter, pagination).await {
        Ok(page) => json_response(StatusCode::OK, &page),
        Err(e) => error_response(&e),
    }
}

async fn handle_get_sandbox<P: RuntimeProvider + 'static>(id: &str, state: &AppState<P>) -> Response<BoxBody> {
    match state.service.get_sandbox(id).await {
        Ok(sandbox) => json_response(StatusCode::OK, &sandbox),
        Err(e) => error_response(&e),
    }
}

async fn handle_delete_sandbox<P: RuntimeProvider + 'static>(id: &str, state: &AppState<P>) -> Response<BoxBody> {
    match state.service.delete_sandbox(id).await {
        Ok(()) => Response::builder().status(StatusCode::NO_CONTENT).body(full("")).unwrap(),
        Err(e) => error_response(&e),
    }
}

async fn handle_pause_sandbox<P: RuntimeProvider + 'static>(id: &str, state: &AppState<P>) -> Response<BoxBody> {
    match state.service.pause_sandbox(id).await {
        Ok(sandbox) => json_response(StatusCode::OK, &sandbox),
        Err(e) => error_response(&e),
    }
}

async fn handle_resume_sandbox<P: RuntimeProvider + 'static>(id: &str, state: &AppState<P>) -> Response<BoxBody> {
    match state.service.resume_sandbox(id).await {
        Ok(sandbox) => json_response(StatusCode::OK, &sandbox),
        Err(e) => error_response(&e),
    }
}

async fn handle_renew_expiration<P: RuntimeProvider + 'static>(
    req: Request<Incoming>,
    id: &str,
    state: &AppState<P>,
) -> Response<BoxBody> {
    let body: RenewRequest = match read_json_body(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match state.service.renew_expiration(id, body.expires_at).await {
        Ok(expires_at) => json_response(StatusCode::OK, &serde_json::json!({"expiresAt": expires_at})),
        Err(e) => error_response(&e),
    }
}

async fn handle_get_endpoint<P: RuntimeProvider + 'static>(
    req: &Request<Incoming>,
    id: &str,
    state: &AppState<P>,
) -> Response<BoxBody> {
    let params = parse_query(req.uri().query().unwrap_or(""));
    let port = params
        .iter()
        .find(|(k, _)| k == "port")
        .and_then(|(_, v)| v.parse::<u16>().ok());
    let resolve_internal = params.iter().any(|(k, v)| k == "internal" && v == "true");

    let Some(port) = port else {
        return error_response(&SandboxError::InvalidParameter(
            "port query parameter is required".to_string(),
        ));
    };

    match state.service.get_endpoint(id, port, resolve_internal).await {
        Ok(endpoint) => json_response(StatusCode::OK, &serde_json::json!({"endpoint": endpoint})),
        Err(e) => error_response(&e),
    }
}

/// Run the HTTP API server.
pub async fn run_server<P: RuntimeProvider + 'static>(
    addr: SocketAddr,
    state: Arc<AppState<P>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "sandbox orchestration engine listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %err, "error serving connection");
            }
        });
    }
}
