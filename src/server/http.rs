//! HTTP and WebSocket surface
//!
//! Routes:
//! - `GET /healthz`
//! - `GET /apis/projects` list, `POST /apis/projects` create
//! - `GET /apis/projects/watch` WebSocket watch stream
//! - `GET|PUT|DELETE /apis/projects/{name}`
//!
//! Callers authenticate with `Authorization: Bearer sess-...`. A missing or
//! invalid token leaves the request without a user.

use crate::auth::SessionToken;
use crate::cache::{CacheHealth, CloseReason, EventKind, WatchEvent};
use crate::projects::Project;
use crate::server::registry::{ApiError, ListOptions, ProjectRegistry, RegistryWatch, RequestContext};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const BEARER_PREFIX: &str = "Bearer ";

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<ProjectRegistry>,
    pub token_secret: Arc<Vec<u8>>,
}

impl HttpState {
    pub fn new(registry: Arc<ProjectRegistry>, token_secret: Vec<u8>) -> Self {
        Self {
            registry,
            token_secret: Arc::new(token_secret),
        }
    }

    /// Resolve the caller from the `Authorization` header
    fn context(&self, headers: &HeaderMap) -> RequestContext {
        let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
            return RequestContext::anonymous();
        };
        let Some(token) = value.strip_prefix(BEARER_PREFIX) else {
            return RequestContext::anonymous();
        };

        match SessionToken::parse(token.trim(), &self.token_secret) {
            Ok(token) => RequestContext::from_token(&token),
            Err(e) => {
                debug!(error = %e, "Rejected session token");
                RequestContext::anonymous()
            }
        }
    }
}

/// Create the HTTP router
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/apis/projects", get(list_handler).post(create_handler))
        .route("/apis/projects/watch", get(watch_handler))
        .route(
            "/apis/projects/{name}",
            get(get_handler).put(update_handler).delete(delete_handler),
        )
        .with_state(state)
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) | ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ApiError::Forbidden(_) => "Forbidden",
            ApiError::NotFound(_) => "NotFound",
            ApiError::AlreadyExists(_) => "AlreadyExists",
            ApiError::Conflict(_) => "Conflict",
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Unavailable(_) => "ServiceUnavailable",
            ApiError::Internal(_) => "InternalError",
        }
    }
}

/// Error body
#[derive(Debug, Serialize)]
struct Status {
    kind: &'static str,
    status: &'static str,
    reason: &'static str,
    message: String,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        let body = Status {
            kind: "Status",
            status: "Failure",
            reason: self.reason(),
            message: self.to_string(),
            code: code.as_u16(),
        };
        (code, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    label_selector: Option<String>,
    field_selector: Option<String>,
    resource_version: Option<String>,
}

impl ListQuery {
    fn options(&self) -> Result<ListOptions, ApiError> {
        ListOptions::parse(
            self.label_selector.as_deref(),
            self.field_selector.as_deref(),
            self.resource_version.as_deref(),
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: CacheHealth,
    revision: u64,
    watchers: usize,
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let cache = state.registry.cache();
    let health = Health {
        status: cache.health(),
        revision: cache.revision(),
        watchers: cache.watcher_count(),
    };
    let code = match health.status {
        CacheHealth::Fresh | CacheHealth::Stale => StatusCode::OK,
        CacheHealth::Degraded | CacheHealth::Stopped => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(health))
}

async fn list_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = state.context(&headers);
    let list = state.registry.list(&ctx, &query.options()?)?;
    Ok(Json(list))
}

async fn watch_handler(
    ws: WebSocketUpgrade,
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let ctx = state.context(&headers);
    // Register before upgrading so the baseline is fixed at request time
    let watch = state.registry.watch(&ctx, query.options()?).await?;
    Ok(ws.on_upgrade(move |socket| stream_watch(socket, watch)))
}

async fn get_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Project>, ApiError> {
    state.context(&headers).require_user()?;
    Ok(Json(state.registry.get(&name).await?))
}

async fn create_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(project): Json<Project>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = state.context(&headers);
    let principal = ctx.require_user()?;
    let created = state.registry.create(project).await?;
    info!(project = %created.name, revision = created.revision, principal = %principal, "Project created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(mut project): Json<Project>,
) -> Result<Json<Project>, ApiError> {
    state.context(&headers).require_user()?;
    if project.name.is_empty() {
        project.name = name.clone();
    }
    if project.name != name {
        return Err(ApiError::BadRequest(format!(
            "project name '{}' does not match path '{}'",
            project.name, name
        )));
    }
    Ok(Json(state.registry.update(project).await?))
}

async fn delete_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Project>, ApiError> {
    let ctx = state.context(&headers);
    let principal = ctx.require_user()?;
    let deleted = state.registry.delete(&name).await?;
    info!(project = %deleted.name, principal = %principal, "Project deleted");
    Ok(Json(deleted))
}

/// One frame of a watch stream
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
enum WatchFrame<'a> {
    Added { object: &'a Project },
    Modified { object: &'a Project },
    Deleted { object: &'a Project },
    Error { reason: CloseReason, message: String },
}

impl<'a> WatchFrame<'a> {
    fn event(event: &'a WatchEvent) -> Self {
        let object = event.project.as_ref();
        match event.kind {
            EventKind::Added => WatchFrame::Added { object },
            EventKind::Modified => WatchFrame::Modified { object },
            EventKind::Deleted => WatchFrame::Deleted { object },
        }
    }

    fn closed(reason: CloseReason) -> Self {
        WatchFrame::Error {
            reason,
            message: reason.to_string(),
        }
    }

    fn to_message(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                warn!(error = %e, "Failed to encode watch frame");
                None
            }
        }
    }
}

async fn stream_watch(socket: WebSocket, mut watch: RegistryWatch) {
    let (mut sender, mut receiver) = socket.split();
    let watcher_id = watch.id();
    debug!(watcher_id = %watcher_id, "Watch stream started");

    loop {
        tokio::select! {
            event = watch.next() => {
                let Some(event) = event else {
                    let reason = watch.close_reason().unwrap_or(CloseReason::Cancelled);
                    if let Some(frame) = WatchFrame::closed(reason).to_message() {
                        let _ = sender.send(frame).await;
                    }
                    let _ = sender.send(Message::Close(None)).await;
                    debug!(watcher_id = %watcher_id, reason = %reason, "Watch stream closed by cache");
                    break;
                };
                let Some(frame) = WatchFrame::event(&event).to_message() else {
                    continue;
                };
                if sender.send(frame).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(watcher_id = %watcher_id, error = %e, "WebSocket error");
                        break;
                    }
                    // Ping/pong handled by axum; clients have nothing else to say
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    watch.stop();
    debug!(watcher_id = %watcher_id, "Watch stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Grant, Principal};
    use crate::cache::{AuthorizationCache, CacheConfig};
    use crate::storage::{MemoryGrantStore, MemoryProjectStore, ProjectStore};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_watch_frame_shape() {
        let event = WatchEvent {
            kind: EventKind::Added,
            project: Arc::new(Project::new("web").with_revision(3)),
            revision: 7,
        };
        let json: serde_json::Value = serde_json::to_value(WatchFrame::event(&event)).unwrap();
        assert_eq!(json["type"], "ADDED");
        assert_eq!(json["object"]["name"], "web");
        assert_eq!(json["object"]["revision"], 3);

        let json = serde_json::to_value(WatchFrame::closed(CloseReason::ResyncRequired)).unwrap();
        assert_eq!(json["type"], "ERROR");
        assert_eq!(json["reason"], "resync_required");
    }

    async fn serve_router(token_secret: &[u8]) -> (std::net::SocketAddr, Arc<MemoryProjectStore>) {
        let grants = Arc::new(MemoryGrantStore::new().with_grants([Grant::user_cluster("alice", "admin")]));
        let projects = Arc::new(MemoryProjectStore::new().with_projects([Project::new("old")]));
        let cache = AuthorizationCache::start(CacheConfig::new(), grants, projects.clone())
            .await
            .unwrap();
        let registry = Arc::new(ProjectRegistry::new(cache, projects.clone()));
        let app = create_router(HttpState::new(registry, token_secret.to_vec()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (addr, projects)
    }

    async fn send(addr: std::net::SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_crud_routes_require_user() {
        let secret = b"test-secret";
        let (addr, projects) = serve_router(secret).await;

        for method in ["GET", "DELETE"] {
            let response = send(
                addr,
                &format!("{} /apis/projects/old HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n", method),
            )
            .await;
            assert!(response.starts_with("HTTP/1.1 403"), "{}: {}", method, response);
        }
        assert!(projects.get("old").await.is_ok());

        let token = SessionToken::create(Principal::user("alice"), vec![], secret).unwrap();
        let response = send(
            addr,
            &format!(
                "DELETE /apis/projects/old HTTP/1.1\r\nHost: test\r\nAuthorization: Bearer {}\r\nConnection: close\r\n\r\n",
                token
            ),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(projects.get("old").await.is_err());
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(ApiError::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::Conflict("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiError::AlreadyExists("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(ApiError::Unavailable("x".into()).reason(), "ServiceUnavailable");
    }
}
