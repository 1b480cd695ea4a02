//! HTTP surface of the relay
//!
//! Thin handlers over [`SessionManager`]; no session logic lives here.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /singlestream` | Start or join the session for one source |
//! | `POST /stop` | Tear a session down regardless of viewers |
//! | `POST /groupstream` | Start every source of a configured group |
//! | `GET /streams` | Active sessions |
//! | `GET /stats` | Manager counters and host metrics |
//! | `GET /ws` | WebSocket viewers, see [`crate::ws`] |
//! | `GET /hls/...` | Playlists and segments from the output root |

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hls_relay_config::SourceGroup;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::warn;

use crate::manager::SessionManager;
use crate::metrics::{collect_host_metrics, StatsResponse};
use crate::session::{ActiveStream, SessionError, SessionId};
use crate::ws::ws_handler;

/// Shared state passed to all request handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    /// Configured source groups, by group id
    pub groups: Arc<BTreeMap<String, SourceGroup>>,
    /// Fires when the service is stopping; open WebSockets close on it
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct SingleStreamRequest {
    #[serde(rename = "rtspUrl")]
    rtsp_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    #[serde(rename = "streamId")]
    stream_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GroupStreamRequest {
    #[serde(rename = "groupId")]
    group_id: Option<String>,
}

/// Map a connect failure to a status code and body.
fn connect_error_response(err: SessionError) -> Response {
    match err {
        SessionError::UnsupportedSource(_) => {
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to start stream: {}", other),
        )
            .into_response(),
    }
}

/// Handler for POST /singlestream
///
/// The reference taken here is held until a matching `/stop`.
async fn single_stream(
    State(state): State<AppState>,
    Json(request): Json<SingleStreamRequest>,
) -> Response {
    let Some(url) = request.rtsp_url.filter(|u| !u.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing rtspUrl").into_response();
    };

    match state.manager.connect(&url).await {
        Ok(ticket) => Json(ticket).into_response(),
        Err(err) => {
            warn!(source = %url, error = %err, "singlestream request failed");
            connect_error_response(err)
        }
    }
}

/// Handler for POST /stop
async fn stop_stream(
    State(state): State<AppState>,
    Json(request): Json<StopRequest>,
) -> Response {
    let id = request
        .stream_id
        .as_deref()
        .and_then(|raw| raw.parse::<SessionId>().ok());

    let stopped = match id {
        Some(id) => state.manager.stop(id).await,
        None => false,
    };
    if stopped {
        (StatusCode::OK, "Stream stopped").into_response()
    } else {
        (StatusCode::NOT_FOUND, "Stream not found").into_response()
    }
}

/// Handler for POST /groupstream
///
/// Connects every member of the group concurrently. Members that fail map
/// to `null` instead of failing the whole request.
async fn group_stream(
    State(state): State<AppState>,
    Json(request): Json<GroupStreamRequest>,
) -> Response {
    let Some(group) = request
        .group_id
        .as_deref()
        .and_then(|id| state.groups.get(id))
    else {
        return (StatusCode::BAD_REQUEST, "Invalid group ID").into_response();
    };

    let connects = group.iter().map(|(name, url)| {
        let manager = state.manager.clone();
        async move {
            let result = manager.connect(url).await;
            if let Err(e) = &result {
                warn!(member = %name, source = %url, error = %e, "group member failed");
            }
            (name.clone(), result.ok().map(|ticket| ticket.public_url))
        }
    });
    let urls: BTreeMap<String, Option<String>> =
        futures::future::join_all(connects).await.into_iter().collect();

    ([(header::CACHE_CONTROL, "no-cache")], Json(urls)).into_response()
}

/// Handler for GET /streams
async fn list_streams(State(state): State<AppState>) -> Json<Vec<ActiveStream>> {
    Json(state.manager.list_active().await)
}

/// Handler for GET /stats
async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let manager = state.manager.stats().await;
    let host = tokio::task::spawn_blocking(collect_host_metrics)
        .await
        .unwrap_or_default();
    Json(StatsResponse::new(manager, host))
}

/// Creates the axum Router with every relay endpoint
///
/// # Arguments
/// * `state` - Manager handle, groups and shutdown token
/// * `output_root` - Directory served under `/hls`
pub fn create_router(state: AppState, output_root: &Path) -> Router {
    let segments = Router::new()
        .nest_service("/hls", ServeDir::new(output_root))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ));

    Router::new()
        .route("/singlestream", post(single_stream))
        .route("/stop", post(stop_stream))
        .route("/groupstream", post(group_stream))
        .route("/streams", get(list_streams))
        .route("/stats", get(get_stats))
        .route("/ws", get(ws_handler))
        .merge(segments)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cleaner::CleanupPolicy;
    use crate::encode::EncoderCommand;
    use crate::manager::ManagerSettings;
    use crate::readiness::ReadinessPolicy;
    use crate::session::{OutputPaths, StreamTicket};
    use crate::source::SourceLocator;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// Writes the playlist straight away and idles until stopped.
    struct InstantEncoder;

    impl EncoderCommand for InstantEncoder {
        fn build(&self, _source: &SourceLocator, output: &OutputPaths) -> std::process::Command {
            let mut cmd = std::process::Command::new("sh");
            cmd.arg("-c")
                .arg("echo '#EXTM3U' > \"$1\"; exec sleep 60")
                .arg("encoder")
                .arg(&output.manifest);
            cmd
        }
    }

    fn setup() -> (Router, SessionManager, TempDir) {
        let root = TempDir::new().unwrap();
        let settings = ManagerSettings {
            output_root: root.path().to_path_buf(),
            manifest_name: "index.m3u8".to_string(),
            public_base_url: "http://relay.test/hls".to_string(),
            readiness: ReadinessPolicy {
                poll_interval: Duration::from_millis(20),
                timeout: Duration::from_secs(5),
            },
            cleanup: CleanupPolicy::new(Duration::from_millis(10), Duration::from_secs(1)),
            stop_timeout: Duration::from_secs(1),
        };
        let manager = SessionManager::start(settings, Arc::new(InstantEncoder));

        let mut lobby = SourceGroup::new();
        lobby.insert("door".to_string(), "rtsp://door/stream".to_string());
        lobby.insert("broken".to_string(), "ftp://nowhere/x".to_string());
        let mut groups = BTreeMap::new();
        groups.insert("lobby".to_string(), lobby);

        let state = AppState {
            manager: manager.clone(),
            groups: Arc::new(groups),
            shutdown: CancellationToken::new(),
        };
        (create_router(state, root.path()), manager, root)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_singlestream_then_stop() {
        let (app, manager, _root) = setup();

        let response = app
            .clone()
            .oneshot(post_json(
                "/singlestream",
                serde_json::json!({ "rtspUrl": "rtsp://cam1/stream" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ticket: StreamTicket = serde_json::from_str(&body_string(response).await).unwrap();
        assert!(ticket.public_url.ends_with("/index.m3u8"));

        let response = app
            .clone()
            .oneshot(get("/streams"))
            .await
            .unwrap();
        let streams: Vec<ActiveStream> =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].id, ticket.id);

        let response = app
            .clone()
            .oneshot(post_json(
                "/stop",
                serde_json::json!({ "streamId": ticket.id.to_string() }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "Stream stopped");

        let response = app
            .oneshot(post_json(
                "/stop",
                serde_json::json!({ "streamId": ticket.id.to_string() }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_singlestream_rejects_bad_input() {
        let (app, manager, _root) = setup();

        let response = app
            .clone()
            .oneshot(post_json("/singlestream", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post_json(
                "/singlestream",
                serde_json::json!({ "rtspUrl": "ftp://bad-scheme/x" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("Unsupported stream URL protocol"));
        assert!(manager.list_active().await.is_empty());

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_stop_with_garbage_id_is_not_found() {
        let (app, manager, _root) = setup();
        let response = app
            .oneshot(post_json("/stop", serde_json::json!({ "streamId": "nope" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "Stream not found");
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_groupstream_maps_failures_to_null() {
        let (app, manager, _root) = setup();

        let response = app
            .clone()
            .oneshot(post_json("/groupstream", serde_json::json!({ "groupId": "lobby" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );
        let urls: BTreeMap<String, Option<String>> =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(urls.len(), 2);
        assert!(urls["door"].is_some());
        assert!(urls["broken"].is_none());

        let response = app
            .oneshot(post_json("/groupstream", serde_json::json!({ "groupId": "attic" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_string(response).await, "Invalid group ID");

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_stats_reports_manager_counters() {
        let (app, manager, _root) = setup();
        let response = app.oneshot(get("/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stats: StatsResponse = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(stats.manager.active_sessions, 0);
        assert!(stats.timestamp_unix_ms > 0);
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_segments_are_served_without_caching() {
        let (app, manager, root) = setup();
        let dir = root.path().join("4f1c2b7e-93a4-4d0e-9f59-0c1d2e3f4a5b");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.m3u8"), "#EXTM3U\n").unwrap();

        let response = app
            .clone()
            .oneshot(get("/hls/4f1c2b7e-93a4-4d0e-9f59-0c1d2e3f4a5b/index.m3u8"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );
        assert_eq!(body_string(response).await, "#EXTM3U\n");

        let response = app.oneshot(get("/hls/missing/index.m3u8")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        manager.shutdown_all().await;
    }
}
