use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use palaver_protocol::PalaverConfig;
use serde_json::json;
use tower_http::services::ServeDir;

use crate::client;
use crate::group::Groups;

/// Shared application state.
pub struct AppState {
    pub config: PalaverConfig,
    pub groups: Groups,
    pub started_at: std::time::Instant,
}

impl AppState {
    /// Canonical base URL advertised in group statuses.
    pub fn base_url(&self) -> String {
        if let Some(host) = &self.config.server.canonical_host {
            return format!("https://{host}");
        }
        let scheme = if self.config.server.insecure {
            "http"
        } else {
            "https"
        };
        format!(
            "{scheme}://{}:{}",
            self.config.server.bind, self.config.server.port
        )
    }
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let serve_dir = ServeDir::new(&state.config.server.web_root);

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/public-groups.json", get(public_groups))
        .route("/group/{*name}", get(group_page))
        .route("/api/health", get(health_check))
        .with_state(Arc::clone(&state))
        .fallback_service(serve_dir)
        .layer(axum::middleware::from_fn(security_headers))
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client::handle_ws(state, socket))
}

async fn public_groups(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.groups.public_statuses(&state.base_url()))
}

/// `GET /group/{name}.status` serves the pre-connection status JSON;
/// any other group path serves the client application shell.
async fn group_page(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    if let Some(name) = name.strip_suffix(".status") {
        return match state.groups.status_of(name, &state.base_url()) {
            Some(status) => Json(status).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "no such group" })),
            )
                .into_response(),
        };
    }

    let index = std::path::Path::new(&state.config.server.web_root).join("index.html");
    match tokio::fs::read(&index).await {
        Ok(contents) => (
            [("content-type", HeaderValue::from_static("text/html"))],
            contents,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "no client application installed").into_response(),
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "palaver-web-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("lobby.json"),
            r#"{"public": true, "displayName": "Lobby", "allow-anonymous": true, "presenter": [{}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("private.json"),
            r#"{"allow-anonymous": true, "presenter": [{}]}"#,
        )
        .unwrap();

        let mut config = PalaverConfig::default();
        config.groups.dir = dir.to_str().unwrap().to_owned();
        config.server.canonical_host = Some("sfu.example.org".to_owned());
        let api = Arc::new(crate::engine::build_api().unwrap());
        let groups = Groups::new(api, &config.groups.dir, config.groups.chat_history);
        Arc::new(AppState {
            config,
            groups,
            started_at: std::time::Instant::now(),
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn public_groups_lists_only_public() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/public-groups.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let names: Vec<_> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["lobby"]);
        assert_eq!(json[0]["displayName"], "Lobby");
        assert_eq!(json[0]["endpoint"], "wss://sfu.example.org/ws");
    }

    #[tokio::test]
    async fn group_status_endpoint() {
        let state = test_state();
        let app = build_router(Arc::clone(&state));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/group/lobby.status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["name"], "lobby");
        assert_eq!(json["clientCount"], 0);

        // non-public groups do not leak their client count
        let app = build_router(Arc::clone(&state));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/group/private.status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["name"], "private");
        assert!(json.get("clientCount").is_none());
    }

    #[tokio::test]
    async fn missing_group_status_is_404() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/group/nope.status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn security_headers_are_present() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
    }
}
