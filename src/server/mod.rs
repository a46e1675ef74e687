//! The remote patch service: HTTP API over [`ServerStorage`].
//!
//! # Endpoints
//!
//! - `GET /health`: health check (no auth required)
//! - `POST /users`: create the token's user
//! - `POST /users/{user_id}/clients`: register a client
//! - `GET|DELETE /users/{user_id}/clients/{client_id}/pending_patches`
//! - `GET|PUT /users/{user_id}/head`
//! - `POST /users/{user_id}/patches~batch`

pub mod auth;
pub mod handlers;
pub mod storage;

pub use storage::{ServerStorage, ServerStorageError};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub storage: ServerStorage,
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    // Public routes (no auth)
    let public_routes = Router::new().route("/health", get(handlers::health));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/users", post(handlers::create_user))
        .route("/users/{user_id}/clients", post(handlers::create_client))
        .route(
            "/users/{user_id}/clients/{client_id}/pending_patches",
            get(handlers::get_pending_patches).delete(handlers::delete_pending_patches),
        )
        .route(
            "/users/{user_id}/head",
            get(handlers::get_head).put(handlers::update_head),
        )
        .route(
            "/users/{user_id}/patches~batch",
            post(handlers::create_patches),
        )
        .layer(middleware::from_fn(auth::auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::sync::protocol::IdToken;

    pub(crate) struct TestServer {
        pub url: String,
        pub _dir: TempDir,
    }

    /// Serves the router on an ephemeral local port.
    pub(crate) async fn spawn_server() -> TestServer {
        let dir = TempDir::new().unwrap();
        let storage = ServerStorage::open(dir.path().join("server.db")).await.unwrap();
        let app = router(AppState { storage });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            url: format!("http://{}", addr),
            _dir: dir,
        }
    }

    async fn setup() -> (Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = ServerStorage::open(dir.path().join("server.db")).await.unwrap();
        (router(AppState { storage }), dir)
    }

    fn request(method: &str, uri: &str, user_id: Option<i64>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(id) = user_id {
            builder = builder.header(
                header::AUTHORIZATION,
                format!("Bearer {}", IdToken::new(id).to_bearer()),
            );
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let (app, _dir) = setup().await;
        let (status, body) = send(&app, request("GET", "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_and_invalid_token() {
        let (app, _dir) = setup().await;

        let (status, body) = send(&app, request("GET", "/users/1/head", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let req = Request::builder()
            .uri("/users/1/head")
            .header(header::AUTHORIZATION, "Bearer ???")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_other_users_resources_are_forbidden() {
        let (app, _dir) = setup().await;
        send(&app, request("POST", "/users", Some(1), None)).await;

        let (status, body) = send(&app, request("GET", "/users/1/head", Some(2), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let (app, _dir) = setup().await;

        let (status, body) = send(&app, request("POST", "/users", Some(1), None)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user_id"], 1);

        let (status, _) = send(&app, request("POST", "/users", Some(1), None)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, head) = send(&app, request("GET", "/users/1/head", Some(1), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(head["client_id"], 0);
        assert_eq!(head["name"], "System");

        let (status, _) = send(&app, request("GET", "/users/2/head", Some(2), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_patch_batch_and_pending_flow() {
        let (app, _dir) = setup().await;
        send(&app, request("POST", "/users", Some(1), None)).await;

        let (_, a) = send(
            &app,
            request("POST", "/users/1/clients", Some(1), Some(json!({ "name": "a" }))),
        )
        .await;
        let (_, b) = send(
            &app,
            request("POST", "/users/1/clients", Some(1), Some(json!({ "name": "b" }))),
        )
        .await;
        let (a, b) = (a["client_id"].as_i64().unwrap(), b["client_id"].as_i64().unwrap());

        let patch = json!({
            "patch_key": { "client_id": a, "session_id": 1, "patch_id": 0 },
            "parent_patch_key": { "client_id": 0, "session_id": 0, "patch_id": 0 },
            "created_at": "2024-05-01T10:00:00Z",
            "ops": [{ "op": "replace", "path": "/data", "value": {} }]
        });
        let (status, body) = send(
            &app,
            request(
                "POST",
                "/users/1/patches~batch",
                Some(1),
                Some(json!({ "patches": [patch.clone()] })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["inserted"], 1);

        let uri = format!("/users/1/clients/{}/pending_patches?limit=10", b);
        let (_, body) = send(&app, request("GET", &uri, Some(1), None)).await;
        let patches = body["patches"].as_array().unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[1]["patch_key"], patch["patch_key"]);

        let uri = format!("/users/1/clients/{}/pending_patches", b);
        let keys = json!({ "patch_keys": [patches[0]["patch_key"], patches[1]["patch_key"]] });
        let (status, body) = send(&app, request("DELETE", &uri, Some(1), Some(keys))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 2);

        let update = json!({
            "patch_key": patch["patch_key"],
            "header_if_match": { "client_id": 0, "session_id": 0, "patch_id": 0 }
        });
        let (_, body) = send(&app, request("PUT", "/users/1/head", Some(1), Some(update.clone()))).await;
        assert_eq!(body["updated"], true);
        let (_, body) = send(&app, request("PUT", "/users/1/head", Some(1), Some(update))).await;
        assert_eq!(body["updated"], false);
    }

    #[tokio::test]
    async fn test_malformed_body_is_422() {
        let (app, _dir) = setup().await;
        send(&app, request("POST", "/users", Some(1), None)).await;

        let bad_op = json!({ "patches": [{
            "patch_key": { "client_id": 1, "session_id": 1, "patch_id": 0 },
            "parent_patch_key": { "client_id": 0, "session_id": 0, "patch_id": 0 },
            "created_at": "2024-05-01T10:00:00Z",
            "ops": [{ "op": "explode", "path": "" }]
        }]});
        let (status, body) = send(
            &app,
            request("POST", "/users/1/patches~batch", Some(1), Some(bad_op)),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "invalid_body");

        let unknown_head = json!({ "patch_key": { "client_id": 9, "session_id": 9, "patch_id": 9 } });
        let (status, _) = send(
            &app,
            request("PUT", "/users/1/head", Some(1), Some(unknown_head)),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
