pub mod error;
pub mod routes;
pub mod state;

use axum::{Router, middleware};
use fd_auth::require_auth;
use state::ApiState;
use tower_http::trace::TraceLayer;

/// Build the complete router: the administrative `/api/v1/*` surface and the
/// agent WebSocket endpoint at `/ws`.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .nest("/api/v1", api_routes(&state))
        .merge(routes::agent_ws::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Everything but health and the account entry points needs a session.
fn api_routes(state: &ApiState) -> Router<ApiState> {
    let guarded = Router::new()
        .nest(
            "/nodes",
            routes::nodes::router()
                .merge(routes::swarm::router())
                .merge(routes::containers::router())
                .merge(routes::compose::router())
                .merge(routes::networks::router())
                .merge(routes::volumes::router())
                .merge(routes::disk::router()),
        )
        .merge(routes::users::account_router())
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), require_auth));

    Router::new()
        .merge(guarded)
        .merge(routes::users::router())
        .merge(routes::health::router())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use fd_auth::AuthService;
    use fd_common::config::EnvConfig;
    use fd_protocol::{ProgressSink, TaskDefinition, TaskHandler, TaskOutcome};
    use fd_registry::{DispatchTimeouts, Dispatcher, NodeRegistry, NodeStore, TaskTable};
    use futures_util::future::BoxFuture;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct NoopHandler;

    impl TaskHandler for NoopHandler {
        fn execute(&self, _: TaskDefinition, _: ProgressSink) -> BoxFuture<'_, TaskOutcome> {
            Box::pin(async { TaskOutcome::success(None) })
        }
    }

    fn app(dir: &tempfile::TempDir) -> Router {
        let store = Arc::new(NodeStore::new(dir.path().join("nodes.json")));
        let tasks = TaskTable::new(Arc::new(NodeRegistry::new()));
        let dispatcher = Dispatcher::new(tasks, Arc::new(NoopHandler), DispatchTimeouts::default());
        let auth = AuthService::new(dir.path()).unwrap();
        build_router(ApiState::new(Arc::new(EnvConfig::default()), store, dispatcher, auth))
    }

    fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_admin_routes_require_session() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        let guarded = [
            "/api/v1/nodes",
            "/api/v1/nodes/1/containers",
            "/api/v1/nodes/1/networks",
            "/api/v1/nodes/1/disk",
            "/api/v1/users/me",
        ];
        for uri in guarded {
            let response = app.clone().oneshot(get(uri, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
        let response = app
            .clone()
            .oneshot(get("/api/v1/nodes", Some("fd_session=forged")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_health_and_account_entry_points_are_open() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        let response = app.clone().oneshot(get("/api/v1/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get("/api/v1/users/count", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    fn request(method: &str, uri: &str, cookie: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::COOKIE, cookie)
            .header(header::CONTENT_TYPE, "application/json");
        let body = body.map_or_else(Body::empty, |b| Body::from(b.to_string()));
        builder.body(body).unwrap()
    }

    /// Create the administrator, log in and return the session cookie pair.
    async fn login(app: &Router) -> String {
        let credentials = json!({ "username": "admin", "password": "s3cretpass" });
        let response = app
            .clone()
            .oneshot(post("/api/v1/users", credentials.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(post("/api/v1/users/login", credentials))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_login_grants_access() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        let cookie = login(&app).await;
        assert!(cookie.starts_with("fd_session="));

        let response = app
            .clone()
            .oneshot(get("/api/v1/nodes", Some(&cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request("POST", "/api/v1/users/logout", &cookie, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get("/api/v1/nodes", Some(&cookie))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_resource_routes_reach_local_node() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        let cookie = login(&app).await;

        for uri in ["/api/v1/nodes/1/networks/backend", "/api/v1/nodes/1/volumes/data"] {
            let response = app
                .clone()
                .oneshot(request("DELETE", uri, &cookie, None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }

        let spec = json!({ "name": "backend", "driver": "weave" });
        let response = app
            .clone()
            .oneshot(request("POST", "/api/v1/nodes/1/networks", &cookie, Some(spec)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(request("DELETE", "/api/v1/nodes/9/volumes/data", &cookie, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wrong_password_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        app.clone()
            .oneshot(post(
                "/api/v1/users",
                json!({ "username": "admin", "password": "s3cretpass" }),
            ))
            .await
            .unwrap();
        let response = app
            .oneshot(post(
                "/api/v1/users/login",
                json!({ "username": "admin", "password": "guessing" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }
}
