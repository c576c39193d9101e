// src/server/mod.rs
pub mod assets;
pub mod broadcaster;
pub mod client;
pub mod handler;
pub mod health;
pub mod login;
pub mod message;
pub mod middleware;

// Re-export public components
pub use assets::Assets;
pub use broadcaster::Broadcaster;
pub use client::{Client, ClientManager};
pub use handler::ws_handler;
pub use health::{HealthMetrics, ScaleActivity};
pub use message::{ClientMessage, ServerMessage};
pub use middleware::rate_limit::ConfigRateLimiter;

use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
    time::Instant,
};

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    auth::{AuthManager, AuthPolicy},
    config::{BuildInfo, ConfigStore, Environment},
    logging::LogManager,
    utils::DaemonError,
};

/// Called after an accepted configuration change.
pub type ConfigChangeHook = Arc<dyn Fn() + Send + Sync>;

/// Everything the HTTP and WebSocket handlers share.
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub env: Environment,
    pub build: BuildInfo,
    pub broadcaster: Broadcaster,
    pub logs: Arc<LogManager>,
    pub auth: Arc<AuthManager>,
    pub config_limiter: ConfigRateLimiter,
    pub metrics: HealthMetrics,
    pub activity: Arc<ScaleActivity>,
    pub assets: Assets,
    pub on_config_change: ConfigChangeHook,
    pub started_at: Instant,
    /// Fired to end open WebSocket loops when the server shuts down.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Builds the shared state with default policies and a no-op config hook.
    pub fn new(
        build: BuildInfo,
        env: Environment,
        config: Arc<ConfigStore>,
        logs: Arc<LogManager>,
        assets: Assets,
    ) -> Result<Self, DaemonError> {
        let metrics = HealthMetrics::new()?;
        let activity = Arc::new(ScaleActivity::default());
        let broadcaster = Broadcaster::new(
            metrics.clone(),
            Arc::clone(&activity),
            broadcaster::SEND_TIMEOUT,
        );
        let auth = Arc::new(AuthManager::new(build.password_hash.clone(), AuthPolicy::default()));

        Ok(Self {
            config,
            env,
            build,
            broadcaster,
            logs,
            auth,
            config_limiter: ConfigRateLimiter::default(),
            metrics,
            activity,
            assets,
            on_config_change: Arc::new(|| {}),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Builds the HTTP router: public routes plus the session-gated dashboard.
pub fn router(state: Arc<AppState>) -> Router {
    let gated = Router::new()
        .route("/", get(login::dashboard))
        .route_layer(from_fn_with_state(Arc::clone(&state), middleware::require_session));

    Router::new()
        .route("/login", get(login::login_page))
        .route("/auth/login", post(login::login))
        .route("/auth/logout", get(login::logout))
        .route("/ping", get(health::ping))
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics))
        .route("/ws", get(ws_handler))
        .merge(gated)
        .with_state(state)
}

/// Binds the listener up front so bind errors surface before anything is spawned.
pub fn bind(addr: &str) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Serves HTTP and WebSocket traffic until `shutdown` fires, then drains
/// in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<(), DaemonError> {
    let addr = listener
        .local_addr()
        .map_err(|e| DaemonError::Http(e.to_string()))?;
    let app = router(state);

    info!("Server listening on {}", addr);
    axum::Server::from_tcp(listener)
        .map_err(|e| DaemonError::Http(e.to_string()))?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| DaemonError::Http(e.to_string()))
}

#[cfg(test)]
mod tests {
    use argon2::{Algorithm, Argon2, Params, Version};
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use password_hash::{PasswordHasher, SaltString};
    use tower::ServiceExt;

    use super::*;

    fn hash(password: &str) -> String {
        let argon2 = Argon2::new(
            Algorithm::Argon2id,
            Version::V0x13,
            Params::new(1024, 1, 1, None).unwrap(),
        );
        let salt = SaltString::generate(&mut rand::thread_rng());
        argon2.hash_password(password.as_bytes(), &salt).unwrap().to_string()
    }

    fn state(password_hash: Option<String>) -> Arc<AppState> {
        let build = BuildInfo {
            password_hash,
            auth_token: Some("cfg-token".into()),
            ..BuildInfo::default()
        };
        let env = Environment::resolve("local", &build.service_name, build.http_port);
        let config = Arc::new(ConfigStore::new(&env));
        let logs = Arc::new(LogManager::console(false));
        Arc::new(AppState::new(build, env, config, logs, Assets::load().unwrap()).unwrap())
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn login_form(password: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("password={password}")))
            .unwrap()
    }

    #[tokio::test]
    async fn ping_answers_pong_with_cors() {
        let response = router(state(None)).oneshot(get("/ping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        assert_eq!(body_text(response).await, "pong");
    }

    #[tokio::test]
    async fn health_reports_scale_and_build() {
        let response = router(state(None)).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["scale"]["port"], "COM3");
        assert_eq!(body["scale"]["test_mode"], true);
        assert_eq!(body["scale"]["connected"], true);
        assert_eq!(body["build"]["env"], "LOCAL");
        assert!(body["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn dashboard_is_open_without_auth_and_carries_the_token() {
        let response = router(state(None)).oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("cfg-token"));

        let response = router(state(None)).oneshot(get("/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dashboard_requires_a_session_when_auth_is_on() {
        let app = router(state(Some(hash("pw"))));
        let response = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/login");

        let response = app.clone().oneshot(get("/login")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_flow_sets_a_cookie_that_opens_the_dashboard() {
        let app = router(state(Some(hash("pw"))));

        let response = app.clone().oneshot(login_form("wrong")).await.unwrap();
        assert_eq!(response.headers()[header::LOCATION], "/login?error=1");

        let response = app.clone().oneshot(login_form("pw")).await.unwrap();
        assert_eq!(response.headers()[header::LOCATION], "/");
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.contains("HttpOnly") && cookie.contains("SameSite=Strict"));
        let pair = cookie.split(';').next().unwrap().to_string();

        let request = Request::builder()
            .uri("/")
            .header(header::COOKIE, &pair)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .uri("/auth/logout")
            .header(header::COOKIE, &pair)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert!(response.headers()[header::SET_COOKIE].to_str().unwrap().contains("Max-Age=0"));

        let request = Request::builder()
            .uri("/")
            .header(header::COOKIE, &pair)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
    }

    #[tokio::test]
    async fn lockout_rejects_even_the_right_password() {
        let app = router(state(Some(hash("pw"))));
        for _ in 0..5 {
            app.clone().oneshot(login_form("bad")).await.unwrap();
        }
        let response = app.oneshot(login_form("pw")).await.unwrap();
        assert_eq!(response.headers()[header::LOCATION], "/login?locked=1");
    }

    #[tokio::test]
    async fn login_endpoint_only_accepts_post() {
        let response = router(state(None)).oneshot(get("/auth/login")).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
