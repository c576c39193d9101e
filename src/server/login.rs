//! Login, logout and the session-gated dashboard page.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap},
    response::{Html, IntoResponse, Redirect, Response},
    Form,
};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::server::{
    middleware::session::{cleared_cookie, session_cookie, session_token},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub password: String,
}

/// `GET /login`
pub async fn login_page(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let signed_in = session_token(&headers).is_some_and(|t| state.auth.validate_session(&t));
    if !state.auth.enabled() || signed_in {
        return Redirect::to("/").into_response();
    }
    Html(state.assets.login_page().to_string()).into_response()
}

/// `POST /auth/login`
///
/// A locked-out address is turned away before the password is looked at.
pub async fn login(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    Form(form): Form<LoginForm>,
) -> Response {
    let ip = peer
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".into());

    if state.auth.is_locked_out(&ip) {
        warn!("AUDIT LOGIN_BLOCKED ip={}", ip);
        return Redirect::to("/login?locked=1").into_response();
    }

    let auth = Arc::clone(&state.auth);
    let valid = tokio::task::spawn_blocking(move || auth.validate_password(&form.password))
        .await
        .unwrap_or_else(|e| {
            error!("Password check failed: {}", e);
            false
        });
    if !valid {
        state.auth.record_failed_login(&ip);
        warn!("AUDIT LOGIN_FAILED ip={}", ip);
        return Redirect::to("/login?error=1").into_response();
    }

    state.auth.clear_failed_logins(&ip);
    let token = state.auth.create_session();
    info!("AUDIT LOGIN_SUCCESS ip={}", ip);

    let max_age = state.auth.policy().session_duration.as_secs();
    (
        [(header::SET_COOKIE, session_cookie(&token, max_age))],
        Redirect::to("/"),
    )
        .into_response()
}

/// `GET /auth/logout`
pub async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        state.auth.invalidate_session(&token);
    }
    ([(header::SET_COOKIE, cleared_cookie())], Redirect::to("/login")).into_response()
}

/// `GET /`: session checked by the route layer.
pub async fn dashboard(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(state.assets.render_dashboard(state.build.auth_token.as_deref()))
}
