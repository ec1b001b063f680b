//! HTTP Basic authentication.
//!
//! One shared credential pair authenticates every operation on every
//! session. Comparison is constant-time.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use subtle::ConstantTimeEq;

use crate::api::AppState;

/// The realm reported in the `WWW-Authenticate` challenge.
const REALM: &str = "ptygate";

/// A configured Basic-auth credential pair.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Verifies an `Authorization` header value against the configured
    /// pair. Both halves are compared in constant time.
    pub fn verify(&self, header: Option<&str>) -> bool {
        let Some(value) = header else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((username, password)) = credentials.split_once(':') else {
            return false;
        };

        let username_ok = username.as_bytes().ct_eq(self.username.as_bytes());
        let password_ok = password.as_bytes().ct_eq(self.password.as_bytes());
        bool::from(username_ok & password_ok)
    }
}

/// axum middleware enforcing Basic auth when the gateway has credentials
/// configured.
pub async fn require_basic_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth) = &state.auth else {
        return next.run(request).await;
    };

    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if auth.verify(header) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                format!("Basic realm=\"{REALM}\""),
            )],
            "Unauthorized",
        )
            .into_response()
    }
}
