//! Authentication: password accounts with opaque session tokens.
//!
//! Login stores a session row and hands the token back in an HTTP-only
//! cookie. The middleware resolves the token (cookie or bearer header) to
//! an [`AuthUser`] in request extensions; extractors enforce it per route.
//! The event-stream route authenticates exactly like every other route, so
//! the connection registry never sees an unauthenticated stream.

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{AppendHeaders, IntoResponse, Response},
    routing::{get, post},
};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::config::AuthConfig;
use crate::models::{LoginRequest, RegisterRequest};
use crate::repository::Repository;

const SESSION_COOKIE: &str = "tide_session";

// =============================================================================
// AuthUser
// =============================================================================

/// Authenticated principal, resolved from the session token by the middleware.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub email: String,
}

// =============================================================================
// Auth Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("User with this email already exists")]
    EmailTaken,

    #[error("Registration is disabled")]
    RegistrationDisabled,

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AuthError::EmailTaken => StatusCode::CONFLICT,
            AuthError::RegistrationDisabled => StatusCode::FORBIDDEN,
            AuthError::Internal(e) => {
                error!("Auth handler failed: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// =============================================================================
// Auth State (shared across middleware and handlers)
// =============================================================================

#[derive(Clone)]
pub struct AuthState {
    pub repository: Arc<Repository>,
    pub auth_config: Arc<AuthConfig>,
}

// =============================================================================
// Password hashing and validation
// =============================================================================

/// Hash a password with Argon2id and a random salt.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored Argon2id hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn validate_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain.contains('.')
        && !email.contains(char::is_whitespace)
}

/// Minimum 8 characters with at least one uppercase, lowercase, digit, and
/// special character.
fn validate_password(password: &str) -> bool {
    password.chars().count() >= 8
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| !c.is_ascii_alphanumeric())
}

// =============================================================================
// Session token transport
// =============================================================================

/// Pull the session token from the `tide_session` cookie or an
/// `Authorization: Bearer` header (cookie wins; browsers send cookies on
/// EventSource requests, CLIs prefer the header).
fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for cookie in cookies.split(';') {
            if let Some((name, value)) = cookie.trim().split_once('=') {
                if name == SESSION_COOKIE && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .map(String::from)
}

fn session_cookie(token: &str, max_age_secs: u64) -> String {
    format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={max_age_secs}")
}

fn clear_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0")
}

// =============================================================================
// Auth Middleware
// =============================================================================

/// Resolve the session token to an [`AuthUser`] extension. Requests without
/// a valid session pass through without one; route extractors decide whether
/// that is a 401.
pub async fn auth_middleware(
    State(auth_state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(token) = session_token(request.headers()) {
        match auth_state.repository.find_user_by_session(&token).await {
            Ok(Some(user)) => {
                request.extensions_mut().insert(AuthUser {
                    user_id: user.id,
                    email: user.email,
                });
            }
            Ok(None) => {}
            Err(e) => error!("Session lookup failed: {e:#}"),
        }
    }
    next.run(request).await
}

// =============================================================================
// Axum Extractors
// =============================================================================

/// Extract AuthUser from request extensions (set by middleware).
/// Returns 401 if not present.
impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts.extensions.get::<AuthUser>().cloned().ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Authentication required" })),
            )
        })
    }
}

// =============================================================================
// Routes
// =============================================================================

pub fn auth_routes() -> Router<AuthState> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
}

async fn register(
    State(state): State<AuthState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AuthError> {
    if !state.auth_config.allow_registration {
        return Err(AuthError::RegistrationDisabled);
    }
    if req.email.is_empty() || req.password.is_empty() {
        return Err(AuthError::Validation(
            "Email and password are required".into(),
        ));
    }
    if !validate_email(&req.email) {
        return Err(AuthError::Validation("Invalid email format".into()));
    }
    if !validate_password(&req.password) {
        return Err(AuthError::Validation(
            "Password must be at least 8 characters with uppercase, lowercase, number, and special character"
                .into(),
        ));
    }
    if state.repository.find_user_by_email(&req.email).await?.is_some() {
        return Err(AuthError::EmailTaken);
    }

    let password_hash = hash_password(&req.password)?;
    let user = state
        .repository
        .create_user(
            &req.email,
            &password_hash,
            req.first_name.as_deref(),
            req.last_name.as_deref(),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "User registered successfully", "user": user })),
    ))
}

async fn login(
    State(state): State<AuthState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, AuthError> {
    if req.email.is_empty() || req.password.is_empty() {
        return Err(AuthError::Validation(
            "Email and password are required".into(),
        ));
    }

    let user = state
        .repository
        .find_user_by_email(&req.email)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;

    if !verify_password(&req.password, &user.password_hash) {
        return Err(AuthError::InvalidCredentials);
    }

    let session = state
        .repository
        .create_session(&user.id, state.auth_config.session_ttl())
        .await?;

    Ok((
        AppendHeaders([(
            header::SET_COOKIE,
            session_cookie(&session.token, state.auth_config.session_ttl_secs),
        )]),
        Json(json!({ "message": "Login successful", "user": user })),
    ))
}

async fn logout(
    State(state): State<AuthState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AuthError> {
    if let Some(token) = session_token(&headers) {
        state.repository.delete_session(&token).await?;
    }
    Ok((
        AppendHeaders([(header::SET_COOKIE, clear_session_cookie())]),
        Json(json!({ "message": "Logged out successfully" })),
    ))
}

async fn me(
    State(state): State<AuthState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AuthError> {
    let user = state
        .repository
        .find_user_by_id(&user.user_id)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;
    Ok(Json(json!({ "user": user })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use tower::ServiceExt;

    #[test]
    fn email_validation() {
        assert!(validate_email("alice@example.com"));
        assert!(validate_email("a.b+c@sub.example.org"));
        assert!(!validate_email("alice"));
        assert!(!validate_email("@example.com"));
        assert!(!validate_email("alice@"));
        assert!(!validate_email("alice@nodot"));
        assert!(!validate_email("a b@example.com"));
    }

    #[test]
    fn password_validation() {
        assert!(validate_password("Str0ng!pass"));
        assert!(!validate_password("Sh0rt!a"));
        assert!(!validate_password("alllowercase1!"));
        assert!(!validate_password("ALLUPPERCASE1!"));
        assert!(!validate_password("NoDigits!!"));
        assert!(!validate_password("NoSpecial123"));
    }

    #[test]
    fn hash_and_verify_roundtrip() {
        let hash = hash_password("Str0ng!pass").unwrap();
        assert_ne!(hash, "Str0ng!pass");
        assert!(verify_password("Str0ng!pass", &hash));
        assert!(!verify_password("Wr0ng!pass", &hash));
        assert!(!verify_password("Str0ng!pass", "not-a-phc-string"));
    }

    #[test]
    fn session_token_sources() {
        let mut headers = HeaderMap::new();
        assert!(session_token(&headers).is_none());

        headers.insert(
            header::COOKIE,
            "other=1; tide_session=abc123; theme=dark".parse().unwrap(),
        );
        assert_eq!(session_token(&headers).as_deref(), Some("abc123"));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer tok456".parse().unwrap());
        assert_eq!(session_token(&headers).as_deref(), Some("tok456"));
    }

    async fn test_auth_state() -> AuthState {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        crate::db::run_migrations(&pool).await.expect("migrations");
        AuthState {
            repository: Arc::new(Repository::new(pool)),
            auth_config: Arc::new(AuthConfig {
                session_ttl_secs: 3600,
                allow_registration: true,
            }),
        }
    }

    fn test_router(state: AuthState) -> Router {
        auth_routes()
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                auth_middleware,
            ))
            .with_state(state)
    }

    fn post_json(uri: &str, body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn register_login_me_flow() {
        let app = test_router(test_auth_state().await);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/auth/register",
                r#"{"email":"alice@example.com","password":"Str0ng!pass","first_name":"Alice"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/auth/login",
                r#"{"email":"alice@example.com","password":"Str0ng!pass"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let cookie = resp
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("tide_session="));
        assert!(cookie.contains("HttpOnly"));

        let session_pair = cookie.split(';').next().unwrap().to_string();
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/auth/me")
                    .header(header::COOKIE, &session_pair)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["user"]["email"], "alice@example.com");
        assert!(json["user"].get("password_hash").is_none());
    }

    #[tokio::test]
    async fn me_without_session_is_unauthorized() {
        let app = test_router(test_auth_state().await);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/auth/me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let app = test_router(test_auth_state().await);
        let body = r#"{"email":"a@example.com","password":"Str0ng!pass"}"#;

        let resp = app
            .clone()
            .oneshot(post_json("/api/auth/register", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app
            .oneshot(post_json("/api/auth/register", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn weak_password_rejected() {
        let app = test_router(test_auth_state().await);
        let resp = app
            .oneshot(post_json(
                "/api/auth/register",
                r#"{"email":"a@example.com","password":"weakpass"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let app = test_router(test_auth_state().await);
        app.clone()
            .oneshot(post_json(
                "/api/auth/register",
                r#"{"email":"a@example.com","password":"Str0ng!pass"}"#,
            ))
            .await
            .unwrap();

        let resp = app
            .oneshot(post_json(
                "/api/auth/login",
                r#"{"email":"a@example.com","password":"Wr0ng!pass"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logout_invalidates_session() {
        let state = test_auth_state().await;
        let app = test_router(state.clone());

        app.clone()
            .oneshot(post_json(
                "/api/auth/register",
                r#"{"email":"a@example.com","password":"Str0ng!pass"}"#,
            ))
            .await
            .unwrap();
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/auth/login",
                r#"{"email":"a@example.com","password":"Str0ng!pass"}"#,
            ))
            .await
            .unwrap();
        let cookie = resp
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/auth/logout")
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/auth/me")
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn registration_can_be_disabled() {
        let mut state = test_auth_state().await;
        state.auth_config = Arc::new(AuthConfig {
            session_ttl_secs: 3600,
            allow_registration: false,
        });
        let app = test_router(state);

        let resp = app
            .oneshot(post_json(
                "/api/auth/register",
                r#"{"email":"a@example.com","password":"Str0ng!pass"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
