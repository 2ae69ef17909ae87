use std::sync::Arc;

use crate::AppState;
use crate::auth::AuthUser;
use crate::config::{AuthConfig, TidepoolConfig};
use crate::db::Database;
use crate::events::EventRegistry;
use crate::metrics::ServerMetrics;
use crate::repository::Repository;

/// Build a fully-wired `AppState` backed by an in-memory SQLite database.
/// Suitable for handler tests that exercise real SQL queries without I/O.
///
/// Returns `(AppState, TempDir)` — callers **must** hold the `TempDir` for
/// the lifetime of the test so the data directory stays valid.
pub async fn test_app_state() -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = TidepoolConfig::new(Some(tmp.path().to_path_buf())).expect("config");

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");

    crate::db::run_migrations(&pool).await.expect("migrations");

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .expect("pragma");

    let metrics = Arc::new(ServerMetrics::new());
    let state = AppState {
        config: Arc::new(config),
        auth_config: Arc::new(AuthConfig {
            session_ttl_secs: 3600,
            allow_registration: true,
        }),
        db: Arc::new(Database { pool: pool.clone() }),
        repository: Arc::new(Repository::new(pool)),
        events: Arc::new(EventRegistry::new(Arc::clone(&metrics))),
        metrics,
    };

    (state, tmp)
}

/// Create a fresh user row and return it as the middleware would: an
/// `AuthUser` ready to insert into request extensions.
pub async fn test_user(state: &AppState) -> AuthUser {
    let email = format!("{}@example.com", uuid::Uuid::new_v4().simple());
    let user = state
        .repository
        .create_user(&email, "test-hash", None, None)
        .await
        .expect("create user");
    AuthUser {
        user_id: user.id,
        email: user.email,
    }
}
