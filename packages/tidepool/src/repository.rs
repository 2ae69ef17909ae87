use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use uuid::Uuid;

use crate::models::{Session, Todo, User};

/// Query layer over the SQLite pool. One instance, cloned freely.
#[derive(Clone)]
pub struct Repository {
    pub(crate) pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn user_from_row(r: &SqliteRow) -> User {
    User {
        id: r.get("id"),
        email: r.get("email"),
        password_hash: r.get("password_hash"),
        first_name: r.get("first_name"),
        last_name: r.get("last_name"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn todo_from_row(r: &SqliteRow) -> Todo {
    Todo {
        id: r.get("id"),
        user_id: r.get("user_id"),
        text: r.get("text"),
        completed: r.get::<i32, _>("completed") != 0,
        due_date: r.get("due_date"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

// =============================================================================
// Users
// =============================================================================

impl Repository {
    pub async fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<User> {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            first_name: first_name.map(String::from),
            last_name: last_name.map(String::from),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash, first_name, last_name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to create user")?;

        Ok(user)
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, email, password_hash, first_name, last_name, created_at, updated_at
            FROM users
            WHERE email = ?
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(user_from_row))
    }

    pub async fn find_user_by_id(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, email, password_hash, first_name, last_name, created_at, updated_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(user_from_row))
    }
}

// =============================================================================
// Sessions
// =============================================================================

impl Repository {
    pub async fn create_session(&self, user_id: &str, ttl: chrono::Duration) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            token: Uuid::new_v4().simple().to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + ttl,
        };

        sqlx::query(
            r#"
            INSERT INTO sessions (token, user_id, created_at, expires_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&session.token)
        .bind(&session.user_id)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to create session")?;

        Ok(session)
    }

    /// Resolve a session token to its user. Expired sessions resolve to None.
    pub async fn find_user_by_session(&self, token: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT u.id, u.email, u.password_hash, u.first_name, u.last_name,
                   u.created_at, u.updated_at
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token = ? AND s.expires_at > ?
            "#,
        )
        .bind(token)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(user_from_row))
    }

    pub async fn delete_session(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete expired sessions. Returns the number removed.
    pub async fn cleanup_expired_sessions(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Todos
// =============================================================================

impl Repository {
    pub async fn list_todos(&self, user_id: &str) -> Result<Vec<Todo>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, text, completed, due_date, created_at, updated_at
            FROM todos
            WHERE user_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(todo_from_row).collect())
    }

    pub async fn create_todo(&self, todo: &Todo) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO todos (id, user_id, text, completed, due_date, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&todo.id)
        .bind(&todo.user_id)
        .bind(&todo.text)
        .bind(todo.completed)
        .bind(todo.due_date)
        .bind(todo.created_at)
        .bind(todo.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to create todo")?;

        Ok(())
    }

    /// Full-row update, scoped to the owner. Returns the updated todo, or
    /// None when no row matched (missing id or someone else's todo).
    pub async fn update_todo(
        &self,
        user_id: &str,
        id: &str,
        text: &str,
        completed: bool,
        due_date: Option<chrono::DateTime<Utc>>,
    ) -> Result<Option<Todo>> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE todos
            SET text = ?, completed = ?, due_date = ?, updated_at = ?
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(text)
        .bind(completed)
        .bind(due_date)
        .bind(now)
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            SELECT id, user_id, text, completed, due_date, created_at, updated_at
            FROM todos
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(todo_from_row))
    }

    /// Returns true when a row was deleted.
    pub async fn delete_todo(&self, user_id: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM todos WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
