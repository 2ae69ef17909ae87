use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::AppState;
use crate::auth::AuthUser;
use crate::events::Event;
use crate::models::{CreateTodoRequest, Todo, UpdateTodoRequest};

pub async fn list_todos(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, StatusCode> {
    match state.repository.list_todos(&user.user_id).await {
        Ok(todos) => Ok(Json(todos)),
        Err(e) => {
            error!("Failed to list todos: {e:#}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn create_todo(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateTodoRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.text.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let now = Utc::now();
    let todo = Todo {
        id: req.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        user_id: user.user_id.clone(),
        text: req.text,
        completed: req.completed,
        due_date: req.due_date,
        created_at: now,
        updated_at: now,
    };

    if let Err(e) = state.repository.create_todo(&todo).await {
        error!("Failed to create todo: {e:#}");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    state
        .events
        .broadcast(&user.user_id, &Event::todo_created(&todo))
        .await;

    Ok((StatusCode::CREATED, Json(todo)))
}

pub async fn update_todo(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateTodoRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let updated = state
        .repository
        .update_todo(&user.user_id, &id, &req.text, req.completed, req.due_date)
        .await
        .map_err(|e| {
            error!("Failed to update todo: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let Some(todo) = updated else {
        return Err(StatusCode::NOT_FOUND);
    };

    state
        .events
        .broadcast(&user.user_id, &Event::todo_updated(&todo))
        .await;

    Ok(Json(todo))
}

pub async fn delete_todo(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let deleted = state
        .repository
        .delete_todo(&user.user_id, &id)
        .await
        .map_err(|e| {
            error!("Failed to delete todo: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if !deleted {
        return Err(StatusCode::NOT_FOUND);
    }

    state
        .events
        .broadcast(&user.user_id, &Event::todo_deleted(&id))
        .await;

    Ok(Json(json!({ "message": "Todo deleted successfully", "id": id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::Request,
        routing::get,
    };
    use tower::ServiceExt;

    async fn test_router() -> (Router, AppState, tempfile::TempDir) {
        let (state, tmp) = crate::test_helpers::test_app_state().await;
        let router = Router::new()
            .route("/api/todos", get(list_todos).post(create_todo))
            .route(
                "/api/todos/{id}",
                axum::routing::put(update_todo).delete(delete_todo),
            )
            .with_state(state.clone());
        (router, state, tmp)
    }

    /// Requests carrying an already-resolved AuthUser, as the middleware
    /// would attach it.
    fn authed(mut req: Request<Body>, user: &AuthUser) -> Request<Body> {
        req.extensions_mut().insert(user.clone());
        req
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_req(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn list_requires_auth() {
        let (app, _state, _tmp) = test_router().await;
        let resp = app.oneshot(get_req("/api/todos")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_then_list() {
        let (app, state, _tmp) = test_router().await;
        let user = crate::test_helpers::test_user(&state).await;

        let resp = app
            .clone()
            .oneshot(authed(
                json_req("POST", "/api/todos", r#"{"text":"buy milk","dueDate":null}"#),
                &user,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(created["text"], "buy milk");
        assert_eq!(created["completed"], false);

        let resp = app
            .oneshot(authed(get_req("/api/todos"), &user))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let todos: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(todos.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_rejects_empty_text() {
        let (app, state, _tmp) = test_router().await;
        let user = crate::test_helpers::test_user(&state).await;

        let resp = app
            .oneshot(authed(
                json_req("POST", "/api/todos", r#"{"text":"   "}"#),
                &user,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_and_delete_roundtrip() {
        let (app, state, _tmp) = test_router().await;
        let user = crate::test_helpers::test_user(&state).await;

        let resp = app
            .clone()
            .oneshot(authed(
                json_req("POST", "/api/todos", r#"{"id":"t1","text":"original"}"#),
                &user,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app
            .clone()
            .oneshot(authed(
                json_req(
                    "PUT",
                    "/api/todos/t1",
                    r#"{"text":"edited","completed":true}"#,
                ),
                &user,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let updated: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(updated["text"], "edited");
        assert_eq!(updated["completed"], true);

        let resp = app
            .clone()
            .oneshot(authed(json_req("DELETE", "/api/todos/t1", ""), &user))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(authed(
                json_req(
                    "PUT",
                    "/api/todos/t1",
                    r#"{"text":"gone","completed":false}"#,
                ),
                &user,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mutations_broadcast_to_owner() {
        let (app, state, _tmp) = test_router().await;
        let user = crate::test_helpers::test_user(&state).await;

        let mut stream = state.events.subscribe(&user.user_id).await.unwrap();
        // drain the registration confirmation
        use futures::StreamExt;
        assert!(stream.next().await.unwrap().starts_with("event: connected\n"));

        app.clone()
            .oneshot(authed(
                json_req("POST", "/api/todos", r#"{"id":"t1","text":"watch me"}"#),
                &user,
            ))
            .await
            .unwrap();
        let frame = stream.next().await.unwrap();
        assert!(frame.starts_with("event: todo-created\n"));
        assert!(frame.contains("\"id\":\"t1\""));

        app.clone()
            .oneshot(authed(
                json_req(
                    "PUT",
                    "/api/todos/t1",
                    r#"{"text":"watched","completed":true}"#,
                ),
                &user,
            ))
            .await
            .unwrap();
        assert!(stream.next().await.unwrap().starts_with("event: todo-updated\n"));

        app.oneshot(authed(json_req("DELETE", "/api/todos/t1", ""), &user))
            .await
            .unwrap();
        let frame = stream.next().await.unwrap();
        assert!(frame.starts_with("event: todo-deleted\n"));
        assert!(frame.contains("\"id\":\"t1\""));
    }

    #[tokio::test]
    async fn foreign_todos_are_invisible() {
        let (app, state, _tmp) = test_router().await;
        let alice = crate::test_helpers::test_user(&state).await;
        let bob = crate::test_helpers::test_user(&state).await;

        app.clone()
            .oneshot(authed(
                json_req("POST", "/api/todos", r#"{"id":"t1","text":"alice's"}"#),
                &alice,
            ))
            .await
            .unwrap();

        let resp = app
            .clone()
            .oneshot(authed(get_req("/api/todos"), &bob))
            .await
            .unwrap();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let todos: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(todos.as_array().unwrap().is_empty());

        let resp = app
            .oneshot(authed(json_req("DELETE", "/api/todos/t1", ""), &bob))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
