use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use axum_extra::extract::WithRejection;
use tracing::info;

use crate::db;
use crate::error::AppError;
use crate::middleware::Authenticated;
use crate::models::{now_millis, CreateTodo, ObjectId, Todo, UpdateTodo};
use crate::AppState;

/// Malformed ids are reported exactly like missing ones.
fn parse_id(raw: &str) -> Result<ObjectId, AppError> {
    ObjectId::parse(raw).ok_or(AppError::NotFound)
}

pub async fn create_todo(
    auth: Authenticated,
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<CreateTodo>, AppError>,
) -> Result<Json<Todo>, AppError> {
    let todo = Todo::new(req.text.as_deref().unwrap_or_default(), auth.user.id);
    db::create_todo(&state.db, &todo)?;
    info!(id = %todo.id, creator = %todo.creator, "Created todo");
    Ok(Json(todo))
}

pub async fn list_todos(
    auth: Authenticated,
    State(state): State<AppState>,
) -> Result<Json<Vec<Todo>>, AppError> {
    let todos = db::list_todos(&state.db, &auth.user.id)?;
    info!(count = todos.len(), creator = %auth.user.id, "Listed todos");
    Ok(Json(todos))
}

pub async fn get_todo(
    auth: Authenticated,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Todo>, AppError> {
    let id = parse_id(&id)?;
    match db::get_todo(&state.db, &id, &auth.user.id)? {
        Some(todo) => Ok(Json(todo)),
        None => Err(AppError::NotFound),
    }
}

pub async fn delete_todo(
    auth: Authenticated,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Todo>, AppError> {
    let id = parse_id(&id)?;
    match db::delete_todo(&state.db, &id, &auth.user.id)? {
        Some(todo) => {
            info!(%id, "Deleted todo");
            Ok(Json(todo))
        }
        None => Err(AppError::NotFound),
    }
}

pub async fn update_todo(
    auth: Authenticated,
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<UpdateTodo>, JsonRejection>,
) -> Result<Json<Todo>, AppError> {
    // The id is checked before the body so a malformed id is always a 404.
    let id = parse_id(&id)?;
    let Json(req) = body?;
    let changes = req.into_changes(now_millis())?;

    match db::update_todo(&state.db, &id, &auth.user.id, &changes)? {
        Some(todo) => {
            info!(%id, completed = todo.completed, "Updated todo");
            Ok(Json(todo))
        }
        None => Err(AppError::NotFound),
    }
}
