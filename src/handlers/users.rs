use axum::extract::State;
use axum::response::IntoResponse;
use axum::{http::StatusCode, Json};
use axum_extra::extract::WithRejection;
use tracing::{info, warn};

use crate::db;
use crate::error::AppError;
use crate::middleware::{Authenticated, AUTH_HEADER};
use crate::models::{Credentials, User};
use crate::AppState;

fn with_token(token: String, user: User) -> impl IntoResponse {
    ([(AUTH_HEADER, token)], Json(user))
}

pub async fn register(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<Credentials>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let mut user = User::new(&req.email, &req.password);
    db::insert_user(&state.db, &mut user)?;
    let token = state.tokens.issue(&state.db, &mut user)?;

    info!(user = %user.id, "Registered user");
    Ok(with_token(token, user))
}

pub async fn login(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<Credentials>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let mut user = match db::find_user_by_credentials(&state.db, &req.email, &req.password) {
        Ok(user) => user,
        Err(err) => {
            warn!("Failed login attempt");
            return Err(err);
        }
    };
    let token = state.tokens.issue(&state.db, &mut user)?;

    info!(user = %user.id, "User logged in");
    Ok(with_token(token, user))
}

pub async fn me(auth: Authenticated) -> Json<User> {
    Json(auth.user)
}

/// Revokes only the token that authenticated this request.
pub async fn logout(
    auth: Authenticated,
    State(state): State<AppState>,
) -> Result<StatusCode, AppError> {
    let Authenticated { mut user, token } = auth;
    state.tokens.revoke(&state.db, &mut user, &token)?;

    info!(user = %user.id, "User logged out");
    Ok(StatusCode::OK)
}
