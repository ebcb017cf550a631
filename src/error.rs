use std::collections::BTreeMap;

use axum::extract::rejection::JsonRejection;
use axum::response::{IntoResponse, Response};
use axum::{http::StatusCode, Json};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::token::TokenError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{errmsg}")]
    DuplicateEmail { code: i32, errmsg: String },
    #[error("invalid email or password")]
    AuthenticationFailed,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Store(String),
    #[error("password hashing failed: {0}")]
    PasswordHash(String),
    #[error(transparent)]
    Token(#[from] TokenError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated | AppError::Token(TokenError::Invalid) => {
                StatusCode::UNAUTHORIZED
            }
            AppError::NotFound => StatusCode::NOT_FOUND,
            // Every remaining failure, infrastructure included, is a 400.
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            AppError::Unauthenticated | AppError::Token(TokenError::Invalid) => {
                (status, Json(json!({}))).into_response()
            }
            AppError::NotFound => status.into_response(),
            AppError::Validation(err) => (status, Json(err)).into_response(),
            AppError::DuplicateEmail { code, errmsg } => {
                (status, Json(json!({ "code": code, "errmsg": errmsg }))).into_response()
            }
            AppError::AuthenticationFailed => error_body(
                status,
                "AuthenticationFailed",
                AppError::AuthenticationFailed.to_string(),
            ),
            AppError::BadRequest(msg) => error_body(status, "BadRequest", msg),
            AppError::Store(msg) => error_body(status, "StoreError", msg),
            AppError::PasswordHash(msg) => error_body(status, "PasswordHashError", msg),
            AppError::Token(err) => error_body(status, "TokenError", err.to_string()),
        }
    }
}

fn error_body(status: StatusCode, name: &str, message: String) -> Response {
    (status, Json(json!({ "name": name, "message": message }))).into_response()
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &err {
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                && message.contains("users.email")
            {
                return AppError::DuplicateEmail {
                    code: failure.extended_code,
                    errmsg: message.clone(),
                };
            }
        }
        AppError::Store(err.to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

/// Schema validation failure, serialized as the 400 response body.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{message}")]
pub struct ValidationError {
    name: &'static str,
    pub message: String,
    pub errors: BTreeMap<&'static str, FieldError>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub kind: &'static str,
    pub path: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(path: &'static str, kind: &'static str, message: impl Into<String>) -> Self {
        FieldError {
            kind,
            path,
            message: message.into(),
        }
    }
}

impl ValidationError {
    /// Returns `Ok` when `errors` is empty, otherwise a single error naming
    /// every failed field of `model`.
    pub fn check(model: &str, errors: Vec<FieldError>) -> Result<(), ValidationError> {
        if errors.is_empty() {
            return Ok(());
        }

        let summary = errors
            .iter()
            .map(|e| format!("{}: {}", e.path, e.message))
            .collect::<Vec<_>>()
            .join(", ");

        Err(ValidationError {
            name: "ValidationError",
            message: format!("{model} validation failed: {summary}"),
            errors: errors.into_iter().map(|e| (e.path, e)).collect(),
        })
    }
}
