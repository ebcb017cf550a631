use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tracing::warn;

use crate::error::AppError;
use crate::models::User;
use crate::AppState;

pub const AUTH_HEADER: &str = "x-auth";

/// A request whose `x-auth` token resolved to a live user.
///
/// Handlers take this as a parameter; extraction failure ends the request
/// with 401 and an empty JSON object.
pub struct Authenticated {
    pub user: User,
    /// The raw token presented with this request.
    pub token: String,
}

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = parts
            .headers
            .get(AUTH_HEADER)
            .and_then(|value| value.to_str().ok())
        else {
            warn!("Request without usable x-auth header");
            return Err(AppError::Unauthenticated);
        };

        match state.tokens.resolve(&state.db, token) {
            Ok(user) => Ok(Authenticated {
                user,
                token: token.to_string(),
            }),
            Err(err) => {
                warn!(error = %err, "Rejected x-auth token");
                Err(AppError::Unauthenticated)
            }
        }
    }
}
