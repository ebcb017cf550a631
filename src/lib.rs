pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod token;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use db::DbPool;
use token::TokenService;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub tokens: Arc<TokenService>,
    pub base_path: Arc<String>,
}

impl AppState {
    pub fn new(db: DbPool, jwt_secret: &str, base_path: &str) -> Self {
        AppState {
            db,
            tokens: Arc::new(TokenService::new(jwt_secret)),
            base_path: Arc::new(base_path.to_string()),
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    let base_path = state.base_path.clone();

    let app_routes = Router::new()
        .route(
            "/todos",
            post(handlers::todos::create_todo).get(handlers::todos::list_todos),
        )
        .route(
            "/todos/{id}",
            get(handlers::todos::get_todo)
                .delete(handlers::todos::delete_todo)
                .patch(handlers::todos::update_todo),
        )
        .route("/users", post(handlers::users::register))
        .route("/users/login", post(handlers::users::login))
        .route("/users/me", get(handlers::users::me))
        .route("/users/me/token", delete(handlers::users::logout))
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(tower_http::compression::CompressionLayer::new()),
        )
        .with_state(state);

    tracing::info!("base_path: {base_path:?}");

    if base_path.is_empty() {
        app_routes
    } else {
        Router::new().nest(&*base_path, app_routes)
    }
}
