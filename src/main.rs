use std::net::Ipv4Addr;

use tracing::info;

use todo_api::{config::Config, create_app, db, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let db = db::init_db(&config.database_path).expect("initializing database");
    info!(path = %config.database_path, "database ready");

    let state = AppState::new(db, &config.jwt_secret, &config.base_path);
    let app = create_app(state);
    let addr = (Ipv4Addr::UNSPECIFIED, config.port);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("binding listener");

    info!("running on {addr:?}");

    axum::serve(listener, app).await.expect("failed serving");
}
