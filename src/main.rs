use companyintel::{config::ResearchConfig, create_app, spawn_maintenance, AppState};

#[tokio::main]
async fn main() {
    // Load .env if present, then initialize tracing
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = ResearchConfig::from_env();
    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {}", e);
        std::process::exit(1);
    }

    let state = AppState::from_config(config);
    spawn_maintenance(&state);

    let app = create_app(state);
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:3000").await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind 127.0.0.1:3000: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("Server running on http://127.0.0.1:3000");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {}", e);
    }
}
