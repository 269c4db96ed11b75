use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use llmmask_server::{auth, config, handlers, state};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llmmask_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = config::Config::from_env()?;
    let port = config.port;
    let state = state::AppState::new(config).await?;

    sqlx::migrate!("./migrations").run(&state.db).await?;

    let authed = Router::new()
        .route("/api/v1/auth-token", post(handlers::issue_token))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_user,
        ));

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/public-key/:model", get(handlers::get_public_key))
        .route("/api/v1/llm-proxy", post(handlers::llm_proxy))
        .merge(authed)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&format!("0.0.0.0:{port}")).await?;

    tracing::info!("llmmask-server listening on port {}", port);

    axum::serve(listener, app).await?;

    Ok(())
}
