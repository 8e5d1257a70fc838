use axum::Router;
use robotrader::config::Config;
use robotrader::services::{FanoutRegistry, RobotRepository, RobotStore, Supervisor};
use robotrader::sources::{PriceFeed, WsPriceFeed};
use robotrader::{api, websocket, AppState};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "robotrader=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env());
    info!("Starting robotrader on {}:{}", config.host, config.port);

    let repository: Arc<dyn RobotRepository> = Arc::new(RobotStore::new(&config.database_path)?);
    let feed: Arc<dyn PriceFeed> = Arc::new(WsPriceFeed::new(config.price_feed_url.clone()));
    let registry = FanoutRegistry::new();

    let supervisor = Arc::new(Supervisor::new(
        repository.clone(),
        feed,
        registry.clone(),
        config.scheduler.clone(),
    ));

    let mut supervisor_task = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run().await })
    };

    let state = AppState {
        config: config.clone(),
        repository,
        registry,
    };

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the router
    let app = Router::new()
        .merge(api::router())
        .merge(websocket::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start the server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("robotrader listening on {}", addr);

    let mut server = tokio::spawn(async move { axum::serve(listener, app).await });

    // The supervisor cannot run without the store; a failed fetch takes the
    // process down so the process manager restarts it.
    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            Ok(())
        }
        result = &mut supervisor_task => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("supervisor stopped")),
            Err(e) => Err(anyhow::Error::new(e).context("supervisor task panicked")),
        },
        result = &mut server => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("server stopped")),
            Err(e) => Err(anyhow::Error::new(e).context("server task panicked")),
        },
    };

    supervisor.shutdown().await;
    server.abort();

    if let Err(ref e) = outcome {
        error!("{:#}", e);
    }
    outcome
}
