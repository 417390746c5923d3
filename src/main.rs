//! Quiz Live Back binary entrypoint wiring configuration, storage, REST and WebSocket layers.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quiz_live_back::{
    config::AppConfig,
    dao::session_store::{MemorySessionStore, SessionStore},
    routes,
    services::identity::TokenDirectory,
    state::{AppState, SharedState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let store = build_store(&config).await?;
    let identity = Arc::new(TokenDirectory::new(&config.users));
    if config.users.is_empty() {
        warn!("no users configured; admin routes will reject every request");
    }

    let app_state = AppState::new(store, identity, config);
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

/// Pick the storage backend: MongoDB when `MONGO_URI` is set and the
/// `mongo-store` feature is enabled, the seeded in-memory store otherwise.
async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn SessionStore>> {
    #[cfg(feature = "mongo-store")]
    if let Ok(uri) = env::var("MONGO_URI") {
        use quiz_live_back::dao::session_store::mongodb::{MongoConfig, MongoSessionStore};

        let db_name = env::var("MONGO_DB").ok();
        let mongo_config = MongoConfig::from_uri(&uri, db_name.as_deref())
            .await
            .context("parsing MONGO_URI")?;
        let store = MongoSessionStore::connect(mongo_config)
            .await
            .context("connecting to MongoDB")?;
        if !config.quizzes.is_empty() {
            warn!("seed quizzes are only loaded into the in-memory store; ignoring them");
        }
        info!("using MongoDB session store");
        return Ok(Arc::new(store));
    }

    let store = MemorySessionStore::new();
    for quiz in &config.quizzes {
        let (quiz, questions) = quiz.to_entities();
        store.insert_quiz(quiz, questions).await;
    }
    info!(
        quizzes = config.quizzes.len(),
        "using in-memory session store"
    );
    Ok(Arc::new(store))
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
