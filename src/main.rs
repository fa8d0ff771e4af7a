use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ktulhuEmbed::{api, config::ServiceConfig, inference::SentenceEncoder, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = ServiceConfig::from_env()?;
    info!(
        model = %cfg.model,
        device = %cfg.device,
        revision = %cfg.revision,
        "🚀 starting embedding service"
    );

    // -----------------------------
    // Model (loaded once, before the socket is bound)
    // -----------------------------
    let load_cfg = cfg.clone();
    let encoder = tokio::task::spawn_blocking(move || SentenceEncoder::load(&load_cfg)).await??;
    let state = AppState::new(Arc::new(encoder));

    // -----------------------------
    // Router
    // -----------------------------
    let app = api::app(state, cfg.max_body_bytes);

    let listener = TcpListener::bind(cfg.bind_addr).await?;
    info!("🌐 HTTP listening on http://{}", cfg.bind_addr);
    info!("🧮 POST /embed, GET /health");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("embedding service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
