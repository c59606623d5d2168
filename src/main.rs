mod config;
mod error;
mod extractor;
mod handlers;
mod ledger;
mod resolver;
mod ytdlp;

use std::{collections::HashSet, sync::Arc};

use axum::http::{HeaderValue, Method};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};

use crate::{
    config::{Config, normalize_origin},
    error::ApiError,
    handlers::AppState,
    ledger::JobLedger,
    ytdlp::YtDlp,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "fb_downloader=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env()?;

    tokio::fs::create_dir_all(&config.downloads_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create downloads directory {:?}: {error}",
                config.downloads_dir
            ))
        })?;

    let extractor = YtDlp::from_command_line(&config.yt_dlp_command).ok_or_else(|| {
        ApiError::internal("YT_DLP_PATH does not name an executable.")
    })?;
    info!(
        "Using extractor command {:?}; files go to {:?}",
        config.yt_dlp_command, config.downloads_dir
    );

    let state = AppState {
        ledger: JobLedger::new(),
        extractor: Arc::new(extractor),
        downloads_dir: config.downloads_dir.clone(),
    };

    let app = handlers::routes(state)
        .layer(build_cors_layer(config.allowed_origins))
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!(
            "Could not bind {}: {error}",
            config.bind_addr
        ))
    })?;

    info!("Facebook downloader listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

fn build_cors_layer(allowed_origins: HashSet<String>) -> CorsLayer {
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allowed_origins = Arc::new(allowed_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}
