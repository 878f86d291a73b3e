use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use termstream::AppState;
use termstream::config::{AppConfig, FileConfig, load_config};
use termstream::multiplexer::{MultiplexerBridge, Tmux};

#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "termstream")]
#[command(about = "Stream terminal sessions to reconnecting clients")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let default_directive = if args.debug {
        "termstream=debug,tower_http=debug,info"
    } else {
        "termstream=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = load_config(args.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    let config = AppConfig::from_file(&file_config);

    let bridge = if config.multiplexer.enabled {
        let bridge = MultiplexerBridge::new(Arc::new(Tmux::new(&config.multiplexer.command)));
        if !bridge.is_available().await {
            warn!(
                "Multiplexer '{}' not available; multiplexer routes will report it",
                config.multiplexer.command
            );
        }
        bridge
    } else {
        MultiplexerBridge::disabled()
    };

    let state = AppState::new(config.clone(), bridge);
    let registry = state.registry.clone();
    if registry.clone().spawn_cleanup_task().is_some() {
        info!(
            "Sweeping exited sessions every {:?}",
            config.sessions.cleanup_interval
        );
    }

    let app = termstream::router(state)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Termstream listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  POST   /sessions                 - Create session");
    info!("  GET    /sessions/{{id}}/stream     - Snapshot + live frames (WebSocket)");
    info!("  GET    /sessions/{{id}}/snapshot   - Current snapshot");
    info!("  POST   /sessions/{{id}}/input      - Send text or a named key");
    info!("  GET    /multiplexer/sessions     - Multiplexer tree");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Stopping running sessions...");
    registry.shutdown().await;

    server_result
}
