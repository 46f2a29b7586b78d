mod allocator;
mod client;
mod config;
mod conn;
mod engine;
mod group;
mod tls;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::group::Groups;
use crate::web::AppState;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/palaver.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    if !std::path::Path::new(&config.groups.dir).is_dir() {
        tracing::warn!(
            "Groups directory '{}' does not exist — no group can be joined until it is created.",
            config.groups.dir
        );
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    // One-shot media engine; every peer connection comes from this API
    let api = Arc::new(engine::build_api().context("Failed to build WebRTC API")?);
    let groups = Groups::new(api, &config.groups.dir, config.groups.chat_history);

    let insecure = config.server.insecure;
    let tls_cert = config.server.tls_cert.clone();
    let tls_key = config.server.tls_key.clone();

    let state = Arc::new(AppState {
        config,
        groups,
        started_at: std::time::Instant::now(),
    });

    let app = web::build_router(Arc::clone(&state)).layer(TraceLayer::new_for_http());

    tracing::info!("===========================================");
    tracing::info!("  Palaver SFU v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Listening on {}", state.base_url());
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    // Background task: drop zombie groups that emptied out
    let cleanup_state = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            cleanup_state.groups.cleanup();
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    if insecure {
        tracing::warn!("TLS disabled (server.insecure), serving plain HTTP");
        let shutdown = async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        };
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("Server error")?;
    } else {
        let acceptor = tls::acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("Failed to accept TCP connection: {e}");
                            continue;
                        }
                    };

                    let acceptor = acceptor.clone();
                    let app = app.clone();

                    tokio::spawn(async move {
                        let tls_stream = match tokio::time::timeout(
                            std::time::Duration::from_secs(10),
                            acceptor.accept(stream),
                        ).await {
                            Ok(Ok(s)) => s,
                            Ok(Err(e)) => {
                                tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                                return;
                            }
                            Err(_) => {
                                tracing::debug!(%peer_addr, "TLS handshake timed out");
                                return;
                            }
                        };

                        let io = hyper_util::rt::TokioIo::new(tls_stream);
                        let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                        let builder = hyper_util::server::conn::auto::Builder::new(
                            hyper_util::rt::TokioExecutor::new(),
                        );

                        if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                            tracing::debug!(%peer_addr, "Connection error: {e}");
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => break,
                _ = sigterm.recv() => break,
            }
        }
    }

    tracing::info!("Shutting down, disconnecting all clients");
    state.groups.range(|group| {
        for member in group.members() {
            member.done.cancel();
        }
    });

    tracing::info!("Palaver server shut down cleanly");
    Ok(())
}
