//! Filedock server binary.
//!
//! A small multi-user file hosting service. Requests are framed directly off
//! the socket (HTTP and HTTPS), routed through an Axum router, and answered
//! with one response per connection. Users register, sign in with a session
//! cookie, and manage files under their own storage directory.

mod app;
mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod files;
mod http;
mod logging;
mod multipart;
mod pages;
mod request;
mod response;
mod server;
mod session;
mod storage;
mod tls;
mod users;

use axum::extract::Extension;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::http::RequestScheme;
use crate::request::FrameLimits;
use crate::server::ConnectionSettings;
use crate::session::{MemorySessionStore, SharedSessions};
use crate::storage::Storage;
use crate::users::UserStore;

shadow!(build);

/// Starts the Filedock server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;
    let users = Arc::new(UserStore::new(PathBuf::from(&args.users_file)));
    let sessions: SharedSessions = Arc::new(MemorySessionStore::new(Duration::from_secs(
        args.session_ttl_secs,
    )));
    let settings = ConnectionSettings {
        limits: FrameLimits {
            max_header_bytes: args.max_header_bytes,
            max_body_bytes: args.max_body_bytes,
            idle_timeout: Duration::from_secs(args.request_timeout_secs),
        },
        handshake_timeout: Duration::from_secs(args.request_timeout_secs),
    };

    let app = app::build_router(storage, users, sessions.clone());

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let http_listener = TcpListener::bind(http_addr).await?;
    info!("🚀 Starting HTTP server at {}", http_addr);
    let http_server = server::serve_http(
        http_listener,
        app.clone().layer(Extension(RequestScheme::Http)),
        settings,
    );

    let https_server = async {
        if args.no_https {
            return std::future::pending::<std::io::Result<()>>().await;
        }
        let acceptor = tls::build_tls_acceptor(&args, host).await?;
        let https_addr = SocketAddr::new(host, args.https_port);
        let https_listener = TcpListener::bind(https_addr).await?;
        info!("🔒 Starting HTTPS server at {}", https_addr);
        server::serve_https(
            https_listener,
            acceptor,
            app.layer(Extension(RequestScheme::Https)),
            settings,
        )
        .await
    };

    spawn_background_tasks(sessions);
    tokio::select! {
        result = http_server => result?,
        result = https_server => result?,
        _ = shutdown_signal() => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
}
