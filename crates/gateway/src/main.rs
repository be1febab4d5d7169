//! Manifold MCP Gateway
//!
//! One client-facing MCP endpoint fanning out to many stdio/HTTP/SSE MCP
//! servers, with their catalogs merged under namespaced names.

mod catalog;
mod config;
mod dispatch;
mod error;
mod http;
mod legacy;
mod modern;
mod session;
mod shutdown;
mod timeouts;
mod upstream;

use crate::config::{CliArgs, GatewaySettings, LogLevel};
use crate::dispatch::GatewayCore;
use crate::session::BroadcastHub;
use anyhow::Context as _;
use clap::Parser;
use std::io::{IsTerminal as _, stdout};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let settings = GatewaySettings::from_cli(&cli);
    init_logging(settings.log_level);

    tracing::info!("Starting Manifold MCP Gateway v{VERSION}");
    if let Err(e) = run(cli, settings).await {
        tracing::error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

async fn run(cli: CliArgs, settings: GatewaySettings) -> anyhow::Result<()> {
    let configs = config::load_config(&cli.config)?;
    tracing::info!("Loaded {} upstream server(s) from config", configs.len());

    // Redirects are disabled; upstream endpoints are configured with their
    // final URL.
    let http_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("build upstream HTTP client")?;

    let hub = Arc::new(BroadcastHub::default());
    let (pool, report) = upstream::connect_all(
        configs,
        http_client,
        hub.clone(),
        settings.connect_timeout,
        settings.max_parallel_connects,
    )
    .await;
    tracing::info!(
        connected = report.connected.len(),
        failed = report.failed.len(),
        "upstream pool ready"
    );

    let core = Arc::new(GatewayCore::new(Arc::new(pool), hub, settings.clone()));
    let state = http::AppState::new(core);

    let ct = CancellationToken::new();
    state.spawn_reapers(&ct);

    let app = http::router(state.clone());
    let listener = bind_listener(settings.port)?;
    let listener =
        tokio::net::TcpListener::from_std(listener).context("register listener with runtime")?;
    tracing::info!(port = settings.port, "gateway listening");

    let server_ct = ct.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                server_ct.cancelled().await;
            })
            .await
    });

    // Panics anywhere in the process request a graceful shutdown too.
    let shutdown_trigger = CancellationToken::new();
    install_panic_hook(shutdown_trigger.clone());

    wait_for_shutdown_signal(&shutdown_trigger).await;
    spawn_force_exit_watcher();
    shutdown::run(state, ct, server).await;
    Ok(())
}

/// Bind the listener through socket2 so accepted connections inherit TCP
/// keep-alive with 15s probes (dead-peer detection under the SSE streams).
/// No read timeout is configured.
fn bind_listener(port: u16) -> anyhow::Result<std::net::TcpListener> {
    use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

    let addr: std::net::SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
    let socket =
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).context("create socket")?;
    socket
        .set_reuse_address(true)
        .context("set SO_REUSEADDR")?;
    socket
        .set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(15)))
        .context("set TCP keep-alive")?;
    socket
        .set_nonblocking(true)
        .context("set non-blocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind {addr}"))?;
    socket.listen(1024).context("listen")?;
    Ok(socket.into())
}

fn install_panic_hook(trigger: CancellationToken) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        trigger.cancel();
    }));
}

/// Wait for the first shutdown request: Ctrl+C, SIGTERM, or a panic.
async fn wait_for_shutdown_signal(panic_trigger: &CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            }
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
        () = panic_trigger.cancelled() => {
            tracing::error!("Panic observed, initiating shutdown...");
        }
    }
}

/// A second signal during shutdown forces an immediate exit.
fn spawn_force_exit_watcher() {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = signal::ctrl_c() => {}
            () = terminate => {}
        }
        tracing::error!("second shutdown signal; exiting immediately");
        std::process::exit(1);
    });
}

/// Initialize logging based on the configured level.
fn init_logging(level: LogLevel) {
    let directive = match level {
        LogLevel::Info => "info",
        LogLevel::None => "off",
        LogLevel::Debug => "debug",
    };
    let env_filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));

    // Human-readable output on a TTY, JSON otherwise.
    if stdout().is_terminal() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}
