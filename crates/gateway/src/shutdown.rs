//! Ordered shutdown: upstreams, then sessions, then the listener.
//!
//! Every phase is capped. A phase that overruns its cap forces the process
//! to exit with code 1 rather than hang.

use crate::http::AppState;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const UPSTREAM_DISCONNECT_CAP: Duration = Duration::from_secs(10);
const SERVER_CLOSE_CAP: Duration = Duration::from_secs(5);

/// Run the shutdown sequence. Only the first caller proceeds; later
/// invocations (a racing signal and panic hook, say) are no-ops.
pub async fn run(
    state: Arc<AppState>,
    server_ct: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
) {
    if state.core.shutting_down.swap(true, Ordering::SeqCst) {
        return;
    }
    tracing::info!("shutdown initiated");

    // 1. Disconnect every upstream in parallel, each under its own cap.
    //    Stdio children are terminated by disconnect() regardless of
    //    whether the client close succeeded.
    let mut tasks: JoinSet<bool> = JoinSet::new();
    for upstream in state.core.pool.all() {
        tasks.spawn(async move {
            let name = upstream.name.clone();
            if timeout(UPSTREAM_DISCONNECT_CAP, upstream.disconnect())
                .await
                .is_err()
            {
                tracing::error!(upstream = %name, "disconnect exceeded its cap");
                return false;
            }
            tracing::info!(upstream = %name, "upstream disconnected");
            true
        });
    }
    let mut overran = false;
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(within_cap) => overran |= !within_cap,
            Err(e) => tracing::error!(error = %e, "disconnect task aborted"),
        }
    }
    if overran {
        tracing::error!("upstream disconnect overran its cap; forcing exit");
        std::process::exit(1);
    }

    // 2. Close every client session. Closes are synchronous map-and-channel
    //    operations, so the per-session cap holds by construction.
    state.modern.close_all();
    state.legacy.close_all();
    tracing::info!("client sessions closed");

    // 3. Stop the HTTP listener.
    server_ct.cancel();
    match timeout(SERVER_CLOSE_CAP, server).await {
        Ok(Ok(Ok(()))) => tracing::info!("listener closed"),
        Ok(Ok(Err(e))) => tracing::warn!(error = %e, "http server ended with error"),
        Ok(Err(e)) => tracing::warn!(error = %e, "http server task aborted"),
        Err(_) => {
            tracing::error!("listener close exceeded its cap; forcing exit");
            std::process::exit(1);
        }
    }

    tracing::info!("gateway shut down gracefully");
}
