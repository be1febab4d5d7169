use std::time::Duration;

/// Default upstream connect timeout (milliseconds) when `--timeout` is not given.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Overall cap for the capability probe issued right after an upstream connects.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Delays (seconds) before each legacy-SSE retry during fallback probing.
pub const FALLBACK_RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 3];

/// Global maximum for the upstream connect timeout (milliseconds).
///
/// `MANIFOLD_CONNECT_TIMEOUT_MAX_MS` caps whatever `--timeout` asks for, so a
/// deployment can bound startup time regardless of per-invocation flags.
#[must_use]
pub fn connect_timeout_max_ms() -> Option<u64> {
    manifold_env::positive_u64("MANIFOLD_CONNECT_TIMEOUT_MAX_MS")
}

/// The connect timeout actually used, after clamping to the env cap.
#[must_use]
pub fn effective_connect_timeout(requested_ms: u64) -> Duration {
    let requested = if requested_ms == 0 {
        DEFAULT_CONNECT_TIMEOUT_MS
    } else {
        requested_ms
    };
    let capped = match connect_timeout_max_ms() {
        Some(cap) => requested.min(cap),
        None => requested,
    };
    Duration::from_millis(capped.max(1))
}
