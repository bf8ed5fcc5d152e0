//! Per-client request throttling.
//!
//! Fixed-window counters keyed by client IP. The key falls back from the
//! connection address to the first `x-forwarded-for` entry, and finally to a
//! shared "unknown" bucket so unattributable traffic is still bounded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;

use crate::{config::AppConfig, response::ApiResponse, state::AppState};

const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    entries: DashMap<String, WindowEntry>,
    enabled: bool,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(enabled: bool, max_requests: u32, window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            enabled,
            max_requests: max_requests.max(1),
            window,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_enabled,
            config.rate_limit_max_requests,
            Duration::from_secs(config.rate_limit_window_seconds),
        )
    }

    /// Records one request for `key`. Returns `Err(retry_after_secs)` when the
    /// window budget is exhausted.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        if !self.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count < self.max_requests {
            entry.count += 1;
            Ok(())
        } else {
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(entry.window_start))
                .as_secs()
                .max(1);
            Err(retry_after)
        }
    }

    /// Drops windows that expired more than one window ago.
    pub fn evict_stale(&self) {
        let now = Instant::now();
        let expiry = self.window * 2;
        self.entries
            .retain(|_, entry| now.duration_since(entry.window_start) < expiry);
    }

    pub fn tracked_clients(&self) -> usize {
        self.entries.len()
    }
}

/// Resolves the throttling key for a request: connection address, then the
/// first `x-forwarded-for` entry, then the shared unknown bucket.
fn client_key(request: &Request<Body>) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                let trimmed = first.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
    }

    UNKNOWN_CLIENT.to_string()
}

pub async fn throttle(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = client_key(&request);
    match state.limiter.check(&key) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::debug!(client = %key, retry_after, "request throttled");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", retry_after.to_string())],
                Json(ApiResponse::failure("too many requests")),
            )
                .into_response()
        }
    }
}

/// Periodically evicts expired windows so the key map stays bounded.
pub fn spawn_eviction_task(limiter: Arc<RateLimiter>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            limiter.evict_stale();
            tracing::debug!(
                tracked_clients = limiter.tracked_clients(),
                "rate limiter eviction pass"
            );
        }
    });
}
