use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::extract::{ConnectInfo, MatchedPath};
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use clipcache_otel::ACCESS_TARGET;
use once_cell::sync::Lazy;

#[derive(Clone, Debug)]
struct Cfg {
    enabled: bool,
    sample_n: u64,
    trust_forward: bool,
}

static CFG: Lazy<Cfg> = Lazy::new(|| Cfg {
    enabled: std::env::var("CLIPCACHE_ACCESS_LOG").ok().as_deref() != Some("0"),
    sample_n: std::env::var("CLIPCACHE_ACCESS_SAMPLE_N")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1)
        .max(1),
    trust_forward: std::env::var("CLIPCACHE_TRUST_FORWARD_HEADERS").ok().as_deref() == Some("1"),
});

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn first_forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("x-forwarded-for")?.to_str().ok()?;
    let ip = raw.split(',').next()?.trim();
    (!ip.is_empty()).then(|| ip.to_string())
}

/// One `http.access` event per request. Clip bodies stream after this
/// returns, so `dur_ms` covers the time to the response head.
pub async fn access_log_mw(req: Request<axum::body::Body>, next: Next) -> Response {
    if !CFG.enabled {
        return next.run(req).await;
    }
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string());
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string());
    let remote = if CFG.trust_forward {
        first_forwarded_ip(req.headers()).or(peer)
    } else {
        peer
    };

    let res = next.run(req).await;
    let n = COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    if CFG.sample_n > 1 && n % CFG.sample_n != 0 {
        return res;
    }
    let response_header = |name: &str| {
        res.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };
    tracing::info!(
        target: ACCESS_TARGET,
        method = %method,
        path = %path,
        route = route.as_deref().unwrap_or("-"),
        status = res.status().as_u16(),
        dur_ms = started.elapsed().as_millis() as u64,
        cache = %response_header("x-cache"),
        bytes = %response_header(header::CONTENT_LENGTH.as_str()),
        remote = remote.as_deref().unwrap_or("-"),
        "request"
    );
    res
}
