use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Clone, Debug)]
struct Cfg {
    enabled: bool,
    sample_n: u64,
    ua: bool,
    trust_forward: bool,
}

static CFG: Lazy<Cfg> = Lazy::new(|| Cfg {
    enabled: std::env::var("VYNK_ACCESS_LOG").ok().as_deref() == Some("1"),
    sample_n: std::env::var("VYNK_ACCESS_SAMPLE_N")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1)
        .max(1),
    ua: std::env::var("VYNK_ACCESS_UA").ok().as_deref() == Some("1"),
    trust_forward: std::env::var("VYNK_TRUST_FORWARD_HEADERS").ok().as_deref() == Some("1"),
});

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn first_forwarded_ip(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(v) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        let ip = v.split(',').next().unwrap_or("").trim();
        if !ip.is_empty() {
            // strip port if present
            if let Some((host, port)) = ip.rsplit_once(':') {
                if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) {
                    return Some(host.to_string());
                }
            }
            return Some(ip.to_string());
        }
    }
    if let Some(v) = headers.get("forwarded").and_then(|h| h.to_str().ok()) {
        for part in v.split(';').flat_map(|s| s.split(',')) {
            if let Some(rest) = part.trim().strip_prefix("for=") {
                return Some(rest.trim_matches('"').to_string());
            }
        }
    }
    None
}

pub async fn access_log_mw(req: Request<axum::body::Body>, next: Next) -> Response {
    if !CFG.enabled {
        return next.run(req).await;
    }
    let started = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let peer = req
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string());
    let remote = if CFG.trust_forward {
        first_forwarded_ip(req.headers()).or(peer)
    } else {
        peer
    };
    let ua = CFG
        .ua
        .then(|| {
            req.headers()
                .get(axum::http::header::USER_AGENT)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .flatten();
    let res = next.run(req).await;
    let n = COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    if CFG.sample_n > 1 && n % CFG.sample_n != 0 {
        return res;
    }
    tracing::info!(
        target: "http.access",
        method = method.as_str(),
        path = %path,
        status = res.status().as_u16(),
        dur_ms = started.elapsed().as_millis() as u64,
        remote = remote.as_deref().unwrap_or("-"),
        ua = ua.as_deref().unwrap_or("-"),
        "request"
    );
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.5:4711, 10.0.0.1"),
        );
        assert_eq!(first_forwarded_ip(&headers).as_deref(), Some("203.0.113.5"));

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("2001:db8::1"));
        assert_eq!(first_forwarded_ip(&headers).as_deref(), Some("2001:db8::1"));

        let mut headers = HeaderMap::new();
        headers.insert("forwarded", HeaderValue::from_static("for=\"198.51.100.3\";proto=https"));
        assert_eq!(first_forwarded_ip(&headers).as_deref(), Some("198.51.100.3"));
        assert_eq!(first_forwarded_ip(&HeaderMap::new()), None);
    }
}
