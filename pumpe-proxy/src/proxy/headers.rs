//! Header hygiene and addressing helpers for the forward pipelines.

use http::HeaderMap;
use http::header::HeaderValue;

/// The steering headers. `Id` pins a gate, `Type` picks a kind; both are
/// stripped before anything leaves the proxy.
pub const HEADER_GATE_ID: &str = "Proxy-Pumpe-Gate-Id";
pub const HEADER_GATE_TYPE: &str = "Proxy-Pumpe-Gate-Type";

/// Hop-by-hop headers, which apply to a single transport hop and must not
/// be forwarded, plus the proxy's own steering headers.
pub const HOP_HEADERS: [&str; 11] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Proxy-Connection",
    "Te",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
    HEADER_GATE_ID,
    HEADER_GATE_TYPE,
];

/// Remove every hop-by-hop header.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

/// Remove every header named by a `Connection` header value. Values are
/// comma-separated lists of header names; empty tokens are skipped. The
/// `Connection` header itself is left alone here, the hop-by-hop pass
/// removes it.
pub fn strip_connection_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all("connection")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
}

/// Record `host` as the immediate client in `X-Forwarded-For`, appending
/// to whatever upstream proxies already recorded.
pub fn append_forwarded_for(headers: &mut HeaderMap, host: &str) {
    let existing: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    let joined = if existing.is_empty() {
        host.to_string()
    } else {
        format!("{}, {}", existing.join(", "), host)
    };

    if let Ok(value) = HeaderValue::from_str(&joined) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Normalize a request authority: `host` without a port gets `:443`.
pub fn remote_addr_from_host(host: &str) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:443")
    }
}

/// Copy every `(name, value)` pair from `src` into `dst`, preserving
/// multiplicity.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name, value.clone());
    }
}
