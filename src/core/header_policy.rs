//! Outbound header policy and log sanitization.

use axum::http::{HeaderMap, HeaderName};
use reqwest::header::{self as upstream, HeaderMap as UpstreamHeaderMap, HeaderValue};
use std::collections::BTreeMap;

/// User-agent the upstream expects from its own CLI.
pub const UPSTREAM_USER_AGENT: &str = "iFlow-Cli";

/// Client-supplied credential headers that must never reach the upstream.
const CLIENT_AUTH_HEADERS: &[&str] = &["authorization", "x-api-key", "x-goog-api-key", "api-key"];

/// Header values masked in request logs.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "api-key",
    "cookie",
    "set-cookie",
    "proxy-authorization",
];

const MASK: &str = "***";

/// Remove every client-supplied credential header.
pub fn strip_client_auth(headers: &mut UpstreamHeaderMap) {
    for name in CLIENT_AUTH_HEADERS {
        headers.remove(*name);
    }
}

/// Build the header set sent to the upstream.
///
/// Client credentials are stripped, then the gateway's bearer token, the fixed
/// user-agent and a JSON content type are injected.
pub fn upstream_headers(mut base: UpstreamHeaderMap, bearer_token: &str) -> UpstreamHeaderMap {
    strip_client_auth(&mut base);

    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", bearer_token)) {
        base.insert(upstream::AUTHORIZATION, value);
    }
    base.insert(
        upstream::USER_AGENT,
        HeaderValue::from_static(UPSTREAM_USER_AGENT),
    );
    base.insert(
        upstream::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    base
}

/// Copy headers into a log-friendly map, masking credentials.
pub fn sanitize_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let key = name.as_str().to_ascii_lowercase();
            let shown = if is_sensitive(name) {
                MASK.to_string()
            } else {
                value.to_str().unwrap_or("<binary>").to_string()
            };
            (key, shown)
        })
        .collect()
}

fn is_sensitive(name: &HeaderName) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|s| name.as_str().eq_ignore_ascii_case(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(pairs: &[(&'static str, &'static str)]) -> UpstreamHeaderMap {
        let mut map = UpstreamHeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    fn inbound(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, axum::http::HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn strips_client_credentials() {
        let out = upstream_headers(
            outbound(&[
                ("authorization", "Bearer client"),
                ("x-api-key", "client-key"),
                ("x-goog-api-key", "g"),
                ("x-trace", "keep"),
            ]),
            "gateway-token",
        );
        assert_eq!(out.get("authorization").unwrap(), "Bearer gateway-token");
        assert!(out.get("x-api-key").is_none());
        assert!(out.get("x-goog-api-key").is_none());
        assert_eq!(out.get("x-trace").unwrap(), "keep");
        assert_eq!(out.get("user-agent").unwrap(), UPSTREAM_USER_AGENT);
        assert_eq!(out.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn sanitize_masks_sensitive_values() {
        let log = sanitize_headers(&inbound(&[
            ("authorization", "Bearer secret"),
            ("cookie", "session=1"),
            ("accept", "application/json"),
        ]));
        assert_eq!(log["authorization"], "***");
        assert_eq!(log["cookie"], "***");
        assert_eq!(log["accept"], "application/json");
    }
}
