//! Header hygiene for proxied requests.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use base64::Engine;

/// Hop-by-hop headers per RFC 7230 §6.1; never forwarded end-to-end.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Copy `headers` minus the hop-by-hop set and anything the `Connection`
/// header names.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    // Connection can list additional per-connection headers.
    let connection_named: Vec<String> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) || connection_named.contains(&lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// `Authorization: Basic …` value carrying the sandbox-scoped token, so the
/// agent HTTP server inside the sandbox can authenticate the request.
pub fn sandbox_basic_auth(sandbox_token: &str) -> HeaderValue {
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("drydock:{sandbox_token}"));
    let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
    value.set_sensitive(true);
    value
}

/// Pull one cookie's value out of the `Cookie` header(s).
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(axum::http::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
}

/// Headers a browser request must not carry into the sandbox or upstream:
/// our session cookie and any caller-supplied credentials.
pub fn strip_credentials(headers: &mut HeaderMap) {
    headers.remove(axum::http::header::AUTHORIZATION);
    headers.remove(axum::http::header::COOKIE);
    headers.remove(HeaderName::from_static("x-api-key"));
    // Host is derived from the target URL on the way out.
    headers.remove(axum::http::header::HOST);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let input = headers(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("upgrade", "websocket"),
            ("content-type", "text/plain"),
        ]);
        let out = strip_hop_by_hop(&input);
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("content-type"));
    }

    #[test]
    fn connection_named_headers_are_stripped_too() {
        let input = headers(&[
            ("connection", "x-custom, x-other"),
            ("x-custom", "1"),
            ("x-other", "2"),
            ("accept", "*/*"),
        ]);
        let out = strip_hop_by_hop(&input);
        assert!(!out.contains_key("x-custom"));
        assert!(!out.contains_key("x-other"));
        assert!(out.contains_key("accept"));
    }

    #[test]
    fn basic_auth_is_decodable() {
        let value = sandbox_basic_auth("secret-token");
        let raw = value.to_str().unwrap().strip_prefix("Basic ").unwrap().to_string();
        let decoded = base64::engine::general_purpose::STANDARD.decode(raw).unwrap();
        assert_eq!(decoded, b"drydock:secret-token");
    }

    #[test]
    fn cookie_extraction() {
        let input = headers(&[("cookie", "a=1; drydock_session=tok en?no; b=2")]);
        assert_eq!(
            cookie_value(&input, "drydock_session").as_deref(),
            Some("tok en?no")
        );
        assert_eq!(cookie_value(&input, "missing"), None);
    }

    #[test]
    fn credentials_are_removed() {
        let mut input = headers(&[
            ("authorization", "Bearer x"),
            ("cookie", "s=1"),
            ("x-api-key", "k"),
            ("host", "a.example.com"),
            ("accept", "*/*"),
        ]);
        strip_credentials(&mut input);
        assert_eq!(input.len(), 1);
        assert!(input.contains_key("accept"));
    }
}
