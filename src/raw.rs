use std::io;

use chrono::Utc;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Grace period between the FIN and the hard close of an answered socket.
const DESTROY_GRACE: Duration = Duration::from_millis(1000);

/// Current time as an RFC 1123 `Date` header value.
pub(crate) fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Serializes a minimal HTTP/1.1 response head plus body.
///
/// Header precedence: caller headers override the `server` and
/// `content-type` defaults; `connection`, `date` and `content-length` are
/// always forced. 407 responses get a `proxy-authenticate` challenge unless
/// the caller already set one.
pub(crate) fn encode_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    auth_realm: &str,
) -> Vec<u8> {
    let mut merged = headers.clone();
    if !merged.contains_key(header::SERVER) {
        if let Ok(value) = HeaderValue::from_str(auth_realm) {
            merged.insert(header::SERVER, value);
        }
    }
    if !merged.contains_key(header::CONTENT_TYPE) {
        merged.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    }
    merged.insert(header::CONNECTION, HeaderValue::from_static("close"));
    if let Ok(value) = HeaderValue::from_str(&http_date()) {
        merged.insert(header::DATE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&body.len().to_string()) {
        merged.insert(header::CONTENT_LENGTH, value);
    }
    if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
        && !merged.contains_key(header::PROXY_AUTHENTICATE)
    {
        if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{auth_realm}\"")) {
            merged.insert(header::PROXY_AUTHENTICATE, value);
        }
    }

    let reason = status.canonical_reason().unwrap_or("Unknown Status Code");
    let mut out = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).into_bytes();
    for (name, value) in merged.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Writes a response directly to a socket that no longer has a response
/// writer, then tears the socket down.
///
/// Write failures are logged and swallowed; a socket that cannot take the
/// response is already dead.
pub(crate) async fn send_raw_response<S>(
    mut socket: S,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    auth_realm: &str,
) where
    S: AsyncWrite + Unpin + Send + 'static,
{
    let payload = encode_response(status, headers, body.as_bytes(), auth_realm);
    if let Err(e) = socket.write_all(&payload).await {
        debug!("failed to write raw response: {e}");
        return;
    }
    if let Err(e) = socket.flush().await {
        debug!("failed to flush raw response: {e}");
        return;
    }
    finish_socket(socket).await;
}

/// Half-closes the socket right away so the peer sees everything written,
/// and hard-closes it after a short grace period.
pub(crate) async fn finish_socket<S>(mut socket: S)
where
    S: AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = socket.shutdown().await {
        debug!("socket shutdown failed: {e}");
        return;
    }
    tokio::spawn(async move {
        sleep(DESTROY_GRACE).await;
        drop(socket);
    });
}

/// Confirms an established tunnel on the raw socket.
pub(crate) async fn write_connection_established<S>(socket: &mut S) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(payload: &[u8]) -> (String, Vec<(String, String)>, String) {
        let text = String::from_utf8(payload.to_vec()).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap().to_string();
        let headers = lines
            .map(|line| {
                let (name, value) = line.split_once(": ").unwrap();
                (name.to_ascii_lowercase(), value.to_string())
            })
            .collect();
        (status_line, headers, body.to_string())
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn forces_connection_date_and_content_length() {
        let payload =
            encode_response(StatusCode::BAD_REQUEST, &HeaderMap::new(), b"oops", "ProxyChain");
        let (status_line, headers, body) = decode(&payload);
        assert_eq!(status_line, "HTTP/1.1 400 Bad Request");
        assert_eq!(header(&headers, "connection"), Some("close"));
        assert_eq!(header(&headers, "content-length"), Some("4"));
        assert_eq!(
            header(&headers, "content-type"),
            Some("text/plain; charset=utf-8")
        );
        assert_eq!(header(&headers, "server"), Some("ProxyChain"));
        assert!(header(&headers, "date").unwrap().ends_with("GMT"));
        assert_eq!(body, "oops");
    }

    #[test]
    fn caller_headers_win_over_defaults_but_not_forced_ones() {
        let mut extra = HeaderMap::new();
        extra.insert(header::SERVER, HeaderValue::from_static("custom"));
        extra.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        let payload = encode_response(StatusCode::OK, &extra, b"", "ProxyChain");
        let (_, headers, _) = decode(&payload);
        assert_eq!(header(&headers, "server"), Some("custom"));
        assert_eq!(header(&headers, "connection"), Some("close"));
    }

    #[test]
    fn injects_the_challenge_for_407() {
        let payload = encode_response(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            &HeaderMap::new(),
            b"go away",
            "ProxyChain",
        );
        let (status_line, headers, body) = decode(&payload);
        assert_eq!(status_line, "HTTP/1.1 407 Proxy Authentication Required");
        assert_eq!(
            header(&headers, "proxy-authenticate"),
            Some("Basic realm=\"ProxyChain\"")
        );
        assert_eq!(body, "go away");
    }

    #[test]
    fn keeps_a_caller_supplied_challenge() {
        let mut extra = HeaderMap::new();
        extra.insert(
            header::PROXY_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"other\""),
        );
        let payload = encode_response(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            &extra,
            b"",
            "ProxyChain",
        );
        let (_, headers, _) = decode(&payload);
        assert_eq!(
            header(&headers, "proxy-authenticate"),
            Some("Basic realm=\"other\"")
        );
    }

    #[test]
    fn unknown_codes_get_a_placeholder_reason() {
        let status = StatusCode::from_u16(599).unwrap();
        let payload = encode_response(status, &HeaderMap::new(), b"", "ProxyChain");
        let (status_line, _, _) = decode(&payload);
        assert_eq!(status_line, "HTTP/1.1 599 Unknown Status Code");
    }
}
