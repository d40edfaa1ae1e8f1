use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use http::{header, HeaderMap, Method, StatusCode};

use crate::error::{BoxError, HandlerError, RequestError};
use crate::registry::ConnectionId;

/// Synthetic response produced instead of forwarding the request.
#[derive(Debug, Clone, Default)]
pub struct CustomResponse {
    /// Status to answer with; 200 when absent.
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Producer of a [`CustomResponse`], installed per request by the policy.
pub type CustomResponseFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = CustomResponse> + Send>> + Send + Sync>;

/// Decision input handed to the policy callback, one per request.
///
/// `username` and `password` are empty unless the client sent a valid
/// `Proxy-Authorization: Basic` header.
#[derive(Debug, Clone)]
pub struct PolicyInput {
    pub connection_id: ConnectionId,
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    pub username: String,
    pub password: String,
    pub hostname: String,
    pub port: u16,
    pub is_http: bool,
}

/// Decision returned by the policy callback; every field is optional.
#[derive(Clone, Default)]
pub struct PolicyResult {
    /// Challenge the client with 407 instead of serving the request.
    pub request_authentication: bool,
    /// Body of the 407 challenge; a default message when absent.
    pub fail_msg: Option<String>,
    /// Route the request through this upstream proxy (`http` or `socks`).
    pub upstream_proxy_url: Option<String>,
    /// Serve a synthetic response instead of forwarding (HTTP form only,
    /// mutually exclusive with `upstream_proxy_url`).
    pub custom_response: Option<CustomResponseFn>,
    /// Source address to bind outbound sockets to.
    pub local_address: Option<IpAddr>,
}

/// Future returned by the policy callback.
pub type PolicyFuture = Pin<Box<dyn Future<Output = Result<PolicyResult, BoxError>> + Send>>;

/// Embedder-supplied decision function.
///
/// May resolve asynchronously; synchronous embedders return a ready future.
/// Returned errors propagate to the dispatcher and surface as 500.
pub type PolicyFn = Arc<dyn Fn(PolicyInput) -> PolicyFuture + Send + Sync>;

/// Username and password taken from a `Proxy-Authorization` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Parses the `Proxy-Authorization` header when present.
///
/// Only the `Basic` scheme is accepted. The decoded payload is split on the
/// first colon; everything after it is the password. A missing header
/// yields empty credentials.
pub fn parse_proxy_authorization(headers: &HeaderMap) -> Result<BasicCredentials, RequestError> {
    let Some(value) = headers.get(header::PROXY_AUTHORIZATION) else {
        return Ok(BasicCredentials::default());
    };
    let value = value.to_str().map_err(|_| invalid_header())?;
    let (scheme, payload) = value.trim().split_once(' ').ok_or_else(invalid_header)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(RequestError::bad_request(
            "The \"Proxy-Authorization\" header must have the \"Basic\" type.",
        ));
    }
    let decoded = general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|_| invalid_header())?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid_header())?;
    let (username, password) = match decoded.split_once(':') {
        Some((username, password)) => (username.to_string(), password.to_string()),
        None => (decoded, String::new()),
    };
    Ok(BasicCredentials { username, password })
}

fn invalid_header() -> RequestError {
    RequestError::bad_request("Invalid \"Proxy-Authorization\" header")
}

/// Runs the policy callback for one request.
///
/// Without a configured callback the request sails through with an empty
/// decision and the authorization header is not even inspected.
pub(crate) async fn invoke_policy(
    policy: Option<&PolicyFn>,
    mut input: PolicyInput,
) -> Result<PolicyResult, HandlerError> {
    let Some(policy) = policy else {
        return Ok(PolicyResult::default());
    };
    let credentials = parse_proxy_authorization(&input.headers)?;
    input.username = credentials.username;
    input.password = credentials.password;
    policy(input).await.map_err(HandlerError::Policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::PROXY_AUTHORIZATION,
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    fn basic(payload: &str) -> String {
        format!("Basic {}", general_purpose::STANDARD.encode(payload))
    }

    #[test]
    fn missing_header_yields_empty_credentials() {
        let credentials = parse_proxy_authorization(&HeaderMap::new()).unwrap();
        assert_eq!(credentials, BasicCredentials::default());
    }

    #[test]
    fn splits_on_the_first_colon_only() {
        let credentials =
            parse_proxy_authorization(&headers_with(&basic("u:p:q"))).unwrap();
        assert_eq!(credentials.username, "u");
        assert_eq!(credentials.password, "p:q");
    }

    #[test]
    fn password_may_be_absent() {
        let credentials = parse_proxy_authorization(&headers_with(&basic("solo"))).unwrap();
        assert_eq!(credentials.username, "solo");
        assert_eq!(credentials.password, "");
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let value = format!("basic {}", general_purpose::STANDARD.encode("a:b"));
        let credentials = parse_proxy_authorization(&headers_with(&value)).unwrap();
        assert_eq!(credentials.username, "a");
    }

    #[test]
    fn rejects_other_schemes() {
        let err = parse_proxy_authorization(&headers_with("Bearer abc")).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            err.message,
            "The \"Proxy-Authorization\" header must have the \"Basic\" type."
        );
    }

    #[test]
    fn rejects_malformed_values() {
        for value in ["Basic", "Basic !!!not-base64!!!"] {
            let err = parse_proxy_authorization(&headers_with(value)).unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST);
            assert_eq!(err.message, "Invalid \"Proxy-Authorization\" header");
        }
    }
}
