use std::net::IpAddr;

use http::{Method, StatusCode, Uri};
use url::Url;

use crate::error::{HandlerError, RequestError};
use crate::policy::{CustomResponseFn, PolicyResult};
use crate::registry::ConnectionId;

/// Parsed request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
    /// Path and query of forwarded HTTP requests; empty for tunnels.
    pub path: String,
}

impl TargetAddr {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Routing decision for one request, handed to the selected handler.
pub struct HandlerOptions {
    /// Handler sequence number, unique per server instance.
    pub id: u64,
    pub connection_id: ConnectionId,
    pub trg: TargetAddr,
    /// True for forwarded HTTP requests, false for CONNECT tunnels.
    pub is_http: bool,
    pub upstream_proxy_url: Option<Url>,
    pub custom_response: Option<CustomResponseFn>,
    pub local_address: Option<IpAddr>,
}

fn unparsable(target: &str) -> RequestError {
    RequestError::bad_request(format!("Target \"{target}\" could not be parsed"))
}

/// Classifies the request target for the given method.
///
/// CONNECT targets must be authority-form `host:port`; everything else must
/// be an absolute-form `http` URL.
pub(crate) fn parse_target(method: &Method, target: &str) -> Result<TargetAddr, RequestError> {
    let uri: Uri = target.parse().map_err(|_| unparsable(target))?;
    if method == Method::CONNECT {
        if uri.scheme().is_some() {
            return Err(unparsable(target));
        }
        let authority = uri.authority().ok_or_else(|| unparsable(target))?;
        let host = authority.host();
        let port = authority.port_u16().ok_or_else(|| unparsable(target))?;
        if host.is_empty() {
            return Err(unparsable(target));
        }
        Ok(TargetAddr {
            host: host.to_string(),
            port,
            path: String::new(),
        })
    } else {
        let scheme = uri.scheme_str().ok_or_else(|| unparsable(target))?;
        if scheme != "http" {
            return Err(RequestError::bad_request(format!(
                "Only HTTP protocol is supported (was {scheme}:)"
            )));
        }
        let host = uri.host().ok_or_else(|| unparsable(target))?;
        if host.is_empty() {
            return Err(unparsable(target));
        }
        let port = uri.port_u16().unwrap_or(80);
        let path = uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        Ok(TargetAddr {
            host: host.to_string(),
            port,
            path,
        })
    }
}

/// Merges the policy decision into the routing options.
///
/// Authentication wins over everything else; a requested challenge fails
/// the request with 407 before any routing is considered.
pub(crate) fn merge_policy(
    opts: &mut HandlerOptions,
    decision: PolicyResult,
) -> Result<(), HandlerError> {
    if decision.request_authentication {
        let message = decision
            .fail_msg
            .unwrap_or_else(|| "Proxy credentials required.".to_string());
        return Err(RequestError::new(StatusCode::PROXY_AUTHENTICATION_REQUIRED, message).into());
    }

    if let Some(raw_url) = decision.upstream_proxy_url {
        let url = Url::parse(&raw_url).map_err(|e| {
            HandlerError::Configuration(format!("could not parse the upstream proxy URL: {e}"))
        })?;
        match url.scheme() {
            "http" | "socks" => {}
            other => {
                return Err(HandlerError::Configuration(format!(
                    "the upstream proxy URL must use the \"http\" or \"socks\" scheme (was {other})"
                )));
            }
        }
        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(HandlerError::Configuration(
                "the upstream proxy URL is missing a host".to_string(),
            ));
        }
        opts.upstream_proxy_url = Some(url);
    }

    if let Some(custom) = decision.custom_response {
        if !opts.is_http {
            return Err(HandlerError::Configuration(
                "a custom response can only be served for forwarded HTTP requests".to_string(),
            ));
        }
        if opts.upstream_proxy_url.is_some() {
            return Err(HandlerError::Configuration(
                "a custom response cannot be combined with an upstream proxy".to_string(),
            ));
        }
        opts.custom_response = Some(custom);
    }

    opts.local_address = decision.local_address;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_opts() -> HandlerOptions {
        HandlerOptions {
            id: 1,
            connection_id: ConnectionId::next_for_tests(),
            trg: TargetAddr {
                host: "example.test".to_string(),
                port: 80,
                path: "/".to_string(),
            },
            is_http: true,
            upstream_proxy_url: None,
            custom_response: None,
            local_address: None,
        }
    }

    fn connect_opts() -> HandlerOptions {
        HandlerOptions {
            is_http: false,
            ..http_opts()
        }
    }

    #[test]
    fn parses_connect_targets() {
        let trg = parse_target(&Method::CONNECT, "secure.test:443").unwrap();
        assert_eq!(trg.host, "secure.test");
        assert_eq!(trg.port, 443);
        assert_eq!(trg.path, "");
    }

    #[test]
    fn connect_targets_need_a_port() {
        let err = parse_target(&Method::CONNECT, "secure.test").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Target \"secure.test\" could not be parsed");
    }

    #[test]
    fn connect_targets_must_be_authority_form() {
        assert!(parse_target(&Method::CONNECT, "http://secure.test:443").is_err());
    }

    #[test]
    fn parses_absolute_form_targets() {
        let trg = parse_target(&Method::GET, "http://example.test/x?y=1").unwrap();
        assert_eq!(trg.host, "example.test");
        assert_eq!(trg.port, 80);
        assert_eq!(trg.path, "/x?y=1");
    }

    #[test]
    fn default_port_and_path_are_filled_in() {
        let trg = parse_target(&Method::GET, "http://example.test").unwrap();
        assert_eq!(trg.port, 80);
        assert_eq!(trg.path, "/");
    }

    #[test]
    fn rejects_non_http_schemes() {
        let err = parse_target(&Method::GET, "ftp://x/").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Only HTTP protocol is supported (was ftp:)");
    }

    #[test]
    fn rejects_origin_form_targets() {
        let err = parse_target(&Method::GET, "/just/a/path").unwrap_err();
        assert_eq!(err.message, "Target \"/just/a/path\" could not be parsed");
    }

    #[test]
    fn authentication_challenge_beats_routing() {
        let mut opts = http_opts();
        let err = merge_policy(
            &mut opts,
            PolicyResult {
                request_authentication: true,
                fail_msg: Some("go away".to_string()),
                upstream_proxy_url: Some("http://proxy.test:8000".to_string()),
                ..Default::default()
            },
        )
        .unwrap_err();
        match err {
            HandlerError::Request(request_error) => {
                assert_eq!(request_error.status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
                assert_eq!(request_error.message, "go away");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn challenge_has_a_default_message() {
        let mut opts = http_opts();
        let err = merge_policy(
            &mut opts,
            PolicyResult {
                request_authentication: true,
                ..Default::default()
            },
        )
        .unwrap_err();
        match err {
            HandlerError::Request(request_error) => {
                assert_eq!(request_error.message, "Proxy credentials required.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn accepts_http_and_socks_upstreams() {
        for raw in ["http://proxy.test:8000", "socks://proxy.test:1080"] {
            let mut opts = http_opts();
            merge_policy(
                &mut opts,
                PolicyResult {
                    upstream_proxy_url: Some(raw.to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
            assert!(opts.upstream_proxy_url.is_some());
        }
    }

    #[test]
    fn rejects_other_upstream_schemes() {
        let mut opts = http_opts();
        let err = merge_policy(
            &mut opts,
            PolicyResult {
                upstream_proxy_url: Some("ftp://proxy.test:21".to_string()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, HandlerError::Configuration(_)));
    }

    #[test]
    fn custom_responses_are_http_only() {
        let mut opts = connect_opts();
        let err = merge_policy(
            &mut opts,
            PolicyResult {
                custom_response: Some(std::sync::Arc::new(|| {
                    Box::pin(async { crate::policy::CustomResponse::default() })
                })),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, HandlerError::Configuration(_)));
    }

    #[test]
    fn custom_responses_exclude_upstreams() {
        let mut opts = http_opts();
        let err = merge_policy(
            &mut opts,
            PolicyResult {
                upstream_proxy_url: Some("http://proxy.test:8000".to_string()),
                custom_response: Some(std::sync::Arc::new(|| {
                    Box::pin(async { crate::policy::CustomResponse::default() })
                })),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, HandlerError::Configuration(_)));
    }

    #[test]
    fn local_address_is_copied_through() {
        let mut opts = http_opts();
        merge_policy(
            &mut opts,
            PolicyResult {
                local_address: Some("127.0.0.1".parse().unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(opts.local_address, Some("127.0.0.1".parse().unwrap()));
    }
}
