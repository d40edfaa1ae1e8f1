use std::sync::Arc;

use bytes::Bytes;
use http::{header, HeaderName, HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tracing::debug;
use url::Url;

use crate::error::{HandlerError, RequestError};
use crate::metered::{MeteredStream, TrafficCounters};
use crate::policy::CustomResponseFn;
use crate::prepare::HandlerOptions;
use crate::tunnel::{open_tcp, resolve, socks_connect, upstream_basic_auth, TargetStream};

/// Response body type relayed back to clients.
pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Serves the request by connecting to the origin, or through an upstream
/// HTTP proxy when the routing decision names one.
pub(crate) async fn forward(
    opts: &HandlerOptions,
    req: Request<Incoming>,
    trg_counters: &Arc<TrafficCounters>,
) -> Result<Response<ProxyBody>, HandlerError> {
    match opts.upstream_proxy_url.as_ref() {
        Some(upstream) => {
            let host = upstream
                .host_str()
                .ok_or_else(|| {
                    HandlerError::Configuration(
                        "the upstream proxy URL is missing a host".to_string(),
                    )
                })?
                .to_string();
            let port = upstream.port().unwrap_or(80);
            let addrs = resolve(&host, port, true).await?;
            let stream = open_tcp(&addrs, opts.local_address).await.map_err(|_| {
                RequestError::new(StatusCode::BAD_GATEWAY, "Failed to connect to upstream proxy")
            })?;
            let stream = MeteredStream::new(stream, trg_counters.clone());
            send_over(Box::new(stream), opts, req, Some(upstream)).await
        }
        None => {
            let addrs = resolve(&opts.trg.host, opts.trg.port, false).await?;
            let stream = open_tcp(&addrs, opts.local_address).await.map_err(|e| {
                RequestError::new(
                    StatusCode::BAD_GATEWAY,
                    format!("Could not connect to target {}: {e}", opts.trg.authority()),
                )
            })?;
            let stream = MeteredStream::new(stream, trg_counters.clone());
            send_over(Box::new(stream), opts, req, None).await
        }
    }
}

/// Serves the request by reaching the origin through the upstream SOCKS
/// proxy.
pub(crate) async fn forward_socks(
    opts: &HandlerOptions,
    upstream: &Url,
    req: Request<Incoming>,
    trg_counters: &Arc<TrafficCounters>,
) -> Result<Response<ProxyBody>, HandlerError> {
    let stream = socks_connect(opts, upstream, trg_counters).await?;
    send_over(Box::new(stream), opts, req, None).await
}

/// Serves the synthetic response produced by the policy callback.
pub(crate) async fn custom_response(
    producer: &CustomResponseFn,
) -> Result<Response<ProxyBody>, HandlerError> {
    let custom = producer().await;
    let mut response = Response::new(full(custom.body));
    *response.status_mut() = custom.status.unwrap_or(StatusCode::OK);
    for (name, value) in custom.headers.iter() {
        response.headers_mut().insert(name, value.clone());
    }
    Ok(response)
}

/// Sends the request over an established transport stream and relays the
/// response.
///
/// Talking to the origin, the target is rewritten to origin-form and
/// proxy-hop headers are dropped; talking through an upstream proxy, the
/// absolute-form target stays and the upstream's credentials are attached.
async fn send_over(
    stream: TargetStream,
    opts: &HandlerOptions,
    mut req: Request<Incoming>,
    via_upstream: Option<&Url>,
) -> Result<Response<ProxyBody>, HandlerError> {
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await?;

    let request_id = opts.id;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            if !err.to_string().contains("connection closed") {
                debug!("forward #{request_id} connection error: {err:?}");
            }
        }
    });

    req.headers_mut().remove(header::PROXY_AUTHORIZATION);
    match via_upstream {
        Some(upstream) => {
            if let Some(basic) = upstream_basic_auth(upstream)? {
                if let Ok(value) = HeaderValue::from_str(&format!("Basic {basic}")) {
                    req.headers_mut().insert(header::PROXY_AUTHORIZATION, value);
                }
            }
        }
        None => {
            req.headers_mut()
                .remove(HeaderName::from_static("proxy-connection"));
            let path = if opts.trg.path.is_empty() {
                "/"
            } else {
                opts.trg.path.as_str()
            };
            let origin_form: Uri = path
                .parse()
                .unwrap_or_else(|_| Uri::from_static("/"));
            *req.uri_mut() = origin_form;
        }
    }
    if !req.headers().contains_key(header::HOST) {
        let host = if opts.trg.port == 80 {
            opts.trg.host.clone()
        } else {
            opts.trg.authority()
        };
        if let Ok(value) = HeaderValue::from_str(&host) {
            req.headers_mut().insert(header::HOST, value);
        }
    }

    let response = sender.send_request(req).await?;
    if via_upstream.is_some() && response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        return Err(HandlerError::UpstreamAuthRejected);
    }
    Ok(response.map(|body| body.boxed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::CustomResponse;

    #[tokio::test]
    async fn custom_responses_default_to_200() {
        let producer: CustomResponseFn = Arc::new(|| {
            Box::pin(async {
                CustomResponse {
                    body: Bytes::from_static(b"synthetic"),
                    ..Default::default()
                }
            })
        });
        let response = custom_response(&producer).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn custom_responses_keep_status_and_headers() {
        let producer: CustomResponseFn = Arc::new(|| {
            Box::pin(async {
                let mut headers = http::HeaderMap::new();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                CustomResponse {
                    status: Some(StatusCode::IM_A_TEAPOT),
                    headers,
                    body: Bytes::from_static(b"{}"),
                }
            })
        });
        let response = custom_response(&producer).await.unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
