use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{normalize, HandlerError, RequestError};
use crate::events::{ConnectionClosed, EventBus, RequestFailed, RequestSummary};
use crate::forward::{self, empty, ProxyBody};
use crate::head::{self, peek_head, Peeked, PrefixedStream, RequestHead};
use crate::metered::{MeteredStream, TrafficCounters};
use crate::policy::{invoke_policy, PolicyInput};
use crate::prepare::{merge_policy, parse_target, HandlerOptions};
use crate::raw;
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionStats};
use crate::tunnel::{self, TargetStream};

/// Multiplexing HTTP proxy front-end.
///
/// Accepts client connections, authenticates them through the configured
/// policy callback, and routes each request down exactly one transport
/// handler: a direct tunnel, a tunnel chained through an upstream HTTP or
/// SOCKS proxy, a forwarded HTTP request (plain or through an upstream), or
/// a synthetic custom response.
pub struct Server {
    inner: Arc<ServerInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

struct ServerInner {
    config: ServerConfig,
    port: AtomicU16,
    handler_seq: AtomicU64,
    http_request_count: AtomicU64,
    connect_request_count: AtomicU64,
    registry: ConnectionRegistry,
    events: EventBus,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let port = config.port;
        Self {
            inner: Arc::new(ServerInner {
                config,
                port: AtomicU16::new(port),
                handler_seq: AtomicU64::new(1),
                http_request_count: AtomicU64::new(0),
                connect_request_count: AtomicU64::new(0),
                registry: ConnectionRegistry::new(),
                events: EventBus::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// When the configured port is 0, the OS-assigned port is reflected
    /// back and visible through [`Server::port`].
    pub async fn listen(&self) -> io::Result<SocketAddr> {
        let addr = SocketAddr::new(self.inner.config.host, self.inner.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        self.inner.port.store(local_addr.port(), Ordering::Relaxed);
        info!("proxy server listening on {local_addr}");

        let inner = self.inner.clone();
        let task = tokio::spawn(inner.accept_loop(listener));
        *lock(&self.accept_task) = Some(task);
        Ok(local_addr)
    }

    /// The port the server listens on; reflects the OS-assigned port after
    /// an ephemeral bind.
    pub fn port(&self) -> u16 {
        self.inner.port.load(Ordering::Relaxed)
    }

    /// Stops accepting connections and waits for the listener to go away.
    ///
    /// With `close_connections`, every live client socket is destroyed
    /// first and the call waits until all connection tasks have unwound.
    pub async fn close(&self, close_connections: bool) {
        self.inner.shutdown.cancel();
        if close_connections {
            self.inner.registry.destroy_all();
        }
        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if close_connections {
            self.inner.tracker.close();
            self.inner.tracker.wait().await;
        }
    }

    /// Forcibly destroys every live client connection.
    pub fn close_connections(&self) {
        self.inner.registry.destroy_all();
    }

    /// Snapshot of the live connection identifiers.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.registry.ids()
    }

    /// Current byte totals for a live connection.
    pub fn connection_stats(&self, id: ConnectionId) -> Option<ConnectionStats> {
        self.inner.registry.stats_for(id)
    }

    /// Number of forwarded HTTP requests that passed parsing.
    pub fn http_request_count(&self) -> u64 {
        self.inner.http_request_count.load(Ordering::Relaxed)
    }

    /// Number of CONNECT requests that passed parsing.
    pub fn connect_request_count(&self) -> u64 {
        self.inner.connect_request_count.load(Ordering::Relaxed)
    }

    pub fn subscribe_request_failed(&self) -> broadcast::Receiver<RequestFailed> {
        self.inner.events.subscribe_request_failed()
    }

    pub fn subscribe_connection_closed(&self) -> broadcast::Receiver<ConnectionClosed> {
        self.inner.events.subscribe_connection_closed()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Emits `connectionClosed` with final stats once the last holder drops.
struct ClosedGuard {
    inner: Arc<ServerInner>,
    id: ConnectionId,
}

impl Drop for ClosedGuard {
    fn drop(&mut self) {
        self.inner.registry.finish(self.id, &self.inner.events);
        if self.inner.config.verbose {
            info!("connection {} closed", self.id);
        } else {
            debug!("connection {} closed", self.id);
        }
    }
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("listener shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let inner = self.clone();
                        self.tracker.spawn(inner.serve_connection(stream, peer));
                    }
                    Err(e) => {
                        warn!("accept error: {e} (continuing)");
                    }
                }
            }
        }
        // The listener drops here and the port is released.
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let conn = self.registry.register();
        if self.config.verbose {
            info!("connection {} accepted from {peer}", conn.id);
        } else {
            debug!("connection {} accepted from {peer}", conn.id);
        }
        let guard = Arc::new(ClosedGuard {
            inner: self.clone(),
            id: conn.id,
        });

        let mut stream = MeteredStream::new(stream, conn.src.clone());
        let mut buf = BytesMut::with_capacity(head::MAX_HEAD_BYTES);
        let peeked = tokio::select! {
            _ = conn.cancel.cancelled() => return,
            peeked = peek_head(&mut stream, &mut buf) => peeked,
        };
        let (request_head, head_len) = match peeked {
            Ok(Peeked::Head { head, head_len }) => (head, head_len),
            Ok(Peeked::Eof) => {
                debug!("connection {} closed before a full request", conn.id);
                return;
            }
            Err(request_error) => {
                raw::send_raw_response(
                    stream,
                    request_error.status,
                    &request_error.headers,
                    &request_error.message,
                    &self.config.auth_realm,
                )
                .await;
                return;
            }
        };

        if request_head.method == Method::CONNECT {
            let _ = buf.split_to(head_len);
            let src_head = buf.freeze();
            self.handle_connect(request_head, src_head, stream, &conn).await;
        } else {
            // Replay everything already read in front of the socket and let
            // the HTTP server own the connection from here on.
            let io = TokioIo::new(PrefixedStream::new(buf.freeze(), stream));
            let service_inner = self.clone();
            let service_conn = conn.clone();
            let service_guard = guard.clone();
            let service = service_fn(move |req: Request<Incoming>| {
                let inner = service_inner.clone();
                let conn = service_conn.clone();
                let guard = service_guard.clone();
                async move {
                    Ok::<_, Infallible>(inner.handle_request(req, conn, guard).await)
                }
            });
            let serving = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(io, service)
                .with_upgrades();
            tokio::select! {
                _ = conn.cancel.cancelled() => {
                    debug!("connection {} destroyed", conn.id);
                }
                result = serving => {
                    if let Err(err) = result {
                        if !err.to_string().contains("connection closed") {
                            debug!("connection {} error: {err:?}", conn.id);
                        }
                    }
                }
            }
        }
        drop(guard);
    }

    /// CONNECT on a fresh connection: the dispatcher owns the raw socket,
    /// so errors and the tunnel confirmation are written directly to it.
    async fn handle_connect(
        &self,
        request_head: RequestHead,
        src_head: bytes::Bytes,
        mut stream: MeteredStream<TcpStream>,
        conn: &ConnectionHandle,
    ) {
        if self.config.verbose {
            info!("connection {}: CONNECT {}", conn.id, request_head.target);
        }
        let outcome = tokio::select! {
            _ = conn.cancel.cancelled() => return,
            outcome = async {
                let opts = self
                    .prepare_request(&request_head.method, &request_head.target, &request_head.headers, conn.id)
                    .await?;
                self.establish_tunnel(&opts, &conn.trg).await
            } => outcome,
        };
        match outcome {
            Ok(target) => {
                if let Err(e) = raw::write_connection_established(&mut stream).await {
                    debug!("connection {}: tunnel confirmation failed: {e}", conn.id);
                    return;
                }
                tunnel::splice(stream, target, src_head, &conn.cancel).await;
            }
            Err(err) => {
                let request_error = self.normalize_and_report(
                    err,
                    RequestSummary {
                        connection_id: conn.id,
                        method: request_head.method.clone(),
                        target: request_head.target.clone(),
                    },
                );
                raw::send_raw_response(
                    stream,
                    request_error.status,
                    &request_error.headers,
                    &request_error.message,
                    &self.config.auth_realm,
                )
                .await;
            }
        }
    }

    /// Selects and runs the tunnel handler for a prepared CONNECT request.
    async fn establish_tunnel(
        &self,
        opts: &HandlerOptions,
        trg_counters: &Arc<TrafficCounters>,
    ) -> Result<TargetStream, HandlerError> {
        match opts.upstream_proxy_url.as_ref() {
            Some(upstream) if upstream.scheme() == "socks" => {
                tunnel::tunnel_socks(opts, upstream, trg_counters).await
            }
            Some(upstream) => tunnel::chain(opts, upstream, trg_counters).await,
            None => tunnel::direct(opts, trg_counters).await,
        }
    }

    /// One forwarded-HTTP request served through the HTTP server.
    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        conn: ConnectionHandle,
        guard: Arc<ClosedGuard>,
    ) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return self.handle_connect_upgrade(req, conn, guard).await;
        }
        let method = req.method().clone();
        let target = req.uri().to_string();
        if self.config.verbose {
            info!("connection {}: {method} {target}", conn.id);
        }
        let headers = req.headers().clone();
        let outcome = async {
            let opts = self
                .prepare_request(&method, &target, &headers, conn.id)
                .await?;
            self.dispatch_http(&opts, req, &conn).await
        }
        .await;
        match outcome {
            Ok(response) => response,
            Err(err) => {
                let request_error = self.normalize_and_report(
                    err,
                    RequestSummary {
                        connection_id: conn.id,
                        method,
                        target,
                    },
                );
                error_response(&request_error, &self.config.auth_realm)
            }
        }
    }

    /// Selects and runs the forwarded-HTTP handler.
    async fn dispatch_http(
        &self,
        opts: &HandlerOptions,
        req: Request<Incoming>,
        conn: &ConnectionHandle,
    ) -> Result<Response<ProxyBody>, HandlerError> {
        if let Some(producer) = opts.custom_response.as_ref() {
            return forward::custom_response(producer).await;
        }
        match opts.upstream_proxy_url.as_ref() {
            Some(upstream) if upstream.scheme() == "socks" => {
                forward::forward_socks(opts, upstream, req, &conn.trg).await
            }
            _ => forward::forward(opts, req, &conn.trg).await,
        }
    }

    /// CONNECT arriving on a reused connection: the outbound leg is
    /// established first, then the 200 hands the socket over through the
    /// upgrade mechanism and the tunnel is spliced in its own task.
    async fn handle_connect_upgrade(
        self: Arc<Self>,
        req: Request<Incoming>,
        conn: ConnectionHandle,
        guard: Arc<ClosedGuard>,
    ) -> Response<ProxyBody> {
        let method = req.method().clone();
        let target = req.uri().to_string();
        if self.config.verbose {
            info!("connection {}: CONNECT {target}", conn.id);
        }
        let headers = req.headers().clone();
        let outcome = async {
            let opts = self
                .prepare_request(&method, &target, &headers, conn.id)
                .await?;
            self.establish_tunnel(&opts, &conn.trg).await
        }
        .await;
        match outcome {
            Ok(target_stream) => {
                let cancel = conn.cancel.clone();
                self.tracker.spawn(async move {
                    match hyper::upgrade::on(req).await {
                        Ok(upgraded) => {
                            tunnel::splice(
                                TokioIo::new(upgraded),
                                target_stream,
                                bytes::Bytes::new(),
                                &cancel,
                            )
                            .await;
                        }
                        Err(e) => debug!("tunnel upgrade failed: {e}"),
                    }
                    drop(guard);
                });
                Response::new(empty())
            }
            Err(err) => {
                let request_error = self.normalize_and_report(
                    err,
                    RequestSummary {
                        connection_id: conn.id,
                        method,
                        target,
                    },
                );
                error_response(&request_error, &self.config.auth_realm)
            }
        }
    }

    /// Parses the target, consults the policy, and produces the routing
    /// decision for one request.
    async fn prepare_request(
        &self,
        method: &Method,
        target: &str,
        headers: &http::HeaderMap,
        connection_id: ConnectionId,
    ) -> Result<HandlerOptions, HandlerError> {
        let is_connect = method == Method::CONNECT;
        let trg = parse_target(method, target)?;
        if is_connect {
            self.connect_request_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.http_request_count.fetch_add(1, Ordering::Relaxed);
        }

        let input = PolicyInput {
            connection_id,
            method: method.clone(),
            target: target.to_string(),
            headers: headers.clone(),
            username: String::new(),
            password: String::new(),
            hostname: trg.host.clone(),
            port: trg.port,
            is_http: !is_connect,
        };
        let decision = invoke_policy(self.config.policy.as_ref(), input).await?;

        let mut opts = HandlerOptions {
            id: self.handler_seq.fetch_add(1, Ordering::Relaxed),
            connection_id,
            trg,
            is_http: !is_connect,
            upstream_proxy_url: None,
            custom_response: None,
            local_address: None,
        };
        merge_policy(&mut opts, decision)?;
        Ok(opts)
    }

    /// Normalizes a handler failure into the client-visible error; failures
    /// without a known mapping are reported and become plain 500s.
    fn normalize_and_report(&self, err: HandlerError, request: RequestSummary) -> RequestError {
        match normalize(err) {
            Ok(request_error) => {
                debug!(
                    "connection {}: request failed with {}: {}",
                    request.connection_id, request_error.status, request_error.message
                );
                request_error
            }
            Err(internal) => {
                warn!(
                    "connection {}: internal error handling {} {}: {internal}",
                    request.connection_id, request.method, request.target
                );
                self.events.emit_request_failed(RequestFailed {
                    error: Arc::new(internal),
                    request,
                });
                RequestError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error in proxy server",
                )
            }
        }
    }
}

/// Client-visible error response for the forwarded-HTTP path; mirrors the
/// raw responder's header rules.
fn error_response(err: &RequestError, auth_realm: &str) -> Response<ProxyBody> {
    let mut response = Response::new(forward::full(err.message.clone()));
    *response.status_mut() = err.status;
    let headers = response.headers_mut();
    for (name, value) in err.headers.iter() {
        headers.insert(name, value.clone());
    }
    if !headers.contains_key(header::SERVER) {
        if let Ok(value) = HeaderValue::from_str(auth_realm) {
            headers.insert(header::SERVER, value);
        }
    }
    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    }
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    if let Ok(value) = HeaderValue::from_str(&raw::http_date()) {
        headers.insert(header::DATE, value);
    }
    if err.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
        && !headers.contains_key(header::PROXY_AUTHENTICATE)
    {
        if let Ok(value) = HeaderValue::from_str(&format!("Basic realm=\"{auth_realm}\"")) {
            headers.insert(header::PROXY_AUTHENTICATE, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_responses_carry_the_challenge_for_407() {
        let err = RequestError::new(StatusCode::PROXY_AUTHENTICATION_REQUIRED, "go away");
        let response = error_response(&err, "ProxyChain");
        assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            response.headers().get(header::PROXY_AUTHENTICATE).unwrap(),
            "Basic realm=\"ProxyChain\""
        );
        assert_eq!(response.headers().get(header::CONNECTION).unwrap(), "close");
    }

    #[test]
    fn error_responses_close_the_connection() {
        let err = RequestError::bad_request("nope");
        let response = error_response(&err, "ProxyChain");
        assert_eq!(response.headers().get(header::CONNECTION).unwrap(), "close");
        assert_eq!(response.headers().get(header::SERVER).unwrap(), "ProxyChain");
        assert!(response.headers().contains_key(header::DATE));
    }
}
