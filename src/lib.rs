//! Multiplexing HTTP proxy front-end.
//!
//! Accepts proxy clients, consults an embedder-supplied policy callback per
//! request, and routes each request down exactly one transport path: a
//! direct CONNECT tunnel, a tunnel chained through an upstream HTTP or
//! SOCKS5 proxy, a forwarded HTTP request (plain, through an upstream HTTP
//! proxy, or over SOCKS5), or a synthetic custom response.
//!
//! ```no_run
//! use std::sync::Arc;
//! use proxyhub::{PolicyFn, PolicyInput, PolicyResult, Server, ServerConfig};
//!
//! # async fn run() -> std::io::Result<()> {
//! let policy: PolicyFn = Arc::new(|input: PolicyInput| {
//!     Box::pin(async move {
//!         let mut result = PolicyResult::default();
//!         if input.username != "trusted" {
//!             result.request_authentication = true;
//!         }
//!         Ok(result)
//!     })
//! });
//! let config = ServerConfig::new().with_port(8000).with_policy(policy);
//! let server = Server::new(config);
//! server.listen().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
mod forward;
mod head;
pub mod metered;
pub mod policy;
pub mod prepare;
mod raw;
pub mod redact;
pub mod registry;
pub mod server;
mod tunnel;

pub use config::ServerConfig;
pub use error::{BoxError, HandlerError, RequestError};
pub use events::{ConnectionClosed, RequestFailed, RequestSummary};
pub use policy::{
    BasicCredentials, CustomResponse, CustomResponseFn, PolicyFn, PolicyFuture, PolicyInput,
    PolicyResult,
};
pub use redact::redact_url;
pub use registry::{ConnectionId, ConnectionStats};
pub use server::Server;
