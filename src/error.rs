use std::io;

use http::{HeaderMap, StatusCode};

/// Boxed error type accepted from embedder callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request failure that already knows the HTTP status to answer with.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct RequestError {
    pub status: StatusCode,
    pub message: String,
    /// Extra headers to attach to the error response.
    pub headers: HeaderMap,
}

impl RequestError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

/// Failures raised by the request preparer and the transport handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Failure with a known client-visible status.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// DNS resolution produced no usable address. `proxy` marks the
    /// upstream-proxy leg as opposed to the target leg.
    #[error("could not resolve {host}")]
    NotFound {
        host: String,
        proxy: bool,
        #[source]
        source: Option<io::Error>,
    },

    /// The upstream proxy answered the tunnel request with 407.
    #[error("407 Proxy Authentication Required from the upstream proxy")]
    UpstreamAuthRejected,

    /// The upstream proxy answered the tunnel request with a status other
    /// than 200 or 407.
    #[error("upstream proxy answered CONNECT with status {0}")]
    UpstreamUnexpectedStatus(u16),

    /// Upstream credentials cannot be encoded into a Basic header.
    #[error("username contains an invalid colon")]
    InvalidUsernameColon,

    /// The SOCKS handshake with the upstream proxy failed.
    #[error("SOCKS connection failed: {0}")]
    Socks(#[from] tokio_socks::Error),

    /// The policy returned a combination the dispatcher cannot honor.
    #[error("invalid policy result: {0}")]
    Configuration(String),

    /// The policy callback itself failed.
    #[error("policy callback failed: {0}")]
    Policy(#[source] BoxError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Hyper(#[from] hyper::Error),
}

/// Maps known lower-layer failures onto client-visible request errors.
///
/// Anything that does not match a known signature is passed back unchanged
/// so the dispatcher can report it and answer 500.
pub fn normalize(err: HandlerError) -> Result<RequestError, HandlerError> {
    match err {
        HandlerError::Request(request_error) => Ok(request_error),
        HandlerError::InvalidUsernameColon => Ok(RequestError::new(
            StatusCode::BAD_GATEWAY,
            "Invalid colon in username in upstream proxy credentials",
        )),
        HandlerError::UpstreamAuthRejected => Ok(RequestError::new(
            StatusCode::BAD_GATEWAY,
            "Invalid upstream proxy credentials",
        )),
        HandlerError::NotFound { proxy: true, .. }
        | HandlerError::Socks(_)
        | HandlerError::UpstreamUnexpectedStatus(_) => Ok(RequestError::new(
            StatusCode::BAD_GATEWAY,
            "Failed to connect to upstream proxy",
        )),
        HandlerError::NotFound { proxy: false, .. } => Ok(RequestError::new(
            StatusCode::NOT_FOUND,
            "Target website does not exist",
        )),
        other => Err(other),
    }
}
