use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::RequestError;

/// How much of the head to buffer before the request is considered invalid.
pub(crate) const MAX_HEAD_BYTES: usize = 8192;

const MAX_HEADERS: usize = 64;

/// Request line and headers of one inbound request.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    #[allow(dead_code)]
    pub version: Version,
    pub headers: HeaderMap,
}

/// Outcome of peeking the first head off a fresh connection.
pub(crate) enum Peeked {
    /// A complete head spanning the first `head_len` buffered bytes.
    Head { head: RequestHead, head_len: usize },
    /// The client went away before sending a full head.
    Eof,
}

/// Reads from `stream` into `buf` until a complete request head is
/// buffered. The buffered bytes are left in place so they can be replayed.
pub(crate) async fn peek_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<Peeked, RequestError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            if let Some((head, head_len)) = parse_head(buf)? {
                return Ok(Peeked::Head { head, head_len });
            }
            if buf.len() >= MAX_HEAD_BYTES {
                return Err(RequestError::bad_request(
                    "Request header section too large",
                ));
            }
        }
        match stream.read_buf(buf).await {
            Ok(0) => return Ok(Peeked::Eof),
            Ok(_) => {}
            // A socket error this early means the client is gone; there is
            // nobody left to answer.
            Err(_) => return Ok(Peeked::Eof),
        }
    }
}

/// Parses a buffered head; `None` when more bytes are needed.
pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let method: Method = request
                .method
                .unwrap_or_default()
                .parse()
                .map_err(|_| RequestError::bad_request("Invalid HTTP request"))?;
            let target = request.path.unwrap_or_default().to_string();
            if target.is_empty() {
                return Err(RequestError::bad_request("Invalid HTTP request"));
            }
            let version = match request.version {
                Some(0) => Version::HTTP_10,
                _ => Version::HTTP_11,
            };
            let mut map = HeaderMap::with_capacity(request.headers.len());
            for header in request.headers.iter() {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(header.name.as_bytes()),
                    HeaderValue::from_bytes(header.value),
                ) {
                    map.append(name, value);
                }
            }
            Ok(Some((
                RequestHead {
                    method,
                    target,
                    version,
                    headers: map,
                },
                head_len,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(RequestError::bad_request("Invalid HTTP request")),
    }
}

/// Replays already-buffered bytes in front of a stream.
///
/// Used to hand a connection to the HTTP server after its first request
/// head was peeked, and to carry bytes an upstream proxy sent past its
/// CONNECT response.
#[derive(Debug)]
pub(crate) struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S> AsyncRead for PrefixedStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for PrefixedStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
