use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Per-direction byte counters (bytes) shared between a stream wrapper and
/// the connection registry.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
}

impl TrafficCounters {
    pub fn add_rx(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tx(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn rx(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn tx(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }
}

/// Stream wrapper charging every transferred byte to shared counters.
///
/// The counters outlive the stream, so a registry snapshot taken after the
/// socket is gone still sees the final totals.
#[derive(Debug)]
pub struct MeteredStream<S> {
    inner: S,
    counters: Arc<TrafficCounters>,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, counters: Arc<TrafficCounters>) -> Self {
        Self { inner, counters }
    }

    #[allow(dead_code)]
    pub fn counters(&self) -> &Arc<TrafficCounters> {
        &self.counters
    }
}

impl<S> AsyncRead for MeteredStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            this.counters.add_rx((buf.filled().len() - before) as u64);
        }
        result
    }
}

impl<S> AsyncWrite for MeteredStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.counters.add_tx(*n as u64);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn counts_bytes_in_both_directions() {
        let (client, server) = tokio::io::duplex(64);
        let counters = Arc::new(TrafficCounters::default());
        let mut metered = MeteredStream::new(client, counters.clone());
        let mut server = server;

        metered.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(counters.tx(), 5);
        assert_eq!(counters.rx(), 0);

        server.write_all(b"world!!").await.unwrap();
        let mut buf = [0u8; 7];
        metered.read_exact(&mut buf).await.unwrap();
        assert_eq!(counters.rx(), 7);
    }

    #[tokio::test]
    async fn counters_survive_the_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        let counters = Arc::new(TrafficCounters::default());
        let mut metered = MeteredStream::new(client, counters.clone());

        metered.write_all(b"abc").await.unwrap();
        drop(metered);
        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(counters.tx(), 3);
    }
}
