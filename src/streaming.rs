//! Bounded relay of an upstream body to the client.
//!
//! A spawned pump moves chunks from the upstream stream into a bounded
//! channel whose receiving end is the response body. The pump reserves a
//! channel slot *before* pulling the next upstream chunk, so at most
//! `window_chunks` chunks of `chunk_size` bytes sit unread by the client.
//!
//! Upstream reads are not resized. When one read returns more than
//! `chunk_size` bytes, the pump holds the unsent rest and pulls nothing more
//! until it has been queued, so bytes held ahead of the client never exceed
//! [`StreamSettings::window_bytes`] plus one upstream read.
//!
//! The pump owns the pool lease. It exits and drops the lease when the
//! upstream ends, fails, stalls, or the client goes away (the body is
//! dropped, which cancels the pump through a drop guard).

use crate::metrics;
use crate::upstream::PoolLease;
use axum::body::Body;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_WINDOW_CHUNKS: usize = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    /// Largest chunk handed to the client; bigger upstream chunks are split.
    pub chunk_size: usize,
    /// Chunks allowed in flight between pump and client.
    pub window_chunks: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            window_chunks: DEFAULT_WINDOW_CHUNKS,
        }
    }
}

impl StreamSettings {
    /// Bytes queued ahead of the client. The pump may additionally hold the
    /// unsent rest of the current upstream read.
    pub fn window_bytes(&self) -> usize {
        self.chunk_size.max(1) * self.window_chunks.max(1)
    }
}

/// Error item that terminates a relayed body early.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("upstream failed mid-stream: {0}")]
    Upstream(String),

    #[error("upstream read timed out after {}ms", .0.as_millis())]
    UpstreamTimeout(Duration),

    #[error("client stalled for more than {}ms", .0.as_millis())]
    Stalled(Duration),
}

/// How a pump run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    /// Client disconnected; not an error.
    Cancelled,
    UpstreamFailed,
    /// Client stopped reading for longer than the budget.
    Stalled,
}

impl StreamOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::UpstreamFailed => "upstream_failed",
            Self::Stalled => "stalled",
        }
    }
}

/// Counters for one relayed body.
#[derive(Debug)]
pub struct StreamSession {
    pub label: &'static str,
    pub started_at: Instant,
    pub bytes: u64,
    pub chunks: u64,
    cancel: CancellationToken,
}

impl StreamSession {
    fn new(label: &'static str, cancel: CancellationToken) -> Self {
        Self {
            label,
            started_at: Instant::now(),
            bytes: 0,
            chunks: 0,
            cancel,
        }
    }
}

type Item = Result<Bytes, RelayError>;

/// Receiving end of a relay. Dropping it cancels the pump.
pub struct RelayStream {
    rx: mpsc::Receiver<Item>,
    cancel: CancellationToken,
    budget: Duration,
    failed: bool,
    _guard: DropGuard,
}

impl RelayStream {
    pub fn into_body(self) -> Body {
        Body::from_stream(self)
    }
}

impl Stream for RelayStream {
    type Item = Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.failed {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Err(e))) => {
                self.failed = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) if self.cancel.is_cancelled() => {
                // The pump gave up on us without a final error item.
                self.failed = true;
                Poll::Ready(Some(Err(RelayError::Stalled(self.budget))))
            }
            other => other,
        }
    }
}

/// Start relaying `upstream` and return the body side.
///
/// `budget` bounds each wait on the upstream and each wait for the client
/// to make room.
pub fn relay<S, E>(
    upstream: S,
    lease: PoolLease,
    budget: Duration,
    settings: &StreamSettings,
    label: &'static str,
) -> RelayStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(settings.window_chunks.max(1));
    let cancel = CancellationToken::new();
    let session = StreamSession::new(label, cancel.clone());
    let chunk_size = settings.chunk_size.max(1);

    tokio::spawn(async move {
        let mut session = session;
        let outcome = pump(upstream, &tx, chunk_size, budget, &mut session).await;
        if outcome == StreamOutcome::Stalled {
            session.cancel.cancel();
        }
        drop(lease);

        let elapsed = session.started_at.elapsed();
        match outcome {
            StreamOutcome::Completed | StreamOutcome::Cancelled => debug!(
                "Relay {} {}: {} bytes in {} chunks, {}ms",
                session.label,
                outcome.as_str(),
                session.bytes,
                session.chunks,
                elapsed.as_millis()
            ),
            StreamOutcome::UpstreamFailed | StreamOutcome::Stalled => warn!(
                "Relay {} {} after {} bytes, {}ms",
                session.label,
                outcome.as_str(),
                session.bytes,
                elapsed.as_millis()
            ),
        }
        metrics::record_stream(session.label, outcome.as_str(), session.bytes);
    });

    RelayStream {
        rx,
        cancel: cancel.clone(),
        budget,
        failed: false,
        _guard: cancel.drop_guard(),
    }
}

async fn pump<S, E>(
    upstream: S,
    tx: &mpsc::Sender<Item>,
    chunk_size: usize,
    budget: Duration,
    session: &mut StreamSession,
) -> StreamOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut upstream = std::pin::pin!(upstream);
    let cancel = session.cancel.clone();

    loop {
        // Room first, then read: this is what bounds the buffer.
        let permit = match reserve(tx, &cancel, budget).await {
            Ok(permit) => permit,
            Err(outcome) => return outcome,
        };

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            next = tokio::time::timeout(budget, upstream.next()) => next,
        };

        let mut chunk = match next {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(None) => return StreamOutcome::Completed,
            Ok(Some(Err(e))) => {
                permit.send(Err(RelayError::Upstream(e.to_string())));
                return StreamOutcome::UpstreamFailed;
            }
            Err(_) => {
                permit.send(Err(RelayError::UpstreamTimeout(budget)));
                return StreamOutcome::UpstreamFailed;
            }
        };

        session.bytes += chunk.len() as u64;

        let first = chunk.split_to(chunk.len().min(chunk_size));
        session.chunks += 1;
        permit.send(Ok(first));

        while !chunk.is_empty() {
            let permit = match reserve(tx, &cancel, budget).await {
                Ok(permit) => permit,
                Err(outcome) => return outcome,
            };
            session.chunks += 1;
            permit.send(Ok(chunk.split_to(chunk.len().min(chunk_size))));
        }
    }
}

async fn reserve<'a>(
    tx: &'a mpsc::Sender<Item>,
    cancel: &CancellationToken,
    budget: Duration,
) -> Result<mpsc::Permit<'a, Item>, StreamOutcome> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StreamOutcome::Cancelled),
        reserved = tokio::time::timeout(budget, tx.reserve()) => match reserved {
            Ok(Ok(permit)) => Ok(permit),
            // Receiver gone: the body was dropped.
            Ok(Err(_)) => Err(StreamOutcome::Cancelled),
            Err(_) => Err(StreamOutcome::Stalled),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{ConnectionPool, PoolSettings, Scheme};
    use futures_util::stream;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BUDGET: Duration = Duration::from_secs(5);

    async fn lease(pool: &ConnectionPool) -> PoolLease {
        pool.acquire(Scheme::Https).await.unwrap().lease
    }

    fn pool() -> ConnectionPool {
        ConnectionPool::new(&PoolSettings::default()).unwrap()
    }

    async fn wait_for_release(pool: &ConnectionPool) {
        for _ in 0..100 {
            if pool.stats().in_use == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("lease not released: {:?}", pool.stats());
    }

    /// Endless upstream that counts how many chunks were pulled from it.
    fn counting_upstream(pulled: Arc<AtomicUsize>, chunk: usize) -> impl Stream<Item = io::Result<Bytes>> {
        stream::repeat_with(move || {
            pulled.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from(vec![0u8; chunk]))
        })
    }

    #[tokio::test]
    async fn relays_all_bytes_in_order() {
        let pool = pool();
        let parts = vec![
            Ok::<_, io::Error>(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"relay ")),
            Ok(Bytes::from_static(b"world")),
        ];

        let body: Vec<Bytes> = relay(stream::iter(parts), lease(&pool).await, BUDGET, &StreamSettings::default(), "test")
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(body.concat(), b"hello relay world");
        wait_for_release(&pool).await;
    }

    #[tokio::test]
    async fn large_chunks_are_split() {
        let pool = pool();
        let settings = StreamSettings {
            chunk_size: 4,
            window_chunks: 1,
        };
        let parts = vec![Ok::<_, io::Error>(Bytes::from_static(b"0123456789"))];

        let sizes: Vec<usize> = relay(stream::iter(parts), lease(&pool).await, BUDGET, &settings, "test")
            .map(|item| item.unwrap().len())
            .collect()
            .await;

        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn pump_never_reads_more_than_one_window_ahead() {
        let pool = pool();
        let pulled = Arc::new(AtomicUsize::new(0));
        let settings = StreamSettings {
            chunk_size: 1024,
            window_chunks: 1,
        };

        let mut body = relay(
            counting_upstream(Arc::clone(&pulled), 1024),
            lease(&pool).await,
            BUDGET,
            &settings,
            "test",
        );

        // Client not reading: the pump fills the window and waits.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), settings.window_chunks);

        for consumed in 1..=5 {
            body.next().await.unwrap().unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            let ahead = pulled.load(Ordering::SeqCst) - consumed;
            assert!(
                ahead <= settings.window_chunks,
                "pump is {ahead} chunks ahead after {consumed} reads"
            );
        }
    }

    #[tokio::test]
    async fn oversized_read_is_drained_before_next_pull() {
        let pool = pool();
        let pulled = Arc::new(AtomicUsize::new(0));
        let settings = StreamSettings {
            chunk_size: 4,
            window_chunks: 1,
        };

        let mut body = relay(
            counting_upstream(Arc::clone(&pulled), 10),
            lease(&pool).await,
            BUDGET,
            &settings,
            "test",
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), 1);

        // 4 + 4 + 2 bytes of the first read go out before a second pull.
        for expected in [4, 4] {
            assert_eq!(body.next().await.unwrap().unwrap().len(), expected);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(pulled.load(Ordering::SeqCst), 1);
        }

        assert_eq!(body.next().await.unwrap().unwrap().len(), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pulled.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn dropping_body_releases_lease() {
        let pool = pool();
        let pulled = Arc::new(AtomicUsize::new(0));

        let mut body = relay(
            counting_upstream(Arc::clone(&pulled), 512),
            lease(&pool).await,
            BUDGET,
            &StreamSettings::default(),
            "test",
        );
        body.next().await.unwrap().unwrap();
        assert_eq!(pool.stats().in_use, 1);

        drop(body);
        wait_for_release(&pool).await;

        // Reads stop once the client is gone.
        let after_drop = pulled.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), after_drop);
    }

    #[tokio::test]
    async fn dropping_body_cancels_pending_upstream_read() {
        let pool = pool();
        let body = relay(
            stream::pending::<io::Result<Bytes>>(),
            lease(&pool).await,
            BUDGET,
            &StreamSettings::default(),
            "test",
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().in_use, 1);

        drop(body);
        wait_for_release(&pool).await;
    }

    #[tokio::test]
    async fn upstream_error_terminates_body_with_error() {
        let pool = pool();
        let parts = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
        ];

        let mut body = relay(stream::iter(parts), lease(&pool).await, BUDGET, &StreamSettings::default(), "test");

        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        let err = body.next().await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Upstream(ref msg) if msg.contains("reset by peer")));
        assert!(body.next().await.is_none());

        wait_for_release(&pool).await;
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let pool = pool();
        let mut body = relay(
            stream::pending::<io::Result<Bytes>>(),
            lease(&pool).await,
            Duration::from_millis(30),
            &StreamSettings::default(),
            "test",
        );

        let err = body.next().await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::UpstreamTimeout(_)));
        wait_for_release(&pool).await;
    }

    #[tokio::test]
    async fn stalled_client_gets_error_and_lease_is_released() {
        let pool = pool();
        let pulled = Arc::new(AtomicUsize::new(0));
        let mut body = relay(
            counting_upstream(Arc::clone(&pulled), 64),
            lease(&pool).await,
            Duration::from_millis(30),
            &StreamSettings::default(),
            "test",
        );

        wait_for_release(&pool).await;

        // The buffered chunk is still delivered, then the body fails.
        assert!(body.next().await.unwrap().is_ok());
        assert!(matches!(body.next().await, Some(Err(RelayError::Stalled(_)))));
        assert!(body.next().await.is_none());
    }

    #[test]
    fn window_bytes() {
        let settings = StreamSettings {
            chunk_size: 1000,
            window_chunks: 3,
        };
        assert_eq!(settings.window_bytes(), 3000);
        assert_eq!(StreamSettings::default().window_bytes(), DEFAULT_CHUNK_SIZE);
    }
}
