//! One live client connection and its serialized write path.
//!
//! Every outbound frame goes through [`Client`]'s single write lock, so
//! frames never interleave on the wire. Application text is queued first and
//! written oldest-first by whichever writer next holds the lock, so the order
//! messages were queued in is the order they reach the socket. Each write,
//! including the wait for the lock, is bounded by the write timeout.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::SinkExt;
use futures::stream::SplitSink;
use parking_lot::Mutex;
use roomcast_core::{ClientId, TransportError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Normal closure status.
pub const CLOSE_NORMAL: u16 = 1000;
/// Going-away status, used when the node shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// An outbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized application message.
    Text(Arc<str>),
    /// Liveness probe.
    Ping,
    /// Close handshake.
    Close {
        /// Close status code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// The write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame.
    async fn send_frame(&mut self, frame: Outbound) -> Result<(), TransportError>;
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_frame(&mut self, frame: Outbound) -> Result<(), TransportError> {
        let message = match frame {
            Outbound::Text(text) => Message::Text(text.to_string().into()),
            Outbound::Ping => Message::Ping(Bytes::new()),
            Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
        };
        self.send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

/// A connected client.
pub struct Client {
    id: ClientId,
    user_id: String,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    pending: Mutex<VecDeque<Arc<str>>>,
    write_timeout: Duration,
    stop: CancellationToken,
    closed: AtomicBool,
    last_seen: Mutex<Instant>,
}

impl Client {
    /// Wrap a transport write half for a verified user.
    pub fn new(
        user_id: impl Into<String>,
        sink: impl FrameSink + 'static,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id: ClientId::new(),
            user_id: user_id.into(),
            sink: tokio::sync::Mutex::new(Box::new(sink)),
            pending: Mutex::new(VecDeque::new()),
            write_timeout,
            stop: CancellationToken::new(),
            closed: AtomicBool::new(false),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Verified user identity.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Per-connection stop signal. Cancelling it tears the connection down.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Whether a close frame has been written (or attempted).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record inbound activity (any frame, pongs included).
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound activity.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Write a serialized message.
    pub async fn send_text(&self, text: Arc<str>) -> Result<(), TransportError> {
        self.enqueue_text(text);
        self.flush_text().await
    }

    /// Queue a serialized message behind those already queued.
    ///
    /// Pair every call with one [`Client::flush_text`].
    pub fn enqueue_text(&self, text: Arc<str>) {
        self.pending.lock().push_back(text);
    }

    /// Number of queued messages not yet written.
    pub fn queued(&self) -> usize {
        self.pending.lock().len()
    }

    /// Write the oldest queued message.
    pub async fn flush_text(&self) -> Result<(), TransportError> {
        self.bounded(async {
            let mut sink = self.sink.lock().await;
            let next = self.pending.lock().pop_front();
            let Some(text) = next else {
                return Ok(());
            };
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            sink.send_frame(Outbound::Text(text)).await
        })
        .await
    }

    /// Send a liveness probe.
    pub async fn ping(&self) -> Result<(), TransportError> {
        self.bounded(async {
            let mut sink = self.sink.lock().await;
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            sink.send_frame(Outbound::Ping).await
        })
        .await
    }

    /// Send a close frame. Only the first call writes; later calls succeed
    /// without touching the transport.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = Outbound::Close {
            code,
            reason: reason.to_owned(),
        };
        self.bounded(async {
            let mut sink = self.sink.lock().await;
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.pending.lock().clear();
            sink.send_frame(frame).await
        })
        .await
    }

    async fn bounded(
        &self,
        attempt: impl Future<Output = Result<(), TransportError>>,
    ) -> Result<(), TransportError> {
        tokio::time::timeout(self.write_timeout, attempt)
            .await
            .unwrap_or(Err(TransportError::WriteTimeout))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::test_client;
    use super::*;

    #[tokio::test]
    async fn send_text_reaches_sink() {
        let (client, mut probe) = test_client("alice");
        client.send_text(Arc::from("hello")).await.unwrap();
        assert_eq!(probe.texts(), vec!["hello".to_string()]);
        assert_eq!(client.user_id(), "alice");
        assert!(client.id().as_str().starts_with("conn_"));
    }

    #[tokio::test]
    async fn close_is_written_once() {
        let (client, mut probe) = test_client("alice");
        client.close(CLOSE_GOING_AWAY, "server shutting down").await.unwrap();
        client.close(CLOSE_NORMAL, "bye").await.unwrap();

        let first = probe.rx.try_recv().unwrap();
        assert_eq!(
            first,
            Outbound::Close {
                code: CLOSE_GOING_AWAY,
                reason: "server shutting down".into()
            }
        );
        assert!(probe.rx.try_recv().is_err());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let (client, _probe) = test_client("alice");
        client.close(CLOSE_NORMAL, "bye").await.unwrap();
        assert_eq!(
            client.send_text(Arc::from("late")).await,
            Err(TransportError::Closed)
        );
        assert_eq!(client.ping().await, Err(TransportError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out() {
        let (client, probe) = test_client("alice");
        probe.stall.store(true, Ordering::Relaxed);
        let result = client.send_text(Arc::from("x")).await;
        assert_eq!(result, Err(TransportError::WriteTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_the_lock_counts_against_the_timeout() {
        let (client, probe) = test_client("alice");
        probe.stall.store(true, Ordering::Relaxed);

        let holder = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.send_text(Arc::from("a")).await })
        };
        tokio::task::yield_now().await;

        let start = Instant::now();
        let second = client.ping().await;
        assert_eq!(second, Err(TransportError::WriteTimeout));
        assert!(start.elapsed() <= Duration::from_secs(1));
        assert_eq!(holder.await.unwrap(), Err(TransportError::WriteTimeout));
    }

    #[tokio::test]
    async fn send_failure_is_reported() {
        let (client, probe) = test_client("alice");
        probe.fail.store(true, Ordering::Relaxed);
        let err = client.send_text(Arc::from("x")).await.unwrap_err();
        assert!(matches!(err, TransportError::Send(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_flushes_keep_queue_order() {
        let (client, mut probe) = test_client("alice");
        for i in 0..50 {
            client.enqueue_text(Arc::from(i.to_string().as_str()));
        }
        let flushes: Vec<_> = (0..50)
            .map(|_| {
                let client = Arc::clone(&client);
                tokio::spawn(async move { client.flush_text().await })
            })
            .collect();
        for flush in flushes {
            flush.await.unwrap().unwrap();
        }

        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(probe.texts(), expected);
        assert_eq!(client.queued(), 0);
    }

    #[tokio::test]
    async fn close_discards_queued_text() {
        let (client, mut probe) = test_client("alice");
        client.enqueue_text(Arc::from("never"));
        client.close(CLOSE_NORMAL, "bye").await.unwrap();
        assert_eq!(client.queued(), 0);
        assert_eq!(client.flush_text().await, Ok(()));
        assert!(probe.texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mark_alive_resets_idle() {
        let (client, _probe) = test_client("alice");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(client.idle_for() >= Duration::from_secs(5));
        client.mark_alive();
        assert!(client.idle_for() < Duration::from_secs(1));
    }
}
