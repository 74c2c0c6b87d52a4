//! Redis pub/sub backbone.
//!
//! Two connections per node:
//! - a [`ConnectionManager`] for `PUBLISH`, which re-establishes its
//!   connection on the next command after a drop
//! - a pub/sub connection split into a sink (`SUBSCRIBE`/`UNSUBSCRIBE`) and
//!   a stream drained by one reader task that routes each message by
//!   channel name to the sender registered for that topic
//!
//! When the pub/sub stream ends, the reader reconnects with capped
//! exponential backoff, subscribes every routed topic again on the new
//! connection and swaps the new sink in. Subscribe calls made while the
//! connection is down fail and are retried by the caller.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use roomcast_core::BackboneError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Backbone, BackboneFrame, FrameSender, SubscriptionHandle};

type Routes = DashMap<String, (u64, FrameSender)>;

const RECONNECT_INITIAL: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Redis-backed [`Backbone`].
pub struct RedisBackbone {
    publisher: ConnectionManager,
    sink: Arc<Mutex<PubSubSink>>,
    routes: Arc<Routes>,
    next_id: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl RedisBackbone {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`) and start the reader.
    pub async fn connect(url: &str) -> Result<Self, BackboneError> {
        let client = redis::Client::open(url)
            .map_err(|e| BackboneError::Connect(format!("invalid url {url}: {e}")))?;

        let publisher = client
            .get_connection_manager()
            .await
            .map_err(|e| BackboneError::Connect(format!("publish connection: {e}")))?;

        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| BackboneError::Connect(format!("pubsub connection: {e}")))?;
        let (sink, stream) = pubsub.split();
        let sink = Arc::new(Mutex::new(sink));

        let routes = Arc::new(Routes::new());
        let cancel = CancellationToken::new();
        drop(tokio::spawn(read_loop(
            client,
            stream,
            Arc::clone(&sink),
            Arc::clone(&routes),
            cancel.clone(),
        )));

        info!(url, "connected to redis backbone");
        Ok(Self {
            publisher,
            sink,
            routes,
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel,
        })
    }

    fn ensure_open(&self) -> Result<(), BackboneError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BackboneError::Closed)
        } else {
            Ok(())
        }
    }
}

async fn read_loop(
    client: redis::Client,
    mut stream: PubSubStream,
    sink: Arc<Mutex<PubSubSink>>,
    routes: Arc<Routes>,
    cancel: CancellationToken,
) {
    while route_frames(&mut stream, &routes, &cancel).await {
        warn!(topics = routes.len(), "redis pub/sub connection lost, reconnecting");
        let reconnected =
            retry_with_backoff(&cancel, || resubscribe(&client, &sink, &routes)).await;
        match reconnected {
            Some((next, topics)) => {
                info!(topics, "redis pub/sub reconnected");
                stream = next;
            }
            None => break,
        }
    }
    debug!("redis reader exited");
}

/// Route frames until the stream ends (`true`) or `cancel` fires (`false`).
async fn route_frames(
    stream: &mut PubSubStream,
    routes: &Routes,
    cancel: &CancellationToken,
) -> bool {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return false,
            msg = stream.next() => {
                let Some(msg) = msg else { return true };
                let channel = msg.get_channel_name();
                let Some(route) = routes.get(channel) else {
                    debug!(topic = channel, "frame for unrouted topic, dropping");
                    continue;
                };
                let frame = BackboneFrame {
                    topic: channel.to_owned(),
                    payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
                };
                if route.1.send(frame).is_err() {
                    debug!(topic = channel, "frame receiver gone");
                }
            }
        }
    }
}

/// Open a fresh pub/sub connection, subscribe every routed topic on it and
/// make it the live sink. Returns the new stream and the topic count.
///
/// The sink lock is held across the resubscribe so a concurrent
/// `subscribe` lands on the new connection.
async fn resubscribe(
    client: &redis::Client,
    sink: &Mutex<PubSubSink>,
    routes: &Routes,
) -> redis::RedisResult<(PubSubStream, usize)> {
    let (mut fresh, stream) = client.get_async_pubsub().await?.split();
    let mut live = sink.lock().await;
    let topics: Vec<String> = routes.iter().map(|r| r.key().clone()).collect();
    if !topics.is_empty() {
        fresh.subscribe(&topics).await?;
    }
    *live = fresh;
    Ok((stream, topics.len()))
}

/// Capped exponential delay between reconnect attempts.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            next: RECONNECT_INITIAL,
        }
    }
}

impl Backoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(RECONNECT_MAX);
        delay
    }
}

/// Run `attempt` after each backoff delay until it succeeds. Returns `None`
/// once `cancel` fires.
async fn retry_with_backoff<T, E, F, Fut>(cancel: &CancellationToken, mut attempt: F) -> Option<T>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::default();
    loop {
        let delay = backoff.next_delay();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }
        match attempt().await {
            Ok(value) => return Some(value),
            Err(e) => warn!(error = %e, retry_in_ms = backoff.next.as_millis(), "redis reconnect failed"),
        }
    }
}

#[async_trait]
impl Backbone for RedisBackbone {
    async fn subscribe(
        &self,
        topic: &str,
        deliver: FrameSender,
    ) -> Result<SubscriptionHandle, BackboneError> {
        self.ensure_open()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.routes.insert(topic.to_owned(), (id, deliver));

        if let Err(e) = self.sink.lock().await.subscribe(topic).await {
            let _ = self.routes.remove_if(topic, |_, (route_id, _)| *route_id == id);
            return Err(BackboneError::Subscribe {
                topic: topic.to_owned(),
                message: e.to_string(),
            });
        }
        Ok(SubscriptionHandle::new(id, topic))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BackboneError> {
        self.ensure_open()?;
        let removed = self
            .routes
            .remove_if(handle.topic(), |_, (route_id, _)| *route_id == handle.id());
        if removed.is_none() {
            return Ok(());
        }
        self.sink
            .lock()
            .await
            .unsubscribe(handle.topic())
            .await
            .map_err(|e| BackboneError::Unsubscribe {
                topic: handle.topic().to_owned(),
                message: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BackboneError> {
        self.ensure_open()?;
        let mut conn = self.publisher.clone();
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload.as_ref())
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| BackboneError::Publish {
                topic: topic.to_owned(),
                message: e.to_string(),
            })
    }

    async fn close(&self) -> Result<(), BackboneError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        let topics: Vec<String> = self.routes.iter().map(|r| r.key().clone()).collect();
        self.routes.clear();

        if !topics.is_empty() {
            if let Err(e) = self.sink.lock().await.unsubscribe(&topics).await {
                warn!(error = %e, "unsubscribe on close failed");
            }
        }
        info!("redis backbone closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
