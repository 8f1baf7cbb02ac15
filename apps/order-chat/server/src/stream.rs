//! Per-connection lifecycle of the chat event stream.
//!
//! Opening a connection registers a fresh sink, queues the `connected` frame
//! and starts a heartbeat task. The returned [`ConnectionStream`] owns a guard:
//! however the stream ends (client disconnect, pruned sink, heartbeat failure,
//! server shutdown) dropping it stops the heartbeat and unregisters the sink.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::Stream;
use metrics::counter;
use order_chat_core::frame::{CONNECTED_JSON, HEARTBEAT_JSON};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{ConnectionRegistry, RegistryError, Sink};

#[derive(Clone)]
pub struct StreamEndpoint {
    registry: ConnectionRegistry,
    heartbeat_interval: Duration,
    connected_frame: Arc<str>,
    heartbeat_frame: Arc<str>,
}

impl StreamEndpoint {
    pub fn new(registry: ConnectionRegistry, heartbeat_interval: Duration) -> Self {
        Self {
            registry,
            heartbeat_interval,
            connected_frame: Arc::from(CONNECTED_JSON),
            heartbeat_frame: Arc::from(HEARTBEAT_JSON),
        }
    }

    /// Registers a new subscriber for `conversation_id`. Must run inside a
    /// Tokio runtime since it spawns the heartbeat task.
    pub fn open(&self, conversation_id: String) -> Result<ConnectionStream, RegistryError> {
        let (sink, receiver) = self.registry.new_sink();
        let registration = self.registry.register(&conversation_id, sink.clone())?;

        // Fails only if the sink was closed between registering and here, e.g. by
        // a concurrent shutdown. The stream then ends on its first poll.
        if let Err(err) = sink.push(Arc::clone(&self.connected_frame)) {
            warn!(
                conversation_id = %conversation_id,
                sink_id = %sink.id(),
                reason = err.metric_label(),
                "connected frame not queued"
            );
        }

        let heartbeat = spawn_heartbeat(
            self.registry.clone(),
            conversation_id.clone(),
            sink.clone(),
            Arc::clone(&self.heartbeat_frame),
            self.heartbeat_interval,
        );

        counter!("order_chat_streams_opened_total", 1);
        info!(
            conversation_id = %conversation_id,
            sink_id = %sink.id(),
            active_sinks = registration.active_sinks,
            conversations = registration.total_conversations,
            "chat stream opened"
        );

        Ok(ConnectionStream {
            receiver,
            cancelled: Box::pin(sink.cancelled()),
            guard: ConnectionGuard {
                registry: self.registry.clone(),
                conversation_id,
                sink,
                heartbeat,
            },
        })
    }
}

/// Pushes a heartbeat into one connection's own sink every `period`, starting
/// one period after the stream opens.
fn spawn_heartbeat(
    registry: ConnectionRegistry,
    conversation_id: String,
    sink: Sink,
    frame: Arc<str>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancelled = sink.cancelled();
        tokio::pin!(cancelled);
        loop {
            tokio::select! {
                _ = &mut cancelled => break,
                _ = ticker.tick() => {
                    match sink.push(Arc::clone(&frame)) {
                        Ok(()) => counter!("order_chat_heartbeats_total", 1),
                        Err(err) => {
                            debug!(
                                conversation_id = %conversation_id,
                                sink_id = %sink.id(),
                                error = %err,
                                "heartbeat push failed; closing stream"
                            );
                            sink.cancel();
                            registry.unregister(&conversation_id, sink.id());
                            break;
                        }
                    }
                }
            }
        }
    })
}

/// Response body for one subscriber: yields serialized frames in push order
/// until the sink is cancelled or every sender is gone.
pub struct ConnectionStream {
    receiver: mpsc::Receiver<Arc<str>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    guard: ConnectionGuard,
}

impl ConnectionStream {
    pub fn sink_id(&self) -> Uuid {
        self.guard.sink.id()
    }

    pub fn conversation_id(&self) -> &str {
        &self.guard.conversation_id
    }
}

impl Stream for ConnectionStream {
    type Item = Arc<str>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        self.receiver.poll_recv(cx)
    }
}

struct ConnectionGuard {
    registry: ConnectionRegistry,
    conversation_id: String,
    sink: Sink,
    heartbeat: JoinHandle<()>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.sink.cancel();
        self.heartbeat.abort();
        let removal = self.registry.unregister(&self.conversation_id, self.sink.id());
        counter!("order_chat_streams_closed_total", 1);
        info!(
            conversation_id = %self.conversation_id,
            sink_id = %self.sink.id(),
            active_sinks = removal.active_sinks,
            conversations = removal.total_conversations,
            "chat stream closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{publisher::EventPublisher, registry::RegistryConfig};
    use futures_util::{FutureExt, StreamExt};
    use order_chat_core::{ChatMessage, SenderType, StreamFrame};

    const HEARTBEAT: &str = HEARTBEAT_JSON;
    const CONNECTED: &str = CONNECTED_JSON;

    fn endpoint(registry: &ConnectionRegistry) -> StreamEndpoint {
        StreamEndpoint::new(registry.clone(), Duration::from_secs(15))
    }

    fn ready_frames(stream: &mut ConnectionStream) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(Some(frame)) = stream.next().now_or_never() {
            frames.push(frame.to_string());
        }
        frames
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn open_registers_and_sends_connected_first() {
        let registry = ConnectionRegistry::default();
        let mut stream = endpoint(&registry).open("order-42".into()).unwrap();

        assert_eq!(registry.connection_count(), 1);
        assert_eq!(stream.conversation_id(), "order-42");
        assert_eq!(stream.next().await.as_deref(), Some(CONNECTED));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn heartbeat_cadence_matches_interval() {
        let registry = ConnectionRegistry::default();
        let mut stream = endpoint(&registry).open("order-42".into()).unwrap();
        assert_eq!(stream.next().await.as_deref(), Some(CONNECTED));

        // 61s window with a 15s interval: ticks at 15, 30, 45 and 60.
        tokio::time::sleep(Duration::from_secs(61)).await;

        let frames = ready_frames(&mut stream);
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|frame| frame == HEARTBEAT));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn frames_keep_push_order_across_heartbeat_and_publish() {
        let registry = ConnectionRegistry::default();
        let publisher = EventPublisher::new(registry.clone());
        let mut stream = endpoint(&registry).open("order-42".into()).unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;
        let mut msg = ChatMessage::new("order-42", SenderType::Staff, "on it");
        msg.id = "m1".into();
        publisher.publish("order-42", &StreamFrame::new_message(msg));

        let frames = ready_frames(&mut stream);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], CONNECTED);
        assert_eq!(frames[1], HEARTBEAT);
        assert!(frames[2].contains(r#""id":"m1""#));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn dropping_the_stream_unregisters_and_stops_heartbeat() {
        let registry = ConnectionRegistry::default();
        let stream = endpoint(&registry).open("order-42".into()).unwrap();
        let sink_id = stream.sink_id();
        let heartbeat_finished = stream.guard.heartbeat.is_finished();
        assert!(!heartbeat_finished);

        drop(stream);

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.conversation_count(), 0);
        assert!(!registry.unregister("order-42", sink_id).removed);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn server_cancellation_ends_the_stream_and_cleans_up() {
        let registry = ConnectionRegistry::default();
        let mut stream = endpoint(&registry).open("order-42".into()).unwrap();
        assert_eq!(stream.next().await.as_deref(), Some(CONNECTED));

        registry.close_all();

        assert_eq!(stream.next().await, None);
        drop(stream);
        assert_eq!(registry.conversation_count(), 0);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn heartbeat_failure_unregisters_the_sink() {
        let registry = ConnectionRegistry::new(RegistryConfig {
            sink_buffer: 1,
            max_sinks_per_conversation: 4,
        });
        let stream = endpoint(&registry).open("order-42".into()).unwrap();

        // The connected frame fills the single slot and nobody reads it, so the
        // first heartbeat push fails.
        tokio::time::sleep(Duration::from_secs(16)).await;

        assert_eq!(registry.connection_count(), 0);
        assert!(stream.guard.sink.is_cancelled());
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn open_past_the_cap_is_rejected_without_leaking() {
        let registry = ConnectionRegistry::new(RegistryConfig {
            sink_buffer: 4,
            max_sinks_per_conversation: 1,
        });
        let endpoint = endpoint(&registry);
        let _first = endpoint.open("order-42".into()).unwrap();

        assert!(endpoint.open("order-42".into()).is_err());
        assert_eq!(registry.connection_count(), 1);
    }
}
