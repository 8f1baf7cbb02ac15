use std::sync::Arc;

use metrics::counter;
use order_chat_core::StreamFrame;
use tracing::{debug, warn};

use crate::registry::ConnectionRegistry;

/// Fans frames out to every sink registered for a conversation.
#[derive(Clone)]
pub struct EventPublisher {
    registry: ConnectionRegistry,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub pruned: usize,
}

impl EventPublisher {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Best-effort delivery of `frame` to the conversation's subscribers.
    ///
    /// Never fails: sinks that reject the push are cancelled and unregistered,
    /// and a conversation without subscribers is a silent no-op.
    pub fn publish(&self, conversation_id: &str, frame: &StreamFrame) -> PublishReport {
        let payload: Arc<str> = match frame.to_json() {
            Ok(json) => Arc::from(json),
            Err(err) => {
                warn!(
                    conversation_id,
                    frame = frame.label(),
                    error = %err,
                    "failed to serialize frame"
                );
                return PublishReport::default();
            }
        };
        self.publish_payload(conversation_id, payload)
    }

    pub fn publish_payload(&self, conversation_id: &str, payload: Arc<str>) -> PublishReport {
        let mut report = PublishReport::default();
        let sinks = self.registry.sinks(conversation_id);
        if sinks.is_empty() {
            return report;
        }

        let mut dead = Vec::new();
        for sink in sinks {
            match sink.push(Arc::clone(&payload)) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    counter!(
                        "order_chat_sinks_pruned_total",
                        1,
                        "reason" => err.metric_label()
                    );
                    debug!(
                        conversation_id,
                        sink_id = %sink.id(),
                        error = %err,
                        "pruning dead sink"
                    );
                    dead.push(sink);
                }
            }
        }

        for sink in dead {
            sink.cancel();
            if self.registry.unregister(conversation_id, sink.id()).removed {
                report.pruned += 1;
            }
        }

        if report.delivered > 0 {
            counter!(
                "order_chat_frames_delivered_total",
                report.delivered as u64
            );
        }
        debug!(
            conversation_id,
            delivered = report.delivered,
            pruned = report.pruned,
            "published frame"
        );
        report
    }
}
