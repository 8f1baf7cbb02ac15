use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::gauge;
use slab::Slab;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use uuid::Uuid;

pub const DEFAULT_SINK_BUFFER: usize = 64;
pub const DEFAULT_MAX_SINKS_PER_CONVERSATION: usize = 32;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub sink_buffer: usize,
    pub max_sinks_per_conversation: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sink_buffer: DEFAULT_SINK_BUFFER,
            max_sinks_per_conversation: DEFAULT_MAX_SINKS_PER_CONVERSATION,
        }
    }
}

/// Output handle for one connected subscriber.
///
/// Frames are pre-serialized JSON payloads; the receiving half is owned by the
/// connection's response stream. Cancelling the sink ends that stream and its
/// heartbeat.
#[derive(Clone)]
pub struct Sink {
    id: Uuid,
    sender: mpsc::Sender<Arc<str>>,
    cancel: CancellationToken,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("sink closed")]
    Closed,
    #[error("sink buffer full")]
    Full,
}

impl PushError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            PushError::Closed => "closed",
            PushError::Full => "full",
        }
    }
}

impl Sink {
    pub fn channel(buffer: usize) -> (Sink, mpsc::Receiver<Arc<str>>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let sink = Sink {
            id: Uuid::new_v4(),
            sender,
            cancel: CancellationToken::new(),
        };
        (sink, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Non-blocking push. A closed receiver or a full buffer are both failures.
    pub fn push(&self, payload: Arc<str>) -> Result<(), PushError> {
        if self.is_cancelled() {
            return Err(PushError::Closed);
        }
        self.sender.try_send(payload).map_err(|err| match err {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFutureOwned {
        self.cancel.clone().cancelled_owned()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("conversation {conversation_id} already has {limit} open streams")]
    ConversationFull {
        conversation_id: String,
        limit: usize,
    },
}

/// Process-wide table of open sinks keyed by conversation.
///
/// Cheap to clone; every clone shares the same table. An entry exists only
/// while its conversation has at least one sink.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    conversations: DashMap<String, SinkSet>,
    config: RegistryConfig,
    active_sinks: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub active_sinks: usize,
    pub total_conversations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub removed: bool,
    pub active_sinks: usize,
    pub total_conversations: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationSnapshot {
    pub conversation_id: String,
    pub sinks: usize,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                conversations: DashMap::new(),
                config,
                active_sinks: AtomicUsize::new(0),
            }),
        }
    }

    /// Creates a sink sized by the registry's buffer setting. The sink is not
    /// registered yet.
    pub fn new_sink(&self) -> (Sink, mpsc::Receiver<Arc<str>>) {
        Sink::channel(self.inner.config.sink_buffer)
    }

    /// Adds `sink` to the conversation's set, creating the set if needed.
    /// Registering the same sink twice is a no-op.
    pub fn register(&self, conversation_id: &str, sink: Sink) -> Result<Registration, RegistryError> {
        let limit = self.inner.config.max_sinks_per_conversation;
        let active_sinks = match self.inner.conversations.entry(conversation_id.to_owned()) {
            Entry::Occupied(mut entry) => {
                let set = entry.get_mut();
                if set.contains(sink.id) {
                    set.len()
                } else if set.len() >= limit {
                    return Err(RegistryError::ConversationFull {
                        conversation_id: conversation_id.to_owned(),
                        limit,
                    });
                } else {
                    set.insert(sink);
                    self.inner.active_sinks.fetch_add(1, Ordering::Relaxed);
                    set.len()
                }
            }
            Entry::Vacant(entry) => {
                if limit == 0 {
                    return Err(RegistryError::ConversationFull {
                        conversation_id: conversation_id.to_owned(),
                        limit,
                    });
                }
                let mut set = SinkSet::default();
                set.insert(sink);
                entry.insert(set);
                self.inner.active_sinks.fetch_add(1, Ordering::Relaxed);
                1
            }
        };

        self.record_gauges();
        Ok(Registration {
            active_sinks,
            total_conversations: self.inner.conversations.len(),
        })
    }

    /// Removes the sink and drops the conversation entry once it is empty.
    /// Unknown conversations or sinks are ignored.
    pub fn unregister(&self, conversation_id: &str, sink_id: Uuid) -> Removal {
        let mut removed = false;
        let mut active_sinks = 0usize;

        if let Entry::Occupied(mut entry) = self.inner.conversations.entry(conversation_id.to_owned()) {
            removed = entry.get_mut().remove(sink_id);
            active_sinks = entry.get().len();
            if active_sinks == 0 {
                entry.remove();
            }
        }

        if removed {
            self.inner.active_sinks.fetch_sub(1, Ordering::Relaxed);
            self.record_gauges();
        }

        Removal {
            removed,
            active_sinks,
            total_conversations: self.inner.conversations.len(),
        }
    }

    /// Current sinks of a conversation. Only the publisher reads this.
    pub(crate) fn sinks(&self, conversation_id: &str) -> Vec<Sink> {
        self.inner
            .conversations
            .get(conversation_id)
            .map(|set| set.sinks())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.active_sinks.load(Ordering::Relaxed)
    }

    pub fn conversation_count(&self) -> usize {
        self.inner.conversations.len()
    }

    pub fn snapshot(&self) -> Vec<ConversationSnapshot> {
        let mut snapshots: Vec<ConversationSnapshot> = self
            .inner
            .conversations
            .iter()
            .map(|entry| ConversationSnapshot {
                conversation_id: entry.key().clone(),
                sinks: entry.value().len(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        snapshots
    }

    /// Cancels every open sink. Each connection's stream then ends and
    /// unregisters itself.
    pub fn close_all(&self) -> usize {
        let mut closed = 0usize;
        for entry in self.inner.conversations.iter() {
            for sink in entry.value().sinks() {
                sink.cancel();
                closed += 1;
            }
        }
        closed
    }

    fn record_gauges(&self) {
        gauge!(
            "order_chat_sinks_active",
            self.inner.active_sinks.load(Ordering::Relaxed) as f64
        );
        gauge!(
            "order_chat_conversations_active",
            self.inner.conversations.len() as f64
        );
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[derive(Default)]
struct SinkSet {
    slab: Slab<Sink>,
    index_map: HashMap<Uuid, usize>,
}

impl SinkSet {
    fn contains(&self, id: Uuid) -> bool {
        self.index_map.contains_key(&id)
    }

    fn insert(&mut self, sink: Sink) {
        let id = sink.id;
        let key = self.slab.insert(sink);
        self.index_map.insert(id, key);
    }

    fn remove(&mut self, id: Uuid) -> bool {
        match self.index_map.remove(&id) {
            Some(key) => {
                self.slab.remove(key);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.slab.len()
    }

    fn sinks(&self) -> Vec<Sink> {
        self.slab.iter().map(|(_, sink)| sink.clone()).collect()
    }
}
