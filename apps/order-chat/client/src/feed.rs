use std::sync::Arc;

use async_trait::async_trait;
use order_chat_core::{ChatMessage, StreamFrame, SESSION_COOKIE};
use reqwest::header::COOKIE;
use tokio::sync::watch;
use tracing::debug;

use crate::{
    ClientError, FrameSource, PollFallback, RealtimeConfig, RealtimeHandler, RealtimeManager,
};

/// Source of the authoritative message list for an order.
#[async_trait]
pub trait MessageFetcher: Send + Sync {
    async fn fetch(&self, order_id: &str) -> Result<Vec<ChatMessage>, ClientError>;
}

/// Reads `GET /api/orders/{orderId}/messages`.
#[derive(Clone)]
pub struct HttpMessageFetcher {
    http: reqwest::Client,
    base_url: String,
    session_id: String,
}

impl HttpMessageFetcher {
    pub fn new(base_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, session_id)
    }

    pub fn with_client(
        http: reqwest::Client,
        base_url: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
impl MessageFetcher for HttpMessageFetcher {
    async fn fetch(&self, order_id: &str) -> Result<Vec<ChatMessage>, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/orders/{order_id}/messages", self.base_url))
            .header(COOKIE, format!("{SESSION_COOKIE}={}", self.session_id))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

/// Message list of one order, fed by realtime pushes and reconciled against
/// the authoritative list on every poll.
#[derive(Clone)]
pub struct ChatFeed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    order_id: String,
    fetcher: Arc<dyn MessageFetcher>,
    messages: watch::Sender<Vec<ChatMessage>>,
}

impl ChatFeed {
    pub fn new(order_id: impl Into<String>, fetcher: Arc<dyn MessageFetcher>) -> Self {
        let (messages, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(FeedInner {
                order_id: order_id.into(),
                fetcher,
                messages,
            }),
        }
    }

    pub fn order_id(&self) -> &str {
        &self.inner.order_id
    }

    /// Initial catch-up: replaces the list with the authoritative one.
    pub async fn load(&self) -> Result<(), ClientError> {
        let fetched = self.inner.fetcher.fetch(&self.inner.order_id).await?;
        self.inner.messages.send_replace(fetched);
        Ok(())
    }

    /// Fetches the authoritative list and reconciles against it.
    pub async fn refresh(&self) -> Result<bool, ClientError> {
        let fetched = self.inner.fetcher.fetch(&self.inner.order_id).await?;
        Ok(self.reconcile(fetched))
    }

    /// Appends a pushed message unless one with the same id is already known.
    pub fn push(&self, message: ChatMessage) -> bool {
        self.inner.messages.send_if_modified(|list| {
            if list.iter().any(|known| known.id == message.id) {
                return false;
            }
            list.push(message);
            true
        })
    }

    /// Adopts `fetched` when it diverges from the local list in length or in
    /// the id of the newest message.
    pub fn reconcile(&self, fetched: Vec<ChatMessage>) -> bool {
        self.inner.messages.send_if_modified(|list| {
            let diverged = list.len() != fetched.len()
                || list.last().map(|msg| &msg.id) != fetched.last().map(|msg| &msg.id);
            if diverged {
                *list = fetched;
            }
            diverged
        })
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.messages.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.inner.messages.subscribe()
    }

    /// Starts a realtime manager that pushes into and polls for this feed.
    pub fn start_realtime(
        &self,
        config: RealtimeConfig,
        source: Arc<dyn FrameSource>,
    ) -> RealtimeManager {
        let mut manager = RealtimeManager::new(config, source, Arc::new(self.clone()));
        manager.start(Arc::new(self.clone()));
        manager
    }
}

impl RealtimeHandler for ChatFeed {
    fn on_frame(&self, frame: StreamFrame) {
        if let StreamFrame::NewMessage { message } = frame {
            if message.order_id != self.inner.order_id {
                debug!(
                    order_id = %self.inner.order_id,
                    message_order_id = %message.order_id,
                    "ignoring message for another order"
                );
                return;
            }
            self.push(message);
        }
    }

    fn on_connection_change(&self, connected: bool) {
        debug!(order_id = %self.inner.order_id, connected, "chat realtime link changed");
    }
}

#[async_trait]
impl PollFallback for ChatFeed {
    async fn poll(&self) -> Result<(), ClientError> {
        self.refresh().await.map(|_| ())
    }
}
