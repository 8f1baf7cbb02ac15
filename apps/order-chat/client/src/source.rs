use async_trait::async_trait;
use futures_util::{future, stream::BoxStream, StreamExt};
use order_chat_core::SESSION_COOKIE;
use reqwest::header::COOKIE;
use reqwest_eventsource::{retry::Never, Error as EventSourceError, Event, EventSource};
use tracing::debug;

use crate::ClientError;

/// `data` payloads of one subscription, in arrival order. The stream ends when
/// the connection drops.
pub type FrameStream = BoxStream<'static, Result<String, ClientError>>;

/// Opens subscriptions to a conversation's event stream.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Resolves once the server has accepted the subscription.
    async fn connect(&self) -> Result<FrameStream, ClientError>;
}

/// Subscribes to `GET /api/chat/events` over HTTP.
#[derive(Clone)]
pub struct HttpEventSource {
    http: reqwest::Client,
    base_url: String,
    order_id: String,
    session_id: String,
}

impl HttpEventSource {
    pub fn new(
        base_url: impl Into<String>,
        order_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, order_id, session_id)
    }

    pub fn with_client(
        http: reqwest::Client,
        base_url: impl Into<String>,
        order_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            order_id: order_id.into(),
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
impl FrameSource for HttpEventSource {
    async fn connect(&self) -> Result<FrameStream, ClientError> {
        let request = self
            .http
            .get(format!("{}/api/chat/events", self.base_url))
            .query(&[("orderId", self.order_id.as_str())])
            .header(COOKIE, format!("{SESSION_COOKIE}={}", self.session_id));
        let mut events =
            EventSource::new(request).map_err(|err| ClientError::Stream(err.to_string()))?;
        // Reconnects are driven by the realtime manager's own policy.
        events.set_retry_policy(Box::new(Never));

        match events.next().await {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(_))) => {
                return Err(ClientError::Stream("message before open".into()))
            }
            Some(Err(err)) => return Err(map_error(err)),
            None => return Err(ClientError::Stream("closed before open".into())),
        }
        debug!(order_id = %self.order_id, "chat event stream open");

        let frames = events.filter_map(|event| {
            future::ready(match event {
                Ok(Event::Message(message)) => Some(Ok(message.data)),
                Ok(Event::Open) | Err(EventSourceError::StreamEnded) => None,
                Err(err) => Some(Err(map_error(err))),
            })
        });
        Ok(frames.boxed())
    }
}

fn map_error(err: EventSourceError) -> ClientError {
    match err {
        EventSourceError::Transport(err) => ClientError::Http(err),
        EventSourceError::InvalidStatusCode(status, ..) => ClientError::UnexpectedStatus {
            status: status.as_u16(),
            body: String::new(),
        },
        other => ClientError::Stream(other.to_string()),
    }
}
