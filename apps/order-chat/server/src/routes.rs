use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderName, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use order_chat_core::{ChatMessage, SenderType, SessionRecord, StreamFrame};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    auth::{AuthError, SessionCookie},
    publisher::EventPublisher,
    registry::{ConnectionRegistry, ConversationSnapshot},
    store::{MessageStore, SessionStore, SharedMessageStore, SharedSessionStore, StoreError},
    stream::StreamEndpoint,
};

pub struct AppState {
    registry: ConnectionRegistry,
    publisher: EventPublisher,
    endpoint: StreamEndpoint,
    sessions: SharedSessionStore,
    messages: SharedMessageStore,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        registry: ConnectionRegistry,
        heartbeat_interval: Duration,
        sessions: SharedSessionStore,
        messages: SharedMessageStore,
    ) -> Self {
        Self {
            publisher: EventPublisher::new(registry.clone()),
            endpoint: StreamEndpoint::new(registry.clone(), heartbeat_interval),
            registry,
            sessions,
            messages,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    async fn authenticate(&self, cookie: &SessionCookie) -> Result<SessionRecord, AuthError> {
        let session_id = cookie.as_deref().ok_or(AuthError::MissingCookie)?;
        let session = self
            .sessions
            .lookup(session_id)
            .await?
            .ok_or(AuthError::UnknownSession)?;
        session.ensure_not_expired(OffsetDateTime::now_utc())?;
        Ok(session)
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/chat/events", get(subscribe_handler))
        .route(
            "/api/orders/:order_id/messages",
            get(list_messages_handler).post(send_message_handler),
        )
        .with_state(state)
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    TooManyRequests(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::TooManyRequests(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "too_many_requests", Some(msg))
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", Some(msg)),
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Store(err) => {
                warn!(error = %err, "session store unavailable");
                ApiError::Internal("session store unavailable".into())
            }
            _ => ApiError::Unauthorized,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        warn!(error = %err, "message store failure");
        ApiError::Internal("message store unavailable".into())
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_conversations: usize,
    active_sinks: usize,
    conversations: Vec<ConversationSnapshot>,
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let conversations = state.registry.snapshot();
    Json(StatsResponse {
        active_conversations: conversations.len(),
        active_sinks: conversations.iter().map(|entry| entry.sinks).sum(),
        conversations,
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    #[serde(rename = "orderId")]
    order_id: Option<String>,
}

async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    cookie: SessionCookie,
    Query(query): Query<SubscribeQuery>,
) -> Response {
    let Some(order_id) = query.order_id.filter(|id| !id.trim().is_empty()) else {
        record_subscribe_rejection("missing_order_id");
        return ApiError::BadRequest("missing orderId".into()).into_response();
    };

    if let Err(err) = state.authenticate(&cookie).await {
        record_subscribe_rejection(err.metric_label());
        debug!(order_id = %order_id, error = %err, "subscribe rejected");
        return ApiError::from(err).into_response();
    }

    let stream = match state.endpoint.open(order_id) {
        Ok(stream) => stream,
        Err(err) => {
            record_subscribe_rejection("conversation_full");
            warn!(error = %err, "subscribe rejected");
            return ApiError::TooManyRequests(err.to_string()).into_response();
        }
    };

    debug!(
        conversation_id = stream.conversation_id(),
        sink_id = %stream.sink_id(),
        "streaming chat events"
    );
    let events = stream.map(|payload| Ok::<_, Infallible>(Event::default().data(&*payload)));
    (
        [
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events),
    )
        .into_response()
}

fn record_subscribe_rejection(reason: &'static str) {
    counter!("order_chat_subscribe_rejected_total", 1, "reason" => reason);
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    image_urls: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SendMessageResponse {
    id: String,
}

/// Persists a message from the session's user, then notifies subscribers.
/// Session callers are staff; customer messages arrive through the bot.
/// Notification is best-effort: a missed push leaves the stored message for
/// clients to pick up on their next poll.
async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    cookie: SessionCookie,
    Path(order_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult<SendMessageResponse> {
    let session = state.authenticate(&cookie).await?;

    let message = ChatMessage::new(order_id.as_str(), SenderType::Staff, request.message)
            .with_sender(session.user_id, session.username)
        .with_images(request.image_urls);
    if !message.has_content() {
        return Err(ApiError::BadRequest("message or image is required".into()));
    }

    let message = state.messages.append(message).await?;
    let id = message.id.clone();
    let report = state
        .publisher
        .publish(&order_id, &StreamFrame::new_message(message));
    debug!(
        order_id = %order_id,
        message_id = %id,
        delivered = report.delivered,
        "chat message stored"
    );

    Ok(Json(SendMessageResponse { id }))
}

async fn list_messages_handler(
    State(state): State<Arc<AppState>>,
    cookie: SessionCookie,
    Path(order_id): Path<String>,
) -> ApiResult<Vec<ChatMessage>> {
    state.authenticate(&cookie).await?;
    Ok(Json(state.messages.list(&order_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::RegistryConfig,
        store::{MemoryMessageStore, MemorySessionStore},
    };
    use axum::body::{self, Body};
    use axum::http::Request;
    use http_body_util::BodyExt;
    use order_chat_client::{ChatFeed, HttpEventSource, HttpMessageFetcher, RealtimeConfig};
    use order_chat_core::{encode_sse, frame::CONNECTED_JSON, DEFAULT_SESSION_TTL, SESSION_COOKIE};
    use tower::util::ServiceExt;

    const SESSION: &str = "sess-staff";

    fn test_state(limit: usize) -> Arc<AppState> {
        let sessions = MemorySessionStore::new();
        sessions.insert(
            SessionRecord::issue("user-7", DEFAULT_SESSION_TTL)
                .with_id(SESSION)
                .with_username("dana"),
        );
        let mut expired = SessionRecord::issue("user-8", DEFAULT_SESSION_TTL).with_id("sess-old");
        expired.expires_at = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        sessions.insert(expired);

        let registry = ConnectionRegistry::new(RegistryConfig {
            sink_buffer: 16,
            max_sinks_per_conversation: limit,
        });
        Arc::new(AppState::new(
            registry,
            Duration::from_secs(15),
            Arc::new(sessions),
            Arc::new(MemoryMessageStore::new()),
        ))
    }

    fn subscribe_request(uri: &str, session: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(session) = session {
            builder = builder.header("cookie", format!("{SESSION_COOKIE}={session}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn next_frame(body: &mut Body) -> String {
        loop {
            let frame = body.frame().await.expect("stream ended").unwrap();
            if let Ok(data) = frame.into_data() {
                return String::from_utf8(data.to_vec()).unwrap();
            }
        }
    }

    fn new_message(id: &str, order_id: &str) -> StreamFrame {
        let mut msg = ChatMessage::new(order_id, SenderType::Customer, "hello from the bot");
        msg.id = id.into();
        StreamFrame::new_message(msg)
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn subscribe_without_order_id_is_bad_request() {
        let app = build_router(test_state(4));
        for uri in ["/api/chat/events", "/api/chat/events?orderId="] {
            let response = app
                .clone()
                .oneshot(subscribe_request(uri, Some(SESSION)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn subscribe_without_valid_session_is_unauthorized() {
        let state = test_state(4);
        let app = build_router(state.clone());
        for session in [None, Some("sess-unknown"), Some("sess-old")] {
            let response = app
                .clone()
                .oneshot(subscribe_request("/api/chat/events?orderId=order-42", session))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{session:?}");
        }
        assert_eq!(state.registry.connection_count(), 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn subscriber_receives_its_conversation_only() {
        let state = test_state(4);
        let app = build_router(state.clone());

        let response = app
            .oneshot(subscribe_request("/api/chat/events?orderId=order-42", Some(SESSION)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(
            headers[header::CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(headers["x-accel-buffering"], "no");

        let mut body = response.into_body();
        assert_eq!(next_frame(&mut body).await, encode_sse(CONNECTED_JSON));

        let elsewhere = state
            .publisher
            .publish("order-43", &new_message("m0", "order-43"));
        assert_eq!(elsewhere.delivered, 0);

        let frame = new_message("m1", "order-42");
        let report = state.publisher.publish("order-42", &frame);
        assert_eq!(report.delivered, 1);
        assert_eq!(
            next_frame(&mut body).await,
            encode_sse(&frame.to_json().unwrap())
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn dropping_the_response_unregisters_the_subscriber() {
        let state = test_state(4);
        let app = build_router(state.clone());

        let response = app
            .oneshot(subscribe_request("/api/chat/events?orderId=order-42", Some(SESSION)))
            .await
            .unwrap();
        assert_eq!(state.registry.connection_count(), 1);

        drop(response);

        assert_eq!(state.registry.connection_count(), 0);
        assert!(state.registry.snapshot().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn subscribe_past_the_cap_is_rejected() {
        let state = test_state(1);
        let app = build_router(state.clone());

        let first = app
            .clone()
            .oneshot(subscribe_request("/api/chat/events?orderId=order-42", Some(SESSION)))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(subscribe_request("/api/chat/events?orderId=order-42", Some(SESSION)))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(state.registry.connection_count(), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn send_message_persists_then_publishes() {
        let state = test_state(4);
        let app = build_router(state.clone());

        let stream = app
            .clone()
            .oneshot(subscribe_request("/api/chat/events?orderId=order-42", Some(SESSION)))
            .await
            .unwrap();
        let mut body = stream.into_body();
        next_frame(&mut body).await;

        let sent = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/orders/order-42/messages")
                    .header("cookie", format!("{SESSION_COOKIE}={SESSION}"))
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "message": "Your order shipped" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(sent.status(), StatusCode::OK);
        let bytes = body::to_bytes(sent.into_body(), usize::MAX).await.unwrap();
        let sent: SendMessageResponse = serde_json::from_slice(&bytes).unwrap();

        let pushed = next_frame(&mut body).await;
        let pushed = pushed
            .strip_prefix("data: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .unwrap();
        match StreamFrame::from_json(pushed).unwrap() {
            StreamFrame::NewMessage { message } => {
                assert_eq!(message.id, sent.id);
                assert_eq!(message.sender_type, SenderType::Staff);
                assert_eq!(message.sender_id.as_deref(), Some("user-7"));
                assert_eq!(message.sender_name.as_deref(), Some("dana"));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let listed = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/orders/order-42/messages")
                    .header("cookie", format!("{SESSION_COOKIE}={SESSION}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(listed.status(), StatusCode::OK);
        let bytes = body::to_bytes(listed.into_body(), usize::MAX).await.unwrap();
        let listed: Vec<ChatMessage> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, sent.id);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn send_message_ignores_a_client_supplied_sender_type() {
        let state = test_state(4);
        let app = build_router(state.clone());

        let sent = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/orders/order-42/messages")
                    .header("cookie", format!("{SESSION_COOKIE}={SESSION}"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({ "message": "spoof", "senderType": "customer" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(sent.status(), StatusCode::OK);

        let stored = state.messages.list("order-42").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message, "spoof");
        assert_eq!(stored[0].sender_type, SenderType::Staff);
        assert_eq!(stored[0].sender_id.as_deref(), Some("user-7"));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn empty_message_is_rejected() {
        let app = build_router(test_state(4));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/orders/order-42/messages")
                    .header("cookie", format!("{SESSION_COOKIE}={SESSION}"))
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "message": "  ", "imageUrls": [] }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn realtime_client_receives_pushed_message_over_loopback() {
        let state = test_state(4);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let router = build_router(state.clone());
        let server = tokio::spawn(async move { axum::serve(listener, router).await });

        let feed = ChatFeed::new(
            "order-42",
            Arc::new(HttpMessageFetcher::new(base_url.clone(), SESSION)),
        );
        feed.load().await.unwrap();
        let mut updates = feed.subscribe();
        let mut realtime = feed.start_realtime(
            RealtimeConfig::default(),
            Arc::new(HttpEventSource::new(base_url.clone(), "order-42", SESSION)),
        );

        while !realtime.is_connected() || state.registry.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = reqwest::Client::new()
            .post(format!("{base_url}/api/orders/order-42/messages"))
            .header("cookie", format!("{SESSION_COOKIE}={SESSION}"))
            .json(&json!({ "message": "Packed and ready" }))
            .send()
            .await
            .unwrap();
        let sent: SendMessageResponse = response.json().await.unwrap();

        while !feed.messages().iter().any(|msg| msg.id == sent.id) {
            updates.changed().await.unwrap();
        }
        // A poll of the authoritative list must not duplicate the pushed entry.
        feed.refresh().await.unwrap();
        let matching = feed
            .messages()
            .iter()
            .filter(|msg| msg.id == sent.id)
            .count();
        assert_eq!(matching, 1);

        realtime.stop();
        server.abort();
    }
}
