use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    Staff,
    Customer,
}

/// A persisted chat message as pushed to subscribers and returned by the
/// message listing endpoint. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub order_id: String,
    pub sender_id: Option<String>,
    pub sender_type: SenderType,
    pub message: String,
    #[serde(default)]
    pub image_urls: Option<Vec<String>>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default)]
    pub sender_name: Option<String>,
}

impl ChatMessage {
    pub fn new(order_id: impl Into<String>, sender_type: SenderType, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.into(),
            sender_id: None,
            sender_type,
            message: body.into(),
            image_urls: None,
            created_at: OffsetDateTime::now_utc(),
            sender_name: None,
        }
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>, sender_name: Option<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self.sender_name = sender_name;
        self
    }

    /// Attaches image references. An empty list is stored as `None`.
    pub fn with_images(mut self, image_urls: Vec<String>) -> Self {
        self.image_urls = if image_urls.is_empty() {
            None
        } else {
            Some(image_urls)
        };
        self
    }

    /// A message must carry text or at least one image.
    pub fn has_content(&self) -> bool {
        !self.message.trim().is_empty()
            || self
                .image_urls
                .as_ref()
                .map(|urls| !urls.is_empty())
                .unwrap_or(false)
    }
}
