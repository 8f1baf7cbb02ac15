//! Client side of the order chat realtime relay.
//!
//! [`RealtimeManager`] keeps an event stream open with automatic reconnects and
//! falls back to polling whenever the stream looks unhealthy. [`ChatFeed`]
//! builds a deduplicated message list for one order on top of it.

pub mod error;
pub mod feed;
pub mod realtime;
pub mod source;

pub use error::ClientError;
pub use feed::{ChatFeed, HttpMessageFetcher, MessageFetcher};
pub use realtime::{
    PollFallback, RealtimeConfig, RealtimeHandler, RealtimeManager, ReconnectPolicy,
};
pub use source::{FrameSource, FrameStream, HttpEventSource};
