//! Core primitives shared by the order chat relay server and its clients.
//!
//! Dependencies stay light so the server, the realtime client and any test
//! harness agree on a single definition of the wire frames, chat messages and
//! session records.

pub mod frame;
pub mod message;
pub mod session;
pub mod timing;

pub use frame::{encode_sse, StreamFrame};
pub use message::{ChatMessage, SenderType};
pub use session::{SessionRecord, SessionValidationError, DEFAULT_SESSION_TTL, SESSION_COOKIE};
