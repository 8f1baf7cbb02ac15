//! Default timings for the realtime channel.

use std::time::Duration;

/// Interval between keepalive frames pushed to each open stream.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(15_000);

/// How often a client checks whether it must fall back to polling.
pub const POLL_INTERVAL: Duration = Duration::from_millis(2_000);

/// Maximum stream silence after which a client presumes the stream dead.
pub const LIVENESS_THRESHOLD: Duration = Duration::from_millis(30_000);

/// Delay before a client reopens a failed stream.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(2_000);
