//! Keeps a realtime subscription alive and covers its gaps with polling.
//!
//! Two tasks run per started manager. The stream task connects through a
//! [`FrameSource`], forwards chat frames to the [`RealtimeHandler`] and
//! reconnects according to the [`ReconnectPolicy`] whenever the stream fails
//! or ends. The polling task ticks at a fixed interval and calls the
//! [`PollFallback`] unless the stream is connected and has produced a frame
//! within the liveness threshold.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use order_chat_core::{
    timing::{LIVENESS_THRESHOLD, POLL_INTERVAL, RECONNECT_DELAY},
    StreamFrame,
};
use parking_lot::Mutex;
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{ClientError, FrameSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Wait the same delay before every attempt, forever.
    Fixed(Duration),
    /// Double the delay after each consecutive failure, capped at `max`, and
    /// give up after `max_attempts` failures in a row.
    Exponential {
        initial: Duration,
        max: Duration,
        max_attempts: u32,
    },
}

impl ReconnectPolicy {
    /// Delay before reconnecting after `failures` consecutive failures
    /// (starting at 1), or `None` once the policy gives up.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        match self {
            ReconnectPolicy::Fixed(delay) => Some(*delay),
            ReconnectPolicy::Exponential {
                initial,
                max,
                max_attempts,
            } => {
                if failures == 0 || failures > *max_attempts {
                    return None;
                }
                let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
                Some(initial.saturating_mul(factor).min(*max))
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(RECONNECT_DELAY)
    }
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub poll_interval: Duration,
    pub liveness_threshold: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            liveness_threshold: LIVENESS_THRESHOLD,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Receives what the stream delivers. Callbacks run on the stream task and
/// must not block.
pub trait RealtimeHandler: Send + Sync {
    /// A non-control frame arrived.
    fn on_frame(&self, frame: StreamFrame);

    fn on_connection_change(&self, _connected: bool) {}

    /// The reconnect policy gave up; only polling delivers from here on.
    fn on_reconnect_exhausted(&self) {}
}

#[async_trait]
pub trait PollFallback: Send + Sync {
    async fn poll(&self) -> Result<(), ClientError>;
}

struct LinkState {
    connected: AtomicBool,
    last_heartbeat: Mutex<Instant>,
}

impl LinkState {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            last_heartbeat: Mutex::new(Instant::now()),
        }
    }

    fn mark_alive(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Returns the previous value.
    fn set_connected(&self, connected: bool) -> bool {
        self.connected.swap(connected, Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_healthy(&self, threshold: Duration) -> bool {
        self.is_connected() && self.last_heartbeat.lock().elapsed() < threshold
    }
}

pub struct RealtimeManager {
    config: RealtimeConfig,
    source: Arc<dyn FrameSource>,
    handler: Arc<dyn RealtimeHandler>,
    link: Arc<LinkState>,
    stream_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
}

impl RealtimeManager {
    pub fn new(
        config: RealtimeConfig,
        source: Arc<dyn FrameSource>,
        handler: Arc<dyn RealtimeHandler>,
    ) -> Self {
        Self {
            config,
            source,
            handler,
            link: Arc::new(LinkState::new()),
            stream_task: None,
            poll_task: None,
        }
    }

    /// Starts streaming and polling, replacing any previous run. Must be called
    /// inside a Tokio runtime.
    pub fn start(&mut self, poll: Arc<dyn PollFallback>) {
        self.stop();
        // Fresh state so tasks from an earlier run cannot flip this one.
        self.link = Arc::new(LinkState::new());

        self.stream_task = Some(tokio::spawn(run_stream(
            self.config.reconnect.clone(),
            Arc::clone(&self.source),
            Arc::clone(&self.handler),
            Arc::clone(&self.link),
        )));
        self.poll_task = Some(tokio::spawn(run_polling(
            self.config.poll_interval,
            self.config.liveness_threshold,
            Arc::clone(&self.link),
            poll,
        )));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.link.set_connected(false);
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

impl Drop for RealtimeManager {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_stream(
    policy: ReconnectPolicy,
    source: Arc<dyn FrameSource>,
    handler: Arc<dyn RealtimeHandler>,
    link: Arc<LinkState>,
) {
    let mut failures: u32 = 0;
    loop {
        match source.connect().await {
            Ok(mut frames) => {
                failures = 0;
                link.mark_alive();
                if !link.set_connected(true) {
                    handler.on_connection_change(true);
                }
                while let Some(item) = frames.next().await {
                    match item {
                        Ok(data) => {
                            link.mark_alive();
                            dispatch(&data, handler.as_ref());
                        }
                        Err(err) => {
                            debug!(error = %err, "chat event stream failed");
                            break;
                        }
                    }
                }
            }
            Err(err) => debug!(error = %err, "chat event stream connect failed"),
        }

        if link.set_connected(false) {
            handler.on_connection_change(false);
        }
        failures = failures.saturating_add(1);
        match policy.delay_for(failures) {
            Some(delay) => {
                debug!(
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling chat stream reconnect"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                warn!(failures, "chat stream reconnect attempts exhausted; polling only");
                handler.on_reconnect_exhausted();
                return;
            }
        }
    }
}

fn dispatch(data: &str, handler: &dyn RealtimeHandler) {
    match StreamFrame::from_json(data) {
        Ok(frame) if frame.is_control() => {}
        Ok(frame) => handler.on_frame(frame),
        Err(err) => debug!(error = %err, "ignoring unparseable frame"),
    }
}

async fn run_polling(
    period: Duration,
    liveness_threshold: Duration,
    link: Arc<LinkState>,
    poll: Arc<dyn PollFallback>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if link.is_healthy(liveness_threshold) {
            continue;
        }
        if let Err(err) = poll.poll().await {
            warn!(error = %err, "fallback poll failed");
        }
    }
}
