//! Upstream Heartbeat and Read Watchdog
//!
//! Keeps the upstream connection alive with periodic WebSocket pings and
//! declares it dead when no frame of any kind has arrived for the idle
//! timeout. A silent feed is treated exactly like a transport error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between WebSocket pings.
    pub ping_interval: Duration,
    /// Maximum silence before the connection is considered dead.
    pub idle_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl HeartbeatConfig {
    /// How often the watchdog checks for silence.
    fn check_interval(&self) -> Duration {
        (self.idle_timeout / 4).max(Duration::from_millis(10))
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a WebSocket ping.
    SendPing,
    /// Nothing was received for longer than the idle timeout.
    Timeout {
        /// How long the connection has been silent.
        idle: Duration,
    },
}

/// Last-activity clock shared between the read loop and the manager.
#[derive(Debug)]
pub struct HeartbeatState {
    last_frame: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create state stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_frame: RwLock::new(Instant::now()),
        }
    }

    /// Record that a frame (data, control, or pong) arrived.
    pub fn record_frame(&self) {
        *self.last_frame.write() = Instant::now();
    }

    /// Time since the last frame.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_frame.read().elapsed()
    }
}

/// Drives pings and the idle watchdog for one upstream connection.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the receiver goes away, or a timeout fires.
    pub async fn run(self) {
        let start = tokio::time::Instant::now();
        let mut ping = tokio::time::interval_at(
            start + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut watchdog = tokio::time::interval(self.config.check_interval());
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = ping.tick() => {
                    if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
                        break;
                    }
                }
                _ = watchdog.tick() => {
                    let idle = self.state.idle_for();
                    if idle > self.config.idle_timeout {
                        tracing::warn!(
                            idle_secs = idle.as_secs(),
                            timeout_secs = self.config.idle_timeout.as_secs(),
                            "Upstream idle timeout"
                        );
                        let _ = self.event_tx.send(HeartbeatEvent::Timeout { idle }).await;
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_manager(
        ping_ms: u64,
        idle_ms: u64,
    ) -> (
        Arc<HeartbeatState>,
        mpsc::Receiver<HeartbeatEvent>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let config = HeartbeatConfig {
            ping_interval: Duration::from_millis(ping_ms),
            idle_timeout: Duration::from_millis(idle_ms),
        };
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, event_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let manager = HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel.clone());
        (state, event_rx, cancel, tokio::spawn(manager.run()))
    }

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(60));
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn record_frame_resets_idle_clock() {
        let state = HeartbeatState::new();
        *state.last_frame.write() = Instant::now()
            .checked_sub(Duration::from_secs(5))
            .unwrap();
        assert!(state.idle_for() >= Duration::from_secs(5));

        state.record_frame();
        assert!(state.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sends_pings_while_frames_arrive() {
        let (state, mut event_rx, cancel, handle) = spawn_manager(30, 10_000);

        let event = tokio::time::timeout(Duration::from_millis(500), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        state.record_frame();

        assert_eq!(event, HeartbeatEvent::SendPing);
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn silent_connection_times_out() {
        let (_state, mut event_rx, _cancel, handle) = spawn_manager(10_000, 80);

        let event = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(event, HeartbeatEvent::Timeout { idle } if idle > Duration::from_millis(80)));
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_manager() {
        let (_state, _event_rx, cancel, handle) = spawn_manager(10_000, 10_000);

        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(200), handle).await;
        assert!(result.is_ok(), "manager should shut down on cancellation");
    }
}
