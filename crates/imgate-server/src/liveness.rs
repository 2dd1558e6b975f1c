//! Per-connection timers.
//!
//! The monitor owns three deadlines: the auth window, the read-idle window
//! and an optional write-idle window. It never spawns or blocks; the
//! connection task polls [`LivenessMonitor::expired`] alongside its socket
//! and receives expiry as just another event.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep, sleep};

use crate::config::LivenessConfig;

/// Timer durations for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessSettings {
    /// Deadline for the first successful AUTH.
    pub auth_timeout: Duration,
    /// Inbound silence tolerated before closing.
    pub read_idle: Duration,
    /// Outbound silence before sending a server heartbeat.
    pub write_idle: Option<Duration>,
}

impl From<&LivenessConfig> for LivenessSettings {
    fn from(config: &LivenessConfig) -> Self {
        Self {
            auth_timeout: config.auth_timeout(),
            read_idle: config.read_idle_timeout(),
            write_idle: config.write_idle_timeout(),
        }
    }
}

/// A timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// No AUTH completed within the auth window.
    AuthTimeout,
    /// No inbound traffic within the read-idle window.
    ReadIdle,
    /// No outbound traffic within the write-idle window.
    WriteIdle,
}

/// Deadline tracker for one connection.
#[derive(Debug)]
pub struct LivenessMonitor {
    settings: LivenessSettings,
    auth: Option<Pin<Box<Sleep>>>,
    read_idle: Pin<Box<Sleep>>,
    write_idle: Option<Pin<Box<Sleep>>>,
}

impl LivenessMonitor {
    /// Arm all timers from now. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(settings: LivenessSettings) -> Self {
        Self {
            settings,
            auth: Some(Box::pin(sleep(settings.auth_timeout))),
            read_idle: Box::pin(sleep(settings.read_idle)),
            write_idle: settings.write_idle.map(|d| Box::pin(sleep(d))),
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &LivenessSettings {
        &self.settings
    }

    /// Whether the auth window is still armed.
    #[must_use]
    pub const fn awaiting_auth(&self) -> bool {
        self.auth.is_some()
    }

    /// Inbound traffic observed: push the read-idle deadline out.
    pub fn record_inbound(&mut self) {
        let deadline = Instant::now() + self.settings.read_idle;
        self.read_idle.as_mut().reset(deadline);
    }

    /// Outbound traffic written: push the write-idle deadline out.
    pub fn record_outbound(&mut self) {
        if let (Some(timer), Some(period)) = (self.write_idle.as_mut(), self.settings.write_idle) {
            timer.as_mut().reset(Instant::now() + period);
        }
    }

    /// Disarm the auth window.
    pub fn auth_completed(&mut self) {
        self.auth = None;
    }

    /// Wait for the next timer to fire. Cancel-safe.
    pub async fn expired(&mut self) -> LivenessEvent {
        let event = tokio::select! {
            biased;
            () = wait(self.auth.as_mut()) => LivenessEvent::AuthTimeout,
            () = self.read_idle.as_mut() => LivenessEvent::ReadIdle,
            () = wait(self.write_idle.as_mut()) => LivenessEvent::WriteIdle,
        };
        match event {
            LivenessEvent::AuthTimeout => self.auth = None,
            LivenessEvent::WriteIdle => self.record_outbound(),
            LivenessEvent::ReadIdle => {}
        }
        event
    }
}

async fn wait(timer: Option<&mut Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, task};

    fn settings(write_idle: Option<u64>) -> LivenessSettings {
        LivenessSettings {
            auth_timeout: Duration::from_secs(10),
            read_idle: Duration::from_secs(180),
            write_idle: write_idle.map(Duration::from_secs),
        }
    }

    fn assert_elapsed(start: Instant, secs: u64) {
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(secs), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(secs + 1), "fired late: {elapsed:?}");
    }

    #[test]
    fn test_settings_from_config() {
        let config = LivenessConfig {
            read_idle_timeout_secs: 60,
            write_idle_timeout_secs: 0,
            auth_timeout_secs: 5,
        };
        let s = LivenessSettings::from(&config);
        assert_eq!(s.read_idle, Duration::from_secs(60));
        assert_eq!(s.auth_timeout, Duration::from_secs(5));
        assert_eq!(s.write_idle, None);
    }

    // ==================== Auth Window Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout_fires_first() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(settings(None));
        assert!(monitor.awaiting_auth());
        assert_eq!(monitor.expired().await, LivenessEvent::AuthTimeout);
        assert_elapsed(start, 10);
        assert!(!monitor.awaiting_auth());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_completed_disarms_window() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(settings(None));
        monitor.auth_completed();
        assert_eq!(monitor.expired().await, LivenessEvent::ReadIdle);
        assert_elapsed(start, 180);
    }

    // ==================== Read Idle Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_inbound_traffic_pushes_read_deadline() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(settings(None));
        monitor.auth_completed();

        tokio::time::advance(Duration::from_secs(100)).await;
        monitor.record_inbound();

        assert_eq!(monitor.expired().await, LivenessEvent::ReadIdle);
        assert_elapsed(start, 280);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_before_deadline() {
        let mut monitor = LivenessMonitor::new(settings(None));
        monitor.auth_completed();
        tokio::time::advance(Duration::from_secs(179)).await;
        let mut fut = task::spawn(monitor.expired());
        assert_pending!(fut.poll());
    }

    // ==================== Write Idle Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_write_idle_fires_and_rearms() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(settings(Some(30)));
        monitor.auth_completed();

        assert_eq!(monitor.expired().await, LivenessEvent::WriteIdle);
        assert_elapsed(start, 30);
        assert_eq!(monitor.expired().await, LivenessEvent::WriteIdle);
        assert_elapsed(start, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_traffic_pushes_write_deadline() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(settings(Some(30)));
        monitor.auth_completed();

        tokio::time::advance(Duration::from_secs(20)).await;
        monitor.record_outbound();

        assert_eq!(monitor.expired().await, LivenessEvent::WriteIdle);
        assert_elapsed(start, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_idle_disabled() {
        let mut monitor = LivenessMonitor::new(settings(None));
        monitor.auth_completed();
        monitor.record_outbound();
        assert_eq!(monitor.expired().await, LivenessEvent::ReadIdle);
    }
}
