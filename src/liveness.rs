//! Link liveness: heartbeats on send-idle, dead link on receive-idle.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Nothing was sent for a heartbeat interval.
    SendHeartbeat,
    /// Nothing was received for the idle timeout. Reported once per link.
    Dead,
}

/// Deadline bookkeeping for one connection. The caller sleeps until
/// [`next_deadline`](Self::next_deadline) and then calls [`poll`](Self::poll).
#[derive(Debug)]
pub struct LivenessMonitor {
    heartbeat_interval: Duration,
    idle_timeout: Duration,
    last_sent: Instant,
    last_received: Instant,
    awaiting_response: bool,
    dead: bool,
}

impl LivenessMonitor {
    pub fn new(heartbeat_interval: Duration, idle_timeout: Duration, now: Instant) -> Self {
        Self {
            heartbeat_interval,
            idle_timeout,
            last_sent: now,
            last_received: now,
            awaiting_response: false,
            dead: false,
        }
    }

    pub fn on_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Records a heartbeat going out; the next read answers it.
    pub fn on_heartbeat_sent(&mut self, now: Instant) {
        self.last_sent = now;
        self.awaiting_response = true;
    }

    pub fn on_received(&mut self, now: Instant) {
        self.last_received = now;
        self.awaiting_response = false;
    }

    pub fn is_awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    pub fn next_deadline(&self) -> Instant {
        let dead_at = self.last_received + self.idle_timeout;
        if self.awaiting_response || self.dead {
            dead_at
        } else {
            dead_at.min(self.last_sent + self.heartbeat_interval)
        }
    }

    pub fn poll(&mut self, now: Instant) -> Option<LivenessEvent> {
        if self.dead {
            return None;
        }
        if now >= self.last_received + self.idle_timeout {
            self.dead = true;
            return Some(LivenessEvent::Dead);
        }
        if !self.awaiting_response && now >= self.last_sent + self.heartbeat_interval {
            return Some(LivenessEvent::SendHeartbeat);
        }
        None
    }
}
