//! Server metrics for observability

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Session metrics
    pub sessions_created: AtomicU64,
    pub sessions_exited: AtomicU64,
    /// Sessions ended by the reconnection thrash policy
    pub sessions_thrashed: AtomicU64,
    pub spawn_errors: AtomicU64,

    // Subscription metrics
    pub active_subscriptions: AtomicU64,
    pub total_subscriptions: AtomicU64,
    pub severed_subscriptions: AtomicU64,

    // Frame metrics
    pub frames_published: AtomicU64,
    /// Frames not queued to a lagging subscriber
    pub frames_dropped: AtomicU64,
    /// Lag recoveries served from the frame ring
    pub ring_replays: AtomicU64,
    /// Lag recoveries that needed a fresh snapshot
    pub snapshot_resyncs: AtomicU64,
    pub snapshots_served: AtomicU64,

    // Input metrics
    pub input_bytes: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_exited(&self) {
        self.sessions_exited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_thrashed(&self) {
        self.sessions_thrashed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spawn_error(&self) {
        self.spawn_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_opened(&self) {
        self.active_subscriptions.fetch_add(1, Ordering::Relaxed);
        self.total_subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_closed(&self) {
        self.active_subscriptions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn subscription_severed(&self) {
        self.severed_subscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_published(&self) {
        self.frames_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ring_replay(&self) {
        self.ring_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_resync(&self) {
        self.snapshot_resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_served(&self) {
        self.snapshots_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn input_written(&self, bytes: usize) {
        self.input_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            sessions: SessionMetrics {
                created: self.sessions_created.load(Ordering::Relaxed),
                exited: self.sessions_exited.load(Ordering::Relaxed),
                thrashed: self.sessions_thrashed.load(Ordering::Relaxed),
                spawn_errors: self.spawn_errors.load(Ordering::Relaxed),
            },
            subscriptions: SubscriptionMetrics {
                active: self.active_subscriptions.load(Ordering::Relaxed),
                total: self.total_subscriptions.load(Ordering::Relaxed),
                severed: self.severed_subscriptions.load(Ordering::Relaxed),
            },
            frames: FrameMetrics {
                published: self.frames_published.load(Ordering::Relaxed),
                dropped: self.frames_dropped.load(Ordering::Relaxed),
                ring_replays: self.ring_replays.load(Ordering::Relaxed),
                snapshot_resyncs: self.snapshot_resyncs.load(Ordering::Relaxed),
                snapshots_served: self.snapshots_served.load(Ordering::Relaxed),
            },
            input_bytes: self.input_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub sessions: SessionMetrics,
    pub subscriptions: SubscriptionMetrics,
    pub frames: FrameMetrics,
    pub input_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub created: u64,
    pub exited: u64,
    pub thrashed: u64,
    pub spawn_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionMetrics {
    pub active: u64,
    pub total: u64,
    pub severed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub published: u64,
    pub dropped: u64,
    pub ring_replays: u64,
    pub snapshot_resyncs: u64,
    pub snapshots_served: u64,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: SessionHealth,
    pub subscriptions: u64,
    pub multiplexer_available: bool,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHealth {
    pub total: u64,
    pub running: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_start_at_zero() {
        let m = ServerMetrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.sessions.created, 0);
        assert_eq!(snap.subscriptions.active, 0);
        assert_eq!(snap.frames.published, 0);
    }

    #[test]
    fn test_subscription_tracking() {
        let m = ServerMetrics::new();
        m.subscription_opened();
        m.subscription_opened();
        m.subscription_closed();
        m.subscription_severed();
        let snap = m.snapshot();
        assert_eq!(snap.subscriptions.active, 1);
        assert_eq!(snap.subscriptions.total, 2);
        assert_eq!(snap.subscriptions.severed, 1);
    }

    #[test]
    fn test_frame_tracking() {
        let m = ServerMetrics::new();
        m.frame_published();
        m.frame_dropped();
        m.ring_replay();
        m.snapshot_resync();
        m.input_written(12);
        let snap = m.snapshot();
        assert_eq!(snap.frames.published, 1);
        assert_eq!(snap.frames.dropped, 1);
        assert_eq!(snap.frames.ring_replays, 1);
        assert_eq!(snap.frames.snapshot_resyncs, 1);
        assert_eq!(snap.input_bytes, 12);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = ServerMetrics::new();
        m.session_created();
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["sessions"]["created"], 1);
        assert!(json["uptime_secs"].is_u64());
    }
}
