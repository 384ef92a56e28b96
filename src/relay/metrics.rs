// Relay-wide counters. Everything is Relaxed; these feed the periodic
// stats line and tests, nothing synchronizes through them.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct RelayMetrics {
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub chat_sends: AtomicU64,
    pub persist_failures: AtomicU64,
    pub local_deliveries: AtomicU64,
    pub remote_publishes: AtomicU64,
    pub stale_members_swept: AtomicU64,
    pub recipient_failures: AtomicU64,
    pub ai_published: AtomicU64,
    pub ai_dropped_absent: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub idle_disconnects: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            chat_sends: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            local_deliveries: AtomicU64::new(0),
            remote_publishes: AtomicU64::new(0),
            stale_members_swept: AtomicU64::new(0),
            recipient_failures: AtomicU64::new(0),
            ai_published: AtomicU64::new(0),
            ai_dropped_absent: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            idle_disconnects: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chat_sends: self.chat_sends.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            local_deliveries: self.local_deliveries.load(Ordering::Relaxed),
            remote_publishes: self.remote_publishes.load(Ordering::Relaxed),
            stale_members_swept: self.stale_members_swept.load(Ordering::Relaxed),
            recipient_failures: self.recipient_failures.load(Ordering::Relaxed),
            ai_published: self.ai_published.load(Ordering::Relaxed),
            ai_dropped_absent: self.ai_dropped_absent.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            idle_disconnects: self.idle_disconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub frames_in: u64,
    pub frames_dropped: u64,
    pub chat_sends: u64,
    pub persist_failures: u64,
    pub local_deliveries: u64,
    pub remote_publishes: u64,
    pub stale_members_swept: u64,
    pub recipient_failures: u64,
    pub ai_published: u64,
    pub ai_dropped_absent: u64,
    pub heartbeats_sent: u64,
    pub idle_disconnects: u64,
}

impl MetricsSnapshot {
    pub fn live_connections(&self) -> u64 {
        self.connections_opened
            .saturating_sub(self.connections_closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let metrics = RelayMetrics::new();
        metrics.frames_in.fetch_add(3, Ordering::Relaxed);
        metrics.local_deliveries.fetch_add(2, Ordering::Relaxed);
        let snap = metrics.snapshot();
        assert_eq!(snap.frames_in, 3);
        assert_eq!(snap.local_deliveries, 2);
        assert_eq!(snap.chat_sends, 0);
    }

    #[test]
    fn test_live_connections_never_underflows() {
        let metrics = RelayMetrics::new();
        metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(metrics.snapshot().live_connections(), 0);
    }
}
