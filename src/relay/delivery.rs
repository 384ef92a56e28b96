// Last-hop delivery on the owning instance: a payload addressed to a user
// becomes a MESSAGE frame on each of that user's subscribed sessions.
//
// The router and the inbox consumer both end here, so the hop is a small
// trait. The server's connection registry is the real implementation; a
// collecting fake backs unit tests.

use dashmap::DashMap;

/// Sink for payloads that have reached their final instance.
pub trait LocalSink: Send + Sync {
    /// Deliver a JSON body to one user at one destination. Must not block:
    /// implementations hand off to per-connection writer queues.
    fn deliver(&self, user_id: &str, destination: &str, body: &str);
}

/// Test sink recording every delivery in order.
#[derive(Debug, Default)]
pub struct CollectSink {
    deliveries: DashMap<String, Vec<(String, String)>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// (destination, body) pairs delivered to the user, oldest first.
    pub fn for_user(&self, user_id: &str) -> Vec<(String, String)> {
        self.deliveries
            .get(user_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.deliveries.iter().map(|e| e.value().len()).sum()
    }
}

impl LocalSink for CollectSink {
    fn deliver(&self, user_id: &str, destination: &str, body: &str) {
        self.deliveries
            .entry(user_id.to_string())
            .or_default()
            .push((destination.to_string(), body.to_string()));
    }
}
