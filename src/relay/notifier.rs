// Cross-instance notification path: AI completion events published toward
// whichever instance owns the target user, plus this instance's inbox
// consumer, which turns arriving envelopes back into local deliveries.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use super::broker::InboxTransport;
use super::delivery::LocalSink;
use super::error::Result;
use super::metrics::RelayMetrics;
use super::payload::{
    AI_COMPLETION_TEXT, AiNotification, CHAT_QUEUE_DESTINATION, RelayEnvelope,
    ai_response_destination,
};
use super::store::{SharedStore, presence_key};

/// Where a notification ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Published { instance_id: String },
    /// No presence entry: the user is offline everywhere, the event is
    /// dropped without error. The durable result lives upstream.
    DroppedAbsent,
}

pub struct CrossInstanceNotifier {
    store: Arc<dyn SharedStore>,
    broker: Arc<dyn InboxTransport>,
    instance_id: String,
    metrics: Arc<RelayMetrics>,
}

impl CrossInstanceNotifier {
    pub fn new(
        store: Arc<dyn SharedStore>,
        broker: Arc<dyn InboxTransport>,
        instance_id: impl Into<String>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            store,
            broker,
            instance_id: instance_id.into(),
            metrics,
        }
    }

    /// Route one AI completion event to the instance holding the user's
    /// connection. Callers treat `DroppedAbsent` as success.
    pub async fn notify_user(&self, user_id: &str, result_id: &str) -> Result<NotifyOutcome> {
        let Some(instance_id) = self.store.get(&presence_key(user_id)).await? else {
            self.metrics.ai_dropped_absent.fetch_add(1, Ordering::Relaxed);
            debug!("[relay-inbox] {user_id} offline, dropping ai result {result_id}");
            return Ok(NotifyOutcome::DroppedAbsent);
        };

        let envelope = RelayEnvelope::Ai {
            user_id: user_id.to_string(),
            result_id: result_id.to_string(),
            message: AI_COMPLETION_TEXT.to_string(),
        };
        self.broker.publish(&instance_id, &envelope).await?;
        self.metrics.ai_published.fetch_add(1, Ordering::Relaxed);
        Ok(NotifyOutcome::Published { instance_id })
    }

    /// Declare this instance's inbox and start the consumer task. Safe to
    /// call again: later calls find the inbox already consuming and return
    /// `false` without touching it.
    pub async fn ensure_started(
        &self,
        sink: Arc<dyn LocalSink>,
        shutdown: CancellationToken,
    ) -> Result<bool> {
        let Some(mut inbox) = self.broker.declare_inbox(&self.instance_id).await? else {
            debug!(
                "[relay-inbox] consumer already running for {}",
                self.instance_id
            );
            return Ok(false);
        };

        let metrics = self.metrics.clone();
        let instance_id = self.instance_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = inbox.recv() => match received {
                        Some(envelope) => dispatch_envelope(sink.as_ref(), envelope, &metrics),
                        None => break,
                    },
                }
            }
            debug!("[relay-inbox] consumer for {instance_id} stopped");
        });
        Ok(true)
    }
}

/// Turn one inbox envelope into local deliveries.
fn dispatch_envelope(sink: &dyn LocalSink, envelope: RelayEnvelope, metrics: &RelayMetrics) {
    match envelope {
        RelayEnvelope::Chat { user_ids, chat } => match serde_json::to_string(&chat) {
            Ok(body) => {
                for user_id in user_ids {
                    sink.deliver(&user_id, CHAT_QUEUE_DESTINATION, &body);
                    metrics.local_deliveries.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => warn!("[relay-inbox] chat payload encode failed: {e}"),
        },
        RelayEnvelope::Ai {
            user_id,
            result_id,
            message,
        } => {
            let note = AiNotification {
                user_id: user_id.clone(),
                result_id,
                message,
            };
            match serde_json::to_string(&note) {
                Ok(body) => {
                    sink.deliver(&user_id, &ai_response_destination(&user_id), &body);
                    metrics.local_deliveries.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("[relay-inbox] ai payload encode failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::broker::MemoryBroker;
    use crate::relay::delivery::CollectSink;
    use crate::relay::payload::{ChatPayload, MessageKind};
    use crate::relay::store::MemoryStore;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        broker: Arc<MemoryBroker>,
        sink: Arc<CollectSink>,
        metrics: Arc<RelayMetrics>,
        notifier: CrossInstanceNotifier,
        shutdown: CancellationToken,
    }

    fn fixture(instance_id: &str) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let sink = Arc::new(CollectSink::new());
        let metrics = Arc::new(RelayMetrics::new());
        let notifier =
            CrossInstanceNotifier::new(store.clone(), broker.clone(), instance_id, metrics.clone());
        Fixture {
            store,
            broker,
            sink,
            metrics,
            notifier,
            shutdown: CancellationToken::new(),
        }
    }

    async fn wait_until(mut ready: impl FnMut() -> bool) {
        for _ in 0..200 {
            if ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[tokio::test]
    async fn test_notify_reaches_user_through_owning_inbox() {
        let fx = fixture("i1");
        assert!(
            fx.notifier
                .ensure_started(fx.sink.clone(), fx.shutdown.clone())
                .await
                .unwrap()
        );
        fx.store
            .set_with_expiry(&presence_key("alice"), "i1", Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = fx.notifier.notify_user("alice", "42").await.unwrap();
        assert_eq!(
            outcome,
            NotifyOutcome::Published {
                instance_id: "i1".to_string()
            }
        );

        wait_until(|| fx.sink.total() == 1).await;
        let deliveries = fx.sink.for_user("alice");
        assert_eq!(deliveries[0].0, "/topic/ai-response.alice");
        let body: serde_json::Value = serde_json::from_str(&deliveries[0].1).unwrap();
        assert_eq!(body["userId"], "alice");
        assert_eq!(body["resultId"], "42");
        assert_eq!(body["message"], AI_COMPLETION_TEXT);
    }

    #[tokio::test]
    async fn test_notify_without_presence_is_silent() {
        let fx = fixture("i1");
        fx.notifier
            .ensure_started(fx.sink.clone(), fx.shutdown.clone())
            .await
            .unwrap();

        let outcome = fx.notifier.notify_user("ghost", "42").await.unwrap();
        assert_eq!(outcome, NotifyOutcome::DroppedAbsent);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.sink.total(), 0);
        assert_eq!(fx.metrics.snapshot().ai_dropped_absent, 1);
    }

    #[tokio::test]
    async fn test_notify_after_expiry_is_silent() {
        let fx = fixture("i1");
        fx.store
            .set_with_expiry(&presence_key("alice"), "i1", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let outcome = fx.notifier.notify_user("alice", "42").await.unwrap();
        assert_eq!(outcome, NotifyOutcome::DroppedAbsent);
    }

    #[tokio::test]
    async fn test_second_start_keeps_single_consumer() {
        let fx = fixture("i1");
        assert!(
            fx.notifier
                .ensure_started(fx.sink.clone(), fx.shutdown.clone())
                .await
                .unwrap()
        );
        assert!(
            !fx.notifier
                .ensure_started(fx.sink.clone(), fx.shutdown.clone())
                .await
                .unwrap()
        );

        fx.store
            .set_with_expiry(&presence_key("alice"), "i1", Duration::from_secs(60))
            .await
            .unwrap();
        fx.notifier.notify_user("alice", "42").await.unwrap();

        wait_until(|| fx.sink.total() >= 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.sink.total(), 1);
    }

    #[tokio::test]
    async fn test_chat_envelope_fans_out_per_user() {
        let fx = fixture("i1");
        fx.notifier
            .ensure_started(fx.sink.clone(), fx.shutdown.clone())
            .await
            .unwrap();

        let chat = ChatPayload {
            kind: MessageKind::Chat,
            room_id: Some("r1".into()),
            sender_id: Some("alice".into()),
            sender_name: Some("Alice".into()),
            content: Some("hi".into()),
            timestamp: None,
        };
        fx.broker
            .publish(
                "i1",
                &RelayEnvelope::Chat {
                    user_ids: vec!["bob".into(), "carol".into()],
                    chat,
                },
            )
            .await
            .unwrap();

        wait_until(|| fx.sink.total() == 2).await;
        for user in ["bob", "carol"] {
            let deliveries = fx.sink.for_user(user);
            assert_eq!(deliveries.len(), 1);
            assert_eq!(deliveries[0].0, CHAT_QUEUE_DESTINATION);
            let body: serde_json::Value = serde_json::from_str(&deliveries[0].1).unwrap();
            assert_eq!(body["content"], "hi");
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_consumer() {
        let fx = fixture("i1");
        fx.notifier
            .ensure_started(fx.sink.clone(), fx.shutdown.clone())
            .await
            .unwrap();
        fx.shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        fx.store
            .set_with_expiry(&presence_key("alice"), "i1", Duration::from_secs(60))
            .await
            .unwrap();
        // Publish succeeds (the inbox channel still exists) but nothing
        // consumes it any more.
        fx.notifier.notify_user("alice", "42").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.sink.total(), 0);
    }
}
