// Chat fan-out. One inbound SEND becomes: durable record, local
// deliveries for members on this instance, and one relay envelope per
// remote instance holding the rest.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use ahash::AHashMap;
use log::{debug, warn};

use super::broker::InboxTransport;
use super::collab::{MessageStore, UserDirectory};
use super::delivery::LocalSink;
use super::error::Result;
use super::metrics::RelayMetrics;
use super::payload::{CHAT_QUEUE_DESTINATION, ChatMessageRecord, ChatPayload, ChatSend, RelayEnvelope};
use super::store::{SharedStore, presence_key, room_members_key};

pub struct MessageRouter {
    store: Arc<dyn SharedStore>,
    users: Arc<dyn UserDirectory>,
    messages: Arc<dyn MessageStore>,
    broker: Arc<dyn InboxTransport>,
    sink: Arc<dyn LocalSink>,
    instance_id: String,
    metrics: Arc<RelayMetrics>,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn SharedStore>,
        users: Arc<dyn UserDirectory>,
        messages: Arc<dyn MessageStore>,
        broker: Arc<dyn InboxTransport>,
        sink: Arc<dyn LocalSink>,
        instance_id: impl Into<String>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            store,
            users,
            messages,
            broker,
            sink,
            instance_id: instance_id.into(),
            metrics,
        }
    }

    /// Persist and fan out one chat send. An `Err` here means nothing was
    /// delivered and the caller owes the sender an ERROR frame; fan-out
    /// trouble after the append never becomes an `Err`.
    pub async fn handle_chat_send(
        &self,
        sender_id: &str,
        send: ChatSend,
    ) -> Result<ChatMessageRecord> {
        self.metrics.chat_sends.fetch_add(1, Ordering::Relaxed);

        let sender_name = self.users.display_name(sender_id).await?;
        let content = send.content.unwrap_or_default();
        let record =
            ChatMessageRecord::new(&send.room_id, sender_id, &sender_name, &content, send.kind);

        let record = match self.messages.append(record).await {
            Ok(record) => record,
            Err(e) => {
                self.metrics.persist_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        self.fan_out(&record).await;
        Ok(record)
    }

    /// Best-effort delivery to everyone in the room's live membership set
    /// except the sender. Recipient trouble is logged and isolated.
    async fn fan_out(&self, record: &ChatMessageRecord) {
        let members = match self
            .store
            .set_members(&room_members_key(&record.room_id))
            .await
        {
            Ok(members) => members,
            Err(e) => {
                // Membership store down: the record is safe, delivery is
                // skipped rather than crashing dispatch.
                warn!(
                    "[relay-router] membership lookup failed for {}: {e}",
                    record.room_id
                );
                return;
            }
        };

        let payload = ChatPayload::from_record(record);
        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("[relay-router] payload encode failed: {e}");
                return;
            }
        };

        let mut per_instance: AHashMap<String, Vec<String>> = AHashMap::new();
        for member in members {
            if member == record.sender_id {
                continue;
            }
            match self.store.get(&presence_key(&member)).await {
                Err(e) => {
                    self.metrics.recipient_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("[relay-router] presence lookup failed for {member}: {e}");
                }
                Ok(None) => self.sweep_stale_member(&record.room_id, &member).await,
                Ok(Some(instance)) if instance == self.instance_id => {
                    self.sink.deliver(&member, CHAT_QUEUE_DESTINATION, &body);
                    self.metrics.local_deliveries.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Some(instance)) => per_instance.entry(instance).or_default().push(member),
            }
        }

        for (instance, user_ids) in per_instance {
            let envelope = RelayEnvelope::Chat {
                user_ids,
                chat: payload.clone(),
            };
            match self.broker.publish(&instance, &envelope).await {
                Ok(()) => {
                    self.metrics.remote_publishes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.metrics.recipient_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("[relay-router] publish to {instance} failed: {e}");
                }
            }
        }
    }

    /// A member with no presence entry left without a DISCONNECT reaching
    /// us. Drop them from the live set so the next send skips the lookup.
    async fn sweep_stale_member(&self, room_id: &str, member: &str) {
        if let Err(e) = self.store.delete(&presence_key(member)).await {
            debug!("[relay-router] stale presence delete failed for {member}: {e}");
        }
        match self
            .store
            .set_remove(&room_members_key(room_id), member)
            .await
        {
            Ok(()) => {
                self.metrics
                    .stale_members_swept
                    .fetch_add(1, Ordering::Relaxed);
                debug!("[relay-router] swept {member} out of {room_id}");
            }
            Err(e) => debug!("[relay-router] stale sweep failed for {member}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::broker::MemoryBroker;
    use crate::relay::collab::{MemoryDirectory, MemoryMessageStore};
    use crate::relay::delivery::CollectSink;
    use crate::relay::error::RelayError;
    use crate::relay::payload::MessageKind;
    use crate::relay::store::{MemoryStore, PRESENCE_TTL};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        messages: Arc<MemoryMessageStore>,
        broker: Arc<MemoryBroker>,
        sink: Arc<CollectSink>,
        metrics: Arc<RelayMetrics>,
        router: MessageRouter,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let dir = Arc::new(MemoryDirectory::new());
        dir.add_user("alice", "Alice");
        dir.add_user("bob", "Bob");
        dir.add_user("carol", "Carol");
        dir.add_user("dave", "Dave");
        let messages = Arc::new(MemoryMessageStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let sink = Arc::new(CollectSink::new());
        let metrics = Arc::new(RelayMetrics::new());
        let router = MessageRouter::new(
            store.clone(),
            dir,
            messages.clone(),
            broker.clone(),
            sink.clone(),
            "i1",
            metrics.clone(),
        );
        Fixture {
            store,
            messages,
            broker,
            sink,
            metrics,
            router,
        }
    }

    async fn join(fx: &Fixture, user: &str, instance: &str, room: &str) {
        fx.store
            .set_with_expiry(&presence_key(user), instance, PRESENCE_TTL)
            .await
            .unwrap();
        fx.store
            .set_add(&room_members_key(room), user)
            .await
            .unwrap();
    }

    fn chat(room: &str, content: &str) -> ChatSend {
        ChatSend {
            kind: MessageKind::Chat,
            room_id: room.to_string(),
            content: Some(content.to_string()),
        }
    }

    #[tokio::test]
    async fn test_send_persists_and_splits_local_remote() {
        let fx = fixture();
        join(&fx, "alice", "i1", "r1").await;
        join(&fx, "bob", "i1", "r1").await;
        join(&fx, "carol", "i2", "r1").await;
        let mut inbox = fx.broker.declare_inbox("i2").await.unwrap().unwrap();

        let record = fx
            .router
            .handle_chat_send("alice", chat("r1", "hi"))
            .await
            .unwrap();
        assert_eq!(record.sender_name, "Alice");
        assert_eq!(fx.messages.page("r1", 0).await.unwrap(), vec![record.clone()]);

        // Bob is local: straight to his queue.
        let local = fx.sink.for_user("bob");
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].0, CHAT_QUEUE_DESTINATION);
        let body: serde_json::Value = serde_json::from_str(&local[0].1).unwrap();
        assert_eq!(body["content"], "hi");
        assert_eq!(body["roomId"], "r1");
        assert_eq!(body["senderId"], "alice");

        // Carol is remote: one envelope routed to i2.
        match inbox.try_recv().unwrap() {
            RelayEnvelope::Chat { user_ids, chat } => {
                assert_eq!(user_ids, vec!["carol"]);
                assert_eq!(chat.content.as_deref(), Some("hi"));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }

        // The sender never hears their own message back.
        assert!(fx.sink.for_user("alice").is_empty());
        assert_eq!(fx.metrics.snapshot().local_deliveries, 1);
        assert_eq!(fx.metrics.snapshot().remote_publishes, 1);
    }

    #[tokio::test]
    async fn test_remote_members_grouped_into_one_envelope() {
        let fx = fixture();
        join(&fx, "alice", "i1", "r1").await;
        join(&fx, "carol", "i2", "r1").await;
        join(&fx, "dave", "i2", "r1").await;
        let mut inbox = fx.broker.declare_inbox("i2").await.unwrap().unwrap();

        fx.router
            .handle_chat_send("alice", chat("r1", "hi"))
            .await
            .unwrap();

        match inbox.try_recv().unwrap() {
            RelayEnvelope::Chat { mut user_ids, .. } => {
                user_ids.sort();
                assert_eq!(user_ids, vec!["carol", "dave"]);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
        assert!(inbox.try_recv().is_err());
        assert_eq!(fx.metrics.snapshot().remote_publishes, 1);
    }

    #[tokio::test]
    async fn test_empty_room_send_still_recorded() {
        let fx = fixture();
        fx.router
            .handle_chat_send("alice", chat("lonely", "anyone?"))
            .await
            .unwrap();

        let page = fx.messages.page("lonely", 0).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].message, "anyone?");
        assert_eq!(fx.sink.total(), 0);
    }

    struct FailingMessageStore;

    #[async_trait]
    impl MessageStore for FailingMessageStore {
        async fn append(&self, _: ChatMessageRecord) -> crate::relay::error::Result<ChatMessageRecord> {
            Err(RelayError::Persist("db down".into()))
        }
        async fn page(
            &self,
            _: &str,
            _: usize,
        ) -> crate::relay::error::Result<Vec<ChatMessageRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_persist_failure_aborts_before_any_delivery() {
        let fx = fixture();
        join(&fx, "alice", "i1", "r1").await;
        join(&fx, "bob", "i1", "r1").await;
        let dir = Arc::new(MemoryDirectory::new());
        dir.add_user("alice", "Alice");
        let router = MessageRouter::new(
            fx.store.clone(),
            dir,
            Arc::new(FailingMessageStore),
            fx.broker.clone(),
            fx.sink.clone(),
            "i1",
            fx.metrics.clone(),
        );

        let err = router
            .handle_chat_send("alice", chat("r1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Persist(_)));
        assert_eq!(fx.sink.total(), 0);
        assert_eq!(fx.metrics.snapshot().persist_failures, 1);
    }

    #[tokio::test]
    async fn test_unknown_sender_aborts_without_persisting() {
        let fx = fixture();
        let err = fx
            .router
            .handle_chat_send("ghost", chat("r1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Collaborator(_)));
        assert!(fx.messages.page("r1", 0).await.unwrap().is_empty());
    }

    /// Delegates everything to a real store but fails membership reads.
    struct MembershipDown(MemoryStore);

    #[async_trait]
    impl SharedStore for MembershipDown {
        async fn set_with_expiry(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> crate::relay::error::Result<()> {
            self.0.set_with_expiry(key, value, ttl).await
        }
        async fn get(&self, key: &str) -> crate::relay::error::Result<Option<String>> {
            self.0.get(key).await
        }
        async fn delete(&self, key: &str) -> crate::relay::error::Result<()> {
            self.0.delete(key).await
        }
        async fn set_add(&self, key: &str, member: &str) -> crate::relay::error::Result<()> {
            self.0.set_add(key, member).await
        }
        async fn set_remove(&self, key: &str, member: &str) -> crate::relay::error::Result<()> {
            self.0.set_remove(key, member).await
        }
        async fn set_members(&self, _: &str) -> crate::relay::error::Result<Vec<String>> {
            Err(RelayError::Store("membership down".into()))
        }
    }

    #[tokio::test]
    async fn test_membership_outage_fails_open() {
        let fx = fixture();
        let dir = Arc::new(MemoryDirectory::new());
        dir.add_user("alice", "Alice");
        let router = MessageRouter::new(
            Arc::new(MembershipDown(MemoryStore::new())),
            dir,
            fx.messages.clone(),
            fx.broker.clone(),
            fx.sink.clone(),
            "i1",
            fx.metrics.clone(),
        );

        // Send succeeds and is recorded; delivery is simply skipped.
        router
            .handle_chat_send("alice", chat("r1", "hi"))
            .await
            .unwrap();
        assert_eq!(fx.messages.page("r1", 0).await.unwrap().len(), 1);
        assert_eq!(fx.sink.total(), 0);
    }

    #[tokio::test]
    async fn test_member_without_presence_is_swept() {
        let fx = fixture();
        join(&fx, "alice", "i1", "r1").await;
        // Bob sits in the live set with no presence entry.
        fx.store.set_add(&room_members_key("r1"), "bob").await.unwrap();

        fx.router
            .handle_chat_send("alice", chat("r1", "hi"))
            .await
            .unwrap();

        assert!(fx.sink.for_user("bob").is_empty());
        assert_eq!(
            fx.store.set_members(&room_members_key("r1")).await.unwrap(),
            vec!["alice"]
        );
        assert_eq!(fx.metrics.snapshot().stale_members_swept, 1);
    }

    #[tokio::test]
    async fn test_recipient_order_matches_persisted_order() {
        let fx = fixture();
        join(&fx, "alice", "i1", "r1").await;
        join(&fx, "bob", "i1", "r1").await;

        for n in 0..5 {
            fx.router
                .handle_chat_send("alice", chat("r1", &format!("m{n}")))
                .await
                .unwrap();
        }

        let contents: Vec<String> = fx
            .sink
            .for_user("bob")
            .iter()
            .map(|(_, body)| {
                let v: serde_json::Value = serde_json::from_str(body).unwrap();
                v["content"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);

        let persisted: Vec<String> = fx
            .messages
            .page("r1", 0)
            .await
            .unwrap()
            .iter()
            .map(|r| r.message.clone())
            .collect();
        assert_eq!(contents, persisted);
    }

    #[tokio::test]
    async fn test_join_without_content_persists_empty_message() {
        let fx = fixture();
        let send = ChatSend {
            kind: MessageKind::Join,
            room_id: "r1".to_string(),
            content: None,
        };
        let record = fx.router.handle_chat_send("alice", send).await.unwrap();
        assert_eq!(record.kind, MessageKind::Join);
        assert_eq!(record.message, "");
    }
}
