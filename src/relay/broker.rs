// Inter-instance transport: the shared exchange with one inbox per
// running instance, routing key = instance id.
//
// Two implementations. `MemoryBroker` wires instances together inside one
// process for tests and single-node runs. `RedisBroker` maps the topology
// onto Redis pub/sub: declaring the inbox subscribes the instance channel,
// publishing PUBLISHes to the target instance's channel. Publishes are
// pipelined and retried; what still fails lands in a bounded dead-letter
// queue that is replayed after the next successful reconnect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use super::error::{RelayError, Result};
use super::payload::RelayEnvelope;
use super::reliability::{CircuitBreaker, ExponentialBackoff};

/// Channel carrying one instance's inbox traffic.
pub fn inbox_channel(instance_id: &str) -> String {
    format!("relay:inbox:{instance_id}")
}

/// Exchange abstraction the router and notifier publish through.
#[async_trait]
pub trait InboxTransport: Send + Sync {
    /// Publish an envelope routed to the given instance. Unroutable
    /// envelopes (no such inbox) are dropped, as on any topic exchange.
    async fn publish(&self, instance_id: &str, envelope: &RelayEnvelope) -> Result<()>;

    /// Declare this instance's inbox and start consuming. Idempotent: the
    /// first call returns the consumer stream, later calls return `None`
    /// and leave the existing consumer untouched.
    async fn declare_inbox(
        &self,
        instance_id: &str,
    ) -> Result<Option<mpsc::UnboundedReceiver<RelayEnvelope>>>;

    fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// In-process broker
// ---------------------------------------------------------------------------

/// Loopback exchange. Every instance sharing this value can reach every
/// other; used by tests to run multiple relay nodes in one process.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    inboxes: DashMap<String, mpsc::UnboundedSender<RelayEnvelope>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboxTransport for MemoryBroker {
    async fn publish(&self, instance_id: &str, envelope: &RelayEnvelope) -> Result<()> {
        if let Some(tx) = self.inboxes.get(instance_id) {
            let _ = tx.send(envelope.clone());
        }
        Ok(())
    }

    async fn declare_inbox(
        &self,
        instance_id: &str,
    ) -> Result<Option<mpsc::UnboundedReceiver<RelayEnvelope>>> {
        use dashmap::mapref::entry::Entry;
        match self.inboxes.entry(instance_id.to_string()) {
            Entry::Occupied(entry) if !entry.get().is_closed() => Ok(None),
            Entry::Occupied(mut entry) => {
                let (tx, rx) = mpsc::unbounded_channel();
                entry.insert(tx);
                Ok(Some(rx))
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::unbounded_channel();
                entry.insert(tx);
                Ok(Some(rx))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct BrokerMetrics {
    pub published: AtomicU64,
    pub publish_errors: AtomicU64,
    pub received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub connected: AtomicBool,
}

// ---------------------------------------------------------------------------
// Dead-letter queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DeadLetter {
    pub channel: String,
    pub payload: String,
    pub error: String,
}

/// Bounded queue of publishes that failed their retries. Oldest entries
/// are evicted first when full.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: VecDeque<DeadLetter>,
    max_entries: usize,
}

impl DeadLetterQueue {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
        }
    }

    fn push(&mut self, entry: DeadLetter) {
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain_all(&mut self) -> Vec<DeadLetter> {
        self.entries.drain(..).collect()
    }
}

// ---------------------------------------------------------------------------
// Redis broker
// ---------------------------------------------------------------------------

const DLQ_MAX_ENTRIES: usize = 1024;
const MAX_PIPELINE_SIZE: usize = 64;
const PUBLISH_MAX_ATTEMPTS: usize = 3;
const PUBLISH_RETRY_DELAYS: &[Duration] = &[Duration::from_millis(100), Duration::from_millis(200)];

enum BrokerCommand {
    Publish { channel: String, payload: String },
    Shutdown,
}

pub struct RedisBroker {
    url: String,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<BrokerCommand>>>,
    metrics: Arc<BrokerMetrics>,
    dlq: Arc<Mutex<DeadLetterQueue>>,
}

impl RedisBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cmd_tx: Mutex::new(None),
            metrics: Arc::new(BrokerMetrics::default()),
            dlq: Arc::new(Mutex::new(DeadLetterQueue::new(DLQ_MAX_ENTRIES))),
        }
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        self.metrics.clone()
    }

    pub fn dead_letters(&self) -> usize {
        self.dlq.lock().unwrap().len()
    }
}

#[async_trait]
impl InboxTransport for RedisBroker {
    async fn publish(&self, instance_id: &str, envelope: &RelayEnvelope) -> Result<()> {
        let tx = self
            .cmd_tx
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or_else(|| RelayError::Broker("inbox not declared yet".into()))?;
        let payload = serde_json::to_string(envelope)?;
        tx.send(BrokerCommand::Publish {
            channel: inbox_channel(instance_id),
            payload,
        })
        .map_err(|_| RelayError::Broker("broker task stopped".into()))
    }

    async fn declare_inbox(
        &self,
        instance_id: &str,
    ) -> Result<Option<mpsc::UnboundedReceiver<RelayEnvelope>>> {
        let mut guard = self.cmd_tx.lock().unwrap();
        if guard.is_some() {
            return Ok(None);
        }
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        *guard = Some(cmd_tx);
        drop(guard);

        tokio::spawn(listener_task(
            self.url.clone(),
            inbox_channel(instance_id),
            cmd_rx,
            in_tx,
            self.metrics.clone(),
            self.dlq.clone(),
        ));
        Ok(Some(in_rx))
    }

    fn shutdown(&self) {
        if let Some(tx) = self.cmd_tx.lock().unwrap().as_ref() {
            let _ = tx.send(BrokerCommand::Shutdown);
        }
    }
}

// ---------------------------------------------------------------------------
// PUBLISH with pipelining + retry
// ---------------------------------------------------------------------------

async fn publish_pipeline(
    pub_conn: &mut redis::aio::MultiplexedConnection,
    batch: &[(String, String)],
    metrics: &BrokerMetrics,
    dlq: &Mutex<DeadLetterQueue>,
) -> bool {
    let mut last_err = String::new();
    let count = batch.len() as u64;

    for attempt in 0..PUBLISH_MAX_ATTEMPTS {
        let mut pipe = redis::pipe();
        for (channel, payload) in batch {
            pipe.cmd("PUBLISH").arg(channel).arg(payload).ignore();
        }
        match pipe.query_async::<()>(pub_conn).await {
            Ok(()) => {
                metrics.published.fetch_add(count, Ordering::Relaxed);
                return true;
            }
            Err(e) => {
                last_err = e.to_string();
                if let Some(delay) = PUBLISH_RETRY_DELAYS.get(attempt) {
                    tokio::time::sleep(*delay).await;
                }
            }
        }
    }

    metrics.publish_errors.fetch_add(count, Ordering::Relaxed);
    error!("[relay-redis] pipeline publish failed after retries ({count} msgs): {last_err}");
    let mut guard = dlq.lock().unwrap();
    for (channel, payload) in batch {
        guard.push(DeadLetter {
            channel: channel.clone(),
            payload: payload.clone(),
            error: last_err.clone(),
        });
    }
    false
}

// ---------------------------------------------------------------------------
// Inner connection loop
// ---------------------------------------------------------------------------

enum RunOutcome {
    Shutdown,
    Error(String),
}

/// How a connection attempt ended: never established, or lost after
/// running. The reconnect loop treats the two differently.
enum RunError {
    Connect(String),
    Stream(String),
}

impl RunError {
    fn message(&self) -> &str {
        match self {
            Self::Connect(msg) | Self::Stream(msg) => msg,
        }
    }
}

async fn connect_and_run(
    url: &str,
    channel: &str,
    cmd_rx: &mut mpsc::UnboundedReceiver<BrokerCommand>,
    in_tx: &mpsc::UnboundedSender<RelayEnvelope>,
    metrics: &Arc<BrokerMetrics>,
    dlq: &Mutex<DeadLetterQueue>,
) -> std::result::Result<(), RunError> {
    let client =
        redis::Client::open(url).map_err(|e| RunError::Connect(format!("open client: {e}")))?;

    let mut pub_conn = client
        .get_multiplexed_tokio_connection()
        .await
        .map_err(|e| RunError::Connect(format!("publish connection: {e}")))?;

    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| RunError::Connect(format!("pubsub connection: {e}")))?;

    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| RunError::Connect(format!("subscribe {channel}: {e}")))?;

    metrics.connected.store(true, Ordering::Relaxed);
    info!("[relay-redis] connected, consuming {channel}");

    // Replay anything parked while disconnected.
    let parked: Vec<DeadLetter> = dlq.lock().unwrap().drain_all();
    if !parked.is_empty() {
        info!("[relay-redis] replaying {} dead-lettered publishes", parked.len());
        for chunk in parked.chunks(MAX_PIPELINE_SIZE) {
            let batch: Vec<(String, String)> = chunk
                .iter()
                .map(|d| (d.channel.clone(), d.payload.clone()))
                .collect();
            publish_pipeline(&mut pub_conn, &batch, metrics, dlq).await;
        }
    }

    // --- Publish side: batch commands, pipeline to Redis ---
    let pub_task = async {
        let mut breaker = CircuitBreaker::new();
        let mut batch: Vec<(String, String)> = Vec::with_capacity(MAX_PIPELINE_SIZE);

        loop {
            match cmd_rx.recv().await {
                Some(BrokerCommand::Publish { channel, payload }) => {
                    batch.push((channel, payload));
                }
                Some(BrokerCommand::Shutdown) | None => return RunOutcome::Shutdown,
            }
            while batch.len() < MAX_PIPELINE_SIZE {
                match cmd_rx.try_recv() {
                    Ok(BrokerCommand::Publish { channel, payload }) => {
                        batch.push((channel, payload));
                    }
                    Ok(BrokerCommand::Shutdown) => return RunOutcome::Shutdown,
                    Err(_) => break,
                }
            }

            if breaker.can_execute() {
                if publish_pipeline(&mut pub_conn, &batch, metrics, dlq).await {
                    breaker.record_success();
                } else {
                    breaker.record_failure();
                }
            } else {
                metrics
                    .publish_errors
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                let mut guard = dlq.lock().unwrap();
                for (channel, payload) in &batch {
                    guard.push(DeadLetter {
                        channel: channel.clone(),
                        payload: payload.clone(),
                        error: "circuit breaker open".to_string(),
                    });
                }
            }
            batch.clear();
        }
    };

    // --- Subscribe side: decode envelopes into the consumer stream ---
    let msg_stream = pubsub.into_on_message();
    tokio::pin!(msg_stream);

    let sub_task = async {
        loop {
            match msg_stream.next().await {
                Some(msg) => {
                    metrics.received.fetch_add(1, Ordering::Relaxed);
                    let Ok(payload) = msg.get_payload::<String>() else {
                        metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    match serde_json::from_str::<RelayEnvelope>(&payload) {
                        Ok(envelope) => {
                            if in_tx.send(envelope).is_err() {
                                // Consumer gone: the node is shutting down.
                                return RunOutcome::Shutdown;
                            }
                        }
                        Err(e) => {
                            metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                            warn!("[relay-redis] dropping undecodable inbox payload: {e}");
                        }
                    }
                }
                None => return RunOutcome::Error("message stream ended".to_string()),
            }
        }
    };

    let outcome = tokio::select! {
        result = pub_task => result,
        result = sub_task => result,
    };

    metrics.connected.store(false, Ordering::Relaxed);
    match outcome {
        RunOutcome::Shutdown => {
            info!("[relay-redis] shutting down");
            Ok(())
        }
        RunOutcome::Error(e) => Err(RunError::Stream(e)),
    }
}

// ---------------------------------------------------------------------------
// Outer reconnection loop
// ---------------------------------------------------------------------------

async fn listener_task(
    url: String,
    channel: String,
    mut cmd_rx: mpsc::UnboundedReceiver<BrokerCommand>,
    in_tx: mpsc::UnboundedSender<RelayEnvelope>,
    metrics: Arc<BrokerMetrics>,
    dlq: Arc<Mutex<DeadLetterQueue>>,
) {
    let mut backoff = ExponentialBackoff::new();
    let mut conn_breaker = CircuitBreaker::new();

    loop {
        if !conn_breaker.can_execute() {
            debug!(
                "[relay-redis] circuit open, waiting {:.0}s",
                conn_breaker.reset_timeout.as_secs_f64()
            );
            let delay = conn_breaker.reset_timeout;
            if drain_during_backoff(&mut cmd_rx, delay, &metrics, &dlq).await {
                return;
            }
            continue;
        }

        match connect_and_run(&url, &channel, &mut cmd_rx, &in_tx, &metrics, &dlq).await {
            Ok(()) => return,
            Err(e) => {
                // A stream loss means we held a working connection, so the
                // breaker and backoff start over for the next attempt.
                match e {
                    RunError::Stream(_) => {
                        backoff.reset();
                        conn_breaker.record_success();
                    }
                    RunError::Connect(_) => conn_breaker.record_failure(),
                }
                metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                let delay = backoff.next_delay();
                warn!(
                    "[relay-redis] connection lost: {}; reconnecting in {:.1}s",
                    e.message(),
                    delay.as_secs_f64()
                );
                if drain_during_backoff(&mut cmd_rx, delay, &metrics, &dlq).await {
                    return;
                }
            }
        }
    }
}

/// Park publishes in the DLQ while waiting out a reconnect delay.
/// Returns true when a shutdown arrived during the wait.
async fn drain_during_backoff(
    cmd_rx: &mut mpsc::UnboundedReceiver<BrokerCommand>,
    delay: Duration,
    metrics: &BrokerMetrics,
    dlq: &Mutex<DeadLetterQueue>,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(BrokerCommand::Shutdown) | None => {
                    metrics.connected.store(false, Ordering::Relaxed);
                    info!("[relay-redis] shutting down during backoff");
                    return true;
                }
                Some(BrokerCommand::Publish { channel, payload }) => {
                    metrics.publish_errors.fetch_add(1, Ordering::Relaxed);
                    dlq.lock().unwrap().push(DeadLetter {
                        channel,
                        payload,
                        error: "redis disconnected".to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::payload::{AI_COMPLETION_TEXT, ChatMessageRecord, ChatPayload, MessageKind};

    fn ai_envelope(user: &str) -> RelayEnvelope {
        RelayEnvelope::Ai {
            user_id: user.into(),
            result_id: "42".into(),
            message: AI_COMPLETION_TEXT.into(),
        }
    }

    #[test]
    fn test_inbox_channel_format() {
        assert_eq!(inbox_channel("i1"), "relay:inbox:i1");
    }

    #[tokio::test]
    async fn test_memory_broker_routes_by_instance() {
        let broker = MemoryBroker::new();
        let mut rx1 = broker.declare_inbox("i1").await.unwrap().unwrap();
        let mut rx2 = broker.declare_inbox("i2").await.unwrap().unwrap();

        broker.publish("i2", &ai_envelope("bob")).await.unwrap();

        let got = rx2.recv().await.unwrap();
        assert_eq!(got, ai_envelope("bob"));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_memory_broker_declare_is_idempotent() {
        let broker = MemoryBroker::new();
        let mut rx = broker.declare_inbox("i1").await.unwrap().unwrap();
        assert!(broker.declare_inbox("i1").await.unwrap().is_none());
        assert!(broker.declare_inbox("i1").await.unwrap().is_none());

        broker.publish("i1", &ai_envelope("alice")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ai_envelope("alice"));
        // Exactly one copy despite three declarations.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_memory_broker_unroutable_is_dropped() {
        let broker = MemoryBroker::new();
        broker.publish("ghost", &ai_envelope("alice")).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_broker_redeclare_after_consumer_drop() {
        let broker = MemoryBroker::new();
        let rx = broker.declare_inbox("i1").await.unwrap().unwrap();
        drop(rx);
        assert!(broker.declare_inbox("i1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_broker_chat_envelope_intact() {
        let broker = MemoryBroker::new();
        let mut rx = broker.declare_inbox("i2").await.unwrap().unwrap();

        let record = ChatMessageRecord::new("r1", "alice", "Alice", "hi", MessageKind::Chat);
        let envelope = RelayEnvelope::Chat {
            user_ids: vec!["bob".into(), "carol".into()],
            chat: ChatPayload::from_record(&record),
        };
        broker.publish("i2", &envelope).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), envelope);
    }

    #[test]
    fn test_dlq_push_and_drain() {
        let mut dlq = DeadLetterQueue::new(3);
        dlq.push(DeadLetter {
            channel: "a".into(),
            payload: "1".into(),
            error: "err".into(),
        });
        dlq.push(DeadLetter {
            channel: "b".into(),
            payload: "2".into(),
            error: "err".into(),
        });
        assert_eq!(dlq.len(), 2);
        assert_eq!(dlq.drain_all().len(), 2);
        assert!(dlq.is_empty());
    }

    #[test]
    fn test_dlq_evicts_oldest() {
        let mut dlq = DeadLetterQueue::new(2);
        for (ch, p) in [("a", "1"), ("b", "2"), ("c", "3")] {
            dlq.push(DeadLetter {
                channel: ch.into(),
                payload: p.into(),
                error: "e".into(),
            });
        }
        let entries = dlq.drain_all();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].channel, "b");
        assert_eq!(entries[1].channel, "c");
    }

    #[tokio::test]
    async fn test_redis_broker_publish_before_declare_fails() {
        let broker = RedisBroker::new("redis://127.0.0.1:1");
        assert!(broker.publish("i1", &ai_envelope("a")).await.is_err());
    }
}
