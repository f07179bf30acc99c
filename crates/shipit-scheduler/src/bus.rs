//! Log bus implementations.
//!
//! [`InMemoryLogBus`] fans lines out to subscribers inside one process.
//! [`PgLogBus`] carries lines between processes over Postgres
//! `LISTEN`/`NOTIFY` and fans them out locally through an inner
//! [`InMemoryLogBus`].

use async_trait::async_trait;
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};
use shipit_core::bus::{LogBus, LogEvent, LogSubscription, subscription_channel};
use shipit_core::{BuildId, Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Subscribers = HashMap<BuildId, Vec<(u64, mpsc::Sender<String>)>>;

/// In-process pub/sub keyed by build id.
pub struct InMemoryLogBus {
    subscribers: Arc<Mutex<Subscribers>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl InMemoryLogBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            buffer: buffer.max(1),
        }
    }

    /// Hand a payload to every live subscriber of `build_id` without waiting.
    pub fn deliver(&self, build_id: &BuildId, payload: &str) -> Result<()> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| Error::Bus("subscriber registry poisoned".to_string()))?;

        let Some(senders) = subscribers.get_mut(build_id) else {
            return Ok(());
        };

        // Drop closed subscribers; a full subscriber misses this line.
        senders.retain_mut(|(id, tx)| match tx.try_send(payload.to_string()) {
            Ok(()) => true,
            Err(e) if e.is_full() => {
                debug!(job_id = %build_id, subscriber = *id, "Subscriber lagging, dropped line");
                true
            }
            Err(_) => false,
        });
        if senders.is_empty() {
            subscribers.remove(build_id);
        }
        Ok(())
    }

    /// Number of live subscribers for a build.
    pub fn subscriber_count(&self, build_id: &BuildId) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.get(build_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl Default for InMemoryLogBus {
    fn default() -> Self {
        Self::new(shipit_core::bus::DEFAULT_SUBSCRIBER_BUFFER)
    }
}

#[async_trait]
impl LogBus for InMemoryLogBus {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, event: &LogEvent) -> Result<()> {
        self.deliver(&event.build_id, &event.payload())
    }

    async fn subscribe(&self, build_id: &BuildId) -> Result<LogSubscription> {
        let (tx, rx) = subscription_channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.subscribers
            .lock()
            .map_err(|_| Error::Bus("subscriber registry poisoned".to_string()))?
            .entry(build_id.clone())
            .or_default()
            .push((id, tx));

        let registry = self.subscribers.clone();
        let key = build_id.clone();
        Ok(LogSubscription::new(build_id.clone(), rx, move || {
            if let Ok(mut subs) = registry.lock() {
                if let Some(senders) = subs.get_mut(&key) {
                    senders.retain(|(sub_id, _)| *sub_id != id);
                    if senders.is_empty() {
                        subs.remove(&key);
                    }
                }
            }
        }))
    }
}

/// Postgres notification channel carrying every build's log lines.
pub const LOG_CHANNEL: &str = "shipit_logs";

/// Postgres rejects notification payloads of 8000 bytes or more.
const MAX_NOTIFY_PAYLOAD: usize = 7900;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    build_id: BuildId,
    payload: String,
}

/// Log bus over Postgres `LISTEN`/`NOTIFY`.
pub struct PgLogBus {
    pool: PgPool,
    local: Arc<InMemoryLogBus>,
    listener: Option<JoinHandle<()>>,
}

impl PgLogBus {
    /// Publish and subscribe. Starts a listener task that fans incoming
    /// notifications out to local subscribers.
    pub async fn connect(pool: PgPool, subscriber_buffer: usize) -> Result<Self> {
        let mut listener = PgListener::connect_with(&pool)
            .await
            .map_err(|e| Error::Bus(format!("failed to connect listener: {}", e)))?;
        listener
            .listen(LOG_CHANNEL)
            .await
            .map_err(|e| Error::Bus(format!("failed to listen on {}: {}", LOG_CHANNEL, e)))?;

        let local = Arc::new(InMemoryLogBus::new(subscriber_buffer));
        let fanout = local.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<Envelope>(notification.payload()) {
                            Ok(envelope) => {
                                if let Err(e) = fanout.deliver(&envelope.build_id, &envelope.payload)
                                {
                                    error!(error = %e, "Failed to fan out log line");
                                }
                            }
                            Err(e) => warn!(error = %e, "Ignoring malformed log notification"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Log listener error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            pool,
            local,
            listener: Some(task),
        })
    }

    /// Publish only. Used by execution monitors, which never subscribe.
    pub fn publisher(pool: PgPool) -> Self {
        Self {
            pool,
            local: Arc::new(InMemoryLogBus::default()),
            listener: None,
        }
    }
}

impl Drop for PgLogBus {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

#[async_trait]
impl LogBus for PgLogBus {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn publish(&self, event: &LogEvent) -> Result<()> {
        let envelope = notify_envelope(event)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(LOG_CHANNEL)
            .bind(envelope)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Bus(format!("failed to publish log line: {}", e)))?;
        Ok(())
    }

    async fn subscribe(&self, build_id: &BuildId) -> Result<LogSubscription> {
        if self.listener.is_none() {
            return Err(Error::Bus("publish-only bus cannot subscribe".to_string()));
        }
        self.local.subscribe(build_id).await
    }
}

/// Serialized envelope for `event`, shortening the line to fit a notification.
fn notify_envelope(event: &LogEvent) -> Result<String> {
    let mut line = event.line.as_str();
    loop {
        let payload = LogEvent {
            build_id: event.build_id.clone(),
            line: line.to_string(),
            timestamp: event.timestamp,
        }
        .payload();
        let envelope = serde_json::to_string(&Envelope {
            build_id: event.build_id.clone(),
            payload,
        })
        .map_err(|e| Error::Bus(e.to_string()))?;

        if envelope.len() <= MAX_NOTIFY_PAYLOAD || line.is_empty() {
            return Ok(envelope);
        }
        let overshoot = envelope.len() - MAX_NOTIFY_PAYLOAD;
        let mut cut = line.len().saturating_sub(overshoot);
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line = &line[..cut];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> BuildId {
        BuildId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_subscriber_sees_lines_after_subscribe_in_order() {
        let bus = InMemoryLogBus::default();
        bus.publish_line(&id("a"), "before").await.unwrap();

        let mut sub = bus.subscribe(&id("a")).await.unwrap();
        for n in 0..5 {
            bus.publish_line(&id("a"), &format!("line {n}")).await.unwrap();
        }

        for n in 0..5 {
            let payload = sub.recv().await.unwrap();
            assert_eq!(payload, format!("{{\"log\":\"line {n}\"}}"));
        }
    }

    #[tokio::test]
    async fn test_lines_stay_on_their_build() {
        let bus = InMemoryLogBus::default();
        let mut a = bus.subscribe(&id("a")).await.unwrap();
        let mut b = bus.subscribe(&id("b")).await.unwrap();

        bus.publish_line(&id("a"), "for a").await.unwrap();
        bus.publish_line(&id("b"), "for b").await.unwrap();

        assert_eq!(a.recv().await.unwrap(), "{\"log\":\"for a\"}");
        assert_eq!(b.recv().await.unwrap(), "{\"log\":\"for b\"}");
        a.unsubscribe();
        b.unsubscribe();
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
    }

    #[tokio::test]
    async fn test_many_subscribers_fan_out() {
        let bus = InMemoryLogBus::default();
        let mut subs = Vec::new();
        for _ in 0..3 {
            subs.push(bus.subscribe(&id("a")).await.unwrap());
        }
        bus.publish_line(&id("a"), "hello").await.unwrap();
        for sub in &mut subs {
            assert_eq!(sub.recv().await.unwrap(), "{\"log\":\"hello\"}");
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop_release_registration() {
        let bus = InMemoryLogBus::default();
        let mut first = bus.subscribe(&id("a")).await.unwrap();
        let second = bus.subscribe(&id("a")).await.unwrap();
        assert_eq!(bus.subscriber_count(&id("a")), 2);

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(bus.subscriber_count(&id("a")), 1);

        drop(second);
        assert_eq!(bus.subscriber_count(&id("a")), 0);
        bus.publish_line(&id("a"), "nobody").await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_publisher() {
        let bus = InMemoryLogBus::new(2);
        let mut slow = bus.subscribe(&id("a")).await.unwrap();

        for n in 0..50 {
            bus.publish_line(&id("a"), &format!("{n}")).await.unwrap();
        }

        // futures mpsc grants each sender one slot beyond the buffer.
        let mut received = Vec::new();
        while let Ok(Some(payload)) =
            tokio::time::timeout(Duration::from_millis(20), slow.recv()).await
        {
            received.push(payload);
        }
        assert!(received.len() < 50);
        assert_eq!(received[0], "{\"log\":\"0\"}");
        assert_eq!(bus.subscriber_count(&id("a")), 1);
    }

    #[test]
    fn test_notify_envelope_is_truncated() {
        let event = LogEvent::new(id("a"), "é".repeat(10_000));
        let envelope = notify_envelope(&event).unwrap();
        assert!(envelope.len() <= MAX_NOTIFY_PAYLOAD);

        let parsed: Envelope = serde_json::from_str(&envelope).unwrap();
        assert_eq!(parsed.build_id, id("a"));
        let inner: serde_json::Value = serde_json::from_str(&parsed.payload).unwrap();
        assert!(inner["log"].as_str().unwrap().starts_with("éé"));
    }

    #[tokio::test]
    #[ignore = "requires Postgres (DATABASE_URL)"]
    async fn test_pg_bus_crosses_connections() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = shipit_db::create_pool(&url, 2).await.unwrap();
        let gateway = PgLogBus::connect(pool.clone(), 16).await.unwrap();
        let monitor = PgLogBus::publisher(pool);

        let build = id(&format!("bus-{}", uuid::Uuid::new_v4().simple()));
        let mut sub = gateway.subscribe(&build).await.unwrap();
        monitor.publish_line(&build, "from monitor").await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, "{\"log\":\"from monitor\"}");
        assert!(monitor.subscribe(&build).await.is_err());
    }
}
