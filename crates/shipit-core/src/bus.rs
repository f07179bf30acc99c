//! Log channel bus: live, non-durable fan-out of build output keyed by build id.
//!
//! Delivery is live-only and best-effort. A subscriber sees the lines
//! published after it subscribed, in publish order per publisher; a subscriber
//! that falls behind loses lines instead of slowing the publisher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use futures::StreamExt;
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{BuildId, Result};

/// Per-subscriber buffer used when none is configured.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// One line of build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub build_id: BuildId,
    pub line: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct WirePayload<'a> {
    log: &'a str,
}

impl LogEvent {
    pub fn new(build_id: BuildId, line: impl Into<String>) -> Self {
        Self {
            build_id,
            line: line.into(),
            timestamp: Utc::now(),
        }
    }

    /// Wire form forwarded verbatim to subscribers: `{"log": "<line>"}`.
    pub fn payload(&self) -> String {
        serde_json::to_string(&WirePayload { log: &self.line })
            .unwrap_or_else(|_| String::from("{\"log\":\"\"}"))
    }
}

/// A live subscription to one build's log channel.
///
/// Dropping the subscription unsubscribes. [`LogSubscription::unsubscribe`]
/// can be called any number of times.
pub struct LogSubscription {
    build_id: BuildId,
    receiver: mpsc::Receiver<String>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LogSubscription {
    /// `release` runs exactly once, on the first unsubscribe or on drop.
    pub fn new(
        build_id: BuildId,
        receiver: mpsc::Receiver<String>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            build_id,
            receiver,
            release: Some(Box::new(release)),
        }
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    /// Next payload, or `None` once unsubscribed or the bus has gone away.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.next().await
    }

    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.receiver.close();
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }
}

impl Stream for LogSubscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.receiver.poll_next_unpin(cx)
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for LogSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSubscription")
            .field("build_id", &self.build_id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Bounded channel backing one subscription.
pub fn subscription_channel(buffer: usize) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(buffer)
}

/// Publish/subscribe transport for build logs.
#[async_trait]
pub trait LogBus: Send + Sync {
    /// Name of this bus backend.
    fn name(&self) -> &'static str;

    /// Publish an event to every current subscriber of its build. Must not
    /// wait on subscribers.
    async fn publish(&self, event: &LogEvent) -> Result<()>;

    /// Subscribe to lines published for `build_id` from now on.
    async fn subscribe(&self, build_id: &BuildId) -> Result<LogSubscription>;

    /// Convenience wrapper around [`LogBus::publish`].
    async fn publish_line(&self, build_id: &BuildId, line: &str) -> Result<()> {
        self.publish(&LogEvent::new(build_id.clone(), line)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_payload_shape() {
        let event = LogEvent::new(BuildId::parse("b1").unwrap(), "say \"hi\"");
        let value: serde_json::Value = serde_json::from_str(&event.payload()).unwrap();
        assert_eq!(value, serde_json::json!({ "log": "say \"hi\"" }));
    }

    #[tokio::test]
    async fn test_release_runs_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let (_tx, rx) = subscription_channel(4);
        let mut sub = LogSubscription::new(BuildId::parse("b1").unwrap(), rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recv_ends_after_unsubscribe() {
        let (mut tx, rx) = subscription_channel(4);
        let mut sub = LogSubscription::new(BuildId::parse("b1").unwrap(), rx, || {});
        tx.try_send("one".to_string()).unwrap();
        assert_eq!(sub.recv().await.as_deref(), Some("one"));

        sub.unsubscribe();
        assert!(tx.try_send("two".to_string()).is_err());
        assert_eq!(sub.recv().await, None);
    }
}
