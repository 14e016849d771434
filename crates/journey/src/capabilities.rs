//! Collaborators the engine depends on but does not implement: the outbound
//! transport, link tracking and the clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

/// Outbound "send text to a conversation" transport.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, tenant_id: Uuid, conversation_id: i64, text: &str) -> Result<()>;
}

/// Rewrites an outbound URL into a tracked redirect.
#[async_trait]
pub trait LinkTracker: Send + Sync {
    async fn wrap(
        &self,
        tenant_id: Uuid,
        workflow_id: Uuid,
        step_id: Uuid,
        url: &str,
    ) -> Result<String>;
}

/// Leaves every URL untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughLinks;

#[async_trait]
impl LinkTracker for PassthroughLinks {
    async fn wrap(&self, _: Uuid, _: Uuid, _: Uuid, url: &str) -> Result<String> {
        Ok(url.to_string())
    }
}

/// Time source for deadlines, fire times and in-process waits.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Settable clock for testing. `sleep` advances the clock by the requested
/// duration and returns immediately.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(step) = chrono::Duration::from_std(duration) {
            self.advance(step);
        }
        tokio::task::yield_now().await;
    }
}

/// A message handed to [`RecordingSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub tenant_id: Uuid,
    pub conversation_id: i64,
    pub text: String,
}

/// In-memory sender that records messages for testing. Failures can be
/// injected for the next `n` sends.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<SentMessage>>,
    fail_next: AtomicUsize,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|m| m.text.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, tenant_id: Uuid, conversation_id: i64, text: &str) -> Result<()> {
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("transport unavailable"));
        }
        self.sent.lock().push(SentMessage {
            tenant_id,
            conversation_id,
            text: text.to_string(),
        });
        Ok(())
    }
}
