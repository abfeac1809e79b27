//! Analytics events and the buffer that batches them for delivery.
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{NetworkService, StatsigOptions, UserIdentity};

/// A custom or exposure event logged by the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Name of the event, e.g. `purchase`.
    pub event_name: String,
    /// Optional primary value (a number or a string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Optional string key/value pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    /// User the event was logged for.
    pub user: UserIdentity,
    /// Milliseconds since the Unix epoch.
    pub time: i64,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(user: &UserIdentity, event_name: impl Into<String>) -> Event {
        Event {
            event_name: event_name.into(),
            value: None,
            metadata: None,
            user: user.clone(),
            time: Utc::now().timestamp_millis(),
        }
    }

    /// Set the event value.
    pub fn with_value(mut self, value: impl Into<Value>) -> Event {
        self.value = Some(value.into());
        self
    }

    /// Set the event metadata.
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Event {
        self.metadata = Some(metadata);
        self
    }
}

/// Buffers events until they are flushed, and keeps payloads whose delivery failed so they are
/// retried on the next flush.
#[derive(Debug)]
pub struct EventBuffer {
    batch_size: usize,
    event_queue: Mutex<VecDeque<Event>>,
    failed_payloads: Mutex<VecDeque<Vec<u8>>>,
}

const MIN_BATCH_SIZE: usize = 10;
const MAX_BATCH_SIZE: usize = 500;

/// Maximum number of failed payloads kept for retry. Oldest payloads are dropped first.
pub const MAX_FAILED_PAYLOADS: usize = 20;

impl EventBuffer {
    /// Create a buffer sending up to `batch_size` events per request. `batch_size` is clamped to
    /// `10..=500`.
    pub fn new(batch_size: usize) -> Self {
        EventBuffer {
            batch_size: batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
            event_queue: Mutex::new(VecDeque::new()),
            failed_payloads: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a buffer using [`StatsigOptions::event_batch_size`].
    pub fn from_options(options: &StatsigOptions) -> Self {
        EventBuffer::new(options.event_batch_size)
    }

    /// Queue an event for the next flush.
    pub fn push(&self, event: Event) {
        let mut queue = self
            .event_queue
            .lock()
            .expect("thread holding event queue lock should not panic");
        queue.push_back(event);
    }

    /// Pop up to `batch_size` events, oldest first.
    pub fn next_batch(&self) -> Vec<Event> {
        let mut queue = self
            .event_queue
            .lock()
            .expect("thread holding event queue lock should not panic");
        let count = queue.len().min(self.batch_size);
        queue.drain(..count).collect()
    }

    /// Number of events waiting to be sent.
    pub fn queued_event_count(&self) -> usize {
        self.event_queue
            .lock()
            .expect("thread holding event queue lock should not panic")
            .len()
    }

    /// Number of failed payloads waiting to be retried.
    pub fn failed_payload_count(&self) -> usize {
        self.failed_payloads
            .lock()
            .expect("thread holding failed payloads lock should not panic")
            .len()
    }

    /// Retry previously failed payloads, then send the next batch of events for `user`.
    ///
    /// Anything that fails again is kept for the next flush.
    pub async fn flush(&self, service: &NetworkService, user: &UserIdentity) {
        let retries = self.take_failed_payloads();
        if !retries.is_empty() {
            log::debug!(target: "statsig", count = retries.len(); "retrying failed event payloads");
            let still_failing = service.send_requests_with_data(retries).await;
            self.store_failed_payloads(still_failing);
        }

        let batch = self.next_batch();
        if batch.is_empty() {
            return;
        }
        log::debug!(target: "statsig", count = batch.len(); "sending events");
        if let Err(payload) = service.send_events(user, &batch).await {
            self.store_failed_payloads(vec![payload]);
        }
    }

    fn take_failed_payloads(&self) -> Vec<Vec<u8>> {
        let mut failed = self
            .failed_payloads
            .lock()
            .expect("thread holding failed payloads lock should not panic");
        failed.drain(..).collect()
    }

    fn store_failed_payloads(&self, payloads: Vec<Vec<u8>>) {
        let mut failed = self
            .failed_payloads
            .lock()
            .expect("thread holding failed payloads lock should not panic");
        failed.extend(payloads);
        while failed.len() > MAX_FAILED_PAYLOADS {
            failed.pop_front();
            log::warn!(target: "statsig", "too many failed event payloads, dropping the oldest");
        }
    }
}
