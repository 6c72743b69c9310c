//! Bounded in-process work queue feeding the processor pool.
//!
//! One producer (the ingress layer), N consumers (processor workers).
//! Dequeue is non-blocking; workers poll with a small back-off. Items being
//! processed sit in an in-flight map so a clean shutdown can re-enqueue
//! them for the next startup.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full (capacity {0})")]
    Full(usize),
    #[error("retries exhausted for {0}")]
    RetriesExhausted(Uuid),
    #[error("submission {0} is not in flight")]
    NotInFlight(Uuid),
}

/// One queued unit of work.
#[derive(Debug, Clone)]
pub struct Submission {
    pub application_id: Uuid,
    pub photo_bytes: Vec<u8>,
    pub format: String,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Caller-registered webhook for status fan-out.
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_requeued: u64,
}

struct QueueInner {
    queue: VecDeque<Submission>,
    in_flight: HashMap<Uuid, Submission>,
    total_enqueued: u64,
    total_completed: u64,
    total_failed: u64,
    total_requeued: u64,
}

pub struct WorkQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                in_flight: HashMap::new(),
                total_enqueued: 0,
                total_completed: 0,
                total_failed: 0,
                total_requeued: 0,
            }),
        }
    }

    pub fn enqueue(&self, submission: Submission) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.queue.len() >= self.capacity {
            tracing::warn!(capacity = self.capacity, "submission queue is full");
            return Err(QueueError::Full(self.capacity));
        }
        tracing::info!(
            application_id = %submission.application_id,
            queued = inner.queue.len() + 1,
            "submission enqueued"
        );
        inner.queue.push_back(submission);
        inner.total_enqueued += 1;
        Ok(())
    }

    /// Non-blocking: `None` when empty. The item moves to the in-flight map
    /// until `mark_complete` or `requeue`.
    pub fn dequeue(&self) -> Option<Submission> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let submission = inner.queue.pop_front()?;
        inner
            .in_flight
            .insert(submission.application_id, submission.clone());
        Some(submission)
    }

    pub fn mark_complete(&self, application_id: Uuid, success: bool) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .in_flight
            .remove(&application_id)
            .ok_or(QueueError::NotInFlight(application_id))?;
        if success {
            inner.total_completed += 1;
        } else {
            inner.total_failed += 1;
        }
        Ok(())
    }

    /// Put an in-flight submission back on the queue with its retry counter
    /// bumped. Fails once `max_retries` is reached; the submission is then
    /// dropped from the in-flight map and counted as failed.
    pub fn requeue(&self, application_id: Uuid, max_retries: u32) -> Result<u32, QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let mut submission = inner
            .in_flight
            .remove(&application_id)
            .ok_or(QueueError::NotInFlight(application_id))?;
        if submission.retry_count >= max_retries {
            inner.total_failed += 1;
            tracing::error!(application_id = %application_id, "max retries exceeded");
            return Err(QueueError::RetriesExhausted(application_id));
        }
        submission.retry_count += 1;
        let retry = submission.retry_count;
        tracing::info!(
            application_id = %application_id,
            retry,
            max_retries,
            "submission requeued"
        );
        inner.queue.push_back(submission);
        inner.total_requeued += 1;
        Ok(retry)
    }

    pub fn is_in_flight(&self, application_id: Uuid) -> bool {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .in_flight
            .contains_key(&application_id)
    }

    /// Move every in-flight item back onto the queue. Called on clean
    /// shutdown so the next startup resumes the work.
    pub fn drain_in_flight(&self) -> usize {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let items: Vec<Submission> = inner.in_flight.drain().map(|(_, s)| s).collect();
        let count = items.len();
        for submission in items {
            inner.queue.push_back(submission);
        }
        if count > 0 {
            tracing::info!(count, "in-flight submissions re-enqueued for next startup");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("queue lock poisoned");
        QueueStats {
            queued: inner.queue.len(),
            in_flight: inner.in_flight.len(),
            total_enqueued: inner.total_enqueued,
            total_completed: inner.total_completed,
            total_failed: inner.total_failed,
            total_requeued: inner.total_requeued,
        }
    }
}
