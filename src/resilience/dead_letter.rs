//! Bounded dead-letter sink for exhausted work.
//!
//! A ring buffer: when full, the oldest entry is evicted. Operators inspect
//! entries, fix the root cause and re-enqueue by hand.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    /// Error kind or operation name the failure is grouped under.
    pub kind: String,
    pub message: String,
    pub context: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterStats {
    pub size: usize,
    pub capacity: usize,
    pub total: u64,
    pub evicted: u64,
    pub by_kind: HashMap<String, u64>,
}

struct SinkInner {
    entries: VecDeque<DeadLetterEntry>,
    total: u64,
    evicted: u64,
    by_kind: HashMap<String, u64>,
}

pub struct DeadLetterSink {
    capacity: usize,
    inner: Mutex<SinkInner>,
}

impl DeadLetterSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(SinkInner {
                entries: VecDeque::new(),
                total: 0,
                evicted: 0,
                by_kind: HashMap::new(),
            }),
        }
    }

    pub fn record(
        &self,
        kind: &str,
        message: &str,
        context: serde_json::Value,
        at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().expect("dead-letter lock poisoned");
        if inner.entries.len() >= self.capacity {
            inner.entries.pop_front();
            inner.evicted += 1;
        }
        inner.entries.push_back(DeadLetterEntry {
            kind: kind.to_string(),
            message: message.to_string(),
            context,
            at,
        });
        inner.total += 1;
        *inner.by_kind.entry(kind.to_string()).or_insert(0) += 1;
        tracing::error!(kind, message, "work dead-lettered");
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.inner
            .lock()
            .expect("dead-letter lock poisoned")
            .entries
            .iter()
            .cloned()
            .collect()
    }

    /// Drain everything, for operator-driven re-enqueue.
    pub fn take_all(&self) -> Vec<DeadLetterEntry> {
        let mut inner = self.inner.lock().expect("dead-letter lock poisoned");
        inner.entries.drain(..).collect()
    }

    pub fn stats(&self) -> DeadLetterStats {
        let inner = self.inner.lock().expect("dead-letter lock poisoned");
        DeadLetterStats {
            size: inner.entries.len(),
            capacity: self.capacity,
            total: inner.total,
            evicted: inner.evicted,
            by_kind: inner.by_kind.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest() {
        let sink = DeadLetterSink::new(2);
        for i in 0..3 {
            sink.record(
                "embedding_failed",
                &format!("failure {i}"),
                serde_json::Value::Null,
                Utc::now(),
            );
        }
        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "failure 1");

        let stats = sink.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.by_kind["embedding_failed"], 3);
    }

    #[test]
    fn take_all_empties_the_sink() {
        let sink = DeadLetterSink::new(4);
        sink.record("a", "x", serde_json::Value::Null, Utc::now());
        sink.record("b", "y", serde_json::Value::Null, Utc::now());
        assert_eq!(sink.take_all().len(), 2);
        assert_eq!(sink.entries().len(), 0);
        // Totals are lifetime counters, not current contents.
        assert_eq!(sink.stats().total, 2);
    }
}
