//! Bounded outbound buffer used while an adapter is disconnected.

use std::collections::VecDeque;

use op_telemetry::metrics::{global_metrics, names};
use serde_json::Value;
use tracing::debug;

use crate::channel::is_liveness;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub channel: String,
    pub payload: Value,
}

impl QueueEntry {
    pub fn new(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }
}

/// Result of offering an entry to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Queued,
    /// Queued after evicting the oldest entry.
    Evicted(QueueEntry),
    /// Liveness channel, never buffered.
    Skipped,
}

/// Strict bounded FIFO. When full, the oldest entry makes room for the new one.
#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
    /// Adapter name used for metric labels.
    owner: &'static str,
}

impl OutboundQueue {
    pub fn new(capacity: usize, owner: &'static str) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            owner,
        }
    }

    pub fn push(&mut self, entry: QueueEntry) -> Enqueued {
        if is_liveness(&entry.channel) {
            return Enqueued::Skipped;
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        self.report_depth();
        match evicted {
            Some(old) => {
                global_metrics().increment_counter(names::QUEUE_EVICTIONS, &[("adapter", self.owner)]);
                debug!(adapter = self.owner, channel = %old.channel, "queue full, evicted oldest entry");
                Enqueued::Evicted(old)
            }
            None => Enqueued::Queued,
        }
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        let entry = self.entries.pop_front();
        self.report_depth();
        entry
    }

    /// Put back an entry whose delivery failed during a drain. If sends
    /// refilled the queue in the meantime, this entry is the oldest and is
    /// the one dropped.
    pub fn requeue_front(&mut self, entry: QueueEntry) {
        if self.entries.len() >= self.capacity {
            global_metrics().increment_counter(names::QUEUE_EVICTIONS, &[("adapter", self.owner)]);
            return;
        }
        self.entries.push_front(entry);
        self.report_depth();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.channel.as_str()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.report_depth();
    }

    fn report_depth(&self) {
        global_metrics().set_gauge(
            names::QUEUE_DEPTH,
            &[("adapter", self.owner)],
            self.entries.len() as i64,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(channel: &str, n: u64) -> QueueEntry {
        QueueEntry::new(channel, json!(n))
    }

    #[test]
    fn bounded_with_oldest_eviction() {
        let mut q = OutboundQueue::new(3, "test");
        for i in 0..8 {
            q.push(entry("logs", i));
        }
        assert_eq!(q.len(), 3);
        let kept: Vec<Value> = std::iter::from_fn(|| q.pop_front()).map(|e| e.payload).collect();
        assert_eq!(kept, vec![json!(5), json!(6), json!(7)]);
    }

    #[test]
    fn eviction_reports_the_dropped_entry() {
        let mut q = OutboundQueue::new(1, "test");
        assert_eq!(q.push(entry("a", 1)), Enqueued::Queued);
        assert_eq!(q.push(entry("b", 2)), Enqueued::Evicted(entry("a", 1)));
    }

    #[test]
    fn liveness_is_never_buffered() {
        let mut q = OutboundQueue::new(10, "test");
        assert_eq!(q.push(entry("status", 1)), Enqueued::Skipped);
        assert_eq!(q.push(entry("monitoring", 1)), Enqueued::Skipped);
        assert!(q.is_empty());
    }

    #[test]
    fn requeue_preserves_order() {
        let mut q = OutboundQueue::new(5, "test");
        for c in ["a", "b", "c"] {
            q.push(entry(c, 0));
        }
        let first = q.pop_front().unwrap();
        q.requeue_front(first);
        assert_eq!(q.channels(), vec!["a", "b", "c"]);
    }

    #[test]
    fn requeue_into_full_queue_drops_it() {
        let mut q = OutboundQueue::new(2, "test");
        q.push(entry("a", 0));
        let a = q.pop_front().unwrap();
        q.push(entry("b", 0));
        q.push(entry("c", 0));
        q.requeue_front(a);
        assert_eq!(q.channels(), vec!["b", "c"]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let q = OutboundQueue::new(0, "test");
        assert_eq!(q.capacity(), 1);
    }
}
