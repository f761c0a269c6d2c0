use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::events::Envelope;

// ============================================================================
// Broker Topology - queues and topic-pattern matching
// ============================================================================

/// A durable, non-exclusive queue. Delivery hands the envelope to exactly one
/// consumer; a nack puts it back at the head so redelivery order holds.
pub(crate) struct Queue {
    name: String,
    messages: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl Queue {
    pub(crate) fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn push_back(&self, envelope: Envelope) {
        self.messages.lock().await.push_back(envelope);
        self.notify.notify_one();
    }

    /// Requeue at the head (nack with requeue).
    pub(crate) async fn push_front(&self, envelope: Envelope) {
        self.messages.lock().await.push_front(envelope);
        self.notify.notify_one();
    }

    /// Wait for the next delivery. Cancel-safe: a message is only removed
    /// once this future is past its last await point.
    pub(crate) async fn pop(&self) -> Envelope {
        loop {
            let notified = self.notify.notified();
            if let Some(envelope) = self.messages.lock().await.pop_front() {
                // Another push may have raced the one that woke us.
                self.notify.notify_one();
                return envelope;
            }
            notified.await;
        }
    }

    pub(crate) async fn depth(&self) -> usize {
        self.messages.lock().await.len()
    }
}

/// AMQP-style topic match. Words are separated by `.` or `:`; `*` matches
/// exactly one word, `#` matches zero or more.
pub fn pattern_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = split_words(pattern);
    let key: Vec<&str> = split_words(routing_key);
    match_words(&pattern, &key)
}

fn split_words(s: &str) -> Vec<&str> {
    s.split(['.', ':']).collect()
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            match_words(&pattern[1..], key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => match_words(&pattern[1..], &key[1..]),
        (Some(word), Some(key_word)) if word == key_word => {
            match_words(&pattern[1..], &key[1..])
        }
        _ => false,
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(pattern_matches("order:created", "order:created"));
        assert!(!pattern_matches("order:created", "order:expired"));
    }

    #[test]
    fn test_star_matches_one_word() {
        assert!(pattern_matches("order:*", "order:created"));
        assert!(pattern_matches("order:*", "order:expired"));
        assert!(!pattern_matches("*", "order:created"));
    }

    #[test]
    fn test_hash_matches_any_depth() {
        assert!(pattern_matches("#", "order:created"));
        assert!(pattern_matches("#", "payment:success"));
        assert!(pattern_matches("order.#", "order:created"));
        assert!(pattern_matches("order.#", "order.items.updated"));
    }

    #[test]
    fn test_dot_and_colon_are_equivalent_separators() {
        assert!(pattern_matches("order.created", "order:created"));
        assert!(pattern_matches("payment:*", "payment.success"));
    }

    #[tokio::test]
    async fn test_queue_fifo_with_requeue_at_head() {
        let queue = Queue::new("test");

        let envelope = |key: &str| Envelope {
            exchange: "x".to_string(),
            routing_key: key.to_string(),
            body: vec![],
            persistent: true,
            redelivered: false,
        };

        queue.push_back(envelope("first")).await;
        queue.push_back(envelope("second")).await;

        let head = queue.pop().await;
        assert_eq!(head.routing_key, "first");

        // Nack+requeue keeps the message at the head.
        queue.push_front(head).await;
        assert_eq!(queue.pop().await.routing_key, "first");
        assert_eq!(queue.pop().await.routing_key, "second");
    }
}
