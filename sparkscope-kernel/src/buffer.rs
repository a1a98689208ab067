//! Bounded buffers with strict oldest-first eviction.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Clone, Serialize)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> RingBuffer<T> {
    /// A zero capacity is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            evicted: 0,
        }
    }

    /// Appends `item`, returning the entry evicted to make room, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.evicted += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries dropped by eviction since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    /// Removes entries for which `keep` returns false, returning how many went.
    pub fn retain<F: FnMut(&T) -> bool>(&mut self, keep: F) -> usize {
        let before = self.items.len();
        self.items.retain(keep);
        before - self.items.len()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// The newest `limit` entries, oldest first.
    pub fn latest(&self, limit: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(limit);
        self.items.iter().skip(skip).cloned().collect()
    }
}

/// Outcome of [`TopicBuffers::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pushed<T> {
    /// Oldest entry of the same topic, dropped to make room.
    pub evicted: Option<T>,
    /// Least recently updated topic, dropped to stay under `max_topics`.
    pub dropped_topic: Option<String>,
}

#[derive(Debug, Clone)]
struct Slot<T> {
    buffer: RingBuffer<T>,
    touched: u64,
}

/// One ring buffer per topic, all sharing the same capacity. At most
/// `max_topics` topics are held; a new topic beyond that displaces the
/// one updated least recently.
#[derive(Debug, Clone)]
pub struct TopicBuffers<T> {
    capacity: usize,
    max_topics: usize,
    topics: HashMap<String, Slot<T>>,
    recency: BTreeMap<u64, String>,
    clock: u64,
    dropped_topics: u64,
}

impl<T> TopicBuffers<T> {
    /// Zero limits are raised to one.
    pub fn new(capacity: usize, max_topics: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            max_topics: max_topics.max(1),
            topics: HashMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
            dropped_topics: 0,
        }
    }

    pub fn push(&mut self, topic: &str, item: T) -> Pushed<T> {
        self.clock += 1;
        let tick = self.clock;
        if let Some(slot) = self.topics.get_mut(topic) {
            let key = self.recency.remove(&slot.touched).unwrap_or_else(|| topic.to_string());
            self.recency.insert(tick, key);
            slot.touched = tick;
            return Pushed {
                evicted: slot.buffer.push(item),
                dropped_topic: None,
            };
        }

        let dropped_topic = if self.topics.len() >= self.max_topics {
            self.drop_least_recent()
        } else {
            None
        };
        let mut buffer = RingBuffer::with_capacity(self.capacity);
        buffer.push(item);
        self.topics.insert(topic.to_string(), Slot { buffer, touched: tick });
        self.recency.insert(tick, topic.to_string());
        Pushed {
            evicted: None,
            dropped_topic,
        }
    }

    fn drop_least_recent(&mut self) -> Option<String> {
        let (_, topic) = self.recency.pop_first()?;
        self.topics.remove(&topic);
        self.dropped_topics += 1;
        Some(topic)
    }

    pub fn get(&self, topic: &str) -> Option<&RingBuffer<T>> {
        self.topics.get(topic).map(|slot| &slot.buffer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RingBuffer<T>)> {
        self.topics.iter().map(|(topic, slot)| (topic, &slot.buffer))
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn total_len(&self) -> usize {
        self.topics.values().map(|slot| slot.buffer.len()).sum()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_topics(&self) -> usize {
        self.max_topics
    }

    /// Topics displaced by the topic limit since creation.
    pub fn dropped_topics(&self) -> u64 {
        self.dropped_topics
    }

    /// Drops entries failing `keep` across all topics; empty topics go too.
    pub fn prune<F: FnMut(&T) -> bool>(&mut self, mut keep: F) -> usize {
        let mut removed = 0;
        let recency = &mut self.recency;
        self.topics.retain(|_, slot| {
            removed += slot.buffer.retain(&mut keep);
            if slot.buffer.is_empty() {
                recency.remove(&slot.touched);
                return false;
            }
            true
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_last_capacity_in_order() {
        let mut buffer = RingBuffer::with_capacity(3);
        for n in 0..10 {
            buffer.push(n);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![7, 8, 9]);
        assert_eq!(buffer.evicted(), 7);
    }

    #[test]
    fn test_push_returns_evicted_oldest() {
        let mut buffer = RingBuffer::with_capacity(2);
        assert_eq!(buffer.push("a"), None);
        assert_eq!(buffer.push("b"), None);
        assert_eq!(buffer.push("c"), Some("a"));
    }

    #[test]
    fn test_latest_limits_from_the_newest_end() {
        let mut buffer = RingBuffer::with_capacity(10);
        for n in 0..5 {
            buffer.push(n);
        }
        assert_eq!(buffer.latest(2), vec![3, 4]);
        assert_eq!(buffer.latest(50), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut buffer = RingBuffer::with_capacity(0);
        buffer.push(1);
        buffer.push(2);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.latest(5), vec![2]);
    }

    #[test]
    fn test_topic_buffers_are_independent() {
        let mut buffers = TopicBuffers::new(2, 10);
        for n in 0..5 {
            buffers.push("a", n);
        }
        buffers.push("b", 100);
        assert_eq!(buffers.get("a").unwrap().latest(10), vec![3, 4]);
        assert_eq!(buffers.get("b").unwrap().len(), 1);
        assert_eq!(buffers.total_len(), 3);
        assert_eq!(buffers.topic_count(), 2);
    }

    #[test]
    fn test_prune_drops_empty_topics() {
        let mut buffers = TopicBuffers::new(5, 10);
        buffers.push("old", 1);
        buffers.push("mixed", 2);
        buffers.push("mixed", 10);
        let removed = buffers.prune(|n| *n >= 10);
        assert_eq!(removed, 2);
        assert!(buffers.get("old").is_none());
        assert_eq!(buffers.get("mixed").unwrap().latest(5), vec![10]);
    }

    #[test]
    fn test_topic_limit_drops_least_recently_updated() {
        let mut buffers = TopicBuffers::new(5, 2);
        buffers.push("a", 1);
        buffers.push("b", 2);
        buffers.push("a", 3);

        let pushed = buffers.push("c", 4);
        assert_eq!(pushed.dropped_topic.as_deref(), Some("b"));
        assert_eq!(pushed.evicted, None);
        assert_eq!(buffers.topic_count(), 2);
        assert!(buffers.get("b").is_none());
        assert_eq!(buffers.get("a").unwrap().latest(5), vec![1, 3]);
        assert_eq!(buffers.dropped_topics(), 1);

        assert_eq!(buffers.push("d", 5).dropped_topic.as_deref(), Some("a"));
    }

    #[test]
    fn test_topic_count_stays_bounded() {
        let mut buffers = TopicBuffers::new(1, 100);
        for n in 0..10_000 {
            buffers.push(&format!("sensor/{n}"), n);
        }
        assert_eq!(buffers.topic_count(), 100);
        assert_eq!(buffers.dropped_topics(), 9_900);
        assert!(buffers.get("sensor/9999").is_some());
        assert!(buffers.get("sensor/0").is_none());
    }

    #[test]
    fn test_pruned_topics_free_their_slot() {
        let mut buffers = TopicBuffers::new(5, 2);
        buffers.push("old", 1);
        buffers.push("new", 10);
        buffers.prune(|n| *n >= 10);

        let pushed = buffers.push("next", 11);
        assert_eq!(pushed.dropped_topic, None);
        assert_eq!(buffers.topic_count(), 2);
    }
}
