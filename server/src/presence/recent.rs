//! Bounded per-room history used to backfill late joiners.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

use super::rooms::RoomKey;
use crate::proto::Broadcast;

/// Ring buffers of recent broadcasts, one per room, oldest evicted first.
#[derive(Debug)]
pub struct RecentEvents {
    buffers: HashMap<RoomKey, VecDeque<Broadcast>>,
    capacity: usize,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, key: &RoomKey, event: Broadcast) {
        let buffer = self.buffers.entry(key.clone()).or_default();
        while buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }

    /// Events for a room stamped at or after `cutoff`, in insertion order.
    pub fn since(&self, key: &RoomKey, cutoff: DateTime<Utc>) -> Vec<Broadcast> {
        self.buffers
            .get(key)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|event| event.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, key: &RoomKey) -> usize {
        self.buffers.get(key).map(VecDeque::len).unwrap_or(0)
    }

    /// Drop buffers whose newest event is older than `cutoff`; nothing in
    /// them can be replayed any more.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|_, buffer| {
            buffer
                .back()
                .map(|newest| newest.timestamp >= cutoff)
                .unwrap_or(false)
        });
        before - self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(n: usize, at: DateTime<Utc>) -> Broadcast {
        let mut payload = serde_json::Map::new();
        payload.insert("n".to_string(), serde_json::json!(n));
        Broadcast {
            broadcast_id: format!("b{}", n),
            timestamp: at,
            payload,
        }
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let mut recent = RecentEvents::new(100);
        let key = RoomKey::team("T1");
        let now = Utc::now();
        for n in 0..150 {
            recent.push(&key, event(n, now));
        }

        assert_eq!(recent.len(&key), 100);
        let kept = recent.since(&key, now - Duration::hours(1));
        assert_eq!(kept.first().unwrap().broadcast_id, "b50");
        assert_eq!(kept.last().unwrap().broadcast_id, "b149");
    }

    #[test]
    fn test_since_filters_old_events() {
        let mut recent = RecentEvents::new(10);
        let key = RoomKey::activity();
        let now = Utc::now();
        recent.push(&key, event(1, now - Duration::minutes(90)));
        recent.push(&key, event(2, now - Duration::minutes(30)));

        let kept = recent.since(&key, now - Duration::minutes(60));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].broadcast_id, "b2");
        assert!(recent.since(&RoomKey::team("none"), now).is_empty());
    }

    #[test]
    fn test_prune_drops_expired_buffers() {
        let mut recent = RecentEvents::new(10);
        let now = Utc::now();
        recent.push(&RoomKey::team("old"), event(1, now - Duration::hours(2)));
        recent.push(&RoomKey::team("new"), event(2, now));

        assert_eq!(recent.prune(now - Duration::hours(1)), 1);
        assert_eq!(recent.len(&RoomKey::team("old")), 0);
        assert_eq!(recent.len(&RoomKey::team("new")), 1);
    }
}
