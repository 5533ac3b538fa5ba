//! Time-windowed memory of recently seen broadcast ids.
//!
//! Consumers that can receive the same logical event over more than one
//! channel (socket push, replay buffer, HTTP fan-out) check ids here before
//! applying an event. Entries expire after a fixed window whether or not they
//! were looked up again, so memory stays bounded. Best effort only: an id that
//! expired or was never remembered will be delivered again.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct DedupTracker {
    entries: Arc<DashMap<String, Instant>>,
    window: Duration,
}

impl DedupTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            window,
        }
    }

    /// Whether `broadcast_id` was remembered within the window.
    pub fn seen(&self, broadcast_id: &str) -> bool {
        self.seen_at(broadcast_id, Instant::now())
    }

    pub fn remember(&self, broadcast_id: &str) {
        self.remember_at(broadcast_id, Instant::now());
    }

    /// Remember an id and report whether this is the first time it was
    /// seen within the window.
    pub fn first_sighting(&self, broadcast_id: &str) -> bool {
        self.first_sighting_at(broadcast_id, Instant::now())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_live(&self, inserted: Instant, now: Instant) -> bool {
        now.saturating_duration_since(inserted) < self.window
    }

    fn seen_at(&self, broadcast_id: &str, now: Instant) -> bool {
        self.entries
            .get(broadcast_id)
            .map(|inserted| self.is_live(*inserted, now))
            .unwrap_or(false)
    }

    fn remember_at(&self, broadcast_id: &str, now: Instant) {
        self.entries
            .entry(broadcast_id.to_string())
            .and_modify(|inserted| {
                if !self.is_live(*inserted, now) {
                    *inserted = now;
                }
            })
            .or_insert(now);
    }

    fn first_sighting_at(&self, broadcast_id: &str, now: Instant) -> bool {
        let mut first = false;
        self.entries
            .entry(broadcast_id.to_string())
            .and_modify(|inserted| {
                if !self.is_live(*inserted, now) {
                    *inserted = now;
                    first = true;
                }
            })
            .or_insert_with(|| {
                first = true;
                now
            });
        first
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, inserted| self.is_live(*inserted, now));
        before.saturating_sub(self.entries.len())
    }

    /// Spawn a background task sweeping expired entries once per window.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();
        let period = self.window.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = tracker.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = tracker.len(), "Dedup sweep");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(600);

    #[test]
    fn test_remember_then_seen() {
        let tracker = DedupTracker::new(WINDOW);
        assert!(!tracker.seen("b1"));
        tracker.remember("b1");
        assert!(tracker.seen("b1"));
        assert!(!tracker.seen("b2"));
    }

    #[test]
    fn test_first_sighting_only_once() {
        let tracker = DedupTracker::new(WINDOW);
        assert!(tracker.first_sighting("b1"));
        assert!(!tracker.first_sighting("b1"));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_entries_expire_after_window() {
        let tracker = DedupTracker::new(WINDOW);
        let t0 = Instant::now();
        tracker.remember_at("b1", t0);

        assert!(tracker.seen_at("b1", t0 + Duration::from_secs(599)));
        assert!(!tracker.seen_at("b1", t0 + WINDOW));
        assert!(tracker.first_sighting_at("b1", t0 + WINDOW));
    }

    #[test]
    fn test_sweep_removes_expired() {
        let tracker = DedupTracker::new(WINDOW);
        let t0 = Instant::now();
        tracker.remember_at("old", t0);
        tracker.remember_at("new", t0 + Duration::from_secs(500));

        assert_eq!(tracker.sweep_at(t0 + Duration::from_secs(700)), 1);
        assert!(!tracker.is_empty());
        assert!(tracker.seen_at("new", t0 + Duration::from_secs(700)));
    }
}
