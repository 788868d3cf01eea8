//! Timed queue — holds scheduled runs keyed by release time and hands
//! them back when their time is due.
//!
//! Entries are ordered by `(time, insertion seq)` so ties release in
//! insertion order. The consumer awaits [`TimedQueue::next_due`]; an
//! insert earlier than the current sleep target wakes it immediately. A
//! run is never released before its time.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::runs::Run;

pub struct TimedQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

struct QueueInner {
    by_time: BTreeMap<(DateTime<Utc>, u64), Run>,
    index: HashMap<String, (DateTime<Utc>, u64)>,
    seq: u64,
}

impl TimedQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                by_time: BTreeMap::new(),
                index: HashMap::new(),
                seq: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Insert a run at `time`. A re-insert with the same time is a no-op;
    /// a differing time re-keys the entry.
    pub fn schedule(&self, time: DateTime<Utc>, run: Run) {
        let mut inner = self.inner.lock();
        if let Some(&(existing_time, existing_seq)) = inner.index.get(&run.run_id) {
            if existing_time == time {
                return;
            }
            inner.by_time.remove(&(existing_time, existing_seq));
        }
        let seq = inner.seq;
        inner.seq += 1;
        inner.index.insert(run.run_id.clone(), (time, seq));
        inner.by_time.insert((time, seq), run);
        drop(inner);
        // Wake the consumer in case this entry is earlier than its
        // current sleep target.
        self.notify.notify_one();
    }

    /// Remove a run; silently does nothing if absent.
    pub fn unschedule(&self, run_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if let Some((time, seq)) = inner.index.remove(run_id) {
            inner.by_time.remove(&(time, seq));
            true
        } else {
            false
        }
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.inner.lock().index.contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of `(release time, run_id)` pairs in release order.
    pub fn entries(&self) -> Vec<(DateTime<Utc>, String)> {
        self.inner
            .lock()
            .by_time
            .iter()
            .map(|((time, _), run)| (*time, run.run_id.clone()))
            .collect()
    }

    /// Wait until the earliest entry is due, then remove and return it.
    /// Cancellation-safe: no entry is lost if the returned future is
    /// dropped while waiting.
    pub async fn next_due(&self) -> Run {
        loop {
            let wait = {
                let mut inner = self.inner.lock();
                let head = inner.by_time.first_key_value().map(|(key, _)| *key);
                match head {
                    Some((time, seq)) => {
                        let now = Utc::now();
                        if time <= now {
                            let run = inner.by_time.remove(&(time, seq)).expect("head entry");
                            inner.index.remove(&run.run_id);
                            return run;
                        }
                        Some((time - now).to_std().unwrap_or_default())
                    }
                    None => None,
                }
            };

            match wait {
                Some(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

impl Default for TimedQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::Instance;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use std::time::Duration as StdDuration;

    fn run(id: &str) -> Run {
        Run::new(id, Instance::new("j1", BTreeMap::new()), None)
    }

    #[tokio::test]
    async fn due_entry_is_released_immediately() {
        let queue = TimedQueue::new();
        queue.schedule(Utc::now() - Duration::seconds(1), run("r1"));
        let released = tokio::time::timeout(StdDuration::from_secs(1), queue.next_due())
            .await
            .expect("should release a due entry promptly");
        assert_eq!(released.run_id, "r1");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn releases_in_time_order_with_insertion_tiebreak() {
        let queue = TimedQueue::new();
        let t = Utc::now() - Duration::seconds(5);
        queue.schedule(t + Duration::seconds(1), run("late"));
        queue.schedule(t, run("tie-a"));
        queue.schedule(t, run("tie-b"));

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(queue.next_due().await.run_id);
        }
        assert_eq!(order, vec!["tie-a", "tie-b", "late"]);
    }

    #[tokio::test]
    async fn future_entry_is_not_released_early() {
        let queue = TimedQueue::new();
        queue.schedule(Utc::now() + Duration::seconds(30), run("r1"));
        let result =
            tokio::time::timeout(StdDuration::from_millis(200), queue.next_due()).await;
        assert!(result.is_err(), "entry 30s out must not be released yet");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn earlier_insert_wakes_the_sleeper() {
        let queue = std::sync::Arc::new(TimedQueue::new());
        queue.schedule(Utc::now() + Duration::seconds(3_600), run("far"));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next_due().await })
        };
        // Give the waiter time to start sleeping toward the far entry.
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        queue.schedule(Utc::now() + Duration::milliseconds(100), run("near"));

        let released = tokio::time::timeout(StdDuration::from_secs(2), waiter)
            .await
            .expect("earlier insert should wake the sleeper")
            .unwrap();
        assert_eq!(released.run_id, "near");
    }

    #[tokio::test]
    async fn unschedule_removes_entry() {
        let queue = TimedQueue::new();
        queue.schedule(Utc::now() + Duration::seconds(60), run("r1"));
        assert!(queue.contains("r1"));
        assert!(queue.unschedule("r1"));
        assert!(!queue.contains("r1"));
        assert!(queue.is_empty());
        // Absent is silent.
        assert!(!queue.unschedule("r1"));
    }

    #[tokio::test]
    async fn reinsert_same_time_is_noop() {
        let queue = TimedQueue::new();
        let t = Utc::now() + Duration::seconds(60);
        queue.schedule(t, run("r1"));
        queue.schedule(t, run("r1"));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn reinsert_different_time_rekeys() {
        let queue = TimedQueue::new();
        queue.schedule(Utc::now() + Duration::seconds(3_600), run("r1"));
        queue.schedule(Utc::now() - Duration::seconds(1), run("r1"));
        assert_eq!(queue.len(), 1);

        let released = tokio::time::timeout(StdDuration::from_secs(1), queue.next_due())
            .await
            .expect("re-keyed entry should now be due");
        assert_eq!(released.run_id, "r1");
    }

    #[tokio::test]
    async fn entries_snapshot_in_release_order() {
        let queue = TimedQueue::new();
        let t = Utc::now();
        queue.schedule(t + Duration::seconds(20), run("b"));
        queue.schedule(t + Duration::seconds(10), run("a"));
        let entries = queue.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, "a");
        assert_eq!(entries[1].1, "b");
    }
}
