//! Coalescing of `checkResources` requests into bounded batches.
//!
//! The queue only decides *when* a request is forwarded. Each request keeps
//! its own reply channel and timeout in the correlation table and stays
//! queued until it settles.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use crate::protocol::BatchItem;

pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub interval: Duration,
    pub max_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_BATCH_INTERVAL,
            max_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scheduled,
    Batching,
}

#[derive(Debug)]
struct QueuedRequest {
    id: String,
    request: Value,
    created_at: Instant,
    forwarded: bool,
}

#[derive(Debug, Default)]
struct BatchState {
    queue: BTreeMap<u64, QueuedRequest>,
    index: HashMap<String, u64>,
    next_seq: u64,
    timer_armed: bool,
    in_flight: bool,
}

impl BatchState {
    fn unforwarded(&self) -> usize {
        self.queue.values().filter(|entry| !entry.forwarded).count()
    }
}

#[derive(Debug)]
pub struct BatchScheduler {
    config: BatchConfig,
    state: Mutex<BatchState>,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config: BatchConfig {
                interval: config.interval,
                max_size: config.max_size.max(1),
            },
            state: Mutex::new(BatchState::default()),
        }
    }

    pub fn config(&self) -> BatchConfig {
        self.config
    }

    /// Queues a request. Returns true when the caller must arm the timer.
    pub fn enqueue(&self, id: &str, request: Value) -> bool {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.index.insert(id.to_owned(), seq);
        state.queue.insert(
            seq,
            QueuedRequest {
                id: id.to_owned(),
                request,
                created_at: Instant::now(),
                forwarded: false,
            },
        );
        if state.timer_armed {
            return false;
        }
        state.timer_armed = true;
        true
    }

    /// Called when the timer fires. Picks the oldest unforwarded requests,
    /// up to `max_size`, and marks them in flight. Returns `None` when there
    /// is nothing to send or a previous batch is still being forwarded.
    pub fn take_batch(&self) -> Option<Vec<BatchItem>> {
        let mut state = self.state.lock();
        state.timer_armed = false;
        if state.in_flight {
            return None;
        }
        let max_size = self.config.max_size;
        let batch: Vec<BatchItem> = state
            .queue
            .values_mut()
            .filter(|entry| !entry.forwarded)
            .take(max_size)
            .map(|entry| {
                entry.forwarded = true;
                BatchItem {
                    id: entry.id.clone(),
                    request: entry.request.clone(),
                }
            })
            .collect();
        if batch.is_empty() {
            return None;
        }
        state.in_flight = true;
        Some(batch)
    }

    /// Ends the in-flight batch. Returns true when unforwarded requests
    /// remain and the caller must arm the timer again.
    pub fn finish_batch(&self) -> bool {
        let mut state = self.state.lock();
        state.in_flight = false;
        if state.timer_armed || state.unforwarded() == 0 {
            return false;
        }
        state.timer_armed = true;
        true
    }

    /// Drops a settled request. Returns its queue age if it was present.
    pub fn remove(&self, id: &str) -> Option<Duration> {
        let mut state = self.state.lock();
        let seq = state.index.remove(id)?;
        state.queue.remove(&seq).map(|entry| entry.created_at.elapsed())
    }

    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        state.index.clear();
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }

    pub fn state(&self) -> SchedulerState {
        let state = self.state.lock();
        if state.in_flight {
            SchedulerState::Batching
        } else if state.timer_armed {
            SchedulerState::Scheduled
        } else {
            SchedulerState::Idle
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unforwarded(&self) -> usize {
        self.state.lock().unforwarded()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn scheduler(max_size: usize) -> BatchScheduler {
        BatchScheduler::new(BatchConfig {
            interval: Duration::from_millis(50),
            max_size,
        })
    }

    #[test]
    fn first_request_arms_the_timer_once() {
        let batches = scheduler(10);
        assert_eq!(batches.state(), SchedulerState::Idle);
        assert!(batches.enqueue("a", json!(1)));
        assert!(!batches.enqueue("b", json!(2)));
        assert_eq!(batches.state(), SchedulerState::Scheduled);
    }

    #[test]
    fn slices_oldest_first_and_rearms_until_drained() {
        let batches = scheduler(10);
        for i in 0..25 {
            batches.enqueue(&format!("r{i}"), json!(i));
        }

        let mut sizes = Vec::new();
        let mut first_ids = Vec::new();
        loop {
            let batch = batches.take_batch().unwrap();
            assert_eq!(batches.state(), SchedulerState::Batching);
            sizes.push(batch.len());
            first_ids.push(batch[0].id.clone());
            if !batches.finish_batch() {
                break;
            }
            assert_eq!(batches.state(), SchedulerState::Scheduled);
        }
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(first_ids, vec!["r0", "r10", "r20"]);
        assert_eq!(batches.state(), SchedulerState::Idle);
        assert_eq!(batches.len(), 25);
        assert_eq!(batches.unforwarded(), 0);
    }

    #[test]
    fn timer_firing_during_flight_does_nothing() {
        let batches = scheduler(2);
        for i in 0..3 {
            batches.enqueue(&format!("r{i}"), json!(i));
        }
        let first = batches.take_batch().unwrap();
        assert_eq!(first.len(), 2);
        batches.enqueue("late", json!("late"));
        assert!(batches.take_batch().is_none());
        assert!(batches.finish_batch());
        let second = batches.take_batch().unwrap();
        let ids: Vec<_> = second.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "late"]);
    }

    #[test]
    fn settled_requests_leave_the_queue() {
        let batches = scheduler(10);
        batches.enqueue("a", json!(1));
        batches.enqueue("b", json!(2));
        assert!(batches.remove("a").is_some());
        assert!(batches.remove("a").is_none());
        let batch = batches.take_batch().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "b");
        assert_eq!(batches.clear(), 1);
        assert!(batches.is_empty());
    }
}
