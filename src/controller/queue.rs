//! Rate-limited work queue
//!
//! Keys are deduplicated while waiting, and a key is never handed to two
//! workers at once: adding a key that is being processed marks it dirty
//! and it is queued again on [`WorkQueue::done`].

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    backoffs: HashMap<String, ExponentialBackoff>,
    requeues: HashMap<String, usize>,
}

pub struct WorkQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: CancellationToken,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl WorkQueue {
    pub fn new(name: &'static str, initial_backoff: Duration, max_backoff: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            initial_backoff,
            max_backoff,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue a key unless it is already waiting
    pub fn add(&self, key: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut state = self.state.lock();
        if !state.dirty.insert(key.to_string()) {
            return;
        }
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        trace!(queue = self.name, key, "queued");
        self.notify.notify_one();
    }

    /// Queue a key once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(&key),
                _ = queue.shutdown.cancelled() => {}
            }
        });
    }

    /// Queue a key after its next backoff delay, returning the delay
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) -> Duration {
        let delay = {
            let mut state = self.state.lock();
            *state.requeues.entry(key.to_string()).or_default() += 1;
            let (initial, max) = (self.initial_backoff, self.max_backoff);
            state
                .backoffs
                .entry(key.to_string())
                .or_insert_with(|| new_backoff(initial, max))
                .next_backoff()
                .unwrap_or(max)
        };
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff of a key
    pub fn forget(&self, key: &str) {
        let mut state = self.state.lock();
        state.backoffs.remove(key);
        state.requeues.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> usize {
        self.state.lock().requeues.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down
    /// and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            if self.shutdown.is_cancelled() {
                return None;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
    }

    /// Finish processing a key handed out by [`WorkQueue::get`]
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Keys waiting to be processed
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn new_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: max,
        max_elapsed_time: None,
        ..Default::default()
    }
}
