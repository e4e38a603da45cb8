//! Event Bridge - Session Thread to Async Pipeline Handoff
//!
//! Bounded FIFO queue between the blocking gateway session thread and
//! the tokio pipeline. The producer side never blocks: when the queue
//! is full the oldest entry is dropped, metered, and logged. Blocking
//! the producer would starve the session's own keep-alive obligations
//! and risk the exchange terminating it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::warn;

use crate::ports::gateway::{EventSink, GatewayEvent};

/// Log every Nth drop rather than every drop; a saturated queue would
/// otherwise flood the log from the session thread.
const DROP_LOG_SAMPLE: u64 = 1_000;

/// Bounded, drop-oldest handoff queue for gateway events.
///
/// FIFO within one session. A reconnect starts a new logical stream;
/// no ordering is promised across that boundary.
pub struct EventBridge {
    queue: Mutex<VecDeque<GatewayEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl EventBridge {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueue an event from the session thread. Never blocks and never
    /// fails: on a full queue the oldest entry is dropped to favor the
    /// freshest market state.
    pub fn push(&self, event: GatewayEvent) {
        {
            let mut queue = match self.queue.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queue.len() == self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % DROP_LOG_SAMPLE == 1 {
                    warn!(
                        dropped_total = dropped,
                        capacity = self.capacity,
                        "Bridge queue full, dropping oldest event"
                    );
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Dequeue the next event, waiting up to `timeout`.
    ///
    /// `None` on timeout so the consumer can interleave shutdown and
    /// health checks.
    pub async fn recv(&self, timeout: Duration) -> Option<GatewayEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking the queue so a push
            // between the check and the await still wakes us.
            let notified = self.notify.notified();

            if let Some(event) = self.pop() {
                return Some(event);
            }

            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    fn pop(&self) -> Option<GatewayEvent> {
        let mut queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    /// Current backlog length.
    pub fn len(&self) -> usize {
        match self.queue.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events dropped since startup.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl EventSink for EventBridge {
    fn emit(&self, event: GatewayEvent) {
        self.push(event);
    }
}
