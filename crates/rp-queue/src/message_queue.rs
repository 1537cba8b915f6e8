//! MessageQueue - delay-ordered queue of pending sends
//!
//! Units become visible once their ready time has passed. Workers block in
//! `take` until the earliest unit is ready; units with equal ready times are
//! handed out in insertion order. Every unit is persisted on `put` and removed
//! from the persister when taken.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rp_common::{now_ms, DelayableMessage};
use rp_routing::{RoutingTable, MULTICAST_ADDRESS_CALCULATOR_PARTICIPANT_ID};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::persister::MessagePersister;
use crate::{QueueError, Result};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct QueueEntry {
    ready_at_ms: i64,
    seq: u64,
    unit: DelayableMessage,
}

// BinaryHeap is a max-heap; reverse so the earliest ready time pops first.
impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at_ms == other.ready_at_ms && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        match other.ready_at_ms.cmp(&self.ready_at_ms) {
            CmpOrdering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

pub struct MessageQueue {
    queue_id: String,
    heap: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    seq: AtomicU64,
    persister: Arc<dyn MessagePersister>,
    routing_table: Arc<dyn RoutingTable>,
    accepting: AtomicBool,
    shut_down: AtomicBool,
}

impl MessageQueue {
    pub fn new(
        queue_id: impl Into<String>,
        persister: Arc<dyn MessagePersister>,
        routing_table: Arc<dyn RoutingTable>,
    ) -> Self {
        Self {
            queue_id: queue_id.into(),
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            persister,
            routing_table,
            accepting: AtomicBool::new(true),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    /// Persists the unit, then makes it visible at its ready time.
    /// A failing persister is logged and does not prevent the enqueue.
    pub async fn put(&self, unit: DelayableMessage) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(self.queue_id.clone()));
        }

        match self.persister.persist(&self.queue_id, &unit).await {
            Ok(true) => debug!(message_id = %unit.message().id, recipient = %unit.recipient(), "Persisted queued message"),
            Ok(false) => {}
            Err(e) => warn!(
                message_id = %unit.message().id,
                recipient = %unit.recipient(),
                error = %e,
                "Failed to persist queued message"
            ),
        }

        self.push(unit);
        Ok(())
    }

    fn push(&self, unit: DelayableMessage) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.heap.lock().push(QueueEntry {
            ready_at_ms: unit.ready_at_ms(),
            seq,
            unit,
        });
        self.notify.notify_waiters();
    }

    /// Waits for the next ready unit. Returns None once the queue is shut down.
    pub async fn take(&self) -> Option<DelayableMessage> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before inspecting the heap so a concurrent put cannot be missed
            notified.as_mut().enable();

            if self.shut_down.load(Ordering::SeqCst) {
                return None;
            }

            let (ready, wait_ms) = {
                let mut heap = self.heap.lock();
                match heap.peek().map(|entry| entry.ready_at_ms - now_ms()) {
                    Some(remaining) if remaining <= 0 => (heap.pop(), None),
                    Some(remaining) => (None, Some(remaining as u64)),
                    None => (None, None),
                }
            };

            if let Some(entry) = ready {
                self.forget(&entry.unit).await;
                return Some(entry.unit);
            }

            match wait_ms {
                None => notified.await,
                Some(ms) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    }
                }
            }
        }
    }

    async fn forget(&self, unit: &DelayableMessage) {
        if let Err(e) = self.persister.remove(&self.queue_id, unit).await {
            warn!(
                message_id = %unit.message().id,
                recipient = %unit.recipient(),
                error = %e,
                "Failed to remove message from persister"
            );
        }
    }

    /// Loads units persisted under this queue id by a previous run and
    /// returns copies of what was queued.
    pub async fn restore_persisted(&self) -> Vec<DelayableMessage> {
        match self.persister.fetch_all(&self.queue_id).await {
            Ok(units) => {
                for unit in &units {
                    self.push(unit.clone());
                }
                if !units.is_empty() {
                    info!(queue_id = %self.queue_id, count = units.len(), "Restored persisted messages");
                }
                units
            }
            Err(e) => {
                warn!(queue_id = %self.queue_id, error = %e, "Failed to fetch persisted messages");
                Vec::new()
            }
        }
    }

    /// Rejects all further `put`s.
    pub fn close_intake(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Waits up to `timeout` for the queue to empty. Units for participants
    /// without a route are discarded along the way and returned.
    pub async fn wait_for_queue_to_drain(&self, timeout: Duration) -> Vec<DelayableMessage> {
        let start = Instant::now();
        let mut discarded = Vec::new();

        loop {
            let unroutable = self.discard_unroutable();
            for unit in &unroutable {
                self.forget(unit).await;
            }
            discarded.extend(unroutable);

            if self.is_empty() || start.elapsed() >= timeout {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        if !discarded.is_empty() {
            info!(queue_id = %self.queue_id, count = discarded.len(), "Discarded unroutable messages while draining");
        }
        discarded
    }

    fn discard_unroutable(&self) -> Vec<DelayableMessage> {
        let mut heap = self.heap.lock();
        let (keep, discard): (Vec<QueueEntry>, Vec<QueueEntry>) = heap.drain().partition(|entry| {
            let recipient = entry.unit.recipient();
            recipient == MULTICAST_ADDRESS_CALCULATOR_PARTICIPANT_ID
                || self.routing_table.contains_key(recipient)
        });
        heap.extend(keep);
        discard.into_iter().map(|entry| entry.unit).collect()
    }

    /// Wakes all takers and returns whatever is still queued. Returned
    /// units stay in the persister for the next run.
    pub fn shutdown(&self) -> Vec<DelayableMessage> {
        self.accepting.store(false, Ordering::SeqCst);
        self.shut_down.store(true, Ordering::SeqCst);
        let remaining: Vec<DelayableMessage> = {
            let mut heap = self.heap.lock();
            std::mem::take(&mut *heap)
                .into_sorted_vec()
                .into_iter()
                .rev()
                .map(|entry| entry.unit)
                .collect()
        };
        self.notify.notify_waiters();
        info!(queue_id = %self.queue_id, remaining = remaining.len(), "Message queue shut down");
        remaining
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}
