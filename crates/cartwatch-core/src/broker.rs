//! Broker transport: the partitioned, at-least-once event feed.
//!
//! The engine consumes raw JSON payloads through the [`Broker`] trait and
//! acknowledges each one only after the event has been applied to its
//! session (or deliberately dropped). Anything unacked at the time of a
//! crash is redelivered, so the downstream dedupe window is what turns
//! at-least-once delivery into exactly-once effects.
//!
//! [`MemoryBroker`] is the in-process implementation used by the CLI and
//! the tests: per-partition FIFO queues with offset tracking, redelivery of
//! unacked payloads, and injectable connection failures.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::error::BrokerError;
use crate::router::fnv1a;

/// One payload handed to the engine, with the coordinates needed to ack it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub partition: usize,
    pub offset: u64,
    pub payload: String,
}

/// A partitioned, at-least-once message transport.
///
/// Ordering is guaranteed within a partition only. Implementations must be
/// callable from multiple tasks.
pub trait Broker: Send + Sync {
    /// Pull up to `max` payloads. May return fewer, or none. Delivered
    /// payloads stay in-flight until acked.
    fn poll(&self, max: usize) -> Result<Vec<Delivery>, BrokerError>;

    /// Acknowledge a delivery; the broker forgets it.
    fn ack(&self, partition: usize, offset: u64) -> Result<(), BrokerError>;

    /// Payloads not yet delivered.
    fn ready(&self) -> usize;

    /// Payloads delivered but not yet acked (consumer lag proxy).
    fn in_flight(&self) -> usize;
}

#[derive(Debug, Default)]
struct PartitionQueue {
    next_offset: u64,
    ready: VecDeque<(u64, String)>,
    in_flight: BTreeMap<u64, String>,
}

#[derive(Debug, Default)]
struct BrokerInner {
    partitions: Vec<PartitionQueue>,
    /// Next partition to poll first (round-robin fairness).
    cursor: usize,
    /// Remaining injected poll failures.
    fail_polls: u32,
}

/// In-process broker with per-partition FIFO ordering.
#[derive(Debug)]
pub struct MemoryBroker {
    inner: Mutex<BrokerInner>,
}

impl MemoryBroker {
    /// Create a broker with `partitions` ordered queues.
    #[must_use]
    pub fn new(partitions: usize) -> Self {
        let mut queues = Vec::with_capacity(partitions.max(1));
        queues.resize_with(partitions.max(1), PartitionQueue::default);
        Self {
            inner: Mutex::new(BrokerInner {
                partitions: queues,
                cursor: 0,
                fail_polls: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Publish a payload, partitioned by key so payloads sharing a key stay
    /// ordered relative to each other.
    pub fn publish(&self, key: &str, payload: impl Into<String>) {
        let mut inner = self.lock();
        let n = inner.partitions.len() as u64;
        let idx = (fnv1a(key.as_bytes()) % n) as usize;
        let queue = &mut inner.partitions[idx];
        let offset = queue.next_offset;
        queue.next_offset += 1;
        queue.ready.push_back((offset, payload.into()));
    }

    /// Publish to an explicit partition, mainly for tests.
    pub fn publish_to(&self, partition: usize, payload: impl Into<String>) {
        let mut inner = self.lock();
        let idx = partition % inner.partitions.len();
        let queue = &mut inner.partitions[idx];
        let offset = queue.next_offset;
        queue.next_offset += 1;
        queue.ready.push_back((offset, payload.into()));
    }

    /// Make the next `count` polls fail with [`BrokerError::ConnectionLost`].
    pub fn fail_next_polls(&self, count: u32) {
        self.lock().fail_polls = count;
    }

    /// Move every in-flight payload back to the front of its partition, in
    /// offset order. Models a consumer crash before ack.
    pub fn redeliver_unacked(&self) {
        let mut inner = self.lock();
        for queue in &mut inner.partitions {
            // BTreeMap iterates in ascending offset order; prepend in reverse
            // to keep the queue sorted.
            let unacked = std::mem::take(&mut queue.in_flight);
            for (offset, payload) in unacked.into_iter().rev() {
                queue.ready.push_front((offset, payload));
            }
        }
    }
}

impl Broker for MemoryBroker {
    fn poll(&self, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        let mut inner = self.lock();
        if inner.fail_polls > 0 {
            inner.fail_polls -= 1;
            return Err(BrokerError::ConnectionLost("injected failure".to_string()));
        }

        let n = inner.partitions.len();
        let start = inner.cursor;
        inner.cursor = (inner.cursor + 1) % n;

        let mut out = Vec::new();
        for i in 0..n {
            let idx = (start + i) % n;
            let queue = &mut inner.partitions[idx];
            while out.len() < max {
                let Some((offset, payload)) = queue.ready.pop_front() else {
                    break;
                };
                queue.in_flight.insert(offset, payload.clone());
                out.push(Delivery {
                    partition: idx,
                    offset,
                    payload,
                });
            }
            if out.len() >= max {
                break;
            }
        }
        Ok(out)
    }

    fn ack(&self, partition: usize, offset: u64) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        let queue = inner
            .partitions
            .get_mut(partition)
            .ok_or(BrokerError::BadAck { partition, offset })?;
        if queue.in_flight.remove(&offset).is_none() {
            return Err(BrokerError::BadAck { partition, offset });
        }
        Ok(())
    }

    fn ready(&self) -> usize {
        self.lock().partitions.iter().map(|q| q.ready.len()).sum()
    }

    fn in_flight(&self) -> usize {
        self.lock()
            .partitions
            .iter()
            .map(|q| q.in_flight.len())
            .sum()
    }
}
