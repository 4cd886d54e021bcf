//! In-memory broker used by the test suite.
//!
//! It models the parts of RabbitMQ the pipeline depends on:
//! - named queues with a durability flag, declared idempotently
//! - persistent vs transient messages, and what survives a broker restart
//! - per-connection prefetch and unacknowledged-delivery tracking
//! - requeue (with the `redelivered` flag) when a connection goes away or a
//!   delivery is rejected
//!
//! Fault injection hooks let tests fail connection attempts and acks.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{BrokerConnection, Connector, Delivery};
use crate::utils::{RelayError, RelayResult};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    persistent: bool,
    redelivered: bool,
}

#[derive(Debug, Clone)]
struct PendingMessage {
    message: StoredMessage,
    connection: u64,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, PendingMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    next_tag: u64,
    next_connection: u64,
    /// Bumped by `restart`; connections from an older epoch are dead.
    epoch: u64,
    connect_attempts: u32,
    fail_connects: u32,
    fail_acks: u32,
    max_unacked_per_connection: usize,
}

impl BrokerState {
    fn unacked_for(&self, connection: u64) -> usize {
        self.queues
            .values()
            .flat_map(|q| q.unacked.values())
            .filter(|p| p.connection == connection)
            .count()
    }

    fn requeue_connection(&mut self, connection: u64) {
        for queue in self.queues.values_mut() {
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, p)| p.connection == connection)
                .map(|(tag, _)| *tag)
                .collect();
            // Newest first so the oldest ends up at the head again.
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                if let Some(mut pending) = queue.unacked.remove(&tag) {
                    pending.message.redelivered = true;
                    queue.ready.push_front(pending.message);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panicking test thread must not hide the broker from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().fail_connects = count;
    }

    /// The next `count` acks fail as if the connection dropped.
    pub fn fail_next_acks(&self, count: u32) {
        self.lock().fail_acks = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Messages waiting in `queue`, not counting unacknowledged ones.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.lock().queues.get(queue).map(|q| q.durable)
    }

    /// Highest number of deliveries any single connection held unacknowledged.
    pub fn max_unacked_per_connection(&self) -> usize {
        self.lock().max_unacked_per_connection
    }

    /// Enqueues a raw body, bypassing the codec.
    pub fn inject(&self, queue: &str, body: &[u8]) {
        let mut state = self.lock();
        let queue = state.queues.entry(queue.to_string()).or_insert_with(|| MemoryQueue {
            durable: true,
            ..Default::default()
        });
        queue.ready.push_back(StoredMessage {
            body: body.to_vec(),
            persistent: true,
            redelivered: false,
        });
        drop(state);
        self.notify.notify_waiters();
    }

    /// Simulates a broker restart: open connections die, transient queues
    /// vanish, and only persistent messages survive in durable queues.
    pub fn restart(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.queues.retain(|_, q| q.durable);
        for queue in state.queues.values_mut() {
            let mut pending: Vec<_> = queue.unacked.drain().collect();
            pending.sort_unstable_by(|a, b| b.0.cmp(&a.0));
            for (_, mut p) in pending {
                p.message.redelivered = true;
                queue.ready.push_front(p.message);
            }
            queue.ready.retain(|m| m.persistent);
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self) -> RelayResult<MemoryConnection> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(RelayError::Connection("connection refused".to_string()));
        }
        state.next_connection += 1;
        Ok(MemoryConnection {
            broker: self.clone(),
            id: state.next_connection,
            epoch: state.epoch,
            prefetch: 0,
            consuming: None,
            closed: false,
        })
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    epoch: u64,
    /// `0` means unlimited, as in AMQP.
    prefetch: u16,
    consuming: Option<String>,
    closed: bool,
}

impl MemoryConnection {
    fn live_state(&self) -> RelayResult<MutexGuard<'_, BrokerState>> {
        let state = self.broker.lock();
        if self.closed {
            return Err(RelayError::Connection("connection closed".to_string()));
        }
        if state.epoch != self.epoch {
            return Err(RelayError::Connection("connection reset by broker".to_string()));
        }
        Ok(state)
    }

    fn try_take(&self, queue_name: &str) -> RelayResult<Option<Delivery>> {
        let mut state = self.live_state()?;
        let held = state.unacked_for(self.id);
        if self.prefetch != 0 && held >= usize::from(self.prefetch) {
            return Ok(None);
        }
        let Some(message) = state
            .queues
            .get_mut(queue_name)
            .and_then(|q| q.ready.pop_front())
        else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery {
            tag,
            body: message.body.clone(),
            redelivered: message.redelivered,
        };
        if let Some(queue) = state.queues.get_mut(queue_name) {
            queue.unacked.insert(
                tag,
                PendingMessage {
                    message,
                    connection: self.id,
                },
            );
        }
        state.max_unacked_per_connection = state.max_unacked_per_connection.max(held + 1);
        Ok(Some(delivery))
    }

    fn settle(&self, tag: u64, requeue: bool) -> RelayResult<()> {
        let mut state = self.live_state()?;
        let queue = state
            .queues
            .values_mut()
            .find(|q| q.unacked.get(&tag).is_some_and(|p| p.connection == self.id))
            .ok_or_else(|| {
                RelayError::Connection(format!("PRECONDITION_FAILED - unknown delivery tag {tag}"))
            })?;
        if let Some(mut pending) = queue.unacked.remove(&tag) {
            if requeue {
                pending.message.redelivered = true;
                queue.ready.push_front(pending.message);
            }
        }
        drop(state);
        if requeue {
            self.broker.notify.notify_waiters();
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.broker.lock();
        if state.epoch == self.epoch {
            state.requeue_connection(self.id);
        }
        drop(state);
        self.broker.notify.notify_waiters();
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_queue(&mut self, queue: &str, durable: bool) -> RelayResult<()> {
        let mut state = self.live_state()?;
        if let Some(existing) = state.queues.get(queue) {
            if existing.durable != durable {
                return Err(RelayError::QueueConflict {
                    queue: queue.to_string(),
                    reason: format!(
                        "PRECONDITION_FAILED - inequivalent arg 'durable' (existing {}, requested {})",
                        existing.durable, durable
                    ),
                });
            }
            return Ok(());
        }
        state.queues.insert(
            queue.to_string(),
            MemoryQueue {
                durable,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn publish(&mut self, queue: &str, body: &[u8], persistent: bool) -> RelayResult<()> {
        let mut state = self.live_state()?;
        // The default exchange silently drops messages for unknown queues.
        if let Some(q) = state.queues.get_mut(queue) {
            q.ready.push_back(StoredMessage {
                body: body.to_vec(),
                persistent,
                redelivered: false,
            });
        }
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn set_prefetch(&mut self, count: u16) -> RelayResult<()> {
        self.live_state()?;
        self.prefetch = count;
        Ok(())
    }

    async fn consume(&mut self, queue: &str) -> RelayResult<()> {
        let state = self.live_state()?;
        if !state.queues.contains_key(queue) {
            return Err(RelayError::Connection(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }
        drop(state);
        self.consuming = Some(queue.to_string());
        Ok(())
    }

    async fn next_delivery(&mut self) -> RelayResult<Option<Delivery>> {
        let queue = self
            .consuming
            .clone()
            .ok_or_else(|| RelayError::Connection("not subscribed to any queue".to_string()))?;
        let notify = self.broker.notify.clone();
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(delivery) = self.try_take(&queue)? {
                return Ok(Some(delivery));
            }
            notified.await;
        }
    }

    async fn ack(&mut self, tag: u64) -> RelayResult<()> {
        {
            let mut state = self.live_state()?;
            if state.fail_acks > 0 {
                state.fail_acks -= 1;
                return Err(RelayError::Connection("connection lost during ack".to_string()));
            }
        }
        self.settle(tag, false)
    }

    async fn reject(&mut self, tag: u64, requeue: bool) -> RelayResult<()> {
        self.settle(tag, requeue)
    }

    async fn close(&mut self) -> RelayResult<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release();
    }
}
