//! In-process queue for single-node deployments and tests.
//!
//! Mirrors broker semantics closely enough for the worker: FIFO per queue,
//! explicit ack/nack, and redelivery of deliveries that are dropped without
//! being settled.

use async_trait::async_trait;
use futures::StreamExt;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::Notify;

use super::{Acker, Delivery, DeliveryStream, QueueResult, QueueTransport};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Vec<u8>>,
    notify: Arc<Notify>,
}

type Queues = Arc<Mutex<HashMap<String, QueueState>>>;

#[derive(Clone, Default)]
pub struct MemoryQueue {
    queues: Queues,
}

#[cfg(test)]
impl MemoryQueue {
    /// Number of messages waiting (not in flight) on `queue`.
    pub fn pending(&self, queue: &str) -> usize {
        lock(&self.queues)
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }
}

fn lock(queues: &Queues) -> std::sync::MutexGuard<'_, HashMap<String, QueueState>> {
    queues.lock().unwrap_or_else(PoisonError::into_inner)
}

fn push(queues: &Queues, queue: &str, payload: Vec<u8>) {
    let mut guard = lock(queues);
    let state = guard.entry(queue.to_string()).or_default();
    state.ready.push_back(payload);
    state.notify.notify_one();
}

/// Pop the next message, or hand back the `Notify` to wait on.
fn try_pop(queues: &Queues, queue: &str) -> Result<Vec<u8>, Arc<Notify>> {
    let mut guard = lock(queues);
    let state = guard.entry(queue.to_string()).or_default();
    state.ready.pop_front().ok_or_else(|| state.notify.clone())
}

struct MemoryAcker {
    queues: Queues,
    queue: String,
    /// Copy kept until settled so a dropped delivery can be requeued.
    payload: Option<Vec<u8>>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(mut self: Box<Self>) -> QueueResult<()> {
        self.payload = None;
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> QueueResult<()> {
        if let Some(payload) = self.payload.take() {
            if requeue {
                push(&self.queues, &self.queue, payload);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            push(&self.queues, &self.queue, payload);
        }
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn declare(&self, queue: &str) -> QueueResult<()> {
        lock(&self.queues).entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> QueueResult<()> {
        push(&self.queues, queue, payload);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> QueueResult<DeliveryStream> {
        let queues = self.queues.clone();
        let queue = queue.to_string();
        let stream = futures::stream::unfold((queues, queue), |(queues, queue)| async move {
            loop {
                match try_pop(&queues, &queue) {
                    Ok(payload) => {
                        let acker = MemoryAcker {
                            queues: queues.clone(),
                            queue: queue.clone(),
                            payload: Some(payload.clone()),
                        };
                        let delivery = Delivery::new(payload, Box::new(acker));
                        return Some((Ok(delivery), (queues, queue)));
                    }
                    Err(notify) => notify.notified().await,
                }
            }
        });
        Ok(stream.boxed())
    }
}
