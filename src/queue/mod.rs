//! Message queue transport shared by the upload path (publish) and the
//! thumbnail worker (consume).
//!
//! Delivery is at-least-once: a consumer settles every [`Delivery`] with
//! [`Delivery::ack`] once it is done, or [`Delivery::nack`] to hand it back.
//! Deliveries that are never acknowledged come back later.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{QueueBackend, QueueSettings};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),
    #[error("queue backend error: {0}")]
    Backend(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

pub type DeliveryStream = BoxStream<'static, QueueResult<Delivery>>;

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> QueueResult<()>;
    async fn nack(self: Box<Self>, requeue: bool) -> QueueResult<()>;
}

/// One message handed to a consumer.
pub struct Delivery {
    pub payload: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, acker: Box<dyn Acker>) -> Self {
        Self { payload, acker }
    }

    pub async fn ack(self) -> QueueResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> QueueResult<()> {
        self.acker.nack(requeue).await
    }
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Make sure `queue` exists. Safe to call repeatedly.
    async fn declare(&self, queue: &str) -> QueueResult<()>;

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> QueueResult<()>;

    /// Start consuming `queue`, one delivery at a time.
    async fn consume(&self, queue: &str) -> QueueResult<DeliveryStream>;
}

/// Build the process-wide transport handle.
pub fn build_queue(settings: &QueueSettings) -> anyhow::Result<Arc<dyn QueueTransport>> {
    match &settings.backend {
        QueueBackend::Memory => {
            tracing::info!("Using in-process thumbnail queue");
            Ok(Arc::new(memory::MemoryQueue::default()))
        }
        QueueBackend::Redis { url } => {
            let queue = redis::RedisQueue::new(url)?;
            tracing::info!("Using Redis thumbnail queue");
            Ok(Arc::new(queue))
        }
    }
}
