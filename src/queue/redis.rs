//! Redis-backed durable queue using the reliable-list pattern.
//!
//! Each queue is two lists: `<prefix>:<queue>` holds ready messages and
//! `<prefix>:<queue>:processing` holds messages handed to a consumer but
//! not yet acknowledged. `BLMOVE` transfers a message atomically from ready
//! to processing; ack removes it from processing. Anything left in
//! processing by a crashed consumer is moved back on the next `declare`.

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use tracing::{debug, info};

use super::{Acker, Delivery, DeliveryStream, QueueError, QueueResult, QueueTransport};

const KEY_PREFIX: &str = "file-ingest";

/// Seconds each `BLMOVE` blocks before the consumer loop polls again.
const BLOCK_TIMEOUT_SECS: f64 = 1.0;

#[derive(Clone)]
pub struct RedisQueue {
    pool: Pool,
}

#[derive(Clone)]
struct QueueKeys {
    ready: String,
    processing: String,
}

impl QueueKeys {
    fn new(queue: &str) -> Self {
        Self {
            ready: format!("{}:{}", KEY_PREFIX, queue),
            processing: format!("{}:{}:processing", KEY_PREFIX, queue),
        }
    }
}

fn backend(err: ::redis::RedisError) -> QueueError {
    QueueError::Backend(err.to_string())
}

async fn conn(pool: &Pool) -> QueueResult<deadpool_redis::Connection> {
    pool.get()
        .await
        .map_err(|e| QueueError::Connection(e.to_string()))
}

impl RedisQueue {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let pool = Config::from_url(url).create_pool(Some(Runtime::Tokio1))?;
        Ok(Self { pool })
    }
}

struct RedisAcker {
    pool: Pool,
    keys: QueueKeys,
    payload: Vec<u8>,
}

#[async_trait]
impl Acker for RedisAcker {
    async fn ack(self: Box<Self>) -> QueueResult<()> {
        let mut conn = conn(&self.pool).await?;
        ::redis::cmd("LREM")
            .arg(&self.keys.processing)
            .arg(1)
            .arg(&self.payload)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> QueueResult<()> {
        let mut conn = conn(&self.pool).await?;
        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(&self.keys.processing)
            .arg(1)
            .arg(&self.payload)
            .ignore();
        if requeue {
            pipe.cmd("LPUSH")
                .arg(&self.keys.ready)
                .arg(&self.payload)
                .ignore();
        }
        pipe.exec_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for RedisQueue {
    /// Lists need no creation; declaring recovers deliveries stranded in
    /// the processing list.
    async fn declare(&self, queue: &str) -> QueueResult<()> {
        let keys = QueueKeys::new(queue);
        let mut conn = conn(&self.pool).await?;
        let mut recovered = 0usize;
        loop {
            let moved: Option<Vec<u8>> = ::redis::cmd("LMOVE")
                .arg(&keys.processing)
                .arg(&keys.ready)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await
                .map_err(backend)?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!(queue, recovered, "requeued unacknowledged messages");
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> QueueResult<()> {
        let keys = QueueKeys::new(queue);
        let mut conn = conn(&self.pool).await?;
        ::redis::cmd("LPUSH")
            .arg(&keys.ready)
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> QueueResult<DeliveryStream> {
        let keys = QueueKeys::new(queue);
        let pool = self.pool.clone();
        let stream = futures::stream::unfold((pool, keys), |(pool, keys)| async move {
            loop {
                let mut conn = match conn(&pool).await {
                    Ok(conn) => conn,
                    Err(err) => return Some((Err(err), (pool, keys))),
                };
                let moved: Result<Option<Vec<u8>>, _> = ::redis::cmd("BLMOVE")
                    .arg(&keys.ready)
                    .arg(&keys.processing)
                    .arg("RIGHT")
                    .arg("LEFT")
                    .arg(BLOCK_TIMEOUT_SECS)
                    .query_async(&mut conn)
                    .await;
                drop(conn);
                match moved {
                    Ok(Some(payload)) => {
                        debug!(queue = %keys.ready, bytes = payload.len(), "received message");
                        let acker = RedisAcker {
                            pool: pool.clone(),
                            keys: keys.clone(),
                            payload: payload.clone(),
                        };
                        let delivery = Delivery::new(payload, Box::new(acker));
                        return Some((Ok(delivery), (pool, keys)));
                    }
                    Ok(None) => continue,
                    Err(err) => return Some((Err(backend(err)), (pool, keys))),
                }
            }
        });
        Ok(stream.boxed())
    }
}
