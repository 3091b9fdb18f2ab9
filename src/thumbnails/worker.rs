use futures::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::processor::{self, ProcessError};
use crate::{
    models::thumbnail::{ThumbnailEvent, thumbnail_key},
    queue::{Delivery, QueueTransport},
    storage::{BlobError, BlobStore, collect_stream, stream_from_bytes},
};

/// Pause before re-subscribing after the transport reports an error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How one event was handled; decides ack vs. nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed { stored: usize, failed: usize },
    /// Can never succeed on retry; acknowledged and dropped.
    Skipped(SkipReason),
    /// Transient failure; handed back to the queue.
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MalformedEvent,
    SourceMissing,
    Undecodable,
}

/// Consumes thumbnail events and writes the derived blobs.
#[derive(Clone)]
pub struct ThumbnailWorker {
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn QueueTransport>,
    queue_name: String,
}

impl ThumbnailWorker {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn QueueTransport>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            blobs,
            queue,
            queue_name: queue_name.into(),
        }
    }

    /// Consume until `shutdown` is cancelled. The delivery being processed
    /// when cancellation arrives is finished and settled first.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.queue.declare(&self.queue_name).await?;
        info!(queue = %self.queue_name, "thumbnail worker started");

        'subscribe: while !shutdown.is_cancelled() {
            let mut deliveries = match self.queue.consume(&self.queue_name).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(queue = %self.queue_name, error = %err, "cannot subscribe");
                    pause(&shutdown).await;
                    continue;
                }
            };
            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'subscribe,
                    next = deliveries.next() => next,
                };
                match next {
                    Some(Ok(delivery)) => self.settle(delivery).await,
                    Some(Err(err)) => {
                        warn!(queue = %self.queue_name, error = %err, "delivery failed");
                        pause(&shutdown).await;
                    }
                    None => {
                        warn!(queue = %self.queue_name, "delivery stream ended, resubscribing");
                        pause(&shutdown).await;
                        continue 'subscribe;
                    }
                }
            }
        }

        info!(queue = %self.queue_name, "thumbnail worker stopped");
        Ok(())
    }

    async fn settle(&self, delivery: Delivery) {
        let outcome = self.handle(&delivery.payload).await;
        let settled = match outcome {
            Outcome::Retry => delivery.nack(true).await,
            _ => delivery.ack().await,
        };
        if let Err(err) = settled {
            // The broker will redeliver; processing is idempotent.
            warn!(?outcome, error = %err, "could not settle delivery");
        }
    }

    /// Process one raw event payload.
    pub async fn handle(&self, payload: &[u8]) -> Outcome {
        let event: ThumbnailEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, bytes = payload.len(), "dropping malformed thumbnail event");
                return Outcome::Skipped(SkipReason::MalformedEvent);
            }
        };

        let source = match self.fetch(&event.storage_key).await {
            Ok(source) => source,
            Err(BlobError::NotFound(_) | BlobError::InvalidKey(_)) => {
                warn!(
                    file_id = %event.file_id,
                    storage_key = %event.storage_key,
                    "source blob missing, skipping"
                );
                return Outcome::Skipped(SkipReason::SourceMissing);
            }
            Err(err) => {
                warn!(
                    file_id = %event.file_id,
                    storage_key = %event.storage_key,
                    error = %err,
                    "source fetch failed, will retry"
                );
                return Outcome::Retry;
            }
        };

        let rendered = match processor::render_all(source).await {
            Ok(rendered) => rendered,
            Err(ProcessError::Decode(err)) => {
                info!(
                    file_id = %event.file_id,
                    mime_type = %event.mime_type,
                    error = %err,
                    "not a decodable image, skipping"
                );
                return Outcome::Skipped(SkipReason::Undecodable);
            }
            Err(err @ ProcessError::Aborted(_)) => {
                error!(file_id = %event.file_id, error = %err, "thumbnail rendering aborted, skipping");
                return Outcome::Skipped(SkipReason::Undecodable);
            }
        };

        let (mut stored, mut failed) = (0, 0);
        for out in rendered {
            let key = thumbnail_key(event.file_id, out.variant.name);
            let result = match out.png {
                Ok(png) => self
                    .blobs
                    .save(&key, stream_from_bytes(png))
                    .await
                    .map_err(|e| e.to_string()),
                Err(err) => Err(err.to_string()),
            };
            match result {
                Ok(written) => {
                    stored += 1;
                    debug!(file_id = %event.file_id, variant = out.variant.name, written, "thumbnail stored");
                }
                Err(err) => {
                    failed += 1;
                    warn!(
                        file_id = %event.file_id,
                        variant = out.variant.name,
                        storage_key = %key,
                        error = %err,
                        "thumbnail variant failed"
                    );
                }
            }
        }
        info!(file_id = %event.file_id, stored, failed, "thumbnails generated");
        Outcome::Processed { stored, failed }
    }

    async fn fetch(&self, key: &str) -> Result<bytes::Bytes, BlobError> {
        let stream = self.blobs.get(key).await?;
        Ok(collect_stream(stream).await?)
    }
}

async fn pause(shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::memory::MemoryQueue,
        storage::{BlobResult, ByteStream},
        testing::MemoryBlobStore,
        thumbnails::processor::tests::png_fixture,
    };
    use async_trait::async_trait;
    use image::GenericImageView;
    use uuid::Uuid;

    const QUEUE: &str = "thumbnail_generation";

    fn event_for(blobs: &MemoryBlobStore, data: Vec<u8>) -> (ThumbnailEvent, Vec<u8>) {
        let file_id = Uuid::new_v4();
        let event = ThumbnailEvent {
            file_id,
            storage_key: format!("{}.png", file_id),
            mime_type: "image/png".into(),
        };
        blobs.put(&event.storage_key, data);
        let payload = serde_json::to_vec(&event).unwrap();
        (event, payload)
    }

    fn worker(blobs: Arc<dyn BlobStore>, queue: MemoryQueue) -> ThumbnailWorker {
        ThumbnailWorker::new(blobs, Arc::new(queue), QUEUE)
    }

    #[tokio::test]
    async fn run_writes_both_variants_and_stops_on_cancel() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let queue = MemoryQueue::default();
        let (event, payload) = event_for(&blobs, png_fixture(900, 300));
        queue.publish(QUEUE, payload).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let worker = worker(blobs.clone(), queue.clone());
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        });

        let small = thumbnail_key(event.file_id, "small");
        let medium = thumbnail_key(event.file_id, "medium");
        tokio::time::timeout(Duration::from_secs(10), async {
            while blobs.read(&small).is_none() || blobs.read(&medium).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("thumbnails were not written");

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(queue.pending(QUEUE), 0);

        let small_img = image::load_from_memory(&blobs.read(&small).unwrap()).unwrap();
        assert_eq!(small_img.dimensions(), (150, 50));
        let medium_img = image::load_from_memory(&blobs.read(&medium).unwrap()).unwrap();
        assert_eq!(medium_img.dimensions(), (600, 200));
    }

    #[tokio::test]
    async fn redelivery_leaves_the_same_blobs() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let worker = worker(blobs.clone(), MemoryQueue::default());
        let (event, payload) = event_for(&blobs, png_fixture(320, 240));

        let first = worker.handle(&payload).await;
        assert_eq!(first, Outcome::Processed { stored: 2, failed: 0 });
        let snapshot: Vec<_> = blobs.keys().into_iter().map(|k| (blobs.read(&k), k)).collect();

        let second = worker.handle(&payload).await;
        assert_eq!(second, first);
        let after: Vec<_> = blobs.keys().into_iter().map(|k| (blobs.read(&k), k)).collect();
        assert_eq!(snapshot, after);
        assert_eq!(blobs.keys().len(), 3);
        assert!(blobs.read(&thumbnail_key(event.file_id, "small")).is_some());
    }

    #[tokio::test]
    async fn undecodable_source_is_skipped_and_acked() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let queue = MemoryQueue::default();
        let worker = worker(blobs.clone(), queue.clone());
        let (_, payload) = event_for(&blobs, b"\x89PNG\r\n\x1a\n\0\0".to_vec());

        assert_eq!(
            worker.handle(&payload).await,
            Outcome::Skipped(SkipReason::Undecodable)
        );

        queue.publish(QUEUE, payload).await.unwrap();
        let delivery = queue.consume(QUEUE).await.unwrap().next().await.unwrap().unwrap();
        worker.settle(delivery).await;
        assert_eq!(queue.pending(QUEUE), 0);
        assert_eq!(blobs.keys().len(), 1);
    }

    #[tokio::test]
    async fn malformed_and_orphaned_events_are_skipped() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let worker = worker(blobs.clone(), MemoryQueue::default());

        assert_eq!(
            worker.handle(b"{\"fileId\": 42}").await,
            Outcome::Skipped(SkipReason::MalformedEvent)
        );

        let orphan = ThumbnailEvent {
            file_id: Uuid::new_v4(),
            storage_key: "gone.png".into(),
            mime_type: "image/png".into(),
        };
        let payload = serde_json::to_vec(&orphan).unwrap();
        assert_eq!(
            worker.handle(&payload).await,
            Outcome::Skipped(SkipReason::SourceMissing)
        );
    }

    #[tokio::test]
    async fn transient_fetch_failure_is_requeued() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let queue = MemoryQueue::default();
        let worker = worker(blobs.clone(), queue.clone());
        let (_, payload) = event_for(&blobs, png_fixture(10, 10));
        blobs.fail_gets(true);

        queue.publish(QUEUE, payload).await.unwrap();
        let delivery = queue.consume(QUEUE).await.unwrap().next().await.unwrap().unwrap();
        worker.settle(delivery).await;
        assert_eq!(queue.pending(QUEUE), 1);
    }

    /// Rejects saves whose key contains `fragment`.
    struct SelectiveFailure {
        inner: Arc<MemoryBlobStore>,
        fragment: &'static str,
    }

    #[async_trait]
    impl BlobStore for SelectiveFailure {
        async fn save(&self, key: &str, content: ByteStream) -> BlobResult<u64> {
            if key.contains(self.fragment) {
                return Err(BlobError::Backend("disk full".into()));
            }
            self.inner.save(key, content).await
        }
        async fn get(&self, key: &str) -> BlobResult<ByteStream> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> BlobResult<()> {
            self.inner.delete(key).await
        }
        fn backend_name(&self) -> &'static str {
            "selective"
        }
    }

    #[tokio::test]
    async fn failed_variant_does_not_stop_the_others() {
        let inner = Arc::new(MemoryBlobStore::default());
        let store = Arc::new(SelectiveFailure {
            inner: inner.clone(),
            fragment: "/small.",
        });
        let worker = worker(store, MemoryQueue::default());
        let (event, payload) = event_for(&inner, png_fixture(700, 700));

        assert_eq!(
            worker.handle(&payload).await,
            Outcome::Processed { stored: 1, failed: 1 }
        );
        assert!(inner.read(&thumbnail_key(event.file_id, "small")).is_none());
        assert!(inner.read(&thumbnail_key(event.file_id, "medium")).is_some());
    }
}
