use crate::metadata_store::{FileRepository, RepositoryError};
use crate::model::WorkItem;
use crate::orchestrator::Orchestrator;
use futures::{Stream, StreamExt};
use std::borrow::Cow;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Queue message detached from the consumer that delivered it
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub payload: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl IncomingMessage {
    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// Message key as text, for logging
    pub fn key_text(&self) -> Option<Cow<'_, str>> {
        self.key.as_deref().map(String::from_utf8_lossy)
    }
}

#[derive(Debug, Error)]
#[error("failed to acknowledge {topic}[{partition}]@{offset}: {reason}")]
pub struct AckError {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub reason: String,
}

/// Marks a message as consumed so it is not delivered again
pub trait Acknowledger: Send + Sync {
    fn acknowledge(&self, message: &IncomingMessage) -> Result<(), AckError>;
}

/// What happened to a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Payload could not be decoded; acknowledged and dropped
    Malformed,
    /// Decoded but no record could be created; acknowledged and dropped
    Rejected,
    /// Record created and processing scheduled
    Dispatched(Uuid),
}

/// Admission-controlled consumer loop.
///
/// At most `worker_limit` videos are processed at once. Once the gate is
/// full the loop stops pulling messages until a slot frees up.
pub struct Ingestor {
    gate: Arc<Semaphore>,
    capacity: usize,
    tracker: TaskTracker,
    repository: Arc<dyn FileRepository>,
    orchestrator: Arc<Orchestrator>,
}

impl Ingestor {
    pub fn new(
        repository: Arc<dyn FileRepository>,
        orchestrator: Arc<Orchestrator>,
        worker_limit: usize,
    ) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(worker_limit)),
            capacity: worker_limit,
            tracker: TaskTracker::new(),
            repository,
            orchestrator,
        }
    }

    /// Gate slots not held by in-flight work
    pub fn available_slots(&self) -> usize {
        self.gate.available_permits()
    }

    /// Number of dispatched items that have not finished
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Handle one message. Returns once the item is dispatched or dropped,
    /// not when processing finishes.
    #[instrument(skip_all, fields(topic = %message.topic, partition = message.partition, offset = message.offset))]
    pub async fn ingest(&self, message: &IncomingMessage, ack: &dyn Acknowledger) -> IngestOutcome {
        metrics::counter!("worker.messages.received").increment(1);

        let decoded = WorkItem::decode(message.payload());

        // Acknowledged before any processing: a crash from here on loses the item
        if let Err(e) = ack.acknowledge(message) {
            warn!(error = %e, "Failed to acknowledge message");
        }

        let item = match decoded {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, key = ?message.key_text(), "Dropping malformed message");
                metrics::counter!("worker.messages.malformed").increment(1);
                return IngestOutcome::Malformed;
            }
        };

        debug!(
            key = ?message.key_text(),
            owner = %item.user_name,
            video = %item.file_path,
            "Work item received"
        );

        let permit = match self.gate.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("Admission gate closed");
                return IngestOutcome::Rejected;
            }
        };

        let record_id = match self.create_record(&item).await {
            Ok(id) => id,
            Err(e) => {
                match &e {
                    RepositoryError::OwnerNotFound(_) => warn!(error = %e, "Dropping work item"),
                    _ => error!(error = %e, "Failed to create file record"),
                }
                metrics::counter!("worker.messages.rejected").increment(1);
                return IngestOutcome::Rejected;
            }
        };

        let orchestrator = Arc::clone(&self.orchestrator);
        self.tracker.spawn(async move {
            // Released when the task ends, including on panic
            let _permit = permit;
            orchestrator.run(record_id, item).await;
        });

        IngestOutcome::Dispatched(record_id)
    }

    async fn create_record(&self, item: &WorkItem) -> Result<Uuid, RepositoryError> {
        let owner = self.repository.find_owner_by_email(&item.user_name).await?;
        let record_id = self
            .repository
            .create_file_record(owner.id, &item.file_path, item.file_size)
            .await?;

        info!(record_id = %record_id, owner_id = %owner.id, "File record created");
        Ok(record_id)
    }

    /// Consume `messages` until the stream ends or `shutdown` fires
    pub async fn run<S, E>(&self, messages: S, ack: &dyn Acknowledger, shutdown: CancellationToken)
    where
        S: Stream<Item = Result<IncomingMessage, E>>,
        E: Display,
    {
        let mut messages = std::pin::pin!(messages);
        info!(capacity = self.capacity, "Ingestion loop started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer claiming messages");
                    break;
                }
                next = messages.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    self.ingest(&message, ack).await;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Message stream error");
                    metrics::counter!("worker.kafka.errors").increment(1);
                }
                None => {
                    info!("Message stream ended");
                    break;
                }
            }
        }
    }

    /// Stop accepting work and wait up to `timeout` for in-flight items.
    ///
    /// Returns `false` when items were still running at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let in_flight = self.tracker.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight videos");
        }

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    in_flight = self.tracker.len(),
                    timeout_secs = timeout.as_secs(),
                    "Drain timed out with videos still in flight"
                );
                false
            }
        }
    }
}
