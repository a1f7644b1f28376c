//! Worker wired to in-memory collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vidframe_worker::{FrameSource, IngestOutcome, Ingestor, Orchestrator, OrchestratorSettings};

use super::fakes::{message, InMemoryRepository, InMemoryStorage, RecordingAck};

/// Ingestor and orchestrator sharing fake storage and persistence.
pub struct WorkerHarness {
    pub storage: Arc<InMemoryStorage>,
    pub repository: Arc<InMemoryRepository>,
    pub ack: RecordingAck,
    pub ingestor: Ingestor,
}

impl WorkerHarness {
    pub fn new(
        storage: InMemoryStorage,
        repository: InMemoryRepository,
        frames: Arc<dyn FrameSource>,
        worker_limit: usize,
    ) -> Self {
        let storage = Arc::new(storage);
        let repository = Arc::new(repository);

        let orchestrator = Arc::new(Orchestrator::new(
            storage.clone(),
            repository.clone(),
            frames,
            OrchestratorSettings {
                sampling_rate_hz: 1.0,
                jpeg_quality: 90,
            },
        ));
        let ingestor = Ingestor::new(repository.clone(), orchestrator, worker_limit);

        Self {
            storage,
            repository,
            ack: RecordingAck::default(),
            ingestor,
        }
    }

    /// Hand one raw payload to the ingestor
    pub async fn deliver(&self, offset: i64, payload: &str) -> IngestOutcome {
        self.ingestor.ingest(&message(offset, payload), &self.ack).await
    }

    /// Wait for every dispatched item to finish
    pub async fn settle(&self) {
        assert!(
            self.ingestor.drain(Duration::from_secs(10)).await,
            "in-flight work did not finish"
        );
    }
}
