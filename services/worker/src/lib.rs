//! Vidframe Worker
//!
//! Turns uploaded videos into downloadable frame archives. The worker
//! consumes upload notifications from Kafka, samples frames from each video
//! with ffmpeg, packs them into a ZIP archive, stores the archive in S3 and
//! tracks every video's progress in PostgreSQL.
//!
//! ## Features
//!
//! - **Bounded ingestion**: a semaphore gate caps how many videos are
//!   processed at once and applies backpressure to the consumer
//! - **Streaming frame extraction**: video bytes are piped through the
//!   transcoder and the JPEG stream it emits is split and decoded on the fly
//! - **In-memory archives**: frames are encoded into a seekable ZIP blob that
//!   is uploaded without touching the local disk
//! - **Status tracking**: each video moves through
//!   `Received → Processing → Completed | Failed` with the outcome recorded
//! - **Status API**: owners list their videos and download finished archives
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topic                                          PostgreSQL
//! ┌──────────────┐                                    ┌──────────────┐
//! │ Uploaded     │                                    │ users        │
//! │ Videos       │                                    │ files        │
//! └──────────────┘                                    └──────────────┘
//!        │                                                   ▲
//!        ▼                                                   │
//! ┌──────────────┐   record (Received)                      │
//! │ Ingestor     │──────────────────────────────────────────┤
//! │ (gate)       │                                           │
//! └──────────────┘                                           │
//!        │ spawn                                             │
//!        ▼                                                   │
//! ┌──────────────┐   status updates                         │
//! │ Orchestrator │───────────────────────────────────────────┘
//! └──────────────┘
//!   │    │    │
//!   │    │    └───────────────┐
//!   │    ▼                    ▼
//!   │  ┌──────────────┐   ┌──────────────┐
//!   │  │ Frame        │   │ Archive      │
//!   │  │ Extractor    │   │ Builder      │
//!   │  └──────────────┘   └──────────────┘
//!   ▼
//! ┌──────────────┐         ┌──────────────┐
//! │ S3           │◀────────│ Status API   │
//! │ Storage      │         │ (axum)       │
//! └──────────────┘         └──────────────┘
//! ```

pub mod api;
pub mod archive;
pub mod config;
pub mod frame_extractor;
pub mod ingest;
pub mod kafka_consumer;
pub mod metadata_store;
pub mod model;
pub mod orchestrator;
pub mod s3_storage;

pub use api::{AppState, ServiceInfo};
pub use archive::{build_archive, ArchiveBlob, ArchiveError};
pub use config::Config;
pub use frame_extractor::{ExtractionError, FrameExtractor, FrameSource, FrameTokenizer};
pub use ingest::{Acknowledger, IncomingMessage, IngestOutcome, Ingestor};
pub use kafka_consumer::KafkaSource;
pub use metadata_store::{FileRepository, MetadataStore, RepositoryError};
pub use model::{FileRecord, FileStatus, Owner, ProcessingResult, WorkItem};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use s3_storage::{ObjectStorage, S3Storage, StorageError, StoredObject};
