use crate::archive::{build_archive, ArchiveError};
use crate::config::ProcessingConfig;
use crate::frame_extractor::{ExtractionError, FrameSource};
use crate::metadata_store::FileRepository;
use crate::model::{FileStatus, ProcessingResult, WorkItem};
use crate::s3_storage::{ObjectStorage, StorageError, ZIP_CONTENT_TYPE};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Stage at which a video failed; the display text becomes the record's message
#[derive(Debug, Error)]
enum PipelineError {
    #[error("failed to fetch video: {0}")]
    Fetch(#[source] StorageError),

    #[error("failed to extract frames: {0}")]
    Extract(#[source] ExtractionError),

    #[error("failed to build archive: {0}")]
    Archive(#[source] ArchiveError),

    #[error("failed to build archive: worker task failed: {0}")]
    ArchiveTask(#[source] tokio::task::JoinError),

    #[error("failed to upload archive: {0}")]
    Upload(#[source] StorageError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub sampling_rate_hz: f64,
    pub jpeg_quality: u8,
}

impl From<&ProcessingConfig> for OrchestratorSettings {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            sampling_rate_hz: config.sampling_rate_hz,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

/// Local view of a record's status; only legal transitions are applied
#[derive(Debug)]
struct FileLifecycle {
    record_id: Uuid,
    status: FileStatus,
}

impl FileLifecycle {
    fn new(record_id: Uuid) -> Self {
        Self {
            record_id,
            status: FileStatus::Received,
        }
    }

    fn advance(&mut self, next: FileStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Runs one work item from download to archived result
pub struct Orchestrator {
    storage: Arc<dyn ObjectStorage>,
    repository: Arc<dyn FileRepository>,
    frames: Arc<dyn FrameSource>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        repository: Arc<dyn FileRepository>,
        frames: Arc<dyn FrameSource>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            storage,
            repository,
            frames,
            settings,
        }
    }

    /// Process `item` for the already created record and return the final status.
    ///
    /// Every outcome is persisted on a best-effort basis; persistence failures
    /// are logged and never retried.
    #[instrument(skip(self, item), fields(record_id = %record_id, video = %item.file_path))]
    pub async fn run(&self, record_id: Uuid, item: WorkItem) -> FileStatus {
        let started = Instant::now();
        let mut lifecycle = FileLifecycle::new(record_id);

        self.record(&mut lifecycle, ProcessingResult::processing()).await;

        let result = match self.process(&item).await {
            Ok(result) => {
                info!(
                    archive = ?result.archive_path,
                    size_bytes = ?result.archive_size_bytes,
                    message = %result.message,
                    "Video processed"
                );
                metrics::counter!("worker.items.completed").increment(1);
                result
            }
            Err(e) => {
                warn!(error = %e, "Video processing failed");
                metrics::counter!("worker.items.failed").increment(1);
                ProcessingResult::failed(e.to_string())
            }
        };

        self.record(&mut lifecycle, result).await;
        metrics::histogram!("worker.pipeline.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        lifecycle.status
    }

    async fn process(&self, item: &WorkItem) -> Result<ProcessingResult, PipelineError> {
        let video = self
            .storage
            .get(&item.file_path)
            .await
            .map_err(PipelineError::Fetch)?;

        let frames = self
            .frames
            .extract_frames(video.data, self.settings.sampling_rate_hz)
            .await
            .map_err(PipelineError::Extract)?;
        if frames.is_empty() {
            return Err(PipelineError::Extract(ExtractionError::NoFrames));
        }
        let frame_count = frames.len();

        let quality = self.settings.jpeg_quality;
        let blob = tokio::task::spawn_blocking(move || build_archive(&frames, quality))
            .await
            .map_err(PipelineError::ArchiveTask)?
            .map_err(PipelineError::Archive)?;
        let size_bytes = blob.len() as i64;

        let archive_path = self
            .storage
            .put(&item.archive_key(), blob, ZIP_CONTENT_TYPE)
            .await
            .map_err(PipelineError::Upload)?;

        Ok(ProcessingResult::completed(archive_path, size_bytes, frame_count))
    }

    async fn record(&self, lifecycle: &mut FileLifecycle, result: ProcessingResult) {
        let from = lifecycle.status;
        if !lifecycle.advance(result.status) {
            warn!(
                record_id = %lifecycle.record_id,
                from = %from,
                to = %result.status,
                "Skipping illegal status transition"
            );
            return;
        }

        if let Err(e) = self
            .repository
            .update_file_status(lifecycle.record_id, &result)
            .await
        {
            error!(
                record_id = %lifecycle.record_id,
                status = %result.status,
                error = %e,
                "Failed to persist file status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_extractor::MockFrameSource;
    use crate::metadata_store::{MockFileRepository, RepositoryError};
    use crate::s3_storage::{MockObjectStorage, StoredObject};
    use bytes::Bytes;
    use image::{DynamicImage, Rgb, RgbImage};
    use mockall::Sequence;

    fn item() -> WorkItem {
        WorkItem {
            user_name: "a@b.com".to_string(),
            file_path: "videos/x.mp4".to_string(),
            file_size: 1000,
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            sampling_rate_hz: 1.0,
            jpeg_quality: 90,
        }
    }

    fn frame() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([9, 9, 9])))
    }

    fn video_storage() -> MockObjectStorage {
        let mut storage = MockObjectStorage::new();
        storage.expect_get().returning(|_| {
            Ok(StoredObject {
                data: Bytes::from_static(b"video"),
                ..Default::default()
            })
        });
        storage
    }

    #[test]
    fn test_lifecycle_rejects_illegal_transitions() {
        let mut lifecycle = FileLifecycle::new(Uuid::new_v4());
        assert!(!lifecycle.advance(FileStatus::Completed));
        assert!(lifecycle.advance(FileStatus::Processing));
        assert!(!lifecycle.advance(FileStatus::Received));
        assert!(lifecycle.advance(FileStatus::Failed));
        assert!(!lifecycle.advance(FileStatus::Processing));
        assert_eq!(lifecycle.status, FileStatus::Failed);
    }

    #[tokio::test]
    async fn test_successful_run_persists_processing_then_completed() {
        let record_id = Uuid::new_v4();

        let mut storage = video_storage();
        storage
            .expect_put()
            .withf(|key, blob, content_type| {
                key == "a_b_com/zip_files/frames_x.zip" && !blob.is_empty() && content_type == "application/zip"
            })
            .returning(|key, _, _| Ok(key.to_string()));

        let mut frames = MockFrameSource::new();
        frames
            .expect_extract_frames()
            .returning(|_, _| Ok(vec![frame(), frame(), frame()]));

        let mut repository = MockFileRepository::new();
        let mut seq = Sequence::new();
        repository
            .expect_update_file_status()
            .withf(move |id, result| *id == record_id && result.status == FileStatus::Processing)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        repository
            .expect_update_file_status()
            .withf(|_, result| {
                result.status == FileStatus::Completed
                    && result.message == "3 frames extracted"
                    && result.archive_path.as_deref() == Some("a_b_com/zip_files/frames_x.zip")
                    && result.archive_size_bytes.unwrap_or(0) > 0
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let orchestrator = Orchestrator::new(
            Arc::new(storage),
            Arc::new(repository),
            Arc::new(frames),
            settings(),
        );

        assert_eq!(orchestrator.run(record_id, item()).await, FileStatus::Completed);
    }

    #[tokio::test]
    async fn test_fetch_failure_marks_failed_with_error_text() {
        let mut storage = MockObjectStorage::new();
        storage
            .expect_get()
            .returning(|key| Err(StorageError::NotFound(key.to_string())));
        storage.expect_put().never();

        let mut frames = MockFrameSource::new();
        frames.expect_extract_frames().never();

        let mut repository = MockFileRepository::new();
        repository
            .expect_update_file_status()
            .withf(|_, result| result.status == FileStatus::Processing)
            .times(1)
            .returning(|_, _| Ok(()));
        repository
            .expect_update_file_status()
            .withf(|_, result| {
                result.status == FileStatus::Failed
                    && result.message.starts_with("failed to fetch video: ")
                    && result.message.contains("object not found: videos/x.mp4")
                    && result.archive_path.is_none()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let orchestrator = Orchestrator::new(
            Arc::new(storage),
            Arc::new(repository),
            Arc::new(frames),
            settings(),
        );

        assert_eq!(orchestrator.run(Uuid::new_v4(), item()).await, FileStatus::Failed);
    }

    #[tokio::test]
    async fn test_zero_frames_marks_failed_without_upload() {
        let mut storage = video_storage();
        storage.expect_put().never();

        let mut frames = MockFrameSource::new();
        frames.expect_extract_frames().returning(|_, _| Ok(Vec::new()));

        let mut repository = MockFileRepository::new();
        repository
            .expect_update_file_status()
            .returning(|_, _| Ok(()));

        let orchestrator = Orchestrator::new(
            Arc::new(storage),
            Arc::new(repository),
            Arc::new(frames),
            settings(),
        );

        assert_eq!(orchestrator.run(Uuid::new_v4(), item()).await, FileStatus::Failed);
    }

    #[tokio::test]
    async fn test_upload_failure_marks_failed() {
        let mut storage = video_storage();
        storage
            .expect_put()
            .returning(|_, _, _| Err(StorageError::Request("bucket unavailable".to_string())));

        let mut frames = MockFrameSource::new();
        frames.expect_extract_frames().returning(|_, _| Ok(vec![frame()]));

        let mut repository = MockFileRepository::new();
        repository
            .expect_update_file_status()
            .withf(|_, result| result.status == FileStatus::Processing)
            .returning(|_, _| Ok(()));
        repository
            .expect_update_file_status()
            .withf(|_, result| {
                result.status == FileStatus::Failed
                    && result.message == "failed to upload archive: storage request failed: bucket unavailable"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let orchestrator = Orchestrator::new(
            Arc::new(storage),
            Arc::new(repository),
            Arc::new(frames),
            settings(),
        );

        assert_eq!(orchestrator.run(Uuid::new_v4(), item()).await, FileStatus::Failed);
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_stop_pipeline() {
        let mut storage = video_storage();
        storage
            .expect_put()
            .times(1)
            .returning(|key, _, _| Ok(key.to_string()));

        let mut frames = MockFrameSource::new();
        frames.expect_extract_frames().returning(|_, _| Ok(vec![frame()]));

        let mut repository = MockFileRepository::new();
        repository
            .expect_update_file_status()
            .times(2)
            .returning(|id, _| Err(RepositoryError::RecordNotFound(id)));

        let orchestrator = Orchestrator::new(
            Arc::new(storage),
            Arc::new(repository),
            Arc::new(frames),
            settings(),
        );

        assert_eq!(orchestrator.run(Uuid::new_v4(), item()).await, FileStatus::Completed);
    }
}
