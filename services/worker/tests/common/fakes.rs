//! In-memory collaborators with the same observable behavior as the real
//! adapters.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use image::{DynamicImage, Rgb, RgbImage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use vidframe_worker::frame_extractor::ExtractionError;
use vidframe_worker::ingest::AckError;
use vidframe_worker::model::normalize_key;
use vidframe_worker::{
    Acknowledger, ArchiveBlob, FileRecord, FileRepository, FileStatus, FrameSource,
    IncomingMessage, ObjectStorage, Owner, ProcessingResult, RepositoryError, StorageError,
    StoredObject,
};

/// Object storage backed by a map of normalized keys
#[derive(Default)]
pub struct InMemoryStorage {
    objects: Mutex<HashMap<String, Bytes>>,
}

impl InMemoryStorage {
    pub fn with_object(self, key: &str, data: impl Into<Bytes>) -> Self {
        self.objects
            .lock()
            .unwrap()
            .insert(normalize_key(key), data.into());
        self
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStorage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<StoredObject, StorageError> {
        let key = normalize_key(key);
        self.objects
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .map(|data| StoredObject {
                data,
                metadata: HashMap::new(),
            })
            .ok_or(StorageError::NotFound(key))
    }

    async fn put(
        &self,
        key: &str,
        blob: ArchiveBlob,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let key = normalize_key(key);
        self.objects.lock().unwrap().insert(key.clone(), blob.bytes());
        Ok(key)
    }
}

/// File repository keeping records and the order of status updates
#[derive(Default)]
pub struct InMemoryRepository {
    owners: Mutex<HashMap<String, Owner>>,
    records: Mutex<HashMap<Uuid, FileRecord>>,
    history: Mutex<Vec<(Uuid, FileStatus)>>,
}

impl InMemoryRepository {
    pub fn with_owner(self, email: &str) -> Self {
        let owner = Owner {
            id: Uuid::new_v4(),
            name: email.split('@').next().unwrap_or(email).to_string(),
            email: email.to_string(),
            created_at: Utc::now(),
            updated_at: None,
        };
        self.owners.lock().unwrap().insert(email.to_string(), owner);
        self
    }

    pub fn record(&self, id: Uuid) -> Option<FileRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Statuses persisted for `id`, in the order they were written
    pub fn history(&self, id: Uuid) -> Vec<FileStatus> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(record_id, _)| *record_id == id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl FileRepository for InMemoryRepository {
    async fn find_owner_by_email(&self, email: &str) -> Result<Owner, RepositoryError> {
        self.owners
            .lock()
            .unwrap()
            .get(email)
            .cloned()
            .ok_or_else(|| RepositoryError::OwnerNotFound(email.to_string()))
    }

    async fn create_file_record(
        &self,
        owner_id: Uuid,
        video_path: &str,
        video_size_bytes: i64,
    ) -> Result<Uuid, RepositoryError> {
        let id = Uuid::new_v4();
        let record = FileRecord {
            id,
            owner_id,
            video_path: video_path.to_string(),
            video_size_bytes,
            archive_path: None,
            archive_size_bytes: None,
            status: FileStatus::Received,
            result_message: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.records.lock().unwrap().insert(id, record);
        self.history.lock().unwrap().push((id, FileStatus::Received));
        Ok(id)
    }

    async fn update_file_status(
        &self,
        id: Uuid,
        result: &ProcessingResult,
    ) -> Result<(), RepositoryError> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(&id).ok_or(RepositoryError::RecordNotFound(id))?;

        record.status = result.status;
        record.archive_path = result.archive_path.clone();
        record.archive_size_bytes = result.archive_size_bytes;
        record.result_message = Some(result.message.clone());
        record.updated_at = Some(Utc::now());

        self.history.lock().unwrap().push((id, result.status));
        Ok(())
    }

    async fn list_records_by_owner_email(
        &self,
        email: &str,
    ) -> Result<Vec<FileRecord>, RepositoryError> {
        let Some(owner_id) = self.owners.lock().unwrap().get(email).map(|o| o.id) else {
            return Ok(Vec::new());
        };
        let mut records: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|record| record.owner_id == owner_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// Frame source returning `count` solid frames after `delay`, tracking how
/// many extractions overlap
pub struct StubFrames {
    count: usize,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl StubFrames {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for StubFrames {
    async fn extract_frames(
        &self,
        video: Bytes,
        _sampling_rate_hz: f64,
    ) -> Result<Vec<DynamicImage>, ExtractionError> {
        if video.is_empty() {
            return Err(ExtractionError::EmptyInput);
        }

        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok((0..self.count).map(|i| solid_frame((i as u8).wrapping_mul(40))).collect())
    }
}

pub fn solid_frame(shade: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 18, Rgb([shade, 128, 255 - shade])))
}

/// Acknowledger remembering acknowledged offsets
#[derive(Default)]
pub struct RecordingAck {
    offsets: Mutex<Vec<i64>>,
}

impl RecordingAck {
    pub fn offsets(&self) -> Vec<i64> {
        self.offsets.lock().unwrap().clone()
    }
}

impl Acknowledger for RecordingAck {
    fn acknowledge(&self, message: &IncomingMessage) -> Result<(), AckError> {
        self.offsets.lock().unwrap().push(message.offset);
        Ok(())
    }
}

pub fn work_item_json(email: &str, path: &str, size: i64) -> String {
    serde_json::json!({
        "user_name": email,
        "file_path": path,
        "file_size": size,
    })
    .to_string()
}

pub fn message(offset: i64, payload: &str) -> IncomingMessage {
    IncomingMessage {
        payload: Some(payload.as_bytes().to_vec()),
        key: None,
        topic: "vidframe.videos.uploaded".to_string(),
        partition: 0,
        offset,
    }
}
