use crate::archive::ArchiveBlob;
use crate::config::S3Config;
use crate::model::normalize_key;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub const ZIP_CONTENT_TYPE: &str = "application/zip";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage request failed: {0}")]
    Request(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Object contents with the user metadata stored alongside it
#[derive(Debug, Clone, Default)]
pub struct StoredObject {
    pub data: Bytes,
    pub metadata: HashMap<String, String>,
}

/// Key/value blob store holding uploaded videos and generated archives
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<StoredObject, StorageError>;

    /// Store `blob` under the normalized form of `key` and return that key
    async fn put(
        &self,
        key: &str,
        blob: ArchiveBlob,
        content_type: &str,
    ) -> Result<String, StorageError>;
}

/// S3-backed object storage
pub struct S3Storage {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3Storage {
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // MinIO needs path-style addressing
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            s3_config_builder = s3_config_builder.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "vidframe-static",
            ));
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 storage initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    async fn simple_upload(
        &self,
        key: &str,
        blob: &ArchiveBlob,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(blob.bytes()))
            .content_type(content_type)
            .content_length(blob.len() as i64)
            .send()
            .await
            .map_err(|e| StorageError::Request(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    async fn multipart_upload(
        &self,
        key: &str,
        blob: &mut ArchiveBlob,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Request(DisplayErrorContext(&e).to_string()))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::Request("no upload id in response".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, blob).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| StorageError::Request(DisplayErrorContext(&e).to_string()))?;

                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        blob: &mut ArchiveBlob,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        blob.seek(SeekFrom::Start(0))?;

        let mut completed_parts = Vec::new();
        let mut part_number = 1;

        for part in read_parts(blob, self.config.part_size_bytes)? {
            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .map_err(|e| StorageError::Request(DisplayErrorContext(&e).to_string()))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<StoredObject, StorageError> {
        let key = normalize_key(key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    StorageError::NotFound(key.clone())
                } else {
                    StorageError::Request(DisplayErrorContext(&e).to_string())
                }
            })?;

        let metadata = response.metadata().cloned().unwrap_or_default();
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?
            .into_bytes();

        debug!(key = %key, size_bytes = data.len(), "Object downloaded");

        Ok(StoredObject { data, metadata })
    }

    #[instrument(skip(self, blob), fields(size_bytes = blob.len()))]
    async fn put(
        &self,
        key: &str,
        mut blob: ArchiveBlob,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let key = normalize_key(key);

        if needs_multipart(blob.len(), self.config.multipart_threshold_bytes) {
            self.multipart_upload(&key, &mut blob, content_type).await?;
        } else {
            self.simple_upload(&key, &blob, content_type).await?;
        }

        metrics::counter!("worker.storage.bytes_uploaded").increment(blob.len());
        info!(key = %key, size_bytes = blob.len(), "Object uploaded");

        Ok(key)
    }
}

/// Objects at least `threshold` bytes long go through multipart upload
fn needs_multipart(size_bytes: u64, threshold: usize) -> bool {
    size_bytes >= threshold as u64
}

/// Split the remainder of `reader` into parts of at most `part_size` bytes
fn read_parts<R: Read>(reader: &mut R, part_size: usize) -> std::io::Result<Vec<Vec<u8>>> {
    let part_size = part_size.max(1);
    let mut parts = Vec::new();
    loop {
        let mut part = Vec::with_capacity(part_size);
        reader.by_ref().take(part_size as u64).read_to_end(&mut part)?;
        if part.is_empty() {
            return Ok(parts);
        }
        parts.push(part);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_parts_splits_blob() {
        let mut blob = ArchiveBlob::new((0u8..=9).collect::<Vec<_>>());

        let parts = read_parts(&mut blob, 4).unwrap();
        assert_eq!(parts, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
        assert_eq!(blob.len(), 10);
    }

    #[test]
    fn test_read_parts_from_current_position() {
        let mut blob = ArchiveBlob::new(vec![1u8; 6]);
        blob.seek(SeekFrom::Start(4)).unwrap();

        let parts = read_parts(&mut blob, 4).unwrap();
        assert_eq!(parts, vec![vec![1, 1]]);
    }

    #[test]
    fn test_read_parts_of_empty_blob() {
        let mut blob = ArchiveBlob::new(Vec::new());
        assert!(read_parts(&mut blob, 4).unwrap().is_empty());
    }

    #[test]
    fn test_multipart_threshold_is_inclusive() {
        let threshold = 5 * 1024 * 1024;
        assert!(!needs_multipart(threshold as u64 - 1, threshold));
        assert!(needs_multipart(threshold as u64, threshold));
        assert!(needs_multipart(threshold as u64 + 1, threshold));
    }

    #[tokio::test]
    async fn test_mock_storage_not_found() {
        let mut storage = MockObjectStorage::new();
        storage
            .expect_get()
            .withf(|key| key == "videos/missing.mp4")
            .returning(|key| Err(StorageError::NotFound(key.to_string())));

        let result = storage.get("videos/missing.mp4").await;
        assert!(matches!(result, Err(StorageError::NotFound(key)) if key == "videos/missing.mp4"));
    }
}
