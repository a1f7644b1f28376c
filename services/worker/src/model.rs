use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Directory under the sanitized owner prefix where archives are written
pub const ARCHIVE_DIR: &str = "zip_files";

/// Unit of work carried by a queue message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Owner email used for the account lookup
    pub user_name: String,
    /// Storage key of the uploaded video
    pub file_path: String,
    /// Size of the uploaded video in bytes
    pub file_size: i64,
}

/// Reasons a queue payload cannot become a [`WorkItem`]
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message has no payload")]
    Empty,

    #[error("invalid work item payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkItem {
    /// Decode a raw queue payload
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }
        Ok(serde_json::from_slice(payload)?)
    }

    /// Storage key the archive for this item is written to
    pub fn archive_key(&self) -> String {
        archive_key(&self.user_name, &self.file_path)
    }
}

/// Lifecycle of a processed file.
///
/// ```text
/// Received ──▶ Processing ──▶ Completed
///    │              │
///    └──────────────┴──────▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Received,
    Processing,
    Completed,
    Failed,
}

impl FileStatus {
    /// Identifier stored in the `file_status` table
    pub const fn id(self) -> i32 {
        match self {
            FileStatus::Received => 1,
            FileStatus::Processing => 2,
            FileStatus::Completed => 3,
            FileStatus::Failed => 4,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(FileStatus::Received),
            2 => Some(FileStatus::Processing),
            3 => Some(FileStatus::Completed),
            4 => Some(FileStatus::Failed),
            _ => None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            FileStatus::Received => "received",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Completed | FileStatus::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: FileStatus) -> bool {
        matches!(
            (self, next),
            (FileStatus::Received, FileStatus::Processing)
                | (FileStatus::Received, FileStatus::Failed)
                | (FileStatus::Processing, FileStatus::Completed)
                | (FileStatus::Processing, FileStatus::Failed)
        )
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Account that owns uploaded videos
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Owner {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Persistent status record for one received work item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub video_path: String,
    pub video_size_bytes: i64,
    pub archive_path: Option<String>,
    pub archive_size_bytes: Option<i64>,
    pub status: FileStatus,
    pub result_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// File name of the archive, if one was produced
    pub fn archive_file_name(&self) -> Option<&str> {
        self.archive_path.as_deref().map(file_name)
    }
}

/// Outcome of one pipeline step, persisted onto a [`FileRecord`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingResult {
    pub archive_path: Option<String>,
    pub archive_size_bytes: Option<i64>,
    pub status: FileStatus,
    pub message: String,
}

impl ProcessingResult {
    pub fn processing() -> Self {
        Self {
            archive_path: None,
            archive_size_bytes: None,
            status: FileStatus::Processing,
            message: "processing".to_string(),
        }
    }

    pub fn completed(archive_path: impl Into<String>, archive_size_bytes: i64, frames: usize) -> Self {
        Self {
            archive_path: Some(archive_path.into()),
            archive_size_bytes: Some(archive_size_bytes),
            status: FileStatus::Completed,
            message: format!("{frames} frames extracted"),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            archive_path: None,
            archive_size_bytes: None,
            status: FileStatus::Failed,
            message: message.into(),
        }
    }
}

/// Turn an email into a single safe path segment.
///
/// `@` and `.` become `_`, as does anything that is not a letter, digit,
/// `_` or `-`.
pub fn sanitize_email_for_path(email: &str) -> String {
    email
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Last path segment of a key, ignoring trailing slashes
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// File name of a key without its final extension.
///
/// Everything from the last `.` on is the extension, so `.mp4` has an
/// empty base.
pub fn base_filename(path: &str) -> String {
    let name = file_name(path);
    match name.rfind('.') {
        Some(dot) => name[..dot].to_string(),
        None => name.to_string(),
    }
}

/// Name of the archive produced for a source video
pub fn archive_file_name(video_path: &str) -> String {
    format!("frames_{}.zip", base_filename(video_path))
}

/// `<sanitized-owner>/zip_files/<file_name>`
pub fn owner_archive_key(owner_email: &str, file_name: &str) -> String {
    normalize_key(&format!(
        "{}/{}/{}",
        sanitize_email_for_path(owner_email),
        ARCHIVE_DIR,
        file_name
    ))
}

/// Storage key for the archive built from `video_path`
pub fn archive_key(owner_email: &str, video_path: &str) -> String {
    owner_archive_key(owner_email, &archive_file_name(video_path))
}

/// Forward slashes only, no empty segments, no leading or trailing `/`
pub fn normalize_key(key: &str) -> String {
    key.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
