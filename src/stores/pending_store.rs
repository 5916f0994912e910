use crate::errors::ToolError;
use crate::utils::fs_atomic::{atomic_write_json, remove_file_if_exists};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletePreview {
    #[serde(rename = "type")]
    pub preview_type: String,
    pub total: u64,
    pub truncated: bool,
    pub sample: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingAction {
    Exec {
        machine: String,
        command: String,
        preview: DeletePreview,
    },
    Upload {
        machine: String,
        local_path: String,
        remote_path: String,
        conflicts: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub action: PendingAction,
}

/// Single-use confirmation tokens, one JSON file per token.
#[derive(Clone)]
pub struct PendingStore {
    dir: PathBuf,
    ttl: Option<chrono::Duration>,
}

impl PendingStore {
    pub fn new(dir: impl Into<PathBuf>, ttl: Option<chrono::Duration>) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    fn token_path(&self, token: &str) -> Option<PathBuf> {
        uuid::Uuid::parse_str(token)
            .ok()
            .map(|id| self.dir.join(format!("{}.json", id.hyphenated())))
    }

    fn is_expired(&self, record: &PendingRecord, now: DateTime<Utc>) -> bool {
        self.ttl
            .map(|ttl| now - record.created_at >= ttl)
            .unwrap_or(false)
    }

    pub fn create(&self, action: PendingAction) -> Result<String, ToolError> {
        let token = uuid::Uuid::new_v4().to_string();
        let record = PendingRecord {
            created_at: Utc::now(),
            action,
        };
        let path = self
            .token_path(&token)
            .ok_or_else(|| ToolError::internal("Generated an invalid confirm token"))?;
        atomic_write_json(path, &record).map_err(|err| {
            ToolError::internal(format!("Failed to persist confirmation record: {}", err))
        })?;
        Ok(token)
    }

    /// Unknown, malformed and expired tokens all read as `None`.
    pub fn load(&self, token: &str) -> Result<Option<PendingRecord>, ToolError> {
        let Some(path) = self.token_path(token.trim()) else {
            return Ok(None);
        };
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Ok(record) = serde_json::from_str::<PendingRecord>(&raw) else {
            return Ok(None);
        };
        if self.is_expired(&record, Utc::now()) {
            let _ = remove_file_if_exists(&path);
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// True only for the caller that actually removed the record.
    pub fn consume(&self, token: &str) -> Result<bool, ToolError> {
        let Some(path) = self.token_path(token.trim()) else {
            return Ok(false);
        };
        Ok(remove_file_if_exists(path)?)
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, ToolError> {
        if self.ttl.is_none() {
            return Ok(0);
        }
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut purged = 0;
        for path in entries.filter_map(Result::ok).map(|e| e.path()) {
            let Ok(raw) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<PendingRecord>(&raw) else {
                continue;
            };
            if self.is_expired(&record, now) && remove_file_if_exists(&path)? {
                purged += 1;
            }
        }
        Ok(purged)
    }
}
