use crate::errors::ToolError;
use crate::utils::fs_atomic::{atomic_write_json, remove_file_if_exists};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobHandle {
    RemoteScreen {
        screen_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cmd_pid: Option<u32>,
        /// Relative to the remote `$HOME`.
        remote_dir: String,
        stdout_path: String,
        stderr_path: String,
        meta_path: String,
        #[serde(default)]
        sudo: bool,
    },
    LocalProcess {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cmd_pid: Option<u32>,
        /// Process group of the supervisor; the command runs inside it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pgid: Option<u32>,
        run_dir: PathBuf,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
        meta_path: PathBuf,
        #[serde(default)]
        sudo: bool,
    },
    Transfer {
        direction: TransferDirection,
        local_path: String,
        remote_path: String,
        bytes_total: u64,
        bytes_done: u64,
        transfer_log_path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub machine: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(flatten)]
    pub handle: JobHandle,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, machine: impl Into<String>, handle: JobHandle) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            machine: machine.into(),
            created_at: now,
            updated_at: now,
            status: JobStatus::Running,
            exit_code: None,
            handle,
        }
    }

    /// Applies an observed status. Terminal records never move again.
    /// Returns whether anything changed.
    pub fn observe(&mut self, status: JobStatus, exit_code: Option<i64>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.status == status && self.exit_code == exit_code {
            return false;
        }
        self.status = status;
        self.exit_code = exit_code;
        self.updated_at = Utc::now();
        true
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.updated_at.max(self.created_at)
    }

    pub fn kind(&self) -> &'static str {
        match self.handle {
            JobHandle::RemoteScreen { .. } => "remote_screen",
            JobHandle::LocalProcess { .. } => "local_process",
            JobHandle::Transfer { .. } => "transfer",
        }
    }
}

pub fn validate_session_id(session_id: &str) -> Result<(), ToolError> {
    uuid::Uuid::parse_str(session_id)
        .map(|_| ())
        .map_err(|_| ToolError::invalid_params("session_id must be a UUID"))
}

#[derive(Clone)]
pub struct SessionStore {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }

    pub fn save(&self, record: &SessionRecord) -> Result<(), ToolError> {
        validate_session_id(&record.session_id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|err| err.into_inner());
        atomic_write_json(self.record_path(&record.session_id), record).map_err(|err| {
            ToolError::internal(format!("Failed to persist session record: {}", err))
        })
    }

    pub fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, ToolError> {
        validate_session_id(session_id)?;
        let path = self.record_path(session_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record = serde_json::from_str(&raw).map_err(|err| {
            ToolError::internal(format!("Malformed session record {}: {}", session_id, err))
        })?;
        Ok(Some(record))
    }

    pub fn require(&self, session_id: &str) -> Result<SessionRecord, ToolError> {
        self.load(session_id)?.ok_or_else(|| {
            ToolError::not_found(format!("Unknown session_id: {}", session_id))
        })
    }

    /// Read-modify-write under the store lock.
    pub fn update<F>(&self, session_id: &str, mutate: F) -> Result<SessionRecord, ToolError>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|err| err.into_inner());
        let mut record = self.require(session_id)?;
        mutate(&mut record);
        atomic_write_json(self.record_path(session_id), &record).map_err(|err| {
            ToolError::internal(format!("Failed to persist session record: {}", err))
        })?;
        Ok(record)
    }

    pub fn delete(&self, session_id: &str) -> Result<bool, ToolError> {
        validate_session_id(session_id)?;
        Ok(remove_file_if_exists(self.record_path(session_id))?)
    }

    /// Unreadable files are skipped; one bad record must not hide the rest.
    pub fn list(&self) -> Result<Vec<SessionRecord>, ToolError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records: Vec<SessionRecord> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("json"))
            .filter_map(|path| std::fs::read_to_string(path).ok())
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    pub fn expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionRecord>, ToolError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|record| record.status.is_terminal() && record.last_activity() < cutoff)
            .collect())
    }
}
