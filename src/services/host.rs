use crate::constants::limits::DEFAULT_CAPTURE_BYTES;
use crate::errors::ToolError;
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    pub stdout: usize,
    pub stderr: usize,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            stdout: DEFAULT_CAPTURE_BYTES,
            stderr: DEFAULT_CAPTURE_BYTES,
        }
    }
}

impl CaptureLimits {
    pub fn new(stdout: usize, stderr: usize) -> Self {
        Self { stdout, stderr }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub limits: CaptureLimits,
    pub pty: bool,
}

impl ExecOptions {
    pub fn with_limits(limits: CaptureLimits) -> Self {
        Self { limits, pty: false }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Truncation {
    pub stdout: bool,
    pub stderr: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub truncated: Truncation,
}

impl ExecResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Both streams, for error details.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.trim_end().to_string();
        let err = self.stderr.trim_end();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Bounded per-stream buffer. Bytes past the cap are dropped, not held.
#[derive(Debug)]
pub struct CaptureState {
    cap: usize,
    buffer: Vec<u8>,
    total: u64,
    truncated: bool,
}

impl CaptureState {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buffer: Vec::new(),
            total: 0,
            truncated: false,
        }
    }

    pub fn capture(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.total += chunk.len() as u64;
        let remaining = self.cap.saturating_sub(self.buffer.len());
        if chunk.len() > remaining {
            self.buffer.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        } else {
            self.buffer.extend_from_slice(chunk);
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> (String, bool) {
        (
            String::from_utf8_lossy(&self.buffer).into_owned(),
            self.truncated,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStat {
    pub is_dir: bool,
    pub size: u64,
    pub mtime: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: EntryStat,
}

/// A machine commands and files can be sent to.
#[async_trait]
pub trait Host: Send + Sync {
    fn machine(&self) -> &str;

    fn is_local(&self) -> bool {
        false
    }

    /// Runs `command` verbatim; callers wrap it for the login shell.
    async fn exec(&self, command: &str, options: ExecOptions) -> Result<ExecResult, ToolError>;

    /// Absolute home directory, resolved once per host.
    async fn home_dir(&self) -> Result<String, ToolError>;

    async fn stat(&self, path: &str) -> Result<Option<EntryStat>, ToolError>;

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, ToolError>;

    async fn mkdir_p(&self, path: &str) -> Result<(), ToolError>;

    async fn put_file(&self, local: &Path, remote: &str) -> Result<u64, ToolError>;

    async fn get_file(&self, remote: &str, local: &Path) -> Result<u64, ToolError>;
}

pub fn signal_name(signal: i32) -> String {
    match signal {
        1 => "HUP".to_string(),
        2 => "INT".to_string(),
        3 => "QUIT".to_string(),
        6 => "ABRT".to_string(),
        9 => "KILL".to_string(),
        13 => "PIPE".to_string(),
        15 => "TERM".to_string(),
        other => other.to_string(),
    }
}

pub fn validate_home(raw: &str) -> Result<String, ToolError> {
    let home = raw.trim();
    if !home.starts_with('/') {
        return Err(ToolError::internal(format!(
            "Failed to resolve home directory (got: {:?})",
            home
        )));
    }
    Ok(home.to_string())
}
