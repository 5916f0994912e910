use crate::errors::ToolError;
use crate::services::host::{
    signal_name, validate_home, CaptureState, DirEntry, EntryStat, ExecOptions, ExecResult, Host,
    Truncation,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncRead, AsyncReadExt};

/// The controlling machine itself, addressed through the same interface as
/// remote hosts.
#[derive(Debug, Clone)]
pub struct LocalHost {
    machine: String,
    home: Option<String>,
}

impl LocalHost {
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            home: std::env::var("HOME").ok(),
        }
    }

    pub fn with_home(mut self, home: impl Into<String>) -> Self {
        self.home = Some(home.into());
        self
    }
}

fn spawn_capture<R>(reader: Option<R>, cap: usize) -> tokio::task::JoinHandle<CaptureState>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut state = CaptureState::new(cap);
        if let Some(mut reader) = reader {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => state.capture(&buf[..n]),
                }
            }
        }
        state
    })
}

fn to_stat(meta: &std::fs::Metadata) -> EntryStat {
    EntryStat {
        is_dir: meta.is_dir(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        mtime: meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs()),
    }
}

async fn copy_via_temp(from: &Path, to: &Path) -> Result<u64, ToolError> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = crate::utils::fs_atomic::temp_sibling_path(to);
    let copied = match tokio::fs::copy(from, &tmp).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ToolError::internal(format!(
                "Failed to copy {} to {}: {}",
                from.display(),
                to.display(),
                err
            )));
        }
    };
    tokio::fs::rename(&tmp, to).await?;
    Ok(copied)
}

#[async_trait]
impl Host for LocalHost {
    fn machine(&self) -> &str {
        &self.machine
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn exec(&self, command: &str, options: ExecOptions) -> Result<ExecResult, ToolError> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ToolError::internal(format!("Failed to spawn command: {}", err)))?;

        let stdout_task = spawn_capture(child.stdout.take(), options.limits.stdout);
        let stderr_task = spawn_capture(child.stderr.take(), options.limits.stderr);
        let status = child
            .wait()
            .await
            .map_err(|err| ToolError::internal(format!("Failed to wait for command: {}", err)))?;
        let (stdout, stdout_truncated) = stdout_task
            .await
            .map_err(|_| ToolError::internal("stdout reader task failed"))?
            .into_string();
        let (stderr, stderr_truncated) = stderr_task
            .await
            .map_err(|_| ToolError::internal("stderr reader task failed"))?
            .into_string();

        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(signal_name)
        };
        #[cfg(not(unix))]
        let signal: Option<String> = None;

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code: status.code().map(i64::from),
            signal,
            truncated: Truncation {
                stdout: stdout_truncated,
                stderr: stderr_truncated,
            },
        })
    }

    async fn home_dir(&self) -> Result<String, ToolError> {
        validate_home(self.home.as_deref().unwrap_or(""))
    }

    async fn stat(&self, path: &str) -> Result<Option<EntryStat>, ToolError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(to_stat(&meta))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, ToolError> {
        let mut reader = tokio::fs::read_dir(path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                stat: to_stat(&meta),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn mkdir_p(&self, path: &str) -> Result<(), ToolError> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<u64, ToolError> {
        copy_via_temp(local, &PathBuf::from(remote)).await
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<u64, ToolError> {
        copy_via_temp(Path::new(remote), local).await
    }
}
