use crate::constants::jobs::REMOTE_RUNS_DIR;
use crate::errors::ToolError;
use crate::services::fleet::HostSource;
use crate::services::host::{CaptureLimits, ExecOptions};
use crate::services::logger::Logger;
use crate::stores::pending_store::PendingStore;
use crate::stores::session_store::{JobHandle, SessionRecord, SessionStore};
use crate::utils::fs_atomic::remove_file_if_exists;
use crate::utils::shell::{quote_for_sh, wrap_sh};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub examined: usize,
    pub removed: usize,
    pub cleanup_failures: usize,
    pub purged_tokens: usize,
}

/// Deletes terminal sessions past the retention window along with their
/// artifacts. Artifact cleanup is best effort; the record goes regardless.
pub struct RetentionSweeper {
    logger: Logger,
    hosts: Arc<dyn HostSource>,
    sessions: SessionStore,
    pending: PendingStore,
    retention: chrono::Duration,
}

impl RetentionSweeper {
    pub fn new(
        logger: Logger,
        hosts: Arc<dyn HostSource>,
        sessions: SessionStore,
        pending: PendingStore,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            logger: logger.child("retention"),
            hosts,
            sessions,
            pending,
            retention,
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepSummary, ToolError> {
        let expired = self.sessions.expired(now - self.retention)?;
        let mut summary = SweepSummary {
            examined: expired.len(),
            ..SweepSummary::default()
        };
        for record in expired {
            if let Err(err) = self.cleanup(&record).await {
                summary.cleanup_failures += 1;
                self.logger.warn(
                    "Retention cleanup failed",
                    Some(&json!({
                        "session_id": record.session_id,
                        "kind": record.kind(),
                        "error": err.message,
                    })),
                );
            }
            if self.sessions.delete(&record.session_id)? {
                summary.removed += 1;
            }
        }
        summary.purged_tokens = self.pending.purge_expired(now)?;
        if summary.removed > 0 || summary.purged_tokens > 0 {
            self.logger.info("Retention sweep finished", Some(&json!(summary)));
        }
        Ok(summary)
    }

    async fn cleanup(&self, record: &SessionRecord) -> Result<(), ToolError> {
        match &record.handle {
            JobHandle::RemoteScreen {
                screen_name,
                remote_dir,
                ..
            } => {
                if !remote_dir.starts_with(REMOTE_RUNS_DIR) || remote_dir.contains("..") {
                    return Err(ToolError::denied(format!(
                        "Refusing to remove unexpected remote dir {}",
                        remote_dir
                    )));
                }
                let script = format!(
                    "rm -rf \"$HOME\"/{}; screen -S {} -X quit 2>/dev/null || true",
                    quote_for_sh(remote_dir),
                    quote_for_sh(screen_name)
                );
                let mut lease = self.hosts.acquire(&record.machine).await?;
                let result = lease
                    .host()
                    .exec(&wrap_sh(&script), ExecOptions::with_limits(CaptureLimits::new(4096, 4096)))
                    .await;
                lease.release();
                result.map(|_| ())
            }
            JobHandle::LocalProcess { run_dir, .. } => remove_dir_if_exists(run_dir).await,
            JobHandle::Transfer {
                transfer_log_path, ..
            } => {
                remove_file_if_exists(transfer_log_path)?;
                Ok(())
            }
        }
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), ToolError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
