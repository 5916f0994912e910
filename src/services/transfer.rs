use crate::constants::limits::CONFLICT_SAMPLE;
use crate::constants::transfer::{CONFLICT_CHECK_WORKERS, COPY_WORKERS};
use crate::errors::{ToolError, ToolErrorKind};
use crate::services::fleet::{HostLease, HostSource};
use crate::services::host::Host;
use crate::services::logger::Logger;
use crate::stores::pending_store::{PendingAction, PendingStore};
use crate::stores::session_store::{
    JobHandle, JobStatus, SessionRecord, SessionStore, TransferDirection,
};
use crate::utils::concurrency::map_limit;
use crate::utils::fs_atomic::ensure_dir_for_file;
use crate::utils::paths::StateLayout;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size: u64,
}

/// Files to copy plus the directories that must exist first. Directories
/// are remote paths for uploads and local paths for downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferPlan {
    pub direction: TransferDirection,
    pub is_directory: bool,
    pub files: Vec<PlanEntry>,
    pub dirs: Vec<String>,
    pub total_bytes: u64,
}

impl TransferPlan {
    fn new(direction: TransferDirection, is_directory: bool, files: Vec<PlanEntry>, dirs: Vec<String>) -> Self {
        let total_bytes = files.iter().map(|f| f.size).sum();
        Self {
            direction,
            is_directory,
            files,
            dirs,
            total_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferTotals {
    pub files: usize,
    pub bytes: u64,
}

pub fn posix_dirname(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None if path.starts_with('/') => "/".to_string(),
        None => ".".to_string(),
    }
}

pub fn posix_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Joins remote path segments and collapses repeated slashes.
pub fn join_remote(base: &str, rel: &str) -> String {
    let joined = format!("{}/{}", base, rel);
    let mut out = String::with_capacity(joined.len());
    let mut prev_slash = false;
    for ch in joined.chars() {
        if ch == '/' && prev_slash {
            continue;
        }
        prev_slash = ch == '/';
        out.push(ch);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// Absolute paths are kept; everything else lands under the remote home.
pub fn resolve_remote_path(raw: &str, home: &str) -> Result<String, ToolError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ToolError::invalid_params("remote_path must be a non-empty string"));
    }
    if raw.starts_with('/') {
        return Ok(raw.to_string());
    }
    if raw == "~" || raw == "." {
        return Ok(home.to_string());
    }
    let rel = raw
        .strip_prefix("~/")
        .or_else(|| raw.strip_prefix("./"))
        .unwrap_or(raw);
    let resolved = join_remote(home, rel);
    if raw.ends_with('/') && !resolved.ends_with('/') {
        return Ok(format!("{}/", resolved));
    }
    Ok(resolved)
}

fn local_file_name(path: &Path) -> Result<String, ToolError> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ToolError::invalid_params(format!("Path has no file name: {}", path.display()))
        })
}

fn walk_local_tree(root: &Path, remote_base: &str) -> Result<(Vec<PlanEntry>, Vec<String>), ToolError> {
    let mut files = Vec::new();
    let mut dirs = vec![remote_base.to_string()];
    for entry in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            ToolError::internal(format!("Failed to walk {}: {}", root.display(), err))
        })?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| ToolError::internal("Walked outside of the upload root"))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let remote = join_remote(remote_base, &rel);
        if entry.file_type().is_dir() {
            dirs.push(remote);
        } else if entry.file_type().is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            files.push(PlanEntry {
                local_path: entry.path().to_path_buf(),
                remote_path: remote,
                size,
            });
        }
    }
    dirs.sort();
    dirs.dedup();
    Ok((files, dirs))
}

pub async fn plan_upload(host: &dyn Host, local_path: &Path, remote_path: &str) -> Result<TransferPlan, ToolError> {
    let meta = match tokio::fs::metadata(local_path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ToolError::not_found(format!(
                "Local path not found: {}",
                local_path.display()
            )))
        }
        Err(err) => return Err(err.into()),
    };
    let home = host.home_dir().await?;
    let remote = resolve_remote_path(remote_path, &home)?;

    if meta.is_file() {
        let target = if remote.ends_with('/') {
            join_remote(&remote, &local_file_name(local_path)?)
        } else {
            remote
        };
        let entry = PlanEntry {
            local_path: local_path.to_path_buf(),
            remote_path: target.clone(),
            size: meta.len(),
        };
        return Ok(TransferPlan::new(
            TransferDirection::Upload,
            false,
            vec![entry],
            vec![posix_dirname(&target)],
        ));
    }
    if !meta.is_dir() {
        return Err(ToolError::invalid_params(format!(
            "Local path is neither a file nor a directory: {}",
            local_path.display()
        )));
    }

    let root = local_path.to_path_buf();
    let base = join_remote(&remote, "");
    let (files, dirs) = tokio::task::spawn_blocking(move || walk_local_tree(&root, &base))
        .await
        .map_err(|_| ToolError::internal("Local directory walk failed"))??;
    Ok(TransferPlan::new(TransferDirection::Upload, true, files, dirs))
}

async fn walk_remote_tree(
    host: &dyn Host,
    remote_root: &str,
    local_root: &Path,
) -> Result<(Vec<PlanEntry>, Vec<String>), ToolError> {
    let mut files = Vec::new();
    let mut dirs = vec![local_root.to_string_lossy().into_owned()];
    let mut stack = vec![(remote_root.to_string(), local_root.to_path_buf())];
    while let Some((remote_dir, local_dir)) = stack.pop() {
        for entry in host.read_dir(&remote_dir).await? {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            let remote = join_remote(&remote_dir, &entry.name);
            let local = local_dir.join(&entry.name);
            if entry.stat.is_dir {
                dirs.push(local.to_string_lossy().into_owned());
                stack.push((remote, local));
            } else {
                files.push(PlanEntry {
                    local_path: local,
                    remote_path: remote,
                    size: entry.stat.size,
                });
            }
        }
    }
    files.sort_by(|a, b| a.remote_path.cmp(&b.remote_path));
    dirs.sort();
    dirs.dedup();
    Ok((files, dirs))
}

pub async fn plan_download(host: &dyn Host, remote_path: &str, local_path: &Path) -> Result<TransferPlan, ToolError> {
    let home = host.home_dir().await?;
    let remote = resolve_remote_path(remote_path, &home)?;
    let remote = join_remote(&remote, "");
    let Some(stat) = host.stat(&remote).await? else {
        return Err(ToolError::not_found(format!("Remote path not found: {}", remote)));
    };

    if !stat.is_dir {
        let target = if tokio::fs::metadata(local_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            local_path.join(posix_basename(&remote))
        } else {
            local_path.to_path_buf()
        };
        let parent = target
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());
        let entry = PlanEntry {
            local_path: target,
            remote_path: remote,
            size: stat.size,
        };
        return Ok(TransferPlan::new(
            TransferDirection::Download,
            false,
            vec![entry],
            vec![parent],
        ));
    }

    let (files, dirs) = walk_remote_tree(host, &remote, local_path).await?;
    Ok(TransferPlan::new(TransferDirection::Download, true, files, dirs))
}

/// Remote paths of planned files that already exist, in plan order.
pub async fn find_upload_conflicts(host: &dyn Host, plan: &TransferPlan) -> Result<Vec<String>, ToolError> {
    let checks = map_limit(&plan.files, CONFLICT_CHECK_WORKERS, |entry| async move {
        host.stat(&entry.remote_path)
            .await
            .map(|stat| stat.map(|_| entry.remote_path.clone()))
    })
    .await;
    let mut conflicts = Vec::new();
    for check in checks {
        if let Some(path) = check? {
            conflicts.push(path);
        }
    }
    Ok(conflicts)
}

pub fn find_download_conflicts(plan: &TransferPlan) -> Vec<String> {
    plan.files
        .iter()
        .filter(|entry| std::fs::symlink_metadata(&entry.local_path).is_ok())
        .map(|entry| entry.local_path.to_string_lossy().into_owned())
        .collect()
}

async fn copy_entry(host: &dyn Host, direction: TransferDirection, entry: &PlanEntry) -> Result<u64, ToolError> {
    match direction {
        TransferDirection::Upload => host.put_file(&entry.local_path, &entry.remote_path).await,
        TransferDirection::Download => host.get_file(&entry.remote_path, &entry.local_path).await,
    }
}

async fn create_planned_dirs(host: &dyn Host, plan: &TransferPlan) -> Result<(), ToolError> {
    for dir in &plan.dirs {
        match plan.direction {
            TransferDirection::Upload => host.mkdir_p(dir).await?,
            TransferDirection::Download => tokio::fs::create_dir_all(dir).await?,
        }
    }
    Ok(())
}

/// Creates every planned directory, then copies files with a fixed worker count.
pub async fn execute_plan(host: &dyn Host, plan: &TransferPlan) -> Result<TransferTotals, ToolError> {
    create_planned_dirs(host, plan).await?;
    let direction = plan.direction;
    let copied = map_limit(&plan.files, COPY_WORKERS, |entry| copy_entry(host, direction, entry)).await;
    let mut totals = TransferTotals::default();
    for (entry, result) in plan.files.iter().zip(copied) {
        result?;
        totals.files += 1;
        totals.bytes += entry.size;
    }
    Ok(totals)
}

/// Abort flags for transfers running in this process.
#[derive(Debug, Default)]
pub struct TransferRuntime {
    flags: DashMap<String, Arc<AtomicBool>>,
}

impl TransferRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags.insert(session_id.to_string(), flag.clone());
        flag
    }

    /// False when no live transfer owns this id.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.flags.get(session_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, session_id: &str) {
        self.flags.remove(session_id);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.flags.contains_key(session_id)
    }
}

pub fn append_transfer_log(path: &Path, message: &str) -> std::io::Result<()> {
    ensure_dir_for_file(path)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "[{}] {}", chrono::Utc::now().to_rfc3339(), message)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub machine: String,
    pub local_path: String,
    pub remote_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransferOutcome {
    Completed {
        files: usize,
        bytes: u64,
    },
    Started {
        session_id: String,
        bytes_total: u64,
        files: usize,
    },
    /// Upload would overwrite; resubmit with the token.
    NeedsConfirm {
        confirm_code: String,
        total: usize,
        sample: Vec<String>,
    },
    /// Download would overwrite; pick another destination.
    Conflict {
        total: usize,
        sample: Vec<String>,
    },
}

fn conflict_sample(conflicts: &[String]) -> Vec<String> {
    conflicts.iter().take(CONFLICT_SAMPLE).cloned().collect()
}

#[derive(Clone)]
pub struct TransferService {
    logger: Logger,
    hosts: Arc<dyn HostSource>,
    sessions: SessionStore,
    pending: PendingStore,
    layout: StateLayout,
    runtime: Arc<TransferRuntime>,
}

impl TransferService {
    pub fn new(
        logger: Logger,
        hosts: Arc<dyn HostSource>,
        sessions: SessionStore,
        pending: PendingStore,
        layout: StateLayout,
        runtime: Arc<TransferRuntime>,
    ) -> Self {
        Self {
            logger: logger.child("transfer"),
            hosts,
            sessions,
            pending,
            layout,
            runtime,
        }
    }

    pub fn runtime(&self) -> &Arc<TransferRuntime> {
        &self.runtime
    }

    /// `None` means the upload may go ahead.
    fn gate_upload(
        &self,
        request: &TransferRequest,
        conflicts: Vec<String>,
        confirm_code: Option<&str>,
    ) -> Result<Option<TransferOutcome>, ToolError> {
        if conflicts.is_empty() {
            return Ok(None);
        }
        let Some(code) = confirm_code.map(str::trim).filter(|c| !c.is_empty()) else {
            let total = conflicts.len();
            let sample = conflict_sample(&conflicts);
            let token = self.pending.create(PendingAction::Upload {
                machine: request.machine.clone(),
                local_path: request.local_path.clone(),
                remote_path: request.remote_path.clone(),
                conflicts,
            })?;
            self.logger.info(
                "Upload needs overwrite confirmation",
                Some(&json!({"machine": request.machine, "conflicts": total})),
            );
            return Ok(Some(TransferOutcome::NeedsConfirm {
                confirm_code: token,
                total,
                sample,
            }));
        };

        let invalid = || {
            ToolError::new(
                ToolErrorKind::Denied,
                "INVALID_CONFIRM_CODE",
                "Invalid confirm_code. Re-run the upload without confirm_code to get a new conflict preview.",
            )
        };
        let Some(record) = self.pending.load(code)? else {
            return Err(invalid());
        };
        let PendingAction::Upload {
            machine,
            local_path,
            remote_path,
            ..
        } = record.action
        else {
            return Err(invalid());
        };
        if machine != request.machine
            || local_path != request.local_path
            || remote_path != request.remote_path
        {
            return Err(ToolError::new(
                ToolErrorKind::Denied,
                "CONFIRM_MISMATCH",
                "confirm_code does not match this upload request. Re-run without confirm_code to preview again.",
            ));
        }
        if !self.pending.consume(code)? {
            return Err(invalid());
        }
        Ok(None)
    }

    async fn plan_checked(
        &self,
        lease: &HostLease,
        direction: TransferDirection,
        request: &TransferRequest,
        confirm_code: Option<&str>,
    ) -> Result<Result<TransferPlan, TransferOutcome>, ToolError> {
        let host = lease.host();
        let local = PathBuf::from(&request.local_path);
        match direction {
            TransferDirection::Upload => {
                let plan = plan_upload(host, &local, &request.remote_path).await?;
                let conflicts = find_upload_conflicts(host, &plan).await?;
                match self.gate_upload(request, conflicts, confirm_code)? {
                    Some(outcome) => Ok(Err(outcome)),
                    None => Ok(Ok(plan)),
                }
            }
            TransferDirection::Download => {
                let plan = plan_download(host, &request.remote_path, &local).await?;
                let conflicts = find_download_conflicts(&plan);
                if conflicts.is_empty() {
                    return Ok(Ok(plan));
                }
                Ok(Err(TransferOutcome::Conflict {
                    total: conflicts.len(),
                    sample: conflict_sample(&conflicts),
                }))
            }
        }
    }

    async fn transfer_leased(
        &self,
        lease: &HostLease,
        direction: TransferDirection,
        request: &TransferRequest,
        confirm_code: Option<&str>,
    ) -> Result<TransferOutcome, ToolError> {
        let plan = match self.plan_checked(lease, direction, request, confirm_code).await? {
            Ok(plan) => plan,
            Err(outcome) => return Ok(outcome),
        };
        let totals = execute_plan(lease.host(), &plan).await?;
        self.logger.info(
            "Transfer completed",
            Some(&json!({
                "machine": request.machine,
                "direction": direction,
                "files": totals.files,
                "bytes": totals.bytes,
            })),
        );
        Ok(TransferOutcome::Completed {
            files: totals.files,
            bytes: totals.bytes,
        })
    }

    pub async fn transfer(
        &self,
        direction: TransferDirection,
        request: &TransferRequest,
        confirm_code: Option<&str>,
    ) -> Result<TransferOutcome, ToolError> {
        let mut lease = self.hosts.acquire(&request.machine).await?;
        let result = self
            .transfer_leased(&lease, direction, request, confirm_code)
            .await;
        lease.release();
        result
    }

    /// Plans and gates in the foreground; copies run in a background task
    /// that owns the lease until it finishes.
    pub async fn start_async(
        &self,
        direction: TransferDirection,
        request: &TransferRequest,
        confirm_code: Option<&str>,
    ) -> Result<TransferOutcome, ToolError> {
        let mut lease = self.hosts.acquire(&request.machine).await?;
        let plan = match self.plan_checked(&lease, direction, request, confirm_code).await {
            Ok(Ok(plan)) => plan,
            Ok(Err(outcome)) => {
                lease.release();
                return Ok(outcome);
            }
            Err(err) => {
                lease.release();
                return Err(err);
            }
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let log_path = self.layout.transfer_log_path(&session_id);
        let verb = match direction {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        };
        let start_line = match direction {
            TransferDirection::Upload => {
                format!("{} start: {} -> {}", verb, request.local_path, request.remote_path)
            }
            TransferDirection::Download => {
                format!("{} start: {} -> {}", verb, request.remote_path, request.local_path)
            }
        };
        if let Err(err) = append_transfer_log(&log_path, &start_line) {
            lease.release();
            return Err(ToolError::internal(format!("Failed to open transfer log: {}", err)));
        }
        let record = SessionRecord::new(
            session_id.clone(),
            request.machine.clone(),
            JobHandle::Transfer {
                direction,
                local_path: request.local_path.clone(),
                remote_path: request.remote_path.clone(),
                bytes_total: plan.total_bytes,
                bytes_done: 0,
                transfer_log_path: log_path.clone(),
                error: None,
            },
        );
        if let Err(err) = self.sessions.save(&record) {
            lease.release();
            return Err(err);
        }

        let abort = self.runtime.register(&session_id);
        let outcome = TransferOutcome::Started {
            session_id: session_id.clone(),
            bytes_total: plan.total_bytes,
            files: plan.files.len(),
        };
        self.logger.info(
            "Async transfer started",
            Some(&json!({"session_id": session_id, "machine": request.machine, "direction": verb})),
        );

        let task = TransferTask {
            logger: self.logger.clone(),
            sessions: self.sessions.clone(),
            runtime: self.runtime.clone(),
            session_id,
            verb,
            log_path,
            plan,
            abort,
        };
        tokio::spawn(task.run(lease));
        Ok(outcome)
    }
}

struct TransferTask {
    logger: Logger,
    sessions: SessionStore,
    runtime: Arc<TransferRuntime>,
    session_id: String,
    verb: &'static str,
    log_path: PathBuf,
    plan: TransferPlan,
    abort: Arc<AtomicBool>,
}

impl TransferTask {
    fn log(&self, message: &str) {
        if let Err(err) = append_transfer_log(&self.log_path, message) {
            self.logger.warn(
                "Failed to append transfer log",
                Some(&json!({"session_id": self.session_id, "error": err.to_string()})),
            );
        }
    }

    fn record_progress(&self, done: u64) -> Result<(), ToolError> {
        self.sessions.update(&self.session_id, |record| {
            if let JobHandle::Transfer { bytes_done, .. } = &mut record.handle {
                *bytes_done = done;
            }
            record.updated_at = chrono::Utc::now();
        })?;
        Ok(())
    }

    fn check_abort(&self) -> Result<(), ToolError> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(ToolError::new(ToolErrorKind::Conflict, "TRANSFER_CANCELLED", CANCELLED));
        }
        Ok(())
    }

    /// Directories first, then one file at a time so an abort lands between files.
    async fn copy_all(&self, host: &dyn Host) -> Result<u64, ToolError> {
        self.check_abort()?;
        create_planned_dirs(host, &self.plan).await?;
        let mut done = 0u64;
        for entry in &self.plan.files {
            self.check_abort()?;
            match self.plan.direction {
                TransferDirection::Upload => self.log(&format!(
                    "put {} -> {}",
                    entry.local_path.display(),
                    entry.remote_path
                )),
                TransferDirection::Download => self.log(&format!(
                    "get {} -> {}",
                    entry.remote_path,
                    entry.local_path.display()
                )),
            }
            copy_entry(host, self.plan.direction, entry).await?;
            done += entry.size;
            self.record_progress(done)?;
        }
        Ok(done)
    }

    fn finish(&self, status: JobStatus, done: Option<u64>, error: Option<String>) {
        let result = self.sessions.update(&self.session_id, |record| {
            if let JobHandle::Transfer {
                bytes_done,
                error: slot,
                ..
            } = &mut record.handle
            {
                if let Some(done) = done {
                    *bytes_done = done;
                }
                if error.is_some() {
                    *slot = error.clone();
                }
            }
            if !record.observe(status, None) {
                record.updated_at = chrono::Utc::now();
            }
        });
        if let Err(err) = result {
            self.logger.error(
                "Failed to record transfer outcome",
                Some(&json!({"session_id": self.session_id, "error": err.message})),
            );
        }
    }

    async fn run(self, mut lease: HostLease) {
        let host = lease.shared_host();
        let outcome = self.copy_all(host.as_ref()).await;
        lease.release();
        match outcome {
            Ok(done) => {
                self.log(&format!("{} done", self.verb));
                self.finish(JobStatus::Done, Some(done), None);
                self.logger.info(
                    "Async transfer finished",
                    Some(&json!({"session_id": self.session_id, "bytes": done})),
                );
            }
            Err(err) => {
                let cancelled = err.code == "TRANSFER_CANCELLED";
                self.log(&format!("{} failed: {}", self.verb, err.message));
                let status = if cancelled {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Failed
                };
                self.finish(status, None, Some(err.message.clone()));
                self.logger.warn(
                    "Async transfer stopped",
                    Some(&json!({"session_id": self.session_id, "status": status.as_str(), "error": err.message})),
                );
            }
        }
        self.runtime.finish(&self.session_id);
    }
}
