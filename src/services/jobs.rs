use crate::constants::jobs::{
    LOCAL_PID_POLL_ATTEMPTS, LOCAL_PID_POLL_MS, PID_POLL_ATTEMPTS, REMOTE_RUNS_DIR, SCREEN_PREFIX,
};
use crate::constants::limits::{
    GREP_DEFAULT_CONTEXT, GREP_DEFAULT_MATCHES, GREP_MAX_CONTEXT, GREP_MAX_MATCHES,
    GREP_MAX_OUTPUT_BYTES, GREP_MAX_OUTPUT_LINES, TAIL_MAX_LINES,
};
use crate::errors::ToolError;
use crate::services::fleet::HostSource;
use crate::services::host::{CaptureLimits, ExecOptions, ExecResult, Host};
use crate::services::logger::Logger;
use crate::services::transfer::TransferRuntime;
use crate::stores::session_store::{JobHandle, JobStatus, SessionRecord, SessionStore};
use crate::utils::paths::StateLayout;
use crate::utils::shell::{normalize_signal, quote_for_sh, wrap_sh};
use crate::utils::text::{clamp_lines, tail_lines, truncate_utf8_prefix};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

const SMALL_CAPTURE: CaptureLimits = CaptureLimits {
    stdout: 16 * 1024,
    stderr: 4 * 1024,
};

const TAIL_CAPTURE: CaptureLimits = CaptureLimits {
    stdout: 256 * 1024,
    stderr: 4 * 1024,
};

/// Contents of `meta.json` as the supervisor script writes it.
#[derive(Debug, Clone, Deserialize)]
struct StatusMarker {
    status: String,
    #[serde(rename = "exitCode", default)]
    exit_code: Option<i64>,
}

impl StatusMarker {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        serde_json::from_str(raw).ok()
    }

    fn observed(&self) -> Option<(JobStatus, Option<i64>)> {
        match self.status.as_str() {
            "running" => Some((JobStatus::Running, None)),
            "done" if self.exit_code == Some(0) => Some((JobStatus::Done, Some(0))),
            "done" => Some((JobStatus::Failed, self.exit_code)),
            _ => None,
        }
    }
}

/// The script launched inside the detached session. `run_dir` is a shell
/// expression, already quoted.
pub fn supervisor_script(run_dir: &str, sudo: bool) -> String {
    let runner = if sudo { "sudo -n -- sh -l" } else { "sh -l" };
    [
        "#!/bin/sh".to_string(),
        "set -u".to_string(),
        format!("run={}", run_dir),
        "stdout=\"$run/stdout.log\"".to_string(),
        "stderr=\"$run/stderr.log\"".to_string(),
        "meta=\"$run/meta.json\"".to_string(),
        "pidfile=\"$run/cmd.pid\"".to_string(),
        "ts=$(date -u +%Y-%m-%dT%H:%M:%SZ)".to_string(),
        "printf '{\"status\":\"running\",\"startedAt\":\"%s\"}\\n' \"$ts\" > \"$meta.tmp\" && mv \"$meta.tmp\" \"$meta\"".to_string(),
        format!("{} \"$run/cmd.sh\" >\"$stdout\" 2>\"$stderr\" &", runner),
        "cmdpid=$!".to_string(),
        "echo \"$cmdpid\" > \"$pidfile\"".to_string(),
        "wait \"$cmdpid\"".to_string(),
        "code=$?".to_string(),
        "ts2=$(date -u +%Y-%m-%dT%H:%M:%SZ)".to_string(),
        "printf '{\"status\":\"done\",\"exitCode\":%s,\"endedAt\":\"%s\"}\\n' \"$code\" \"$ts2\" > \"$meta.tmp\" && mv \"$meta.tmp\" \"$meta\"".to_string(),
    ]
    .join("\n")
}

fn parse_pid(text: &str) -> Option<u32> {
    text.lines()
        .rev()
        .map(str::trim)
        .find_map(|line| line.parse::<u32>().ok().filter(|pid| *pid > 0))
}

/// `"$HOME"/'<rel>'`, so relative remote paths survive any quoting level.
fn home_path(rel: &str) -> String {
    format!("\"$HOME\"/{}", quote_for_sh(rel))
}

#[derive(Debug, Clone)]
struct RemoteJobPaths {
    screen_name: String,
    remote_dir: String,
}

impl RemoteJobPaths {
    fn new(session_id: &str) -> Self {
        Self {
            screen_name: format!("{}-{}", SCREEN_PREFIX, session_id),
            remote_dir: format!("{}/{}", REMOTE_RUNS_DIR, session_id),
        }
    }

    fn file(&self, name: &str) -> String {
        format!("{}/{}", self.remote_dir, name)
    }

    fn run_expr(&self) -> String {
        home_path(&self.remote_dir)
    }

    fn setup_script(&self, command: &str, sudo: bool) -> String {
        let run = self.run_expr();
        let supervisor = supervisor_script(&self.run_expr(), sudo);
        [
            format!("run={}", run),
            "mkdir -p \"$run\"".to_string(),
            format!("printf '%s\\n' {} > \"$run/cmd.sh\"", quote_for_sh(command)),
            format!("printf '%s\\n' {} > \"$run/supervisor.sh\"", quote_for_sh(&supervisor)),
            ": > \"$run/stdout.log\"".to_string(),
            ": > \"$run/stderr.log\"".to_string(),
        ]
        .join(" && ")
    }

    fn launch_script(&self) -> String {
        let name = quote_for_sh(&self.screen_name);
        [
            format!("run={}", self.run_expr()),
            format!("screen -dmS {} sh \"$run/supervisor.sh\" || exit 3", name),
            format!(
                "if ! {{ screen -ls 2>/dev/null | grep -F -q {} || [ -f \"$run/meta.json\" ]; }}; then echo 'screen session did not start' >&2; exit 4; fi",
                name
            ),
            "i=0".to_string(),
            format!(
                "while [ \"$i\" -lt {} ]; do if [ -s \"$run/cmd.pid\" ]; then cat \"$run/cmd.pid\"; exit 0; fi; i=$((i+1)); sleep 1; done",
                PID_POLL_ATTEMPTS
            ),
            "echo 'pid file did not appear' >&2".to_string(),
            "exit 5".to_string(),
        ]
        .join("\n")
    }

    /// Tears down a launch that never reported a pid: the command if it
    /// started, the screen session and the run directory.
    fn abandon_script(&self, sudo: bool) -> String {
        let kill = "kill -s KILL \"$(cat \"$run/cmd.pid\")\" 2>/dev/null";
        let kill = if sudo {
            format!("sudo -n {}", kill)
        } else {
            kill.to_string()
        };
        [
            format!("run={}", self.run_expr()),
            format!("if [ -s \"$run/cmd.pid\" ]; then {}; fi", kill),
            format!("screen -S {} -X quit 2>/dev/null", quote_for_sh(&self.screen_name)),
            "rm -rf \"$run\"".to_string(),
            "true".to_string(),
        ]
        .join("\n")
    }

    fn diagnostics_script(&self) -> String {
        [
            format!("run={}", self.run_expr()),
            "echo '--- ls'".to_string(),
            "ls -la \"$run\" 2>&1".to_string(),
            "echo '--- stdout.log'".to_string(),
            "tail -n 20 \"$run/stdout.log\" 2>&1".to_string(),
            "echo '--- stderr.log'".to_string(),
            "tail -n 20 \"$run/stderr.log\" 2>&1".to_string(),
            "echo '--- screen -ls'".to_string(),
            "screen -ls 2>&1 || true".to_string(),
        ]
        .join("\n")
    }
}

#[derive(Debug, Clone)]
struct LocalJobPaths {
    run_dir: PathBuf,
}

impl LocalJobPaths {
    fn file(&self, name: &str) -> PathBuf {
        self.run_dir.join(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogTails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    #[serde(flatten)]
    pub record: SessionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tails: Option<LogTails>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrepRequest {
    pub max_matches: u64,
    pub context_lines: u64,
}

impl GrepRequest {
    pub fn new(max_matches: Option<u64>, context_lines: Option<u64>) -> Self {
        Self {
            max_matches: clamp_lines(max_matches, GREP_DEFAULT_MATCHES, 1, GREP_MAX_MATCHES),
            context_lines: context_lines
                .unwrap_or(GREP_DEFAULT_CONTEXT)
                .min(GREP_MAX_CONTEXT),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GrepOutput {
    pub lines: Vec<String>,
    pub matches: usize,
    pub truncated: bool,
}

impl GrepOutput {
    /// Applies the line and byte caps to raw grep output.
    fn capped(raw: &str, truncated: bool) -> Self {
        let mut out = GrepOutput {
            truncated,
            ..GrepOutput::default()
        };
        let mut bytes = 0usize;
        for line in raw.lines() {
            if out.lines.len() >= GREP_MAX_OUTPUT_LINES || bytes + line.len() + 1 > GREP_MAX_OUTPUT_BYTES {
                out.truncated = true;
                break;
            }
            bytes += line.len() + 1;
            if is_match_line(line) {
                out.matches += 1;
            }
            out.lines.push(line.to_string());
        }
        out
    }
}

fn is_match_line(line: &str) -> bool {
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0 && line.as_bytes().get(digits) == Some(&b':')
}

#[derive(Debug, Clone, Serialize)]
pub struct GrepReport {
    pub session_id: String,
    pub machine: String,
    pub pattern: String,
    pub max_matches: u64,
    pub context_lines: u64,
    pub stdout: GrepOutput,
    pub stderr: GrepOutput,
}

/// Grep-style search: `n:text` for matches, `n-text` for context,
/// `--` between non-adjacent groups. Stops after `max_matches` matches;
/// like `grep -m`, later matches inside the trailing context print as `-`.
pub fn grep_text(text: &str, pattern: &regex::Regex, request: GrepRequest) -> GrepOutput {
    let lines: Vec<&str> = text.lines().collect();
    let matched: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| pattern.is_match(line))
        .map(|(idx, _)| idx)
        .take(request.max_matches as usize)
        .collect();
    let context = request.context_lines as usize;

    let mut rendered = String::new();
    let mut last: Option<usize> = None;
    let mut match_iter = matched.iter().peekable();
    while let Some(&hit) = match_iter.next() {
        let start = hit.saturating_sub(context);
        let start = match last {
            Some(prev) if prev + 1 > start => prev + 1,
            _ => start,
        };
        if let Some(prev) = last {
            if start > prev + 1 {
                rendered.push_str("--\n");
            }
        }
        let end = (hit + context).min(lines.len().saturating_sub(1));
        let end = match match_iter.peek() {
            Some(&&next) if next <= end => next - 1,
            _ => end,
        };
        for idx in start..=end.max(hit) {
            let sep = if idx == hit || (idx < hit && matched.binary_search(&idx).is_ok()) {
                ':'
            } else {
                '-'
            };
            rendered.push_str(&format!("{}{}{}\n", idx + 1, sep, lines[idx]));
        }
        last = Some(end.max(hit));
    }
    GrepOutput::capped(&rendered, false)
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelReport {
    pub session_id: String,
    pub machine: String,
    pub kind: &'static str,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub note: String,
}

/// Launches, observes and cancels detached jobs. The marker file written by
/// the supervisor script is the source of truth; records cache it.
#[derive(Clone)]
pub struct JobSupervisor {
    logger: Logger,
    hosts: Arc<dyn HostSource>,
    sessions: SessionStore,
    layout: StateLayout,
    transfers: Arc<TransferRuntime>,
}

impl JobSupervisor {
    pub fn new(
        logger: Logger,
        hosts: Arc<dyn HostSource>,
        sessions: SessionStore,
        layout: StateLayout,
        transfers: Arc<TransferRuntime>,
    ) -> Self {
        Self {
            logger: logger.child("jobs"),
            hosts,
            sessions,
            layout,
            transfers,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub async fn start(&self, machine: &str, command: &str, sudo: bool) -> Result<SessionRecord, ToolError> {
        if command.trim().is_empty() {
            return Err(ToolError::invalid_params("command must be a non-empty string"));
        }
        let mut lease = self.hosts.acquire(machine).await?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let result = if lease.host().is_local() {
            lease.release();
            self.start_local(&session_id, machine, command, sudo).await
        } else {
            let started = self
                .start_remote(lease.host(), &session_id, machine, command, sudo)
                .await;
            lease.release();
            started
        };
        let record = result?;
        self.sessions.save(&record)?;
        self.logger.info(
            "Async job started",
            Some(&json!({
                "session_id": record.session_id,
                "machine": machine,
                "kind": record.kind(),
                "sudo": sudo,
            })),
        );
        Ok(record)
    }

    async fn start_remote(
        &self,
        host: &dyn Host,
        session_id: &str,
        machine: &str,
        command: &str,
        sudo: bool,
    ) -> Result<SessionRecord, ToolError> {
        let preflight = host
            .exec(
                &wrap_sh("command -v screen >/dev/null 2>&1"),
                ExecOptions::with_limits(SMALL_CAPTURE),
            )
            .await?;
        if !preflight.succeeded() {
            return Err(ToolError::prerequisite(
                "Remote prerequisite missing: `screen` is required on the server.",
            )
            .with_hint("Install GNU screen on the remote host (e.g. apt-get install screen)."));
        }

        let paths = RemoteJobPaths::new(session_id);
        let setup = host
            .exec(
                &wrap_sh(&paths.setup_script(command, sudo)),
                ExecOptions::with_limits(SMALL_CAPTURE),
            )
            .await?;
        if !setup.succeeded() {
            return Err(ToolError::internal(format!(
                "Failed to prepare remote run directory {}",
                paths.remote_dir
            ))
            .with_details(json!({"session_id": session_id, "output": setup.combined_output()})));
        }

        let script = wrap_sh(&paths.launch_script());
        let mut launched = host
            .exec(&script, ExecOptions::with_limits(SMALL_CAPTURE))
            .await?;
        if !launched.succeeded() && launched.combined_output().to_lowercase().contains("terminal") {
            self.logger.debug(
                "Retrying async launch with a pseudo-terminal",
                Some(&json!({"session_id": session_id, "machine": machine})),
            );
            launched = host
                .exec(
                    &script,
                    ExecOptions {
                        limits: SMALL_CAPTURE,
                        pty: true,
                    },
                )
                .await?;
        }
        let cmd_pid = parse_pid(&launched.stdout);
        if !launched.succeeded() || cmd_pid.is_none() {
            return Err(self
                .remote_launch_failure(host, &paths, session_id, sudo, &launched)
                .await);
        }

        Ok(SessionRecord::new(
            session_id,
            machine,
            JobHandle::RemoteScreen {
                screen_name: paths.screen_name.clone(),
                cmd_pid,
                remote_dir: paths.remote_dir.clone(),
                stdout_path: paths.file("stdout.log"),
                stderr_path: paths.file("stderr.log"),
                meta_path: paths.file("meta.json"),
                sudo,
            },
        ))
    }

    async fn remote_launch_failure(
        &self,
        host: &dyn Host,
        paths: &RemoteJobPaths,
        session_id: &str,
        sudo: bool,
        launched: &ExecResult,
    ) -> ToolError {
        let diagnostics = match host
            .exec(
                &wrap_sh(&paths.diagnostics_script()),
                ExecOptions::with_limits(CaptureLimits::new(32 * 1024, 4 * 1024)),
            )
            .await
        {
            Ok(result) => result.combined_output(),
            Err(err) => format!("diagnostics unavailable: {}", err.message),
        };
        if let Err(err) = host
            .exec(
                &wrap_sh(&paths.abandon_script(sudo)),
                ExecOptions::with_limits(SMALL_CAPTURE),
            )
            .await
        {
            self.logger.warn(
                "Failed to tear down abandoned launch",
                Some(&json!({"session_id": session_id, "error": err.message})),
            );
        }
        self.logger.warn(
            "Async launch failed",
            Some(&json!({"session_id": session_id, "exit_code": launched.exit_code})),
        );
        ToolError::internal(format!(
            "Async launch failed: {}",
            launched.combined_output().lines().last().unwrap_or("no output")
        ))
        .with_details(json!({
            "session_id": session_id,
            "screen_name": paths.screen_name,
            "remote_dir": paths.remote_dir,
            "launch_output": launched.combined_output(),
            "diagnostics": diagnostics,
        }))
    }

    async fn start_local(
        &self,
        session_id: &str,
        machine: &str,
        command: &str,
        sudo: bool,
    ) -> Result<SessionRecord, ToolError> {
        let paths = LocalJobPaths {
            run_dir: self.layout.run_dir(session_id),
        };
        tokio::fs::create_dir_all(&paths.run_dir).await?;
        let supervisor = supervisor_script(&quote_for_sh(&paths.run_dir.to_string_lossy()), sudo);
        tokio::fs::write(paths.file("cmd.sh"), format!("{}\n", command)).await?;
        tokio::fs::write(paths.file("supervisor.sh"), format!("{}\n", supervisor)).await?;
        tokio::fs::write(paths.file("stdout.log"), b"").await?;
        tokio::fs::write(paths.file("stderr.log"), b"").await?;

        let mut spawn = tokio::process::Command::new("sh");
        spawn
            .arg(paths.file("supervisor.sh"))
            .current_dir(&paths.run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        spawn.process_group(0);
        let mut child = spawn
            .spawn()
            .map_err(|err| ToolError::internal(format!("Failed to spawn local job: {}", err)))?;
        let pgid = if cfg!(unix) { child.id() } else { None };
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        let pid_path = paths.file("cmd.pid");
        let mut cmd_pid = None;
        for _ in 0..LOCAL_PID_POLL_ATTEMPTS {
            if let Ok(raw) = tokio::fs::read_to_string(&pid_path).await {
                cmd_pid = parse_pid(&raw);
                if cmd_pid.is_some() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(LOCAL_PID_POLL_MS)).await;
        }
        if cmd_pid.is_none() {
            let listing = std::fs::read_dir(&paths.run_dir)
                .map(|entries| {
                    entries
                        .filter_map(Result::ok)
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            let stderr_tail = read_tail(&paths.file("stderr.log"), 20);
            if let Some(group) = pgid {
                signal_local(&format!("-{}", group), sudo, "KILL").await;
            }
            if let Err(err) = tokio::fs::remove_dir_all(&paths.run_dir).await {
                self.logger.debug(
                    "Failed to remove abandoned run directory",
                    Some(&json!({"session_id": session_id, "error": err.to_string()})),
                );
            }
            return Err(ToolError::internal("Async launch failed: pid file did not appear")
                .with_details(json!({
                    "session_id": session_id,
                    "run_dir": paths.run_dir,
                    "files": listing,
                    "stderr_tail": stderr_tail,
                })));
        }

        Ok(SessionRecord::new(
            session_id,
            machine,
            JobHandle::LocalProcess {
                cmd_pid,
                pgid,
                run_dir: paths.run_dir.clone(),
                stdout_path: paths.file("stdout.log"),
                stderr_path: paths.file("stderr.log"),
                meta_path: paths.file("meta.json"),
                sudo,
            },
        ))
    }

    /// Reconciles the cached record with the marker file and persists any change.
    pub async fn poll(&self, session_id: &str, tail: Option<u64>) -> Result<JobReport, ToolError> {
        let record = self.sessions.require(session_id)?;
        let lines = tail
            .filter(|n| *n > 0)
            .map(|n| clamp_lines(Some(n), 1, 1, TAIL_MAX_LINES) as usize);

        match &record.handle {
            JobHandle::Transfer {
                transfer_log_path, ..
            } => {
                let tails = lines.map(|n| LogTails {
                    log: Some(read_tail(transfer_log_path, n)),
                    ..LogTails::default()
                });
                Ok(JobReport {
                    record: record.clone(),
                    tails,
                })
            }
            JobHandle::LocalProcess {
                meta_path,
                stdout_path,
                stderr_path,
                ..
            } => {
                let marker = std::fs::read_to_string(meta_path)
                    .ok()
                    .and_then(|raw| StatusMarker::parse(&raw));
                let tails = lines.map(|n| LogTails {
                    stdout: Some(read_tail(stdout_path, n)),
                    stderr: Some(read_tail(stderr_path, n)),
                    log: None,
                });
                let record = self.reconcile(record.clone(), marker)?;
                Ok(JobReport { record, tails })
            }
            JobHandle::RemoteScreen {
                meta_path,
                stdout_path,
                stderr_path,
                ..
            } => {
                let mut lease = self.hosts.acquire(&record.machine).await?;
                let result = async {
                    let host = lease.host();
                    let meta = host
                        .exec(
                            &wrap_sh(&format!("cat {} 2>/dev/null || true", home_path(meta_path))),
                            ExecOptions::with_limits(SMALL_CAPTURE),
                        )
                        .await?;
                    let tails = match lines {
                        Some(n) => Some(LogTails {
                            stdout: Some(remote_tail(host, stdout_path, n).await?),
                            stderr: Some(remote_tail(host, stderr_path, n).await?),
                            log: None,
                        }),
                        None => None,
                    };
                    Ok::<_, ToolError>((StatusMarker::parse(&meta.stdout), tails))
                }
                .await;
                lease.release();
                let (marker, tails) = result?;
                let record = self.reconcile(record.clone(), marker)?;
                Ok(JobReport { record, tails })
            }
        }
    }

    fn reconcile(&self, mut record: SessionRecord, marker: Option<StatusMarker>) -> Result<SessionRecord, ToolError> {
        let Some((status, exit_code)) = marker.as_ref().and_then(StatusMarker::observed) else {
            return Ok(record);
        };
        if !record.observe(status, exit_code) {
            return Ok(record);
        }
        let updated = self
            .sessions
            .update(&record.session_id, |stored| {
                stored.observe(status, exit_code);
            })?;
        if updated.status.is_terminal() {
            self.logger.info(
                "Async job finished",
                Some(&json!({
                    "session_id": updated.session_id,
                    "status": updated.status.as_str(),
                    "exit_code": updated.exit_code,
                })),
            );
        }
        Ok(updated)
    }

    pub async fn grep(&self, session_id: &str, pattern: &str, request: GrepRequest) -> Result<GrepReport, ToolError> {
        if pattern.is_empty() {
            return Err(ToolError::invalid_params("pattern must be a non-empty string"));
        }
        let record = self.sessions.require(session_id)?;
        let (stdout, stderr) = match &record.handle {
            JobHandle::Transfer { .. } => {
                return Err(ToolError::invalid_params(
                    "grep_result applies to async command sessions, not transfers",
                ))
            }
            JobHandle::LocalProcess {
                stdout_path,
                stderr_path,
                ..
            } => {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|err| ToolError::invalid_params(format!("Invalid pattern: {}", err)))?;
                let read = |path: &Path| std::fs::read(path).map(|b| String::from_utf8_lossy(&b).into_owned()).unwrap_or_default();
                (
                    grep_text(&read(stdout_path), &regex, request),
                    grep_text(&read(stderr_path), &regex, request),
                )
            }
            JobHandle::RemoteScreen {
                stdout_path,
                stderr_path,
                ..
            } => {
                let mut lease = self.hosts.acquire(&record.machine).await?;
                let result = async {
                    let host = lease.host();
                    let out = remote_grep(host, stdout_path, pattern, request).await?;
                    let err = remote_grep(host, stderr_path, pattern, request).await?;
                    Ok::<_, ToolError>((out, err))
                }
                .await;
                lease.release();
                result?
            }
        };
        Ok(GrepReport {
            session_id: record.session_id,
            machine: record.machine,
            pattern: pattern.to_string(),
            max_matches: request.max_matches,
            context_lines: request.context_lines,
            stdout,
            stderr,
        })
    }

    /// Terminal sessions are left alone. Running ones are signalled best
    /// effort and always end up cancelled.
    pub async fn cancel(&self, session_id: &str, signal: Option<&str>) -> Result<CancelReport, ToolError> {
        let record = self.sessions.require(session_id)?;
        if record.status.is_terminal() {
            return Ok(CancelReport {
                session_id: record.session_id.clone(),
                machine: record.machine.clone(),
                kind: record.kind(),
                status: record.status,
                signal: None,
                note: "session is not running".to_string(),
            });
        }

        let (signal, note, error) = match &record.handle {
            JobHandle::Transfer { .. } => {
                if self.transfers.cancel(session_id) {
                    (None, "aborted".to_string(), Some("cancelled".to_string()))
                } else {
                    (
                        None,
                        "no runtime found (process restart?)".to_string(),
                        Some("cancel requested (no runtime found)".to_string()),
                    )
                }
            }
            JobHandle::RemoteScreen {
                screen_name,
                cmd_pid,
                sudo,
                ..
            } => {
                let signal = normalize_signal(signal);
                let note = self
                    .signal_remote(&record.machine, screen_name, *cmd_pid, *sudo, &signal)
                    .await;
                (Some(signal), note, None)
            }
            JobHandle::LocalProcess {
                cmd_pid, pgid, sudo, ..
            } => {
                let signal = normalize_signal(signal);
                let target = match (pgid, cmd_pid) {
                    (Some(group), _) => Some(format!("-{}", group)),
                    (None, Some(pid)) => Some(pid.to_string()),
                    (None, None) => None,
                };
                let note = match target {
                    Some(target) => signal_local(&target, *sudo, &signal).await,
                    None => "no pid recorded".to_string(),
                };
                (Some(signal), note, None)
            }
        };

        let updated = self.sessions.update(session_id, |stored| {
            stored.observe(JobStatus::Cancelled, stored.exit_code);
            if let (JobHandle::Transfer { error: slot, .. }, Some(error)) = (&mut stored.handle, error.clone()) {
                *slot = Some(error);
            }
        })?;
        self.logger.info(
            "Async session cancelled",
            Some(&json!({
                "session_id": session_id,
                "kind": updated.kind(),
                "signal": signal,
                "note": note,
            })),
        );
        Ok(CancelReport {
            session_id: updated.session_id.clone(),
            machine: updated.machine.clone(),
            kind: updated.kind(),
            status: updated.status,
            signal,
            note,
        })
    }

    async fn signal_remote(
        &self,
        machine: &str,
        screen_name: &str,
        cmd_pid: Option<u32>,
        sudo: bool,
        signal: &str,
    ) -> String {
        let mut parts = Vec::new();
        if let Some(pid) = cmd_pid {
            let kill = format!("kill -s {} {} 2>/dev/null || true", signal, pid);
            parts.push(if sudo { format!("sudo -n {}", kill) } else { kill });
        }
        parts.push(format!(
            "screen -S {} -X quit 2>/dev/null || true",
            quote_for_sh(screen_name)
        ));
        let script = wrap_sh(&parts.join("; "));

        let mut lease = match self.hosts.acquire(machine).await {
            Ok(lease) => lease,
            Err(err) => {
                self.logger.warn(
                    "Cancel could not reach host",
                    Some(&json!({"machine": machine, "error": err.message})),
                );
                return format!("host unreachable: {}", err.message);
            }
        };
        let result = lease
            .host()
            .exec(&script, ExecOptions::with_limits(CaptureLimits::new(8 * 1024, 8 * 1024)))
            .await;
        lease.release();
        match result {
            Ok(_) => "signal sent".to_string(),
            Err(err) => format!("signal not confirmed: {}", err.message),
        }
    }
}

/// `target` is a pid, or `-<pgid>` for a whole process group.
async fn signal_local(target: &str, sudo: bool, signal: &str) -> String {
    let mut command = if sudo {
        let mut cmd = tokio::process::Command::new("sudo");
        cmd.args(["-n", "kill"]);
        cmd
    } else {
        tokio::process::Command::new("kill")
    };
    command
        .args(["-s", signal, "--", target])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match command.status().await {
        Ok(status) if status.success() => "signal sent".to_string(),
        Ok(_) => "process already gone".to_string(),
        Err(err) => format!("signal not confirmed: {}", err),
    }
}

fn read_tail(path: &Path, count: usize) -> Vec<String> {
    std::fs::read(path)
        .map(|bytes| tail_lines(&String::from_utf8_lossy(&bytes), count))
        .unwrap_or_default()
}

async fn remote_tail(host: &dyn Host, rel_path: &str, count: usize) -> Result<Vec<String>, ToolError> {
    let result = host
        .exec(
            &wrap_sh(&format!(
                "tail -n {} {} 2>/dev/null || true",
                count,
                home_path(rel_path)
            )),
            ExecOptions::with_limits(TAIL_CAPTURE),
        )
        .await?;
    Ok(tail_lines(&result.stdout, count))
}

async fn remote_grep(host: &dyn Host, rel_path: &str, pattern: &str, request: GrepRequest) -> Result<GrepOutput, ToolError> {
    let script = format!(
        "grep -n -i -E -m {} -C {} -e {} -- {} 2>/dev/null || true",
        request.max_matches,
        request.context_lines,
        quote_for_sh(pattern),
        home_path(rel_path)
    );
    let result = host
        .exec(
            &wrap_sh(&script),
            ExecOptions::with_limits(CaptureLimits::new(GREP_MAX_OUTPUT_BYTES, 4 * 1024)),
        )
        .await?;
    let raw = truncate_utf8_prefix(&result.stdout, GREP_MAX_OUTPUT_BYTES);
    Ok(GrepOutput::capped(&raw, result.truncated.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grep(text: &str, pattern: &str, max: u64, ctx: u64) -> Vec<String> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("regex");
        grep_text(text, &regex, GrepRequest::new(Some(max), Some(ctx))).lines
    }

    #[test]
    fn grep_separates_groups_and_marks_context() {
        let text = "a\nERROR one\nb\nc\nd\ne\nerror two\nf\n";
        assert_eq!(
            grep(text, "error", 10, 1),
            vec!["1-a", "2:ERROR one", "3-b", "--", "6-e", "7:error two", "8-f"]
        );
    }

    #[test]
    fn grep_merges_overlapping_context() {
        let text = "x\nhit\ny\nhit\nz\n";
        assert_eq!(
            grep(text, "hit", 10, 1),
            vec!["1-x", "2:hit", "3-y", "4:hit", "5-z"]
        );
    }

    #[test]
    fn grep_stops_after_max_matches() {
        let text = "hit\nhit\nhit\n";
        let out = grep(text, "hit", 2, 0);
        assert_eq!(out, vec!["1:hit", "2:hit"]);
    }

    #[test]
    fn grep_cut_off_matches_render_as_context() {
        let text = "hit one\nhit two\nplain\n";
        assert_eq!(grep(text, "hit", 1, 1), vec!["1:hit one", "2-hit two"]);
    }

    #[test]
    fn abandon_script_kills_command_and_screen() {
        let paths = RemoteJobPaths::new("abc");
        let script = paths.abandon_script(true);
        assert!(script.contains("sudo -n kill -s KILL \"$(cat \"$run/cmd.pid\")\""));
        assert!(script.contains(&format!("screen -S '{}-abc' -X quit", SCREEN_PREFIX)));
        assert!(script.contains("rm -rf \"$run\""));
        assert!(!paths.abandon_script(false).contains("sudo"));
    }

    #[test]
    fn grep_request_clamps_bounds() {
        let req = GrepRequest::new(Some(10_000), Some(999));
        assert_eq!(req.max_matches, 500);
        assert_eq!(req.context_lines, 50);
        let req = GrepRequest::new(None, None);
        assert_eq!((req.max_matches, req.context_lines), (50, 2));
    }

    #[test]
    fn capped_output_flags_truncation() {
        let raw: String = (0..20_000).map(|n| format!("{}:x\n", n + 1)).collect();
        let out = GrepOutput::capped(&raw, false);
        assert!(out.truncated);
        assert!(out.lines.len() <= GREP_MAX_OUTPUT_LINES);
    }

    #[test]
    fn marker_maps_exit_codes() {
        let done = StatusMarker::parse(r#"{"status":"done","exitCode":0}"#).expect("marker");
        assert_eq!(done.observed(), Some((JobStatus::Done, Some(0))));
        let failed = StatusMarker::parse(r#"{"status":"done","exitCode":2}"#).expect("marker");
        assert_eq!(failed.observed(), Some((JobStatus::Failed, Some(2))));
        let running = StatusMarker::parse(r#"{"status":"running","startedAt":"x"}"#).expect("marker");
        assert_eq!(running.observed(), Some((JobStatus::Running, None)));
        assert!(StatusMarker::parse("garbage").is_none());
    }

    #[test]
    fn supervisor_script_uses_atomic_marker_writes() {
        let script = supervisor_script("'/tmp/run'", true);
        assert!(script.contains("run='/tmp/run'"));
        assert!(script.contains("sudo -n -- sh -l \"$run/cmd.sh\""));
        assert!(script.contains("mv \"$meta.tmp\" \"$meta\""));
    }

    #[test]
    fn pid_parsing_takes_last_numeric_line() {
        assert_eq!(parse_pid("noise\n4242\n"), Some(4242));
        assert_eq!(parse_pid("0\n"), None);
        assert_eq!(parse_pid(""), None);
    }
}
