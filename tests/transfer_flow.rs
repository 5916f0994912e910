mod common;
use common::StaticHostSource;

use async_trait::async_trait;
use fleetssh::errors::ToolError;
use fleetssh::services::fleet::HostSource;
use fleetssh::services::host::{DirEntry, EntryStat, ExecOptions, ExecResult, Host};
use fleetssh::services::jobs::JobSupervisor;
use fleetssh::services::local_host::LocalHost;
use fleetssh::services::logger::Logger;
use fleetssh::services::transfer::{
    execute_plan, find_download_conflicts, find_upload_conflicts, plan_download, plan_upload,
    TransferOutcome, TransferRequest, TransferRuntime, TransferService,
};
use fleetssh::stores::pending_store::PendingStore;
use fleetssh::stores::session_store::{JobHandle, JobStatus, SessionStore, TransferDirection};
use fleetssh::utils::paths::StateLayout;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

fn tmp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

fn seed_tree(root: &Path) {
    std::fs::create_dir_all(root.join("sub")).expect("create tree");
    std::fs::write(root.join("a.txt"), "alpha").expect("a.txt");
    std::fs::write(root.join("sub/b.txt"), "bravo!").expect("b.txt");
}

struct Fixture {
    root: PathBuf,
    host: Arc<LocalHost>,
    layout: StateLayout,
    sessions: SessionStore,
    service: TransferService,
    supervisor: JobSupervisor,
}

impl Fixture {
    fn new(prefix: &str) -> Self {
        Self::with_host(prefix, |local| local)
    }

    /// `wrap` decides which host the services see; plan helpers keep the
    /// plain local one.
    fn with_host(prefix: &str, wrap: impl FnOnce(Arc<LocalHost>) -> Arc<dyn Host>) -> Self {
        let root = tmp_dir(prefix);
        let remote_home = root.join("remote");
        std::fs::create_dir_all(&remote_home).expect("remote home");
        let host = Arc::new(LocalHost::new("web1").with_home(remote_home.to_string_lossy().into_owned()));
        let hosts: Arc<dyn HostSource> = Arc::new(StaticHostSource::new(wrap(host.clone())));
        let layout = StateLayout::new(root.join("state"));
        let sessions = SessionStore::new(layout.sessions_dir());
        let pending = PendingStore::new(layout.pending_dir(), None);
        let runtime = Arc::new(TransferRuntime::new());
        let service = TransferService::new(
            Logger::new("test"),
            hosts.clone(),
            sessions.clone(),
            pending,
            layout.clone(),
            runtime.clone(),
        );
        let supervisor = JobSupervisor::new(
            Logger::new("test"),
            hosts,
            sessions.clone(),
            layout.clone(),
            runtime,
        );
        Self {
            root,
            host,
            layout,
            sessions,
            service,
            supervisor,
        }
    }

    fn remote(&self, rel: &str) -> PathBuf {
        self.root.join("remote").join(rel)
    }

    fn request(&self, local: &Path, remote: &str) -> TransferRequest {
        TransferRequest {
            machine: "web1".to_string(),
            local_path: local.to_string_lossy().into_owned(),
            remote_path: remote.to_string(),
        }
    }
}

impl Fixture {
    async fn wait_transfer(&self, session_id: &str) -> fleetssh::stores::session_store::SessionRecord {
        for _ in 0..250 {
            if !self.service.runtime().is_running(session_id) {
                return self.sessions.require(session_id).expect("record");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("transfer {} did not finish", session_id);
    }
}

/// Local host whose uploads wait for a permit, announcing each one first.
struct GatedHost {
    inner: Arc<LocalHost>,
    entered: mpsc::UnboundedSender<String>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl Host for GatedHost {
    fn machine(&self) -> &str {
        self.inner.machine()
    }

    async fn exec(&self, command: &str, options: ExecOptions) -> Result<ExecResult, ToolError> {
        self.inner.exec(command, options).await
    }

    async fn home_dir(&self) -> Result<String, ToolError> {
        self.inner.home_dir().await
    }

    async fn stat(&self, path: &str) -> Result<Option<EntryStat>, ToolError> {
        self.inner.stat(path).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, ToolError> {
        self.inner.read_dir(path).await
    }

    async fn mkdir_p(&self, path: &str) -> Result<(), ToolError> {
        self.inner.mkdir_p(path).await
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<u64, ToolError> {
        let _ = self.entered.send(remote.to_string());
        self.gate.acquire().await.expect("gate open").forget();
        self.inner.put_file(local, remote).await
    }

    async fn get_file(&self, remote: &str, local: &Path) -> Result<u64, ToolError> {
        self.inner.get_file(remote, local).await
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

#[tokio::test]
async fn directory_upload_plan_covers_tree_and_conflicts_after_copy() {
    let fixture = Fixture::new("fleetssh-plan-upload");
    let src = fixture.root.join("src");
    seed_tree(&src);
    let dest = fixture.remote("dest").to_string_lossy().into_owned();

    let plan = plan_upload(fixture.host.as_ref(), &src, &dest)
        .await
        .expect("plan");
    assert!(plan.is_directory);
    assert_eq!(plan.dirs, vec![dest.clone(), format!("{}/sub", dest)]);
    let remotes: Vec<&str> = plan.files.iter().map(|f| f.remote_path.as_str()).collect();
    assert_eq!(remotes, vec![format!("{}/a.txt", dest), format!("{}/sub/b.txt", dest)]);
    assert_eq!(plan.total_bytes, 11);

    assert!(find_upload_conflicts(fixture.host.as_ref(), &plan)
        .await
        .expect("conflicts")
        .is_empty());

    let totals = execute_plan(fixture.host.as_ref(), &plan)
        .await
        .expect("execute");
    assert_eq!(totals.files, 2);
    assert_eq!(totals.bytes, 11);
    assert_eq!(
        std::fs::read_to_string(fixture.remote("dest/sub/b.txt")).expect("copied"),
        "bravo!"
    );

    let again = find_upload_conflicts(fixture.host.as_ref(), &plan)
        .await
        .expect("conflicts");
    assert_eq!(again.len(), 2);
}

#[tokio::test]
async fn single_file_upload_into_directory_keeps_basename() {
    let fixture = Fixture::new("fleetssh-plan-file");
    let src = fixture.root.join("src");
    seed_tree(&src);

    let plan = plan_upload(fixture.host.as_ref(), &src.join("a.txt"), "~/drop/")
        .await
        .expect("plan");
    assert!(!plan.is_directory);
    assert_eq!(plan.files.len(), 1);
    assert_eq!(
        plan.files[0].remote_path,
        format!("{}/a.txt", fixture.remote("drop").display())
    );
    assert_eq!(plan.dirs, vec![fixture.remote("drop").to_string_lossy().into_owned()]);
}

#[tokio::test]
async fn missing_paths_are_not_found() {
    let fixture = Fixture::new("fleetssh-plan-missing");
    let err = plan_upload(fixture.host.as_ref(), &fixture.root.join("nope"), "~/x")
        .await
        .expect_err("missing local");
    assert_eq!(err.code, "NOT_FOUND");

    let err = plan_download(fixture.host.as_ref(), "~/nope", &fixture.root.join("out"))
        .await
        .expect_err("missing remote");
    assert_eq!(err.code, "NOT_FOUND");
}

#[tokio::test]
async fn download_plan_mirrors_remote_tree_and_detects_local_conflicts() {
    let fixture = Fixture::new("fleetssh-plan-download");
    seed_tree(&fixture.remote("data"));
    let out = fixture.root.join("out");

    let plan = plan_download(fixture.host.as_ref(), "~/data", &out)
        .await
        .expect("plan");
    assert!(plan.is_directory);
    assert_eq!(plan.files.len(), 2);
    assert!(plan.dirs.contains(&out.to_string_lossy().into_owned()));
    assert!(plan.dirs.contains(&out.join("sub").to_string_lossy().into_owned()));
    assert!(find_download_conflicts(&plan).is_empty());

    std::fs::create_dir_all(out.join("sub")).expect("out/sub");
    std::fs::write(out.join("sub/b.txt"), "old").expect("existing");
    assert_eq!(
        find_download_conflicts(&plan),
        vec![out.join("sub/b.txt").to_string_lossy().into_owned()]
    );
}

#[tokio::test]
async fn upload_over_existing_files_requires_single_use_token() {
    let fixture = Fixture::new("fleetssh-upload-confirm");
    let src = fixture.root.join("src");
    seed_tree(&src);
    let request = fixture.request(&src, "~/site");

    let first = fixture
        .service
        .transfer(TransferDirection::Upload, &request, None)
        .await
        .expect("first upload");
    assert_eq!(first, TransferOutcome::Completed { files: 2, bytes: 11 });

    std::fs::write(src.join("a.txt"), "ALPHA").expect("edit");
    let gated = fixture
        .service
        .transfer(TransferDirection::Upload, &request, None)
        .await
        .expect("second upload");
    let TransferOutcome::NeedsConfirm {
        confirm_code,
        total,
        sample,
    } = gated
    else {
        panic!("expected confirmation, got {:?}", gated);
    };
    assert_eq!(total, 2);
    assert_eq!(sample.len(), 2);
    assert_eq!(
        std::fs::read_to_string(fixture.remote("site/a.txt")).expect("unchanged"),
        "alpha"
    );

    let other = fixture.request(&src, "~/elsewhere");
    let elsewhere = fixture
        .service
        .transfer(TransferDirection::Upload, &other, Some(&confirm_code))
        .await;
    // No conflicts at the new destination, so the token is not consulted.
    assert!(matches!(elsewhere, Ok(TransferOutcome::Completed { .. })));

    let confirmed = fixture
        .service
        .transfer(TransferDirection::Upload, &request, Some(&confirm_code))
        .await
        .expect("confirmed upload");
    assert_eq!(confirmed, TransferOutcome::Completed { files: 2, bytes: 11 });
    assert_eq!(
        std::fs::read_to_string(fixture.remote("site/a.txt")).expect("overwritten"),
        "ALPHA"
    );

    let reused = fixture
        .service
        .transfer(TransferDirection::Upload, &request, Some(&confirm_code))
        .await
        .expect_err("token is spent");
    assert_eq!(reused.code, "INVALID_CONFIRM_CODE");
}

#[tokio::test]
async fn upload_token_is_bound_to_the_request() {
    let fixture = Fixture::new("fleetssh-upload-mismatch");
    let src = fixture.root.join("src");
    seed_tree(&src);
    let request = fixture.request(&src, "~/site");
    fixture
        .service
        .transfer(TransferDirection::Upload, &request, None)
        .await
        .expect("seed upload");
    fixture
        .service
        .transfer(TransferDirection::Upload, &fixture.request(&src, "~/mirror"), None)
        .await
        .expect("seed mirror");

    let TransferOutcome::NeedsConfirm { confirm_code, .. } = fixture
        .service
        .transfer(TransferDirection::Upload, &request, None)
        .await
        .expect("gated")
    else {
        panic!("expected confirmation");
    };

    let err = fixture
        .service
        .transfer(TransferDirection::Upload, &fixture.request(&src, "~/mirror"), Some(&confirm_code))
        .await
        .expect_err("mismatch");
    assert_eq!(err.code, "CONFIRM_MISMATCH");
}

#[tokio::test]
async fn download_refuses_to_overwrite_local_files() {
    let fixture = Fixture::new("fleetssh-download-conflict");
    seed_tree(&fixture.remote("data"));
    let out = fixture.root.join("out");
    let request = fixture.request(&out, "~/data");

    let done = fixture
        .service
        .transfer(TransferDirection::Download, &request, None)
        .await
        .expect("download");
    assert_eq!(done, TransferOutcome::Completed { files: 2, bytes: 11 });
    assert_eq!(std::fs::read_to_string(out.join("a.txt")).expect("a"), "alpha");

    let again = fixture
        .service
        .transfer(TransferDirection::Download, &request, None)
        .await
        .expect("second download");
    assert_eq!(
        again,
        TransferOutcome::Conflict {
            total: 2,
            sample: vec![
                out.join("a.txt").to_string_lossy().into_owned(),
                out.join("sub/b.txt").to_string_lossy().into_owned(),
            ],
        }
    );
}

#[tokio::test]
async fn async_upload_runs_to_completion_and_reports_progress() {
    let fixture = Fixture::new("fleetssh-upload-async");
    let src = fixture.root.join("src");
    seed_tree(&src);
    let request = fixture.request(&src, "~/bg");

    let started = fixture
        .service
        .start_async(TransferDirection::Upload, &request, None)
        .await
        .expect("start");
    let TransferOutcome::Started {
        session_id,
        bytes_total,
        files,
    } = started
    else {
        panic!("expected a started transfer");
    };
    assert_eq!(bytes_total, 11);
    assert_eq!(files, 2);

    let mut report = None;
    for _ in 0..100 {
        let polled = fixture
            .supervisor
            .poll(&session_id, Some(20))
            .await
            .expect("poll");
        if polled.record.status.is_terminal() {
            report = Some(polled);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let report = report.expect("transfer finished");
    assert_eq!(report.record.status, JobStatus::Done);
    let JobHandle::Transfer { bytes_done, error, .. } = &report.record.handle else {
        panic!("expected a transfer record");
    };
    assert_eq!(*bytes_done, 11);
    assert!(error.is_none());

    let log = report
        .tails
        .and_then(|t| t.log)
        .expect("log tail");
    assert!(log.iter().any(|line| line.contains("upload start")));
    assert!(log.iter().any(|line| line.contains("upload done")));
    assert!(fixture.layout.transfer_log_path(&session_id).exists());
    assert!(!fixture.service.runtime().is_running(&session_id));

    let cancel = fixture
        .supervisor
        .cancel(&session_id, None)
        .await
        .expect("cancel");
    assert_eq!(cancel.status, JobStatus::Done);
    assert_eq!(cancel.note, "session is not running");
    assert_eq!(
        fixture.sessions.require(&session_id).expect("record").status,
        JobStatus::Done
    );

    let err = fixture
        .supervisor
        .grep(&session_id, "upload", fleetssh::services::jobs::GrepRequest::new(None, None))
        .await
        .expect_err("grep on transfer");
    assert_eq!(err.code, "INVALID_PARAMS");
}

fn started_session(outcome: TransferOutcome) -> String {
    match outcome {
        TransferOutcome::Started { session_id, .. } => session_id,
        other => panic!("expected a started transfer, got {:?}", other),
    }
}

#[tokio::test]
async fn async_transfers_create_empty_planned_directories() {
    let fixture = Fixture::new("fleetssh-async-dirs");
    let src = fixture.root.join("src");
    std::fs::create_dir_all(src.join("empty")).expect("empty dir");
    std::fs::create_dir_all(src.join("sub")).expect("sub dir");
    std::fs::write(src.join("sub/b.txt"), "bravo").expect("b.txt");

    let upload = fixture
        .service
        .start_async(TransferDirection::Upload, &fixture.request(&src, "~/tree"), None)
        .await
        .expect("start upload");
    let record = fixture.wait_transfer(&started_session(upload)).await;
    assert_eq!(record.status, JobStatus::Done);
    assert!(fixture.remote("tree/empty").is_dir());
    assert_eq!(
        std::fs::read_to_string(fixture.remote("tree/sub/b.txt")).expect("uploaded"),
        "bravo"
    );

    let out = fixture.root.join("out");
    let download = fixture
        .service
        .start_async(TransferDirection::Download, &fixture.request(&out, "~/tree"), None)
        .await
        .expect("start download");
    let record = fixture.wait_transfer(&started_session(download)).await;
    assert_eq!(record.status, JobStatus::Done);
    assert!(out.join("empty").is_dir());
    assert_eq!(std::fs::read_to_string(out.join("sub/b.txt")).expect("downloaded"), "bravo");
}

#[tokio::test]
async fn cancelling_async_upload_stops_after_file_in_flight() {
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Semaphore::new(0));
    let gate_for_host = gate.clone();
    let fixture = Fixture::with_host("fleetssh-async-cancel", move |local| {
        Arc::new(GatedHost {
            inner: local,
            entered: entered_tx,
            gate: gate_for_host,
        })
    });
    let src = fixture.root.join("src");
    std::fs::create_dir_all(&src).expect("src");
    for n in 0..5 {
        std::fs::write(src.join(format!("f{}.txt", n)), "data").expect("seed file");
    }

    let session_id = started_session(
        fixture
            .service
            .start_async(TransferDirection::Upload, &fixture.request(&src, "~/bulk"), None)
            .await
            .expect("start"),
    );
    let first = entered_rx.recv().await.expect("first file in flight");
    assert!(first.ends_with("f0.txt"));

    let cancel = fixture
        .supervisor
        .cancel(&session_id, None)
        .await
        .expect("cancel");
    assert_eq!(cancel.status, JobStatus::Cancelled);
    assert_eq!(cancel.note, "aborted");
    gate.add_permits(16);

    let record = fixture.wait_transfer(&session_id).await;
    assert_eq!(record.status, JobStatus::Cancelled);
    let JobHandle::Transfer {
        bytes_done,
        bytes_total,
        error,
        ..
    } = &record.handle
    else {
        panic!("expected a transfer record");
    };
    assert_eq!(error.as_deref(), Some("cancelled"));
    assert_eq!(*bytes_total, 20);
    assert_eq!(*bytes_done, 4);
    assert!(fixture.remote("bulk/f0.txt").exists());
    assert!(!fixture.remote("bulk/f1.txt").exists());
    assert!(entered_rx.try_recv().is_err());

    let log = std::fs::read_to_string(fixture.layout.transfer_log_path(&session_id)).expect("log");
    assert!(log.contains("upload failed: cancelled"));
}
