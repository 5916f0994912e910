mod common;
use common::ENV_LOCK;

use fleetssh::app::App;
use fleetssh::stores::session_store::{
    JobHandle, JobStatus, SessionRecord, SessionStore, TransferDirection,
};
use fleetssh::utils::paths::StateLayout;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn tmp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

fn app(root: &Path) -> App {
    for name in [
        "FLEETSSH_MAX_CONNECTIONS",
        "FLEETSSH_IDLE_TTL_SECONDS",
        "FLEETSSH_RETENTION_DAYS",
    ] {
        std::env::remove_var(name);
    }
    App::initialize_with(StateLayout::new(root.join("state"))).expect("app")
}

fn result(envelope: &Value) -> &Value {
    assert_eq!(envelope.get("ok").and_then(Value::as_bool), Some(true));
    envelope.get("result").expect("result")
}

#[tokio::test]
async fn exec_runs_on_local_machine_with_envelope() {
    let _guard = ENV_LOCK.lock().await;
    let root = tmp_dir("fleetssh-dispatch-exec");
    let app = app(&root);

    let envelope = app
        .call(
            "exec",
            json!({ "action": "exec", "machine": "local", "command": "echo hi; exit 4", "trace_id": "t-1" }),
        )
        .await
        .expect("exec");
    let out = result(&envelope);
    assert_eq!(out["stdout"], "hi\n");
    assert_eq!(out["exit_code"], 4);
    assert_eq!(out["success"], false);
    assert_eq!(envelope["meta"]["tool"], "exec");
    assert_eq!(envelope["meta"]["action"], "exec");
    assert_eq!(envelope["meta"]["trace_id"], "t-1");

    app.shutdown().await;
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn destructive_exec_goes_through_confirmation() {
    let _guard = ENV_LOCK.lock().await;
    let root = tmp_dir("fleetssh-dispatch-confirm");
    let victim = root.join("victim");
    std::fs::create_dir_all(victim.join("inner")).expect("victim");
    let app = app(&root);
    let command = format!("rm -rf {}", victim.display());

    let first = app
        .call("exec", json!({ "action": "exec", "machine": "local", "command": command }))
        .await
        .expect("first");
    let first = result(&first);
    assert_eq!(first["confirm_required"], true);
    assert!(victim.exists());
    let code = first["confirm_code"].as_str().expect("code").to_string();

    let second = app
        .call(
            "exec",
            json!({ "action": "exec", "machine": "local", "command": command, "confirm_code": code }),
        )
        .await
        .expect("second");
    assert_eq!(result(&second)["success"], true);
    assert!(!victim.exists());

    let third = app
        .call(
            "exec",
            json!({ "action": "exec", "machine": "local", "command": command, "confirm_code": code }),
        )
        .await
        .expect("third");
    let third = result(&third);
    assert_eq!(third["blocked"], true);
    assert_eq!(third["reason"], "invalid_confirm_code");

    app.shutdown().await;
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn plain_exec_refuses_sudo() {
    let _guard = ENV_LOCK.lock().await;
    let root = tmp_dir("fleetssh-dispatch-sudo");
    let app = app(&root);

    let envelope = app
        .call("exec", json!({ "action": "exec", "machine": "local", "command": "sudo id" }))
        .await
        .expect("exec");
    let out = result(&envelope);
    assert_eq!(out["blocked"], true);
    assert_eq!(out["reason"], "sudo_not_allowed");

    app.shutdown().await;
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn async_job_round_trip_through_jobs_tool() {
    let _guard = ENV_LOCK.lock().await;
    let root = tmp_dir("fleetssh-dispatch-jobs");
    let app = app(&root);

    let started = app
        .call(
            "jobs",
            json!({ "action": "exec_async", "machine": "local", "command": "echo started; echo fine" }),
        )
        .await
        .expect("start");
    let started = result(&started);
    assert_eq!(started["success"], true);
    assert_eq!(started["kind"], "local_process");
    let session_id = started["session_id"].as_str().expect("session id").to_string();

    let mut last = Value::Null;
    for _ in 0..200 {
        let polled = app
            .call(
                "jobs",
                json!({ "action": "get_result", "session_id": session_id, "lines": 10 }),
            )
            .await
            .expect("poll");
        last = result(&polled).clone();
        if last["status"] != "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(last["status"], "done");
    assert_eq!(last["exit_code"], 0);
    assert_eq!(last["tails"]["stdout"], json!(["started", "fine"]));

    let grep = app
        .call(
            "jobs",
            json!({ "action": "grep_result", "session_id": session_id, "pattern": "FINE", "context_lines": 0 }),
        )
        .await
        .expect("grep");
    assert_eq!(result(&grep)["stdout"]["lines"], json!(["2:fine"]));

    let cancel = app
        .call("jobs", json!({ "action": "cancel", "session_id": session_id }))
        .await
        .expect("cancel");
    assert_eq!(result(&cancel)["status"], "done");

    app.shutdown().await;
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn sleep_is_bounded() {
    let _guard = ENV_LOCK.lock().await;
    let root = tmp_dir("fleetssh-dispatch-sleep");
    let app = app(&root);

    let slept = app
        .call("jobs", json!({ "action": "sleep", "ms": 5 }))
        .await
        .expect("sleep");
    assert_eq!(result(&slept)["slept_ms"], 5);

    let err = app
        .call("jobs", json!({ "action": "sleep", "ms": 60_001 }))
        .await
        .expect_err("too long");
    assert_eq!(err.code, "INVALID_PARAMS");

    app.shutdown().await;
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn unknown_tools_actions_and_ids_are_invalid_params() {
    let _guard = ENV_LOCK.lock().await;
    let root = tmp_dir("fleetssh-dispatch-unknown");
    let app = app(&root);

    let err = app
        .call("transfers", json!({ "action": "upload" }))
        .await
        .expect_err("unknown tool");
    assert_eq!(err.code, "INVALID_PARAMS");
    assert!(err.hint.unwrap_or_default().contains("transfer"));

    let err = app
        .call("jobs", json!({ "action": "get_results" }))
        .await
        .expect_err("unknown action");
    assert_eq!(err.code, "INVALID_PARAMS");
    let details = err.details.expect("details");
    assert_eq!(details["did_you_mean"][0], "get_result");

    let err = app
        .call("jobs", json!({ "action": "get_result", "session_id": "../../etc" }))
        .await
        .expect_err("bad id");
    assert_eq!(err.code, "INVALID_PARAMS");

    let err = app
        .call("exec", json!({ "action": "exec", "machine": "local" }))
        .await
        .expect_err("missing command");
    assert_eq!(err.code, "INVALID_PARAMS");

    app.shutdown().await;
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn malformed_destination_is_rejected_before_connecting() {
    let _guard = ENV_LOCK.lock().await;
    let root = tmp_dir("fleetssh-dispatch-machine");
    let app = app(&root);

    let err = app
        .call("exec", json!({ "action": "exec", "machine": "ops@ghost:notaport", "command": "uptime" }))
        .await
        .expect_err("bad destination");
    assert_eq!(err.code, "INVALID_PARAMS");
    assert!(app.pool.is_empty());

    app.shutdown().await;
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn transfer_tool_gates_overwrites() {
    let _guard = ENV_LOCK.lock().await;
    let root = tmp_dir("fleetssh-dispatch-transfer");
    let src = root.join("src");
    std::fs::create_dir_all(src.join("sub")).expect("src");
    std::fs::write(src.join("a.txt"), "alpha").expect("a");
    std::fs::write(src.join("sub/b.txt"), "bravo").expect("b");
    let dest = root.join("dest").to_string_lossy().into_owned();
    let app = app(&root);
    let upload = json!({
        "action": "upload",
        "machine": "local",
        "local_path": src.to_string_lossy(),
        "remote_path": dest,
    });

    let first = app.call("transfer", upload.clone()).await.expect("upload");
    let first = result(&first);
    assert_eq!(first["success"], true);
    assert_eq!(first["outcome"], "completed");
    assert_eq!(first["files"], 2);

    let second = app.call("transfer", upload.clone()).await.expect("re-upload");
    let second = result(&second);
    assert_eq!(second["success"], false);
    assert_eq!(second["conflict"], true);
    assert_eq!(second["total"], 2);
    let code = second["confirm_code"].as_str().expect("code").to_string();

    let mut confirmed = upload.clone();
    confirmed["confirm_code"] = json!(code);
    let third = app.call("transfer", confirmed).await.expect("confirmed");
    assert_eq!(result(&third)["outcome"], "completed");

    let download = app
        .call(
            "transfer",
            json!({
                "action": "download",
                "machine": "local",
                "local_path": src.to_string_lossy(),
                "remote_path": dest,
            }),
        )
        .await
        .expect("download");
    let download = result(&download);
    assert_eq!(download["outcome"], "conflict");
    assert_eq!(download["conflict"], true);
    assert!(download.get("confirm_code").is_none());

    app.shutdown().await;
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn background_tasks_expire_old_sessions() {
    let _guard = ENV_LOCK.lock().await;
    let root = tmp_dir("fleetssh-dispatch-background");
    let app = app(&root);
    let sessions = SessionStore::new(app.layout.sessions_dir());

    let session_id = uuid::Uuid::new_v4().to_string();
    let mut old = SessionRecord::new(
        session_id.clone(),
        "local",
        JobHandle::Transfer {
            direction: TransferDirection::Upload,
            local_path: "/tmp/a".to_string(),
            remote_path: "/srv/a".to_string(),
            bytes_total: 1,
            bytes_done: 1,
            transfer_log_path: app.layout.transfer_log_path(&session_id),
            error: None,
        },
    );
    old.observe(JobStatus::Done, None);
    let then = chrono::Utc::now() - chrono::Duration::days(30);
    old.created_at = then;
    old.updated_at = then;
    sessions.save(&old).expect("save");

    app.start_background();
    app.start_background();
    for _ in 0..100 {
        if sessions.load(&session_id).expect("load").is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(sessions.load(&session_id).expect("load").is_none());

    app.shutdown().await;
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn fleet_info_refreshes_and_serves_cached_inventory() {
    let _guard = ENV_LOCK.lock().await;
    let root = tmp_dir("fleetssh-dispatch-fleet");
    let app = app(&root);

    let listed = app
        .call("fleet", json!({ "action": "list" }))
        .await
        .expect("list");
    assert_eq!(result(&listed)["machines"], json!(["local"]));

    let err = app
        .call("fleet", json!({ "action": "info", "machine": "local" }))
        .await
        .expect_err("nothing cached yet");
    assert_eq!(err.code, "NOT_FOUND");
    assert!(err.hint.unwrap_or_default().contains("refresh=true"));

    let refreshed = app
        .call("fleet", json!({ "action": "info", "machine": "local", "refresh": true }))
        .await
        .expect("refresh");
    let fresh = result(&refreshed).clone();
    assert_eq!(fresh["name"], "local");
    assert!(fresh["arch"].as_str().is_some_and(|arch| !arch.is_empty()));
    assert!(root.join("state").join("inventory.json").exists());

    let cached = app
        .call("fleet", json!({ "action": "info", "machine": "local" }))
        .await
        .expect("cached");
    assert_eq!(result(&cached)["updated_at"], fresh["updated_at"]);

    let selected = app
        .call("fleet", json!({ "action": "list", "target": ["arch", "nope"] }))
        .await
        .expect("list with target");
    let selected = result(&selected);
    assert_eq!(selected["target"], json!(["arch", "nope"]));
    assert_eq!(selected["machines"][0]["name"], "local");
    assert_eq!(selected["machines"][0]["arch"], fresh["arch"]);
    assert!(selected["machines"][0].get("nope").is_none());
    assert!(selected["machines"][0].get("os").is_none());

    app.shutdown().await;
    let _ = std::fs::remove_dir_all(&root);
}
