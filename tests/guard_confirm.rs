use fleetssh::services::guard::{BlockReason, GuardDecision, GuardRequest, RuleSet, SecurityGuard};
use fleetssh::services::local_host::LocalHost;
use fleetssh::services::logger::Logger;
use fleetssh::stores::pending_store::PendingStore;
use std::path::PathBuf;

fn tmp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

struct Fixture {
    root: PathBuf,
    host: LocalHost,
    guard: SecurityGuard,
}

impl Fixture {
    fn new(prefix: &str) -> Self {
        let root = tmp_dir(prefix);
        std::fs::create_dir_all(root.join("victim/nested")).expect("create victim");
        std::fs::write(root.join("victim/a.log"), "a").expect("write a");
        std::fs::write(root.join("victim/nested/b.log"), "b").expect("write b");
        let pending = PendingStore::new(root.join("pending"), None);
        let host = LocalHost::new("local").with_home(root.to_string_lossy().into_owned());
        let guard = SecurityGuard::new(Logger::new("test"), RuleSet::builtin(), pending);
        Self { root, host, guard }
    }

    async fn evaluate(&self, machine: &str, command: &str, code: Option<&str>) -> GuardDecision {
        self.guard
            .evaluate(
                &self.host,
                GuardRequest {
                    machine,
                    command,
                    allow_sudo: false,
                    confirm_code: code,
                },
            )
            .await
            .expect("guard decision")
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn confirm_code(decision: &GuardDecision) -> String {
    match decision {
        GuardDecision::Confirm { confirm_code, .. } => confirm_code.clone(),
        other => panic!("expected confirmation, got {:?}", other),
    }
}

fn block_reason(decision: &GuardDecision) -> BlockReason {
    match decision {
        GuardDecision::Block { reason, .. } => *reason,
        other => panic!("expected block, got {:?}", other),
    }
}

#[tokio::test]
async fn recursive_delete_needs_confirmation_with_preview() {
    let fixture = Fixture::new("fleetssh-guard-preview");
    let target = fixture.root.join("victim");
    let command = format!("rm -rf {}", target.display());

    let decision = fixture.evaluate("local", &command, None).await;
    let GuardDecision::Confirm {
        confirm_code,
        preview,
        message,
    } = decision
    else {
        panic!("expected confirmation");
    };
    assert!(uuid::Uuid::parse_str(&confirm_code).is_ok());
    assert!(preview.total >= 1);
    assert!(!preview.truncated);
    assert!(preview
        .sample
        .iter()
        .any(|p| p == &target.to_string_lossy()));
    assert!(message.contains("confirm_code"));
    assert!(target.exists(), "guard must not run the command");
}

#[tokio::test]
async fn confirm_code_allows_exactly_once() {
    let fixture = Fixture::new("fleetssh-guard-once");
    let command = format!("rm -r {}", fixture.root.join("victim").display());

    let code = confirm_code(&fixture.evaluate("local", &command, None).await);
    assert!(fixture.evaluate("local", &command, Some(&code)).await.is_allow());
    assert_eq!(
        block_reason(&fixture.evaluate("local", &command, Some(&code)).await),
        BlockReason::InvalidConfirmCode
    );
}

#[tokio::test]
async fn confirm_code_is_bound_to_machine_and_command() {
    let fixture = Fixture::new("fleetssh-guard-bound");
    let command = format!("rm -r {}", fixture.root.join("victim").display());
    let other = format!("rm -r {}", fixture.root.join("victim/nested").display());

    let code = confirm_code(&fixture.evaluate("local", &command, None).await);
    assert_eq!(
        block_reason(&fixture.evaluate("web1", &command, Some(&code)).await),
        BlockReason::ConfirmMismatch
    );
    assert_eq!(
        block_reason(&fixture.evaluate("local", &other, Some(&code)).await),
        BlockReason::ConfirmMismatch
    );
    // A mismatch does not burn the token.
    assert!(fixture.evaluate("local", &command, Some(&code)).await.is_allow());
}

#[tokio::test]
async fn unknown_confirm_code_is_rejected() {
    let fixture = Fixture::new("fleetssh-guard-unknown");
    let command = format!("rm -r {}", fixture.root.join("victim").display());
    let bogus = uuid::Uuid::new_v4().to_string();

    assert_eq!(
        block_reason(&fixture.evaluate("local", &command, Some(&bogus)).await),
        BlockReason::InvalidConfirmCode
    );
    assert_eq!(
        block_reason(&fixture.evaluate("local", &command, Some("not-a-token")).await),
        BlockReason::InvalidConfirmCode
    );
}

#[tokio::test]
async fn root_delete_is_blocked_even_with_a_code() {
    let fixture = Fixture::new("fleetssh-guard-root");
    let bogus = uuid::Uuid::new_v4().to_string();

    assert_eq!(
        block_reason(&fixture.evaluate("local", "rm -rf /", None).await),
        BlockReason::RootDeleteBlocked
    );
    assert_eq!(
        block_reason(&fixture.evaluate("local", "rm -rf /*", Some(&bogus)).await),
        BlockReason::RootDeleteBlocked
    );
}

#[tokio::test]
async fn sudo_and_lockout_rules_block_before_preview() {
    let fixture = Fixture::new("fleetssh-guard-rules");

    assert_eq!(
        block_reason(&fixture.evaluate("local", "sudo ls /root", None).await),
        BlockReason::SudoNotAllowed
    );
    assert_eq!(
        block_reason(&fixture.evaluate("local", "ufw status", None).await),
        BlockReason::BlockedExecutable
    );
    assert_eq!(
        block_reason(&fixture.evaluate("local", "mkfs.ext4 /dev/sdb1", None).await),
        BlockReason::BlockedPattern
    );
    assert!(fixture.evaluate("local", "uptime", None).await.is_allow());
}

#[tokio::test]
async fn expired_confirm_code_is_rejected() {
    let root = tmp_dir("fleetssh-guard-ttl");
    std::fs::create_dir_all(root.join("victim")).expect("create victim");
    let pending = PendingStore::new(root.join("pending"), Some(chrono::Duration::zero()));
    let host = LocalHost::new("local").with_home(root.to_string_lossy().into_owned());
    let guard = SecurityGuard::new(Logger::new("test"), RuleSet::builtin(), pending);
    let command = format!("rm -r {}", root.join("victim").display());

    let first = guard
        .evaluate(
            &host,
            GuardRequest {
                machine: "local",
                command: &command,
                allow_sudo: false,
                confirm_code: None,
            },
        )
        .await
        .expect("first");
    let code = confirm_code(&first);
    let second = guard
        .evaluate(
            &host,
            GuardRequest {
                machine: "local",
                command: &command,
                allow_sudo: false,
                confirm_code: Some(&code),
            },
        )
        .await
        .expect("second");
    assert_eq!(block_reason(&second), BlockReason::InvalidConfirmCode);

    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn unparseable_delete_is_refused_without_preview() {
    let fixture = Fixture::new("fleetssh-guard-unbalanced");
    let command = format!("rm -rf \"{}", fixture.root.join("victim").display());

    let decision = fixture.evaluate("local", &command, None).await;
    assert_eq!(block_reason(&decision), BlockReason::RequiresConfirmNoPreview);
    assert!(fixture.root.join("victim/a.log").exists());
}
