use crate::constants::limits::{PREVIEW_PATH_LIMIT, PREVIEW_SAMPLE};
use crate::errors::ToolError;
use crate::services::config::SecurityConfig;
use crate::services::host::{CaptureLimits, ExecOptions, Host};
use crate::services::logger::Logger;
use crate::stores::pending_store::{DeletePreview, PendingAction, PendingStore};
use crate::utils::shell::{quote_args, quote_for_sh};
use crate::utils::user_paths::expand_home_shorthand;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::Serialize;

const BUILTIN_DENY_REGEX: &[&str] = &[
    r"\bufw\s+disable\b",
    r"\bsystemctl\s+(stop|disable)\s+(ufw|firewalld)\b",
    r"\biptables\b.*\b(-P\s+INPUT\s+ACCEPT|-P\s+INPUT\s+DROP|-F\b|-X\b)\b",
    r"\bnft\s+flush\s+ruleset\b",
    r"\bfirewall-cmd\b.*--add-port\s*=?\s*1-65535/(tcp|udp)\b",
    r"\bdd\b.*\bof=/dev/(sd[a-z]|nvme\d+n\d+)\b",
    r"\bmkfs\.[a-z0-9]+\s+/dev/",
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:\s*",
];

const BUILTIN_DENY_EXECUTABLES: &[&str] = &["iptables", "ufw", "nft", "firewall-cmd"];

const BUILTIN_CONFIRM_REGEX: &[&str] = &[r"\brm\b\s+-\S*[rR]\S*", r"\brm\b\s+--recursive\b"];

static SUDO_WORD: Lazy<Option<Regex>> = Lazy::new(|| compile(r"(^|[\s;&|()])sudo(\s|$)"));

const TOTAL_MARKER: &str = "__FLEETSSH_TOTAL__:";
const TRUNCATED_MARKER: &str = "__FLEETSSH_TRUNCATED__:";

fn compile(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .ok()
}

fn executable_pattern(name: &str) -> Option<Regex> {
    compile(&format!(
        r"(^|[\s;&|()])(?:sudo\s+)?(?:\S*/)?{}\b",
        regex::escape(name)
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    SudoNotAllowed,
    BlockedExecutable,
    BlockedPattern,
    InvalidConfirmCode,
    ConfirmMismatch,
    RequiresConfirmNoPreview,
    RootDeleteBlocked,
}

/// Outcome of checking a command against the rule set alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block(BlockReason, String),
    NeedsConfirm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum GuardDecision {
    Allow,
    Block {
        reason: BlockReason,
        message: String,
    },
    Confirm {
        confirm_code: String,
        message: String,
        preview: DeletePreview,
    },
}

impl GuardDecision {
    fn block(reason: BlockReason, message: impl Into<String>) -> Self {
        GuardDecision::Block {
            reason,
            message: message.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, GuardDecision::Allow)
    }
}

#[derive(Debug, Clone)]
struct Rule {
    source: String,
    regex: Regex,
}

/// Built-in rules plus user additions, compiled once.
#[derive(Debug, Clone)]
pub struct RuleSet {
    deny_regex: Vec<Rule>,
    deny_executables: Vec<Rule>,
    confirm_regex: Vec<Rule>,
}

impl RuleSet {
    pub fn builtin() -> Self {
        Self::from_config(&SecurityConfig::default(), None)
    }

    /// Invalid user patterns are skipped. Built-ins always apply.
    pub fn from_config(config: &SecurityConfig, logger: Option<&Logger>) -> Self {
        let build = |builtins: &[&str], extra: &[String], make: fn(&str) -> Option<Regex>| {
            builtins
                .iter()
                .map(|s| s.to_string())
                .chain(extra.iter().map(|s| s.trim().to_string()))
                .filter(|s| !s.is_empty())
                .filter_map(|source| match make(&source) {
                    Some(regex) => Some(Rule { source, regex }),
                    None => {
                        if let Some(logger) = logger {
                            logger.warn(
                                "skipping invalid security pattern",
                                Some(&serde_json::json!({ "pattern": source })),
                            );
                        }
                        None
                    }
                })
                .collect::<Vec<_>>()
        };
        Self {
            deny_regex: build(BUILTIN_DENY_REGEX, &config.deny_regex, compile),
            deny_executables: build(
                BUILTIN_DENY_EXECUTABLES,
                &config.deny_executables,
                executable_pattern,
            ),
            confirm_regex: build(BUILTIN_CONFIRM_REGEX, &config.require_confirm_regex, compile),
        }
    }

    pub fn blocked_executable(&self, command: &str) -> Option<&str> {
        self.deny_executables
            .iter()
            .find(|rule| rule.regex.is_match(command))
            .map(|rule| rule.source.as_str())
    }

    pub fn blocked_pattern(&self, command: &str) -> Option<&str> {
        self.deny_regex
            .iter()
            .find(|rule| rule.regex.is_match(command))
            .map(|rule| rule.source.as_str())
    }

    pub fn requires_confirm(&self, command: &str) -> bool {
        is_recursive_rm(command) || self.confirm_regex.iter().any(|r| r.regex.is_match(command))
    }

    pub fn classify(&self, command: &str, allow_sudo: bool) -> Verdict {
        if !allow_sudo && is_sudo_invocation(command) {
            return Verdict::Block(
                BlockReason::SudoNotAllowed,
                "This action does not allow sudo. Use the sudo variant instead (passwordless sudo only)."
                    .to_string(),
            );
        }
        if let Some(exe) = self.blocked_executable(command) {
            return Verdict::Block(
                BlockReason::BlockedExecutable,
                format!("Blocked high-risk executable: {}", exe),
            );
        }
        if let Some(pattern) = self.blocked_pattern(command) {
            return Verdict::Block(
                BlockReason::BlockedPattern,
                format!("Blocked by security policy pattern: {}", pattern),
            );
        }
        if self.requires_confirm(command) {
            return Verdict::NeedsConfirm;
        }
        Verdict::Allow
    }
}

pub fn is_sudo_invocation(command: &str) -> bool {
    SUDO_WORD
        .as_ref()
        .map(|re| re.is_match(command))
        .unwrap_or_else(|| command.contains("sudo"))
}

fn rm_index(words: &[String]) -> Option<usize> {
    words.iter().position(|w| w == "rm" || w.ends_with("/rm"))
}

/// Unbalanced quotes fall back to whitespace words so the command still
/// reaches the confirmation flow, where it is refused for lack of targets.
pub fn is_recursive_rm(command: &str) -> bool {
    let words = shlex::split(command)
        .unwrap_or_else(|| command.split_whitespace().map(str::to_string).collect());
    let Some(index) = rm_index(&words) else {
        return false;
    };
    for word in &words[index + 1..] {
        if word == "--" {
            break;
        }
        if word == "--recursive" {
            return true;
        }
        if !word.starts_with('-') {
            break;
        }
        if word.contains('r') || word.contains('R') {
            return true;
        }
    }
    false
}

/// `None` when the command line cannot be split into shell words.
pub fn extract_rm_targets(command: &str) -> Option<Vec<String>> {
    let words = shlex::split(command)?;
    let Some(index) = rm_index(&words) else {
        return Some(Vec::new());
    };
    Some(
        words[index + 1..]
            .iter()
            .filter(|w| !w.is_empty() && w.as_str() != "--" && !w.starts_with('-'))
            .cloned()
            .collect(),
    )
}

pub fn is_root_delete(targets: &[String]) -> bool {
    targets
        .iter()
        .any(|t| t == "/" || t == "/*" || t.starts_with("/ --"))
}

fn confirm_message(preview: &DeletePreview) -> String {
    format!(
        "DANGEROUS OPERATION DETECTED.\n\
         This command can permanently delete files and was not executed.\n\
         Previewed {}{} affected paths.\n\
         If you are certain, re-run the SAME command on the SAME machine with confirm_code.\n\
         Before confirming, review the sampled paths and explain why each is safe to delete.",
        preview.total,
        if preview.truncated { "+" } else { "" }
    )
}

fn preview_script() -> String {
    [
        "set -eu".to_string(),
        format!("limit={}", PREVIEW_PATH_LIMIT),
        format!(
            "(for p in \"$@\"; do if [ -e \"$p\" ]; then find \"$p\" -print 2>/dev/null; fi; done) \
             | head -n $limit \
             | awk -v limit=$limit 'NR<={sample}{{print}} END{{print \"{total}\" NR; print \"{trunc}\" (NR>=limit?\"true\":\"false\")}}'",
            sample = PREVIEW_SAMPLE,
            total = TOTAL_MARKER,
            trunc = TRUNCATED_MARKER,
        ),
    ]
    .join("; ")
}

fn parse_preview(stdout: &str) -> Option<DeletePreview> {
    let mut sample = Vec::new();
    let mut total = None;
    let mut truncated = false;
    for line in stdout.lines().map(|l| l.trim_end_matches('\r')) {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix(TOTAL_MARKER) {
            total = rest.trim().parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix(TRUNCATED_MARKER) {
            truncated = rest.trim() == "true";
        } else if sample.len() < PREVIEW_SAMPLE {
            sample.push(line.to_string());
        }
    }
    Some(DeletePreview {
        preview_type: "rm-preview".to_string(),
        total: total?,
        truncated,
        sample,
    })
}

pub struct GuardRequest<'a> {
    pub machine: &'a str,
    pub command: &'a str,
    pub allow_sudo: bool,
    pub confirm_code: Option<&'a str>,
}

pub struct SecurityGuard {
    logger: Logger,
    rules: RuleSet,
    pending: PendingStore,
}

impl SecurityGuard {
    pub fn new(logger: Logger, rules: RuleSet, pending: PendingStore) -> Self {
        Self {
            logger: logger.child("guard"),
            rules,
            pending,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub async fn evaluate(
        &self,
        host: &dyn Host,
        request: GuardRequest<'_>,
    ) -> Result<GuardDecision, ToolError> {
        let decision = match self.rules.classify(request.command, request.allow_sudo) {
            Verdict::Allow => GuardDecision::Allow,
            Verdict::Block(reason, message) => GuardDecision::block(reason, message),
            Verdict::NeedsConfirm => self.confirm_flow(host, &request).await?,
        };
        match &decision {
            GuardDecision::Allow => {}
            GuardDecision::Block { reason, .. } => self.logger.info(
                "blocked command",
                Some(&serde_json::json!({ "machine": request.machine, "reason": reason })),
            ),
            GuardDecision::Confirm { preview, .. } => self.logger.info(
                "confirmation required",
                Some(&serde_json::json!({
                    "machine": request.machine,
                    "total": preview.total,
                    "truncated": preview.truncated,
                })),
            ),
        }
        Ok(decision)
    }

    async fn confirm_flow(
        &self,
        host: &dyn Host,
        request: &GuardRequest<'_>,
    ) -> Result<GuardDecision, ToolError> {
        let targets = extract_rm_targets(request.command).unwrap_or_default();
        if is_root_delete(&targets) {
            return Ok(GuardDecision::block(
                BlockReason::RootDeleteBlocked,
                "Refusing to run: this appears to delete the root filesystem.",
            ));
        }
        if let Some(code) = request.confirm_code.filter(|c| !c.trim().is_empty()) {
            return self.redeem(code, request);
        }
        if targets.is_empty() {
            return Ok(GuardDecision::block(
                BlockReason::RequiresConfirmNoPreview,
                "Destructive command requires confirmation but its targets cannot be previewed. \
                 Rewrite it into an explicit `rm -r <path>` form.",
            ));
        }
        let preview = self.preview(host, &targets).await;
        let confirm_code = self.pending.create(PendingAction::Exec {
            machine: request.machine.to_string(),
            command: request.command.to_string(),
            preview: preview.clone(),
        })?;
        Ok(GuardDecision::Confirm {
            confirm_code,
            message: confirm_message(&preview),
            preview,
        })
    }

    fn redeem(&self, code: &str, request: &GuardRequest<'_>) -> Result<GuardDecision, ToolError> {
        let invalid = || {
            GuardDecision::block(
                BlockReason::InvalidConfirmCode,
                "Invalid confirm code. Re-run the command without confirm_code to get a new preview.",
            )
        };
        let Some(record) = self.pending.load(code)? else {
            return Ok(invalid());
        };
        let PendingAction::Exec {
            machine, command, ..
        } = &record.action
        else {
            return Ok(invalid());
        };
        if machine != request.machine || command != request.command {
            return Ok(GuardDecision::block(
                BlockReason::ConfirmMismatch,
                "Confirm code does not match this command/machine. Re-run without confirm_code to preview again.",
            ));
        }
        if !self.pending.consume(code)? {
            return Ok(invalid());
        }
        Ok(GuardDecision::Allow)
    }

    /// Bounded enumeration of what `rm` would touch. Falls back to a plain
    /// existence check when the host lacks the tooling for it.
    pub async fn preview(&self, host: &dyn Host, targets: &[String]) -> DeletePreview {
        match self.enumerate(host, targets).await {
            Ok(preview) => preview,
            Err(err) => {
                self.logger.warn(
                    "preview degraded to existence check",
                    Some(&serde_json::json!({ "machine": host.machine(), "error": err.message })),
                );
                existence_preview(host, targets).await
            }
        }
    }

    async fn enumerate(&self, host: &dyn Host, targets: &[String]) -> Result<DeletePreview, ToolError> {
        let home = host.home_dir().await?;
        let expanded: Vec<String> = targets
            .iter()
            .map(|t| expand_home_shorthand(t, &home))
            .collect();
        let command = format!(
            "sh -lc {} sh {}",
            quote_for_sh(&preview_script()),
            quote_args(&expanded)
        );
        let result = host
            .exec(
                &command,
                ExecOptions::with_limits(CaptureLimits::new(64 * 1024, 8 * 1024)),
            )
            .await?;
        if !result.succeeded() || result.stderr.contains("not found") {
            return Err(ToolError::internal(format!(
                "preview script failed: {}",
                result.combined_output()
            )));
        }
        parse_preview(&result.stdout)
            .ok_or_else(|| ToolError::internal("preview script produced no totals"))
    }
}

async fn existence_preview(host: &dyn Host, targets: &[String]) -> DeletePreview {
    let mut existing = Vec::new();
    for target in targets {
        if let Ok(Some(_)) = host.stat(target).await {
            existing.push(target.clone());
        }
    }
    DeletePreview {
        preview_type: "rm-preview".to_string(),
        total: existing.len() as u64,
        truncated: false,
        sample: existing.into_iter().take(PREVIEW_SAMPLE).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_rm_detection_honors_flag_clusters() {
        assert!(is_recursive_rm("rm -rf /tmp/x"));
        assert!(is_recursive_rm("sudo /bin/rm -v -R build"));
        assert!(is_recursive_rm("rm --recursive logs"));
        assert!(!is_recursive_rm("rm -f file.txt"));
        assert!(!is_recursive_rm("rm -- -r"));
        assert!(!is_recursive_rm("rm file -r"));
        assert!(!is_recursive_rm("echo rmdir -r"));
    }

    #[test]
    fn targets_skip_flags_and_separator() {
        assert_eq!(
            extract_rm_targets(r#"rm -rf -- "/srv/my app" ~/cache 'a''b' ''"#),
            Some(vec!["/srv/my app".to_string(), "~/cache".to_string(), "ab".to_string()])
        );
        assert_eq!(extract_rm_targets("find . -delete"), Some(Vec::new()));
    }

    #[test]
    fn unbalanced_quotes_have_no_targets_but_still_need_confirmation() {
        let command = r#"rm -rf "/srv/app"#;
        assert!(is_recursive_rm(command));
        assert_eq!(extract_rm_targets(command), None);
    }

    #[test]
    fn root_targets_are_detected() {
        assert!(is_root_delete(&["/".to_string()]));
        assert!(is_root_delete(&["/tmp".to_string(), "/*".to_string()]));
        assert!(!is_root_delete(&["/etc".to_string()]));
    }

    #[test]
    fn builtin_rules_block_lockout_commands() {
        let rules = RuleSet::builtin();
        assert_eq!(rules.blocked_executable("sudo /usr/sbin/iptables -L"), Some("iptables"));
        assert_eq!(rules.blocked_executable("echo ok; ufw status"), Some("ufw"));
        assert_eq!(rules.blocked_executable("cat nftables.conf"), None);
        assert!(rules.blocked_pattern("dd if=/dev/zero of=/dev/sda bs=1M").is_some());
        assert!(rules.blocked_pattern("MKFS.ext4 /dev/sdb1").is_some());
        assert!(rules.blocked_pattern(":(){ :|:& };:").is_some());
        assert!(rules.blocked_pattern("systemctl stop firewalld").is_some());
        assert!(rules.blocked_pattern("ls -la").is_none());
    }

    #[test]
    fn classify_orders_checks() {
        let rules = RuleSet::builtin();
        assert_eq!(
            rules.classify("sudo ufw disable", false),
            Verdict::Block(
                BlockReason::SudoNotAllowed,
                "This action does not allow sudo. Use the sudo variant instead (passwordless sudo only).".to_string()
            )
        );
        assert!(matches!(
            rules.classify("sudo ufw disable", true),
            Verdict::Block(BlockReason::BlockedExecutable, _)
        ));
        assert_eq!(rules.classify("rm -r /srv/old", false), Verdict::NeedsConfirm);
        assert_eq!(rules.classify("uptime", false), Verdict::Allow);
        assert_eq!(rules.classify("echo pseudo", false), Verdict::Allow);
    }

    #[test]
    fn user_rules_extend_builtins_and_skip_invalid() {
        let config = SecurityConfig {
            deny_regex: vec!["(unclosed".to_string(), r"\bshutdown\b".to_string()],
            deny_executables: vec!["reboot".to_string()],
            require_confirm_regex: vec![r"\btruncate\b".to_string()],
        };
        let rules = RuleSet::from_config(&config, None);
        assert!(rules.blocked_pattern("shutdown -h now").is_some());
        assert_eq!(rules.blocked_executable("/sbin/reboot"), Some("reboot"));
        assert!(rules.blocked_executable("ufw enable").is_some());
        assert_eq!(rules.classify("truncate -s 0 x.log", false), Verdict::NeedsConfirm);
    }

    #[test]
    fn parse_preview_reads_markers() {
        let out = "/a\n/a/b\n__FLEETSSH_TOTAL__:2\n__FLEETSSH_TRUNCATED__:false\n";
        let preview = parse_preview(out).expect("preview");
        assert_eq!(preview.total, 2);
        assert!(!preview.truncated);
        assert_eq!(preview.sample, vec!["/a", "/a/b"]);
        assert!(parse_preview("/a\n").is_none());
    }

    #[test]
    fn preview_script_uses_bounded_limit() {
        let script = preview_script();
        assert!(script.contains("limit=10001"));
        assert!(script.contains("NR<=10{print}"));
    }
}
