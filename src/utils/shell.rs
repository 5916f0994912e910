/// `a'b` becomes `'a'\''b'`.
pub fn quote_for_sh(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

pub fn wrap_sh(command: &str) -> String {
    format!("sh -lc {}", quote_for_sh(command))
}

pub fn wrap_sudo(command: &str) -> String {
    format!("sudo -n -- sh -lc {}", quote_for_sh(command))
}

pub fn wrap_command(command: &str, sudo: bool) -> String {
    if sudo {
        wrap_sudo(command)
    } else {
        wrap_sh(command)
    }
}

pub fn quote_args<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|arg| quote_for_sh(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn is_sudo_password_error(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("password is required") || lowered.contains("a terminal is required")
}

pub const SUDO_PASSWORD_HINT: &str =
    "sudo needs a password on this host. Only passwordless sudo (NOPASSWD) is supported.";

/// Signal names reach the remote shell unquoted, so only `[A-Z0-9]+` survives.
pub fn normalize_signal(signal: Option<&str>) -> String {
    let raw = signal.unwrap_or("TERM").trim().to_uppercase();
    let raw = raw.strip_prefix("SIG").unwrap_or(&raw).to_string();
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_alphanumeric()) {
        raw
    } else {
        "TERM".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_for_sh_escapes_single_quotes() {
        assert_eq!(quote_for_sh("abc"), "'abc'");
        assert_eq!(quote_for_sh("a'b"), "'a'\\''b'");
        assert_eq!(wrap_sh("echo 'hi'"), "sh -lc 'echo '\\''hi'\\'''");
        assert_eq!(wrap_sudo("id"), "sudo -n -- sh -lc 'id'");
    }

    #[test]
    fn sudo_password_error_is_case_insensitive() {
        assert!(is_sudo_password_error("sudo: A password is required\n"));
        assert!(!is_sudo_password_error("permission denied"));
    }

    #[test]
    fn normalize_signal_falls_back_to_term() {
        assert_eq!(normalize_signal(None), "TERM");
        assert_eq!(normalize_signal(Some("kill")), "KILL");
        assert_eq!(normalize_signal(Some("SIGINT")), "INT");
        assert_eq!(normalize_signal(Some("9")), "9");
        assert_eq!(normalize_signal(Some("TERM; rm -rf /")), "TERM");
        assert_eq!(normalize_signal(Some("")), "TERM");
    }
}
