use crate::constants::network::SSH_DEFAULT_PORT;
use crate::errors::ToolError;
use crate::services::config::MachineConfig;
use crate::utils::user_paths::expand_home_path;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl Endpoint {
    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPlan {
    pub machine: String,
    pub target: Endpoint,
    pub jump: Option<Endpoint>,
    pub identity_file: Option<PathBuf>,
}

fn default_user() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| "root".to_string())
}

/// Parses `[user@]host[:port]`.
pub fn parse_endpoint(raw: &str, fallback_user: &str) -> Result<Endpoint, ToolError> {
    let raw = raw.trim();
    let (user, rest) = match raw.rsplit_once('@') {
        Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
        Some((_, rest)) => (fallback_user.to_string(), rest),
        None => (fallback_user.to_string(), raw),
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse::<u16>().map_err(|_| {
                ToolError::invalid_params(format!("Invalid SSH port in {:?}", raw))
            })?;
            (host.to_string(), port)
        }
        _ => (rest.to_string(), SSH_DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(ToolError::invalid_params(format!(
            "Invalid SSH destination: {:?}",
            raw
        )));
    }
    Ok(Endpoint { host, port, user })
}

/// Only the first hop of a comma-separated jump list is honored.
pub fn parse_proxy_jump(raw: &str, fallback_user: &str) -> Result<Option<Endpoint>, ToolError> {
    let first = raw.split(',').next().unwrap_or("").trim();
    if first.is_empty() || first.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    parse_endpoint(first, fallback_user).map(Some)
}

pub fn default_identity_files() -> Vec<PathBuf> {
    ["~/.ssh/id_ed25519", "~/.ssh/id_ecdsa", "~/.ssh/id_rsa"]
        .iter()
        .map(expand_home_path)
        .filter(|path| path.exists())
        .collect()
}

/// Maps machine names to connection parameters.
#[derive(Debug, Clone, Default)]
pub struct MachineResolver {
    machines: BTreeMap<String, MachineConfig>,
}

impl MachineResolver {
    pub fn new(machines: BTreeMap<String, MachineConfig>) -> Self {
        Self { machines }
    }

    pub fn resolve(&self, machine: &str) -> Result<ConnectionPlan, ToolError> {
        let user = default_user();
        let Some(config) = self.machines.get(machine) else {
            let target = parse_endpoint(machine, &user)?;
            return Ok(ConnectionPlan {
                machine: machine.to_string(),
                target,
                jump: None,
                identity_file: None,
            });
        };
        let target = Endpoint {
            host: config.host.clone(),
            port: config.port.unwrap_or(SSH_DEFAULT_PORT),
            user: config.user.clone().unwrap_or_else(|| user.clone()),
        };
        let jump = match config.proxy_jump.as_deref() {
            Some(raw) => parse_proxy_jump(raw, &target.user)?,
            None => None,
        };
        Ok(ConnectionPlan {
            machine: machine.to_string(),
            target,
            jump,
            identity_file: config.identity_file.as_deref().map(expand_home_path),
        })
    }

    /// Static auth diagnostics attached to every lease for this plan.
    pub fn warnings(&self, plan: &ConnectionPlan) -> Vec<String> {
        let agent = std::env::var("SSH_AUTH_SOCK")
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false);
        let identity = plan
            .identity_file
            .as_ref()
            .map(|p| p.exists())
            .unwrap_or(false);
        if agent || identity || !default_identity_files().is_empty() {
            return Vec::new();
        }
        vec!["No SSH agent or identity file available; connection may fail".to_string()]
    }
}
