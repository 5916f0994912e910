use crate::errors::ToolError;
use crate::services::fleet::{HostLease, HostSource};
use crate::services::guard::{GuardDecision, GuardRequest, SecurityGuard};
use crate::services::host::{CaptureLimits, ExecOptions};
use crate::services::logger::Logger;
use crate::services::tool_executor::ToolHandler;
use crate::utils::shell::{is_sudo_password_error, wrap_command, SUDO_PASSWORD_HINT};
use crate::utils::tool_errors::{optional_str, required_str, unknown_action_error};
use serde_json::{json, Value};
use std::sync::Arc;

const EXEC_ACTIONS: &[&str] = &["exec", "sudo_exec"];

/// Renders a non-allow guard decision as a tool result.
pub fn guard_response(machine: &str, decision: &GuardDecision) -> Option<Value> {
    match decision {
        GuardDecision::Allow => None,
        GuardDecision::Block { reason, message } => Some(json!({
            "success": false,
            "machine": machine,
            "blocked": true,
            "reason": reason,
            "message": message,
        })),
        GuardDecision::Confirm {
            confirm_code,
            message,
            preview,
        } => Some(json!({
            "success": false,
            "machine": machine,
            "confirm_required": true,
            "confirm_code": confirm_code,
            "message": message,
            "preview": preview,
        })),
    }
}

#[derive(Clone)]
pub struct ExecManager {
    logger: Logger,
    hosts: Arc<dyn HostSource>,
    guard: Arc<SecurityGuard>,
    limits: CaptureLimits,
}

impl ExecManager {
    pub fn new(
        logger: Logger,
        hosts: Arc<dyn HostSource>,
        guard: Arc<SecurityGuard>,
        limits: CaptureLimits,
    ) -> Self {
        Self {
            logger: logger.child("exec"),
            hosts,
            guard,
            limits,
        }
    }

    pub async fn handle_action(&self, args: Value) -> Result<Value, ToolError> {
        let action = args.get("action");
        match action.and_then(|v| v.as_str()).unwrap_or("") {
            "exec" => self.exec(&args, false).await,
            "sudo_exec" => self.exec(&args, true).await,
            _ => Err(unknown_action_error("exec", action, EXEC_ACTIONS)),
        }
    }

    async fn exec(&self, args: &Value, sudo: bool) -> Result<Value, ToolError> {
        let machine = required_str(args, "machine")?;
        let command = required_str(args, "command")?;
        let confirm_code = optional_str(args, "confirm_code");

        let mut lease = self.hosts.acquire(machine).await?;
        let result = self
            .exec_leased(&lease, machine, command, confirm_code, sudo)
            .await;
        lease.release();
        result
    }

    async fn exec_leased(
        &self,
        lease: &HostLease,
        machine: &str,
        command: &str,
        confirm_code: Option<&str>,
        sudo: bool,
    ) -> Result<Value, ToolError> {
        let decision = self
            .guard
            .evaluate(
                lease.host(),
                GuardRequest {
                    machine,
                    command,
                    allow_sudo: sudo,
                    confirm_code,
                },
            )
            .await?;
        if let Some(response) = guard_response(machine, &decision) {
            return Ok(response);
        }

        let result = lease
            .host()
            .exec(&wrap_command(command, sudo), ExecOptions::with_limits(self.limits))
            .await?;
        self.logger.debug(
            "command finished",
            Some(&json!({
                "machine": machine,
                "exit_code": result.exit_code,
                "sudo": sudo,
            })),
        );

        let mut response = json!({
            "success": result.succeeded(),
            "machine": machine,
            "exit_code": result.exit_code,
            "signal": result.signal,
            "stdout": result.stdout,
            "stderr": result.stderr,
            "truncated": result.truncated,
            "warnings": lease.warnings(),
        });
        if sudo && !result.succeeded() && is_sudo_password_error(&result.stderr) {
            response["hint"] = Value::String(SUDO_PASSWORD_HINT.to_string());
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ToolHandler for ExecManager {
    async fn handle(&self, args: Value) -> Result<Value, ToolError> {
        self.logger.debug("handle_action", args.get("action"));
        self.handle_action(args).await
    }
}
