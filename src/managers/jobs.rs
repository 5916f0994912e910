use crate::constants::limits::SLEEP_MAX_MS;
use crate::errors::ToolError;
use crate::managers::exec::guard_response;
use crate::services::fleet::HostSource;
use crate::services::guard::{GuardRequest, SecurityGuard};
use crate::services::jobs::{GrepRequest, JobSupervisor};
use crate::services::logger::Logger;
use crate::services::tool_executor::ToolHandler;
use crate::stores::session_store::validate_session_id;
use crate::utils::tool_errors::{optional_str, read_positive_int, required_str, unknown_action_error};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const JOB_ACTIONS: &[&str] = &[
    "exec_async",
    "exec_async_sudo",
    "get_result",
    "grep_result",
    "cancel",
    "sleep",
];

fn session_id(args: &Value) -> Result<&str, ToolError> {
    let id = required_str(args, "session_id")?;
    validate_session_id(id)?;
    Ok(id)
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ToolError> {
    Ok(serde_json::to_value(value)?)
}

#[derive(Clone)]
pub struct JobManager {
    logger: Logger,
    hosts: Arc<dyn HostSource>,
    guard: Arc<SecurityGuard>,
    supervisor: Arc<JobSupervisor>,
}

impl JobManager {
    pub fn new(
        logger: Logger,
        hosts: Arc<dyn HostSource>,
        guard: Arc<SecurityGuard>,
        supervisor: Arc<JobSupervisor>,
    ) -> Self {
        Self {
            logger: logger.child("job"),
            hosts,
            guard,
            supervisor,
        }
    }

    pub async fn handle_action(&self, args: Value) -> Result<Value, ToolError> {
        let action = args.get("action");
        match action.and_then(|v| v.as_str()).unwrap_or("") {
            "exec_async" => self.exec_async(&args, false).await,
            "exec_async_sudo" => self.exec_async(&args, true).await,
            "get_result" => self.get_result(&args).await,
            "grep_result" => self.grep_result(&args).await,
            "cancel" => self.cancel(&args).await,
            "sleep" => self.sleep(&args).await,
            _ => Err(unknown_action_error("jobs", action, JOB_ACTIONS)),
        }
    }

    async fn exec_async(&self, args: &Value, sudo: bool) -> Result<Value, ToolError> {
        let machine = required_str(args, "machine")?;
        let command = required_str(args, "command")?;
        let confirm_code = optional_str(args, "confirm_code");

        let mut lease = self.hosts.acquire(machine).await?;
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
            .await;
        let warnings = lease.warnings().to_vec();
        lease.release();
        if let Some(response) = guard_response(machine, &decision?) {
            return Ok(response);
        }

        let record = self.supervisor.start(machine, command, sudo).await?;
        let mut response = to_value(&record)?;
        response["success"] = Value::Bool(true);
        response["warnings"] = json!(warnings);
        Ok(response)
    }

    async fn get_result(&self, args: &Value) -> Result<Value, ToolError> {
        let id = session_id(args)?;
        let lines = read_positive_int(args.get("lines"));
        let report = self.supervisor.poll(id, lines).await?;
        let mut response = to_value(&report)?;
        response["success"] = Value::Bool(true);
        Ok(response)
    }

    async fn grep_result(&self, args: &Value) -> Result<Value, ToolError> {
        let id = session_id(args)?;
        let pattern = args
            .get("pattern")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ToolError::invalid_params("pattern must be a non-empty string"))?;
        let request = GrepRequest::new(
            read_positive_int(args.get("max_matches")),
            args.get("context_lines").and_then(Value::as_u64),
        );
        let report = self.supervisor.grep(id, pattern, request).await?;
        let mut response = to_value(&report)?;
        response["success"] = Value::Bool(true);
        Ok(response)
    }

    async fn cancel(&self, args: &Value) -> Result<Value, ToolError> {
        let id = session_id(args)?;
        let report = self
            .supervisor
            .cancel(id, optional_str(args, "signal"))
            .await?;
        let mut response = to_value(&report)?;
        response["success"] = Value::Bool(true);
        Ok(response)
    }

    async fn sleep(&self, args: &Value) -> Result<Value, ToolError> {
        let requested = args
            .get("ms")
            .or_else(|| args.get("time"))
            .and_then(Value::as_u64)
            .ok_or_else(|| ToolError::invalid_params("ms must be a non-negative integer"))?;
        if requested > SLEEP_MAX_MS {
            return Err(ToolError::invalid_params(format!(
                "ms must be at most {}",
                SLEEP_MAX_MS
            )));
        }
        tokio::time::sleep(Duration::from_millis(requested)).await;
        Ok(json!({ "success": true, "slept_ms": requested }))
    }
}

#[async_trait::async_trait]
impl ToolHandler for JobManager {
    async fn handle(&self, args: Value) -> Result<Value, ToolError> {
        self.logger.debug("handle_action", args.get("action"));
        self.handle_action(args).await
    }
}
