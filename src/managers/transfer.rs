use crate::errors::ToolError;
use crate::services::logger::Logger;
use crate::services::tool_executor::ToolHandler;
use crate::services::transfer::{TransferOutcome, TransferRequest, TransferService};
use crate::stores::session_store::TransferDirection;
use crate::utils::tool_errors::{optional_str, required_str, unknown_action_error};
use serde_json::Value;
use std::sync::Arc;

const TRANSFER_ACTIONS: &[&str] = &["upload", "download", "upload_async", "download_async"];

fn render(machine: &str, outcome: &TransferOutcome) -> Result<Value, ToolError> {
    let mut value = serde_json::to_value(outcome)?;
    let success = matches!(
        outcome,
        TransferOutcome::Completed { .. } | TransferOutcome::Started { .. }
    );
    value["success"] = Value::Bool(success);
    value["machine"] = Value::String(machine.to_string());
    match outcome {
        TransferOutcome::NeedsConfirm { .. } => {
            value["conflict"] = Value::Bool(true);
            value["message"] = Value::String(
                "Upload would overwrite existing remote files. Re-run with confirm_code to proceed."
                    .to_string(),
            );
        }
        TransferOutcome::Conflict { .. } => {
            value["conflict"] = Value::Bool(true);
            value["message"] = Value::String(
                "Refusing to overwrite local files. Choose a new local_path (empty or non-existent directory)."
                    .to_string(),
            );
        }
        _ => {}
    }
    Ok(value)
}

#[derive(Clone)]
pub struct TransferManager {
    logger: Logger,
    service: Arc<TransferService>,
}

impl TransferManager {
    pub fn new(logger: Logger, service: Arc<TransferService>) -> Self {
        Self {
            logger: logger.child("transfer"),
            service,
        }
    }

    pub async fn handle_action(&self, args: Value) -> Result<Value, ToolError> {
        let action = args.get("action");
        match action.and_then(|v| v.as_str()).unwrap_or("") {
            "upload" => self.run(&args, TransferDirection::Upload, false).await,
            "download" => self.run(&args, TransferDirection::Download, false).await,
            "upload_async" => self.run(&args, TransferDirection::Upload, true).await,
            "download_async" => self.run(&args, TransferDirection::Download, true).await,
            _ => Err(unknown_action_error("transfer", action, TRANSFER_ACTIONS)),
        }
    }

    async fn run(&self, args: &Value, direction: TransferDirection, background: bool) -> Result<Value, ToolError> {
        let request = TransferRequest {
            machine: required_str(args, "machine")?.to_string(),
            local_path: required_str(args, "local_path")?.to_string(),
            remote_path: required_str(args, "remote_path")?.to_string(),
        };
        // Downloads never overwrite, so a token has nothing to unlock.
        let confirm_code = match direction {
            TransferDirection::Upload => optional_str(args, "confirm_code"),
            TransferDirection::Download => None,
        };
        let outcome = if background {
            self.service
                .start_async(direction, &request, confirm_code)
                .await?
        } else {
            self.service.transfer(direction, &request, confirm_code).await?
        };
        render(&request.machine, &outcome)
    }
}

#[async_trait::async_trait]
impl ToolHandler for TransferManager {
    async fn handle(&self, args: Value) -> Result<Value, ToolError> {
        self.logger.debug("handle_action", args.get("action"));
        self.handle_action(args).await
    }
}
