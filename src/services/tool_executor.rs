use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::ToolError;
use crate::services::logger::Logger;
use crate::utils::tool_errors::suggest;

use serde_json::Value;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, args: Value) -> Result<Value, ToolError>;
}

#[derive(Clone)]
pub struct ToolExecutor {
    logger: Logger,
    handlers: Arc<BTreeMap<String, Arc<dyn ToolHandler>>>,
}

impl ToolExecutor {
    pub fn new(logger: Logger, handlers: BTreeMap<String, Arc<dyn ToolHandler>>) -> Self {
        Self {
            logger: logger.child("executor"),
            handlers: Arc::new(handlers),
        }
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Dispatches to the named handler and wraps the result in
    /// `{ ok, result, meta }`.
    pub async fn execute(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        let started_at = chrono::Utc::now().timestamp_millis();
        let Some(handler) = self.handlers.get(tool) else {
            let known = self.tool_names();
            let suggestions = suggest(tool, &known, 3);
            let hint = if suggestions.is_empty() {
                format!("Available tools: {}", known.join(", "))
            } else {
                format!("Did you mean: {}?", suggestions.join(", "))
            };
            return Err(ToolError::invalid_params(format!("Unknown tool: {}", tool)).with_hint(hint));
        };
        let trace_id = args
            .get("trace_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let action = args.get("action").cloned().unwrap_or(Value::Null);

        self.logger.debug(
            tool,
            Some(&serde_json::json!({ "action": action, "trace_id": trace_id })),
        );
        let outcome = handler.handle(args).await;
        let duration_ms = chrono::Utc::now().timestamp_millis() - started_at;
        match outcome {
            Ok(result) => Ok(serde_json::json!({
                "ok": true,
                "result": result,
                "meta": {
                    "tool": tool,
                    "action": action,
                    "trace_id": trace_id,
                    "duration_ms": duration_ms,
                },
            })),
            Err(err) => {
                self.logger.warn(
                    "tool call failed",
                    Some(&serde_json::json!({
                        "tool": tool,
                        "action": action,
                        "code": err.code,
                        "trace_id": trace_id,
                        "duration_ms": duration_ms,
                    })),
                );
                Err(err)
            }
        }
    }
}
