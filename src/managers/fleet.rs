use crate::errors::ToolError;
use crate::services::fleet::HostSource;
use crate::services::inventory::collect_machine_info;
use crate::services::logger::Logger;
use crate::services::tool_executor::ToolHandler;
use crate::stores::inventory_store::InventoryStore;
use crate::utils::tool_errors::{required_str, unknown_action_error};
use serde_json::{json, Map, Value};
use std::sync::Arc;

const FLEET_ACTIONS: &[&str] = &["list", "info"];

fn target_fields(args: &Value) -> Result<Option<Vec<String>>, ToolError> {
    let Some(raw) = args.get("target").filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let fields = raw
        .as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| ToolError::invalid_params("target must be an array of field names"))?;
    Ok(Some(fields))
}

#[derive(Clone)]
pub struct FleetManager {
    logger: Logger,
    hosts: Arc<dyn HostSource>,
    inventory: InventoryStore,
    machines: Vec<String>,
}

impl FleetManager {
    /// `machines` is every name `list` reports, local machine included.
    pub fn new(
        logger: Logger,
        hosts: Arc<dyn HostSource>,
        inventory: InventoryStore,
        machines: Vec<String>,
    ) -> Self {
        Self {
            logger: logger.child("fleet"),
            hosts,
            inventory,
            machines,
        }
    }

    pub async fn handle_action(&self, args: Value) -> Result<Value, ToolError> {
        let action = args.get("action");
        match action.and_then(|v| v.as_str()).unwrap_or("") {
            "list" => self.list(&args),
            "info" => self.info(&args).await,
            _ => Err(unknown_action_error("fleet", action, FLEET_ACTIONS)),
        }
    }

    fn list(&self, args: &Value) -> Result<Value, ToolError> {
        let target = target_fields(args)?;
        let inventory = self.inventory.load()?;
        let Some(fields) = target.filter(|_| inventory.extended) else {
            return Ok(json!({ "machines": self.machines }));
        };

        let mut machines = Vec::with_capacity(self.machines.len());
        for name in &self.machines {
            let mut row = Map::new();
            row.insert("name".to_string(), Value::String(name.clone()));
            if let Some(cached) = inventory.get(name) {
                let cached = serde_json::to_value(cached)?;
                for field in &fields {
                    if let Some(value) = cached.get(field) {
                        row.insert(field.clone(), value.clone());
                    }
                }
            }
            machines.push(Value::Object(row));
        }
        Ok(json!({ "machines": machines, "target": fields }))
    }

    async fn info(&self, args: &Value) -> Result<Value, ToolError> {
        let machine = required_str(args, "machine")?;
        let refresh = args.get("refresh").and_then(Value::as_bool).unwrap_or(false);

        if !refresh {
            let cached = self.inventory.get(machine)?.ok_or_else(|| {
                ToolError::not_found(format!("No cached info for {}", machine))
                    .with_hint("Call fleet/info with refresh=true to collect it.")
            })?;
            return Ok(serde_json::to_value(cached)?);
        }

        let mut lease = self.hosts.acquire(machine).await?;
        let collected = collect_machine_info(lease.host(), machine).await;
        lease.release();
        let info = collected?;
        if let Some(error) = &info.error {
            self.logger.warn(
                "info collection incomplete",
                Some(&json!({ "machine": machine, "error": error })),
            );
        }
        self.inventory.upsert(info.clone())?;
        self.logger.info(
            "inventory refreshed",
            Some(&json!({ "machine": machine, "path": self.inventory.path() })),
        );
        Ok(serde_json::to_value(info)?)
    }
}

#[async_trait::async_trait]
impl ToolHandler for FleetManager {
    async fn handle(&self, args: Value) -> Result<Value, ToolError> {
        self.logger.debug("handle_action", args.get("action"));
        self.handle_action(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_must_be_a_list_of_strings() {
        assert_eq!(target_fields(&json!({})).expect("absent"), None);
        assert_eq!(
            target_fields(&json!({ "target": ["os", "cores"] })).expect("fields"),
            Some(vec!["os".to_string(), "cores".to_string()])
        );
        assert!(target_fields(&json!({ "target": "os" })).is_err());
        assert!(target_fields(&json!({ "target": ["os", 3] })).is_err());
    }
}
