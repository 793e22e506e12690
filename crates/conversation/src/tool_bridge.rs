//! Bridges the assistant's tool-call dispatch loop to the concrete tool
//! registry: flattens a model's JSON arguments into the string map tools
//! expect and turns a [`outreach_tools::ToolOutput`] back into the text the
//! model sees as the tool's result.

use std::collections::HashMap;

use async_trait::async_trait;
use outreach_assistant::{AssistantError, ToolExecutor};
use outreach_tools::{ToolContext, ToolRegistry};

pub struct RegistryToolExecutor<'a> {
    registry: &'a ToolRegistry,
    ctx: ToolContext,
}

impl<'a> RegistryToolExecutor<'a> {
    pub fn new(registry: &'a ToolRegistry, ctx: ToolContext) -> Self {
        Self { registry, ctx }
    }
}

fn flatten_args(arguments: &serde_json::Value) -> HashMap<String, String> {
    let mut flat = HashMap::new();
    if let Some(obj) = arguments.as_object() {
        for (key, value) in obj {
            let as_string = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            flat.insert(key.clone(), as_string);
        }
    }
    flat
}

#[async_trait]
impl<'a> ToolExecutor for RegistryToolExecutor<'a> {
    async fn execute(&self, name: &str, arguments: &serde_json::Value) -> Result<String, AssistantError> {
        let tool = self.registry.get(name).ok_or_else(|| AssistantError::UnknownTool(name.to_string()))?;
        let args = flatten_args(arguments);
        let output = tool
            .run(&self.ctx, &args)
            .await
            .map_err(|err| AssistantError::ToolFailed { name: name.to_string(), detail: err.to_string() })?;
        Ok(output.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_persistence::Store;
    use outreach_tools::SaveUserNameTool;

    #[tokio::test]
    async fn executes_a_registered_tool_with_flattened_args() {
        let store = Store::open_in_memory().await.unwrap();
        store.users().add_user(1, None, None, None).await.unwrap();

        let mut registry = ToolRegistry::default();
        registry.register(Box::new(SaveUserNameTool));

        let ctx = ToolContext { user_id: 1, users: store.users(), executors: store.executors() };
        let executor = RegistryToolExecutor::new(&registry, ctx);

        let result = executor
            .execute("save_user_name", &serde_json::json!({"name": "Alice"}))
            .await
            .unwrap();
        assert_eq!(result, "name saved");

        let user = store.users().get_user(1).await.unwrap().unwrap();
        assert_eq!(user.display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn unknown_tool_name_is_reported() {
        let store = Store::open_in_memory().await.unwrap();
        let registry = ToolRegistry::default();
        let ctx = ToolContext { user_id: 1, users: store.users(), executors: store.executors() };
        let executor = RegistryToolExecutor::new(&registry, ctx);

        let err = executor.execute("does_not_exist", &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, AssistantError::UnknownTool(n) if n == "does_not_exist"));
    }
}
