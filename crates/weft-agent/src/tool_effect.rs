//! Effect handler routing `tool` intents through the safe-invoke path.
//!
//! This is how reducer-initiated tool calls reach tools: the reducer emits
//! `Intent { name: "tool", args: { name, args } }` and the outcome lands back
//! in the log as a `tool_result` event.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use weft_kernel::{EffectHandler, EngineError, Event, Intent, JsonMap, RunState};

use crate::registry::{safe_invoke, ToolRegistry};
use crate::schema::{validate_schema, ValidateFn};

pub struct ToolEffectHandler {
    registry: Arc<ToolRegistry>,
    allowed: HashSet<String>,
    validate: ValidateFn,
}

impl ToolEffectHandler {
    pub fn new(registry: Arc<ToolRegistry>, allowed: HashSet<String>) -> Self {
        Self {
            registry,
            allowed,
            validate: validate_schema,
        }
    }

    pub fn with_validator(mut self, validate: ValidateFn) -> Self {
        self.validate = validate;
        self
    }
}

#[async_trait]
impl<S: RunState> EffectHandler<S> for ToolEffectHandler {
    fn can_handle(&self, intent: &Intent) -> bool {
        intent.name == "tool"
    }

    async fn handle(&self, _state: &S, intent: &Intent) -> Result<Vec<Event>, EngineError> {
        let Some(name) = intent.args.get("name").and_then(|v| v.as_str()) else {
            return Err(
                EngineError::validation("missing_fields", "name required")
                    .with_context("fields", json!(["name"])),
            );
        };
        let tool = self.registry.resolve(name);
        if tool.is_none() {
            return Err(EngineError::validation("not_found", "tool not found")
                .with_context("tool", name));
        }
        let args: JsonMap = intent
            .args
            .get("args")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        let output = safe_invoke(tool.as_deref(), &args, &self.allowed, self.validate).await?;
        Ok(vec![Event::new("tool_result")
            .with_payload(json!({"tool": name, "output": output}))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{Tool, ToolDescriptor, ToolPermission};
    use serde_json::Value;

    #[derive(Clone)]
    struct EchoState;
    impl RunState for EchoState {
        fn run_id(&self) -> &str {
            "run-echo"
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn describe(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "echo".to_string(),
                description: "echoes a message".to_string(),
                input_schema: br#"{
                    "type": "object",
                    "properties": {"msg": {"type": "string"}},
                    "required": ["msg"],
                    "additionalProperties": false
                }"#
                .to_vec(),
                output_schema: br#"{
                    "type": "object",
                    "properties": {"echo": {"type": "string"}},
                    "required": ["echo"],
                    "additionalProperties": false
                }"#
                .to_vec(),
                permissions: vec![ToolPermission::new("cpu")],
                ..ToolDescriptor::default()
            }
        }

        async fn invoke(&self, args: &JsonMap) -> Result<JsonMap, EngineError> {
            let msg = args.get("msg").and_then(|v| v.as_str()).unwrap_or_default();
            let mut out = JsonMap::new();
            out.insert("echo".to_string(), Value::String(msg.to_string()));
            Ok(out)
        }
    }

    fn handler() -> ToolEffectHandler {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(EchoTool)).unwrap();
        ToolEffectHandler::new(registry, ["cpu".to_string()].into_iter().collect())
    }

    fn tool_intent(name: &str) -> Intent {
        Intent::new("tool")
            .with_arg("name", name)
            .with_arg("args", json!({"msg": "hi"}))
    }

    #[tokio::test]
    async fn routes_tool_intents_and_emits_tool_result() {
        let h = handler();
        assert!(EffectHandler::<EchoState>::can_handle(&h, &tool_intent("echo")));
        assert!(!EffectHandler::<EchoState>::can_handle(&h, &Intent::new("log")));

        let events = h.handle(&EchoState, &tool_intent("echo")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "tool_result");
        let payload = events[0].payload.as_ref().unwrap();
        assert_eq!(payload["tool"], "echo");
        assert_eq!(payload["output"]["echo"], "hi");
    }

    #[tokio::test]
    async fn missing_name_and_unknown_tool_are_validation_errors() {
        let h = handler();
        let err = h
            .handle(&EchoState, &Intent::new("tool"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "missing_fields");

        let err = h
            .handle(&EchoState, &tool_intent("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "not_found");
        assert_eq!(err.context["tool"], "nope");
    }

    #[tokio::test]
    async fn permission_denial_passes_through_from_safe_invoke() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(EchoTool)).unwrap();
        let h = ToolEffectHandler::new(registry, HashSet::new());
        let err = h
            .handle(&EchoState, &tool_intent("echo"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "forbidden");
    }
}
