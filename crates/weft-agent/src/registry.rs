//! Tool registry and the safe-invoke path.
//!
//! Registration is one-shot per name and rejects malformed descriptors up
//! front. Resolution is read-many behind a reader/writer lock. Both the
//! in-process tool effect handler and the remote bridge funnel every call
//! through [`safe_invoke`]; no parallel validation path exists.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock};

use serde_json::Value;

use weft_kernel::{EngineError, JsonMap};

use crate::schema::compile_schema;
use crate::tool::Tool;

/// Name-keyed tool map with register-once-or-fail semantics. Tests should
/// prefer an isolated registry per test over the process-wide [`global`].
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a tool under its descriptor name. Rejects empty names,
    /// duplicates, and schemas that do not compile.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), EngineError> {
        let descriptor = tool.describe();
        if descriptor.name.is_empty() {
            return Err(EngineError::validation("bad_tool", "tool name is empty"));
        }
        compile_schema(&descriptor.input_schema).map_err(|e| {
            EngineError::validation("invalid_schema", "input schema does not compile")
                .with_context("tool", descriptor.name.as_str())
                .with_cause(e)
        })?;
        compile_schema(&descriptor.output_schema).map_err(|e| {
            EngineError::validation("invalid_schema", "output schema does not compile")
                .with_context("tool", descriptor.name.as_str())
                .with_cause(e)
        })?;

        let mut tools = self
            .tools
            .write()
            .map_err(|_| EngineError::system("internal", "tool registry lock poisoned"))?;
        if tools.contains_key(&descriptor.name) {
            return Err(
                EngineError::validation("conflict", "tool already registered")
                    .with_context("tool", descriptor.name.as_str()),
            );
        }
        tracing::debug!(tool = %descriptor.name, "registered tool");
        tools.insert(descriptor.name, tool);
        Ok(())
    }

    /// Resolves a tool by exact name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().ok()?.get(name).cloned()
    }

    /// Visits every registered tool.
    pub fn for_each(&self, mut f: impl FnMut(&str, &Arc<dyn Tool>)) {
        if let Ok(tools) = self.tools.read() {
            for (name, tool) in tools.iter() {
                f(name, tool);
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazily-initialized process-wide registry.
pub fn global() -> &'static ToolRegistry {
    static GLOBAL: OnceLock<ToolRegistry> = OnceLock::new();
    GLOBAL.get_or_init(ToolRegistry::new)
}

/// Invokes a tool through the uniform safety path, short-circuiting on the
/// first failure:
///
/// 1. missing tool → `validation/bad_tool`;
/// 2. every declared permission must be in `allowed` → `policy/forbidden`;
/// 3. args validated against the input schema → `validation/invalid_input`;
/// 4. invoke;
/// 5. output validated against the output schema → `validation/invalid_output`.
pub async fn safe_invoke<V>(
    tool: Option<&dyn Tool>,
    args: &JsonMap,
    allowed: &HashSet<String>,
    validate: V,
) -> Result<JsonMap, EngineError>
where
    V: Fn(&[u8], &Value) -> Result<(), EngineError>,
{
    let Some(tool) = tool else {
        return Err(EngineError::validation("bad_tool", "no tool provided"));
    };
    let descriptor = tool.describe();

    for permission in &descriptor.permissions {
        if !allowed.contains(&permission.name) {
            return Err(
                EngineError::policy("forbidden", "permission denied for tool")
                    .with_context("permission", permission.name.as_str())
                    .with_context("tool", descriptor.name.as_str()),
            );
        }
    }

    if let Err(e) = validate(&descriptor.input_schema, &Value::Object(args.clone())) {
        return Err(
            EngineError::validation("invalid_input", "tool input validation failed")
                .with_context("tool", descriptor.name.as_str())
                .with_context("error", e.message.as_str()),
        );
    }

    let output = tool.invoke(args).await?;

    if let Err(e) = validate(&descriptor.output_schema, &Value::Object(output.clone())) {
        return Err(
            EngineError::validation("invalid_output", "tool output validation failed")
                .with_context("tool", descriptor.name.as_str())
                .with_context("error", e.message.as_str()),
        );
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::validate_schema;
    use crate::tool::{SideEffect, ToolDescriptor, ToolPermission};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Adds two numbers; requires the `cpu` permission.
    struct SumTool {
        invocations: AtomicUsize,
    }

    impl SumTool {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                invocations: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Tool for SumTool {
        fn describe(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "sum".to_string(),
                description: "adds two numbers".to_string(),
                input_schema: br#"{
                    "type": "object",
                    "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                    "required": ["a", "b"],
                    "additionalProperties": false
                }"#
                .to_vec(),
                output_schema: br#"{
                    "type": "object",
                    "properties": {"sum": {"type": "number"}},
                    "required": ["sum"],
                    "additionalProperties": false
                }"#
                .to_vec(),
                permissions: vec![ToolPermission::new("cpu")],
                side_effects: vec![SideEffect::Process],
            }
        }

        async fn invoke(&self, args: &JsonMap) -> Result<JsonMap, EngineError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            let a = args.get("a").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let b = args.get("b").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let mut out = JsonMap::new();
            out.insert("sum".to_string(), json!(a + b));
            Ok(out)
        }
    }

    fn args(a: Value, b: Value) -> JsonMap {
        let mut m = JsonMap::new();
        m.insert("a".to_string(), a);
        m.insert("b".to_string(), b);
        m
    }

    fn cpu() -> HashSet<String> {
        ["cpu".to_string()].into_iter().collect()
    }

    #[tokio::test]
    async fn safe_invoke_happy_path() {
        let tool = SumTool::new();
        let out = safe_invoke(
            Some(tool.as_ref() as &dyn Tool),
            &args(json!(1), json!(2)),
            &cpu(),
            validate_schema,
        )
        .await
        .unwrap();
        assert_eq!(out["sum"], json!(3.0));
        assert_eq!(tool.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_input_never_reaches_the_tool() {
        let tool = SumTool::new();
        let err = safe_invoke(
            Some(tool.as_ref() as &dyn Tool),
            &args(json!("x"), json!(2)),
            &cpu(),
            validate_schema,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, "invalid_input");
        assert_eq!(err.context["tool"], "sum");
        assert_eq!(tool.invocations.load(Ordering::SeqCst), 0, "tool never entered");
    }

    #[tokio::test]
    async fn missing_permission_refuses_before_any_effect() {
        let tool = SumTool::new();
        let err = safe_invoke(
            Some(tool.as_ref() as &dyn Tool),
            &args(json!(1), json!(2)),
            &HashSet::new(),
            validate_schema,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, "forbidden");
        assert_eq!(err.http_status(), 403);
        assert_eq!(err.context["permission"], "cpu");
        assert_eq!(tool.invocations.load(Ordering::SeqCst), 0, "tool never entered");
    }

    #[tokio::test]
    async fn invalid_output_is_surfaced_not_propagated() {
        /// Declares a strict output schema, then violates it.
        struct LyingTool;
        #[async_trait]
        impl Tool for LyingTool {
            fn describe(&self) -> ToolDescriptor {
                ToolDescriptor {
                    name: "liar".to_string(),
                    output_schema: br#"{
                        "type": "object",
                        "properties": {"ok": {"type": "boolean"}},
                        "required": ["ok"],
                        "additionalProperties": false
                    }"#
                    .to_vec(),
                    ..ToolDescriptor::default()
                }
            }
            async fn invoke(&self, _args: &JsonMap) -> Result<JsonMap, EngineError> {
                let mut out = JsonMap::new();
                out.insert("ok".to_string(), json!("yes"));
                Ok(out)
            }
        }

        let err = safe_invoke(
            Some(&LyingTool as &dyn Tool),
            &JsonMap::new(),
            &HashSet::new(),
            validate_schema,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, "invalid_output");
        assert_eq!(err.context["tool"], "liar");
    }

    #[tokio::test]
    async fn missing_tool_is_bad_tool() {
        let err = safe_invoke(None, &JsonMap::new(), &HashSet::new(), validate_schema)
            .await
            .unwrap_err();
        assert_eq!(err.code, "bad_tool");
    }

    #[test]
    fn registry_rejects_duplicates_and_bad_descriptors() {
        let registry = ToolRegistry::new();
        registry.register(SumTool::new()).unwrap();
        assert!(registry.resolve("sum").is_some());
        assert!(registry.resolve("missing").is_none());

        let err = registry.register(SumTool::new()).unwrap_err();
        assert_eq!(err.code, "conflict");

        struct NamelessTool;
        #[async_trait]
        impl Tool for NamelessTool {
            fn describe(&self) -> ToolDescriptor {
                ToolDescriptor::default()
            }
            async fn invoke(&self, _args: &JsonMap) -> Result<JsonMap, EngineError> {
                Ok(JsonMap::new())
            }
        }
        let err = registry.register(Arc::new(NamelessTool)).unwrap_err();
        assert_eq!(err.code, "bad_tool");

        struct BrokenSchemaTool;
        #[async_trait]
        impl Tool for BrokenSchemaTool {
            fn describe(&self) -> ToolDescriptor {
                ToolDescriptor {
                    name: "broken".to_string(),
                    input_schema: b"{".to_vec(),
                    ..ToolDescriptor::default()
                }
            }
            async fn invoke(&self, _args: &JsonMap) -> Result<JsonMap, EngineError> {
                Ok(JsonMap::new())
            }
        }
        let err = registry.register(Arc::new(BrokenSchemaTool)).unwrap_err();
        assert_eq!(err.code, "invalid_schema");
        assert_eq!(err.context["tool"], "broken");
    }

    #[test]
    fn for_each_visits_registered_tools() {
        let registry = ToolRegistry::new();
        registry.register(SumTool::new()).unwrap();
        let mut names = Vec::new();
        registry.for_each(|name, _| names.push(name.to_string()));
        assert_eq!(names, vec!["sum"]);
    }
}
