use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kestrel_runtime::{PathGuard, ProcessSupervisor};
use kestrel_types::{HostRuntimeContext, ToolResult, ToolSchema};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

mod fs;
mod media;
pub mod patch;
mod plan;
mod process;
mod search;
mod shell;

pub use fs::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
pub use media::{ViewImageTool, WebFetchTool};
pub use patch::{apply_patch, ApplyPatchTool, PatchError, PatchSummary};
pub use plan::{PlanCache, UpdatePlanTool, PLAN_FILE};
pub use process::{ProcessKillTool, ProcessListTool, ProcessLogsTool, ProcessStartTool};
pub use search::{GlobTool, GrepTool};
pub use shell::{ShellLimits, ShellTool};

pub const DEFAULT_OUTPUT_LIMIT: usize = 50_000;
pub const SEARCH_OUTPUT_LIMIT: usize = 20_000;

/// Per-call values the dispatcher hands to a tool.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub cancel: CancellationToken,
    pub session_id: Option<String>,
    /// Storage directory of the active session, for session-scoped state.
    pub session_dir: Option<PathBuf>,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>, dir: Option<PathBuf>) -> Self {
        self.session_id = Some(session_id.into());
        self.session_dir = dir;
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    /// Tools that write into the workspace are refused in plan-only sessions.
    fn mutates_files(&self) -> bool {
        false
    }

    fn output_limit(&self) -> usize {
        DEFAULT_OUTPUT_LIMIT
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult>;
}

/// Everything the built-in tools of one workspace share.
#[derive(Clone)]
pub struct WorkspaceTools {
    pub guard: PathGuard,
    pub supervisor: ProcessSupervisor,
    pub plans: PlanCache,
    pub shell: ShellLimits,
    pub host: HostRuntimeContext,
}

impl WorkspaceTools {
    pub fn new(guard: PathGuard, supervisor: ProcessSupervisor) -> Self {
        Self {
            guard,
            supervisor,
            plans: PlanCache::default(),
            shell: ShellLimits::default(),
            host: HostRuntimeContext::detect(),
        }
    }
}

/// Result of one dispatched call, already in the shape of a tool message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub output: String,
    pub metadata: Value,
    pub is_error: bool,
    pub truncated: bool,
}

impl ToolOutcome {
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            output: format!("tool error: {message}"),
            metadata: json!({}),
            is_error: true,
            truncated: false,
        }
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The full catalogue, bound to one workspace.
    pub fn builtin(env: &WorkspaceTools) -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ReadFileTool::new(env.guard.clone())),
            Arc::new(WriteFileTool::new(env.guard.clone())),
            Arc::new(EditFileTool::new(env.guard.clone())),
            Arc::new(ListDirTool::new(env.guard.clone())),
            Arc::new(GlobTool::new(env.guard.clone())),
            Arc::new(GrepTool::new(env.guard.clone())),
            Arc::new(ShellTool::new(
                env.guard.clone(),
                env.shell,
                env.host.clone(),
            )),
            Arc::new(ApplyPatchTool::new(env.guard.clone())),
            Arc::new(ProcessStartTool::new(
                env.supervisor.clone(),
                env.host.clone(),
            )),
            Arc::new(ProcessListTool::new(env.supervisor.clone())),
            Arc::new(ProcessLogsTool::new(env.supervisor.clone())),
            Arc::new(ProcessKillTool::new(env.supervisor.clone())),
            Arc::new(UpdatePlanTool::new(env.plans.clone())),
            Arc::new(ViewImageTool::new(env.guard.clone())),
            Arc::new(WebFetchTool::new()),
        ];
        let map = tools
            .into_iter()
            .map(|tool| (tool.schema().name, tool))
            .collect::<HashMap<_, _>>();
        Self {
            tools: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut dedup: HashMap<String, ToolSchema> = HashMap::new();
        for schema in self.tools.read().await.values().map(|t| t.schema()) {
            dedup.entry(schema.name.clone()).or_insert(schema);
        }
        let mut schemas = dedup.into_values().collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn mutates_files(&self, name: &str) -> bool {
        self.get(name)
            .await
            .map(|tool| tool.mutates_files())
            .unwrap_or(false)
    }

    /// Decodes `raw_args`, runs the tool and folds every failure into the
    /// returned text. Oversized output is cut to the tool's limit.
    pub async fn dispatch(&self, name: &str, raw_args: &str, ctx: &ToolContext) -> ToolOutcome {
        let Some(tool) = self.get(name).await else {
            return ToolOutcome::error(format!("unknown tool `{name}`"));
        };
        let args = match decode_arguments(raw_args) {
            Ok(args) => args,
            Err(err) => {
                return ToolOutcome::error(format!("invalid JSON arguments for `{name}`: {err}"))
            }
        };
        match tool.execute(ctx, args).await {
            Ok(result) => {
                let (output, truncated) = truncate_output(result.output, tool.output_limit());
                ToolOutcome {
                    output,
                    metadata: result.metadata,
                    is_error: false,
                    truncated,
                }
            }
            Err(err) => ToolOutcome::error(format!("{err:#}")),
        }
    }
}

fn decode_arguments(raw: &str) -> serde_json::Result<Value> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw)
}

/// Keeps the first `limit` characters and appends a marker naming how much
/// was dropped.
pub fn truncate_output(output: String, limit: usize) -> (String, bool) {
    let total = output.chars().count();
    if total <= limit {
        return (output, false);
    }
    let cut = output
        .char_indices()
        .nth(limit)
        .map(|(idx, _)| idx)
        .unwrap_or(output.len());
    let mut kept = output;
    kept.truncate(cut);
    kept.push_str(&format!(
        "\n[output truncated: shown_chars={limit} total_chars={total}; \
         request a narrower range (offset/limit, a sub-path or a tighter pattern) to continue]"
    ));
    (kept, true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        if schema.input_schema.get("type").and_then(|t| t.as_str()) != Some("object") {
            return Err(ToolSchemaValidationError {
                tool_name: schema.name.clone(),
                path: "$".to_string(),
                reason: "parameters must be an object schema".to_string(),
            });
        }
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    for keyword in ["oneOf", "anyOf", "allOf"] {
        if let Some(variants) = obj.get(keyword).and_then(|v| v.as_array()) {
            for (idx, child) in variants.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}.{keyword}[{idx}]"), child)?;
            }
        }
    }

    Ok(())
}

pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing required string argument `{key}`"))
}

pub(crate) fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

pub(crate) fn optional_usize(args: &Value, key: &str) -> Option<usize> {
    args.get(key)
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn workspace(dir: &std::path::Path) -> WorkspaceTools {
        let guard = PathGuard::new(dir).expect("guard");
        let supervisor = ProcessSupervisor::new(guard.clone(), dir.join(".jobs"), None);
        WorkspaceTools::new(guard, supervisor)
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "echo".to_string(),
                description: "echo".to_string(),
                input_schema: json!({"type":"object","properties":{"text":{"type":"string"}}}),
            }
        }

        fn output_limit(&self) -> usize {
            8
        }

        async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
            let text = required_str(&args, "text")?;
            Ok(ToolResult::text(text))
        }
    }

    #[test]
    fn validator_rejects_array_without_items() {
        let schemas = vec![ToolSchema {
            name: "bad".to_string(),
            description: "bad schema".to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"steps":{"type":"array"}}
            }),
        }];
        let err = validate_tool_schemas(&schemas).expect_err("expected schema validation failure");
        assert_eq!(err.tool_name, "bad");
        assert!(err.path.contains("properties.steps"));
    }

    #[tokio::test]
    async fn builtin_schemas_are_unique_and_valid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ToolRegistry::builtin(&workspace(dir.path()));
        let schemas = registry.list().await;
        validate_tool_schemas(&schemas).expect("builtin tool schemas should validate");
        let unique = schemas
            .iter()
            .map(|schema| schema.name.as_str())
            .collect::<HashSet<_>>();
        assert_eq!(unique.len(), schemas.len());
        assert!(unique.contains("apply_patch"));
        assert!(unique.contains("process_start"));
        assert!(registry.mutates_files("write_file").await);
        assert!(registry.mutates_files("apply_patch").await);
        assert!(!registry.mutates_files("read_file").await);
    }

    #[tokio::test]
    async fn dispatch_folds_failures_into_text() {
        let registry = ToolRegistry::empty();
        registry.register(Arc::new(EchoTool)).await;
        let ctx = ToolContext::default();

        let unknown = registry.dispatch("nope", "{}", &ctx).await;
        assert!(unknown.is_error);
        assert_eq!(unknown.output, "tool error: unknown tool `nope`");

        let bad_json = registry.dispatch("echo", "{not json", &ctx).await;
        assert!(bad_json.is_error);
        assert!(bad_json.output.starts_with("tool error: invalid JSON arguments"));

        let missing = registry.dispatch("echo", "", &ctx).await;
        assert!(missing.output.contains("missing required string argument `text`"));
    }

    #[tokio::test]
    async fn dispatch_truncates_to_tool_limit() {
        let registry = ToolRegistry::empty();
        registry.register(Arc::new(EchoTool)).await;
        let outcome = registry
            .dispatch("echo", r#"{"text":"abcdefghijkl"}"#, &ToolContext::default())
            .await;
        assert!(outcome.truncated);
        assert!(outcome.output.starts_with("abcdefgh\n[output truncated: shown_chars=8 total_chars=12"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let (out, truncated) = truncate_output("ééé".to_string(), 2);
        assert!(truncated);
        assert!(out.starts_with("éé\n"));
        let (out, truncated) = truncate_output("short".to_string(), 10);
        assert!(!truncated);
        assert_eq!(out, "short");
    }
}
