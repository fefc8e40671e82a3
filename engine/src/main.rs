use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kestrel_core::{
    resolve_state_dir, ConfigStore, ConversationStore, Emitter, EngineConfig, EngineLoop,
    EventSink, JsonFileStore, TurnOutcome, WindowProfile, Workspace, WorkspaceRegistry,
};
use kestrel_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent,
    ProcessKind, WorkerGuard,
};
use kestrel_providers::{known_provider_ids, ProviderRegistry};
use kestrel_runtime::LogStream;
use kestrel_tools::ToolContext;
use kestrel_types::{EngineEvent, Message};
use kestrel_wire::sse_frame;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "kestrel-engine")]
#[command(about = "Headless Kestrel coding-agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct CommonArgs {
    /// Workspace root the agent is confined to.
    #[arg(long, env = "KESTREL_WORKSPACE", default_value = ".")]
    workspace: PathBuf,
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Project config file; defaults to `<state_dir>/config.json`.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs one turn and streams its events to stdout as SSE frames.
    Run {
        /// The user message, `-` for stdin or `@path` for a file.
        prompt: String,
        #[command(flatten)]
        common: CommonArgs,
        /// Resumes this session; a fresh id is generated when omitted.
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long, default_value_t = false)]
        plan_only: bool,
        #[arg(long, default_value_t = false)]
        thinking: bool,
        #[arg(long, default_value_t = false)]
        deep_reasoning: bool,
    },
    /// Invokes one tool directly, outside any conversation.
    Tool {
        /// `{"tool": "...", "args": {...}}`, `-` for stdin or `@path`.
        #[arg(long)]
        json: String,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Inspects background jobs of a workspace.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Subcommand, Debug)]
enum JobsAction {
    List,
    Logs {
        id: String,
        #[arg(long, default_value = "stdout")]
        stream: String,
        #[arg(long, default_value_t = 200)]
        tail: usize,
        #[arg(long)]
        filter: Option<String>,
    },
    Kill {
        id: String,
    },
}

#[derive(Debug, Clone, Default)]
struct RunOverrides {
    provider: Option<String>,
    model: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    plan_only: bool,
    thinking: bool,
    deep_reasoning: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            prompt,
            common,
            session,
            provider,
            model,
            base_url,
            api_key,
            plan_only,
            thinking,
            deep_reasoning,
        } => {
            let overrides = build_cli_overrides(&RunOverrides {
                provider,
                model,
                base_url,
                api_key,
                plan_only,
                thinking,
                deep_reasoning,
            })?;
            let prompt = read_input(&prompt)?;
            let runtime = Runtime::build(&common, ProcessKind::Engine, overrides).await?;
            let session_id = session.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
            run_turn(&runtime, &common.workspace, &session_id, &prompt).await?;
        }
        Command::Tool { json, common } => {
            let runtime = Runtime::build(&common, ProcessKind::Cli, None).await?;
            let workspace = runtime.workspace(&common.workspace).await?;
            let payload = read_input(&json)?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("tool input is not valid json")?;
            let output = invoke_tool(&workspace, &payload).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Jobs { action, common } => {
            let runtime = Runtime::build(&common, ProcessKind::Cli, None).await?;
            let workspace = runtime.workspace(&common.workspace).await?;
            let supervisor = &workspace.supervisor;
            match action {
                JobsAction::List => {
                    let jobs = supervisor.list().await?;
                    println!("{}", serde_json::to_string_pretty(&jobs)?);
                }
                JobsAction::Logs {
                    id,
                    stream,
                    tail,
                    filter,
                } => {
                    let stream = LogStream::parse(&stream)
                        .with_context(|| format!("unknown stream `{stream}`"))?;
                    let text = supervisor.logs(&id, stream, tail, filter.as_deref()).await?;
                    println!("{text}");
                }
                JobsAction::Kill { id } => {
                    supervisor.kill(&id).await?;
                    println!("kill signalled for job `{id}`");
                }
            }
        }
    }

    Ok(())
}

/// Everything a command needs, built once per process.
struct Runtime {
    state_dir: PathBuf,
    config: EngineConfig,
    workspaces: WorkspaceRegistry,
    // Dropping the guard loses buffered log records.
    _log_guard: WorkerGuard,
}

impl Runtime {
    async fn build(
        common: &CommonArgs,
        process: ProcessKind,
        overrides: Option<serde_json::Value>,
    ) -> anyhow::Result<Self> {
        let startup = Instant::now();
        let state_dir = resolve_state_dir(common.state_dir.as_deref());
        let config_path = common
            .config
            .clone()
            .unwrap_or_else(|| state_dir.join("config.json"));
        let store = ConfigStore::new(&config_path, overrides).await?;
        let config = store.get().await;

        let logs_dir = canonical_logs_dir_from_root(&state_dir);
        let (log_guard, log_info) =
            init_process_logging(process, &logs_dir, config.logging.retention_days)?;
        emit_event(
            tracing::Level::INFO,
            process,
            ObservabilityEvent {
                event: "logging.initialized",
                component: "engine.main",
                status: Some("ok"),
                detail: Some("jsonl logging initialized"),
                ..Default::default()
            },
        );
        info!("logging initialized: {:?}", log_info);
        info!(
            "startup paths: state_dir={} config_path={} workspace={}",
            state_dir.display(),
            config_path.display(),
            common.workspace.display()
        );

        let jobs_base = config
            .jobs
            .root
            .clone()
            .unwrap_or_else(|| state_dir.join("jobs"));
        let workspaces =
            WorkspaceRegistry::new(jobs_base, config.jobs.bin_dir.clone(), config.shell_limits());
        info!(
            "engine.startup runtime_build_complete elapsed_ms={}",
            startup.elapsed().as_millis()
        );
        Ok(Self {
            state_dir,
            config,
            workspaces,
            _log_guard: log_guard,
        })
    }

    async fn workspace(&self, root: &Path) -> anyhow::Result<Arc<Workspace>> {
        self.workspaces.get_or_create(root).await
    }
}

async fn run_turn(
    runtime: &Runtime,
    root: &Path,
    session_id: &str,
    prompt: &str,
) -> anyhow::Result<()> {
    let workspace = runtime.workspace(root).await?;
    let providers = ProviderRegistry::new(runtime.config.providers_config());
    let provider = providers.select(None).await?;
    let store = Arc::new(JsonFileStore::new(runtime.state_dir.join("sessions")).await?);

    let mut history = store.load(session_id).await?;
    if history.is_empty() {
        if let Some(prompt) = runtime.config.system_prompt.as_deref() {
            history.push(Message::system(prompt));
        }
    }
    info!(
        "session {} resumed with {} messages via provider {}",
        session_id,
        history.len(),
        provider.info().id
    );

    let sink = Arc::new(SseSink::new(std::io::stdout()));
    let engine = EngineLoop::new(
        session_id,
        provider,
        workspace.tools.clone(),
        workspace.plans.clone(),
        store,
        Emitter::new(sink),
    )
    .with_profile(Arc::new(WindowProfile::default()))
    .with_settings(runtime.config.turn_settings())
    .with_history(history);

    let interrupt = engine.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && interrupt.cancel() {
            info!("interrupt received; cancelling turn");
        }
    });
    let outcome = engine.run_turn(prompt).await;
    watcher.abort();

    match outcome? {
        TurnOutcome::Completed(_) => {}
        TurnOutcome::Cancelled => eprintln!("turn cancelled"),
    }
    eprintln!("session: {session_id}");
    Ok(())
}

async fn invoke_tool(
    workspace: &Workspace,
    payload: &serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let tool = payload
        .get("tool")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    if tool.is_empty() {
        anyhow::bail!("tool is required in input json");
    }
    let args = payload
        .get("args")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    let ctx = ToolContext::new(CancellationToken::new());
    let outcome = workspace
        .tools
        .dispatch(&tool, &args.to_string(), &ctx)
        .await;
    Ok(serde_json::json!({
        "output": outcome.output,
        "metadata": outcome.metadata,
        "is_error": outcome.is_error,
        "truncated": outcome.truncated,
    }))
}

/// Writes every engine event as one SSE frame.
struct SseSink<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> SseSink<W> {
    fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> EventSink for SseSink<W> {
    fn emit(&self, event: EngineEvent) -> anyhow::Result<()> {
        let frame = sse_frame(&event)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow::anyhow!("event output lock poisoned"))?;
        out.write_all(frame.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

fn build_cli_overrides(run: &RunOverrides) -> anyhow::Result<Option<serde_json::Value>> {
    let provider = normalize_and_validate_provider(run.provider.clone(), run.base_url.is_some())?;

    let mut root = serde_json::Map::new();
    let mut provider_config = serde_json::Map::new();
    if let Some(p) = provider {
        provider_config.insert("id".to_string(), serde_json::Value::String(p));
    }
    for (key, value) in [
        ("model", &run.model),
        ("url", &run.base_url),
        ("api_key", &run.api_key),
    ] {
        if let Some(value) = value {
            provider_config.insert(key.to_string(), serde_json::Value::String(value.clone()));
        }
    }
    if !provider_config.is_empty() {
        root.insert(
            "provider".to_string(),
            serde_json::Value::Object(provider_config),
        );
    }
    // Flags only switch features on; config files switch them off.
    for (key, enabled) in [
        ("plan_only", run.plan_only),
        ("thinking", run.thinking),
        ("force_deep_reasoning", run.deep_reasoning),
    ] {
        if enabled {
            root.insert(key.to_string(), serde_json::Value::Bool(true));
        }
    }

    if root.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::Value::Object(root)))
}

fn normalize_and_validate_provider(
    provider: Option<String>,
    has_url: bool,
) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let known = known_provider_ids();
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. known providers: {}",
            known.join(", ")
        );
    }
    if has_url || known.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unknown provider `{}` needs --base-url. known providers: {}",
        provider,
        known.join(", ")
    );
}

fn read_input(input: &str) -> anyhow::Result<String> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    if let Some(path) = input.strip_prefix('@') {
        return std::fs::read_to_string(path).with_context(|| format!("reading {path}"));
    }
    Ok(input.to_string())
}
