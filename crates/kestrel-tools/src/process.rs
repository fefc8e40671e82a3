use async_trait::async_trait;
use kestrel_runtime::{LogStream, ProcessJob, ProcessSupervisor};
use kestrel_types::{HostRuntimeContext, ToolResult, ToolSchema};
use serde_json::{json, Value};

use crate::{optional_str, optional_usize, required_str, Tool, ToolContext};

const DEFAULT_LOG_TAIL: usize = 100;

fn job_line(job: &ProcessJob) -> String {
    let mut line = format!(
        "{}  {}  {}",
        job.id,
        job.status.as_str(),
        job.command.join(" ")
    );
    if let Some(code) = job.exit_code {
        line.push_str(&format!("  (exit {code})"));
    }
    if let Some(err) = &job.error {
        line.push_str(&format!("  ({err})"));
    }
    line
}

fn job_json(job: &ProcessJob) -> Value {
    serde_json::to_value(job).unwrap_or_else(|_| json!({"id": job.id}))
}

pub struct ProcessStartTool {
    supervisor: ProcessSupervisor,
    host: HostRuntimeContext,
}

impl ProcessStartTool {
    pub fn new(supervisor: ProcessSupervisor, host: HostRuntimeContext) -> Self {
        Self { supervisor, host }
    }

    fn command_from(&self, value: &Value) -> anyhow::Result<Vec<String>> {
        match value {
            Value::String(line) => {
                let (program, leading) = self.host.shell_invocation();
                let mut argv = vec![program.to_string()];
                argv.extend(leading.iter().map(|s| s.to_string()));
                argv.push(line.clone());
                Ok(argv)
            }
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(ToString::to_string)
                        .ok_or_else(|| anyhow::anyhow!("command array must contain only strings"))
                })
                .collect(),
            _ => anyhow::bail!("`command` must be a string or an array of strings"),
        }
    }
}

#[async_trait]
impl Tool for ProcessStartTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "process_start".to_string(),
            description: "Start a long-running background job (dev servers, watchers, long \
                          builds). Returns a job id for process_logs / process_kill. A string \
                          command runs through the shell; an array runs directly."
                .to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{
                    "command":{
                        "oneOf":[
                            {"type":"string"},
                            {"type":"array","items":{"type":"string"}}
                        ]
                    },
                    "cwd":{"type":"string"}
                },
                "required":["command"]
            }),
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let command = args
            .get("command")
            .ok_or_else(|| anyhow::anyhow!("missing required argument `command`"))?;
        let argv = self.command_from(command)?;
        // Jobs outlive the turn, so the call's cancel token is not forwarded.
        let job = self
            .supervisor
            .start(argv, optional_str(&args, "cwd"))
            .await?;
        Ok(ToolResult::new(
            format!("started job {}\n{}", job.id, job_line(&job)),
            job_json(&job),
        ))
    }
}

pub struct ProcessListTool {
    supervisor: ProcessSupervisor,
}

impl ProcessListTool {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for ProcessListTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "process_list".to_string(),
            description: "List background jobs, newest first.".to_string(),
            input_schema: json!({"type":"object","properties":{}}),
        }
    }

    async fn execute(&self, _ctx: &ToolContext, _args: Value) -> anyhow::Result<ToolResult> {
        let jobs = self.supervisor.list().await?;
        if jobs.is_empty() {
            return Ok(ToolResult::new("no background jobs", json!({"count": 0})));
        }
        let output = jobs.iter().map(job_line).collect::<Vec<_>>().join("\n");
        Ok(ToolResult::new(output, json!({"count": jobs.len()})))
    }
}

pub struct ProcessLogsTool {
    supervisor: ProcessSupervisor,
}

impl ProcessLogsTool {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for ProcessLogsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "process_logs".to_string(),
            description: "Tail a background job's stdout or stderr, optionally keeping only \
                          lines that contain `filter`."
                .to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{
                    "id":{"type":"string"},
                    "stream":{"type":"string","enum":["stdout","stderr"]},
                    "tail":{"type":"integer","minimum":1},
                    "filter":{"type":"string"}
                },
                "required":["id"]
            }),
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let id = required_str(&args, "id")?;
        let raw_stream = args.get("stream").and_then(|v| v.as_str()).unwrap_or("");
        let stream = LogStream::parse(raw_stream)
            .ok_or_else(|| anyhow::anyhow!("unknown stream `{raw_stream}`"))?;
        let tail = optional_usize(&args, "tail").unwrap_or(DEFAULT_LOG_TAIL);
        let logs = self
            .supervisor
            .logs(id, stream, tail, optional_str(&args, "filter"))
            .await?;
        let job = self.supervisor.get(id).await?;
        Ok(ToolResult::new(
            logs,
            json!({"id": id, "status": job.status.as_str(), "exit_code": job.exit_code}),
        ))
    }
}

pub struct ProcessKillTool {
    supervisor: ProcessSupervisor,
}

impl ProcessKillTool {
    pub fn new(supervisor: ProcessSupervisor) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for ProcessKillTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "process_kill".to_string(),
            description: "Stop a running background job.".to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"id":{"type":"string"}},
                "required":["id"]
            }),
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let id = required_str(&args, "id")?;
        self.supervisor.kill(id).await?;
        let job = self.supervisor.wait(id).await?;
        Ok(ToolResult::new(job_line(&job), job_json(&job)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use kestrel_runtime::PathGuard;
    use tokio_util::sync::CancellationToken;

    fn supervisor(dir: &tempfile::TempDir) -> ProcessSupervisor {
        let guard = PathGuard::new(dir.path().join("ws")).expect("guard");
        std::fs::create_dir_all(guard.root()).expect("mkdir");
        ProcessSupervisor::new(guard, dir.path().join("jobs"), None)
    }

    #[tokio::test]
    async fn start_logs_and_list_round_through_the_supervisor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sup = supervisor(&dir);
        let ctx = ToolContext::default();
        let started = ProcessStartTool::new(sup.clone(), HostRuntimeContext::detect())
            .execute(&ctx, json!({"command":"echo ready"}))
            .await
            .expect("start");
        let id = started.metadata["id"].as_str().expect("id").to_string();
        sup.wait(&id).await.expect("wait");

        let logs = ProcessLogsTool::new(sup.clone())
            .execute(&ctx, json!({"id": id}))
            .await
            .expect("logs");
        assert_eq!(logs.output, "ready");
        assert_eq!(logs.metadata["status"], "exited");

        let listed = ProcessListTool::new(sup)
            .execute(&ctx, json!({}))
            .await
            .expect("list");
        assert!(listed.output.contains(&id));
    }

    #[tokio::test]
    async fn turn_cancellation_does_not_stop_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sup = supervisor(&dir);
        let cancel = CancellationToken::new();
        let ctx = ToolContext::new(cancel.clone());
        let started = ProcessStartTool::new(sup.clone(), HostRuntimeContext::detect())
            .execute(&ctx, json!({"command":["sleep","30"]}))
            .await
            .expect("start");
        let id = started.metadata["id"].as_str().expect("id").to_string();
        cancel.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(sup.get(&id).await.expect("get").status.as_str(), "running");

        let killed = ProcessKillTool::new(sup)
            .execute(&ctx, json!({"id": id}))
            .await
            .expect("kill");
        assert_eq!(killed.metadata["status"], "killed");
    }

    #[tokio::test]
    async fn denied_commands_surface_as_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ProcessStartTool::new(supervisor(&dir), HostRuntimeContext::detect())
            .execute(&ToolContext::default(), json!({"command":"sudo ls"}))
            .await
            .expect_err("denied");
        assert!(err.to_string().contains("sudo"));
    }

    #[tokio::test]
    async fn start_refuses_a_working_directory_outside_the_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sup = supervisor(&dir);
        let tool = ProcessStartTool::new(sup.clone(), HostRuntimeContext::detect());
        let outside = dir.path().display().to_string();
        for (cwd, expected) in [("../", "`..` segment"), (outside.as_str(), "escapes workspace")] {
            let err = tool
                .execute(
                    &ToolContext::default(),
                    json!({"command": ["true"], "cwd": cwd}),
                )
                .await
                .expect_err("outside cwd");
            assert!(err.to_string().contains(expected), "{cwd}: {err}");
        }
        assert!(sup.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn logs_and_kill_reject_ids_that_are_not_plain_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sup = supervisor(&dir);
        let ctx = ToolContext::default();
        let err = ProcessLogsTool::new(sup.clone())
            .execute(&ctx, json!({"id": "../x"}))
            .await
            .expect_err("logs");
        assert!(err.to_string().contains("invalid job id"), "{err}");
        let err = ProcessKillTool::new(sup)
            .execute(&ctx, json!({"id": "../x"}))
            .await
            .expect_err("kill");
        assert!(err.to_string().contains("invalid job id"), "{err}");
    }
}
