use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use kestrel_runtime::PathGuard;
use kestrel_types::{HostRuntimeContext, ToolResult, ToolSchema};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::{optional_str, required_str, Tool, ToolContext};

/// Synchronous shell timeouts. Anything longer belongs in a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellLimits {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for ShellLimits {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(120),
            max_timeout: Duration::from_secs(600),
        }
    }
}

impl ShellLimits {
    pub fn effective(&self, requested_secs: Option<u64>) -> Duration {
        requested_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout)
    }
}

pub struct ShellTool {
    guard: PathGuard,
    limits: ShellLimits,
    host: HostRuntimeContext,
}

impl ShellTool {
    pub fn new(guard: PathGuard, limits: ShellLimits, host: HostRuntimeContext) -> Self {
        Self {
            guard,
            limits,
            host,
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "shell".to_string(),
            description: format!(
                "Run a shell command and wait for it. Default timeout {}s, maximum {}s; use \
                 process_start for servers and other long-running commands. stdin is closed.",
                self.limits.default_timeout.as_secs(),
                self.limits.max_timeout.as_secs()
            ),
            input_schema: json!({
                "type":"object",
                "properties":{
                    "command":{"type":"string"},
                    "cwd":{"type":"string"},
                    "timeout_secs":{"type":"integer","minimum":1}
                },
                "required":["command"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let cmd = required_str(&args, "command")?;
        if cmd.trim().is_empty() {
            anyhow::bail!("command must not be empty");
        }
        let cwd = self.guard.resolve(optional_str(&args, "cwd").unwrap_or(""))?;
        let timeout = self
            .limits
            .effective(args.get("timeout_secs").and_then(|v| v.as_u64()));

        let (program, leading) = self.host.shell_invocation();
        let mut command = Command::new(program);
        command
            .args(leading)
            .arg(cmd)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn()?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => anyhow::bail!("command cancelled"),
            _ = tokio::time::sleep(timeout) => {
                return Ok(ToolResult::new(
                    format!(
                        "command timed out after {}s and was killed; use process_start for long-running commands",
                        timeout.as_secs()
                    ),
                    json!({"timed_out": true, "timeout_secs": timeout.as_secs()}),
                ));
            }
            result = child.wait_with_output() => result?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();
        let mut text = match code {
            Some(code) => format!("exit code: {code}\n"),
            None => "exit code: none (terminated by signal)\n".to_string(),
        };
        if !stdout.is_empty() {
            text.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("[stderr]\n");
            text.push_str(&stderr);
        }
        Ok(ToolResult::new(
            text,
            json!({"exit_code": code, "cwd": self.guard.rel(&cwd)}),
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn tool(dir: &tempfile::TempDir, limits: ShellLimits) -> ShellTool {
        let guard = PathGuard::new(dir.path()).expect("guard");
        ShellTool::new(guard, limits, HostRuntimeContext::detect())
    }

    #[test]
    fn timeout_is_capped() {
        let limits = ShellLimits::default();
        assert_eq!(limits.effective(None), Duration::from_secs(120));
        assert_eq!(limits.effective(Some(5)), Duration::from_secs(5));
        assert_eq!(limits.effective(Some(10_000)), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn runs_in_workspace_with_closed_stdin() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("sub")).expect("mkdir");
        let result = tool(&dir, ShellLimits::default())
            .execute(
                &ToolContext::default(),
                json!({"command":"cat; pwd; echo oops >&2; exit 3","cwd":"sub"}),
            )
            .await
            .expect("shell");
        assert!(result.output.starts_with("exit code: 3\n"));
        assert!(result.output.contains("/sub\n"));
        assert!(result.output.contains("[stderr]\noops"));
        assert_eq!(result.metadata["exit_code"], 3);
    }

    #[tokio::test]
    async fn cwd_must_stay_inside_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = tool(&dir, ShellLimits::default())
            .execute(&ToolContext::default(), json!({"command":"ls","cwd":"/"}))
            .await
            .expect_err("outside");
        assert!(err.to_string().contains("escapes workspace"));
    }

    #[tokio::test]
    async fn slow_commands_time_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let limits = ShellLimits {
            default_timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(1),
        };
        let result = tool(&dir, limits)
            .execute(&ToolContext::default(), json!({"command":"sleep 30"}))
            .await
            .expect("shell");
        assert_eq!(result.metadata["timed_out"], true);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_wait() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cancel = CancellationToken::new();
        let ctx = ToolContext::new(cancel.clone());
        let handle = tokio::spawn({
            let tool = tool(&dir, ShellLimits::default());
            async move { tool.execute(&ctx, json!({"command":"sleep 30"})).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let err = handle.await.expect("join").expect_err("cancelled");
        assert!(err.to_string().contains("cancelled"));
    }
}
