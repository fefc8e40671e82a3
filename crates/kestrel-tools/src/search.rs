use std::path::{Component, Path};

use async_trait::async_trait;
use ignore::WalkBuilder;
use kestrel_runtime::PathGuard;
use kestrel_types::{ToolResult, ToolSchema};
use regex::RegexBuilder;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{optional_str, optional_usize, required_str, Tool, ToolContext, SEARCH_OUTPUT_LIMIT};

const MAX_GLOB_RESULTS: usize = 500;
const MAX_GREP_MATCHES: usize = 200;
const MAX_GREP_LINE_CHARS: usize = 300;

pub struct GlobTool {
    guard: PathGuard,
}

impl GlobTool {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for GlobTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "glob".to_string(),
            description: "Find files by glob pattern (e.g. `src/**/*.rs`), relative to `path`."
                .to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"pattern":{"type":"string"},"path":{"type":"string"}},
                "required":["pattern"]
            }),
        }
    }

    fn output_limit(&self) -> usize {
        SEARCH_OUTPUT_LIMIT
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let pattern = required_str(&args, "pattern")?;
        let pattern_path = Path::new(pattern);
        if pattern_path.is_absolute()
            || pattern_path
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            anyhow::bail!("glob pattern must be relative and must not contain `..`");
        }
        let base = self.guard.resolve(optional_str(&args, "path").unwrap_or(""))?;
        // The base is a literal path; only `pattern` carries glob syntax.
        let literal_base = glob::Pattern::escape(&base.to_string_lossy());
        let full = Path::new(&literal_base)
            .join(pattern)
            .to_string_lossy()
            .to_string();

        let guard = self.guard.clone();
        let cancel = ctx.cancel.clone();
        let (files, total) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let mut files = Vec::new();
            let mut total = 0usize;
            for path in glob::glob(&full)?.flatten() {
                if cancel.is_cancelled() {
                    anyhow::bail!("glob cancelled");
                }
                if !guard.contains(&path) {
                    continue;
                }
                total += 1;
                if files.len() < MAX_GLOB_RESULTS {
                    files.push(guard.rel(&path));
                }
            }
            Ok((files, total))
        })
        .await??;

        let mut output = files.join("\n");
        if total > files.len() {
            output.push_str(&format!(
                "\n[{} more matches not shown; narrow the pattern]",
                total - files.len()
            ));
        }
        Ok(ToolResult::new(output, json!({"count": total})))
    }
}

pub struct GrepTool {
    guard: PathGuard,
}

impl GrepTool {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "grep".to_string(),
            description: "Regex search across files under `path`, honouring .gitignore. \
                          `include` filters file names by glob."
                .to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{
                    "pattern":{"type":"string"},
                    "path":{"type":"string"},
                    "include":{"type":"string"},
                    "case_insensitive":{"type":"boolean"},
                    "max_matches":{"type":"integer","minimum":1}
                },
                "required":["pattern"]
            }),
        }
    }

    fn output_limit(&self) -> usize {
        SEARCH_OUTPUT_LIMIT
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let pattern = required_str(&args, "pattern")?;
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(
                args.get("case_insensitive")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            )
            .build()?;
        let include = optional_str(&args, "include")
            .map(glob::Pattern::new)
            .transpose()?;
        let max_matches = optional_usize(&args, "max_matches")
            .unwrap_or(MAX_GREP_MATCHES)
            .clamp(1, MAX_GREP_MATCHES);
        let root = self.guard.resolve(optional_str(&args, "path").unwrap_or(""))?;

        let guard = self.guard.clone();
        let cancel = ctx.cancel.clone();
        let matches = tokio::task::spawn_blocking(move || {
            grep_tree(&guard, &root, &regex, include.as_ref(), max_matches, &cancel)
        })
        .await??;

        let count = matches.len();
        let mut output = matches.join("\n");
        if count >= max_matches {
            output.push_str(&format!(
                "\n[stopped after {max_matches} matches; narrow the pattern or path]"
            ));
        }
        Ok(ToolResult::new(output, json!({"count": count})))
    }
}

fn grep_tree(
    guard: &PathGuard,
    root: &Path,
    regex: &regex::Regex,
    include: Option<&glob::Pattern>,
    max_matches: usize,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in WalkBuilder::new(root).build().flatten() {
        if cancel.is_cancelled() {
            anyhow::bail!("grep cancelled");
        }
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if !guard.contains(path) {
            continue;
        }
        if let Some(include) = include {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !include.matches(name) {
                continue;
            }
        }
        // Binary and non-UTF-8 files are skipped.
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            let shown = line.chars().take(MAX_GREP_LINE_CHARS).collect::<String>();
            out.push(format!("{}:{}:{}", guard.rel(path), idx + 1, shown));
            if out.len() >= max_matches {
                return Ok(out);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (tempfile::TempDir, PathGuard) {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("src/nested")).expect("mkdir");
        std::fs::write(dir.path().join("src/lib.rs"), "fn alpha() {}\nfn beta() {}\n")
            .expect("seed");
        std::fs::write(dir.path().join("src/nested/mod.rs"), "// Alpha here\n").expect("seed");
        std::fs::write(dir.path().join("notes.md"), "alpha notes\n").expect("seed");
        let guard = PathGuard::new(dir.path()).expect("guard");
        (dir, guard)
    }

    #[tokio::test]
    async fn glob_lists_relative_paths() {
        let (_dir, guard) = seeded();
        let result = GlobTool::new(guard)
            .execute(&ToolContext::default(), json!({"pattern":"src/**/*.rs"}))
            .await
            .expect("glob");
        let mut lines = result.output.lines().collect::<Vec<_>>();
        lines.sort();
        assert_eq!(lines, vec!["src/lib.rs", "src/nested/mod.rs"]);
    }

    #[tokio::test]
    async fn glob_rejects_escaping_patterns() {
        let (_dir, guard) = seeded();
        let tool = GlobTool::new(guard);
        let ctx = ToolContext::default();
        assert!(tool.execute(&ctx, json!({"pattern":"../*"})).await.is_err());
        assert!(tool.execute(&ctx, json!({"pattern":"/etc/*"})).await.is_err());
        assert!(tool
            .execute(&ctx, json!({"pattern":"*","path":"../"}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn glob_matches_inside_a_workspace_with_bracketed_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("app[1]");
        std::fs::create_dir_all(root.join("src")).expect("mkdir");
        std::fs::write(root.join("src/main.rs"), "fn main() {}\n").expect("seed");
        std::fs::create_dir_all(dir.path().join("app1/src")).expect("mkdir");
        std::fs::write(dir.path().join("app1/src/decoy.rs"), "\n").expect("seed");

        let result = GlobTool::new(PathGuard::new(root.clone()).expect("guard"))
            .execute(&ToolContext::default(), json!({"pattern":"src/*.rs"}))
            .await
            .expect("glob");
        assert_eq!(result.output.lines().collect::<Vec<_>>(), vec!["src/main.rs"]);
    }

    #[tokio::test]
    async fn grep_reports_file_line_and_text() {
        let (_dir, guard) = seeded();
        let tool = GrepTool::new(guard);
        let result = tool
            .execute(
                &ToolContext::default(),
                json!({"pattern":"alpha","include":"*.rs","case_insensitive":true}),
            )
            .await
            .expect("grep");
        let mut lines = result.output.lines().collect::<Vec<_>>();
        lines.sort();
        assert_eq!(
            lines,
            vec!["src/lib.rs:1:fn alpha() {}", "src/nested/mod.rs:1:// Alpha here"]
        );
    }

    #[tokio::test]
    async fn grep_refuses_paths_outside_workspace() {
        let (_dir, guard) = seeded();
        let outside = tempfile::tempdir().expect("outside");
        let err = GrepTool::new(guard)
            .execute(
                &ToolContext::default(),
                json!({"pattern":"x","path": outside.path().display().to_string()}),
            )
            .await
            .expect_err("outside");
        assert!(err.to_string().contains("escapes workspace"));
    }

    #[test]
    fn search_tools_use_the_smaller_output_limit() {
        let guard = PathGuard::new("/tmp").expect("guard");
        assert_eq!(GlobTool::new(guard.clone()).output_limit(), SEARCH_OUTPUT_LIMIT);
        assert_eq!(GrepTool::new(guard).output_limit(), SEARCH_OUTPUT_LIMIT);
    }
}
