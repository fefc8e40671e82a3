use async_trait::async_trait;
use kestrel_runtime::PathGuard;
use kestrel_types::{ToolResult, ToolSchema};
use serde_json::{json, Value};
use tokio::fs;

use crate::{optional_usize, required_str, Tool, ToolContext};

const DEFAULT_READ_LINES: usize = 2_000;
const MAX_DIR_ENTRIES: usize = 500;

pub struct ReadFileTool {
    guard: PathGuard,
}

impl ReadFileTool {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "read_file".to_string(),
            description: "Read a UTF-8 text file. `offset` is the 1-based first line, `limit` \
                          the number of lines (default 2000)."
                .to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{
                    "path":{"type":"string"},
                    "offset":{"type":"integer","minimum":1},
                    "limit":{"type":"integer","minimum":1}
                },
                "required":["path"]
            }),
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let raw = required_str(&args, "path")?;
        let abs = self.guard.resolve(raw)?;
        let bytes = fs::read(&abs).await?;
        let text = String::from_utf8(bytes).map_err(|_| {
            anyhow::anyhow!(
                "`{}` is not UTF-8 text; use view_image for images",
                self.guard.rel(&abs)
            )
        })?;

        let offset = optional_usize(&args, "offset").unwrap_or(1).max(1);
        let limit = optional_usize(&args, "limit").unwrap_or(DEFAULT_READ_LINES).max(1);
        let lines = text.lines().collect::<Vec<_>>();
        let total = lines.len();
        let start = (offset - 1).min(total);
        let end = start.saturating_add(limit).min(total);
        let mut output = lines[start..end].join("\n");
        if end < total {
            output.push_str(&format!(
                "\n[showing lines {}-{} of {total}; continue with offset={}]",
                start + 1,
                end,
                end + 1
            ));
        }
        Ok(ToolResult::new(
            output,
            json!({
                "path": self.guard.rel(&abs),
                "total_lines": total,
                "start_line": start + 1,
                "end_line": end,
            }),
        ))
    }
}

pub struct WriteFileTool {
    guard: PathGuard,
}

impl WriteFileTool {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "write_file".to_string(),
            description: "Create or overwrite a file, creating parent directories.".to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"path":{"type":"string"},"content":{"type":"string"}},
                "required":["path","content"]
            }),
        }
    }

    fn mutates_files(&self) -> bool {
        true
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let raw = required_str(&args, "path")?;
        let content = required_str(&args, "content")?;
        let abs = self.guard.resolve(raw)?;
        if abs == self.guard.root() {
            anyhow::bail!("refusing to write to the workspace root");
        }
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&abs, content).await?;
        let rel = self.guard.rel(&abs);
        Ok(ToolResult::new(
            format!("wrote {} bytes to {rel}", content.len()),
            json!({"path": rel, "bytes": content.len()}),
        ))
    }
}

pub struct EditFileTool {
    guard: PathGuard,
}

impl EditFileTool {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "edit_file".to_string(),
            description: "Replace an exact string in a file. `old_string` must match exactly \
                          once unless `replace_all` is set."
                .to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{
                    "path":{"type":"string"},
                    "old_string":{"type":"string"},
                    "new_string":{"type":"string"},
                    "replace_all":{"type":"boolean"}
                },
                "required":["path","old_string","new_string"]
            }),
        }
    }

    fn mutates_files(&self) -> bool {
        true
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let raw = required_str(&args, "path")?;
        let old = required_str(&args, "old_string")?;
        let new = required_str(&args, "new_string")?;
        let replace_all = args
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if old.is_empty() {
            anyhow::bail!("`old_string` must not be empty");
        }
        let abs = self.guard.resolve(raw)?;
        let rel = self.guard.rel(&abs);
        let content = fs::read_to_string(&abs).await?;
        let matches = content.matches(old).count();
        match matches {
            0 => anyhow::bail!("`old_string` not found in {rel}"),
            n if n > 1 && !replace_all => anyhow::bail!(
                "`old_string` matches {n} times in {rel}; add surrounding context or set replace_all"
            ),
            _ => {}
        }
        let updated = if replace_all {
            content.replace(old, new)
        } else {
            content.replacen(old, new, 1)
        };
        fs::write(&abs, updated).await?;
        Ok(ToolResult::new(
            format!("replaced {matches} occurrence(s) in {rel}"),
            json!({"path": rel, "replacements": matches}),
        ))
    }
}

pub struct ListDirTool {
    guard: PathGuard,
}

impl ListDirTool {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "list_dir".to_string(),
            description: "List one directory; subdirectories end with `/`.".to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"path":{"type":"string"}}
            }),
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let raw = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        let abs = self.guard.resolve(raw)?;
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&abs).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        let total = entries.len();
        entries.truncate(MAX_DIR_ENTRIES);
        let mut output = entries.join("\n");
        if total > MAX_DIR_ENTRIES {
            output.push_str(&format!(
                "\n[{} more entries not shown]",
                total - MAX_DIR_ENTRIES
            ));
        }
        Ok(ToolResult::new(
            output,
            json!({"path": self.guard.rel(&abs), "count": total}),
        ))
    }
}
