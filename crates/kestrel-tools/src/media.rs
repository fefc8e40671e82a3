use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use kestrel_runtime::PathGuard;
use kestrel_types::{ToolResult, ToolSchema};
use serde_json::{json, Value};
use tokio::fs;

use crate::{required_str, Tool, ToolContext};

const MAX_IMAGE_BYTES: u64 = 4 * 1024 * 1024;
const MAX_FETCH_BYTES: usize = 2 * 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

fn image_mime(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

pub struct ViewImageTool {
    guard: PathGuard,
}

impl ViewImageTool {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for ViewImageTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "view_image".to_string(),
            description: "Load a PNG, JPEG, GIF or WebP image from the workspace as a data URL."
                .to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"path":{"type":"string"}},
                "required":["path"]
            }),
        }
    }

    // A cut data URL is unusable, so the size cap is enforced on the file instead.
    fn output_limit(&self) -> usize {
        usize::MAX
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let abs = self.guard.resolve(required_str(&args, "path")?)?;
        let rel = self.guard.rel(&abs);
        let mime = abs
            .extension()
            .and_then(|e| e.to_str())
            .and_then(image_mime)
            .ok_or_else(|| anyhow::anyhow!("{rel} is not a supported image type"))?;
        let size = fs::metadata(&abs).await?.len();
        if size > MAX_IMAGE_BYTES {
            anyhow::bail!(
                "{rel} is {size} bytes; images larger than {MAX_IMAGE_BYTES} bytes are not loaded"
            );
        }
        let bytes = fs::read(&abs).await?;
        let encoded = general_purpose::STANDARD.encode(&bytes);
        Ok(ToolResult::new(
            format!("data:{mime};base64,{encoded}"),
            json!({"path": rel, "mime": mime, "bytes": bytes.len()}),
        ))
    }
}

pub struct WebFetchTool {
    client: reqwest::Client,
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "web_fetch".to_string(),
            description: "Fetch an http(s) URL. HTML is converted to Markdown unless `raw` is set."
                .to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{"url":{"type":"string"},"raw":{"type":"boolean"}},
                "required":["url"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let url = reqwest::Url::parse(required_str(&args, "url")?)?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("only http and https URLs can be fetched");
        }
        let raw = args.get("raw").and_then(|v| v.as_bool()).unwrap_or(false);

        let request = self.client.get(url.clone()).timeout(FETCH_TIMEOUT).send();
        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => anyhow::bail!("fetch cancelled"),
            result = request => result?,
        };
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = tokio::select! {
            _ = ctx.cancel.cancelled() => anyhow::bail!("fetch cancelled"),
            result = response.bytes() => result?,
        };
        let clipped = body.len() > MAX_FETCH_BYTES;
        let text = String::from_utf8_lossy(&body[..body.len().min(MAX_FETCH_BYTES)]).to_string();
        let output = if !raw && content_type.contains("html") {
            html2md::parse_html(&text)
        } else {
            text
        };
        if !status.is_success() {
            let excerpt = output.chars().take(500).collect::<String>();
            anyhow::bail!("{url} returned HTTP {status}: {excerpt}");
        }
        Ok(ToolResult::new(
            output,
            json!({
                "url": url.as_str(),
                "status": status.as_u16(),
                "content_type": content_type,
                "clipped": clipped,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

    #[tokio::test]
    async fn view_image_returns_data_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("pic.png"), PNG_HEADER).expect("seed");
        let tool = ViewImageTool::new(PathGuard::new(dir.path()).expect("guard"));
        let result = tool
            .execute(&ToolContext::default(), json!({"path":"pic.png"}))
            .await
            .expect("view");
        assert!(result.output.starts_with("data:image/png;base64,"));
        assert_eq!(result.metadata["bytes"], 8);
    }

    #[tokio::test]
    async fn view_image_is_confined_and_typed() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("notes.txt"), "x").expect("seed");
        let tool = ViewImageTool::new(PathGuard::new(dir.path()).expect("guard"));
        let ctx = ToolContext::default();
        let err = tool
            .execute(&ctx, json!({"path":"notes.txt"}))
            .await
            .expect_err("not an image");
        assert!(err.to_string().contains("not a supported image type"));
        let err = tool
            .execute(&ctx, json!({"path":"../pic.png"}))
            .await
            .expect_err("outside");
        assert!(err.to_string().contains(".."));
    }

    #[tokio::test]
    async fn web_fetch_rejects_non_http_schemes() {
        let err = WebFetchTool::new()
            .execute(&ToolContext::default(), json!({"url":"file:///etc/passwd"}))
            .await
            .expect_err("file scheme");
        assert!(err.to_string().contains("http"));
    }
}
