use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kestrel_types::{PlanSnapshot, PlanStatus, PlanStep, ToolResult, ToolSchema};
use serde_json::{json, Value};
use tokio::fs;
use tokio::sync::RwLock;

use crate::{optional_str, Tool, ToolContext};

pub const PLAN_FILE: &str = "plan.json";

/// Last plan recorded by `update_plan`, per session.
#[derive(Clone, Default)]
pub struct PlanCache {
    inner: Arc<RwLock<HashMap<String, PlanSnapshot>>>,
}

impl PlanCache {
    pub async fn get(&self, session_id: &str) -> Option<PlanSnapshot> {
        self.inner.read().await.get(session_id).cloned()
    }

    pub async fn set(&self, session_id: &str, snapshot: PlanSnapshot) {
        self.inner
            .write()
            .await
            .insert(session_id.to_string(), snapshot);
    }
}

pub struct UpdatePlanTool {
    cache: PlanCache,
}

impl UpdatePlanTool {
    pub fn new(cache: PlanCache) -> Self {
        Self { cache }
    }
}

fn parse_steps(args: &Value) -> anyhow::Result<Vec<PlanStep>> {
    let items = args
        .get("plan")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing required array argument `plan`"))?;
    let mut steps = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let step = item
            .get("step")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("plan[{idx}] needs a non-empty `step`"))?;
        let raw_status = item
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("pending");
        let status = PlanStatus::parse(raw_status)
            .ok_or_else(|| anyhow::anyhow!("plan[{idx}] has unknown status `{raw_status}`"))?;
        steps.push(PlanStep {
            step: step.to_string(),
            status,
        });
    }
    Ok(steps)
}

#[async_trait]
impl Tool for UpdatePlanTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "update_plan".to_string(),
            description: "Record the current task plan. At most one step may be in_progress."
                .to_string(),
            input_schema: json!({
                "type":"object",
                "properties":{
                    "explanation":{"type":"string"},
                    "plan":{
                        "type":"array",
                        "items":{
                            "type":"object",
                            "properties":{
                                "step":{"type":"string"},
                                "status":{"type":"string","enum":["pending","in_progress","completed"]}
                            },
                            "required":["step","status"]
                        }
                    }
                },
                "required":["plan"]
            }),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<ToolResult> {
        let steps = parse_steps(&args)?;
        let snapshot = PlanSnapshot::new(
            steps,
            optional_str(&args, "explanation").map(ToString::to_string),
        );
        if snapshot.in_progress_count() > 1 {
            anyhow::bail!("at most one plan step may be in_progress");
        }

        if let Some(dir) = &ctx.session_dir {
            fs::create_dir_all(dir).await?;
            let raw = serde_json::to_string_pretty(&snapshot)?;
            fs::write(dir.join(PLAN_FILE), raw).await?;
        }
        // Only session-bound calls are cached.
        if let Some(session_id) = &ctx.session_id {
            self.cache.set(session_id, snapshot.clone()).await;
        }

        let completed = snapshot
            .steps
            .iter()
            .filter(|s| s.status == PlanStatus::Completed)
            .count();
        Ok(ToolResult::new(
            format!(
                "plan updated: {} steps, {completed} completed, {} in progress",
                snapshot.steps.len(),
                snapshot.in_progress_count()
            ),
            serde_json::to_value(&snapshot)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plan_is_cached_and_persisted_to_session_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = PlanCache::default();
        let tool = UpdatePlanTool::new(cache.clone());
        let ctx = ToolContext::default().with_session("s1", Some(dir.path().join("s1")));
        tool.execute(
            &ctx,
            json!({"plan":[
                {"step":"read code","status":"completed"},
                {"step":"write patch","status":"in_progress"},
                {"step":"run tests","status":"pending"}
            ]}),
        )
        .await
        .expect("update");

        let cached = cache.get("s1").await.expect("cached plan");
        assert_eq!(cached.steps.len(), 3);
        assert_eq!(cached.steps[1].status, PlanStatus::InProgress);

        let raw = std::fs::read_to_string(dir.path().join("s1").join(PLAN_FILE)).expect("plan file");
        let persisted: PlanSnapshot = serde_json::from_str(&raw).expect("decode");
        assert_eq!(persisted, cached);
        assert!(cache.get("s2").await.is_none());
    }

    #[tokio::test]
    async fn sessions_sharing_a_cache_keep_their_own_plans() {
        let cache = PlanCache::default();
        let tool = UpdatePlanTool::new(cache.clone());
        for (session, step) in [("a", "migrate schema"), ("b", "fix typo")] {
            let ctx = ToolContext::default().with_session(session, None);
            tool.execute(&ctx, json!({"plan":[{"step": step, "status":"pending"}]}))
                .await
                .expect("update");
        }
        assert_eq!(cache.get("a").await.expect("a").steps[0].step, "migrate schema");
        assert_eq!(cache.get("b").await.expect("b").steps[0].step, "fix typo");

        tool.execute(
            &ToolContext::default(),
            json!({"plan":[{"step":"detached","status":"pending"}]}),
        )
        .await
        .expect("update without session");
        assert_eq!(cache.get("a").await.expect("a").steps[0].step, "migrate schema");
    }

    #[tokio::test]
    async fn two_active_steps_are_rejected_and_cache_is_untouched() {
        let cache = PlanCache::default();
        let err = UpdatePlanTool::new(cache.clone())
            .execute(
                &ToolContext::default(),
                json!({"plan":[
                    {"step":"a","status":"in_progress"},
                    {"step":"b","status":"in_progress"}
                ]}),
            )
            .await
            .expect_err("two in progress");
        assert!(err.to_string().contains("at most one"));
        assert!(cache.get("").await.is_none());
    }
}
